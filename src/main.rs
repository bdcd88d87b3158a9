//! rstchart - statechart interpreter
//!
//! Runs a statechart document, feeds it events and prints the outcome.

use clap::{Parser, Subcommand};
use rstchart_core::SessionHandle;
use rstchart_host::{Config, DocumentProvider, DocumentSource, Host};
use rstchart_model::{Event, ModelBuilder};
use rstchart_value::{DataObject, DataValue};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rstchart")]
#[command(about = "Run statechart documents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a session and feed it events
    Run {
        /// Document path (.json, .yaml or .yml)
        document: String,

        /// Session id (random when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Initial data as a JSON object
        #[arg(short, long)]
        params: Option<String>,

        /// Event to send, as NAME or NAME=JSON (repeatable)
        #[arg(short, long = "event")]
        events: Vec<String>,

        /// How long to wait for a final state after the last event
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,

        /// Suspend the session instead of stopping it when it does not finish
        #[arg(long)]
        suspend: bool,
    },

    /// Restore a suspended session from its checkpoint and feed it events
    Resume {
        /// Session id
        id: String,

        /// Document the session was started from
        document: String,

        /// Event to send, as NAME or NAME=JSON (repeatable)
        #[arg(short, long = "event")]
        events: Vec<String>,

        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,

        #[arg(long)]
        suspend: bool,
    },

    /// Build a document and report errors without running it
    Validate {
        /// Document path (.json, .yaml or .yml)
        document: String,
    },

    /// List stored checkpoints
    Checkpoints,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // RSTCHART_CONFIG names an optional YAML file; env vars override it
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    let cli = Cli::parse();
    let host = Host::from_config(&config)?;

    match cli.command {
        Commands::Run {
            document,
            id,
            params,
            events,
            timeout_ms,
            suspend,
        } => {
            let params = parse_params(params.as_deref())?;
            let source = DocumentSource::Uri(document);
            let handle = match id {
                Some(id) => host.start_with_id(id, source, params).await?,
                None => host.start(source, params).await?,
            };
            tracing::info!("[{}] Session started", handle.id());
            drive(&host, &handle, &events, timeout_ms, suspend).await?;
        }
        Commands::Resume {
            id,
            document,
            events,
            timeout_ms,
            suspend,
        } => {
            let handle = host.restore(&id, DocumentSource::Uri(document)).await?;
            drive(&host, &handle, &events, timeout_ms, suspend).await?;
        }
        Commands::Validate { document } => {
            let host_config = host.config();
            let doc = DocumentProvider::new(host_config.loader.clone())
                .load(DocumentSource::Uri(document.clone()))
                .await?;
            let model = ModelBuilder::new(host_config.bindings.clone())
                .with_loader(host_config.loader.clone())
                .build(&doc)
                .await?;
            println!("{}: ok ({} elements)", document, model.len());
        }
        Commands::Checkpoints => {
            for id in host.checkpoints()? {
                println!("{}", id);
            }
        }
    }

    Ok(())
}

/// Sends `events` in order, then waits for the session to finish.
///
/// A session still running after `timeout_ms` is suspended (when asked to
/// and persistence is on) or stopped, and its configuration is printed.
async fn drive(
    host: &Host,
    handle: &SessionHandle,
    events: &[String],
    timeout_ms: u64,
    suspend: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    for raw in events {
        let event = parse_event(raw)?;
        tracing::debug!("[{}] Sending {}", handle.id(), raw);
        host.send(handle.id(), event).await?;
    }

    match tokio::time::timeout(Duration::from_millis(timeout_ms), handle.result()).await {
        Ok(result) => {
            let data = result?;
            println!("{}", serde_json::to_string_pretty(&data.to_json())?);
        }
        Err(_) => {
            let states = handle.configuration();
            if suspend {
                host.suspend()?;
                host.wait_all().await;
                tracing::info!("[{}] Session suspended", handle.id());
            } else {
                host.stop();
                handle.finished().await;
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "session": handle.id(),
                    "status": handle.status().to_string(),
                    "configuration": states,
                }))?
            );
        }
    }
    Ok(())
}

fn parse_params(params: Option<&str>) -> Result<DataObject, Box<dyn std::error::Error>> {
    let Some(text) = params else {
        return Ok(DataObject::new());
    };
    let json: serde_json::Value = serde_json::from_str(text)?;
    match DataValue::from_json(&json) {
        DataValue::Object(obj) => Ok(obj),
        other => Err(format!("params must be a JSON object, got {}", other.type_name()).into()),
    }
}

fn parse_event(raw: &str) -> Result<Event, Box<dyn std::error::Error>> {
    match raw.split_once('=') {
        Some((name, data)) => {
            let json: serde_json::Value = serde_json::from_str(data)?;
            Ok(Event::new(name).with_data(DataValue::from_json(&json)))
        }
        None => Ok(Event::new(raw)),
    }
}
