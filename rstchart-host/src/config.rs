//! Host configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RSTCHART_CONFIG)
//! 3. Environment variables

use crate::error::HostError;
use rstchart_core::{CheckpointStore, SessionConfig};
use rstchart_model::{BindingRegistry, FileResourceLoader, ResourceLoader};
use rstchart_storage::{FileCheckpointStore, MemoryCheckpointStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// File-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-session settings.
    pub session: SessionSection,
    /// I/O pool settings.
    pub io: IoConfig,
    /// Checkpoint persistence.
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RSTCHART_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.session.apply_env_overrides();
        self.io.apply_env_overrides();
        self.persistence.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "io.concurrency must be at least 1".to_string(),
            ));
        }
        if self.session.queue_capacity == Some(0) {
            return Err(ConfigError::ValidationError(
                "session.queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Builds the runtime configuration, opening the checkpoint store.
    pub fn host_config(&self) -> Result<HostConfig, HostError> {
        let store: Option<Arc<dyn CheckpointStore>> = match self.persistence.backend {
            PersistenceBackend::None => None,
            PersistenceBackend::Memory => Some(Arc::new(MemoryCheckpointStore::new())),
            PersistenceBackend::File => Some(Arc::new(FileCheckpointStore::open(
                self.persistence.checkpoints_dir(),
            )?)),
        };

        Ok(HostConfig {
            queue_capacity: self.session.queue_capacity,
            idle_timeout: self.session.idle_timeout(),
            io_concurrency: self.io.concurrency,
            store,
            ..HostConfig::default()
        })
    }
}

/// Session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// External queue capacity. Unbounded when unset or when persistence
    /// is enabled.
    pub queue_capacity: Option<usize>,
    /// Idle time in milliseconds before a persisted session is suspended.
    pub idle_timeout_ms: Option<u64>,
}

impl SessionSection {
    fn apply_env_overrides(&mut self) {
        if let Ok(capacity) = std::env::var("RSTCHART_QUEUE_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.queue_capacity = Some(n);
            }
        }

        if let Ok(timeout) = std::env::var("RSTCHART_IDLE_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.idle_timeout_ms = Some(ms);
            }
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

/// I/O pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Maximum concurrent resource fetches and invoke startups.
    pub concurrency: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self { concurrency: 16 }
    }
}

impl IoConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(concurrency) = std::env::var("RSTCHART_IO_CONCURRENCY") {
            if let Ok(n) = concurrency.parse() {
                self.concurrency = n;
            }
        }
    }
}

/// Where checkpoints are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    /// No checkpoints. Sessions cannot be suspended.
    #[default]
    None,
    /// Process-local checkpoints.
    Memory,
    /// One file per session under the data directory.
    File,
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    /// Data directory.
    pub data_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::None,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl PersistenceConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(backend) = std::env::var("RSTCHART_PERSISTENCE") {
            self.backend = match backend.to_lowercase().as_str() {
                "memory" => PersistenceBackend::Memory,
                "file" => PersistenceBackend::File,
                _ => PersistenceBackend::None,
            };
        }

        if let Ok(dir) = std::env::var("RSTCHART_DATA") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    /// Returns the checkpoints directory path.
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }
}

/// Runtime configuration of a [`Host`](crate::Host).
#[derive(Clone)]
pub struct HostConfig {
    pub queue_capacity: Option<usize>,
    pub idle_timeout: Option<Duration>,
    pub io_concurrency: usize,
    pub store: Option<Arc<dyn CheckpointStore>>,
    /// Fetches document sources and external scripts.
    pub loader: Arc<dyn ResourceLoader>,
    /// Expression bindings available to documents.
    pub bindings: Arc<BindingRegistry>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            queue_capacity: None,
            idle_timeout: None,
            io_concurrency: IoConfig::default().concurrency,
            store: None,
            loader: Arc::new(FileResourceLoader::default()),
            bindings: Arc::new(BindingRegistry::default()),
        }
    }
}

impl HostConfig {
    /// Sets the checkpoint store.
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the resource loader.
    pub fn with_loader(mut self, loader: Arc<dyn ResourceLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Returns whether sessions are checkpointed.
    pub fn persistence_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub(crate) fn session_config(&self) -> SessionConfig {
        SessionConfig {
            queue_capacity: self.queue_capacity,
            idle_timeout: self.idle_timeout,
            store: self.store.clone(),
        }
    }
}

impl std::fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfig")
            .field("queue_capacity", &self.queue_capacity)
            .field("idle_timeout", &self.idle_timeout)
            .field("io_concurrency", &self.io_concurrency)
            .field("persistence_enabled", &self.persistence_enabled())
            .finish()
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
