//! The seam between a session and whatever hosts it.
//!
//! Methods are synchronous: a session only ever blocks while waiting for its
//! next event. Hosts that need async work (starting invoked services) spawn
//! it and report failures back as events.

use crate::error::{RouteError, SessionError};
use crate::invoke::InvokeConfig;
use rstchart_model::Event;

/// Host services available to a running session.
pub trait SessionContext: Send + Sync {
    /// Delivers an event sent to `target` by session `from`.
    ///
    /// Targets understood by every host: `#_parent`, `#_<invokeid>` and
    /// `#_scxml_<sessionid>`.
    fn route(&self, from: &str, target: &str, event: Event) -> Result<(), RouteError>;

    /// Starts an invoked service on behalf of `session_id`.
    fn start_invoke(&self, session_id: &str, config: InvokeConfig) -> Result<(), SessionError>;

    /// Cancels and deregisters an invoke. Returns false if it was not registered.
    fn cancel_invoke(&self, session_id: &str, invoke_id: &str) -> bool;

    /// Forwards an external event to an invoked service.
    fn forward(&self, session_id: &str, invoke_id: &str, event: Event) -> Result<(), RouteError>;

    /// True if the invoke is registered and has not completed.
    fn invoke_active(&self, session_id: &str, invoke_id: &str) -> bool;
}

/// A context for sessions running outside any host. Nothing is routable and
/// invokes cannot be started.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedContext;

impl SessionContext for DetachedContext {
    fn route(&self, _from: &str, target: &str, _event: Event) -> Result<(), RouteError> {
        Err(RouteError::UnknownTarget(target.to_string()))
    }

    fn start_invoke(&self, _session_id: &str, config: InvokeConfig) -> Result<(), SessionError> {
        Err(SessionError::Invoke(format!(
            "no host to start invoke '{}' of type '{}'",
            config.invoke_id, config.type_
        )))
    }

    fn cancel_invoke(&self, _session_id: &str, _invoke_id: &str) -> bool {
        false
    }

    fn forward(&self, _session_id: &str, invoke_id: &str, _event: Event) -> Result<(), RouteError> {
        Err(RouteError::UnknownTarget(format!("#_{}", invoke_id)))
    }

    fn invoke_active(&self, _session_id: &str, _invoke_id: &str) -> bool {
        false
    }
}
