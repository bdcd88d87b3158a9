//! Session error types.

use rstchart_model::ModelError;
use thiserror::Error;

/// Errors surfaced by sessions and session handles.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A broken model invariant. Fails the session.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("session {0} is closed")]
    Closed(String),

    #[error("event queue of session {0} is full")]
    QueueFull(String),

    #[error("session failed: {0}")]
    Failed(String),

    #[error("session was destroyed")]
    Destroyed,

    #[error("session was stopped")]
    Stopped,

    #[error("invalid checkpoint: {0}")]
    Checkpoint(String),

    #[error("checkpoint store error: {0}")]
    Store(#[from] StoreError),

    #[error("invoke error: {0}")]
    Invoke(String),
}

/// Delivery failures for events addressed to other sessions or services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("event queue of {0} is full")]
    QueueFull(String),

    #[error("{0} is no longer accepting events")]
    Closed(String),
}

/// Checkpoint store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt checkpoint '{0}'")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
