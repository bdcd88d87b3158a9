//! Host error types.

use crate::config::ConfigError;
use rstchart_core::{RouteError, SessionError, StoreError};
use rstchart_model::{BuildFailure, LoadError};
use thiserror::Error;

/// Host errors.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("event queue of session {0} is full")]
    QueueFull(String),

    #[error("session {0} is no longer accepting events")]
    Closed(String),

    #[error("document error: {0}")]
    Document(String),

    #[error("load error: {0}")]
    Load(#[from] LoadError),

    #[error("{0}")]
    Build(#[from] BuildFailure),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("checkpoint store error: {0}")]
    Store(#[from] StoreError),

    #[error("storage error: {0}")]
    Storage(#[from] rstchart_storage::StorageError),

    #[error("no checkpoint for session {0}")]
    NoCheckpoint(String),

    #[error("persistence is not enabled")]
    PersistenceDisabled,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("host shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl HostError {
    /// Returns a stable error code string.
    pub fn error_code(&self) -> &'static str {
        match self {
            HostError::UnknownSession(_) => "UNKNOWN_SESSION",
            HostError::UnknownTarget(_) => "UNKNOWN_TARGET",
            HostError::QueueFull(_) => "QUEUE_FULL",
            HostError::Closed(_) => "SESSION_CLOSED",
            HostError::Document(_) | HostError::Load(_) => "DOCUMENT_ERROR",
            HostError::Build(_) => "BUILD_FAILED",
            HostError::Session(e) => match e {
                SessionError::QueueFull(_) => "QUEUE_FULL",
                SessionError::Closed(_) => "SESSION_CLOSED",
                SessionError::Checkpoint(_) => "INVALID_CHECKPOINT",
                SessionError::Store(_) => "STORE_ERROR",
                _ => "SESSION_FAILED",
            },
            HostError::Store(_) | HostError::Storage(_) => "STORE_ERROR",
            HostError::NoCheckpoint(_) => "NO_CHECKPOINT",
            HostError::PersistenceDisabled => "PERSISTENCE_DISABLED",
            HostError::Config(_) => "CONFIG_ERROR",
            HostError::ShuttingDown => "SHUTTING_DOWN",
            HostError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self.error_code(), "QUEUE_FULL" | "STORE_ERROR")
    }
}

impl From<RouteError> for HostError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::UnknownSession(id) => HostError::UnknownSession(id),
            RouteError::UnknownTarget(target) => HostError::UnknownTarget(target),
            RouteError::QueueFull(id) => HostError::QueueFull(id),
            RouteError::Closed(id) => HostError::Closed(id),
        }
    }
}
