//! Storage error types.

use rstchart_core::StoreError;
use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint not found: {0}")]
    NotFound(String),

    #[error("data corruption: {0}")]
    Corruption(String),
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(e) => StoreError::Io(e),
            StorageError::Json(e) => StoreError::Serialization(e.to_string()),
            StorageError::NotFound(key) => StoreError::Corrupt(format!("missing file for {}", key)),
            StorageError::Corruption(reason) => StoreError::Corrupt(reason),
        }
    }
}
