//! Value error types.

use thiserror::Error;

/// Errors from data value operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("value is frozen and cannot be modified")]
    Frozen,

    #[error("index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("cyclic value cannot be serialized")]
    Cyclic,

    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
}
