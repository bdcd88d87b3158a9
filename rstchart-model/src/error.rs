//! Model error types.

use crate::model::DocumentId;
use rstchart_value::ValueError;
use std::fmt;
use thiserror::Error;

/// A structural or validation problem found while building a model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error("document has no states")]
    EmptyDocument,

    #[error("duplicate state id '{id}'")]
    DuplicateId { id: String },

    #[error("transition in state '{state}' targets unknown state '{target}'")]
    UnresolvedTarget { state: String, target: String },

    #[error("invalid initial transition for state '{state}': {reason}")]
    InvalidInitial { state: String, reason: String },

    #[error("invalid history state '{state}': {reason}")]
    InvalidHistory { state: String, reason: String },

    #[error("invalid state '{state}': {reason}")]
    InvalidState { state: String, reason: String },

    #[error("unknown data model '{0}'")]
    UnknownDataModel(String),

    #[error("invalid expression '{source_text}': {reason}")]
    Expression { source_text: String, reason: String },

    #[error("failed to load '{uri}': {reason}")]
    ResourceLoad { uri: String, reason: String },

    #[error("invalid data in '{uri}': {reason}")]
    InvalidData { uri: String, reason: String },
}

impl BuildError {
    pub(crate) fn expression(source_text: &str, err: EvalError) -> Self {
        BuildError::Expression {
            source_text: source_text.to_string(),
            reason: err.to_string(),
        }
    }
}

/// The complete, non-empty list of errors from one build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildFailure {
    pub errors: Vec<BuildError>,
}

impl BuildFailure {
    pub fn errors(&self) -> &[BuildError] {
        &self.errors
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} build error(s)", self.errors.len())?;
        for err in &self.errors {
            write!(f, "; {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildFailure {}

/// Lookup failures against a built model. These indicate a broken invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("document id {0} is not in the entity table")]
    UnknownId(DocumentId),

    #[error("document id {0} is not a state")]
    NotAState(DocumentId),

    #[error("document id {0} is not a transition")]
    NotATransition(DocumentId),

    #[error("script slot {0} is not loaded")]
    UnknownScript(usize),
}

/// Errors raised by expression evaluators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("syntax error in '{source_text}': {reason}")]
    Syntax { source_text: String, reason: String },

    #[error("'{binding}' data model does not support {what}")]
    Unsupported { binding: String, what: String },

    #[error("invalid location '{0}'")]
    Location(String),

    #[error("value error: {0}")]
    Value(#[from] ValueError),

    #[error("{0}")]
    Runtime(String),
}

/// Errors from resource loading.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error reading '{uri}': {source}")]
    Io {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported URI scheme in '{0}'")]
    UnsupportedScheme(String),

    #[error("no resource loader configured for '{0}'")]
    NoLoader(String),
}
