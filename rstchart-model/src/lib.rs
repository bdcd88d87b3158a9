//! # rstchart-model
//!
//! Document model and model builder for rstchart.
//!
//! This crate provides:
//! - The serde document tree that describes a statechart
//! - The model builder: document-order ids, default initial transitions,
//!   target resolution, structural validation, external script loading
//! - The immutable interpreter model shared by every session
//! - The expression binding seam plus the built-in `null` and `simple` bindings

pub mod builder;
pub mod document;
pub mod error;
pub mod event;
pub mod expr;
pub mod loader;
pub mod model;
pub mod simple;

pub use builder::{ModelBuilder, ROOT_NAME};
pub use document::Document;
pub use error::{BuildError, BuildFailure, EvalError, LoadError, ModelError};
pub use event::{Event, EventDescriptor, EventName, EventType};
pub use expr::{BindingRegistry, ExecutionContext, ExpressionBinding};
pub use loader::{FileResourceLoader, ResourceLoader};
pub use model::{
    Action, DataInit, DocumentId, Entity, InterpreterModel, InvokeNode, StateKind, StateNode,
    TransitionNode,
};
