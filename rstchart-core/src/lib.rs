//! # rstchart-core
//!
//! Session execution for rstchart.
//!
//! This crate provides:
//! - The per-session run loop (macrostep/microstep, conflict resolution,
//!   history, done events, executable content)
//! - External event queues with optional backpressure
//! - Stop, destroy and suspend signals
//! - The `SessionContext` seam through which sessions route events and
//!   start invoked services
//! - Checkpoints and the `CheckpointStore` trait

mod algorithm;
pub mod checkpoint;
mod content;
pub mod context;
pub mod error;
pub mod invoke;
pub mod queue;
mod scope;
pub mod session;
pub mod signal;

pub use checkpoint::{Checkpoint, CheckpointStore, DelayedRecord};
pub use content::{parse_delay, TARGET_INTERNAL, TARGET_PARENT, TARGET_SESSION_PREFIX};
pub use context::{DetachedContext, SessionContext};
pub use error::{RouteError, SessionError, StoreError};
pub use invoke::{InvokeConfig, InvokeFactory, InvokedService, ParentChannel};
pub use queue::{QueueError, QueueReceiver, QueueSender};
pub use session::{Session, SessionConfig, SessionHandle, SessionSignals, SessionStatus};
pub use signal::CancelSignal;

