//! # rstchart-storage
//!
//! Checkpoint storage for rstchart.
//!
//! This crate provides:
//! - An in-memory checkpoint store for tests and single-process hosts
//! - A file checkpoint store with a crc32c-verified index

pub mod error;
pub mod file;
pub mod memory;

pub use error::StorageError;
pub use file::{CheckpointMeta, FileCheckpointStore};
pub use memory::MemoryCheckpointStore;
