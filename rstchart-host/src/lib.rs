//! # rstchart-host
//!
//! Host context for rstchart sessions.
//!
//! This crate provides:
//! - [`Host`]: the session registry and event router shared by every session
//! - Built-in `scxml` invokes that run child documents as sessions
//! - Document loading from inline text, URIs or pre-built documents
//! - YAML + environment configuration

pub mod child;
pub mod config;
pub mod error;
pub mod host;
pub mod provider;

pub use child::ChildSessionFactory;
pub use config::{Config, ConfigError, HostConfig, PersistenceBackend};
pub use error::HostError;
pub use host::Host;
pub use provider::{DocumentProvider, DocumentSource};
