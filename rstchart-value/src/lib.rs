//! # rstchart-value
//!
//! Data values for rstchart.
//!
//! This crate provides:
//! - The [`DataValue`] tagged union used for event payloads, parameters and done data
//! - Shared object/array containers with one-way freezing
//! - Deep cloning for values that cross an ownership boundary
//! - Conversions to and from `serde_json::Value` and a lossless tagged serde form

pub mod container;
pub mod error;
pub mod repr;
pub mod value;

pub use container::{DataArray, DataObject};
pub use error::ValueError;
pub use value::DataValue;
