//! HFetch Common - Shared types and utilities
//!
//! This crate provides the value types that travel between the auditor,
//! the data manager and the I/O clients (segments, scores, events, file
//! fragments), the storage layer table, the error type and configuration.

pub mod config;
pub mod error;
pub mod layer;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use layer::{IoClientKind, Layer, LayerTable, MB};
pub use types::*;
