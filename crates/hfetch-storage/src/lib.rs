//! HFetch Storage - Per-layer I/O clients
//!
//! This crate moves bytes in and out of storage layers:
//! - The [`IoClient`] capability (read, write, delete, usage probe)
//! - A file-backed client for mounted layers
//! - A memory-backed client for RAM layers
//! - [`IoClientFactory`], which picks the client for each layer by kind

pub mod io_client;
pub mod memory;
pub mod posix;

// Re-exports
pub use io_client::{IoClient, IoClientFactory, IoStats};
pub use memory::MemoryClient;
pub use posix::PosixClient;
