//! HFetch core
//!
//! Segment auditing, data movement between layers, and the event-driven
//! server that ties them together.
//!
//! Each server:
//! - Tracks per-segment heat and location of every opened file
//!   ([`FileSegmentAuditor`])
//! - Moves bytes between layers and evicts colder data to make room
//!   ([`DataManager`])
//! - Prefetches hot segments to the layer the placement engine selects
//!   ([`EventManager`])
//! - Reports files that appear on the last layer ([`MountMonitor`])

pub mod auditor;
pub mod data_manager;
pub mod event_manager;
pub mod layer_index;
pub mod monitor;
pub mod rpc;
pub mod server;

pub use auditor::{FileSegmentAuditor, RegistryEntry};
pub use data_manager::{CapacityLocks, DataManager};
pub use event_manager::EventManager;
pub use layer_index::IndexedFragment;
pub use monitor::{HardwareMonitor, MountMonitor};
pub use rpc::{AuditorRpc, LoopbackRpc, RetryPolicy, RetryingRpc};
pub use server::Server;
