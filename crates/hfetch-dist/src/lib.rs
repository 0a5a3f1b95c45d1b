//! HFetch Dist - Shared state for a group of HFetch servers
//!
//! Servers that cooperate on one workload share a handful of structures:
//! per-file segment maps partitioned by key hash, the active-file counters,
//! one event queue per server, a global sequence for buffer names and a
//! clock used to stamp events. This crate provides in-process versions of
//! those structures; a [`LocalCluster`] hands out named instances so every
//! server that asks for the same name sees the same data.

pub mod cluster;
pub mod hashmap;
pub mod map;
pub mod queue;
pub mod rendezvous;
pub mod sequence;

pub use cluster::{LocalCluster, ServerContext};
pub use hashmap::DistributedHashMap;
pub use map::DistributedMap;
pub use queue::DistributedQueue;
pub use rendezvous::Rendezvous;
pub use sequence::{GlobalClock, GlobalSequence};

use std::hash::{Hash, Hasher};
use xxhash_rust::xxh64::Xxh64;

/// Partition of `key` among `partitions` shards
pub(crate) fn partition_of<K: Hash + ?Sized>(key: &K, partitions: usize) -> usize {
    let mut hasher = Xxh64::new(0);
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}
