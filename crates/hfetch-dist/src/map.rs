//! Ordered map partitioned across servers
//!
//! Each server owns one partition; a key lives in the partition picked by
//! its hash. Reads that span the whole map merge the partitions back into
//! key order, which is what range-style lookups over segments rely on.

use crate::partition_of;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::hash::Hash;

/// Ordered key/value map split into one partition per server
pub struct DistributedMap<K, V> {
    partitions: Vec<RwLock<BTreeMap<K, V>>>,
}

impl<K, V> DistributedMap<K, V>
where
    K: Ord + Hash + Clone,
    V: Clone,
{
    /// Create a map with one partition per server
    #[must_use]
    pub fn new(num_servers: u16) -> Self {
        let partitions = (0..num_servers.max(1))
            .map(|_| RwLock::new(BTreeMap::new()))
            .collect();
        Self { partitions }
    }

    fn partition(&self, key: &K) -> &RwLock<BTreeMap<K, V>> {
        &self.partitions[partition_of(key, self.partitions.len())]
    }

    /// Insert or replace, returning the previous value
    pub fn put(&self, key: K, value: V) -> Option<V> {
        self.partition(&key).write().insert(key, value)
    }

    /// Insert only when the key is absent; returns whether it was inserted
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let mut partition = self.partition(&key).write();
        if partition.contains_key(&key) {
            return false;
        }
        partition.insert(key, value);
        true
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.partition(key).read().get(key).cloned()
    }

    /// Remove a key, returning its value
    pub fn erase(&self, key: &K) -> Option<V> {
        self.partition(key).write().remove(key)
    }

    /// Every entry, in key order
    #[must_use]
    pub fn get_all(&self) -> Vec<(K, V)> {
        self.filter(|_, _| true)
    }

    /// Entries matching `pred`, in key order
    pub fn filter<P>(&self, mut pred: P) -> Vec<(K, V)>
    where
        P: FnMut(&K, &V) -> bool,
    {
        let mut out: Vec<(K, V)> = Vec::new();
        for partition in &self.partitions {
            let partition = partition.read();
            out.extend(
                partition
                    .iter()
                    .filter(|(k, v)| pred(k, v))
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.read().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(|p| p.read().is_empty())
    }
}
