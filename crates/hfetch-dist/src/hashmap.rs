//! Unordered shared map
//!
//! Backed by a `DashMap`, whose internal sharding plays the role of the
//! per-server partitions.

use dashmap::DashMap;
use std::hash::Hash;

/// Unordered key/value map shared by all servers
pub struct DistributedHashMap<K, V> {
    inner: DashMap<K, V>,
}

impl<K, V> DistributedHashMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Insert or replace, returning the previous value
    pub fn put(&self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|v| v.value().clone())
    }

    pub fn erase(&self, key: &K) -> Option<V> {
        self.inner.remove(key).map(|(_, v)| v)
    }

    /// Atomically modify the value under `key`, inserting `default` first
    /// if the key is absent. Returns the value after `f` ran.
    pub fn upsert<F>(&self, key: K, default: V, f: F) -> V
    where
        F: FnOnce(&mut V),
    {
        let mut entry = self.inner.entry(key).or_insert(default);
        f(entry.value_mut());
        entry.value().clone()
    }

    /// Snapshot of every entry, in no particular order
    #[must_use]
    pub fn get_all(&self) -> Vec<(K, V)> {
        self.inner
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<K, V> Default for DistributedHashMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_put_get_erase() {
        let map = DistributedHashMap::new();
        assert!(map.is_empty());
        map.put("a".to_string(), 1);
        assert_eq!(map.get(&"a".to_string()), Some(1));
        assert_eq!(map.erase(&"a".to_string()), Some(1));
        assert_eq!(map.get(&"a".to_string()), None);
    }

    #[test]
    fn test_concurrent_upsert() {
        let map = Arc::new(DistributedHashMap::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for _ in 0..100 {
                        map.upsert("file", 0u32, |v| *v += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.get(&"file"), Some(800));
    }
}
