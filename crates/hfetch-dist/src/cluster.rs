//! Named shared structures and barriers for a group of servers

use dashmap::DashMap;
use hfetch_common::{Error, Result};
use std::any::Any;
use crate::rendezvous::Rendezvous;
use std::sync::Arc;
use tracing::debug;

type SharedAny = Arc<dyn Any + Send + Sync>;

/// In-process stand-in for the cluster fabric.
///
/// Every server of the group holds a clone of the same `Arc<LocalCluster>`;
/// looking up a namespace by name returns the instance created by whichever
/// server asked first.
pub struct LocalCluster {
    num_servers: u16,
    namespaces: DashMap<String, SharedAny>,
    barriers: DashMap<String, Arc<Rendezvous>>,
}

impl LocalCluster {
    #[must_use]
    pub fn new(num_servers: u16) -> Self {
        Self {
            num_servers: num_servers.max(1),
            namespaces: DashMap::new(),
            barriers: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn num_servers(&self) -> u16 {
        self.num_servers
    }

    /// Get the structure registered under `name`, creating it with `init`
    /// if it does not exist yet.
    pub fn namespace<T, F>(&self, name: &str, init: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let shared = self
            .namespaces
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Creating namespace {}", name);
                Arc::new(init()) as SharedAny
            })
            .value()
            .clone();

        shared
            .downcast::<T>()
            .map_err(|_| Error::internal(format!("namespace {name} holds a different type")))
    }

    /// Get an existing structure without creating it
    pub fn lookup<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let shared = self.namespaces.get(name)?.value().clone();
        shared.downcast::<T>().ok()
    }

    /// Barrier shared by `parties` participants under `name`
    pub fn barrier(&self, name: &str, parties: usize) -> Arc<Rendezvous> {
        self.barriers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Rendezvous::new(parties)))
            .value()
            .clone()
    }
}

/// Identity of one server within its group
#[derive(Clone)]
pub struct ServerContext {
    pub my_server: u16,
    pub num_servers: u16,
    pub cluster: Arc<LocalCluster>,
}

impl ServerContext {
    pub fn new(my_server: u16, cluster: Arc<LocalCluster>) -> Result<Self> {
        let num_servers = cluster.num_servers();
        if my_server >= num_servers {
            return Err(Error::configuration(format!(
                "server id {my_server} out of range for {num_servers} servers"
            )));
        }
        Ok(Self {
            my_server,
            num_servers,
            cluster,
        })
    }

    /// Context for a single standalone server
    #[must_use]
    pub fn standalone() -> Self {
        Self {
            my_server: 0,
            num_servers: 1,
            cluster: Arc::new(LocalCluster::new(1)),
        }
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("my_server", &self.my_server)
            .field("num_servers", &self.num_servers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DistributedHashMap;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_namespace_shared_by_name() {
        let cluster = LocalCluster::new(2);
        let a = cluster
            .namespace("FILES", DistributedHashMap::<String, u32>::new)
            .unwrap();
        a.put("x".to_string(), 1);

        let b = cluster
            .namespace("FILES", DistributedHashMap::<String, u32>::new)
            .unwrap();
        assert_eq!(b.get(&"x".to_string()), Some(1));
        assert!(cluster.lookup::<DistributedHashMap<String, u32>>("FILES").is_some());
        assert!(cluster.lookup::<DistributedHashMap<String, u32>>("OTHER").is_none());
    }

    #[test]
    fn test_namespace_type_mismatch() {
        let cluster = LocalCluster::new(1);
        cluster.namespace("N", || 5u32).unwrap();
        assert!(cluster.namespace("N", || "s".to_string()).is_err());
        assert!(cluster.lookup::<String>("N").is_none());
        assert_eq!(*cluster.namespace("N", || 7u32).unwrap(), 5);
    }

    #[test]
    fn test_barrier_releases_all_parties() {
        let cluster = Arc::new(LocalCluster::new(3));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let cluster = Arc::clone(&cluster);
                thread::spawn(move || {
                    cluster
                        .barrier("init", 3)
                        .wait(Duration::from_secs(10))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_server_context_range() {
        let cluster = Arc::new(LocalCluster::new(2));
        assert!(ServerContext::new(1, Arc::clone(&cluster)).is_ok());
        assert!(ServerContext::new(2, cluster).is_err());
        assert_eq!(ServerContext::standalone().num_servers, 1);
    }
}
