//! Cross-server auditor calls
//!
//! A server forwards [`FileSegmentAuditor`] operations on files it does not
//! own, and fans registry creation out to every server. [`AuditorRpc`] is
//! the transport seam; [`LoopbackRpc`] delivers calls to auditors living in
//! the same process and [`RetryingRpc`] adds the retry policy.

use crate::auditor::FileSegmentAuditor;
use dashmap::DashMap;
use hfetch_common::config::RpcConfig;
use hfetch_common::{Error, Event, PosixFile, Result};
use hfetch_dist::LocalCluster;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::warn;

/// Namespace holding the auditor of every server
pub(crate) const AUDITOR_ENDPOINTS: &str = "AUDITOR_ENDPOINTS";

pub(crate) type AuditorEndpoints = DashMap<u16, Weak<FileSegmentAuditor>>;

/// Auditor operations callable on another server
pub trait AuditorRpc: Send + Sync {
    /// Physical fragments covering `file` on `server`'s shard
    fn get_data_location(&self, server: u16, file: &PosixFile) -> Result<Vec<(PosixFile, PosixFile)>>;

    /// Take part in creating the registry for `event.filename` on `server`
    fn create_offset_map(&self, server: u16, event: &Event) -> Result<()>;

    /// Succeeds if `server`'s auditor is reachable
    fn ping(&self, server: u16) -> Result<()>;
}

/// Delivers calls to auditors registered in the same [`LocalCluster`]
pub struct LoopbackRpc {
    cluster: Arc<LocalCluster>,
}

impl LoopbackRpc {
    #[must_use]
    pub const fn new(cluster: Arc<LocalCluster>) -> Self {
        Self { cluster }
    }

    fn endpoint(&self, server: u16) -> Result<Arc<FileSegmentAuditor>> {
        let endpoints = self
            .cluster
            .lookup::<AuditorEndpoints>(AUDITOR_ENDPOINTS)
            .ok_or_else(|| Error::remote(server, "no auditors registered"))?;
        endpoints
            .get(&server)
            .and_then(|weak| weak.upgrade())
            .ok_or_else(|| Error::remote(server, "auditor not running"))
    }
}

impl AuditorRpc for LoopbackRpc {
    fn get_data_location(&self, server: u16, file: &PosixFile) -> Result<Vec<(PosixFile, PosixFile)>> {
        self.endpoint(server)?.locate(file)
    }

    fn create_offset_map(&self, server: u16, event: &Event) -> Result<()> {
        self.endpoint(server)?.create_offset_map(event)
    }

    fn ping(&self, server: u16) -> Result<()> {
        self.endpoint(server).map(|_| ())
    }
}

/// Linear backoff: the n-th retry waits `n * step`
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub step: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn linear(max_retries: u32, step: Duration) -> Self {
        Self { max_retries, step }
    }

    /// Run `op`, retrying while it fails with a retryable error
    pub fn run<T, F>(&self, server: u16, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "{} on server {} failed (attempt {}/{}): {}",
                        what,
                        server,
                        attempt,
                        self.max_retries + 1,
                        e
                    );
                    std::thread::sleep(self.step * attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl From<&RpcConfig> for RetryPolicy {
    fn from(config: &RpcConfig) -> Self {
        Self::linear(config.max_retries, Duration::from_millis(config.retry_backoff_ms))
    }
}

/// Wraps a transport with a [`RetryPolicy`]
pub struct RetryingRpc<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R: AuditorRpc> RetryingRpc<R> {
    pub const fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<R: AuditorRpc> AuditorRpc for RetryingRpc<R> {
    fn get_data_location(&self, server: u16, file: &PosixFile) -> Result<Vec<(PosixFile, PosixFile)>> {
        self.policy.run(server, "GetDataLocation", || {
            self.inner.get_data_location(server, file)
        })
    }

    fn create_offset_map(&self, server: u16, event: &Event) -> Result<()> {
        // Not retried: a partial attempt has already passed the barrier.
        self.inner.create_offset_map(server, event)
    }

    fn ping(&self, server: u16) -> Result<()> {
        self.policy.run(server, "Ping", || self.inner.ping(server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::linear(3, Duration::from_millis(1));
        let value = policy
            .run(1, "test", || {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Timeout)
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::linear(2, Duration::from_millis(1));
        let result: Result<()> = policy.run(1, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::remote(1, "down"))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::linear(5, Duration::from_millis(1));
        let result: Result<()> = policy.run(0, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::internal("bad"))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_loopback_without_auditors() {
        let rpc = LoopbackRpc::new(Arc::new(LocalCluster::new(2)));
        let file = PosixFile::new(
            hfetch_common::FileName::new("f").unwrap(),
            hfetch_common::Segment::new(0, 1),
            hfetch_common::LayerId(0),
        );
        let err = rpc.get_data_location(1, &file).unwrap_err();
        assert!(err.is_retryable());

        let retrying = RetryingRpc::new(rpc, RetryPolicy::linear(2, Duration::from_millis(1)));
        assert!(matches!(
            retrying.ping(1),
            Err(Error::RemoteUnavailable { server: 1, .. })
        ));
    }
}
