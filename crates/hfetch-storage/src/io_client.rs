//! I/O client capability and per-layer client selection

use crate::memory::MemoryClient;
use crate::posix::PosixClient;
use hfetch_common::{IoClientKind, Layer, LayerId, LayerTable, PosixFile, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Byte movement against one kind of storage layer.
///
/// A file lives as a flat blob named after `PosixFile::filename` on the
/// layer given by `PosixFile::layer`; segments address byte offsets in it.
pub trait IoClient: Send + Sync {
    /// Fill `destination.data` with the bytes `source` describes
    fn read(&self, source: &PosixFile, destination: &mut PosixFile) -> Result<()>;

    /// Store `source.data` at the range and layer `destination` describes
    fn write(&self, source: &PosixFile, destination: &PosixFile) -> Result<()>;

    /// Release the range `file` describes
    fn delete(&self, file: &PosixFile) -> Result<()>;

    /// Bytes currently stored on `layer`
    fn current_usage(&self, layer: &Layer) -> Result<u64>;

    /// Bytes `current_usage` drops by once `file` is deleted
    fn footprint(&self, file: &PosixFile) -> Result<u64> {
        Ok(file.size())
    }

    /// Operation counters
    fn stats(&self) -> &IoStats;
}

/// I/O statistics for monitoring
#[derive(Debug, Default)]
pub struct IoStats {
    /// Bytes returned by reads
    pub bytes_read: AtomicU64,
    /// Bytes stored by writes
    pub bytes_written: AtomicU64,
    /// Number of delete calls
    pub deletes: AtomicU64,
    /// Usage probes answered without rescanning
    pub usage_cache_hits: AtomicU64,
}

impl IoStats {
    pub(crate) fn record_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Owns one client per layer, chosen by the layer's declared kind
pub struct IoClientFactory {
    layers: Arc<LayerTable>,
    clients: Vec<Arc<dyn IoClient>>,
}

impl IoClientFactory {
    /// Build the clients for every layer. Layers of the same kind share a client.
    #[must_use]
    pub fn new(layers: Arc<LayerTable>) -> Self {
        let posix: Arc<dyn IoClient> = Arc::new(PosixClient::new(Arc::clone(&layers)));
        let memory: Arc<dyn IoClient> = Arc::new(MemoryClient::new());

        let clients = layers
            .iter()
            .map(|layer| match layer.io_client {
                IoClientKind::Posix => Arc::clone(&posix),
                IoClientKind::Memory => Arc::clone(&memory),
            })
            .collect();

        Self { layers, clients }
    }

    /// Client serving `layer`
    pub fn client(&self, layer: LayerId) -> Result<&dyn IoClient> {
        // Resolve through the table so unknown ids report LayerNotFound.
        let layer = self.layers.get(layer)?;
        Ok(self.clients[usize::from(layer.id.0)].as_ref())
    }

    /// Current usage of `layer` as reported by its client
    pub fn current_usage(&self, layer: LayerId) -> Result<u64> {
        let descriptor = self.layers.get(layer)?;
        self.client(layer)?.current_usage(descriptor)
    }

    #[must_use]
    pub fn layers(&self) -> &Arc<LayerTable> {
        &self.layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hfetch_common::config::LayerConfig;
    use hfetch_common::{FileName, Segment};

    #[test]
    fn test_factory_selects_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let layers = Arc::new(
            LayerTable::from_configs(&[
                LayerConfig::memory(1.0, 8000.0),
                LayerConfig::posix(dir.path().join("pfs"), 16.0, 100.0),
            ])
            .unwrap(),
        );
        let factory = IoClientFactory::new(layers);
        assert!(factory.client(LayerId(9)).is_err());

        let name = FileName::new("a.bin").unwrap();
        for id in [LayerId(0), LayerId(1)] {
            let mut src = PosixFile::new(name.clone(), Segment::new(0, 3), id);
            src.data = Bytes::from_static(b"abcd");
            factory.client(id).unwrap().write(&src, &src).unwrap();
            assert!(factory.current_usage(id).unwrap() >= 4);
        }

        // Only the posix layer put anything on disk.
        assert!(dir.path().join("pfs").join("a.bin").exists());
        assert_eq!(
            factory
                .client(LayerId(0))
                .unwrap()
                .stats()
                .bytes_written
                .load(Ordering::Relaxed),
            4
        );
    }
}
