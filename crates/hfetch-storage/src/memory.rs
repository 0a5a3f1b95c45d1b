//! In-memory I/O client
//!
//! Each blob is a set of non-overlapping extents keyed by start offset, so
//! deleting a range in the middle of a blob releases exactly those bytes.

use crate::io_client::{IoClient, IoStats};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use hfetch_common::{Error, FileName, Layer, LayerId, PosixFile, Result, Segment};
use std::collections::BTreeMap;
use tracing::debug;

type Extents = BTreeMap<i64, Bytes>;

/// Blobs kept in process memory
#[derive(Default)]
pub struct MemoryClient {
    blobs: DashMap<(LayerId, FileName), Extents>,
    stats: IoStats,
}

impl MemoryClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn extent_segment(start: i64, data: &Bytes) -> Segment {
        Segment::from_offset_len(start, data.len() as i64)
    }

    /// Remove `range` from `extents`, keeping whatever lies outside it
    fn punch(extents: &mut Extents, range: &Segment) {
        let hit: Vec<i64> = extents
            .range(..=range.end)
            .filter(|(start, data)| Self::extent_segment(**start, data).overlaps(range))
            .map(|(start, _)| *start)
            .collect();

        for start in hit {
            let Some(data) = extents.remove(&start) else {
                continue;
            };
            for left in Self::extent_segment(start, &data).subtract(range) {
                let from = (left.start - start) as usize;
                let to = (left.end - start) as usize;
                extents.insert(left.start, data.slice(from..=to));
            }
        }
    }
}

impl IoClient for MemoryClient {
    fn read(&self, source: &PosixFile, destination: &mut PosixFile) -> Result<()> {
        let key = (source.layer, source.filename.clone());
        let blob = self
            .blobs
            .get(&key)
            .ok_or_else(|| Error::storage(format!("{} not on layer {}", source.filename, source.layer)))?;

        let wanted = source.segment;
        let mut out = BytesMut::with_capacity(source.size() as usize);
        let mut cursor = wanted.start;
        for (start, data) in blob.range(..=wanted.end) {
            let Some(common) = Self::extent_segment(*start, data).intersect(&wanted) else {
                continue;
            };
            if common.start > cursor {
                break;
            }
            let from = (common.start - start) as usize;
            let to = (common.end - start) as usize;
            out.extend_from_slice(&data[from..=to]);
            cursor = common.end + 1;
        }

        if cursor <= wanted.end {
            return Err(Error::storage(format!(
                "{} {} not fully stored on layer {} (missing from {})",
                source.filename, wanted, source.layer, cursor
            )));
        }

        self.stats.record_read(out.len());
        destination.data = out.freeze();
        Ok(())
    }

    fn write(&self, source: &PosixFile, destination: &PosixFile) -> Result<()> {
        let size = destination.size() as usize;
        if source.data.len() < size {
            return Err(Error::storage(format!(
                "write of {} needs {} bytes, got {}",
                destination.segment,
                size,
                source.data.len()
            )));
        }

        let mut blob = self
            .blobs
            .entry((destination.layer, destination.filename.clone()))
            .or_default();
        Self::punch(&mut blob, &destination.segment);
        blob.insert(destination.segment.start, source.data.slice(..size));

        self.stats.record_write(size);
        Ok(())
    }

    fn delete(&self, file: &PosixFile) -> Result<()> {
        let key = (file.layer, file.filename.clone());
        self.stats.record_delete();

        let now_empty = match self.blobs.get_mut(&key) {
            Some(mut blob) => {
                Self::punch(&mut blob, &file.segment);
                blob.is_empty()
            }
            None => {
                debug!("Delete of untracked blob {} on layer {}", file.filename, file.layer);
                return Ok(());
            }
        };
        if now_empty {
            self.blobs.remove_if(&key, |_, blob| blob.is_empty());
        }
        Ok(())
    }

    fn current_usage(&self, layer: &Layer) -> Result<u64> {
        Ok(self
            .blobs
            .iter()
            .filter(|entry| entry.key().0 == layer.id)
            .map(|entry| entry.value().values().map(|d| d.len() as u64).sum::<u64>())
            .sum())
    }

    fn stats(&self) -> &IoStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfetch_common::IoClientKind;
    use std::path::PathBuf;

    fn layer(id: u8) -> Layer {
        Layer {
            id: LayerId(id),
            capacity_mb: 1.0,
            bandwidth_mbps: 1000.0,
            mount: PathBuf::new(),
            direct_io: false,
            io_client: IoClientKind::Memory,
        }
    }

    fn file(start: i64, end: i64) -> PosixFile {
        PosixFile::new(FileName::new("blob").unwrap(), Segment::new(start, end), LayerId(0))
    }

    fn with_data(mut f: PosixFile, data: &'static [u8]) -> PosixFile {
        f.data = Bytes::from_static(data);
        f
    }

    #[test]
    fn test_write_then_read() {
        let client = MemoryClient::new();
        let f = with_data(file(0, 9), b"0123456789");
        client.write(&f, &f).unwrap();

        let mut out = file(3, 6);
        client.read(&file(3, 6), &mut out).unwrap();
        assert_eq!(&out.data[..], b"3456");
        assert_eq!(client.current_usage(&layer(0)).unwrap(), 10);
        assert_eq!(client.current_usage(&layer(1)).unwrap(), 0);
    }

    #[test]
    fn test_overwrite_middle() {
        let client = MemoryClient::new();
        let f = with_data(file(0, 9), b"0123456789");
        client.write(&f, &f).unwrap();
        let patch = with_data(file(4, 5), b"xy");
        client.write(&patch, &patch).unwrap();

        let mut out = file(0, 9);
        client.read(&file(0, 9), &mut out).unwrap();
        assert_eq!(&out.data[..], b"0123xy6789");
        assert_eq!(client.current_usage(&layer(0)).unwrap(), 10);
    }

    #[test]
    fn test_delete_middle_releases_bytes() {
        let client = MemoryClient::new();
        let f = with_data(file(0, 9), b"0123456789");
        client.write(&f, &f).unwrap();
        client.delete(&file(2, 4)).unwrap();

        assert_eq!(client.current_usage(&layer(0)).unwrap(), 7);
        let mut out = file(5, 9);
        client.read(&file(5, 9), &mut out).unwrap();
        assert_eq!(&out.data[..], b"56789");
        assert!(client.read(&file(0, 9), &mut file(0, 9)).is_err());

        client.delete(&file(0, 9)).unwrap();
        assert_eq!(client.current_usage(&layer(0)).unwrap(), 0);
        assert!(client.read(&file(5, 9), &mut file(5, 9)).is_err());
    }

    #[test]
    fn test_short_write_rejected() {
        let client = MemoryClient::new();
        let f = with_data(file(0, 9), b"short");
        assert!(client.write(&f, &f).is_err());
    }
}
