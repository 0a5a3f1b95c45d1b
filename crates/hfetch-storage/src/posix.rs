//! File-backed I/O client
//!
//! Every blob is a regular file at `<layer mount>/<filename>` and segments
//! address byte offsets in it. Layers flagged `direct_io` get their pages
//! dropped from the page cache after each transfer (Linux only).
//!
//! Usage is measured like `du`: allocated blocks under the mount point. The
//! result is cached per layer and only recomputed after a write or delete
//! touched that layer.

use crate::io_client::{IoClient, IoStats};
use hfetch_common::{Error, Layer, LayerId, LayerTable, PosixFile, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct CachedUsage {
    bytes: u64,
    dirty: bool,
}

/// Flat files under each layer's mount point
pub struct PosixClient {
    layers: Arc<LayerTable>,
    usage: Mutex<HashMap<LayerId, CachedUsage>>,
    stats: IoStats,
}

impl PosixClient {
    #[must_use]
    pub fn new(layers: Arc<LayerTable>) -> Self {
        Self {
            layers,
            usage: Mutex::new(HashMap::new()),
            stats: IoStats::default(),
        }
    }

    /// On-disk location of `file`
    pub fn path_of(&self, file: &PosixFile) -> Result<PathBuf> {
        let layer = self.layers.get(file.layer)?;
        // Names may be absolute application paths; keep them under the mount.
        let relative = file.filename.as_str().trim_start_matches('/');
        Ok(layer.mount.join(relative))
    }

    fn mark_dirty(&self, layer: LayerId) {
        if let Some(entry) = self.usage.lock().get_mut(&layer) {
            entry.dirty = true;
        }
    }

    fn drop_cached_pages(&self, file: &File, layer: LayerId) {
        let direct = self.layers.get(layer).is_ok_and(|l| l.direct_io);
        if direct {
            advise_dont_need(file);
        }
    }

    fn scan_usage(dir: &Path) -> Result<u64> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut total = 0u64;
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                total += Self::scan_usage(&entry.path())?;
            } else {
                total += allocated_bytes(&metadata);
            }
        }
        Ok(total)
    }
}

impl IoClient for PosixClient {
    fn read(&self, source: &PosixFile, destination: &mut PosixFile) -> Result<()> {
        let path = self.path_of(source)?;
        let mut file = File::open(&path)
            .map_err(|e| Error::storage(format!("failed to open {}: {}", path.display(), e)))?;

        let offset = u64::try_from(source.segment.start)
            .map_err(|_| Error::InvalidSegment {
                start: source.segment.start,
                end: source.segment.end,
            })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::storage(format!("seek failed on {}: {}", path.display(), e)))?;

        let mut buf = vec![0u8; source.size() as usize];
        file.read_exact(&mut buf).map_err(|e| {
            Error::storage(format!(
                "read of {} failed on {}: {}",
                source.segment,
                path.display(),
                e
            ))
        })?;
        self.drop_cached_pages(&file, source.layer);

        self.stats.record_read(buf.len());
        destination.data = buf.into();
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

        let path = self.path_of(destination)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::storage(format!("failed to open {}: {}", path.display(), e)))?;

        let offset = u64::try_from(destination.segment.start).map_err(|_| {
            Error::InvalidSegment {
                start: destination.segment.start,
                end: destination.segment.end,
            }
        })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::storage(format!("seek failed on {}: {}", path.display(), e)))?;
        file.write_all(&source.data[..size])
            .map_err(|e| Error::storage(format!("write failed on {}: {}", path.display(), e)))?;

        if self.layers.get(destination.layer)?.direct_io {
            file.sync_data()?;
            self.drop_cached_pages(&file, destination.layer);
        }

        self.stats.record_write(size);
        self.mark_dirty(destination.layer);
        Ok(())
    }

    fn delete(&self, file: &PosixFile) -> Result<()> {
        let path = self.path_of(file)?;
        self.stats.record_delete();

        let handle = match OpenOptions::new().write(true).open(&path) {
            Ok(handle) => handle,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Delete of missing file {}", path.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let len = handle.metadata()?.len();
        let start = u64::try_from(file.segment.start).unwrap_or(0);
        let end = u64::try_from(file.segment.end).unwrap_or(0);

        if start == 0 && end + 1 >= len {
            drop(handle);
            std::fs::remove_file(&path)?;
        } else if end + 1 >= len {
            handle.set_len(start)?;
        } else {
            // Later bytes keep their offsets; only release the range.
            punch_hole(&handle, start, end - start + 1);
        }

        self.mark_dirty(file.layer);
        Ok(())
    }

    fn current_usage(&self, layer: &Layer) -> Result<u64> {
        if let Some(cached) = self.usage.lock().get(&layer.id) {
            if !cached.dirty {
                self.stats.usage_cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(cached.bytes);
            }
        }

        let bytes = Self::scan_usage(&layer.mount)?;
        self.usage
            .lock()
            .insert(layer.id, CachedUsage { bytes, dirty: false });
        Ok(bytes)
    }

    fn footprint(&self, file: &PosixFile) -> Result<u64> {
        let path = self.path_of(file)?;
        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let end = u64::try_from(file.segment.end).unwrap_or(0);
        if file.segment.start == 0 && end + 1 >= metadata.len() {
            // The whole blob goes, so usage drops by its allocation.
            Ok(allocated_bytes(&metadata).max(file.size()))
        } else {
            Ok(file.size())
        }
    }

    fn stats(&self) -> &IoStats {
        &self.stats
    }
}

#[cfg(unix)]
fn allocated_bytes(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.blocks() * 512
}

#[cfg(not(unix))]
fn allocated_bytes(metadata: &std::fs::Metadata) -> u64 {
    metadata.len()
}

#[cfg(target_os = "linux")]
fn advise_dont_need(file: &File) {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED) };
    if ret != 0 {
        debug!("posix_fadvise failed: {}", std::io::Error::from_raw_os_error(ret));
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_dont_need(_file: &File) {}

#[cfg(target_os = "linux")]
fn punch_hole(file: &File, offset: u64, len: u64) {
    use std::os::unix::io::AsRawFd;

    let (Ok(offset), Ok(len)) = (libc::off_t::try_from(offset), libc::off_t::try_from(len)) else {
        warn!("Hole [{}+{}] out of range", offset, len);
        return;
    };
    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset,
            len,
        )
    };
    if ret == -1 {
        warn!(
            "Failed to release [{}+{}]: {}",
            offset,
            len,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn punch_hole(_file: &File, offset: u64, len: u64) {
    debug!("Leaving [{}+{}] allocated, hole punching unsupported", offset, len);
}
