//! Hardware monitor
//!
//! Reports files that show up on the last layer without passing through the
//! application's own I/O, so their registries exist before anyone reads
//! them. The server polls a [`HardwareMonitor`] on its own thread and queues
//! what it returns like any other event.

use hfetch_common::{
    Event, EventSource, EventType, FileName, IoClientKind, Layer, LayerId, LayerTable, Result,
    Segment, shard_of,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Source of events observed on the storage hardware
pub trait HardwareMonitor: Send + Sync {
    /// Events observed since the previous call
    fn fetch_events(&self) -> Result<Vec<Event>>;
}

/// Polls a file-backed layer for new files.
///
/// A file reported once is not reported again until it disappears. Only
/// files owned by this server are reported, so every file is announced by
/// exactly one monitor of the group.
pub struct MountMonitor {
    layer: LayerId,
    mount: PathBuf,
    server: u16,
    num_servers: u16,
    seen: Mutex<HashSet<FileName>>,
}

impl MountMonitor {
    #[must_use]
    pub fn new(layer: &Layer, server: u16, num_servers: u16) -> Self {
        Self {
            layer: layer.id,
            mount: layer.mount.clone(),
            server,
            num_servers,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Monitor for the last layer of `layers`, if it lives on a file system
    #[must_use]
    pub fn for_last_layer(layers: &LayerTable, server: u16, num_servers: u16) -> Option<Self> {
        let last = layers.last();
        (last.io_client == IoClientKind::Posix).then(|| Self::new(last, server, num_servers))
    }

    fn scan(&self, dir: &Path, found: &mut Vec<(FileName, u64)>) -> Result<()> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            let path = entry.path();
            if metadata.is_dir() {
                self.scan(&path, found)?;
                continue;
            }
            if !metadata.is_file() || metadata.len() == 0 {
                continue;
            }

            let name = path
                .strip_prefix(&self.mount)
                .ok()
                .and_then(Path::to_str)
                .and_then(|relative| FileName::new(relative).ok());
            match name {
                Some(name) => found.push((name, metadata.len())),
                None => debug!("Ignoring {} on layer {}", path.display(), self.layer),
            }
        }
        Ok(())
    }

    fn event(&self, event_type: EventType, filename: FileName, segment: Segment) -> Event {
        let mut event = Event::new(event_type, filename, segment, self.layer);
        event.source = EventSource::HardwareMonitor;
        event
    }
}

impl HardwareMonitor for MountMonitor {
    fn fetch_events(&self) -> Result<Vec<Event>> {
        let mut found = Vec::new();
        self.scan(&self.mount, &mut found)?;

        let mut seen = self.seen.lock();
        let present: HashSet<&FileName> = found.iter().map(|(name, _)| name).collect();
        seen.retain(|name| present.contains(name));

        let mut events = Vec::new();
        for (name, len) in found {
            if shard_of(&name, self.num_servers) != self.server || seen.contains(&name) {
                continue;
            }
            let Ok(len) = i64::try_from(len) else {
                continue;
            };
            let segment = Segment::from_offset_len(0, len);
            events.push(self.event(EventType::Open, name.clone(), segment));
            events.push(self.event(EventType::Close, name.clone(), segment));
            seen.insert(name);
        }

        if !events.is_empty() {
            debug!(
                "Found {} new files on layer {}",
                events.len() / 2,
                self.layer
            );
        }
        Ok(events)
    }
}
