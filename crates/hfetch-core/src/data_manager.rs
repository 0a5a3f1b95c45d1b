//! Data manager
//!
//! Moves fragments between layers and makes room on a layer by pushing its
//! coldest fragments one layer down, cascading further down when the next
//! layer is full as well. The last layer holds the canonical copy of every
//! file and is treated as unbounded.

use crate::auditor::FileSegmentAuditor;
use crate::layer_index::IndexedFragment;
use hfetch_common::{Error, FileName, Layer, LayerId, LayerTable, PosixFile, Result, Segment};
use hfetch_dist::GlobalSequence;
use hfetch_storage::IoClientFactory;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One lock per layer, shared by every data manager of a cluster.
///
/// Capacity is made on a layer by one caller at a time.
#[derive(Debug)]
pub struct CapacityLocks(Vec<Mutex<()>>);

impl CapacityLocks {
    #[must_use]
    pub fn new(num_layers: usize) -> Self {
        Self((0..num_layers).map(|_| Mutex::new(())).collect())
    }

    fn get(&self, layer: LayerId) -> Result<&Mutex<()>> {
        self.0
            .get(usize::from(layer.0))
            .ok_or(Error::LayerNotFound(layer.0))
    }
}

/// Relocates data between layers
pub struct DataManager {
    layers: Arc<LayerTable>,
    io: Arc<IoClientFactory>,
    auditor: Arc<FileSegmentAuditor>,
    buffer_sequence: Arc<GlobalSequence>,
    capacity_locks: Arc<CapacityLocks>,
}

impl DataManager {
    #[must_use]
    pub fn new(
        io: Arc<IoClientFactory>,
        auditor: Arc<FileSegmentAuditor>,
        buffer_sequence: Arc<GlobalSequence>,
        capacity_locks: Arc<CapacityLocks>,
    ) -> Self {
        Self {
            layers: Arc::clone(io.layers()),
            io,
            auditor,
            buffer_sequence,
            capacity_locks,
        }
    }

    /// True if `amount` bytes could ever live on `layer`
    pub fn can_fit(&self, amount: u64, layer: LayerId) -> Result<bool> {
        let descriptor = self.layers.get(layer)?;
        Ok(self.layers.is_last(layer) || amount <= descriptor.capacity_bytes())
    }

    /// True if `amount` bytes are free on `layer` right now
    pub fn has_capacity(&self, amount: u64, layer: LayerId) -> Result<bool> {
        Ok(self.remaining_capacity(self.layers.get(layer)?)? >= amount)
    }

    fn remaining_capacity(&self, layer: &Layer) -> Result<u64> {
        let used = self.io.current_usage(layer.id)?;
        Ok(layer.capacity_bytes().saturating_sub(used))
    }

    /// Free `amount` bytes on `layer` by evicting fragments colder than
    /// `score` to the next layer.
    ///
    /// Nothing is moved unless enough colder data exists; in that case the
    /// call fails with [`Error::CapacityExceeded`].
    pub fn make_capacity(&self, amount: u64, score: f64, layer: LayerId) -> Result<()> {
        let descriptor = self.layers.get(layer)?;
        if !self.can_fit(amount, layer)? {
            return Err(Error::CapacityExceeded {
                required: amount,
                available: descriptor.capacity_bytes(),
                layer: layer.0,
            });
        }
        if self.layers.is_last(layer) {
            return Ok(());
        }

        let _making_room = self.capacity_locks.get(layer)?.lock();
        let remaining = self.remaining_capacity(descriptor)?;
        if remaining >= amount {
            return Ok(());
        }
        let needed = amount - remaining;

        // Freed space is counted the way the layer's usage is measured.
        let client = self.io.client(layer)?;
        let mut victims: Vec<IndexedFragment> = Vec::new();
        let mut freed = 0u64;
        for fragment in self.auditor.layer_fragments(layer)? {
            if freed >= needed || fragment.score >= score {
                break;
            }
            freed += client.footprint(&fragment.physical)?;
            victims.push(fragment);
        }
        if freed < needed {
            debug!(
                "Layer {}: only {} of {} bytes held by data colder than {}",
                layer, freed, needed, score
            );
            return Err(Error::CapacityExceeded {
                required: needed,
                available: freed,
                layer: layer.0,
            });
        }

        let next = self
            .layers
            .next(layer)
            .ok_or_else(|| Error::internal(format!("layer {layer} has no next layer")))?;
        if !self.layers.is_last(next.id) && !self.has_capacity(needed, next.id)? {
            // Victims are coldest first, so the last one is the hottest.
            let hottest = victims.last().map_or(score, |v| v.score);
            self.make_capacity(needed, hottest, next.id)?;
        }

        info!(
            "Layer {}: evicting {} bytes in {} fragments to layer {}",
            layer,
            needed,
            victims.len(),
            next.id
        );
        let mut to_free = needed;
        for victim in victims {
            if to_free == 0 {
                break;
            }
            let size = victim.physical.size();
            let footprint = client.footprint(&victim.physical)?;
            let (logical, physical) = if footprint > to_free && size > to_free {
                // Keep the head in place and move only the trailing bytes.
                let keep = size - to_free;
                let (_, logical_tail) = self.split(&victim.logical, keep)?;
                let (_, physical_tail) = self.split(&victim.physical, keep)?;
                (logical_tail, physical_tail)
            } else {
                (victim.logical, victim.physical)
            };

            let destination = if self.layers.is_last(next.id) {
                PosixFile::new(logical.filename.clone(), logical.segment, next.id)
            } else {
                PosixFile::new(
                    self.generate_buffer_filename()?,
                    Segment::from_offset_len(0, physical.size() as i64),
                    next.id,
                )
            };

            let released = if physical.size() == size {
                footprint
            } else {
                physical.size()
            };
            self.relocate(&logical, &physical, &destination, true)?;
            to_free = to_free.saturating_sub(released);
        }
        Ok(())
    }

    /// Copy `source` to `destination`, then optionally delete the source.
    ///
    /// The source is only deleted after the write succeeded; a failed delete
    /// is logged and not reported.
    pub fn move_segment(
        &self,
        source: &PosixFile,
        destination: &PosixFile,
        delete_source: bool,
    ) -> Result<()> {
        if source.size() == 0 {
            return Ok(());
        }
        if source.size() != destination.size() {
            return Err(Error::InvalidSegment {
                start: destination.segment.start,
                end: destination.segment.end,
            });
        }

        let source_client = self.io.client(source.layer)?;
        let mut staged = destination.clone();
        source_client.read(source, &mut staged)?;
        self.io.client(destination.layer)?.write(&staged, destination)?;
        debug!(
            "Moved {} {} (layer {}) to {} {} (layer {})",
            source.filename,
            source.segment,
            source.layer,
            destination.filename,
            destination.segment,
            destination.layer
        );

        if delete_source {
            if let Err(e) = source_client.delete(source) {
                warn!(
                    "Copied {} {} but failed to delete it from layer {}: {}",
                    source.filename, source.segment, source.layer, e
                );
            }
        }
        Ok(())
    }

    /// Move the bytes of `logical`, held at `physical`, to `destination`
    /// and point the registry at them.
    ///
    /// The source is released only once the registry no longer refers to
    /// it. If the registry cannot be updated, a buffer written on an
    /// intermediate layer is removed again and the source stays in place.
    pub fn relocate(
        &self,
        logical: &PosixFile,
        physical: &PosixFile,
        destination: &PosixFile,
        release_source: bool,
    ) -> Result<()> {
        self.move_segment(physical, destination, false)?;

        if let Err(e) = self.auditor.update_on_move(logical, destination) {
            if !self.layers.is_last(destination.layer) {
                if let Err(cleanup) = self.io.client(destination.layer)?.delete(destination) {
                    warn!(
                        "Failed to remove unreferenced {} on layer {}: {}",
                        destination.filename, destination.layer, cleanup
                    );
                }
            }
            return Err(e);
        }

        if release_source {
            if let Err(e) = self.io.client(physical.layer)?.delete(physical) {
                warn!(
                    "Relocated {} {} but failed to delete it from layer {}: {}",
                    physical.filename, physical.segment, physical.layer, e
                );
            }
        }
        Ok(())
    }

    /// Copy `logical`, currently held at `source`, to `destination`; the
    /// source is kept when it is the canonical copy on the last layer.
    pub fn prefetch(
        &self,
        logical: &PosixFile,
        source: &PosixFile,
        destination: &PosixFile,
    ) -> Result<()> {
        let release_source = !self.layers.is_last(source.layer);
        self.relocate(logical, source, destination, release_source)
    }

    /// Cut `file` after its first `at` bytes
    pub fn split(&self, file: &PosixFile, at: u64) -> Result<(PosixFile, PosixFile)> {
        let segment = file.segment;
        if at == 0 || at >= file.size() {
            return Err(Error::InvalidSegment {
                start: segment.start,
                end: segment.end,
            });
        }
        let cut = segment.start + at as i64;
        Ok((
            file.with_segment(Segment::new(segment.start, cut - 1)),
            file.with_segment(Segment::new(cut, segment.end)),
        ))
    }

    /// Unique name for a fragment held on an intermediate layer
    pub fn generate_buffer_filename(&self) -> Result<FileName> {
        Ok(FileName::new(format!("{}.hfetch", self.buffer_sequence.next()))?)
    }

    #[must_use]
    pub fn layers(&self) -> &Arc<LayerTable> {
        &self.layers
    }
}
