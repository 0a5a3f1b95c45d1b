//! Event handling
//!
//! Feeds event batches to the auditor, then for every read asks the
//! placement engine whether the fragments it touched should move to a
//! faster layer, making room there first.

use crate::auditor::FileSegmentAuditor;
use crate::data_manager::DataManager;
use hfetch_common::{ErrorKind, Event, EventType, Layer, PosixFile, Result, Segment};
use hfetch_placement::DataPlacementEngine;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct EventManager {
    auditor: Arc<FileSegmentAuditor>,
    data_manager: Arc<DataManager>,
    dpe: Arc<dyn DataPlacementEngine>,
}

impl EventManager {
    #[must_use]
    pub fn new(
        auditor: Arc<FileSegmentAuditor>,
        data_manager: Arc<DataManager>,
        dpe: Arc<dyn DataPlacementEngine>,
    ) -> Self {
        Self {
            auditor,
            data_manager,
            dpe,
        }
    }

    /// Apply one batch of events
    pub fn handle(&self, events: &[Event]) -> Result<()> {
        let updated = self.auditor.update(events);

        for event in events.iter().filter(|e| e.event_type == EventType::Read) {
            if let Err(e) = self.place(event) {
                warn!(
                    "Placement for {} {} failed: {}",
                    event.filename, event.segment, e
                );
            }
        }
        updated
    }

    /// Move the fragments `event` touched to the layer the engine picks
    fn place(&self, event: &Event) -> Result<()> {
        let filename = &event.filename;
        if !self.auditor.is_tracked(filename) {
            return Ok(());
        }
        let layers = Arc::clone(self.auditor.layers());

        let touched: Vec<_> = self
            .auditor
            .fragments(filename)
            .into_iter()
            .filter(|(key, _)| key.overlaps(&event.segment))
            .collect();

        for (key, entry) in touched {
            let current = entry.location.layer;
            let candidates: Vec<&Layer> = layers.iter().filter(|l| l.id <= current).collect();
            let layer_scores = self.auditor.fetch_layer_scores()?;
            let Some(target) =
                self.dpe
                    .select_layer(&candidates, &entry.location, &entry.score, &layer_scores)
            else {
                continue;
            };
            if target >= current {
                continue;
            }

            let size = entry.location.size();
            match self
                .data_manager
                .make_capacity(size, entry.score.value(), target)
            {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Capacity => {
                    debug!("No room for {} {} on layer {}: {}", filename, key, target, e);
                    continue;
                }
                Err(e) => return Err(e),
            }

            // Making room may have touched this file too.
            let Some(entry) = self.auditor.fragment(filename, &key) else {
                continue;
            };
            if entry.location.layer != current {
                continue;
            }

            let destination = PosixFile::new(
                self.data_manager.generate_buffer_filename()?,
                Segment::from_offset_len(0, size as i64),
                target,
            );
            let logical = PosixFile::new(filename.clone(), key, current);
            self.data_manager
                .prefetch(&logical, &entry.location, &destination)?;
            debug!(
                "Prefetched {} {} from layer {} to layer {}",
                filename, key, current, target
            );
        }
        Ok(())
    }
}
