//! Bandwidth-first placement

use crate::dpe::{DataPlacementEngine, LayerScores};
use hfetch_common::{Layer, LayerId, PosixFile, SegmentScore};
use tracing::debug;

/// Picks the fastest layer that can hold the segment.
///
/// Candidates are tried from the highest bandwidth down. A layer qualifies
/// when it has enough free space, or when it is large enough and holds data
/// colder than the segment (so room can be made by evicting it). When no
/// layer qualifies the slowest candidate is chosen.
#[derive(Debug, Default)]
pub struct MaxBandwidthDpe;

impl MaxBandwidthDpe {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl DataPlacementEngine for MaxBandwidthDpe {
    fn name(&self) -> &'static str {
        "max_bandwidth"
    }

    fn select_layer(
        &self,
        candidates: &[&Layer],
        file: &PosixFile,
        score: &SegmentScore,
        layer_scores: &LayerScores,
    ) -> Option<LayerId> {
        let mut ordered: Vec<&Layer> = candidates.to_vec();
        ordered.sort_by(|a, b| {
            b.bandwidth_mbps
                .total_cmp(&a.bandwidth_mbps)
                .then(a.id.cmp(&b.id))
        });

        let size = file.size();
        let heat = score.value();
        for layer in &ordered {
            let Some(summary) = layer_scores.get(&layer.id) else {
                continue;
            };
            if summary.remaining_capacity >= size {
                debug!("{} {} fits on layer {}", file.filename, file.segment, layer.id);
                return Some(layer.id);
            }
            if layer.capacity_bytes() >= size && summary.has_colder_than(heat) {
                debug!(
                    "{} {} displaces colder data on layer {}",
                    file.filename, file.segment, layer.id
                );
                return Some(layer.id);
            }
        }

        ordered.last().map(|layer| layer.id)
    }
}
