//! Placement engine interface and factory

use crate::max_bandwidth::MaxBandwidthDpe;
use hfetch_common::config::PlacementEngineKind;
use hfetch_common::{Layer, LayerId, PosixFile, SegmentScore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Heat and fill summary of one layer
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerScore {
    /// Coldest tracked fragment, `None` when the layer holds nothing tracked
    pub min_score: Option<f64>,
    /// Hottest tracked fragment, `None` when the layer holds nothing tracked
    pub max_score: Option<f64>,
    /// Bytes still free on the layer
    pub remaining_capacity: u64,
}

impl LayerScore {
    /// True if some tracked fragment on the layer is colder than `score`
    #[must_use]
    pub fn has_colder_than(&self, score: f64) -> bool {
        self.min_score.is_some_and(|min| min < score)
    }
}

/// Per-layer summaries keyed by layer id
pub type LayerScores = BTreeMap<LayerId, LayerScore>;

/// Chooses the layer a segment should live on
pub trait DataPlacementEngine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &'static str;

    /// Pick one of `candidates` for `file` whose heat is `score`.
    ///
    /// Returns `None` only when `candidates` is empty.
    fn select_layer(
        &self,
        candidates: &[&Layer],
        file: &PosixFile,
        score: &SegmentScore,
        layer_scores: &LayerScores,
    ) -> Option<LayerId>;
}

/// Builds placement engines by kind
pub struct DpeFactory;

impl DpeFactory {
    #[must_use]
    pub fn engine(kind: PlacementEngineKind) -> Arc<dyn DataPlacementEngine> {
        match kind {
            PlacementEngineKind::MaxBandwidth => Arc::new(MaxBandwidthDpe::new()),
        }
    }
}
