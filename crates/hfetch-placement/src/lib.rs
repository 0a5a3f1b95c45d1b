//! HFetch Placement - Data placement engines
//!
//! A data placement engine (DPE) decides which layer a segment should be
//! brought to, given the candidate layers, the segment and a snapshot of
//! how hot and how full every layer currently is.
//!
//! # Engines
//!
//! ## Max bandwidth
//! Fastest layer that has room for the segment, or that can make room by
//! evicting data colder than the segment.
//!
//! # Example
//! ```ignore
//! use hfetch_placement::DpeFactory;
//!
//! let dpe = DpeFactory::engine(PlacementEngineKind::MaxBandwidth);
//! let target = dpe.select_layer(&candidates, &file, &score, &layer_scores);
//! ```

pub mod dpe;
pub mod max_bandwidth;

pub use dpe::{DataPlacementEngine, DpeFactory, LayerScore, LayerScores};
pub use max_bandwidth::MaxBandwidthDpe;
