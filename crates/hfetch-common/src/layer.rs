//! Storage layer table
//!
//! Layers form a fixed fast-to-slow sequence built once at startup. The
//! last layer holds the canonical copy of every file and is treated as
//! unbounded; "next" always means the next slower layer.

use crate::config::LayerConfig;
use crate::error::{Error, Result};
use crate::types::LayerId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Bytes per megabyte as used for layer capacities
pub const MB: u64 = 1024 * 1024;

/// Which I/O client serves a layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoClientKind {
    /// Byte blobs kept in process memory
    Memory,
    /// Flat files under the layer's mount point
    #[default]
    Posix,
}

/// One storage tier
#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub id: LayerId,
    pub capacity_mb: f64,
    pub bandwidth_mbps: f64,
    pub mount: PathBuf,
    pub direct_io: bool,
    pub io_client: IoClientKind,
}

impl Layer {
    /// Capacity in bytes
    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        (self.capacity_mb * MB as f64) as u64
    }
}

/// Immutable, ordered sequence of layers (index == id)
#[derive(Clone, Debug)]
pub struct LayerTable {
    layers: Vec<Layer>,
}

impl LayerTable {
    /// Build the table from configuration, fastest layer first
    pub fn from_configs(configs: &[LayerConfig]) -> Result<Self> {
        if configs.is_empty() {
            return Err(Error::configuration("at least one layer is required"));
        }
        if configs.len() > usize::from(u8::MAX) {
            return Err(Error::configuration(format!(
                "too many layers: {}",
                configs.len()
            )));
        }

        let layers = configs
            .iter()
            .enumerate()
            .map(|(i, c)| Layer {
                id: LayerId(i as u8),
                capacity_mb: c.capacity_mb,
                bandwidth_mbps: c.bandwidth_mbps,
                mount: c.mount.clone(),
                direct_io: c.direct_io,
                io_client: c.kind,
            })
            .collect();

        Ok(Self { layers })
    }

    /// Look up a layer
    pub fn get(&self, id: LayerId) -> Result<&Layer> {
        self.layers
            .get(usize::from(id.0))
            .ok_or(Error::LayerNotFound(id.0))
    }

    /// Fastest layer
    #[must_use]
    pub fn first(&self) -> &Layer {
        &self.layers[0]
    }

    /// Slowest layer, home of the canonical copies
    #[must_use]
    pub fn last(&self) -> &Layer {
        &self.layers[self.layers.len() - 1]
    }

    #[must_use]
    pub fn is_last(&self, id: LayerId) -> bool {
        usize::from(id.0) + 1 == self.layers.len()
    }

    /// Next slower layer, `None` for the last one
    #[must_use]
    pub fn next(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(usize::from(id.0) + 1)
    }

    /// Next faster layer, `None` for the first one
    #[must_use]
    pub fn previous(&self, id: LayerId) -> Option<&Layer> {
        usize::from(id.0)
            .checked_sub(1)
            .and_then(|i| self.layers.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}
