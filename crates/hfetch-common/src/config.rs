//! Configuration types for HFetch
//!
//! This module defines configuration structures shared by the server and
//! its components. Every section has defaults so a partial TOML file is
//! enough to start a server.

use crate::error::{Error, Result};
use crate::layer::IoClientKind;
use crate::types::ScoreKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration for HFetch
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server identity and worker pool
    pub server: ServerConfig,
    /// Storage layers, fastest first
    pub layers: Vec<LayerConfig>,
    /// Segment scoring
    pub score: ScoreConfig,
    /// Data placement
    pub placement: PlacementConfig,
    /// Cross-shard calls
    pub rpc: RpcConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::configuration(e.to_string()))
    }

    /// Load and parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.server.num_servers == 0 {
            return Err(Error::configuration("num_servers must be at least 1"));
        }
        if self.server.id >= self.server.num_servers {
            return Err(Error::configuration(format!(
                "server id {} out of range for {} servers",
                self.server.id, self.server.num_servers
            )));
        }
        if self.layers.is_empty() {
            return Err(Error::configuration("at least one layer is required"));
        }
        if self.server.max_batch_events == 0 {
            return Err(Error::configuration("max_batch_events must be at least 1"));
        }
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.capacity_mb < 0.0 || layer.bandwidth_mbps <= 0.0 {
                return Err(Error::configuration(format!(
                    "layer {i}: capacity must be >= 0 and bandwidth > 0"
                )));
            }
        }
        Ok(())
    }

    /// Four-tier default hierarchy (ramfs, nvme, burst buffer, pfs) sized
    /// relative to the expected I/O volume.
    #[must_use]
    pub fn default_tiers(
        run_dir: &Path,
        nvme_dir: Option<&Path>,
        bb_dir: Option<&Path>,
        io_size_mb: f64,
    ) -> Vec<LayerConfig> {
        let nvme = nvme_dir.unwrap_or(run_dir);
        let bb = bb_dir.unwrap_or(run_dir);
        vec![
            LayerConfig {
                mount: run_dir.join("ramfs"),
                capacity_mb: io_size_mb / 4.0,
                bandwidth_mbps: 80_000.0,
                direct_io: false,
                kind: IoClientKind::Memory,
            },
            LayerConfig::posix(nvme.join("nvme"), io_size_mb / 4.0, 2_000.0),
            LayerConfig::posix(bb.join("bb"), io_size_mb / 2.0, 400.0),
            LayerConfig::posix(run_dir.join("pfs"), io_size_mb, 100.0),
        ]
    }
}

/// Server identity and worker pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Shard id owned by this server
    pub id: u16,
    /// Total number of servers
    pub num_servers: u16,
    /// Event worker threads
    pub num_workers: usize,
    /// Events handed to the event manager per batch
    pub max_batch_events: usize,
    /// Sleep between empty queue polls (milliseconds)
    pub poll_interval_ms: u64,
    /// Period of the hardware monitor's scan of the last layer
    /// (milliseconds); 0 disables the monitor
    pub monitor_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: 0,
            num_servers: 1,
            num_workers: 1,
            max_batch_events: 1,
            poll_interval_ms: 1,
            monitor_interval_ms: 1000,
        }
    }
}

/// Configuration for one storage layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Mount point of the layer
    #[serde(default)]
    pub mount: PathBuf,
    /// Capacity in megabytes
    pub capacity_mb: f64,
    /// Bandwidth in megabytes per second
    pub bandwidth_mbps: f64,
    /// Bypass the page cache where the client supports it
    #[serde(default)]
    pub direct_io: bool,
    /// I/O client serving the layer
    #[serde(default)]
    pub kind: IoClientKind,
}

impl LayerConfig {
    /// In-memory layer
    #[must_use]
    pub fn memory(capacity_mb: f64, bandwidth_mbps: f64) -> Self {
        Self {
            mount: PathBuf::new(),
            capacity_mb,
            bandwidth_mbps,
            direct_io: false,
            kind: IoClientKind::Memory,
        }
    }

    /// File-backed layer under `mount`
    #[must_use]
    pub fn posix(mount: impl Into<PathBuf>, capacity_mb: f64, bandwidth_mbps: f64) -> Self {
        Self {
            mount: mount.into(),
            capacity_mb,
            bandwidth_mbps,
            direct_io: false,
            kind: IoClientKind::Posix,
        }
    }

    /// Parse the compact command-line form
    /// `<count>#<cap_mb>_<bw_mbps>_<is_memory>_<mount>_<direct_io>#...`
    pub fn parse_compact(s: &str) -> Result<Vec<Self>> {
        let mut parts = s.split('#');
        let count: usize = parts
            .next()
            .and_then(|c| c.trim().parse().ok())
            .ok_or_else(|| Error::configuration(format!("bad layer count in {s:?}")))?;

        let layers = parts
            .take(count)
            .map(Self::parse_one)
            .collect::<Result<Vec<_>>>()?;

        if layers.len() != count {
            return Err(Error::configuration(format!(
                "expected {count} layers, found {}",
                layers.len()
            )));
        }
        Ok(layers)
    }

    fn parse_one(s: &str) -> Result<Self> {
        let bad = || Error::configuration(format!("bad layer description {s:?}"));

        let mut fields = s.splitn(4, '_');
        let capacity_mb: f64 = fields.next().and_then(|v| v.parse().ok()).ok_or_else(bad)?;
        let bandwidth_mbps: f64 = fields.next().and_then(|v| v.parse().ok()).ok_or_else(bad)?;
        let is_memory: u8 = fields.next().and_then(|v| v.parse().ok()).ok_or_else(bad)?;
        // The mount may itself contain underscores; direct_io is the last field.
        let (mount, direct_io) = fields.next().and_then(|v| v.rsplit_once('_')).ok_or_else(bad)?;
        let direct_io: u8 = direct_io.parse().map_err(|_| bad())?;

        Ok(Self {
            mount: PathBuf::from(mount),
            capacity_mb,
            bandwidth_mbps,
            direct_io: direct_io != 0,
            kind: if is_memory != 0 {
                IoClientKind::Memory
            } else {
                IoClientKind::Posix
            },
        })
    }
}

/// Segment scoring configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreConfig {
    /// Which score component ranks segments
    pub kind: ScoreKind,
    /// Decay constant for the recency term
    pub lambda: f64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            kind: ScoreKind::Frequency,
            lambda: 0.5,
        }
    }
}

/// Available data placement engines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementEngineKind {
    /// Fastest layer that can hold the segment
    #[default]
    MaxBandwidth,
}

/// Data placement configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub engine: PlacementEngineKind,
}

/// Cross-shard call configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Retries after the first attempt for retryable failures
    pub max_retries: u32,
    /// Backoff step between retries (milliseconds, grows linearly)
    pub retry_backoff_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 10,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Directory for per-server log files; stderr when unset
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.num_servers, 1);
        assert_eq!(config.score.kind, ScoreKind::Frequency);
        assert_eq!(config.placement.engine, PlacementEngineKind::MaxBandwidth);
        // No layers yet, so it is not runnable as-is.
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let config = Config::from_toml_str(
            r#"
            [server]
            id = 1
            num_servers = 2
            num_workers = 4
            monitor_interval_ms = 0

            [[layers]]
            capacity_mb = 64.0
            bandwidth_mbps = 8000.0
            kind = "memory"

            [[layers]]
            mount = "/mnt/pfs"
            capacity_mb = 1024.0
            bandwidth_mbps = 100.0

            [score]
            kind = "lrf"
            lambda = 0.25
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.server.id, 1);
        assert_eq!(config.server.num_workers, 4);
        assert_eq!(config.server.max_batch_events, 1);
        assert_eq!(config.server.monitor_interval_ms, 0);
        assert_eq!(config.layers.len(), 2);
        assert_eq!(config.layers[0].kind, IoClientKind::Memory);
        assert_eq!(config.layers[1].kind, IoClientKind::Posix);
        assert_eq!(config.layers[1].mount, PathBuf::from("/mnt/pfs"));
        assert_eq!(config.score.kind, ScoreKind::Lrf);
    }

    #[test]
    fn test_validate_server_id() {
        let mut config = Config::default();
        config.layers.push(LayerConfig::memory(1.0, 1.0));
        config.server.id = 3;
        config.server.num_servers = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_compact_layers() {
        let layers =
            LayerConfig::parse_compact("2#256_80000_1_/dev/shm/hfetch_0#4096_100_0_/mnt/pfs_run_1")
                .unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].kind, IoClientKind::Memory);
        assert_eq!(layers[0].capacity_mb, 256.0);
        assert_eq!(layers[0].mount, PathBuf::from("/dev/shm/hfetch"));
        assert!(!layers[0].direct_io);
        assert_eq!(layers[1].kind, IoClientKind::Posix);
        assert_eq!(layers[1].mount, PathBuf::from("/mnt/pfs_run"));
        assert!(layers[1].direct_io);
    }

    #[test]
    fn test_parse_compact_rejects_short_list() {
        assert!(LayerConfig::parse_compact("3#1_1_0_/a_0").is_err());
        assert!(LayerConfig::parse_compact("x#1_1_0_/a_0").is_err());
        assert!(LayerConfig::parse_compact("1#1_1_0").is_err());
    }

    #[test]
    fn test_default_tiers() {
        let tiers = Config::default_tiers(Path::new("/run"), None, Some(Path::new("/bb")), 1024.0);
        assert_eq!(tiers.len(), 4);
        assert_eq!(tiers[0].capacity_mb, 256.0);
        assert_eq!(tiers[1].mount, PathBuf::from("/run/nvme"));
        assert_eq!(tiers[2].mount, PathBuf::from("/bb/bb"));
        assert_eq!(tiers[3].bandwidth_mbps, 100.0);
    }
}
