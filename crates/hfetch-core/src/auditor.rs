//! File segment auditor
//!
//! Tracks, for every opened file, which byte ranges live where and how hot
//! they are. A file's registry maps non-overlapping logical segments to the
//! physical fragment holding them and their score; together the segments
//! tile the range seen when the file was first opened.
//!
//! Every change to a registry keeps the per-layer score index in step, so
//! the data manager can ask any layer for its coldest fragments.

use crate::layer_index::{IndexedFragment, LayerScoreIndex};
use crate::rpc::{AUDITOR_ENDPOINTS, AuditorEndpoints, AuditorRpc};
use dashmap::DashMap;
use hfetch_common::config::ScoreConfig;
use hfetch_common::{
    Error, Event, EventType, FileName, LayerId, LayerTable, PosixFile, Result, Segment,
    SegmentScore, shard_of,
};
use hfetch_dist::{DistributedHashMap, DistributedMap, ServerContext};
use hfetch_placement::{LayerScore, LayerScores};
use hfetch_storage::IoClientFactory;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const FILE_ACTIVE_STATUS: &str = "FILE_ACTIVE_STATUS";
const LAYER_SCORE_MAP: &str = "LAYER_SCORE_MAP";
const REGISTRY_CREATION: &str = "REGISTRY_CREATION";
const CREATE_OFFSET_MAP_BARRIER: &str = "CREATE_OFFSET_MAP";
const REGISTRY_CREATION_TIMEOUT: Duration = Duration::from_secs(30);

fn registry_name(filename: &FileName) -> String {
    format!("{filename}_SEGMENT")
}

/// Where a logical segment lives and how hot it is
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub location: PosixFile,
    pub score: SegmentScore,
}

impl RegistryEntry {
    /// The part of this entry covering `part` of its logical segment `key`
    fn narrowed(&self, key: &Segment, part: &Segment) -> Self {
        Self {
            location: relocate(&self.location, key, part),
            score: self.score,
        }
    }
}

/// `location` holds logical `key`; return the piece of it holding `part`
fn relocate(location: &PosixFile, key: &Segment, part: &Segment) -> PosixFile {
    let start = location.segment.start + (part.start - key.start);
    location.with_segment(Segment::new(start, start + (part.end - part.start)))
}

/// Segment registry of one file
pub struct FileRegistry {
    segments: DistributedMap<Segment, RegistryEntry>,
    /// Serializes read-modify-write cycles on `segments`
    update_lock: Mutex<()>,
}

impl FileRegistry {
    fn new(num_servers: u16) -> Self {
        Self {
            segments: DistributedMap::new(num_servers),
            update_lock: Mutex::new(()),
        }
    }
}

/// Segment heat and location registry
pub struct FileSegmentAuditor {
    ctx: ServerContext,
    layers: Arc<LayerTable>,
    io: Arc<IoClientFactory>,
    score: ScoreConfig,
    rpc: Arc<dyn AuditorRpc>,
    /// Registries this server has joined
    registries: DashMap<FileName, Arc<FileRegistry>>,
    active: Arc<DistributedHashMap<FileName, u32>>,
    index: Arc<LayerScoreIndex>,
}

impl FileSegmentAuditor {
    /// Create the auditor of `ctx.my_server` and make it reachable through
    /// the cluster's loopback transport.
    pub fn new(
        ctx: ServerContext,
        layers: Arc<LayerTable>,
        io: Arc<IoClientFactory>,
        score: ScoreConfig,
        rpc: Arc<dyn AuditorRpc>,
    ) -> Result<Arc<Self>> {
        let cluster = &ctx.cluster;
        let active = cluster.namespace(FILE_ACTIVE_STATUS, DistributedHashMap::new)?;
        let num_layers = layers.len();
        let index = cluster.namespace(LAYER_SCORE_MAP, || LayerScoreIndex::new(num_layers))?;

        let auditor = Arc::new(Self {
            ctx,
            layers,
            io,
            score,
            rpc,
            registries: DashMap::new(),
            active,
            index,
        });

        let endpoints = auditor
            .ctx
            .cluster
            .namespace(AUDITOR_ENDPOINTS, AuditorEndpoints::new)?;
        endpoints.insert(auditor.ctx.my_server, Arc::downgrade(&auditor));
        info!("File segment auditor ready on server {}", auditor.ctx.my_server);

        Ok(auditor)
    }

    #[must_use]
    pub fn layers(&self) -> &Arc<LayerTable> {
        &self.layers
    }

    #[must_use]
    pub const fn score_config(&self) -> &ScoreConfig {
        &self.score
    }

    fn registry(&self, filename: &FileName) -> Option<Arc<FileRegistry>> {
        if let Some(registry) = self.registries.get(filename) {
            return Some(Arc::clone(registry.value()));
        }
        let registry = self
            .ctx
            .cluster
            .lookup::<FileRegistry>(&registry_name(filename))?;
        self.registries
            .insert(filename.clone(), Arc::clone(&registry));
        Some(registry)
    }

    /// True once a registry exists for `filename`
    #[must_use]
    pub fn is_tracked(&self, filename: &FileName) -> bool {
        self.registry(filename).is_some()
    }

    /// Apply a batch of events in order.
    ///
    /// Every event is applied even if an earlier one failed; the first
    /// failure is returned.
    pub fn update(&self, events: &[Event]) -> Result<()> {
        let mut first_error = None;
        for event in events {
            let result = match event.event_type {
                EventType::Open => self.on_open(event),
                EventType::Close => {
                    self.on_close(event);
                    Ok(())
                }
                EventType::Read => self.on_read(event),
            };
            if let Err(e) = result {
                warn!(
                    "Failed to apply {:?} event for {} {}: {}",
                    event.event_type, event.filename, event.segment, e
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn on_open(&self, event: &Event) -> Result<()> {
        if !self.is_tracked(&event.filename) {
            self.sync_create_offset_map(event)?;
        }
        let count = self.active.upsert(event.filename.clone(), 0, |n| *n += 1);
        debug!("{} opened, {} active", event.filename, count);
        Ok(())
    }

    fn on_close(&self, event: &Event) {
        let count = self.active.upsert(event.filename.clone(), 0, |n| {
            if *n == 0 {
                warn!("Close of {} without matching open", event.filename);
            }
            *n = n.saturating_sub(1);
        });
        debug!("{} closed, {} active", event.filename, count);
    }

    /// True while some reader has `filename` open
    #[must_use]
    pub fn is_file_active(&self, filename: &FileName) -> bool {
        self.active.get(filename).is_some_and(|n| n > 0)
    }

    /// Create the registry of a newly opened file on every server
    fn sync_create_offset_map(&self, event: &Event) -> Result<()> {
        let creation = self
            .ctx
            .cluster
            .namespace(REGISTRY_CREATION, || Mutex::new(()))?;
        let _creating = creation.lock();
        if self.is_tracked(&event.filename) {
            return Ok(());
        }

        // Every peer must be up before anyone enters the barrier.
        for server in (0..self.ctx.num_servers).filter(|s| *s != self.ctx.my_server) {
            self.rpc.ping(server)?;
        }

        info!(
            "Creating registry for {} {} on layer {}",
            event.filename, event.segment, event.layer
        );
        thread::scope(|scope| {
            let handles: Vec<_> = (0..self.ctx.num_servers)
                .map(|server| {
                    scope.spawn(move || {
                        if server == self.ctx.my_server {
                            self.create_offset_map(event)
                        } else {
                            self.rpc.create_offset_map(server, event)
                        }
                    })
                })
                .collect();

            let mut result = Ok(());
            for handle in handles {
                let outcome = handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::internal("registry creation panicked")));
                if result.is_ok() {
                    result = outcome;
                }
            }
            result
        })
    }

    /// One server's part of registry creation: rendezvous with the other
    /// servers, join the shared registry (server 0 installs the canonical
    /// entry), rendezvous again.
    ///
    /// Fails with [`Error::Timeout`] if some server does not show up.
    pub fn create_offset_map(&self, event: &Event) -> Result<()> {
        let barrier = self
            .ctx
            .cluster
            .barrier(CREATE_OFFSET_MAP_BARRIER, usize::from(self.ctx.num_servers));
        barrier.wait(REGISTRY_CREATION_TIMEOUT)?;
        let result = self.join_registry(event);
        let released = barrier.wait(REGISTRY_CREATION_TIMEOUT);
        result.and(released)
    }

    fn join_registry(&self, event: &Event) -> Result<()> {
        let num_servers = self.ctx.num_servers;
        let registry = self
            .ctx
            .cluster
            .namespace(&registry_name(&event.filename), || FileRegistry::new(num_servers))?;

        if self.ctx.my_server == 0 {
            let entry = RegistryEntry {
                location: PosixFile::new(event.filename.clone(), event.segment, event.layer),
                score: SegmentScore::with_kind(self.score.kind),
            };
            if registry.segments.insert_if_absent(event.segment, entry.clone()) {
                self.index.insert(
                    entry.score.value(),
                    &event.filename,
                    event.segment,
                    &entry.location,
                )?;
            }
        }

        self.registries.insert(event.filename.clone(), registry);
        Ok(())
    }

    fn on_read(&self, event: &Event) -> Result<()> {
        let Some(registry) = self.registry(&event.filename) else {
            debug!("Read of untracked file {}", event.filename);
            return Ok(());
        };
        let _updating = registry.update_lock.lock();

        let hits = registry
            .segments
            .filter(|key, _| key.overlaps(&event.segment));
        for (key, entry) in hits {
            self.split_off(&registry, &event.filename, &key, &entry, &event.segment)?;

            let Some(common) = key.intersect(&event.segment) else {
                continue;
            };
            let mut updated = entry.narrowed(&key, &common);
            updated.score.record_access(event.time, self.score.lambda);
            debug!(
                "{} {} score {} -> {}",
                event.filename,
                common,
                entry.score.value(),
                updated.score.value()
            );
            self.store(&registry, &event.filename, common, updated)?;
        }
        Ok(())
    }

    /// Remove `key` from the registry and the index, re-inserting the parts
    /// of it outside `range` unchanged.
    fn split_off(
        &self,
        registry: &FileRegistry,
        filename: &FileName,
        key: &Segment,
        entry: &RegistryEntry,
        range: &Segment,
    ) -> Result<()> {
        registry.segments.erase(key);
        self.index
            .remove(entry.location.layer, entry.score.value(), filename, *key)?;

        for left in key.subtract(range) {
            self.store(registry, filename, left, entry.narrowed(key, &left))?;
        }
        Ok(())
    }

    fn store(
        &self,
        registry: &FileRegistry,
        filename: &FileName,
        key: Segment,
        entry: RegistryEntry,
    ) -> Result<()> {
        self.index
            .insert(entry.score.value(), filename, key, &entry.location)?;
        registry.segments.put(key, entry);
        Ok(())
    }

    /// Record that the bytes of logical range `source` now live at
    /// `destination`. Scores are unchanged.
    pub fn update_on_move(&self, source: &PosixFile, destination: &PosixFile) -> Result<()> {
        let registry = self
            .registry(&source.filename)
            .ok_or_else(|| Error::FileNotTracked(source.filename.to_string()))?;
        let _updating = registry.update_lock.lock();

        let hits = registry
            .segments
            .filter(|key, _| key.overlaps(&source.segment));
        for (key, entry) in hits {
            self.split_off(&registry, &source.filename, &key, &entry, &source.segment)?;

            let Some(common) = key.intersect(&source.segment) else {
                continue;
            };
            let moved = RegistryEntry {
                location: relocate(destination, &source.segment, &common),
                score: entry.score,
            };
            debug!(
                "{} {} moved to {} {} on layer {}",
                source.filename, common, moved.location.filename, moved.location.segment, moved.location.layer
            );
            self.store(&registry, &source.filename, common, moved)?;
        }
        Ok(())
    }

    /// All fragments of `filename`, hottest first
    #[must_use]
    pub fn fetch_heat_map(&self, filename: &FileName) -> Vec<(Segment, SegmentScore, PosixFile)> {
        let mut heat_map: Vec<_> = self
            .fragments(filename)
            .into_iter()
            .map(|(key, entry)| (key, entry.score, entry.location))
            .collect();
        // Stable sort keeps equally hot fragments in file order.
        heat_map.sort_by(|a, b| a.1.cmp_heat(&b.1));
        heat_map
    }

    /// Registry of `filename` in file order
    #[must_use]
    pub fn fragments(&self, filename: &FileName) -> Vec<(Segment, RegistryEntry)> {
        self.registry(filename)
            .map(|registry| registry.segments.get_all())
            .unwrap_or_default()
    }

    /// Registry entry stored under exactly `key`
    #[must_use]
    pub fn fragment(&self, filename: &FileName, key: &Segment) -> Option<RegistryEntry> {
        self.registry(filename)?.segments.get(key)
    }

    /// Heat and free space of every layer
    ///
    /// The last layer holds the canonical copies and is reported as
    /// unbounded.
    pub fn fetch_layer_scores(&self) -> Result<LayerScores> {
        let mut scores = LayerScores::new();
        for layer in self.layers.iter() {
            let (min_score, max_score) = self.index.bounds(layer.id)?;
            let remaining_capacity = if self.layers.is_last(layer.id) {
                u64::MAX
            } else {
                let used = self.io.current_usage(layer.id)?;
                layer.capacity_bytes().saturating_sub(used)
            };
            scores.insert(
                layer.id,
                LayerScore {
                    min_score,
                    max_score,
                    remaining_capacity,
                },
            );
        }
        Ok(scores)
    }

    /// Fragments on `layer`, coldest first
    pub fn layer_fragments(&self, layer: LayerId) -> Result<Vec<IndexedFragment>> {
        self.index.coldest_first(layer)
    }

    /// Physical fragments covering `file.segment`, paired with the range
    /// each one fills in a contiguous buffer starting at offset 0.
    ///
    /// Asks the owning server when the file belongs to another shard.
    pub fn get_data_location(&self, file: &PosixFile) -> Result<Vec<(PosixFile, PosixFile)>> {
        let owner = shard_of(&file.filename, self.ctx.num_servers);
        if owner == self.ctx.my_server {
            self.locate(file)
        } else {
            debug!("Forwarding location of {} to server {}", file.filename, owner);
            self.rpc.get_data_location(owner, file)
        }
    }

    /// Local answer to [`Self::get_data_location`]
    pub fn locate(&self, file: &PosixFile) -> Result<Vec<(PosixFile, PosixFile)>> {
        let registry = self
            .registry(&file.filename)
            .ok_or_else(|| Error::FileNotTracked(file.filename.to_string()))?;

        let mut offset = 0i64;
        let hits = registry
            .segments
            .filter(|key, _| key.overlaps(&file.segment));
        let mut locations = Vec::with_capacity(hits.len());
        for (key, entry) in hits {
            let Some(common) = key.intersect(&file.segment) else {
                continue;
            };
            let source = relocate(&entry.location, &key, &common);
            let len = common.end - common.start;
            let destination = source.with_segment(Segment::new(offset, offset + len));
            offset += len + 1;
            locations.push((source, destination));
        }
        Ok(locations)
    }
}
