//! HFetch server
//!
//! Wires the components of one server together and runs its worker pool.
//! Events pushed to any server are routed to the server owning the file and,
//! there, to the lane of the one worker that handles every event of that
//! file. Each worker drains batches from its own lane into the event
//! manager. A monitor thread feeds what the hardware monitor observes into
//! the same lanes.
//!
//! Servers of one cluster share their I/O clients and the per-layer
//! capacity locks, since they share the layers as well.

use crate::auditor::FileSegmentAuditor;
use crate::data_manager::{CapacityLocks, DataManager};
use crate::event_manager::EventManager;
use crate::monitor::{HardwareMonitor, MountMonitor};
use crate::rpc::{LoopbackRpc, RetryPolicy, RetryingRpc};
use hfetch_common::{Config, Error, Event, LayerTable, Result, lane_of, shard_of};
use hfetch_dist::{DistributedQueue, GlobalClock, GlobalSequence, ServerContext};
use hfetch_placement::DpeFactory;
use hfetch_storage::IoClientFactory;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn};

const EVENT_QUEUE: &str = "HFETCH_EVENTS";
const BUFFER_SEQUENCE: &str = "BUFFER_SEQUENCE";
const GLOBAL_CLOCK: &str = "GLOBAL_CLOCK";
const IO_CLIENTS: &str = "IO_CLIENTS";
const CAPACITY_LOCKS: &str = "CAPACITY_LOCKS";

struct Worker {
    exit: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// Stamps events with the global clock and queues them on their lane
struct EventRouter {
    events: Arc<DistributedQueue<Event>>,
    clock: Arc<GlobalClock>,
    num_servers: u16,
}

impl EventRouter {
    fn push(&self, event: Event) -> Result<()> {
        let event = event.at(self.clock.now());
        let owner = shard_of(&event.filename, self.num_servers);
        let lane = lane_of(&event.filename, self.num_servers, self.events.lanes());
        debug!(
            "Queueing {:?} {} {} on server {} lane {}",
            event.event_type, event.filename, event.segment, owner, lane
        );
        self.events.push(owner, lane, event)
    }
}

/// One server of an HFetch group
pub struct Server {
    ctx: ServerContext,
    config: Config,
    io: Arc<IoClientFactory>,
    auditor: Arc<FileSegmentAuditor>,
    data_manager: Arc<DataManager>,
    event_manager: Arc<EventManager>,
    router: Arc<EventRouter>,
    monitor: Option<Arc<dyn HardwareMonitor>>,
    workers: Mutex<Vec<Worker>>,
}

impl Server {
    /// Build every component of server `ctx.my_server` from `config`
    pub fn new(config: Config, ctx: ServerContext) -> Result<Self> {
        config.validate()?;
        let cluster = Arc::clone(&ctx.cluster);
        let num_servers = ctx.num_servers;

        let table = LayerTable::from_configs(&config.layers)?;
        let io = cluster.namespace(IO_CLIENTS, || IoClientFactory::new(Arc::new(table)))?;
        let layers = Arc::clone(io.layers());
        if layers.len() != config.layers.len() {
            return Err(Error::configuration(format!(
                "server {} configures {} layers, the cluster has {}",
                ctx.my_server,
                config.layers.len(),
                layers.len()
            )));
        }

        let lanes = config.server.num_workers.max(1);
        let events = cluster.namespace(EVENT_QUEUE, || DistributedQueue::new(num_servers, lanes))?;
        if events.lanes() != lanes {
            return Err(Error::configuration(format!(
                "server {} runs {} workers, the cluster queue has {} lanes",
                ctx.my_server,
                lanes,
                events.lanes()
            )));
        }

        let rpc = Arc::new(RetryingRpc::new(
            LoopbackRpc::new(Arc::clone(&cluster)),
            RetryPolicy::from(&config.rpc),
        ));
        let auditor = FileSegmentAuditor::new(
            ctx.clone(),
            Arc::clone(&layers),
            Arc::clone(&io),
            config.score.clone(),
            rpc,
        )?;

        let sequence = cluster.namespace(BUFFER_SEQUENCE, GlobalSequence::new)?;
        let clock = cluster.namespace(GLOBAL_CLOCK, GlobalClock::new)?;
        let capacity_locks =
            cluster.namespace(CAPACITY_LOCKS, || CapacityLocks::new(layers.len()))?;

        let data_manager = Arc::new(DataManager::new(
            Arc::clone(&io),
            Arc::clone(&auditor),
            sequence,
            capacity_locks,
        ));
        let dpe = DpeFactory::engine(config.placement.engine);
        info!(
            "Server {}/{} using {} placement over {} layers",
            ctx.my_server,
            num_servers,
            dpe.name(),
            layers.len()
        );
        let event_manager = Arc::new(EventManager::new(
            Arc::clone(&auditor),
            Arc::clone(&data_manager),
            dpe,
        ));

        let monitor = if config.server.monitor_interval_ms > 0 {
            MountMonitor::for_last_layer(&layers, ctx.my_server, num_servers)
                .map(|monitor| Arc::new(monitor) as Arc<dyn HardwareMonitor>)
        } else {
            None
        };

        Ok(Self {
            ctx,
            config,
            io,
            auditor,
            data_manager,
            event_manager,
            router: Arc::new(EventRouter {
                events,
                clock,
                num_servers,
            }),
            monitor,
            workers: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub const fn id(&self) -> u16 {
        self.ctx.my_server
    }

    #[must_use]
    pub fn auditor(&self) -> &Arc<FileSegmentAuditor> {
        &self.auditor
    }

    #[must_use]
    pub fn data_manager(&self) -> &Arc<DataManager> {
        &self.data_manager
    }

    #[must_use]
    pub fn io(&self) -> &Arc<IoClientFactory> {
        &self.io
    }

    /// Stamp `event` with the global clock and queue it on the server
    /// owning its file.
    pub fn push_event(&self, event: Event) -> Result<()> {
        self.router.push(event)
    }

    /// Events waiting in this server's queue
    pub fn pending_events(&self) -> Result<usize> {
        self.router.events.len(self.ctx.my_server)
    }

    /// Spawn the worker pool and the monitor thread; a no-op if they are
    /// already running
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }

        let server = self.ctx.my_server;
        let max_batch = self.config.server.max_batch_events;
        let poll_interval = Duration::from_millis(self.config.server.poll_interval_ms);

        for lane in 0..self.router.events.lanes() {
            let exit = Arc::new(AtomicBool::new(false));
            let worker_exit = Arc::clone(&exit);
            let router = Arc::clone(&self.router);
            let event_manager = Arc::clone(&self.event_manager);

            let handle = thread::Builder::new()
                .name(format!("hfetch-{server}-{lane}"))
                .spawn(move || {
                    let _span = info_span!("worker", server, id = lane).entered();
                    debug!("Worker started");

                    while !worker_exit.load(Ordering::Acquire) {
                        let batch = match router.events.pop_batch(server, lane, max_batch) {
                            Ok(batch) => batch,
                            Err(e) => {
                                error!("Failed to pop events: {}", e);
                                break;
                            }
                        };
                        if batch.is_empty() {
                            thread::sleep(poll_interval);
                            continue;
                        }
                        if let Err(e) = event_manager.handle(&batch) {
                            error!("Failed to handle {} events: {}", batch.len(), e);
                        }
                    }

                    debug!("Worker stopped");
                })?;
            workers.push(Worker { exit, handle });
        }

        if let Some(monitor) = &self.monitor {
            workers.push(self.spawn_monitor(Arc::clone(monitor))?);
        }

        info!("Server {} started {} threads", server, workers.len());
        Ok(())
    }

    fn spawn_monitor(&self, monitor: Arc<dyn HardwareMonitor>) -> Result<Worker> {
        let server = self.ctx.my_server;
        let interval = Duration::from_millis(self.config.server.monitor_interval_ms);
        let exit = Arc::new(AtomicBool::new(false));
        let monitor_exit = Arc::clone(&exit);
        let router = Arc::clone(&self.router);

        let handle = thread::Builder::new()
            .name(format!("hfetch-{server}-monitor"))
            .spawn(move || {
                let _span = info_span!("monitor", server).entered();
                debug!("Monitor started");

                while !monitor_exit.load(Ordering::Acquire) {
                    match monitor.fetch_events() {
                        Ok(events) => {
                            for event in events {
                                if let Err(e) = router.push(event) {
                                    warn!("Failed to queue monitor event: {}", e);
                                }
                            }
                        }
                        Err(e) => warn!("Monitor scan failed: {}", e),
                    }
                    // Woken early by stop().
                    thread::park_timeout(interval);
                }

                debug!("Monitor stopped");
            })?;
        Ok(Worker { exit, handle })
    }

    /// Signal every thread and wait for it to finish its current batch
    pub fn stop(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for worker in &workers {
            worker.exit.store(true, Ordering::Release);
            worker.handle.thread().unpark();
        }
        for worker in workers {
            if worker.handle.join().is_err() {
                error!("Thread of server {} panicked", self.ctx.my_server);
            }
        }
        info!("Server {} stopped", self.ctx.my_server);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hfetch_common::config::LayerConfig;
    use hfetch_common::{FileName, LayerId, MB, PosixFile, Segment};
    use hfetch_dist::LocalCluster;
    use std::time::Instant;

    fn config(layers: Vec<LayerConfig>, num_servers: u16) -> Config {
        let mut config = Config::default();
        config.layers = layers;
        config.server.num_servers = num_servers;
        config.server.num_workers = 2;
        config.server.max_batch_events = 4;
        config.server.monitor_interval_ms = 0;
        config
    }

    fn memory_layers() -> Vec<LayerConfig> {
        vec![
            LayerConfig::memory(1.0, 80_000.0),
            LayerConfig::memory(64.0, 100.0),
        ]
    }

    fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn write_canonical(io: &IoClientFactory, name: &FileName, data: &[u8]) {
        let last = io.layers().last().id;
        let mut blob = PosixFile::new(
            name.clone(),
            Segment::from_offset_len(0, data.len() as i64),
            last,
        );
        blob.data = Bytes::copy_from_slice(data);
        io.client(last).unwrap().write(&blob, &blob).unwrap();
    }

    fn group(num_servers: u16, layers: Vec<LayerConfig>) -> Vec<Server> {
        let cluster = Arc::new(LocalCluster::new(num_servers));
        (0..num_servers)
            .map(|id| {
                let ctx = ServerContext::new(id, Arc::clone(&cluster)).unwrap();
                Server::new(config(layers.clone(), num_servers), ctx).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = Server::new(Config::default(), ServerContext::standalone());
        assert!(result.is_err());
    }

    #[test]
    fn test_end_to_end_on_posix_layers() {
        let fast = tempfile::tempdir().unwrap();
        let slow = tempfile::tempdir().unwrap();
        let server = Server::new(
            config(
                vec![
                    LayerConfig::posix(fast.path(), 1.0, 2_000.0),
                    LayerConfig::posix(slow.path(), 64.0, 100.0),
                ],
                1,
            ),
            ServerContext::standalone(),
        )
        .unwrap();

        let name = FileName::new("/data/input.bin").unwrap();
        let contents: Vec<u8> = (0..16_384u32).map(|i| (i % 251) as u8).collect();
        write_canonical(server.io(), &name, &contents);

        server.start().unwrap();
        let whole = Segment::new(0, 16_383);
        let hot = Segment::new(4096, 8191);
        server
            .push_event(Event::open(name.clone(), whole, LayerId(1)))
            .unwrap();
        server
            .push_event(Event::read(name.clone(), hot, LayerId(1)))
            .unwrap();

        let auditor = Arc::clone(server.auditor());
        wait_for("prefetch", || {
            auditor
                .fragment(&name, &hot)
                .is_some_and(|entry| entry.location.layer == LayerId(0))
        });
        assert!(auditor.is_file_active(&name));

        // Stitch the hot range back from wherever the auditor says it is.
        let request = PosixFile::new(name.clone(), Segment::new(4000, 8299), LayerId(1));
        let mut stitched = Vec::new();
        for (source, _) in auditor.get_data_location(&request).unwrap() {
            let mut buffer = source.clone();
            server
                .io()
                .client(source.layer)
                .unwrap()
                .read(&source, &mut buffer)
                .unwrap();
            stitched.extend_from_slice(&buffer.data);
        }
        assert_eq!(stitched, contents[4000..=8299]);

        server
            .push_event(Event::close(name.clone(), whole, LayerId(1)))
            .unwrap();
        wait_for("close", || !auditor.is_file_active(&name));
        server.stop();
        assert_eq!(server.pending_events().unwrap(), 0);
    }

    #[test]
    fn test_events_route_to_owning_server() {
        let servers = group(2, memory_layers());

        let names: Vec<FileName> = (0..8)
            .map(|i| FileName::new(format!("file-{i}")).unwrap())
            .collect();
        for name in &names {
            write_canonical(servers[0].io(), name, &[1u8; 1024]);
        }

        // Every event goes through server 0, wherever the file lives.
        for name in &names {
            servers[0]
                .push_event(Event::open(name.clone(), Segment::new(0, 1023), LayerId(1)))
                .unwrap();
        }
        for name in &names {
            let owner = shard_of(name, 2);
            assert!(servers[usize::from(owner)].pending_events().unwrap() > 0);
        }

        for server in &servers {
            server.start().unwrap();
        }
        for name in &names {
            let auditor = Arc::clone(servers[1].auditor());
            wait_for("registry", || auditor.is_tracked(name));
            assert!(servers[0].auditor().is_tracked(name));
            assert_eq!(servers[0].auditor().fragments(name).len(), 1);
        }
        for server in &servers {
            server.stop();
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let server = Server::new(config(memory_layers(), 1), ServerContext::standalone()).unwrap();
        server.start().unwrap();
        server.start().unwrap();
        server.stop();
        server.stop();
        assert_eq!(server.id(), 0);
    }

    #[test]
    fn test_events_of_a_file_stay_in_order_across_workers() {
        let mut config = config(memory_layers(), 1);
        config.server.num_workers = 4;
        config.server.max_batch_events = 1;
        let server = Server::new(config, ServerContext::standalone()).unwrap();

        let names: Vec<FileName> = (0..200)
            .map(|i| FileName::new(format!("ordered-{i}")).unwrap())
            .collect();
        for name in &names {
            write_canonical(server.io(), name, &[5u8; 1024]);
        }

        server.start().unwrap();
        let whole = Segment::new(0, 1023);
        let head = Segment::new(0, 511);
        for name in &names {
            server
                .push_event(Event::open(name.clone(), whole, LayerId(1)))
                .unwrap();
            server
                .push_event(Event::read(name.clone(), head, LayerId(1)))
                .unwrap();
            server
                .push_event(Event::close(name.clone(), whole, LayerId(1)))
                .unwrap();
        }

        // A read handled before its open would be lost, a close before its
        // open would leave the file active.
        let auditor = Arc::clone(server.auditor());
        wait_for("every file read once and closed", || {
            names.iter().all(|name| {
                !auditor.is_file_active(name)
                    && auditor
                        .fragment(name, &head)
                        .is_some_and(|entry| entry.score.frequency == 1)
            })
        });
        server.stop();
        assert_eq!(server.pending_events().unwrap(), 0);
    }

    #[test]
    fn test_servers_share_layer_usage() {
        let layers = vec![
            LayerConfig::memory(4096.0 / MB as f64, 80_000.0),
            LayerConfig::memory(64.0, 100.0),
        ];
        let servers = group(2, layers);
        assert!(Arc::ptr_eq(servers[0].io(), servers[1].io()));

        let name = FileName::new("a").unwrap();
        let whole = Segment::new(0, 4095);
        write_canonical(servers[0].io(), &name, &[9u8; 4096]);
        let auditor = servers[0].auditor();
        auditor
            .update(&[
                Event::open(name.clone(), whole, LayerId(1)),
                Event::read(name.clone(), whole, LayerId(1)).at(1),
            ])
            .unwrap();

        // Server 0 promotes the file to layer 0.
        let manager = servers[0].data_manager();
        let entry = auditor.fragment(&name, &whole).unwrap();
        let destination = PosixFile::new(
            manager.generate_buffer_filename().unwrap(),
            whole,
            LayerId(0),
        );
        let logical = PosixFile::new(name.clone(), whole, LayerId(1));
        manager
            .prefetch(&logical, &entry.location, &destination)
            .unwrap();
        for server in &servers {
            assert_eq!(server.io().current_usage(LayerId(0)).unwrap(), 4096);
        }

        // Server 1 sees the full layer and can evict what server 0 put there.
        servers[1]
            .data_manager()
            .make_capacity(4096, 10.0, LayerId(0))
            .unwrap();
        let entry = servers[1].auditor().fragment(&name, &whole).unwrap();
        assert_eq!(entry.location, PosixFile::new(name, whole, LayerId(1)));
        assert_eq!(servers[0].io().current_usage(LayerId(0)).unwrap(), 0);
    }

    #[test]
    fn test_monitor_registers_files_on_last_layer() {
        let fast = tempfile::tempdir().unwrap();
        let slow = tempfile::tempdir().unwrap();
        let mut config = config(
            vec![
                LayerConfig::posix(fast.path(), 1.0, 2_000.0),
                LayerConfig::posix(slow.path(), 64.0, 100.0),
            ],
            1,
        );
        config.server.monitor_interval_ms = 5;
        let server = Server::new(config, ServerContext::standalone()).unwrap();
        server.start().unwrap();

        // Staged elsewhere so the file appears complete.
        let staging = tempfile::tempdir_in(slow.path().parent().unwrap()).unwrap();
        std::fs::write(staging.path().join("arrived.h5"), [4u8; 3000]).unwrap();
        std::fs::rename(
            staging.path().join("arrived.h5"),
            slow.path().join("arrived.h5"),
        )
        .unwrap();
        let name = FileName::new("arrived.h5").unwrap();
        let auditor = Arc::clone(server.auditor());
        wait_for("monitor event", || auditor.is_tracked(&name));
        wait_for("monitor close", || !auditor.is_file_active(&name));

        let fragments = auditor.fragments(&name);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].0, Segment::new(0, 2999));

        // A reader can use the registry the monitor created.
        server
            .push_event(Event::read(name.clone(), Segment::new(0, 999), LayerId(1)))
            .unwrap();
        wait_for("read", || {
            auditor
                .fragment(&name, &Segment::new(0, 999))
                .is_some_and(|entry| entry.score.frequency == 1)
        });
        server.stop();
    }
}
