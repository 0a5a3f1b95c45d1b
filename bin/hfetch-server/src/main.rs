//! HFetch server
//!
//! Hosts every server of an HFetch group on one in-process cluster and runs
//! their worker pools until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use hfetch_common::Config;
use hfetch_common::config::LayerConfig;
use hfetch_core::Server;
use hfetch_dist::{LocalCluster, ServerContext};
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "hfetch-server")]
#[command(about = "HFetch hierarchical data prefetching server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of servers in the group
    #[arg(long)]
    num_servers: Option<u16>,

    /// Worker threads per server
    #[arg(long)]
    workers: Option<usize>,

    /// Layers in compact form: <count>#<cap_mb>_<bw_mbps>_<is_memory>_<mount>_<direct_io>#...
    #[arg(long)]
    layers: Option<String>,

    /// Log level used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Root of the default layer hierarchy
    #[arg(long, env = "RUN_DIR", default_value = "/tmp/hfetch")]
    run_dir: PathBuf,

    /// Mount root of the default NVMe layer
    #[arg(long, env = "NVME_RUN_DIR")]
    nvme_run_dir: Option<PathBuf>,

    /// Mount root of the default burst buffer layer
    #[arg(long, env = "BB_RUN_DIR")]
    bb_run_dir: Option<PathBuf>,

    /// Expected I/O volume (MB) sizing the default layers
    #[arg(long, default_value = "1024")]
    io_size_mb: f64,
}

/// File configuration with command-line overrides applied
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(num_servers) = args.num_servers {
        config.server.num_servers = num_servers;
    }
    if let Some(workers) = args.workers {
        config.server.num_workers = workers;
    }
    if let Some(layers) = &args.layers {
        config.layers = LayerConfig::parse_compact(layers)?;
    }
    if config.layers.is_empty() {
        config.layers = Config::default_tiers(
            &args.run_dir,
            args.nvme_run_dir.as_deref(),
            args.bb_run_dir.as_deref(),
            args.io_size_mb,
        );
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    let file_layer = match &config.logging.file {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let path = dir.join("hfetch.log");
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };
    let stderr_layer = file_layer.is_none().then(fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config)?;

    info!("Starting HFetch");
    for (i, layer) in config.layers.iter().enumerate() {
        info!(
            "Layer {}: {:?} {} MB at {} MB/s, mount {}",
            i,
            layer.kind,
            layer.capacity_mb,
            layer.bandwidth_mbps,
            layer.mount.display()
        );
    }

    let num_servers = config.server.num_servers;
    let cluster = Arc::new(LocalCluster::new(num_servers));
    let servers = (0..num_servers)
        .map(|id| {
            let mut server_config = config.clone();
            server_config.server.id = id;
            let ctx = ServerContext::new(id, Arc::clone(&cluster))?;
            Ok(Server::new(server_config, ctx)?)
        })
        .collect::<Result<Vec<_>>>()?;

    for server in &servers {
        server.start()?;
    }
    info!("{} servers running", servers.len());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    for server in &servers {
        server.stop();
    }
    Ok(())
}
