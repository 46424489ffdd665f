//! Riverbed Controller - stream metadata and scaling daemon
//!
//! Opens the metadata store and the local segment containers, resumes any
//! stream operation left unfinished by a previous run, then processes scale
//! events until interrupted.

use anyhow::Result;
use clap::Parser;
use riverbed_common::Config;
use riverbed_common::config::{LogFormat, StoreBackend};
use riverbed_container::ContainerDirectory;
use riverbed_meta_store::{KvStore, MemoryKvStore, MetaStore};
use riverbed_stream::{
    ChannelEventWriter, ContainerProvisioner, NoTransactions, ScaleEventProcessor,
    StreamMetadataStore, StreamMetadataTasks,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "riverbed-controller")]
#[command(about = "Riverbed stream metadata controller")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/riverbed/controller.toml")]
    config: String,

    /// Metadata store path (redb backend)
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Metadata store backend: redb or memory
    #[arg(long)]
    backend: Option<String>,

    /// Host identifier recorded on scale operations
    #[arg(long, env = "RIVERBED_HOST_ID")]
    host_id: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

fn parse_backend(value: &str) -> Result<StoreBackend> {
    match value.to_ascii_lowercase().as_str() {
        "redb" => Ok(StoreBackend::Redb),
        "memory" => Ok(StoreBackend::Memory),
        other => Err(anyhow::anyhow!(
            "unknown store backend {other}, expected redb or memory"
        )),
    }
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn KvStore>> {
    match config.store.backend {
        StoreBackend::Redb => {
            if let Some(parent) = config.store.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            info!("Opening metadata store at {}", config.store.path.display());
            let store: Arc<dyn KvStore> = Arc::new(MetaStore::open(&config.store.path)?);
            Ok(store)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory metadata store; state is lost on exit");
            let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
            Ok(store)
        }
    }
}

fn open_containers(config: &Config) -> Result<Vec<Arc<ContainerDirectory>>> {
    std::fs::create_dir_all(&config.container.log_dir)?;
    (0..config.container.container_count)
        .map(|id| {
            let container = ContainerDirectory::open(id, &config.container)?;
            info!(
                "Container {} recovered with {} active segment(s)",
                id,
                container.metadata().active_segment_count()
            );
            Ok::<_, anyhow::Error>(Arc::new(container))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load config file, then let CLI flags override it
    let mut config = Config::load(&args.config)?;
    if let Some(path) = args.store_path {
        config.store.path = path;
    }
    if let Some(backend) = args.backend.as_deref() {
        config.store.backend = parse_backend(backend)?;
    }
    if let Some(host_id) = args.host_id {
        config.controller.host_id = host_id;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging.level, config.logging.format);

    info!("Starting Riverbed controller");
    info!("Config file: {}", args.config);
    info!("Host id: {}", config.controller.host_id);

    let kv = open_store(&config)?;
    let store = Arc::new(StreamMetadataStore::new(kv));
    info!("Metadata store backend: {}", store.backend());

    let containers = open_containers(&config)?;
    let tasks = Arc::new(StreamMetadataTasks::new(
        Arc::clone(&store),
        Arc::new(NoTransactions),
        Arc::new(ContainerProvisioner::new(containers.clone())),
        config.scale.clone(),
        config.controller.host_id.clone(),
    ));

    let (writer, rx) = ChannelEventWriter::new(config.scale.event_queue_capacity);
    tasks.set_request_event_writer(Arc::new(writer));
    let processor = tokio::spawn(ScaleEventProcessor::new(Arc::clone(&tasks), rx).run());

    match tasks.resume_pending_scales().await {
        Ok(0) => info!("No pending stream operations"),
        Ok(n) => info!("Resumed {} pending stream operation(s)", n),
        Err(e) => error!("Failed to scan for pending stream operations: {}", e),
    }

    info!("Controller ready");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    processor.abort();
    for container in &containers {
        if let Err(e) = container.checkpoint().and_then(|_| container.truncate_log()) {
            warn!(
                "Checkpoint of container {} failed: {}",
                container.metadata().container_id(),
                e
            );
        }
    }
    info!("Final metrics:\n{}", tasks.metrics().render_prometheus());

    Ok(())
}
