#[cfg(not(feature = "server"))]
fn main() {
    eprintln!("Build with --features server to enable the HTTP node.");
}

#[cfg(feature = "server")]
use anyhow::{Context, Result};
#[cfg(feature = "server")]
use clap::Parser;
#[cfg(feature = "server")]
use std::path::PathBuf;

#[cfg(feature = "server")]
#[derive(Parser, Debug)]
#[command(name = "autus-node")]
#[command(version, about = "Deterministic state kernel with a REST API", long_about = None)]
struct Args {
    /// Node configuration file (constants, draft limits, server, storage).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the constants section with a standalone constants file.
    #[arg(long)]
    constants: Option<PathBuf>,

    /// Override the draft limits section with a standalone limits file.
    #[arg(long)]
    draft_limits: Option<PathBuf>,

    #[arg(long)]
    listen: Option<String>,

    /// Directory for the ledger snapshot.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Run without persistence even if the config names a data dir.
    #[arg(long, conflicts_with = "data_dir")]
    in_memory: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[cfg(feature = "server")]
#[tokio::main]
async fn main() -> Result<()> {
    use autus_core::config::{load_constants, load_draft_limits, NodeConfig};
    use autus_core::http;
    use autus_core::Kernel;
    use std::sync::Arc;
    use tracing::info;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut cfg = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(path) = &args.constants {
        cfg.constants = load_constants(path)
            .with_context(|| format!("failed to load constants {}", path.display()))?;
    }
    if let Some(path) = &args.draft_limits {
        cfg.draft_limits = load_draft_limits(path)
            .with_context(|| format!("failed to load draft limits {}", path.display()))?;
    }
    if let Some(addr) = args.listen {
        cfg.server.listen_addr = addr;
    }
    if args.data_dir.is_some() {
        cfg.storage.data_dir = args.data_dir;
    }
    if args.in_memory {
        cfg.storage.data_dir = None;
    }

    let kernel = Kernel::from_config(&cfg).context("failed to start kernel")?;
    let live = kernel.state();
    info!(
        tick = live.tick,
        cycle = live.cycle,
        stability = %live.stability,
        markers = kernel.ledger_len(),
        data_dir = ?cfg.storage.data_dir,
        "kernel ready"
    );

    http::serve(&cfg.server.listen_addr, Arc::new(kernel))
        .await
        .with_context(|| format!("http server on {} failed", cfg.server.listen_addr))
}
