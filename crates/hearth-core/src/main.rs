use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;

use hearth_core::config::{Config, DispatchModel, TriggerMode};
use hearth_core::error::{HearthError, HearthResult};
use hearth_core::server::Server;
use hearth_store::{MemoryBackend, StorePool};

/// Epoll-driven HTTP/1.1 static file and login server.
#[derive(Debug, Parser)]
#[command(name = "hearth", version)]
struct Cli {
    /// JSON configuration file; CLI flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, env = "HEARTH_HOST")]
    host: Option<String>,

    #[arg(short, long, env = "HEARTH_PORT")]
    port: Option<u16>,

    /// Worker threads (default: one per CPU)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Document root served to clients
    #[arg(long, env = "HEARTH_DOC_ROOT")]
    doc_root: Option<PathBuf>,

    /// I/O ownership model
    #[arg(long, value_enum)]
    dispatch: Option<DispatchModel>,

    /// Readiness notification mode for client sockets
    #[arg(long, value_enum)]
    trigger: Option<TriggerMode>,

    /// Idle-sweep interval in seconds
    #[arg(long)]
    timeslot: Option<u64>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    if let Err(e) = run() {
        tracing::error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

fn run() -> HearthResult<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(doc_root) = cli.doc_root {
        config.doc_root = doc_root;
    }
    if let Some(dispatch) = cli.dispatch {
        config.dispatch = dispatch;
    }
    if let Some(trigger) = cli.trigger {
        config.trigger = trigger;
    }
    if let Some(timeslot) = cli.timeslot {
        config.timeslot_secs = timeslot;
    }

    let store = Arc::new(StorePool::new(
        Arc::new(MemoryBackend::new()),
        config.store_connections,
    )?);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        })
        .map_err(|e| HearthError::Config(format!("signal handler: {}", e)))?;
    }

    let server = Server::bind(config, store)?;
    tracing::info!(addr = %server.local_addr(), "hearth listening");
    server.serve(shutdown)
}
