//! kkv - A Slab-Backed Key/Value Store
//!
//! Entry point for the kkv server. Sets up logging, the engine, the
//! background reclaimer and the worker lanes, then listens until Ctrl+C.

use anyhow::Context;
use clap::Parser;
use kkv::connection::{Server, ServerConfig};
use kkv::storage::{Engine, EngineConfig, ReclaimConfig, Reclaimer};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// kkv - A slab-backed key/value store
#[derive(Parser, Debug)]
#[command(name = "kkv")]
#[command(version = kkv::VERSION)]
#[command(about = "A slab-backed key/value store served over a compact binary protocol", long_about = None)]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = kkv::DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = kkv::DEFAULT_PORT)]
    port: u16,

    /// Worker lanes (0 = one per CPU)
    #[arg(long, default_value_t = 0)]
    lanes: usize,

    /// Per-connection request/response buffer size in bytes
    #[arg(long, default_value_t = kkv::connection::session::DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Retired records held before reclamation is forced
    #[arg(long, default_value_t = kkv::storage::retire::DEFAULT_RETIRE_CAPACITY)]
    retire_capacity: usize,

    /// Cap on slabs held by the allocator (unbounded if omitted)
    #[arg(long)]
    max_slabs: Option<usize>,

    /// Background reclamation interval in milliseconds (0 disables it)
    #[arg(long, default_value_t = 1000)]
    reclaim_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log: String,
}

impl Args {
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn setup_logging(args: &Args) {
    let level = args.log.parse::<Level>().unwrap_or(Level::INFO);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn print_banner(addr: SocketAddr, lanes: usize) {
    println!(
        r#"
kkv v{} - Slab-Backed Key/Value Store
──────────────────────────────────────────
Listening on {} with {} worker lanes
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        kkv::VERSION,
        addr,
        lanes
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(&args);

    let addr: SocketAddr = args
        .bind_address()
        .parse()
        .with_context(|| format!("invalid listen address {}", args.bind_address()))?;

    // Create the storage engine (shared across all lanes)
    let engine = Arc::new(Engine::with_config(EngineConfig {
        retire_capacity: args.retire_capacity,
        max_slabs: args.max_slabs,
    }));
    info!(
        retire_capacity = args.retire_capacity,
        max_slabs = ?args.max_slabs,
        "Storage engine initialized"
    );

    let _reclaimer = (args.reclaim_interval_ms > 0).then(|| {
        Reclaimer::start(
            Arc::clone(&engine),
            ReclaimConfig {
                interval: Duration::from_millis(args.reclaim_interval_ms),
            },
        )
    });

    let server = Server::start(
        Arc::clone(&engine),
        ServerConfig {
            lanes: args.lanes,
            buffer_size: args.buffer_size,
            ..Default::default()
        },
    )?;

    let bound = server
        .configure(addr)
        .with_context(|| format!("failed to listen on {}", addr))?;
    print_banner(bound, server.lane_count());

    signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("Shutdown signal received, stopping server...");

    if !server.deconfigure() {
        warn!("Listener was already closed");
    }

    let stats = engine.stats();
    let memory = engine.memory_info();
    info!(
        keys = stats.keys,
        requests = server.stats().requests_processed.load(Ordering::Relaxed),
        slabs = memory.slabs,
        "Server shutdown complete"
    );
    Ok(())
}
