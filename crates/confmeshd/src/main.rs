//! confmeshd — the confmesh daemon.
//!
//! Single binary that assembles the server-side subsystems:
//! - State store (redb)
//! - Release-message cache + backfill scanner
//! - Branch manager (gray-release lifecycle)
//!
//! # Usage
//!
//! ```text
//! confmeshd serve --data-dir /var/lib/confmesh --scan-interval 1
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use confmesh_release::ReleaseMessageCache;

#[derive(Parser)]
#[command(name = "confmeshd", about = "confmesh daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the config service (single-node, all subsystems in one process).
    Serve {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/confmesh")]
        data_dir: PathBuf,

        /// Release-message scan interval in seconds.
        #[arg(long, default_value = "1")]
        scan_interval: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,confmeshd=debug,confmesh=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            data_dir,
            scan_interval,
        } => run_serve(data_dir, scan_interval).await,
    }
}

async fn run_serve(data_dir: PathBuf, scan_interval: u64) -> anyhow::Result<()> {
    info!("confmesh daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("confmesh.redb");

    // ── Initialize subsystems ──────────────────────────────────

    // State store.
    let state = confmesh_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // Release-message cache. The warm-up is the one intentional
    // blocking load: the cache must hold every existing message before
    // anything is allowed to answer from it.
    let cache = Arc::new(ReleaseMessageCache::new(Arc::new(state.clone())));
    cache.warm_up()?;
    info!(watermark = cache.watermark(), "release message cache ready");

    // Branch manager.
    let _branches = confmesh_branch::BranchManager::new(state.clone());
    info!("branch manager initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    // Gap-healing scanner; retires itself once push delivery is live.
    let scanner_handle = cache
        .clone()
        .spawn_scanner(Duration::from_secs(scan_interval), shutdown_rx);
    info!(interval = scan_interval, "release message scanner started");

    // Graceful shutdown on Ctrl-C.
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Wait for background tasks.
    let _ = scanner_handle.await;

    info!("confmesh daemon stopped");
    Ok(())
}
