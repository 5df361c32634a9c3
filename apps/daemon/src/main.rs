//! # Stockbridge Daemon
//!
//! Keeps a storefront and a warehouse in sync.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. init_tracing()          RUST_LOG or "info,stockbridge=debug"       │
//! │  2. BridgeConfig::load()    --config, STOCKBRIDGE_CONFIG, project dir  │
//! │  3. Database::new()         migrations run on open                     │
//! │  4. BridgeAgent::start()    webhook server, engine, scheduler          │
//! │  5. shutdown_signal()       Ctrl+C / SIGTERM → BridgeHandle::shutdown  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stockbridge_db::{Database, DbConfig};
use stockbridge_sync::{BridgeAgent, BridgeConfig};

#[derive(Parser)]
#[command(name = "stockbridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to bridge.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let config = BridgeConfig::load(cli.config).context("loading configuration")?;
    info!(
        database = %config.database.path.display(),
        webhook = %config.webhook.socket_address(),
        priority = ?config.conflict.priority,
        "Configuration loaded"
    );

    if cli.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let db = Database::new(DbConfig::new(&config.database.path))
        .await
        .context("opening reconciliation store")?;

    let handle = BridgeAgent::from_config(config, db.clone())
        .context("building bridge")?
        .start()
        .await
        .context("starting bridge")?;

    shutdown_signal().await;

    handle.shutdown().await.context("stopping bridge")?;
    db.close().await;

    info!("Shutdown complete");
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=stockbridge_sync=trace` - Trace the sync engine only
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stockbridge=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
