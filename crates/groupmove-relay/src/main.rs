//! GroupMove Relay
//!
//! The always-on replication log and share directory for GroupMove.
//!
//! ## Features
//!
//! - **Batch streams**: one append-only log per property, read by cursor
//! - **Stream discovery**: which properties a participant has written to
//! - **Share directory**: invitations parked under a token until redeemed

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use groupmove_relay::{api, db::Database, AppState};

/// GroupMove Relay - replication log and share directory
#[derive(Parser, Debug)]
#[command(name = "groupmove-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Data directory for persistence
    #[arg(long, default_value = "/data", env = "GROUPMOVE_RELAY_DATA_DIR")]
    data_dir: PathBuf,

    /// HTTP API port
    #[arg(long, default_value = "8080", env = "GROUPMOVE_RELAY_PORT")]
    port: u16,

    /// Log level
    #[arg(long, default_value = "info", env = "GROUPMOVE_RELAY_LOG_LEVEL")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting GroupMove Relay");
    info!(data_dir = %args.data_dir.display(), "Data directory");

    tokio::fs::create_dir_all(&args.data_dir)
        .await
        .context("Failed to create data directory")?;

    let db_path = args.data_dir.join("relay.db");
    let db = Arc::new(Database::open(&db_path).context("Failed to open database")?);
    info!(path = %db_path.display(), "Database initialized");

    let state = Arc::new(AppState { db });

    let addr: SocketAddr = ([0, 0, 0, 0], args.port).into();
    let app = api::router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Run with graceful shutdown on ctrl-c
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    info!("GroupMove Relay shutting down");
    Ok(())
}

/// Wait for a ctrl-c signal for graceful shutdown
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Received ctrl-c, initiating graceful shutdown");
}
