//! sync-server: ordered event log and fan-out for sync agents.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use sync_core::ShutdownBarrier;
use sync_core::event_log::EventLog;
use sync_server::{FileEventLog, SyncServer, Users};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sync-server")]
#[command(about = "Event log server for file sync agents")]
struct Args {
    /// Address to listen on for agent connections
    #[arg(short, long, default_value = "0.0.0.0:7340")]
    listen: String,

    /// Path to the event log (JSON lines)
    #[arg(long, default_value = "events.jsonl")]
    log: PathBuf,

    /// TOML file listing the accounts agents may log in with
    #[arg(short, long, default_value = "users.toml")]
    users: PathBuf,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_server=debug"
    } else {
        "info,sync_server=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting sync-server");
    info!("Event log: {:?}", args.log);

    let log = FileEventLog::open(&args.log)
        .await
        .with_context(|| format!("Failed to open event log {}", args.log.display()))?;
    info!("Log holds events up to #{}", log.last_id().await);

    let users = Users::load(&args.users)?;
    if users.is_empty() {
        warn!("{} lists no users; every agent will be denied", args.users.display());
    } else {
        info!("Loaded {} users from {}", users.len(), args.users.display());
    }

    let shutdown = ShutdownBarrier::new();
    shutdown.listen_for_signals();

    let listener = SyncServer::bind(&args.listen).await?;
    let server = SyncServer::new(Arc::new(log), users, shutdown.clone());
    info!("Server running. Press Ctrl+C to stop.");
    server.run(listener).await;

    let code = shutdown.wait_for_exit().await;
    info!("Shutting down");
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
