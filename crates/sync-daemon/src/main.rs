//! sync-daemon: watches a directory and keeps it in sync through a
//! chainsync server.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use sync_core::ShutdownBarrier;
use sync_daemon::{Agent, Config};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sync-daemon")]
#[command(about = "Hash-chained file sync agent")]
struct Args {
    /// Config file (default: ~/.chainsync/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_daemon=debug,sync_core=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = match args.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    info!("Starting sync-daemon with {}", config_path.display());
    let config = Config::load(&config_path)?;

    let shutdown = ShutdownBarrier::new();
    shutdown.listen_for_signals();

    let code = match Agent::new(config, shutdown.clone()).run().await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            shutdown.exit(1);
            1
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
    info!("Stopped");
    Ok(())
}
