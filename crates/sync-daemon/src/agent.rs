//! The agent process: wires config, state, watcher, server link and engine.

use crate::config::{Config, canonical};
use crate::link::ServerLink;
use crate::scan::scan;
use crate::state::StateStore;
use crate::watcher::FileWatcher;
use anyhow::{Context, Result};
use std::sync::Arc;
use sync_core::{
    LocalBlobStore, PathLocks, ProcessOutcome, ShutdownBarrier, Stager, SyncContext, SyncEngine,
};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Capacity of the engine's input queues.
pub const QUEUE_DEPTH: usize = 1024;

pub struct Agent {
    config: Config,
    shutdown: ShutdownBarrier,
    observer: Option<mpsc::UnboundedSender<ProcessOutcome>>,
}

impl Agent {
    pub fn new(config: Config, shutdown: ShutdownBarrier) -> Self {
        Self {
            config,
            shutdown,
            observer: None,
        }
    }

    /// Report every processed event to `observer`.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<ProcessOutcome>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Sync until shutdown, then save state. Returns the exit code.
    pub async fn run(self) -> Result<i32> {
        let config = &self.config;
        config
            .ensure_dirs()
            .await
            .context("Failed to create agent directories")?;
        let root = canonical(&config.local.sync_dir);
        let ignored = config.ignored_paths();
        info!("Sync root: {}", root.display());

        let store = StateStore::new(&config.local.state_file);
        let state = store.load_or_init().await?;
        let peer_id = state.peer_id;

        let stager = Stager::new(config.local.tmp_dir.clone(), config.local.cache_dir.clone());
        stager.ensure_dirs().await?;
        let blobs = LocalBlobStore::open(config.blobs.dir.clone()).await?;
        let locks = PathLocks::spawn_with(state.latest);

        let ctx = SyncContext {
            root: root.clone(),
            stager,
            blobs: Arc::new(blobs),
            locks: locks.clone(),
            retry: config.sync.retry(),
            shutdown: self.shutdown.clone(),
        };

        let link = Arc::new(ServerLink::new(
            config.server.url.clone(),
            peer_id,
            config.server.credentials(),
            config.sync.op_timeout(),
        ));
        let mut engine = SyncEngine::new(
            ctx,
            link.clone(),
            config.sync.conflict_policy,
            state.last_remote_id,
        );
        if let Some(observer) = self.observer {
            engine = engine.with_observer(observer);
        }
        let cursor = engine.cursor();
        info!(
            "Agent {} syncing with {} (conflict policy: {})",
            peer_id, config.server.url, config.sync.conflict_policy
        );

        let (local_tx, local_rx) = mpsc::channel(QUEUE_DEPTH);
        let (remote_tx, remote_rx) = mpsc::channel(QUEUE_DEPTH);
        let engine_task = tokio::spawn(engine.run(local_rx, remote_rx));
        let link_task = tokio::spawn(link.run(cursor.clone(), remote_tx, self.shutdown.clone()));

        // Watch before scanning so nothing changed in between is missed
        let watcher = FileWatcher::start(root.clone(), ignored.clone(), local_tx.clone())?;
        info!("Watching {}", watcher.root().display());
        let snapshot = locks.snapshot().await?;
        for change in scan(&root, &ignored, &snapshot).await? {
            if local_tx.send(change).await.is_err() {
                break;
            }
        }

        let saver = {
            let (locks, cursor, shutdown) = (locks.clone(), cursor.clone(), self.shutdown.clone());
            let interval = config.sync.state_save_interval();
            let store = StateStore::new(store.path());
            tokio::spawn(async move {
                store
                    .save_periodically(peer_id, locks, cursor, interval, shutdown)
                    .await
            })
        };

        let code = self.shutdown.wait_for_exit().await;
        info!("Shutting down (code {})", code);
        drop(watcher);
        drop(local_tx);
        for (name, task) in [("engine", engine_task), ("server link", link_task), ("state saver", saver)] {
            if let Err(e) = task.await {
                error!("The {} task failed: {}", name, e);
            }
        }

        store
            .checkpoint(peer_id, &locks, &cursor)
            .await
            .context("Failed to save state at shutdown")?;
        info!("State saved to {}", store.path().display());
        Ok(code)
    }
}
