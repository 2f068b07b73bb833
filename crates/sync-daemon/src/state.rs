//! Persistence of the agent's sync state.
//!
//! Keeps the agent's identity, how far through the server's log it has
//! handled events, and the latest event per path, so a restart resumes the
//! hash chain instead of treating every file as new.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sync_core::{Event, LockError, PathLocks, PeerId, RemoteCursor, ShutdownBarrier};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to access state file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state file {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Locks(#[from] LockError),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Everything an agent needs to pick up where it stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    pub peer_id: PeerId,
    /// Every server event up to this id has been handled
    #[serde(default)]
    pub last_remote_id: u64,
    /// Latest event per relative path
    #[serde(default)]
    pub latest: HashMap<String, Event>,
}

impl ClientState {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            last_remote_id: 0,
            latest: HashMap::new(),
        }
    }

    /// Snapshot the live engine state.
    pub async fn capture(peer_id: PeerId, locks: &PathLocks, cursor: &RemoteCursor) -> Result<Self> {
        // Read the cursor first: events finishing in between only make
        // `latest` newer, and replaying them later is harmless
        let last_remote_id = cursor.watermark().await;
        let latest = locks.snapshot().await?;
        Ok(Self {
            peer_id,
            last_remote_id,
            latest,
        })
    }
}

/// State file on disk.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved state, or `None` if there is none yet.
    pub async fn load(&self) -> Result<Option<ClientState>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let state = serde_json::from_str(&contents).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(state))
    }

    /// Load the saved state, starting fresh with a new peer id if there is none.
    pub async fn load_or_init(&self) -> Result<ClientState> {
        match self.load().await? {
            Some(state) => {
                info!(
                    "Loaded state for peer {}: {} paths, resuming after #{}",
                    state.peer_id,
                    state.latest.len(),
                    state.last_remote_id
                );
                Ok(state)
            }
            None => {
                let state = ClientState::new(PeerId::generate());
                info!("No saved state, starting as new peer {}", state.peer_id);
                self.save(&state).await?;
                Ok(state)
            }
        }
    }

    /// Write `state`, replacing the previous file atomically.
    pub async fn save(&self, state: &ClientState) -> Result<()> {
        let io_err = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };
        let contents =
            serde_json::to_string_pretty(state).expect("ClientState serialization should not fail");

        let partial = partial_path(&self.path);
        fs::write(&partial, contents).await.map_err(io_err)?;
        fs::rename(&partial, &self.path).await.map_err(io_err)?;
        debug!(
            "Saved state: {} paths, resume after #{}",
            state.latest.len(),
            state.last_remote_id
        );
        Ok(())
    }

    /// Capture and save the live state.
    pub async fn checkpoint(
        &self,
        peer_id: PeerId,
        locks: &PathLocks,
        cursor: &RemoteCursor,
    ) -> Result<()> {
        let state = ClientState::capture(peer_id, locks, cursor).await?;
        self.save(&state).await
    }

    /// Checkpoint every `interval` until shutdown.
    pub async fn save_periodically(
        &self,
        peer_id: PeerId,
        locks: PathLocks,
        cursor: RemoteCursor,
        interval: Duration,
        shutdown: ShutdownBarrier,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.wait_for_exit() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.checkpoint(peer_id, &locks, &cursor).await {
                        warn!("Failed to save state: {}", e);
                    }
                }
            }
        }
    }
}

/// Scratch file a save writes before renaming it over `path`.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    PathBuf::from(partial)
}
