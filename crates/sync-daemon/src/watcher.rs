//! File watcher with debouncing for the sync root.
//!
//! Uses notify-debouncer-mini and turns each debounced path into a
//! [`LocalChange`] for the engine.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use sync_core::LocalChange;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Quiet period before a burst of writes to one file is reported.
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// Last seen mtime per path, to drop events that changed nothing
/// (some network and container volumes report spurious modifications).
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

/// Watches the sync root until dropped.
pub struct FileWatcher {
    root: PathBuf,
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
}

impl FileWatcher {
    /// Watch `root` recursively, sending changes to `changes`.
    ///
    /// Paths under any of `ignored` are skipped. `root` should already be
    /// canonical: on macOS FSEvents reports the resolved path.
    pub fn start(
        root: PathBuf,
        ignored: Vec<PathBuf>,
        changes: mpsc::Sender<LocalChange>,
    ) -> Result<Self> {
        let mtimes: MtimeCache = Arc::new(Mutex::new(HashMap::new()));
        let callback_root = root.clone();

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        let Some(change) = classify(&event.path, &callback_root, &ignored, &mtimes)
                        else {
                            continue;
                        };
                        // Runs on the notify thread, outside the runtime
                        if changes.blocking_send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            },
        )?;

        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            root,
            _debouncer: debouncer,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Whether `path` is one of, or lies under one of, `ignored`.
pub fn is_ignored(path: &Path, ignored: &[PathBuf]) -> bool {
    ignored.iter().any(|dir| path.starts_with(dir))
}

/// Decide what a debounced notification for `path` means, if anything.
fn classify(
    path: &Path,
    root: &Path,
    ignored: &[PathBuf],
    mtimes: &MtimeCache,
) -> Option<LocalChange> {
    if path == root || !path.starts_with(root) || is_ignored(path, ignored) {
        return None;
    }

    let mut cache = mtimes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => None,
        Ok(metadata) if !metadata.is_file() => {
            debug!("Skipping non-regular file {}", path.display());
            None
        }
        Ok(metadata) => {
            if let Ok(mtime) = metadata.modified() {
                if cache.get(path) == Some(&mtime) {
                    return None;
                }
                cache.insert(path.to_path_buf(), mtime);
            }
            debug!("Modified: {}", path.display());
            Some(LocalChange::update(path))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            cache.remove(path);
            debug!("Deleted: {}", path.display());
            Some(LocalChange::delete(path))
        }
        Err(e) => {
            warn!("Cannot stat {}: {}", path.display(), e);
            None
        }
    }
}
