//! Remote event processor: applies events streamed from the server.
//!
//! Under the path's exclusive lock an incoming event is checked against the
//! latest event recorded for the path. Stale and duplicate events are
//! discarded; events whose chain does not descend from local state are
//! flagged as conflicts and resolved per [`ConflictPolicy`]. Everything else
//! is written into the tree via the cache and a same-filesystem rename.

use crate::conflict::{Conflict, ConflictPolicy, conflict_path, is_conflict};
use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::event::{ContentHash, Event, EventStatus, EventType};
use crate::fs_util::{
    absolute_path, is_not_found, permissions_of, remove_empty_ancestors, set_permissions,
};
use crate::blob::BlobError;
use crate::local::discard;
use crate::outcome::{DiscardReason, ProcessOutcome};
use crate::path_lock::{LockMode, PendingLock};
use crate::stage::hash_file;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

pub struct RemoteProcessor {
    ctx: SyncContext,
    policy: ConflictPolicy,
}

impl RemoteProcessor {
    pub fn new(ctx: SyncContext, policy: ConflictPolicy) -> Self {
        Self { ctx, policy }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Lock the event's path and apply it.
    pub async fn process(&self, event: Event) -> Result<ProcessOutcome> {
        let pending = self.ctx.locks.request(event.path.clone(), LockMode::Exclusive);
        self.process_pending(event, pending).await
    }

    /// Apply an event whose lock was already requested.
    pub async fn process_pending(
        &self,
        mut event: Event,
        pending: PendingLock,
    ) -> Result<ProcessOutcome> {
        let target = absolute_path(&self.ctx.root, &event.path)
            .ok_or_else(|| SyncError::OutsideRoot(PathBuf::from(&event.path)))?;
        if event.is_update() && event.hash.is_none() {
            return Err(SyncError::InvalidEvent {
                path: event.path,
                reason: "update without content hash",
            });
        }

        let guard = pending
            .granted()
            .await
            .map_err(|_| SyncError::LockManagerStopped)?;
        let latest = guard.latest().cloned();

        if let Some(local) = &latest {
            if event.timestamp < local.timestamp {
                return Ok(discard(guard, event, DiscardReason::Stale));
            }
            if event.is_same_event(local) {
                return Ok(discard(guard, event, DiscardReason::Duplicate));
            }
        }

        let mut conflict = None;
        if let Some(local) = latest.as_ref().filter(|l| is_conflict(l, &event)) {
            warn!(
                "Conflict on {}:\n  local:  {}\n  remote: {}",
                event.path,
                describe(local),
                describe(&event)
            );
            event.status.insert(EventStatus::CONFLICTED);
            let preserved_as = match self.policy {
                ConflictPolicy::PreserveLocal => self.preserve_local(&target, &event).await?,
                ConflictPolicy::LastWriterWins => None,
            };
            conflict = Some(Conflict {
                path: event.path.clone(),
                local: local.clone(),
                remote: event.clone(),
                preserved_as,
            });
        }

        match event.event_type {
            EventType::Update => self.apply_update(&target, &event, latest.as_ref()).await?,
            EventType::Delete => self.apply_delete(&target).await?,
        }

        event.status.insert(EventStatus::APPLIED);
        info!(
            "Applied #{} {:?} {}",
            event.id.unwrap_or_default(),
            event.event_type,
            event.path
        );
        guard.release(Some(event.clone()));
        Ok(ProcessOutcome::Applied { event, conflict })
    }

    /// Move the file currently at `target` aside under a conflict name.
    ///
    /// Returns the relative path it was moved to, or `None` when there was
    /// nothing to keep (file gone, or already holding the remote content).
    async fn preserve_local(&self, target: &Path, event: &Event) -> Result<Option<String>> {
        let on_disk = match hash_file(target).await {
            Ok(hash) => hash,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(SyncError::io("hash", target)(e)),
        };
        if event.hash.as_ref() == Some(&on_disk) {
            return Ok(None);
        }

        let relative = conflict_path(&event.path, &on_disk);
        let dest = absolute_path(&self.ctx.root, &relative)
            .ok_or_else(|| SyncError::OutsideRoot(PathBuf::from(&relative)))?;
        fs::rename(target, &dest)
            .await
            .map_err(SyncError::io("preserve conflicting copy", target))?;
        info!("Kept local version of {} as {}", event.path, relative);
        Ok(Some(relative))
    }

    async fn apply_update(
        &self,
        target: &Path,
        event: &Event,
        latest: Option<&Event>,
    ) -> Result<()> {
        let hash = event.hash.as_ref().ok_or_else(|| SyncError::InvalidEvent {
            path: event.path.clone(),
            reason: "update without content hash",
        })?;

        let replace_content = latest.and_then(|l| l.hash.as_ref()) != Some(hash)
            || !fs::try_exists(target).await.unwrap_or(false);
        if replace_content {
            let cached = self.fetch(event, hash).await?;
            self.place(&cached, target).await?;
        }

        if event.permissions == 0 {
            return Ok(());
        }
        let current = match fs::metadata(target).await {
            Ok(metadata) => permissions_of(&metadata),
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(SyncError::io("stat", target)(e)),
        };
        if replace_content || current != event.permissions {
            match set_permissions(target, event.permissions).await {
                Ok(()) => {}
                // Deleted underneath us; the delete event will follow
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(SyncError::io("chmod", target)(e)),
            }
        }
        Ok(())
    }

    /// Make sure the blob is in the cache, downloading and verifying it if not.
    async fn fetch(&self, event: &Event, hash: &ContentHash) -> Result<PathBuf> {
        let stager = &self.ctx.stager;
        if stager.is_cached(hash).await {
            debug!("Cache hit for {}", hash.short(12));
            return Ok(stager.cache_path(hash));
        }

        let download = stager
            .reserve()
            .await
            .map_err(SyncError::io("reserve", stager.tmp_dir()))?;
        let blobs = &self.ctx.blobs;
        let dest = download.path();
        self.ctx
            .retry
            .run(&self.ctx.shutdown, "download", &event.path, || async move {
                blobs.get(dest, hash).await.map_err(|source| SyncError::Blob {
                    hash: hash.clone(),
                    source,
                })
            })
            .await?;

        let actual = hash_file(download.path())
            .await
            .map_err(SyncError::io("hash", download.path()))?;
        if &actual != hash {
            return Err(SyncError::Blob {
                hash: hash.clone(),
                source: BlobError::Corrupt { actual },
            });
        }

        stager
            .promote(download, hash)
            .await
            .map_err(SyncError::io("cache", stager.cache_dir()))
    }

    /// Copy a cached blob into place at `target` with an atomic rename.
    async fn place(&self, cached: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(SyncError::io("create directory", parent))?;
        }

        let staged = self
            .ctx
            .stager
            .stage(cached)
            .await
            .map_err(SyncError::io("stage", cached))?;
        if let Err(source) = fs::rename(staged.path(), target).await {
            return Err(SyncError::Placement {
                staged: staged.path().to_path_buf(),
                target: target.to_path_buf(),
                source,
            });
        }
        staged.disarm();
        Ok(())
    }

    async fn apply_delete(&self, target: &Path) -> Result<()> {
        match fs::remove_file(target).await {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(SyncError::io("delete", target)(e)),
        }
        if let Some(parent) = target.parent() {
            remove_empty_ancestors(parent, &self.ctx.root).await;
        }
        Ok(())
    }
}

fn describe(event: &Event) -> String {
    serde_json::to_string(event).expect("Event serialization should not fail")
}
