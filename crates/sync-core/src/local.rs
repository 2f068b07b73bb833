//! Local event processor: turns a filesystem change into an event on the server.
//!
//! Under the path's exclusive lock the changed file is staged, hashed,
//! promoted into the cache and uploaded, then the event is submitted with its
//! predecessor set to the hash of the path's latest event. Redundant changes
//! (touch without edit, repeated deletes) are discarded before anything
//! leaves the machine.

use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::event::{Event, EventStatus, EventType};
use crate::fs_util::{is_not_found, permissions_of, relative_path};
use crate::outcome::{DiscardReason, ProcessOutcome};
use crate::path_lock::{LockMode, PathGuard, PendingLock};
use crate::stage::hash_file;
use crate::transport::EventSink;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::{debug, info};

/// A raw change notification for an absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    pub path: PathBuf,
    pub event_type: EventType,
}

impl LocalChange {
    pub fn update(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            event_type: EventType::Update,
        }
    }

    pub fn delete(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            event_type: EventType::Delete,
        }
    }
}

pub struct LocalProcessor {
    ctx: SyncContext,
    sink: Arc<dyn EventSink>,
    next_local_id: AtomicU64,
}

impl LocalProcessor {
    pub fn new(ctx: SyncContext, sink: Arc<dyn EventSink>) -> Self {
        Self {
            ctx,
            sink,
            next_local_id: AtomicU64::new(1),
        }
    }

    /// The wire path for a change, or an error if it lies outside the root.
    pub fn relativize(&self, change: &LocalChange) -> Result<String> {
        relative_path(&self.ctx.root, &change.path)
            .ok_or_else(|| SyncError::OutsideRoot(change.path.clone()))
    }

    /// Lock the changed path and process the change.
    pub async fn process(&self, change: LocalChange) -> Result<ProcessOutcome> {
        let path = self.relativize(&change)?;
        let pending = self.ctx.locks.request(path, LockMode::Exclusive);
        self.process_pending(change, pending).await
    }

    /// Process a change whose lock was already requested, e.g. by a
    /// dispatcher fixing arrival order before spawning.
    pub async fn process_pending(
        &self,
        change: LocalChange,
        pending: PendingLock,
    ) -> Result<ProcessOutcome> {
        let guard = pending
            .granted()
            .await
            .map_err(|_| SyncError::LockManagerStopped)?;

        let latest = guard.latest().cloned();
        let mut event = Event::new(change.event_type, guard.path());
        event.local_id = self.next_local_id.fetch_add(1, Ordering::Relaxed);
        event.predecessor = latest.as_ref().and_then(|l| l.hash.clone());

        match change.event_type {
            EventType::Update => {
                let skipped = self
                    .prepare_update(&change, &mut event, latest.as_ref())
                    .await?;
                if let Some(reason) = skipped {
                    return Ok(discard(guard, event, reason));
                }
            }
            EventType::Delete => {
                if latest.as_ref().is_some_and(Event::is_delete) {
                    return Ok(discard(guard, event, DiscardReason::DuplicateDelete));
                }
            }
        }

        let sink = &self.sink;
        let submitted = &event;
        let id = self
            .ctx
            .retry
            .run(&self.ctx.shutdown, "submit", &event.path, || async move {
                sink.submit(submitted)
                    .await
                    .map_err(|source| SyncError::Transport {
                        path: submitted.path.clone(),
                        source,
                    })
            })
            .await?;

        event.id = Some(id);
        event.in_db = true;
        info!(
            "Sent {:?} {} as #{} ({})",
            event.event_type,
            event.path,
            id,
            event.hash.as_ref().map(|h| h.short(12)).unwrap_or("-")
        );
        guard.release(Some(event.clone()));
        Ok(ProcessOutcome::Sent(event))
    }

    /// Stage, hash, cache and upload the changed file, filling in `event`.
    ///
    /// Returns a discard reason when there is nothing to send.
    async fn prepare_update(
        &self,
        change: &LocalChange,
        event: &mut Event,
        latest: Option<&Event>,
    ) -> Result<Option<DiscardReason>> {
        let stager = &self.ctx.stager;
        let staged = match stager.stage(&change.path).await {
            Ok(staged) => staged,
            Err(e) if is_not_found(&e) => return Ok(Some(DiscardReason::SourceVanished)),
            Err(e) => return Err(SyncError::io("stage", &change.path)(e)),
        };

        // fs::copy carries the mode over, so the staged copy's bits are the source's
        let metadata = fs::metadata(staged.path())
            .await
            .map_err(SyncError::io("stat", staged.path()))?;
        let permissions = permissions_of(&metadata);
        let hash = hash_file(staged.path())
            .await
            .map_err(SyncError::io("hash", staged.path()))?;

        if latest.and_then(|l| l.hash.as_ref()) == Some(&hash) {
            staged.discard().await;
            return Ok(Some(DiscardReason::Unchanged));
        }

        let cached = stager
            .promote(staged, &hash)
            .await
            .map_err(SyncError::io("cache", &change.path))?;

        let blobs = &self.ctx.blobs;
        let (cached, key) = (&cached, &hash);
        self.ctx
            .retry
            .run(&self.ctx.shutdown, "upload", &event.path, || async move {
                blobs.put(cached, key).await.map_err(|source| SyncError::Blob {
                    hash: key.clone(),
                    source,
                })
            })
            .await?;

        event.hash = Some(hash);
        event.permissions = permissions;
        Ok(None)
    }
}

/// Mark `event` discarded and release the path without recording it.
pub(crate) fn discard(
    guard: PathGuard,
    mut event: Event,
    reason: DiscardReason,
) -> ProcessOutcome {
    debug!("Discarded {:?} {}: {}", event.event_type, event.path, reason);
    event.status.insert(EventStatus::DISCARDED);
    guard.release(None);
    ProcessOutcome::Discarded { event, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalBlobStore;
    use crate::event_log::{EventLog, MemoryEventLog};
    use crate::path_lock::PathLocks;
    use crate::retry::RetryConfig;
    use crate::shutdown::ShutdownBarrier;
    use crate::stage::Stager;
    use tempfile::TempDir;

    async fn processor(temp: &TempDir) -> (LocalProcessor, Arc<MemoryEventLog>) {
        let stager = Stager::new(temp.path().join("tmp"), temp.path().join("cache"));
        stager.ensure_dirs().await.unwrap();
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let blobs = LocalBlobStore::open(temp.path().join("blobs")).await.unwrap();
        let log = Arc::new(MemoryEventLog::new());
        let ctx = SyncContext {
            root,
            stager,
            blobs: Arc::new(blobs),
            locks: PathLocks::spawn(),
            retry: RetryConfig::default(),
            shutdown: ShutdownBarrier::new(),
        };
        (LocalProcessor::new(ctx, log.clone()), log)
    }

    #[tokio::test]
    async fn test_update_sends_event_with_hash() {
        let temp = TempDir::new().unwrap();
        let (processor, log) = processor(&temp).await;
        let file = temp.path().join("root/a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let outcome = processor.process(LocalChange::update(&file)).await.unwrap();
        let event = outcome.event();
        assert!(matches!(outcome, ProcessOutcome::Sent(_)));
        assert_eq!(event.path, "a.txt");
        assert_eq!(event.hash, Some(crate::ContentHash::of_bytes(b"hello")));
        assert_eq!(event.predecessor, None);
        assert_eq!(event.id, Some(1));
        assert_eq!(log.last_id().await, 1);
    }

    #[tokio::test]
    async fn test_vanished_source_discarded() {
        let temp = TempDir::new().unwrap();
        let (processor, log) = processor(&temp).await;

        let outcome = processor
            .process(LocalChange::update(temp.path().join("root/ghost.txt")))
            .await
            .unwrap();
        assert_eq!(outcome.discard_reason(), Some(DiscardReason::SourceVanished));
        assert!(outcome.event().is_discarded());
        assert_eq!(log.last_id().await, 0);
    }

    #[tokio::test]
    async fn test_delete_without_history_is_sent() {
        let temp = TempDir::new().unwrap();
        let (processor, log) = processor(&temp).await;

        let outcome = processor
            .process(LocalChange::delete(temp.path().join("root/never.txt")))
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Sent(_)));
        assert!(outcome.event().is_delete());
        assert_eq!(outcome.event().predecessor, None);
        assert_eq!(log.last_id().await, 1);

        // A second delete of the same path is redundant
        let again = processor
            .process(LocalChange::delete(temp.path().join("root/never.txt")))
            .await
            .unwrap();
        assert_eq!(again.discard_reason(), Some(DiscardReason::DuplicateDelete));
        assert_eq!(log.last_id().await, 1);
    }

    #[tokio::test]
    async fn test_outside_root_rejected() {
        let temp = TempDir::new().unwrap();
        let (processor, _log) = processor(&temp).await;

        let err = processor
            .process(LocalChange::update(temp.path().join("elsewhere.txt")))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::OutsideRoot(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permission_only_change_is_unchanged() {
        use crate::fs_util::set_permissions;

        let temp = TempDir::new().unwrap();
        let (processor, log) = processor(&temp).await;
        let file = temp.path().join("root/run.sh");
        std::fs::write(&file, b"#!/bin/sh\n").unwrap();
        set_permissions(&file, 0o644).await.unwrap();

        let first = processor.process(LocalChange::update(&file)).await.unwrap();
        assert!(matches!(first, ProcessOutcome::Sent(_)));
        set_permissions(&file, 0o755).await.unwrap();
        let second = processor.process(LocalChange::update(&file)).await.unwrap();

        assert_eq!(second.discard_reason(), Some(DiscardReason::Unchanged));
        assert!(second.event().is_discarded());
        assert_eq!(log.last_id().await, 1);
    }
}
