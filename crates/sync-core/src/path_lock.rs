//! Per-path critical sections and the latest known event of every path.
//!
//! A single actor task owns the map from relative path to latest event and
//! serializes all access to one path, while different paths proceed in
//! parallel. Callers talk to it through [`PathLocks`] handles:
//!
//! ```text
//! request(path) ──► queued (FIFO per path) ──► granted: PathGuard { latest }
//!                                                   │
//!                      release(Some(event)) ◄───────┘  (or drop: keep latest)
//! ```
//!
//! Every request and release goes over one channel, so the order in which
//! requests are made is the order in which they are granted.

use crate::event::Event;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Path lock manager stopped")]
    ManagerStopped,
}

/// How a path is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Sole holder; may record a new latest event on release
    Exclusive,
    /// Read-only; overlaps other shared holders but never an exclusive one
    Shared,
}

enum Command {
    Acquire {
        path: String,
        mode: LockMode,
        ticket: u64,
        reply: oneshot::Sender<Option<Event>>,
    },
    Release {
        path: String,
        ticket: u64,
        latest: Option<Event>,
    },
    Snapshot {
        reply: oneshot::Sender<HashMap<String, Event>>,
    },
}

struct Waiter {
    ticket: u64,
    mode: LockMode,
    reply: oneshot::Sender<Option<Event>>,
}

#[derive(Default)]
enum Holders {
    #[default]
    Free,
    Exclusive(u64),
    Shared(HashSet<u64>),
}

#[derive(Default)]
struct PathEntry {
    latest: Option<Event>,
    holders: Holders,
    waiters: VecDeque<Waiter>,
}

impl PathEntry {
    fn can_grant(&self, mode: LockMode) -> bool {
        match (&self.holders, mode) {
            (Holders::Free, _) => true,
            (Holders::Shared(_), LockMode::Shared) => true,
            _ => false,
        }
    }

    fn grant(&mut self, waiter: Waiter) {
        match waiter.mode {
            LockMode::Exclusive => self.holders = Holders::Exclusive(waiter.ticket),
            LockMode::Shared => {
                if let Holders::Shared(set) = &mut self.holders {
                    set.insert(waiter.ticket);
                } else {
                    self.holders = Holders::Shared(HashSet::from([waiter.ticket]));
                }
            }
        }
        // A dropped receiver is cleaned up by the Release its PendingLock sends on drop
        let _ = waiter.reply.send(self.latest.clone());
    }

    /// Grant queued requests from the front for as long as they are compatible.
    fn wake(&mut self) {
        while let Some(front) = self.waiters.front() {
            if !self.can_grant(front.mode) {
                break;
            }
            if let Some(waiter) = self.waiters.pop_front() {
                self.grant(waiter);
            }
        }
    }

    /// Returns true if `ticket` was a holder.
    fn release(&mut self, ticket: u64) -> bool {
        match &mut self.holders {
            Holders::Exclusive(holder) if *holder == ticket => {
                self.holders = Holders::Free;
                true
            }
            Holders::Shared(set) if set.contains(&ticket) => {
                set.remove(&ticket);
                if set.is_empty() {
                    self.holders = Holders::Free;
                }
                true
            }
            _ => false,
        }
    }
}

/// State owned by the actor task.
struct LockTable {
    entries: HashMap<String, PathEntry>,
}

impl LockTable {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Acquire {
                path,
                mode,
                ticket,
                reply,
            } => {
                let entry = self.entries.entry(path).or_default();
                let waiter = Waiter {
                    ticket,
                    mode,
                    reply,
                };
                // FIFO: never overtake someone already queued
                if entry.waiters.is_empty() && entry.can_grant(mode) {
                    entry.grant(waiter);
                } else {
                    trace!("Lock ticket {} queued", ticket);
                    entry.waiters.push_back(waiter);
                }
            }
            Command::Release {
                path,
                ticket,
                latest,
            } => {
                let Some(entry) = self.entries.get_mut(&path) else {
                    return;
                };
                if entry.release(ticket) {
                    if let Some(event) = latest {
                        entry.latest = Some(event);
                    }
                } else {
                    // Abandoned while still queued
                    entry.waiters.retain(|w| w.ticket != ticket);
                }
                entry.wake();
            }
            Command::Snapshot { reply } => {
                let snapshot = self
                    .entries
                    .iter()
                    .filter_map(|(path, entry)| Some((path.clone(), entry.latest.clone()?)))
                    .collect();
                let _ = reply.send(snapshot);
            }
        }
    }
}

/// Handle to the path lock actor. Cheap to clone.
#[derive(Clone)]
pub struct PathLocks {
    tx: mpsc::UnboundedSender<Command>,
    next_ticket: Arc<AtomicU64>,
}

impl PathLocks {
    /// Start the actor with no recorded history.
    pub fn spawn() -> Self {
        Self::spawn_with(HashMap::new())
    }

    /// Start the actor with previously persisted latest events.
    ///
    /// The actor runs until every handle and guard is dropped.
    pub fn spawn_with(seed: HashMap<String, Event>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let entries = seed
            .into_iter()
            .map(|(path, event)| {
                let entry = PathEntry {
                    latest: Some(event),
                    ..Default::default()
                };
                (path, entry)
            })
            .collect();
        let mut table = LockTable { entries };

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                table.handle(command);
            }
            debug!("Path lock manager stopped");
        });

        Self {
            tx,
            next_ticket: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Queue a request for `path` without waiting for it.
    ///
    /// Requests for one path are granted in the order this is called.
    pub fn request(&self, path: impl Into<String>, mode: LockMode) -> PendingLock {
        let path = path.into();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let sent = self
            .tx
            .send(Command::Acquire {
                path: path.clone(),
                mode,
                ticket,
                reply,
            })
            .is_ok();

        PendingLock {
            rx: sent.then_some(rx),
            ticket: Ticket {
                path,
                ticket,
                mode,
                tx: self.tx.clone(),
                live: sent,
            },
        }
    }

    /// Wait for access to `path`.
    pub async fn acquire(
        &self,
        path: impl Into<String>,
        mode: LockMode,
    ) -> Result<PathGuard, LockError> {
        self.request(path, mode).granted().await
    }

    /// Copy of every path's latest event, for persistence.
    pub async fn snapshot(&self) -> Result<HashMap<String, Event>, LockError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .map_err(|_| LockError::ManagerStopped)?;
        rx.await.map_err(|_| LockError::ManagerStopped)
    }
}

/// Sends the release for a ticket exactly once, whether the lock was
/// granted, still queued, or the holder panicked.
struct Ticket {
    path: String,
    ticket: u64,
    mode: LockMode,
    tx: mpsc::UnboundedSender<Command>,
    live: bool,
}

impl Ticket {
    fn release(&mut self, latest: Option<Event>) {
        if !self.live {
            return;
        }
        self.live = false;
        let _ = self.tx.send(Command::Release {
            path: std::mem::take(&mut self.path),
            ticket: self.ticket,
            latest,
        });
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.release(None);
    }
}

/// A queued lock request. Dropping it abandons the request.
pub struct PendingLock {
    rx: Option<oneshot::Receiver<Option<Event>>>,
    ticket: Ticket,
}

impl PendingLock {
    pub fn path(&self) -> &str {
        &self.ticket.path
    }

    /// Wait until the lock is granted.
    pub async fn granted(mut self) -> Result<PathGuard, LockError> {
        let rx = self.rx.take().ok_or(LockError::ManagerStopped)?;
        let latest = rx.await.map_err(|_| LockError::ManagerStopped)?;
        Ok(PathGuard {
            latest,
            ticket: self.ticket,
        })
    }
}

/// Access to one path. Dropping the guard releases it without changing the
/// recorded latest event.
pub struct PathGuard {
    latest: Option<Event>,
    ticket: Ticket,
}

impl PathGuard {
    pub fn path(&self) -> &str {
        &self.ticket.path
    }

    pub fn mode(&self) -> LockMode {
        self.ticket.mode
    }

    /// The latest event recorded for this path when the lock was granted.
    pub fn latest(&self) -> Option<&Event> {
        self.latest.as_ref()
    }

    /// Release the path, recording `new_latest` if given.
    ///
    /// Shared holders cannot change the latest event.
    pub fn release(mut self, new_latest: Option<Event>) {
        let new_latest = match self.ticket.mode {
            LockMode::Exclusive => new_latest,
            LockMode::Shared => None,
        };
        self.ticket.release(new_latest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn event(path: &str, byte: u8) -> Event {
        let mut event = Event::update(path);
        event.hash = Some(crate::ContentHash::of_bytes(&[byte]));
        event
    }

    async fn is_blocked(pending: PendingLock) -> bool {
        timeout(Duration::from_millis(50), pending.granted())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_first_acquire_has_no_latest() {
        let locks = PathLocks::spawn();
        let guard = locks.acquire("a.txt", LockMode::Exclusive).await.unwrap();
        assert!(guard.latest().is_none());
        assert_eq!(guard.path(), "a.txt");
    }

    #[tokio::test]
    async fn test_release_records_latest() {
        let locks = PathLocks::spawn();
        let guard = locks.acquire("a.txt", LockMode::Exclusive).await.unwrap();
        guard.release(Some(event("a.txt", 1)));

        let guard = locks.acquire("a.txt", LockMode::Exclusive).await.unwrap();
        assert_eq!(
            guard.latest().and_then(|e| e.hash.clone()),
            event("a.txt", 1).hash
        );
    }

    #[tokio::test]
    async fn test_release_without_event_keeps_prior() {
        let locks = PathLocks::spawn();
        locks
            .acquire("a.txt", LockMode::Exclusive)
            .await
            .unwrap()
            .release(Some(event("a.txt", 1)));

        // Dropped guard (e.g. a discarded event)
        drop(locks.acquire("a.txt", LockMode::Exclusive).await.unwrap());

        let guard = locks.acquire("a.txt", LockMode::Exclusive).await.unwrap();
        assert_eq!(
            guard.latest().and_then(|e| e.hash.clone()),
            event("a.txt", 1).hash
        );
    }

    #[tokio::test]
    async fn test_exclusive_blocks_same_path_only() {
        let locks = PathLocks::spawn();
        let held = locks.acquire("a.txt", LockMode::Exclusive).await.unwrap();

        assert!(is_blocked(locks.request("a.txt", LockMode::Exclusive)).await);

        // A different path is not affected
        let other = timeout(
            Duration::from_millis(200),
            locks.acquire("b.txt", LockMode::Exclusive),
        )
        .await;
        assert!(other.is_ok());

        drop(held);
        let again = timeout(
            Duration::from_millis(200),
            locks.acquire("a.txt", LockMode::Exclusive),
        )
        .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_grants_in_request_order() {
        let locks = PathLocks::spawn();
        let held = locks.acquire("a.txt", LockMode::Exclusive).await.unwrap();

        let first = locks.request("a.txt", LockMode::Exclusive);
        let second = locks.request("a.txt", LockMode::Exclusive);

        // Await the second first; it must still be granted after the first
        let second_task = tokio::spawn(async move {
            let guard = second.granted().await.unwrap();
            guard.latest().and_then(|e| e.hash.clone())
        });
        let first_task = tokio::spawn(async move {
            let guard = first.granted().await.unwrap();
            guard.release(Some(event("a.txt", 1)));
        });

        held.release(Some(event("a.txt", 0)));
        first_task.await.unwrap();
        assert_eq!(second_task.await.unwrap(), event("a.txt", 1).hash);
    }

    #[tokio::test]
    async fn test_abandoned_request_does_not_wedge_path() {
        let locks = PathLocks::spawn();
        let held = locks.acquire("a.txt", LockMode::Exclusive).await.unwrap();

        let abandoned = locks.request("a.txt", LockMode::Exclusive);
        let next = locks.request("a.txt", LockMode::Exclusive);
        drop(abandoned);
        drop(held);

        let guard = timeout(Duration::from_millis(200), next.granted()).await;
        assert!(guard.is_ok());
    }

    #[tokio::test]
    async fn test_panicking_holder_releases() {
        let locks = PathLocks::spawn();
        let task_locks = locks.clone();
        let result = tokio::spawn(async move {
            let _guard = task_locks.acquire("a.txt", LockMode::Exclusive).await.unwrap();
            panic!("worker bug");
        })
        .await;
        assert!(result.is_err());

        let guard = timeout(
            Duration::from_millis(200),
            locks.acquire("a.txt", LockMode::Exclusive),
        )
        .await;
        assert!(guard.is_ok());
    }

    #[tokio::test]
    async fn test_shared_holders_overlap_but_exclude_writers() {
        let locks = PathLocks::spawn();
        let r1 = locks.acquire("a.txt", LockMode::Shared).await.unwrap();
        let r2 = timeout(
            Duration::from_millis(200),
            locks.acquire("a.txt", LockMode::Shared),
        )
        .await
        .unwrap()
        .unwrap();

        let writer = locks.request("a.txt", LockMode::Exclusive);
        drop(r1);
        assert!(is_blocked(writer).await);

        // Readers queued behind a writer wait for it
        let writer = locks.request("a.txt", LockMode::Exclusive);
        let reader = locks.request("a.txt", LockMode::Shared);
        let reader_task = tokio::spawn(reader.granted());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader_task.is_finished());

        drop(r2);
        let w = writer.granted().await.unwrap();
        w.release(Some(event("a.txt", 3)));
        let r = reader_task.await.unwrap().unwrap();
        assert_eq!(r.latest().and_then(|e| e.hash.clone()), event("a.txt", 3).hash);
    }

    #[tokio::test]
    async fn test_shared_release_cannot_change_latest() {
        let locks = PathLocks::spawn();
        let reader = locks.acquire("a.txt", LockMode::Shared).await.unwrap();
        assert_eq!(reader.mode(), LockMode::Shared);
        reader.release(Some(event("a.txt", 1)));

        let guard = locks.acquire("a.txt", LockMode::Exclusive).await.unwrap();
        assert!(guard.latest().is_none());
    }

    #[tokio::test]
    async fn test_seed_and_snapshot() {
        let seed = HashMap::from([("a.txt".to_string(), event("a.txt", 1))]);
        let locks = PathLocks::spawn_with(seed);

        let guard = locks.acquire("b.txt", LockMode::Exclusive).await.unwrap();
        guard.release(Some(event("b.txt", 2)));
        // Touched but never given a latest event
        drop(locks.acquire("c.txt", LockMode::Exclusive).await.unwrap());

        let snapshot = locks.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["a.txt"].hash, event("a.txt", 1).hash);
        assert_eq!(snapshot["b.txt"].hash, event("b.txt", 2).hash);
    }
}
