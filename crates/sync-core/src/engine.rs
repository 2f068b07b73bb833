//! Dispatch and supervision of event processing.
//!
//! The engine consumes local changes and remote events from two channels.
//! For each one it requests the path lock before spawning the task, so work
//! on one path runs in arrival order while distinct paths run in parallel.
//! Task results come back to a single supervisor that decides whether a
//! failure stays scoped to its event or stops the process.

use crate::conflict::ConflictPolicy;
use crate::context::SyncContext;
use crate::error::{Result, SyncError};
use crate::event::Event;
use crate::local::{LocalChange, LocalProcessor};
use crate::outcome::ProcessOutcome;
use crate::path_lock::LockMode;
use crate::remote::RemoteProcessor;
use crate::transport::EventSink;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Default)]
struct CursorState {
    /// Highest remote id handed to a task
    dispatched: u64,
    /// Remote ids whose processing has not finished
    in_flight: BTreeSet<u64>,
}

/// Progress through the server's log.
///
/// `dispatched` filters re-delivered events; [`RemoteCursor::watermark`] is
/// the id below which every event has been fully handled, which is what a
/// restart may safely resume from.
#[derive(Debug, Clone, Default)]
pub struct RemoteCursor {
    state: Arc<Mutex<CursorState>>,
}

impl RemoteCursor {
    pub fn new(resume_from: u64) -> Self {
        let state = CursorState {
            dispatched: resume_from,
            in_flight: BTreeSet::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Record `id` as dispatched; false if it was seen before.
    async fn begin(&self, id: u64) -> bool {
        let mut state = self.state.lock().await;
        if id <= state.dispatched {
            return false;
        }
        state.dispatched = id;
        state.in_flight.insert(id);
        true
    }

    async fn finish(&self, id: u64) {
        self.state.lock().await.in_flight.remove(&id);
    }

    pub async fn dispatched(&self) -> u64 {
        self.state.lock().await.dispatched
    }

    /// Move back to `id` after the server's log turned out shorter than
    /// expected, so the events it appends next are not taken as re-deliveries.
    pub async fn rewind(&self, id: u64) {
        let mut state = self.state.lock().await;
        if id < state.dispatched {
            state.dispatched = id;
            state.in_flight.retain(|&pending| pending <= id);
        }
    }

    /// Highest id such that it and every id before it have been handled.
    pub async fn watermark(&self) -> u64 {
        let state = self.state.lock().await;
        match state.in_flight.first() {
            Some(oldest) => *oldest - 1,
            None => state.dispatched,
        }
    }
}

/// Result of one spawned task.
struct TaskReport {
    origin: Origin,
    path: String,
    remote_id: Option<u64>,
    result: Result<ProcessOutcome>,
}

pub struct SyncEngine {
    ctx: SyncContext,
    local: Arc<LocalProcessor>,
    remote: Arc<RemoteProcessor>,
    cursor: RemoteCursor,
    observer: Option<mpsc::UnboundedSender<ProcessOutcome>>,
}

impl SyncEngine {
    pub fn new(
        ctx: SyncContext,
        sink: Arc<dyn EventSink>,
        policy: ConflictPolicy,
        resume_from: u64,
    ) -> Self {
        Self {
            local: Arc::new(LocalProcessor::new(ctx.clone(), sink)),
            remote: Arc::new(RemoteProcessor::new(ctx.clone(), policy)),
            ctx,
            cursor: RemoteCursor::new(resume_from),
            observer: None,
        }
    }

    /// Receive every successful outcome, e.g. for tests or status output.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<ProcessOutcome>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn cursor(&self) -> RemoteCursor {
        self.cursor.clone()
    }

    /// Dispatch until shutdown or until both inputs close, then wait for
    /// in-flight tasks.
    pub async fn run(
        self,
        mut local_rx: mpsc::Receiver<LocalChange>,
        mut remote_rx: mpsc::Receiver<Event>,
    ) {
        let shutdown = self.ctx.shutdown.clone();
        let mut tasks = JoinSet::new();
        let (mut local_open, mut remote_open) = (true, true);

        info!("Sync engine started");
        while local_open || remote_open {
            tokio::select! {
                _ = shutdown.wait_for_exit() => break,
                change = local_rx.recv(), if local_open => match change {
                    Some(change) => self.dispatch_local(&mut tasks, change),
                    None => local_open = false,
                },
                event = remote_rx.recv(), if remote_open => match event {
                    Some(event) => self.dispatch_remote(&mut tasks, event).await,
                    None => remote_open = false,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.supervise(joined).await;
                }
            }
        }

        if !tasks.is_empty() {
            info!("Waiting for {} in-flight events", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            self.supervise(joined).await;
        }
        info!("Sync engine stopped");
    }

    fn dispatch_local(&self, tasks: &mut JoinSet<TaskReport>, change: LocalChange) {
        let path = match self.local.relativize(&change) {
            Ok(path) => path,
            Err(e) => {
                debug!("Ignoring change: {}", e);
                return;
            }
        };

        let pending = self.ctx.locks.request(path.clone(), LockMode::Exclusive);
        let local = self.local.clone();
        tasks.spawn(async move {
            let result = local.process_pending(change, pending).await;
            TaskReport {
                origin: Origin::Local,
                path,
                remote_id: None,
                result,
            }
        });
    }

    async fn dispatch_remote(&self, tasks: &mut JoinSet<TaskReport>, event: Event) {
        let Some(id) = event.id else {
            warn!("Ignoring remote event without id for {}", event.path);
            return;
        };
        if !self.cursor.begin(id).await {
            debug!("Skipping already dispatched event #{}", id);
            return;
        }

        let path = event.path.clone();
        let pending = self.ctx.locks.request(path.clone(), LockMode::Exclusive);
        let remote = self.remote.clone();
        tasks.spawn(async move {
            let result = remote.process_pending(event, pending).await;
            TaskReport {
                origin: Origin::Remote,
                path,
                remote_id: Some(id),
                result,
            }
        });
    }

    async fn supervise(&self, joined: std::result::Result<TaskReport, tokio::task::JoinError>) {
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                // The path lock was released by unwinding; other paths are unaffected
                error!("Event task panicked: {}", e);
                return;
            }
        };

        // A cancelled remote event was never handled and must be replayed
        let cancelled = matches!(report.result, Err(SyncError::Cancelled));
        if let (Some(id), false) = (report.remote_id, cancelled) {
            self.cursor.finish(id).await;
        }

        match report.result {
            Ok(outcome) => {
                if let Some(observer) = &self.observer {
                    let _ = observer.send(outcome);
                }
            }
            Err(SyncError::Cancelled) => {
                debug!("{:?} event for {} interrupted by shutdown", report.origin, report.path);
            }
            Err(e) if e.requires_intervention() => {
                error!(
                    "{:?} event for {} left the tree inconsistent, stopping: {}",
                    report.origin, report.path, e
                );
                self.ctx.shutdown.exit(1);
            }
            Err(e) => {
                error!("{:?} event for {} failed: {}", report.origin, report.path, e);
            }
        }
    }
}
