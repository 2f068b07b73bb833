//! Dispatch behavior of the sync engine.

use std::sync::Arc;
use std::time::Duration;
use sync_core::{
    ConflictPolicy, DiscardReason, Event, EventLog, LocalBlobStore, LocalChange, MemoryEventLog,
    PathLocks, ProcessOutcome, RetryConfig, ShutdownBarrier, Stager, SyncContext, SyncEngine,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Harness {
    _temp: TempDir,
    root: std::path::PathBuf,
    log: Arc<MemoryEventLog>,
    shutdown: ShutdownBarrier,
    local_tx: mpsc::Sender<LocalChange>,
    remote_tx: mpsc::Sender<Event>,
    outcomes: mpsc::UnboundedReceiver<ProcessOutcome>,
    engine: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let stager = Stager::new(temp.path().join("tmp"), temp.path().join("cache"));
        stager.ensure_dirs().await.unwrap();
        let blobs = LocalBlobStore::open(temp.path().join("blobs")).await.unwrap();
        let log = Arc::new(MemoryEventLog::new());
        let shutdown = ShutdownBarrier::new();

        let ctx = SyncContext {
            root: root.clone(),
            stager,
            blobs: Arc::new(blobs),
            locks: PathLocks::spawn(),
            retry: RetryConfig::default(),
            shutdown: shutdown.clone(),
        };
        let (observer, outcomes) = mpsc::unbounded_channel();
        let engine = SyncEngine::new(ctx, log.clone(), ConflictPolicy::default(), 0)
            .with_observer(observer);

        let (local_tx, local_rx) = mpsc::channel(64);
        let (remote_tx, remote_rx) = mpsc::channel(64);
        let engine = tokio::spawn(engine.run(local_rx, remote_rx));

        Self {
            _temp: temp,
            root,
            log,
            shutdown,
            local_tx,
            remote_tx,
            outcomes,
            engine,
        }
    }

    async fn next_outcome(&mut self) -> ProcessOutcome {
        timeout(Duration::from_secs(5), self.outcomes.recv())
            .await
            .expect("outcome within 5s")
            .expect("engine running")
    }
}

#[tokio::test]
async fn test_same_path_keeps_arrival_order() {
    let mut h = Harness::start().await;
    let file = h.root.join("a.txt");
    std::fs::write(&file, b"hello").unwrap();

    h.local_tx.send(LocalChange::update(&file)).await.unwrap();
    h.local_tx.send(LocalChange::delete(&file)).await.unwrap();

    let first = h.next_outcome().await;
    let second = h.next_outcome().await;
    assert!(first.event().is_update());
    assert!(second.event().is_delete());
    assert!(matches!(second, ProcessOutcome::Sent(_)));
    assert_eq!(second.event().predecessor, first.event().hash);
}

#[tokio::test]
async fn test_own_echo_is_discarded() {
    let mut h = Harness::start().await;
    let file = h.root.join("echo.txt");
    std::fs::write(&file, b"mine").unwrap();

    h.local_tx.send(LocalChange::update(&file)).await.unwrap();
    let sent = h.next_outcome().await;
    assert!(matches!(sent, ProcessOutcome::Sent(_)));

    let echoed = h.log.retrieve_range(1, 1).await.unwrap().remove(0);
    h.remote_tx.send(echoed.clone()).await.unwrap();
    let outcome = h.next_outcome().await;
    assert_eq!(outcome.discard_reason(), Some(DiscardReason::Duplicate));

    // Re-delivery of the same id is dropped before processing
    h.remote_tx.send(echoed).await.unwrap();
    assert!(
        timeout(Duration::from_millis(100), h.outcomes.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_changes_outside_root_are_ignored() {
    let mut h = Harness::start().await;
    h.local_tx
        .send(LocalChange::update("/definitely/not/under/root.txt"))
        .await
        .unwrap();

    let inside = h.root.join("in.txt");
    std::fs::write(&inside, b"x").unwrap();
    h.local_tx.send(LocalChange::update(&inside)).await.unwrap();

    let outcome = h.next_outcome().await;
    assert_eq!(outcome.event().path, "in.txt");
}

#[tokio::test]
async fn test_engine_stops_on_shutdown() {
    let h = Harness::start().await;
    h.shutdown.exit(0);
    timeout(Duration::from_secs(5), h.engine)
        .await
        .expect("engine stops")
        .unwrap();
}

#[tokio::test]
async fn test_engine_stops_when_inputs_close() {
    let h = Harness::start().await;
    drop(h.local_tx);
    drop(h.remote_tx);
    timeout(Duration::from_secs(5), h.engine)
        .await
        .expect("engine stops")
        .unwrap();
}
