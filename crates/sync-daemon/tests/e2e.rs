//! End-to-end tests for sync-daemon.
//!
//! Runs a real sync-server and full agents (watcher, scan, server link,
//! engine) over temporary directories sharing one blob store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sync_core::{DiscardReason, ProcessOutcome, ShutdownBarrier};
use sync_daemon::{Agent, Config, StateStore};
use sync_server::{FileEventLog, SyncServer, Users};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

const WAIT: Duration = Duration::from_secs(15);
const PASSWORD: &str = "wonderland";

struct TestServer {
    url: String,
    shutdown: ShutdownBarrier,
}

impl TestServer {
    async fn start(dir: &Path) -> Self {
        let log = FileEventLog::open(dir.join("events.jsonl")).await.unwrap();
        let shutdown = ShutdownBarrier::new();
        let listener = SyncServer::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let users = Users::default().with_user("alice", PASSWORD);
        let server = SyncServer::new(Arc::new(log), users, shutdown.clone());
        tokio::spawn(async move { server.run(listener).await });
        Self { url, shutdown }
    }
}

struct TestAgent {
    home: PathBuf,
    root: PathBuf,
    shutdown: ShutdownBarrier,
    outcomes: mpsc::UnboundedReceiver<ProcessOutcome>,
    task: JoinHandle<anyhow::Result<i32>>,
}

impl TestAgent {
    /// Start an agent whose config lives in `home`.
    async fn start(home: &Path, server_url: &str, blobs: &Path) -> Self {
        Self::start_with_password(home, server_url, blobs, PASSWORD).await
    }

    async fn start_with_password(
        home: &Path,
        server_url: &str,
        blobs: &Path,
        password: &str,
    ) -> Self {
        std::fs::create_dir_all(home).unwrap();
        let text = format!(
            "[local]\nsync_dir = 'root'\n\n[server]\nurl = '{}'\nusername = 'alice'\npassword = '{}'\n\n[blobs]\ndir = '{}'\n\n[sync]\nop_timeout_secs = 5\nretry_initial_ms = 50\n",
            server_url,
            password,
            blobs.display()
        );
        let config = Config::parse(&text, home).unwrap();
        let root = config.local.sync_dir.clone();

        let shutdown = ShutdownBarrier::new();
        let (observer, outcomes) = mpsc::unbounded_channel();
        let agent = Agent::new(config, shutdown.clone()).with_observer(observer);
        let task = tokio::spawn(agent.run());

        // Directories exist once the agent has started
        wait_until(|| root.is_dir()).await;
        Self {
            home: home.to_path_buf(),
            root,
            shutdown,
            outcomes,
            task,
        }
    }

    async fn stop(self) -> i32 {
        self.shutdown.exit(0);
        timeout(WAIT, self.task)
            .await
            .expect("agent stops")
            .unwrap()
            .unwrap()
    }

    /// Wait for an outcome concerning `path` that satisfies `wanted`.
    ///
    /// Watchers may report a write more than once, so unrelated outcomes for
    /// the same path are skipped.
    async fn wait_for(
        &mut self,
        path: &str,
        wanted: impl Fn(&ProcessOutcome) -> bool,
    ) -> ProcessOutcome {
        timeout(WAIT, async {
            loop {
                let outcome = self.outcomes.recv().await.expect("agent running");
                if outcome.event().path == path && wanted(&outcome) {
                    return outcome;
                }
            }
        })
        .await
        .expect("outcome for path")
    }

    async fn wait_for_sent(&mut self, path: &str) -> ProcessOutcome {
        self.wait_for(path, |o| matches!(o, ProcessOutcome::Sent(_)))
            .await
    }

    async fn wait_for_discard(&mut self, path: &str, reason: DiscardReason) {
        self.wait_for(path, |o| {
            assert!(
                !matches!(o, ProcessOutcome::Sent(_)),
                "unexpected send for {}",
                path
            );
            o.discard_reason() == Some(reason)
        })
        .await;
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {:?}", WAIT);
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_changes_propagate_between_agents() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::start(temp.path()).await;
    let blobs = temp.path().join("blobs");
    let alice = TestAgent::start(&temp.path().join("alice"), &server.url, &blobs).await;
    let bob = TestAgent::start(&temp.path().join("bob"), &server.url, &blobs).await;

    // Give both watchers a moment to register
    sleep(Duration::from_millis(300)).await;

    std::fs::create_dir_all(alice.root.join("docs")).unwrap();
    std::fs::write(alice.root.join("docs/notes.txt"), b"first draft").unwrap();
    let on_bob = bob.root.join("docs/notes.txt");
    wait_until(|| std::fs::read(&on_bob).ok().as_deref() == Some(&b"first draft"[..])).await;

    std::fs::write(bob.root.join("docs/notes.txt"), b"second draft").unwrap();
    let on_alice = alice.root.join("docs/notes.txt");
    wait_until(|| std::fs::read(&on_alice).ok().as_deref() == Some(&b"second draft"[..])).await;

    std::fs::remove_file(&on_alice).unwrap();
    wait_until(|| !on_bob.exists()).await;
    // The emptied directory goes with it
    wait_until(|| !bob.root.join("docs").exists()).await;

    assert_eq!(alice.stop().await, 0);
    assert_eq!(bob.stop().await, 0);
    server.shutdown.exit(0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_resumes_from_saved_state() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::start(temp.path()).await;
    let blobs = temp.path().join("blobs");
    let home = temp.path().join("agent");

    let mut agent = TestAgent::start(&home, &server.url, &blobs).await;
    sleep(Duration::from_millis(300)).await;
    std::fs::write(agent.root.join("kept.txt"), b"persisted").unwrap();
    agent.wait_for_sent("kept.txt").await;
    // Our own event comes back from the server
    agent
        .wait_for_discard("kept.txt", DiscardReason::Duplicate)
        .await;
    let home_dir = agent.home.clone();
    assert_eq!(agent.stop().await, 0);

    let saved = StateStore::new(home_dir.join("state.json"))
        .load()
        .await
        .unwrap()
        .expect("state saved");
    assert!(saved.last_remote_id >= 1);
    assert!(saved.latest.contains_key("kept.txt"));

    // The startup scan finds the file unchanged; nothing is resent
    let mut agent = TestAgent::start(&home_dir, &server.url, &blobs).await;
    agent
        .wait_for_discard("kept.txt", DiscardReason::Unchanged)
        .await;
    assert_eq!(agent.stop().await, 0);
    server.shutdown.exit(0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deletes_while_stopped_are_sent_on_restart() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::start(temp.path()).await;
    let blobs = temp.path().join("blobs");
    let home = temp.path().join("agent");

    let mut agent = TestAgent::start(&home, &server.url, &blobs).await;
    sleep(Duration::from_millis(300)).await;
    std::fs::write(agent.root.join("doomed.txt"), b"bye").unwrap();
    agent.wait_for_sent("doomed.txt").await;
    let root = agent.root.clone();
    assert_eq!(agent.stop().await, 0);

    std::fs::remove_file(root.join("doomed.txt")).unwrap();

    let mut agent = TestAgent::start(&home, &server.url, &blobs).await;
    let outcome = agent.wait_for_sent("doomed.txt").await;
    assert!(outcome.event().is_delete());
    assert_eq!(agent.stop().await, 0);
    server.shutdown.exit(0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_password_stops_agent_with_error() {
    let temp = TempDir::new().unwrap();
    let server = TestServer::start(temp.path()).await;
    let blobs = temp.path().join("blobs");

    let agent =
        TestAgent::start_with_password(&temp.path().join("agent"), &server.url, &blobs, "guess")
            .await;
    let code = timeout(WAIT, agent.task)
        .await
        .expect("agent stops on its own")
        .unwrap()
        .unwrap();
    assert_eq!(code, 1);
    server.shutdown.exit(0);
}
