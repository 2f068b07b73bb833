//! Process-wide shutdown coordination.
//!
//! Created once at startup and cloned into every long-running worker. Any
//! worker may call [`ShutdownBarrier::exit`]; a termination signal does the
//! same with code 0. Every waiter, past or future, then sees the same code.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ShutdownBarrier {
    tx: Arc<watch::Sender<Option<i32>>>,
}

impl ShutdownBarrier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger shutdown. Only the first call decides the exit code.
    pub fn exit(&self, code: i32) {
        let first = self.tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(code);
                true
            } else {
                false
            }
        });
        if first {
            info!("Shutdown requested (exit code {})", code);
        }
    }

    /// The exit code, if shutdown has been triggered.
    pub fn exit_code(&self) -> Option<i32> {
        *self.tx.borrow()
    }

    pub fn is_triggered(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Block until shutdown is triggered and return the exit code.
    pub async fn wait_for_exit(&self) -> i32 {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(code) => (*code).unwrap_or(0),
            // The sender lives in `self`, so this cannot close while we wait
            Err(_) => 0,
        }
    }

    /// Run `fut` unless shutdown is triggered first, in which case it is
    /// dropped and `None` is returned.
    pub async fn run_until_exit<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            output = fut => Some(output),
            _ = self.wait_for_exit() => None,
        }
    }

    /// Trigger shutdown with code 0 on Ctrl-C or SIGTERM.
    pub fn listen_for_signals(&self) {
        let barrier = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("Shutdown signal received");
            barrier.exit(0);
        });
    }
}

impl Default for ShutdownBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
