//! Bounded retry of network operations.
//!
//! Blob transfers and event submission go through [`RetryConfig::run`]: each
//! attempt is bounded by `op_timeout`, retryable failures back off
//! exponentially, and shutdown interrupts both the attempt and the wait.

use crate::error::{Result, SyncError};
use crate::shutdown::ShutdownBarrier;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Upper bound on a single attempt
    pub op_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: Some(5),
            op_timeout: Duration::from_secs(30),
        }
    }
}

/// Delay after the given failed attempt (1-based), capped at `max_delay`.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

impl RetryConfig {
    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.map(|max| attempts >= max).unwrap_or(false)
    }

    /// Run `attempt` until it succeeds, fails permanently, runs out of
    /// attempts, or shutdown is triggered (`SyncError::Cancelled`).
    ///
    /// `op` and `path` only label timeouts and log lines.
    pub async fn run<T, F, Fut>(
        &self,
        shutdown: &ShutdownBarrier,
        op: &'static str,
        path: &str,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = shutdown
                .run_until_exit(tokio::time::timeout(self.op_timeout, attempt()))
                .await;

            let err = match result {
                None => return Err(SyncError::Cancelled),
                Some(Ok(Ok(value))) => return Ok(value),
                Some(Ok(Err(e))) => e,
                Some(Err(_elapsed)) => SyncError::TimedOut {
                    op,
                    path: path.to_string(),
                },
            };

            if !err.is_retryable() || self.exhausted(attempts) {
                return Err(err);
            }

            let delay = calculate_backoff(attempts, self);
            warn!(
                "{} for {} failed (attempt {}), retrying in {:?}: {}",
                op, path, attempts, delay, err
            );
            if shutdown.run_until_exit(tokio::time::sleep(delay)).await.is_none() {
                return Err(SyncError::Cancelled);
            }
        }
    }
}
