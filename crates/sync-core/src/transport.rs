//! EventSink trait: how a processor hands a local event to the server.
//!
//! Implementations:
//! - `ServerLink` (in sync-daemon) - WebSocket link to sync-server
//! - `MemoryEventLog` - appends straight into an in-process log (tests)

use crate::event::Event;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Not connected to server")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Timed out waiting for server")]
    Timeout,

    #[error("Server rejected event: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Rejections are final; everything else is a connectivity problem.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Destination for locally originated events.
///
/// Submissions from one peer are delivered in the order they are made.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Submit an event and wait until it is durably appended.
    ///
    /// Returns the id the server's log assigned to it.
    async fn submit(&self, event: &Event) -> Result<u64>;
}
