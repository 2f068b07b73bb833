//! The server's ordered, append-only event log.
//!
//! Ids start at 1 and increase by one per append, so a peer that has seen
//! everything up to `n` resumes with `retrieve_range(n + 1, ..)`.

use crate::event::{Event, EventStatus};
use crate::transport::{self, EventSink, TransportError};
use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};

/// Capacity of the live-append broadcast channel.
pub const SUBSCRIBER_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Event log IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt event log record at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Event log record at line {line} has id {found:?}, expected {expected}")]
    OutOfOrder {
        line: usize,
        expected: u64,
        found: Option<u64>,
    },

    #[error("Event {0} is already in the log")]
    AlreadyAppended(u64),

    #[error("Event log is unusable after a failed append; restart to recover")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, LogError>;

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Durably append `event`, returning it with `id` assigned and `in_db` set.
    async fn append(&self, event: Event) -> Result<Event>;

    /// Up to `max` events with id >= `first_id`, in id order.
    async fn retrieve_range(&self, first_id: u64, max: usize) -> Result<Vec<Event>>;

    /// Id of the most recent event, or 0 when empty.
    async fn last_id(&self) -> u64;
}

/// Turn a submitted event into the record stored at position `id`.
///
/// Status flags describe how one peer processed the event and are not
/// part of the shared record.
pub fn stamp(mut event: Event, id: u64) -> Result<Event> {
    if let Some(existing) = event.id {
        return Err(LogError::AlreadyAppended(existing));
    }
    event.id = Some(id);
    event.in_db = true;
    event.status = EventStatus::empty();
    Ok(event)
}

/// Select the stored events for a `retrieve_range` call.
///
/// `events[i]` must hold id `i + 1`.
pub fn slice_range(events: &[Event], first_id: u64, max: usize) -> Vec<Event> {
    let start = first_id.saturating_sub(1) as usize;
    events.iter().skip(start).take(max).cloned().collect()
}

/// In-process log. Also usable directly as an [`EventSink`], which wires
/// processors together without a server in tests.
pub struct MemoryEventLog {
    events: RwLock<Vec<Event>>,
    appended: broadcast::Sender<Event>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        let (appended, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            events: RwLock::new(Vec::new()),
            appended,
        }
    }

    /// Receive every event appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.appended.subscribe()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> Result<Event> {
        let mut events = self.events.write().await;
        let stored = stamp(event, events.len() as u64 + 1)?;
        events.push(stored.clone());
        // No subscribers is fine
        let _ = self.appended.send(stored.clone());
        Ok(stored)
    }

    async fn retrieve_range(&self, first_id: u64, max: usize) -> Result<Vec<Event>> {
        Ok(slice_range(&self.events.read().await, first_id, max))
    }

    async fn last_id(&self) -> u64 {
        self.events.read().await.len() as u64
    }
}

#[async_trait]
impl EventSink for MemoryEventLog {
    async fn submit(&self, event: &Event) -> transport::Result<u64> {
        let stored = self
            .append(event.clone())
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        stored
            .id
            .ok_or_else(|| TransportError::Rejected("log assigned no id".into()))
    }
}
