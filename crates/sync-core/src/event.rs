//! Event data model: the unit of change exchanged between peers and the server.
//!
//! Every change to a synced path is described by an [`Event`]. Events for the
//! same path form a hash chain: each applied event's `predecessor` is the
//! `hash` of the event applied before it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Number of hex characters in a [`ContentHash`] (SHA-256).
pub const HASH_HEX_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentHashError {
    #[error("Invalid content hash: expected 64 hex chars, got {0:?}")]
    InvalidFormat(String),
}

/// Content digest of a file: lowercase hex SHA-256.
///
/// Used both as the blob store key and as the causality marker in the
/// per-path hash chain, so every node must compute it the same way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Digest a byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::from_digest(Sha256::digest(data).as_slice())
    }

    /// Wrap a finished SHA-256 digest.
    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `len` hex characters, used for conflict file names and logs.
    pub fn short(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = ContentHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == HASH_HEX_LEN && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(ContentHashError::InvalidFormat(s.to_string()))
        }
    }
}

impl TryFrom<String> for ContentHash {
    type Error = ContentHashError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> String {
        hash.0
    }
}

/// Kind of change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    /// File created, or its content or permissions changed
    Update,
    /// File removed
    Delete,
}

/// Independent boolean facts about an event, stored as bit flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventStatus(u32);

impl EventStatus {
    /// Superseded or redundant; must not be applied or forwarded.
    pub const DISCARDED: Self = Self(1 << 0);
    /// Arrived with a predecessor that does not match local state.
    pub const CONFLICTED: Self = Self(1 << 1);
    /// Written to the local tree by the remote processor.
    pub const APPLIED: Self = Self(1 << 2);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for EventStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A single change to one path.
///
/// Immutable once the server has appended it to the log (`id` set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Server-assigned log position; `None` until durably appended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Sequence number assigned by the originating peer
    #[serde(default)]
    pub local_id: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub status: EventStatus,
    /// Slash-separated path relative to the sync root
    pub path: String,
    /// Content hash after this event; `None` for deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,
    /// Content hash of the path before this event; `None` if first known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<ContentHash>,
    /// Wall-clock nanoseconds since the Unix epoch. Tie-break only.
    pub timestamp: i64,
    /// Unix mode bits, meaningful for updates
    #[serde(default)]
    pub permissions: u32,
    /// Set once the event has been appended to a durable log
    #[serde(default)]
    pub in_db: bool,
}

impl Event {
    /// Create an event of the given type, stamped with the current time.
    pub fn new(event_type: EventType, path: impl Into<String>) -> Self {
        Self {
            id: None,
            local_id: 0,
            event_type,
            status: EventStatus::empty(),
            path: path.into(),
            hash: None,
            predecessor: None,
            timestamp: now_nanos(),
            permissions: 0,
            in_db: false,
        }
    }

    pub fn update(path: impl Into<String>) -> Self {
        Self::new(EventType::Update, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(EventType::Delete, path)
    }

    pub fn is_update(&self) -> bool {
        self.event_type == EventType::Update
    }

    pub fn is_delete(&self) -> bool {
        self.event_type == EventType::Delete
    }

    pub fn is_discarded(&self) -> bool {
        self.status.contains(EventStatus::DISCARDED)
    }

    /// Two events describe the same resulting state of a path.
    pub fn is_same_event(&self, other: &Event) -> bool {
        self.event_type == other.event_type
            && self.hash == other.hash
            && self.permissions == other.permissions
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
