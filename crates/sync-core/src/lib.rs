//! sync-core: hash-chained file synchronization between peers and a server.
//!
//! This crate provides the core functionality for:
//! - The event model and its per-path hash chain
//! - Staging, hashing and content-addressed caching of file content
//! - Per-path serialization of local and remote work (path lock manager)
//! - Local and remote event processing, including conflict detection
//! - Blob store, event log and event sink abstractions
//! - The agent/server wire protocol and the dispatch engine

pub mod blob;
pub mod conflict;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod event_log;
pub mod fs_util;
pub mod local;
pub mod outcome;
pub mod path_lock;
pub mod peer_id;
pub mod protocol;
pub mod remote;
pub mod retry;
pub mod shutdown;
pub mod stage;
pub mod transport;

pub use blob::{BlobError, BlobStore, LocalBlobStore};
pub use conflict::{Conflict, ConflictPolicy};
pub use context::SyncContext;
pub use engine::{Origin, RemoteCursor, SyncEngine};
pub use error::{Result, SyncError};
pub use event::{ContentHash, ContentHashError, Event, EventStatus, EventType};
pub use event_log::{EventLog, LogError, MemoryEventLog};
pub use local::{LocalChange, LocalProcessor};
pub use outcome::{DiscardReason, ProcessOutcome};
pub use path_lock::{LockError, LockMode, PathGuard, PathLocks, PendingLock};
pub use peer_id::{PeerId, PeerIdError};
pub use protocol::{ClientMessage, Credentials, ProtocolError, ServerMessage};
pub use remote::RemoteProcessor;
pub use retry::RetryConfig;
pub use shutdown::ShutdownBarrier;
pub use stage::{StagedFile, Stager, hash_file};
pub use transport::{EventSink, TransportError};
