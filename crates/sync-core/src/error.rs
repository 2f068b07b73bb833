//! Error type returned by the event processors.
//!
//! Outcomes that are part of normal operation (discarded events, conflicts)
//! are not errors; see [`crate::ProcessOutcome`]. What remains is split into
//! retryable transport failures, permanent local failures, and the few local
//! failures that leave the synced tree in a state needing an operator.

use crate::blob::BlobError;
use crate::event::ContentHash;
use crate::transport::TransportError;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to move {} into place at {}: {source}", staged.display(), target.display())]
    Placement {
        staged: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Path is outside the sync root: {}", .0.display())]
    OutsideRoot(PathBuf),

    #[error("Blob {hash}: {source}")]
    Blob {
        hash: ContentHash,
        #[source]
        source: BlobError,
    },

    #[error("Failed to send event for {path}: {source}")]
    Transport {
        path: String,
        #[source]
        source: TransportError,
    },

    #[error("{op} timed out for {path}")]
    TimedOut { op: &'static str, path: String },

    #[error("Malformed event for {path}: {reason}")]
    InvalidEvent { path: String, reason: &'static str },

    #[error("Path lock manager stopped")]
    LockManagerStopped,

    #[error("Interrupted by shutdown")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Build a mapper for `map_err` that tags an io error with the operation and path.
    pub fn io<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> SyncError + 'a {
        move |source| SyncError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the same operation may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { source, .. } => source.is_retryable(),
            SyncError::Blob { source, .. } => source.is_retryable(),
            SyncError::TimedOut { .. } => true,
            _ => false,
        }
    }

    /// Whether the synced tree may be left inconsistent, so the process should
    /// stop rather than carry on with other paths.
    pub fn requires_intervention(&self) -> bool {
        matches!(self, SyncError::Placement { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transport = SyncError::Transport {
            path: "a.txt".into(),
            source: TransportError::NotConnected,
        };
        assert!(transport.is_retryable());
        assert!(!transport.requires_intervention());

        let rejected = SyncError::Transport {
            path: "a.txt".into(),
            source: TransportError::Rejected("log full".into()),
        };
        assert!(!rejected.is_retryable());

        let placement = SyncError::Placement {
            staged: "/tmp/x".into(),
            target: "/sync/a.txt".into(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(placement.requires_intervention());
        assert!(!placement.is_retryable());
    }

    #[test]
    fn test_io_error_names_operation_and_path() {
        let err = SyncError::io("stage", Path::new("/sync/notes.txt"))(io::Error::from(
            io::ErrorKind::PermissionDenied,
        ));
        let msg = err.to_string();
        assert!(msg.contains("stage"));
        assert!(msg.contains("/sync/notes.txt"));
    }
}
