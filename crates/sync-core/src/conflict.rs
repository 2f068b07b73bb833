//! Conflict detection and the policy for resolving one.
//!
//! A remote event conflicts with local state when the hash this peer last
//! recorded for the path is neither the event's predecessor nor its result:
//! the remote chain does not descend from what this peer has.

use crate::event::{ContentHash, Event};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Hex characters of the content hash used in conflict file names.
pub const CONFLICT_HASH_LEN: usize = 8;

/// What to do with the local version when a conflicting remote event arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Move the local file aside as `<stem>@<short-hash>.<ext>`, then apply
    /// the remote event. The preserved copy syncs like any other new file.
    #[default]
    PreserveLocal,
    /// Apply the remote event over the local file
    LastWriterWins,
}

impl Display for ConflictPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::PreserveLocal => f.write_str("preserve_local"),
            ConflictPolicy::LastWriterWins => f.write_str("last_writer_wins"),
        }
    }
}

/// A detected conflict, reported alongside the applied remote event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: String,
    /// Latest event this peer had recorded for the path
    pub local: Event,
    /// The remote event that did not descend from it
    pub remote: Event,
    /// Relative path the local version was moved to, if it was preserved
    pub preserved_as: Option<String>,
}

/// Check whether `remote` conflicts with the locally recorded `local`.
pub fn is_conflict(local: &Event, remote: &Event) -> bool {
    local.hash != remote.predecessor && local.hash != remote.hash
}

/// Name for a preserved copy of `path` whose content hashes to `hash`.
///
/// `docs/notes.txt` becomes `docs/notes@1a2b3c4d.txt`; a name with no
/// extension (or a dotfile) gets the suffix appended.
pub fn conflict_path(path: &str, hash: &ContentHash) -> String {
    let (dir, name) = match path.rfind('/') {
        Some(i) => path.split_at(i + 1),
        None => ("", path),
    };
    let version = hash.short(CONFLICT_HASH_LEN);

    let renamed = match name.rfind('.') {
        Some(i) if i > 0 => format!("{}@{}{}", &name[..i], version, &name[i..]),
        _ => format!("{}@{}", name, version),
    };
    format!("{}{}", dir, renamed)
}
