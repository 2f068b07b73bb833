//! Results of processing one event.

use crate::conflict::Conflict;
use crate::event::Event;
use std::fmt::{self, Display, Formatter};

/// Why an event was marked `DISCARDED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscardReason {
    /// The changed file disappeared before it could be staged
    SourceVanished,
    /// Content matches the latest event
    Unchanged,
    /// The latest event for the path is already a delete
    DuplicateDelete,
    /// Remote event older than the latest event for the path
    Stale,
    /// Remote event describes the state the path is already in
    Duplicate,
}

impl Display for DiscardReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DiscardReason::SourceVanished => "source vanished",
            DiscardReason::Unchanged => "unchanged",
            DiscardReason::DuplicateDelete => "duplicate delete",
            DiscardReason::Stale => "stale",
            DiscardReason::Duplicate => "duplicate",
        };
        f.write_str(reason)
    }
}

/// What happened to an event that was processed without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Local event appended to the server log
    Sent(Event),
    /// Remote event written to the local tree
    Applied {
        event: Event,
        conflict: Option<Conflict>,
    },
    /// Event dropped without side effects
    Discarded { event: Event, reason: DiscardReason },
}

impl ProcessOutcome {
    pub fn event(&self) -> &Event {
        match self {
            ProcessOutcome::Sent(event) => event,
            ProcessOutcome::Applied { event, .. } => event,
            ProcessOutcome::Discarded { event, .. } => event,
        }
    }

    pub fn into_event(self) -> Event {
        match self {
            ProcessOutcome::Sent(event) => event,
            ProcessOutcome::Applied { event, .. } => event,
            ProcessOutcome::Discarded { event, .. } => event,
        }
    }

    pub fn discard_reason(&self) -> Option<DiscardReason> {
        match self {
            ProcessOutcome::Discarded { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn conflict(&self) -> Option<&Conflict> {
        match self {
            ProcessOutcome::Applied { conflict, .. } => conflict.as_ref(),
            _ => None,
        }
    }
}
