//! Wire protocol between agents and the sync server.
//!
//! Every frame is one JSON object tagged by `"type"`. A session opens with
//! `hello`/`welcome`; afterwards the agent submits events and the server
//! streams every appended event (including the agent's own) in log order.
//! File content never travels here, only through the blob store.

use crate::event::Event;
use crate::peer_id::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current protocol version.
///
/// Increment when making breaking changes to the protocol.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (1 MiB). Events are small; anything larger is hostile.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid message: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    TooLarge(usize),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u32),
}

/// Account an agent logs in with.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Agent to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// First frame of a session
    Hello {
        version: u32,
        peer_id: PeerId,
        username: String,
        password: String,
        /// Replay starts after this id (0 = from the beginning)
        resume_from: u64,
    },
    /// Append a locally originated event
    Submit { event: Event },
}

/// Server to agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Reply to `hello`
    Welcome { version: u32, last_id: u64 },
    /// Reply to a `hello` with bad credentials; the server then closes
    Denied { reason: String },
    /// An event from the log, replayed or live
    Event { event: Event },
    /// The submitted event with this `local_id` was appended as `id`
    Ack { local_id: u64, id: u64 },
    /// The submitted event with this `local_id` was not appended
    Rejected { local_id: u64, reason: String },
}

impl ClientMessage {
    pub fn hello(peer_id: PeerId, credentials: &Credentials, resume_from: u64) -> Self {
        ClientMessage::Hello {
            version: PROTOCOL_VERSION,
            peer_id,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            resume_from,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ClientMessage serialization should not fail")
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        check_size(text)?;
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerMessage {
    pub fn welcome(last_id: u64) -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            last_id,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage serialization should not fail")
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        check_size(text)?;
        Ok(serde_json::from_str(text)?)
    }
}

/// Refuse peers speaking a different protocol version.
pub fn check_version(version: u32) -> Result<(), ProtocolError> {
    if version == PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(ProtocolError::UnsupportedVersion(version))
    }
}

fn check_size(text: &str) -> Result<(), ProtocolError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge(text.len()));
    }
    Ok(())
}
