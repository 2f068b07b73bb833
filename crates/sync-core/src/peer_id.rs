//! Agent identity.
//!
//! A random non-zero u64, written as 16 lowercase hex digits in `hello`
//! frames, logs and the agent's state file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const PEER_ID_HEX_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("Peer id must be 16 hex digits, got {0:?}")]
    InvalidFormat(String),
    #[error("Peer id must not be zero")]
    Zero,
}

/// Identity of an agent, generated once and kept in its persisted state.
///
/// ```
/// use sync_core::PeerId;
///
/// let peer: PeerId = "00c0ffee00c0ffee".parse().unwrap();
/// assert_eq!(peer.to_string(), "00c0ffee00c0ffee");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(u64);

impl PeerId {
    pub fn generate() -> Self {
        let id = rand::random::<u64>();
        // Zero is reserved
        Self(id.max(1))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$x}", self.0, width = PEER_ID_HEX_LEN)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed = s.len() == PEER_ID_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit());
        let id = well_formed
            .then(|| u64::from_str_radix(s, 16).ok())
            .flatten()
            .ok_or_else(|| PeerIdError::InvalidFormat(s.to_string()))?;
        match id {
            0 => Err(PeerIdError::Zero),
            id => Ok(Self(id)),
        }
    }
}

impl TryFrom<String> for PeerId {
    type Error = PeerIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PeerId> for String {
    fn from(peer: PeerId) -> String {
        peer.to_string()
    }
}
