//! Peer identity: process-lifetime peer ids and the local identity record.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A unique identifier for a peer, stable for the lifetime of its process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used for mDNS instance and host names.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The local peer's identity: a fixed id and a display nickname that may
/// change at runtime without affecting identity.
///
/// Cloning shares the nickname cell, so a `/nick` change is seen by the
/// transport and discovery handles built from the same identity.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    peer_id: PeerId,
    nick: Arc<RwLock<String>>,
}

impl LocalIdentity {
    /// Create an identity with a fresh PeerId.
    pub fn generate(nick: impl Into<String>) -> Self {
        Self::new(PeerId::generate(), nick)
    }

    /// Create an identity with a known PeerId.
    pub fn new(peer_id: PeerId, nick: impl Into<String>) -> Self {
        Self {
            peer_id,
            nick: Arc::new(RwLock::new(nick.into())),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Current display nickname.
    pub fn nick(&self) -> String {
        self.nick.read().clone()
    }

    pub fn set_nick(&self, nick: impl Into<String>) {
        *self.nick.write() = nick.into();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
