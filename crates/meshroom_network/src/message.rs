//! Wire message protocol: the envelope exchanged between peers.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::identity::{LocalIdentity, PeerId};

/// Current protocol version stamped on every envelope we create.
pub const PROTOCOL_VERSION: u32 = 1;

/// Room used for presence envelopes and as the initial current room.
pub const DEFAULT_ROOM: &str = "global";

/// The kind of message carried in an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// User chat text (payload may be ciphertext).
    Chat,
    /// Handshake/presence announcement, empty payload.
    Presence,
    /// Out-of-band control message.
    Control,
    /// Acknowledgement. Carried but never acted on by the transport.
    Ack,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Presence => "presence",
            Self::Control => "control",
            Self::Ack => "ack",
        }
    }
}

/// A single protocol message.
///
/// `id` plus `from` identify a message. The transport never deduplicates, so
/// consumers must tolerate seeing the same envelope twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version.
    pub v: u32,
    /// Caller-generated message id.
    pub id: String,
    /// Sender peer id.
    pub from: PeerId,
    /// Sender nickname, display only.
    #[serde(default)]
    pub nick: String,
    /// Room name.
    pub room: String,
    /// Seconds since the Unix epoch, assigned by the sender.
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Opaque to the transport; may be ciphertext.
    #[serde(default)]
    pub payload: String,
    /// Present only when signing is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl Envelope {
    /// Create a new envelope stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        from: PeerId,
        nick: impl Into<String>,
        room: impl Into<String>,
        kind: MessageKind,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: id.into(),
            from,
            nick: nick.into(),
            room: room.into(),
            ts: Utc::now().timestamp(),
            kind,
            payload: payload.into(),
            sig: None,
        }
    }

    /// Presence envelope identifying `identity`, with an empty payload.
    pub fn presence(identity: &LocalIdentity) -> Self {
        Self::new(
            next_message_id(identity.peer_id()),
            identity.peer_id().clone(),
            identity.nick(),
            DEFAULT_ROOM,
            MessageKind::Presence,
            "",
        )
    }

    /// Attach a signature.
    pub fn with_sig(mut self, sig: impl Into<String>) -> Self {
        self.sig = Some(sig.into());
        self
    }

    /// The canonical string covered by a signature: every field except `sig`
    /// and the display nickname, joined with `|`.
    pub fn signing_input(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.v,
            self.id,
            self.from,
            self.room,
            self.ts,
            self.kind.as_str(),
            self.payload
        )
    }
}

/// Generate a message id of the form `<peer id>-<unix nanos>`.
pub fn next_message_id(peer_id: &PeerId) -> String {
    let nanos = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros() * 1_000);
    format!("{peer_id}-{nanos}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
