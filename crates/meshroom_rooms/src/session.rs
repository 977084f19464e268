//! Chat session: applies room crypto around the payload and feeds the room
//! store.
//!
//! Outgoing text is encrypted for encrypted rooms and optionally signed.
//! Incoming envelopes are verified, decrypted and stored. This is the only
//! layer that touches the crypto capability; the transport never does.

use std::sync::Arc;

use meshroom_core::config::SecuritySettings;
use meshroom_core::security::{self, CryptoError, RoomKey};
use meshroom_network::codec;
use meshroom_network::message::next_message_id;
use meshroom_network::{Envelope, MessageKind, NetworkError, PeerId};
use tracing::{debug, warn};

use crate::room::{Room, RoomManager};

/// Salt used to turn `shared_secret` into a signing key.
pub const SHARED_SECRET_SALT: &str = "meshroom-signing";

/// Sender id stamped on local notices.
pub const SYSTEM_SENDER: &str = "system";

/// Errors from composing a message.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Nothing to send")]
    Empty,

    #[error("Room '{0}' is encrypted but has no key")]
    MissingKey(String),

    #[error("Message too long: {len} bytes on the wire, limit is {max}")]
    TooLarge { len: usize, max: usize },

    #[error(transparent)]
    Network(NetworkError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// How outgoing envelopes are signed and incoming ones checked.
#[derive(Debug, Clone, Default)]
pub struct SigningPolicy {
    pub sign_messages: bool,
    /// Signing key for rooms that have no key of their own.
    pub shared_key: Option<RoomKey>,
    pub require_signatures: bool,
}

impl SigningPolicy {
    pub fn from_settings(settings: &SecuritySettings) -> Result<Self, CryptoError> {
        let shared_key = settings
            .shared_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|secret| security::derive_key(secret, SHARED_SECRET_SALT))
            .transpose()?;
        Ok(Self {
            sign_messages: settings.sign_messages,
            shared_key,
            require_signatures: settings.require_signatures,
        })
    }
}

/// A composed chat message: the plaintext copy recorded locally and the
/// envelope to broadcast.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub local: Envelope,
    pub wire: Envelope,
}

/// Why an incoming envelope was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    BadSignature,
    MissingSignature,
    Undecryptable,
}

/// Outcome of [`ChatSession::ingest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    /// A chat message was stored; the envelope carries the plaintext.
    Stored(Envelope),
    /// A presence envelope updated the roster.
    Presence { peer_id: PeerId, nick: String },
    /// Control and ack envelopes are accepted but not stored.
    Ignored(MessageKind),
    Rejected(Rejection),
}

pub struct ChatSession {
    rooms: Arc<RoomManager>,
    policy: SigningPolicy,
}

impl ChatSession {
    pub fn new(rooms: Arc<RoomManager>, policy: SigningPolicy) -> Self {
        Self { rooms, policy }
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    fn signing_key<'a>(&'a self, room: Option<&'a Room>) -> Option<&'a RoomKey> {
        room.and_then(Room::key).or(self.policy.shared_key.as_ref())
    }

    /// Build a chat envelope for the current room and record its plaintext
    /// copy in the room history. Text that would not fit in one frame is
    /// refused and nothing is recorded.
    pub fn compose(&self, text: &str) -> Result<Outgoing, SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::Empty);
        }
        let room = self.rooms.current();
        let from = self.rooms.peer_id().clone();
        let mut wire = Envelope::new(
            next_message_id(&from),
            from,
            self.rooms.nick(),
            room.name(),
            MessageKind::Chat,
            text,
        );

        if room.is_encrypted() {
            let key = room
                .key()
                .ok_or_else(|| SessionError::MissingKey(room.name().to_string()))?;
            wire.payload = security::encrypt(key, text)?;
        }

        if self.policy.sign_messages {
            match self.signing_key(Some(room.as_ref())) {
                Some(key) => wire.sig = Some(security::sign(key, &wire.signing_input())?),
                None => debug!("Signing enabled but no key for room '{}'", room.name()),
            }
        }

        match codec::encode(&wire) {
            Ok(_) => {}
            Err(NetworkError::FrameTooLarge { len, max }) => {
                return Err(SessionError::TooLarge { len, max });
            }
            Err(e) => return Err(SessionError::Network(e)),
        }

        let local = Envelope {
            payload: text.to_string(),
            ..wire.clone()
        };
        room.push(local.clone());
        Ok(Outgoing { local, wire })
    }

    /// Apply one received envelope to the room store.
    pub fn ingest(&self, envelope: Envelope) -> Ingested {
        match envelope.kind {
            MessageKind::Presence => {
                self.rooms.note_presence(&envelope);
                Ingested::Presence {
                    peer_id: envelope.from,
                    nick: envelope.nick,
                }
            }
            MessageKind::Chat => self.ingest_chat(envelope),
            kind @ (MessageKind::Control | MessageKind::Ack) => {
                debug!("Ignoring {} envelope {} from {}", kind.as_str(), envelope.id, envelope.from);
                Ingested::Ignored(kind)
            }
        }
    }

    fn ingest_chat(&self, mut envelope: Envelope) -> Ingested {
        let room = self.rooms.room(&envelope.room);

        match (&envelope.sig, self.signing_key(room.as_deref())) {
            (Some(sig), Some(key)) => {
                if !security::verify(key, &envelope.signing_input(), sig) {
                    warn!("Dropping {} from {}: bad signature", envelope.id, envelope.from);
                    return Ingested::Rejected(Rejection::BadSignature);
                }
            }
            (Some(_), None) if self.policy.require_signatures => {
                warn!("Dropping {} from {}: no key to verify", envelope.id, envelope.from);
                return Ingested::Rejected(Rejection::BadSignature);
            }
            (None, _) if self.policy.require_signatures => {
                warn!("Dropping {} from {}: unsigned", envelope.id, envelope.from);
                return Ingested::Rejected(Rejection::MissingSignature);
            }
            _ => {}
        }

        if let Some(room) = room.as_deref().filter(|r| r.is_encrypted()) {
            let plaintext = room
                .key()
                .ok_or(CryptoError::InvalidKey)
                .and_then(|key| security::decrypt(key, &envelope.payload));
            match plaintext {
                Ok(text) => envelope.payload = text,
                Err(e) => {
                    warn!("Dropping {} from {} in '{}': {e}", envelope.id, envelope.from, room.name());
                    return Ingested::Rejected(Rejection::Undecryptable);
                }
            }
        }

        self.rooms.add_message(envelope.clone());
        Ingested::Stored(envelope)
    }

    /// Record a local notice (help text, lookups) in the current room.
    pub fn system_notice(&self, text: &str) -> Envelope {
        let room = self.rooms.current();
        let from = PeerId::from_string(SYSTEM_SENDER);
        let notice = Envelope::new(
            next_message_id(&from),
            from,
            SYSTEM_SENDER,
            room.name(),
            MessageKind::Control,
            text,
        );
        room.push_notice(notice.clone());
        notice
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use meshroom_core::security::derive_key;

    fn session(nick: &str, policy: SigningPolicy) -> ChatSession {
        let rooms = Arc::new(RoomManager::new(nick, PeerId::from_string(nick)));
        ChatSession::new(rooms, policy)
    }

    fn join_secret(s: &ChatSession) {
        let key = derive_key("hunter2", "ops").unwrap();
        s.rooms().join("ops", true, Some(key));
    }

    #[test]
    fn plain_message_travels_as_is() {
        let alice = session("alice", SigningPolicy::default());
        let bob = session("bob", SigningPolicy::default());

        let out = alice.compose("Hello Bob").unwrap();
        assert_eq!(out.wire.payload, "Hello Bob");
        assert!(out.wire.sig.is_none());
        assert!(out.wire.id.starts_with("alice-"));
        assert_eq!(alice.rooms().get_messages("global").len(), 1);

        match bob.ingest(out.wire) {
            Ingested::Stored(env) => assert_eq!(env.payload, "Hello Bob"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(bob.rooms().get_messages("global").len(), 1);
    }

    #[test]
    fn encrypted_room_hides_payload_on_the_wire() {
        let alice = session("alice", SigningPolicy::default());
        let bob = session("bob", SigningPolicy::default());
        join_secret(&alice);
        join_secret(&bob);

        let out = alice.compose("top secret").unwrap();
        assert_ne!(out.wire.payload, "top secret");
        assert_eq!(out.local.payload, "top secret");

        assert!(matches!(bob.ingest(out.wire), Ingested::Stored(ref e) if e.payload == "top secret"));
        assert_eq!(bob.rooms().get_messages("ops")[0].payload, "top secret");
    }

    #[test]
    fn wrong_passphrase_is_dropped() {
        let alice = session("alice", SigningPolicy::default());
        let eve = session("eve", SigningPolicy::default());
        join_secret(&alice);
        eve.rooms()
            .join("ops", true, Some(derive_key("guess", "ops").unwrap()));

        let out = alice.compose("top secret").unwrap();
        assert_eq!(eve.ingest(out.wire), Ingested::Rejected(Rejection::Undecryptable));
        assert!(eve.rooms().get_messages("ops").is_empty());
    }

    #[test]
    fn signed_messages_verify_with_shared_secret() {
        let settings = SecuritySettings {
            sign_messages: true,
            shared_secret: Some("lan-secret".into()),
            require_signatures: true,
            persist_keys: false,
        };
        let policy = SigningPolicy::from_settings(&settings).unwrap();
        let alice = session("alice", policy.clone());
        let bob = session("bob", policy);

        let out = alice.compose("signed").unwrap();
        assert!(out.wire.sig.is_some());
        assert!(matches!(bob.ingest(out.wire.clone()), Ingested::Stored(_)));

        let mut forged = out.wire;
        forged.payload = "forged".into();
        assert_eq!(bob.ingest(forged), Ingested::Rejected(Rejection::BadSignature));
    }

    #[test]
    fn unsigned_message_rejected_when_required() {
        let alice = session("alice", SigningPolicy::default());
        let strict = session(
            "bob",
            SigningPolicy {
                require_signatures: true,
                ..SigningPolicy::default()
            },
        );
        let out = alice.compose("hi").unwrap();
        assert_eq!(strict.ingest(out.wire), Ingested::Rejected(Rejection::MissingSignature));
    }

    #[test]
    fn encrypted_room_signs_with_room_key() {
        let policy = SigningPolicy {
            sign_messages: true,
            ..SigningPolicy::default()
        };
        let alice = session("alice", policy.clone());
        let bob = session("bob", policy);
        join_secret(&alice);
        join_secret(&bob);

        let out = alice.compose("both").unwrap();
        let key = derive_key("hunter2", "ops").unwrap();
        assert!(security::verify(&key, &out.wire.signing_input(), out.wire.sig.as_deref().unwrap()));
        assert!(matches!(bob.ingest(out.wire), Ingested::Stored(_)));
    }

    #[test]
    fn presence_only_touches_roster() {
        let bob = session("bob", SigningPolicy::default());
        let identity = meshroom_network::LocalIdentity::new(PeerId::from_string("alice"), "alice");
        let presence = Envelope::presence(&identity);

        assert_eq!(
            bob.ingest(presence),
            Ingested::Presence {
                peer_id: PeerId::from_string("alice"),
                nick: "alice".into()
            }
        );
        assert!(bob.rooms().get_messages("global").is_empty());
        assert_eq!(bob.rooms().roster("global"), vec![PeerId::from_string("alice")]);
    }

    #[test]
    fn control_and_ack_are_not_stored() {
        let bob = session("bob", SigningPolicy::default());
        for kind in [MessageKind::Control, MessageKind::Ack] {
            let env = Envelope::new("x", PeerId::from_string("a"), "a", "global", kind, "");
            assert_eq!(bob.ingest(env), Ingested::Ignored(kind));
        }
        assert!(bob.rooms().get_messages("global").is_empty());
    }

    #[test]
    fn oversized_text_is_refused_and_not_recorded() {
        let alice = session("alice", SigningPolicy::default());
        let text = "z".repeat(codec::MAX_FRAME_LEN);
        match alice.compose(&text) {
            Err(SessionError::TooLarge { len, max }) => {
                assert!(len > max);
                assert_eq!(max, codec::MAX_FRAME_LEN);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(alice.rooms().get_messages("global").is_empty());
    }

    #[test]
    fn ciphertext_growth_counts_against_the_limit() {
        let alice = session("alice", SigningPolicy::default());
        join_secret(&alice);
        // Fits as plaintext, but base64 ciphertext is a third larger.
        let text = "q".repeat(codec::MAX_FRAME_LEN * 4 / 5);
        assert!(matches!(alice.compose(&text), Err(SessionError::TooLarge { .. })));
        assert!(alice.rooms().get_messages("ops").is_empty());
    }

    #[test]
    fn empty_text_is_refused() {
        let alice = session("alice", SigningPolicy::default());
        assert!(matches!(alice.compose("   "), Err(SessionError::Empty)));
    }

    #[test]
    fn system_notice_lands_in_current_room() {
        let alice = session("alice", SigningPolicy::default());
        alice.rooms().join("lobby", false, None);
        let notice = alice.system_notice("welcome");
        assert_eq!(notice.room, "lobby");
        assert_eq!(alice.rooms().get_messages("lobby")[0].payload, "welcome");
        assert!(alice.rooms().roster("lobby").is_empty());
    }

    #[test]
    fn message_for_unseen_room_creates_it() {
        let alice = session("alice", SigningPolicy::default());
        let bob = session("bob", SigningPolicy::default());
        alice.rooms().join("side", false, None);
        let out = alice.compose("over here").unwrap();
        assert!(matches!(bob.ingest(out.wire), Ingested::Stored(_)));
        assert_eq!(bob.rooms().get_messages("side").len(), 1);
        assert_eq!(bob.rooms().current_name(), "global");
    }
}
