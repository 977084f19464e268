//! Room store: bounded per-room histories, rosters and the current room.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use meshroom_core::RoomKey;
use meshroom_network::{DEFAULT_ROOM, Envelope, PeerId};
use parking_lot::RwLock;
use tracing::debug;

/// Maximum number of envelopes kept per room. Older entries are evicted.
pub const MAX_HISTORY: usize = 1000;

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RoomState {
    history: VecDeque<Envelope>,
    roster: BTreeSet<PeerId>,
}

/// A named message history with its roster.
///
/// The name, encryption flag and key are fixed at creation. History and
/// roster sit behind the room's own lock, so traffic in one room never
/// blocks readers of another.
#[derive(Debug)]
pub struct Room {
    name: String,
    encrypted: bool,
    key: Option<RoomKey>,
    state: RwLock<RoomState>,
}

impl Room {
    pub fn new(name: impl Into<String>, encrypted: bool, key: Option<RoomKey>) -> Self {
        Self {
            name: name.into(),
            encrypted,
            key,
            state: RwLock::new(RoomState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn key(&self) -> Option<&RoomKey> {
        self.key.as_ref()
    }

    /// Append an envelope, evicting the oldest beyond [`MAX_HISTORY`], and
    /// add its sender to the roster.
    pub fn push(&self, envelope: Envelope) {
        let mut state = self.state.write();
        state.roster.insert(envelope.from.clone());
        Self::append(&mut state, envelope);
    }

    /// Append a locally generated notice without touching the roster.
    pub fn push_notice(&self, envelope: Envelope) {
        Self::append(&mut self.state.write(), envelope);
    }

    fn append(state: &mut RoomState, envelope: Envelope) {
        state.history.push_back(envelope);
        while state.history.len() > MAX_HISTORY {
            state.history.pop_front();
        }
    }

    /// Independent copy of the history, oldest first.
    pub fn messages(&self) -> Vec<Envelope> {
        self.state.read().history.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peer ids seen in this room, sorted.
    pub fn roster(&self) -> Vec<PeerId> {
        self.state.read().roster.iter().cloned().collect()
    }

    pub fn note_member(&self, peer_id: PeerId) {
        self.state.write().roster.insert(peer_id);
    }

    /// Drop the history. The roster is kept.
    pub fn clear(&self) {
        self.state.write().history.clear();
    }
}

// ---------------------------------------------------------------------------
// RoomManager
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Rooms {
    by_name: HashMap<String, Arc<Room>>,
    current: Arc<Room>,
}

/// Owner of the room map, the current room and the local user's identity.
///
/// The map and the current-room pointer share one lock; it is never held
/// while a room's own lock is taken.
#[derive(Debug)]
pub struct RoomManager {
    rooms: RwLock<Rooms>,
    nick: RwLock<String>,
    peer_id: PeerId,
}

impl RoomManager {
    /// Create a manager whose current room is `global`.
    pub fn new(nick: impl Into<String>, peer_id: PeerId) -> Self {
        let global = Arc::new(Room::new(DEFAULT_ROOM, false, None));
        let by_name = HashMap::from([(DEFAULT_ROOM.to_string(), Arc::clone(&global))]);
        Self {
            rooms: RwLock::new(Rooms {
                by_name,
                current: global,
            }),
            nick: RwLock::new(nick.into()),
            peer_id,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn nick(&self) -> String {
        self.nick.read().clone()
    }

    pub fn set_nick(&self, nick: impl Into<String>) {
        *self.nick.write() = nick.into();
    }

    /// Look up a room, creating an unencrypted one if it is unseen.
    fn room_or_create(&self, name: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.read().by_name.get(name) {
            return Arc::clone(room);
        }
        let mut rooms = self.rooms.write();
        let room = rooms.by_name.entry(name.to_string()).or_insert_with(|| {
            debug!("Creating room '{name}'");
            Arc::new(Room::new(name, false, None))
        });
        Arc::clone(room)
    }

    /// Append an envelope to its room's history, creating the room if
    /// needed. No validation or deduplication is done.
    pub fn add_message(&self, envelope: Envelope) {
        let room = self.room_or_create(&envelope.room);
        room.push(envelope);
    }

    /// Snapshot of a room's history; empty for an unseen room.
    pub fn get_messages(&self, name: &str) -> Vec<Envelope> {
        self.room(name).map(|r| r.messages()).unwrap_or_default()
    }

    /// Switch to `name`, creating it with the given flag and key if unseen.
    /// An existing room keeps its original flag and key.
    pub fn join(&self, name: &str, encrypted: bool, key: Option<RoomKey>) -> Arc<Room> {
        let mut rooms = self.rooms.write();
        let room = Arc::clone(rooms.by_name.entry(name.to_string()).or_insert_with(|| {
            debug!("Creating room '{name}' (encrypted: {encrypted})");
            Arc::new(Room::new(name, encrypted, key))
        }));
        rooms.current = Arc::clone(&room);
        room
    }

    /// The active room.
    pub fn current(&self) -> Arc<Room> {
        Arc::clone(&self.rooms.read().current)
    }

    pub fn current_name(&self) -> String {
        self.rooms.read().current.name().to_string()
    }

    pub fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().by_name.get(name).cloned()
    }

    /// Names of all known rooms, sorted.
    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.read().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn roster(&self, name: &str) -> Vec<PeerId> {
        self.room(name).map(|r| r.roster()).unwrap_or_default()
    }

    /// Record the sender of a presence envelope in its room's roster.
    pub fn note_presence(&self, envelope: &Envelope) {
        self.room_or_create(&envelope.room)
            .note_member(envelope.from.clone());
    }

    /// Clear a room's history. Returns false for an unseen room.
    pub fn clear(&self, name: &str) -> bool {
        match self.room(name) {
            Some(room) => {
                room.clear();
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
