//! Meshroom Rooms: bounded per-room history and the chat session that
//! applies room crypto between the user and the transport.

pub mod room;
pub mod session;

pub use room::{MAX_HISTORY, Room, RoomManager};
pub use session::{ChatSession, Ingested, Outgoing, Rejection, SessionError, SigningPolicy};
