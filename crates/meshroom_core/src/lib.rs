//! Meshroom Core: configuration, logging and the room crypto capability.

pub mod config;
pub mod logging;
pub mod security;

pub use config::{LoggingConfig, MeshConfig, RoomSettings};
pub use security::{CryptoError, RoomKey};
