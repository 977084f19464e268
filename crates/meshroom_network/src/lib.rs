//! Meshroom Network: peer transport and LAN discovery.
//!
//! This crate moves [`Envelope`]s between meshroom peers on a local network.
//! It never looks inside an envelope's payload; encryption and signing live
//! in the room layer above.
//!
//! # Architecture
//!
//! - **Codec**: newline-delimited JSON framing over TCP via `tokio-util`.
//! - **Transport**: one TCP connection per peer pair, a per-connection
//!   writer task with a bounded outbound queue, and one merged inbound queue.
//! - **Discovery**: mDNS advertisement plus a UDP broadcast fallback, both
//!   feeding a deduplicated, best-effort stream of [`PeerDescriptor`]s.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use meshroom_network::{DiscoveryConfig, DiscoveryService, LocalIdentity, Transport, TransportConfig};
//!
//! # async fn example() -> Result<(), meshroom_network::NetworkError> {
//! let identity = LocalIdentity::generate("alice");
//! let transport = Transport::new(identity.clone(), TransportConfig::default());
//! let port = transport.start(0).await?;
//!
//! let discovery = DiscoveryService::new(identity, DiscoveryConfig::default());
//! discovery.start(port).await?;
//!
//! while let Some(peer) = discovery.peers().recv().await {
//!     transport.connect(&peer.id, &peer.ip.to_string(), peer.port).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod message;
pub mod peer;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{DiscoveryConfig, TransportConfig};
pub use discovery::{DiscoveredPeers, DiscoveryService};
pub use error::NetworkError;
pub use identity::{LocalIdentity, PeerId};
pub use message::{DEFAULT_ROOM, Envelope, MessageKind};
pub use peer::{Direction, PeerDescriptor, PeerInfo};
pub use transport::{Incoming, Transport};
