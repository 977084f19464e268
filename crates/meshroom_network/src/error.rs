//! Network error types.

use std::time::Duration;

/// Errors that can occur in the meshroom_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The listening socket could not be bound. Fatal to `Transport::start`.
    #[error("Bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// An outbound dial failed. Reported to the caller, never retried.
    #[error("Dial to {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// A byte sequence could not be decoded as an envelope.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// An encoded envelope is longer than the frame limit. Never written.
    #[error("Envelope of {len} bytes exceeds the {max} byte frame limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Writing to one peer failed. Absorbed by broadcast; the connection is
    /// torn down locally.
    #[error("Write to peer {peer_id} failed: {reason}")]
    WriteFailure { peer_id: String, reason: String },

    /// The local service announcement could not be registered. Fatal to
    /// starting discovery.
    #[error("Discovery registration failed: {0}")]
    DiscoveryRegister(String),

    /// A discovery socket error. Logged; the loop continues.
    #[error("Discovery I/O error: {0}")]
    DiscoveryIo(String),

    /// The transport or discovery service is not running.
    #[error("Not running")]
    NotRunning,

    /// JSON serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display() {
        let err = NetworkError::Bind {
            addr: "0.0.0.0:9999".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.0.0.0:9999"));
        assert!(msg.contains("in use"));
    }

    #[test]
    fn test_frame_too_large_display() {
        let msg = NetworkError::FrameTooLarge { len: 70_000, max: 65_536 }.to_string();
        assert!(msg.contains("70000"));
        assert!(msg.contains("65536"));
    }
}
