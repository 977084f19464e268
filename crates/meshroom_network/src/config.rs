//! Transport and discovery configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// mDNS service type advertised and browsed by discovery.
pub const SERVICE_TYPE: &str = "_meshroom._tcp";

/// mDNS domain.
pub const SERVICE_DOMAIN: &str = "local.";

/// Default UDP port for the broadcast fallback.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9998;

/// Default TCP listening port.
pub const DEFAULT_LISTEN_PORT: u16 = 9999;

/// Configuration for the peer transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address to bind the listener on. The port is passed to `start`.
    pub bind_ip: IpAddr,

    /// Timeout for establishing an outbound connection.
    #[serde(with = "duration_serde")]
    pub dial_timeout: Duration,

    /// Capacity of the shared inbound envelope queue.
    pub incoming_capacity: usize,

    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dial_timeout: Duration::from_secs(5),
            incoming_capacity: 100,
            outbound_capacity: 64,
        }
    }
}

/// Configuration for the discovery service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Advertise and browse via mDNS.
    pub mdns_enabled: bool,

    /// Send and receive UDP broadcast datagrams.
    pub udp_enabled: bool,

    /// UDP port to broadcast on and listen on.
    pub udp_port: u16,

    /// Destination address for broadcast datagrams.
    pub broadcast_ip: Ipv4Addr,

    /// How often to broadcast a DISCOVER datagram.
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Capacity of the discovered-peer output queue.
    pub channel_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mdns_enabled: true,
            udp_enabled: true,
            udp_port: DEFAULT_DISCOVERY_PORT,
            broadcast_ip: Ipv4Addr::BROADCAST,
            interval: Duration::from_secs(5),
            channel_capacity: 10,
        }
    }
}

impl DiscoveryConfig {
    /// Fully-qualified mDNS service type, e.g. `_meshroom._tcp.local.`.
    pub fn service_fqdn() -> String {
        format!("{SERVICE_TYPE}.{SERVICE_DOMAIN}")
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
