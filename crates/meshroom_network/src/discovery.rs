//! LAN peer discovery via mDNS and UDP broadcast.
//!
//! The [`DiscoveryService`] advertises this peer as `_meshroom._tcp.local.`
//! and browses for other advertisements. As a fallback it periodically
//! broadcasts a `DISCOVER` datagram and listens for those of other peers.
//! Both mechanisms feed one deduplicating sink: each peer id is emitted at
//! most once per session on a small bounded channel. Emission never blocks;
//! if the consumer falls behind, notifications are dropped.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::DiscoveryConfig;
use crate::error::NetworkError;
use crate::identity::{LocalIdentity, PeerId};
use crate::peer::PeerDescriptor;

/// Command carried by broadcast discovery datagrams.
pub const DISCOVER_CMD: &str = "DISCOVER";

const MDNS_POLL: Duration = Duration::from_millis(250);

/// A broadcast discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPacket {
    pub cmd: String,
    pub nick: String,
    pub id: PeerId,
    pub port: u16,
}

impl DiscoveryPacket {
    pub fn discover(identity: &LocalIdentity, port: u16) -> Self {
        Self {
            cmd: DISCOVER_CMD.to_string(),
            nick: identity.nick(),
            id: identity.peer_id().clone(),
            port,
        }
    }

    /// Build a descriptor from a received datagram. The advertised port is
    /// used with the datagram's source address. Returns `None` for anything
    /// that is not a well-formed `DISCOVER` packet.
    pub fn parse(bytes: &[u8], source: SocketAddr) -> Option<PeerDescriptor> {
        let packet: DiscoveryPacket = serde_json::from_slice(bytes).ok()?;
        if packet.cmd != DISCOVER_CMD || packet.id.as_str().is_empty() {
            return None;
        }
        Some(PeerDescriptor {
            id: packet.id,
            nick: packet.nick,
            ip: source.ip(),
            port: packet.port,
        })
    }
}

/// Build a descriptor from a resolved mDNS service. IPv4 addresses are
/// preferred. Returns `None` if the advertisement carries no id or address.
pub fn descriptor_from_service(info: &ServiceInfo) -> Option<PeerDescriptor> {
    let id = info.get_property_val_str("id").filter(|id| !id.is_empty())?;
    let nick = info.get_property_val_str("nick").unwrap_or_default();
    let addrs = info.get_addresses();
    let ip = addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.iter().next())
        .copied()?;
    Some(PeerDescriptor {
        id: PeerId::from_string(id),
        nick: nick.to_string(),
        ip,
        port: info.get_port(),
    })
}

// ---------------------------------------------------------------------------
// Deduplicating sink
// ---------------------------------------------------------------------------

/// Records every peer seen this session and forwards first sightings.
#[derive(Debug)]
struct SeenPeers {
    self_id: PeerId,
    known: Mutex<HashMap<PeerId, PeerDescriptor>>,
    tx: mpsc::Sender<PeerDescriptor>,
}

impl SeenPeers {
    /// Returns true if the descriptor was emitted on the output channel.
    fn observe(&self, descriptor: PeerDescriptor) -> bool {
        if descriptor.id == self.self_id {
            trace!("Ignoring our own announcement");
            return false;
        }

        let first_sighting = {
            let mut known = self.known.lock();
            known.insert(descriptor.id.clone(), descriptor.clone()).is_none()
        };
        if !first_sighting {
            return false;
        }

        info!(
            "Discovered peer '{}' ({}) at {}",
            descriptor.nick,
            descriptor.id,
            descriptor.socket_addr()
        );
        match self.tx.try_send(descriptor) {
            Ok(()) => true,
            Err(TrySendError::Full(d)) => {
                debug!("Discovery channel full; dropped notification for {}", d.id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn snapshot(&self) -> Vec<PeerDescriptor> {
        let mut peers: Vec<PeerDescriptor> = self.known.lock().values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }
}

/// Consumer handle on the discovered-peer channel.
#[derive(Debug, Clone)]
pub struct DiscoveredPeers {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PeerDescriptor>>>,
}

impl DiscoveredPeers {
    pub async fn recv(&self) -> Option<PeerDescriptor> {
        self.rx.lock().await.recv().await
    }

    pub fn try_recv(&self) -> Option<PeerDescriptor> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

struct MdnsRegistration {
    daemon: ServiceDaemon,
    fullname: String,
}

struct Running {
    token: CancellationToken,
    mdns: Option<MdnsRegistration>,
}

/// LAN discovery service.
pub struct DiscoveryService {
    identity: LocalIdentity,
    config: DiscoveryConfig,
    seen: Arc<SeenPeers>,
    peers: DiscoveredPeers,
    running: Mutex<Option<Running>>,
}

impl DiscoveryService {
    pub fn new(identity: LocalIdentity, config: DiscoveryConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let seen = Arc::new(SeenPeers {
            self_id: identity.peer_id().clone(),
            known: Mutex::new(HashMap::new()),
            tx,
        });
        Self {
            identity,
            config,
            seen,
            peers: DiscoveredPeers {
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            },
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Start advertising `listen_port` and looking for other peers.
    ///
    /// Failing to register the mDNS advertisement is fatal. UDP socket
    /// problems are logged and only disable the affected loop.
    pub async fn start(&self, listen_port: u16) -> Result<(), NetworkError> {
        if self.is_running() {
            debug!("Discovery already running");
            return Ok(());
        }
        let token = CancellationToken::new();

        let mdns = if self.config.mdns_enabled {
            Some(self.start_mdns(listen_port, &token)?)
        } else {
            None
        };

        if self.config.udp_enabled {
            self.start_udp(listen_port, &token).await;
        }

        *self.running.lock() = Some(Running { token, mdns });
        info!(
            "Discovery started (mdns: {}, udp: {})",
            self.config.mdns_enabled, self.config.udp_enabled
        );
        Ok(())
    }

    /// Cancel every loop and withdraw the mDNS advertisement. Safe to call
    /// repeatedly.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.token.cancel();
        if let Some(mdns) = running.mdns {
            if let Err(e) = mdns.daemon.unregister(&mdns.fullname) {
                debug!("mDNS unregister failed: {e}");
            }
            if let Err(e) = mdns.daemon.shutdown() {
                debug!("mDNS shutdown failed: {e}");
            }
        }
        info!("Discovery stopped");
    }

    /// Handle on the stream of newly discovered peers.
    pub fn peers(&self) -> DiscoveredPeers {
        self.peers.clone()
    }

    /// Every peer seen this session, with its most recently advertised
    /// address.
    pub fn known_peers(&self) -> Vec<PeerDescriptor> {
        self.seen.snapshot()
    }

    fn start_mdns(
        &self,
        listen_port: u16,
        token: &CancellationToken,
    ) -> Result<MdnsRegistration, NetworkError> {
        let register_err = |e: mdns_sd::Error| NetworkError::DiscoveryRegister(e.to_string());
        let service_type = DiscoveryConfig::service_fqdn();
        let peer_id = self.identity.peer_id();
        let nick = self.identity.nick();

        let daemon = ServiceDaemon::new().map_err(register_err)?;
        let properties = HashMap::from([
            ("nick".to_string(), nick.clone()),
            ("id".to_string(), peer_id.to_string()),
        ]);
        let instance = format!("{nick}-{}", peer_id.short());
        let host = format!("meshroom-{}.local.", peer_id.short());
        let info = ServiceInfo::new(&service_type, &instance, &host, "", listen_port, properties)
            .map_err(register_err)?
            .enable_addr_auto();
        let fullname = info.get_fullname().to_string();
        let events = daemon
            .register(info)
            .and_then(|()| daemon.browse(&service_type))
            .map_err(|e| abandon_daemon(&daemon, register_err(e)))?;
        let seen = Arc::clone(&self.seen);
        let token = token.clone();
        tokio::task::spawn_blocking(move || {
            while !token.is_cancelled() {
                match events.recv_timeout(MDNS_POLL) {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        match descriptor_from_service(&info) {
                            Some(descriptor) => {
                                seen.observe(descriptor);
                            }
                            None => trace!("Skipping incomplete advertisement {}", info.get_fullname()),
                        }
                    }
                    Ok(other) => trace!("mDNS event: {other:?}"),
                    Err(_) if events.is_disconnected() => {
                        debug!("mDNS browse channel closed");
                        break;
                    }
                    Err(_) => {}
                }
            }
            debug!("mDNS browser shutting down");
        });

        info!("Advertising {fullname} on port {listen_port}");
        Ok(MdnsRegistration { daemon, fullname })
    }

    async fn start_udp(&self, listen_port: u16, token: &CancellationToken) {
        let listen_addr = SocketAddr::new(IpAddr::from([0, 0, 0, 0]), self.config.udp_port);
        match UdpSocket::bind(listen_addr).await {
            Ok(socket) => {
                debug!("Discovery listening on {listen_addr}");
                tokio::spawn(udp_listener(socket, Arc::clone(&self.seen), token.clone()));
            }
            Err(e) => warn!("{}", NetworkError::DiscoveryIo(format!("bind {listen_addr}: {e}"))),
        }

        let sender = match UdpSocket::bind(SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("{}", NetworkError::DiscoveryIo(format!("sender bind: {e}")));
                return;
            }
        };
        if let Err(e) = sender.set_broadcast(true) {
            warn!("{}", NetworkError::DiscoveryIo(format!("set_broadcast: {e}")));
        }
        let target = SocketAddr::new(IpAddr::V4(self.config.broadcast_ip), self.config.udp_port);
        tokio::spawn(udp_broadcaster(
            sender,
            target,
            self.identity.clone(),
            listen_port,
            self.config.interval,
            token.clone(),
        ));
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stop a daemon whose setup failed part way, withdrawing anything it had
/// already advertised, and hand back the setup error.
fn abandon_daemon(daemon: &ServiceDaemon, err: NetworkError) -> NetworkError {
    if let Err(e) = daemon.shutdown() {
        debug!("mDNS shutdown after failed setup: {e}");
    }
    err
}

async fn udp_listener(socket: UdpSocket, seen: Arc<SeenPeers>, token: CancellationToken) {
    let mut buf = vec![0u8; 1024];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, source)) => {
                    if let Some(descriptor) = DiscoveryPacket::parse(&buf[..len], source) {
                        seen.observe(descriptor);
                    } else {
                        trace!("Ignoring datagram from {source}");
                    }
                }
                Err(e) => warn!("{}", NetworkError::DiscoveryIo(e.to_string())),
            },
            _ = token.cancelled() => {
                debug!("Discovery listener shutting down");
                break;
            }
        }
    }
}

/// Re-broadcast presence on a timer. The nickname is read on every tick so
/// a rename is picked up without restarting.
async fn udp_broadcaster(
    socket: UdpSocket,
    target: SocketAddr,
    identity: LocalIdentity,
    listen_port: u16,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let packet = DiscoveryPacket::discover(&identity, listen_port);
                let bytes = match serde_json::to_vec(&packet) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Failed to encode discovery packet: {e}");
                        continue;
                    }
                };
                match socket.send_to(&bytes, target).await {
                    Ok(_) => trace!("Discovery datagram sent to {target}"),
                    Err(e) => debug!("Discovery broadcast failed: {e}"),
                }
            }
            _ = token.cancelled() => {
                debug!("Discovery broadcaster shutting down");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
