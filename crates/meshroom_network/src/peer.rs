//! Peer records: discovered descriptors and the live connected-peer table.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::identity::PeerId;
use crate::message::Envelope;

/// A peer found by discovery. Produced by discovery, consumed by the
/// transport, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: PeerId,
    pub nick: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerDescriptor {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Public snapshot of a connected peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub direction: Direction,
    pub connected_at: DateTime<Utc>,
}

/// A live, transport-owned association between a peer id and an open
/// stream. Holds the sending side of the connection's outbound queue and the
/// token observed by its read and write loops.
#[derive(Debug)]
pub(crate) struct ConnectedPeer {
    pub peer_id: PeerId,
    pub conn_id: u64,
    pub addr: SocketAddr,
    pub direction: Direction,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Envelope>,
    token: CancellationToken,
}

impl ConnectedPeer {
    pub fn new(
        peer_id: PeerId,
        conn_id: u64,
        addr: SocketAddr,
        direction: Direction,
        outbound: mpsc::Sender<Envelope>,
        token: CancellationToken,
    ) -> Self {
        Self {
            peer_id,
            conn_id,
            addr,
            direction,
            connected_at: Utc::now(),
            outbound,
            token,
        }
    }

    /// A record whose writer has exited or whose connection was cancelled no
    /// longer counts as live.
    pub fn is_live(&self) -> bool {
        !self.outbound.is_closed() && !self.token.is_cancelled()
    }

    /// Tear down the connection's read and write loops.
    pub fn close(&self) {
        self.token.cancel();
    }

    fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.peer_id.clone(),
            addr: self.addr,
            direction: self.direction,
            connected_at: self.connected_at,
        }
    }
}

/// Outcome of queueing one envelope for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueue {
    Queued,
    /// The peer's outbound queue is full; the envelope was dropped for it.
    Full,
    /// The peer's writer has gone away; the record was removed.
    Closed,
}

/// The peer-id → connected-peer map. At most one record per peer id.
#[derive(Debug, Default)]
pub(crate) struct PeerTable {
    peers: RwLock<HashMap<PeerId, ConnectedPeer>>,
    next_conn_id: AtomicU64,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id that distinguishes successive connections to the same
    /// peer.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Install a record unless a live one already exists for the same peer
    /// id. A stale (closed) record is replaced. On refusal the record is
    /// handed back to the caller.
    pub fn try_install(&self, peer: ConnectedPeer) -> Result<(), ConnectedPeer> {
        let mut peers = self.peers.write();
        if peers.get(&peer.peer_id).is_some_and(ConnectedPeer::is_live) {
            return Err(peer);
        }
        if let Some(stale) = peers.insert(peer.peer_id.clone(), peer) {
            stale.close();
        }
        Ok(())
    }

    /// Remove the record for `peer_id` only if it still belongs to
    /// connection `conn_id`.
    pub fn remove_if(&self, peer_id: &PeerId, conn_id: u64) -> bool {
        let mut peers = self.peers.write();
        if peers.get(peer_id).is_some_and(|p| p.conn_id == conn_id) {
            peers.remove(peer_id);
            true
        } else {
            false
        }
    }

    pub fn contains_live(&self, peer_id: &PeerId) -> bool {
        self.peers.read().get(peer_id).is_some_and(ConnectedPeer::is_live)
    }

    /// Queue `envelope` on every peer without waiting. Records whose queue is
    /// closed are removed.
    pub fn fan_out(&self, envelope: &Envelope) -> Vec<(PeerId, Enqueue)> {
        let mut outcomes = Vec::new();
        let mut closed = Vec::new();
        {
            let peers = self.peers.read();
            for peer in peers.values() {
                let outcome = match peer.outbound.try_send(envelope.clone()) {
                    Ok(()) => Enqueue::Queued,
                    Err(TrySendError::Full(_)) => Enqueue::Full,
                    Err(TrySendError::Closed(_)) => {
                        closed.push((peer.peer_id.clone(), peer.conn_id));
                        Enqueue::Closed
                    }
                };
                outcomes.push((peer.peer_id.clone(), outcome));
            }
        }
        for (peer_id, conn_id) in closed {
            self.remove_if(&peer_id, conn_id);
        }
        outcomes
    }

    pub fn list(&self) -> Vec<PeerInfo> {
        let mut list: Vec<PeerInfo> = self.peers.read().values().map(ConnectedPeer::info).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Take every record out of the table, closing each one.
    pub fn close_all(&self) -> usize {
        let drained: Vec<ConnectedPeer> = self.peers.write().drain().map(|(_, p)| p).collect();
        for peer in &drained {
            peer.close();
        }
        drained.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn record(
        table: &PeerTable,
        id: &str,
        capacity: usize,
    ) -> (ConnectedPeer, mpsc::Receiver<Envelope>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let token = CancellationToken::new();
        let peer = ConnectedPeer::new(
            PeerId::from_string(id),
            table.next_conn_id(),
            "127.0.0.1:9000".parse().unwrap(),
            Direction::Outbound,
            tx,
            token.clone(),
        );
        (peer, rx, token)
    }

    fn chat() -> Envelope {
        Envelope::new("m", PeerId::from_string("me"), "me", "global", MessageKind::Chat, "hi")
    }

    #[test]
    fn test_descriptor_socket_addr() {
        let desc = PeerDescriptor {
            id: PeerId::from_string("p"),
            nick: "n".into(),
            ip: "192.168.1.7".parse().unwrap(),
            port: 9999,
        };
        assert_eq!(desc.socket_addr().to_string(), "192.168.1.7:9999");
    }

    #[test]
    fn test_install_refuses_live_duplicate() {
        let table = PeerTable::new();
        let (first, _rx1, _) = record(&table, "alpha", 4);
        let (second, _rx2, _) = record(&table, "alpha", 4);
        let first_id = first.conn_id;

        assert!(table.try_install(first).is_ok());
        let refused = table.try_install(second).unwrap_err();
        assert_ne!(refused.conn_id, first_id);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_install_replaces_stale_record() {
        let table = PeerTable::new();
        let (first, rx1, _) = record(&table, "alpha", 4);
        let (second, _rx2, _) = record(&table, "alpha", 4);
        let second_id = second.conn_id;

        table.try_install(first).unwrap();
        drop(rx1);
        assert!(!table.contains_live(&PeerId::from_string("alpha")));
        table.try_install(second).unwrap();
        assert_eq!(table.list()[0].id.as_str(), "alpha");
        assert!(table.remove_if(&PeerId::from_string("alpha"), second_id));
    }

    #[test]
    fn test_remove_if_ignores_other_connection() {
        let table = PeerTable::new();
        let (peer, _rx, _) = record(&table, "beta", 4);
        let conn_id = peer.conn_id;
        table.try_install(peer).unwrap();

        assert!(!table.remove_if(&PeerId::from_string("beta"), conn_id + 100));
        assert_eq!(table.len(), 1);
        assert!(table.remove_if(&PeerId::from_string("beta"), conn_id));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_fan_out_isolates_full_and_closed_peers() {
        let table = PeerTable::new();
        let (ok, mut ok_rx, _) = record(&table, "ok", 4);
        let (full, _full_rx, _) = record(&table, "full", 1);
        let (gone, gone_rx, _) = record(&table, "gone", 4);
        table.try_install(ok).unwrap();
        table.try_install(full).unwrap();
        table.try_install(gone).unwrap();
        drop(gone_rx);

        // Fill the single slot of "full".
        table.fan_out(&chat());
        let outcomes = table.fan_out(&chat());

        let get = |id: &str| {
            outcomes
                .iter()
                .find(|(p, _)| p.as_str() == id)
                .map(|(_, o)| *o)
        };
        assert_eq!(get("ok"), Some(Enqueue::Queued));
        assert_eq!(get("full"), Some(Enqueue::Full));
        assert_eq!(get("gone"), None); // removed on the first pass
        assert_eq!(table.len(), 2);
        assert!(ok_rx.try_recv().is_ok());
        assert!(ok_rx.try_recv().is_ok());
    }

    #[test]
    fn test_cancelled_record_is_not_live() {
        let table = PeerTable::new();
        let (peer, _rx, token) = record(&table, "delta", 4);
        table.try_install(peer).unwrap();
        token.cancel();
        assert!(!table.contains_live(&PeerId::from_string("delta")));
    }

    #[test]
    fn test_close_all_cancels_connections() {
        let table = PeerTable::new();
        let (peer, _rx, token) = record(&table, "gamma", 4);
        table.try_install(peer).unwrap();

        assert_eq!(table.close_all(), 1);
        assert_eq!(table.len(), 0);
        assert!(token.is_cancelled());
    }
}
