//! TCP transport: listener, dialer and per-connection read/write loops.
//!
//! Every connection carries newline-delimited JSON envelopes in both
//! directions. Received envelopes from all connections are merged into one
//! bounded queue exposed by [`Transport::incoming`]. Each registered
//! connection also owns a bounded outbound queue drained by its own writer
//! task, so a slow peer never stalls a broadcast to the others.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{self, EnvelopeCodec};
use crate::config::TransportConfig;
use crate::error::NetworkError;
use crate::identity::{LocalIdentity, PeerId};
use crate::message::Envelope;
use crate::peer::{ConnectedPeer, Direction, Enqueue, PeerInfo, PeerTable};

type EnvelopeSink = FramedWrite<OwnedWriteHalf, EnvelopeCodec>;
type EnvelopeStream = FramedRead<OwnedReadHalf, EnvelopeCodec>;

/// Consumer handle on the merged inbound envelope queue.
///
/// Clones share the same queue; each envelope is delivered to exactly one
/// receiver.
#[derive(Debug, Clone)]
pub struct Incoming {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
}

impl Incoming {
    /// Wait for the next envelope from any peer.
    pub async fn recv(&self) -> Option<Envelope> {
        self.rx.lock().await.recv().await
    }

    /// Take an envelope if one is already queued.
    pub fn try_recv(&self) -> Option<Envelope> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

/// State shared by the accept loop and every connection task.
#[derive(Clone)]
struct Link {
    peers: Arc<PeerTable>,
    incoming_tx: mpsc::Sender<Envelope>,
    outbound_capacity: usize,
    shutdown: CancellationToken,
}

impl Link {
    /// Install a connected-peer record and start its writer. On refusal
    /// (a live record already exists) the sink is handed back.
    fn register(
        &self,
        peer_id: &PeerId,
        conn_id: u64,
        addr: SocketAddr,
        direction: Direction,
        sink: EnvelopeSink,
        token: &CancellationToken,
    ) -> Result<(), EnvelopeSink> {
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        let record = ConnectedPeer::new(peer_id.clone(), conn_id, addr, direction, tx, token.clone());
        if self.peers.try_install(record).is_err() {
            return Err(sink);
        }
        info!("Peer {peer_id} connected ({direction:?}) at {addr}");
        tokio::spawn(write_loop(
            sink,
            rx,
            peer_id.clone(),
            conn_id,
            token.clone(),
            Arc::clone(&self.peers),
        ));
        Ok(())
    }
}

/// One connection's read side plus whatever it still needs to register.
struct Connection {
    stream: EnvelopeStream,
    /// Write half not yet handed to a writer task. `Some` until the
    /// connection is registered.
    pending: Option<EnvelopeSink>,
    peer_id: Option<PeerId>,
    conn_id: u64,
    addr: SocketAddr,
    direction: Direction,
    token: CancellationToken,
}

/// The peer-to-peer transport.
///
/// Owns the listener, the connected-peer table and the inbound queue.
/// `start` and `stop` may each be called more than once.
pub struct Transport {
    identity: LocalIdentity,
    config: TransportConfig,
    peers: Arc<PeerTable>,
    incoming_tx: mpsc::Sender<Envelope>,
    incoming: Incoming,
    shutdown: Mutex<Option<CancellationToken>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Transport {
    pub fn new(identity: LocalIdentity, config: TransportConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_capacity.max(1));
        Self {
            identity,
            config,
            peers: Arc::new(PeerTable::new()),
            incoming_tx,
            incoming: Incoming {
                rx: Arc::new(tokio::sync::Mutex::new(incoming_rx)),
            },
            shutdown: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn local_peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    /// Change the nickname stamped on envelopes built from this identity.
    pub fn set_nick(&self, nick: impl Into<String>) {
        self.identity.set_nick(nick);
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.lock().is_some()
    }

    /// Port the listener is bound to, if running.
    pub fn local_port(&self) -> Option<u16> {
        self.local_addr.lock().map(|addr| addr.port())
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Port 0 asks the OS for a free port. Returns the port actually bound.
    pub async fn start(&self, port: u16) -> Result<u16, NetworkError> {
        if let Some(port) = self.local_port().filter(|_| self.is_running()) {
            debug!("Transport already listening on port {port}");
            return Ok(port);
        }

        let addr = SocketAddr::new(self.config.bind_ip, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let bound = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let link = Link {
            peers: Arc::clone(&self.peers),
            incoming_tx: self.incoming_tx.clone(),
            outbound_capacity: self.config.outbound_capacity.max(1),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(accept_loop(listener, link));

        *self.local_addr.lock() = Some(bound);
        *self.shutdown.lock() = Some(shutdown);
        info!(
            "Transport listening on {bound} as {}",
            self.identity.peer_id()
        );
        Ok(bound.port())
    }

    /// Close the listener and every connection. Safe to call repeatedly.
    pub fn stop(&self) {
        let Some(shutdown) = self.shutdown.lock().take() else {
            return;
        };
        shutdown.cancel();
        let closed = self.peers.close_all();
        *self.local_addr.lock() = None;
        info!("Transport stopped ({closed} connection(s) closed)");
    }

    /// Open an outbound connection to a peer.
    ///
    /// A no-op if a live connection to `peer_id` already exists. The local
    /// presence envelope is written before the connection is registered, so
    /// it is always the first frame the remote side reads.
    pub async fn connect(&self, peer_id: &PeerId, host: &str, port: u16) -> Result<(), NetworkError> {
        let link = self.link()?;
        if self.peers.contains_live(peer_id) {
            debug!("Already connected to {peer_id}");
            return Ok(());
        }

        let target = format!("{host}:{port}");
        let dial = tokio::time::timeout(self.config.dial_timeout, TcpStream::connect((host, port)));
        let stream = match dial.await {
            Err(_) => return Err(NetworkError::Timeout(self.config.dial_timeout)),
            Ok(Err(source)) => return Err(NetworkError::Dial { addr: target, source }),
            Ok(Ok(stream)) => stream,
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {target}: {e}");
        }
        let addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let mut sink = FramedWrite::new(write_half, EnvelopeCodec::new());
        sink.send(Envelope::presence(&self.identity))
            .await
            .map_err(|e| NetworkError::WriteFailure {
                peer_id: peer_id.to_string(),
                reason: e.to_string(),
            })?;

        let conn_id = link.peers.next_conn_id();
        let token = link.shutdown.child_token();
        let pending = match link.register(peer_id, conn_id, addr, Direction::Outbound, sink, &token) {
            Ok(()) => None,
            Err(sink) => {
                debug!("Peer {peer_id} registered concurrently; outbound link kept unregistered");
                Some(sink)
            }
        };

        let conn = Connection {
            stream: FramedRead::new(read_half, EnvelopeCodec::new()),
            pending,
            peer_id: Some(peer_id.clone()),
            conn_id,
            addr,
            direction: Direction::Outbound,
            token,
        };
        tokio::spawn(read_loop(conn, link));
        Ok(())
    }

    /// Queue `envelope` for every connected peer and return how many queues
    /// accepted it. Never blocks: a peer whose queue is full misses this
    /// envelope, and a peer whose connection is gone is dropped from the
    /// table. An envelope too large to frame is dropped before any queue
    /// sees it.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        if !self.is_running() {
            debug!("Broadcast while stopped; dropping {}", envelope.id);
            return 0;
        }
        if let Err(e) = codec::encode(envelope) {
            warn!("Not broadcasting {}: {e}", envelope.id);
            return 0;
        }
        let mut queued = 0;
        for (peer_id, outcome) in self.peers.fan_out(envelope) {
            match outcome {
                Enqueue::Queued => queued += 1,
                Enqueue::Full => {
                    warn!("Outbound queue full for {peer_id}; dropped {}", envelope.id)
                }
                Enqueue::Closed => debug!("Peer {peer_id} gone; removed from table"),
            }
        }
        queued
    }

    /// Handle on the merged inbound queue.
    pub fn incoming(&self) -> Incoming {
        self.incoming.clone()
    }

    /// Snapshot of connected peers, sorted by id.
    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.peers.list()
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_live(peer_id)
    }

    fn link(&self) -> Result<Link, NetworkError> {
        let shutdown = self.shutdown.lock().clone().ok_or(NetworkError::NotRunning)?;
        Ok(Link {
            peers: Arc::clone(&self.peers),
            incoming_tx: self.incoming_tx.clone(),
            outbound_capacity: self.config.outbound_capacity.max(1),
            shutdown,
        })
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Connection tasks
// ---------------------------------------------------------------------------

async fn accept_loop(listener: TcpListener, link: Link) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Inbound connection from {addr}");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed for {addr}: {e}");
                    }
                    let (read_half, write_half) = stream.into_split();
                    let conn = Connection {
                        stream: FramedRead::new(read_half, EnvelopeCodec::new()),
                        pending: Some(FramedWrite::new(write_half, EnvelopeCodec::new())),
                        peer_id: None,
                        conn_id: link.peers.next_conn_id(),
                        addr,
                        direction: Direction::Inbound,
                        token: link.shutdown.child_token(),
                    };
                    tokio::spawn(read_loop(conn, link.clone()));
                }
                Err(e) => warn!("TCP accept failed: {e}"),
            },
            _ = link.shutdown.cancelled() => {
                debug!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Read envelopes until the stream ends, a frame fails to decode, or the
/// connection is cancelled. The first envelope binds an inbound connection
/// to its sender's peer id.
async fn read_loop(mut conn: Connection, link: Link) {
    loop {
        let envelope = tokio::select! {
            frame = conn.stream.next() => match frame {
                Some(Ok(envelope)) => envelope,
                Some(Err(e)) => {
                    warn!("Closing connection from {}: {e}", conn.addr);
                    break;
                }
                None => {
                    debug!("Connection from {} closed by remote", conn.addr);
                    break;
                }
            },
            _ = conn.token.cancelled() => break,
        };

        let peer_id = conn.peer_id.get_or_insert_with(|| envelope.from.clone()).clone();
        if let Some(sink) = conn.pending.take() {
            if let Err(sink) =
                link.register(&peer_id, conn.conn_id, conn.addr, conn.direction, sink, &conn.token)
            {
                debug!("Peer {peer_id} already connected; not registering {}", conn.addr);
                conn.pending = Some(sink);
            }
        }

        tokio::select! {
            sent = link.incoming_tx.send(envelope) => {
                if sent.is_err() {
                    break;
                }
            }
            _ = conn.token.cancelled() => break,
        }
    }

    conn.token.cancel();
    if conn.pending.is_none() {
        if let Some(peer_id) = &conn.peer_id {
            if link.peers.remove_if(peer_id, conn.conn_id) {
                info!("Peer {peer_id} disconnected");
            }
        }
    }
}

/// Drain one peer's outbound queue onto its socket. A write failure tears
/// the connection down.
async fn write_loop(
    mut sink: EnvelopeSink,
    mut rx: mpsc::Receiver<Envelope>,
    peer_id: PeerId,
    conn_id: u64,
    token: CancellationToken,
    peers: Arc<PeerTable>,
) {
    loop {
        let envelope = tokio::select! {
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
            _ = token.cancelled() => break,
        };
        let id = envelope.id.clone();
        let written = tokio::select! {
            written = sink.send(envelope) => written,
            _ = token.cancelled() => break,
        };
        if let Err(NetworkError::FrameTooLarge { len, max }) = written {
            warn!("Skipped {id} to {peer_id}: {len} bytes exceeds {max}");
            continue;
        }
        if let Err(e) = written {
            let err = NetworkError::WriteFailure {
                peer_id: peer_id.to_string(),
                reason: e.to_string(),
            };
            warn!("{err}");
            peers.remove_if(&peer_id, conn_id);
            token.cancel();
            break;
        }
    }

    rx.close();
    let mut half = sink.into_inner();
    let _ = half.shutdown().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
