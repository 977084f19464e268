mod commands;

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use meshroom_core::logging::init_logging;
use meshroom_core::security::derive_key;
use meshroom_core::{MeshConfig, RoomSettings};
use meshroom_network::{
    DEFAULT_ROOM, DiscoveryConfig, DiscoveryService, Envelope, LocalIdentity, MessageKind,
    Transport, TransportConfig,
};
use meshroom_rooms::{ChatSession, Ingested, RoomManager, SigningPolicy};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use commands::{Command, HELP_TEXT, Input};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Serverless chat for the local network.
#[derive(Debug, Parser)]
#[command(name = "meshroom", version, about)]
struct Cli {
    /// Display nickname (overrides the config file)
    #[arg(short, long)]
    nick: Option<String>,

    /// TCP listening port; 0 picks a free one
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file (default: ~/.meshroom/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Disable mDNS announcement and browsing
    #[arg(long)]
    no_mdns: bool,

    /// Disable the UDP broadcast fallback
    #[arg(long)]
    no_udp: bool,
}

impl Cli {
    fn apply(&self, config: &mut MeshConfig) {
        if let Some(nick) = &self.nick {
            config.nick = nick.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.no_mdns {
            config.discovery.mdns = false;
        }
        if self.no_udp {
            config.discovery.udp_fallback = false;
        }
    }
}

fn transport_config(config: &MeshConfig) -> TransportConfig {
    TransportConfig {
        dial_timeout: Duration::from_secs(config.transport.dial_timeout_secs),
        incoming_capacity: config.transport.incoming_capacity,
        outbound_capacity: config.transport.outbound_capacity,
        ..TransportConfig::default()
    }
}

fn discovery_config(config: &MeshConfig) -> DiscoveryConfig {
    DiscoveryConfig {
        mdns_enabled: config.discovery.mdns,
        udp_enabled: config.discovery.udp_fallback,
        udp_port: config.discovery.udp_port,
        interval: Duration::from_secs(config.discovery.interval_secs),
        ..DiscoveryConfig::default()
    }
}

/// Everything the console loop acts on.
struct App {
    config: Mutex<MeshConfig>,
    config_path: PathBuf,
    session: ChatSession,
    transport: Arc<Transport>,
    discovery: DiscoveryService,
}

enum Flow {
    Continue,
    Quit,
}

impl App {
    fn rooms(&self) -> &RoomManager {
        self.session.rooms()
    }

    fn notice(&self, text: &str) {
        print_envelope(&self.session.system_notice(text));
    }

    async fn handle(&self, input: Input) -> Flow {
        match input {
            Input::Say(text) => {
                match self.session.compose(&text) {
                    Ok(out) => {
                        let sent = self.transport.broadcast(&out.wire);
                        debug!("Sent {} to {sent} peer(s)", out.wire.id);
                        print_envelope(&out.local);
                    }
                    Err(e) => self.notice(&format!("Not sent: {e}")),
                }
                Flow::Continue
            }
            Input::Command(Command::Quit) => Flow::Quit,
            Input::Command(command) => {
                self.run(command).await;
                Flow::Continue
            }
        }
    }

    async fn run(&self, command: Command) {
        match command {
            Command::Join { room, passphrase } => self.join(&room, passphrase),
            Command::Nick(nick) => {
                self.rooms().set_nick(nick.as_str());
                self.transport.set_nick(nick.as_str());
                info!("Nickname changed to {nick}");
                self.notice(&format!("You are now known as {nick}"));
            }
            Command::Clear => {
                let room = self.rooms().current_name();
                self.rooms().clear(&room);
                println!("-- #{room} cleared --");
            }
            Command::Help => self.notice(HELP_TEXT),
            Command::Ip => {
                let ip = local_ipv4()
                    .await
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "unknown".into());
                self.notice(&format!("Your local IP: {ip}"));
            }
            Command::Peers => {
                let peers = self.transport.connected_peers();
                if peers.is_empty() {
                    self.notice("No connected peers");
                } else {
                    let list: Vec<String> = peers
                        .iter()
                        .map(|p| format!("{} ({})", p.id, p.addr))
                        .collect();
                    self.notice(&format!("Connected peers: {}", list.join(", ")));
                }
            }
            Command::Usage(usage) => self.notice(&format!("Usage: {usage}")),
            Command::Unknown(name) => self.notice(&format!("Unknown command {name}. {HELP_TEXT}")),
            Command::Quit => {}
        }
    }

    fn join(&self, room: &str, passphrase: Option<String>) {
        let key = match passphrase.as_deref().map(|p| derive_key(p, room)).transpose() {
            Ok(key) => key,
            Err(e) => {
                self.notice(&format!("Cannot join #{room}: {e}"));
                return;
            }
        };
        let joined = self.rooms().join(room, key.is_some(), key);
        if passphrase.is_some() && !joined.is_encrypted() {
            self.notice(&format!("#{room} is already open without encryption"));
        }

        for envelope in joined.messages() {
            print_envelope(&envelope);
        }
        let lock = if joined.is_encrypted() { " (encrypted)" } else { "" };
        self.notice(&format!("Joined #{room}{lock}"));

        if let Some(passphrase) = passphrase {
            self.persist_room(RoomSettings {
                name: room.to_string(),
                encrypted: true,
                passphrase: Some(passphrase),
            });
        }
    }

    fn persist_room(&self, room: RoomSettings) {
        let mut config = self.config.lock();
        if !config.security.persist_keys || !config.remember_room(room) {
            return;
        }
        if let Err(e) = config.save_to_path(&self.config_path) {
            warn!("Could not save joined room: {e:#}");
        }
    }

    fn shutdown(&self) {
        info!("Shutting down");
        self.discovery.stop();
        self.transport.stop();
    }
}

fn print_envelope(envelope: &Envelope) {
    let time = chrono::DateTime::from_timestamp(envelope.ts, 0)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_default();
    match envelope.kind {
        MessageKind::Chat => println!(
            "[{time}] #{} <{}> {}",
            envelope.room, envelope.nick, envelope.payload
        ),
        _ => println!("[{time}] * {}", envelope.payload),
    }
}

/// The host's outward-facing IPv4 address. Connecting a UDP socket only
/// selects a route; nothing is sent.
async fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = tokio::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).await.ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Load the config file, falling back to defaults. Logging is not up yet,
/// so the failure is handed back to be reported once it is.
fn load_config(path: &Path) -> (MeshConfig, Option<anyhow::Error>) {
    match MeshConfig::load_from_path(path) {
        Ok(config) => (config, None),
        Err(e) => (MeshConfig::default(), Some(e)),
    }
}

/// Join every configured room, then make `global` current.
fn open_rooms(rooms: &RoomManager, configured: &[RoomSettings]) -> Result<()> {
    for room in configured {
        let key = match (room.encrypted, room.passphrase.as_deref()) {
            (true, Some(passphrase)) => Some(
                derive_key(passphrase, &room.name)
                    .with_context(|| format!("Failed to derive key for #{}", room.name))?,
            ),
            (true, None) => {
                warn!("Skipping encrypted room #{} with no passphrase", room.name);
                continue;
            }
            (false, _) => None,
        };
        rooms.join(&room.name, room.encrypted, key);
    }
    rooms.join(DEFAULT_ROOM, false, None);
    Ok(())
}

fn spawn_incoming(app: Arc<App>, shutdown: CancellationToken) {
    let incoming = app.transport.incoming();
    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                _ = shutdown.cancelled() => break,
                envelope = incoming.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            match app.session.ingest(envelope) {
                Ingested::Stored(envelope) => print_envelope(&envelope),
                Ingested::Presence { peer_id, nick } => {
                    println!("* {nick} is here ({})", peer_id.short());
                }
                Ingested::Ignored(_) => {}
                Ingested::Rejected(reason) => debug!("Rejected envelope: {reason:?}"),
            }
        }
    });
}

fn spawn_connector(app: Arc<App>, shutdown: CancellationToken) {
    let peers = app.discovery.peers();
    tokio::spawn(async move {
        loop {
            let peer = tokio::select! {
                _ = shutdown.cancelled() => break,
                peer = peers.recv() => match peer {
                    Some(peer) => peer,
                    None => break,
                },
            };
            info!("Discovered {} ({}) at {}:{}", peer.nick, peer.id, peer.ip, peer.port);
            let transport = Arc::clone(&app.transport);
            tokio::spawn(async move {
                if let Err(e) = transport.connect(&peer.id, &peer.ip.to_string(), peer.port).await {
                    warn!("Could not connect to {}: {e}", peer.id);
                }
            });
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => MeshConfig::config_path()?,
    };
    let (mut config, load_error) = load_config(&config_path);
    cli.apply(&mut config);

    let _log_guard = init_logging(&config.logging)?;
    info!("Starting meshroom v{VERSION}");
    match load_error {
        Some(e) => warn!("Using default config: {e:#}"),
        None => info!("Config from {}", config_path.display()),
    }

    let identity = LocalIdentity::generate(config.nick.as_str());
    info!("Peer id {}", identity.peer_id());

    let transport = Arc::new(Transport::new(identity.clone(), transport_config(&config)));
    let port = transport
        .start(config.port)
        .await
        .with_context(|| format!("Failed to start transport on port {}", config.port))?;

    let discovery = DiscoveryService::new(identity.clone(), discovery_config(&config));
    if let Err(e) = discovery.start(port).await {
        transport.stop();
        return Err(e).context("Failed to start discovery");
    }

    let rooms = Arc::new(RoomManager::new(identity.nick(), identity.peer_id().clone()));
    open_rooms(&rooms, &config.rooms)?;
    let policy = SigningPolicy::from_settings(&config.security)
        .context("Invalid shared secret")?;

    let app = Arc::new(App {
        config: Mutex::new(config),
        config_path,
        session: ChatSession::new(rooms, policy),
        transport,
        discovery,
    });

    let shutdown = CancellationToken::new();
    spawn_incoming(Arc::clone(&app), shutdown.clone());
    spawn_connector(Arc::clone(&app), shutdown.clone());

    println!(
        "meshroom v{VERSION}: {} listening on port {port}. Type /help for commands.",
        identity.nick()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Console read failed: {e}");
                    break;
                }
            },
        };
        let Some(input) = Input::parse(&line) else {
            continue;
        };
        if let Flow::Quit = app.handle(input).await {
            break;
        }
    }

    shutdown.cancel();
    app.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use meshroom_network::PeerId;

    #[test]
    fn cli_flags_override_config() {
        let cli = Cli::parse_from(["meshroom", "--nick", "alice", "--port", "0", "--no-mdns"]);
        let mut config = MeshConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.nick, "alice");
        assert_eq!(config.port, 0);
        assert!(!config.discovery.mdns);
        assert!(config.discovery.udp_fallback);
    }

    #[test]
    fn corrupt_config_falls_back_with_reported_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let (config, error) = load_config(&path);
        assert_eq!(config, MeshConfig::default());
        let error = error.expect("parse failure is reported");
        assert!(format!("{error:#}").contains("config.json"));
    }

    #[test]
    fn missing_config_is_created_without_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let (config, error) = load_config(&path);
        assert!(error.is_none());
        assert_eq!(config, MeshConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn network_configs_follow_mesh_config() {
        let mut config = MeshConfig::default();
        config.transport.dial_timeout_secs = 2;
        config.discovery.udp_port = 4000;
        config.discovery.interval_secs = 1;

        let transport = transport_config(&config);
        assert_eq!(transport.dial_timeout, Duration::from_secs(2));
        assert_eq!(transport.incoming_capacity, 100);

        let discovery = discovery_config(&config);
        assert_eq!(discovery.udp_port, 4000);
        assert_eq!(discovery.interval, Duration::from_secs(1));
        assert!(discovery.mdns_enabled);
    }

    #[test]
    fn configured_rooms_open_with_global_current() {
        let rooms = RoomManager::new("alice", PeerId::from_string("a"));
        let configured = vec![
            RoomSettings {
                name: "ops".into(),
                encrypted: true,
                passphrase: Some("hunter2".into()),
            },
            RoomSettings {
                name: "locked".into(),
                encrypted: true,
                passphrase: None,
            },
            RoomSettings {
                name: "lobby".into(),
                encrypted: false,
                passphrase: None,
            },
        ];
        open_rooms(&rooms, &configured).unwrap();

        assert_eq!(rooms.current_name(), DEFAULT_ROOM);
        assert!(rooms.room("ops").is_some_and(|r| r.is_encrypted() && r.key().is_some()));
        assert!(rooms.room("locked").is_none());
        assert!(rooms.room("lobby").is_some());
    }
}
