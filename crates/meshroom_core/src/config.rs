use anyhow::{Context, Result};
use meshroom_network::DEFAULT_ROOM;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Application configuration, stored as JSON at `~/.meshroom/config.json`.
///
/// Every section falls back to its defaults, so a partial file loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub nick: String,
    /// TCP listening port. `0` lets the OS pick one.
    pub port: u16,
    pub discovery: DiscoverySettings,
    pub transport: TransportSettings,
    pub rooms: Vec<RoomSettings>,
    pub security: SecuritySettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub mdns: bool,
    pub udp_fallback: bool,
    pub udp_port: u16,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub dial_timeout_secs: u64,
    pub incoming_capacity: usize,
    pub outbound_capacity: usize,
}

/// A room joined at start-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    pub name: String,
    #[serde(default)]
    pub encrypted: bool,
    /// Required for encrypted rooms; the key is derived from it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Attach an HMAC signature to outgoing chat envelopes.
    pub sign_messages: bool,
    /// Signing secret for unencrypted rooms. Encrypted rooms sign with
    /// their room key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
    /// Drop incoming chat envelopes that carry no signature.
    pub require_signatures: bool,
    /// Write rooms joined with a passphrase back into the config file.
    pub persist_keys: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Log to stderr only, never to disk.
    pub ephemeral_logs: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            nick: "guest".into(),
            port: 9999,
            discovery: DiscoverySettings::default(),
            transport: TransportSettings::default(),
            rooms: vec![RoomSettings {
                name: DEFAULT_ROOM.into(),
                encrypted: false,
                passphrase: None,
            }],
            security: SecuritySettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            mdns: true,
            udp_fallback: true,
            udp_port: 9998,
            interval_secs: 5,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 5,
            incoming_capacity: 100,
            outbound_capacity: 64,
        }
    }
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            sign_messages: false,
            shared_secret: None,
            require_signatures: false,
            persist_keys: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            ephemeral_logs: true,
        }
    }
}

impl MeshConfig {
    /// Returns the base config directory: `~/.meshroom/`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".meshroom"))
    }

    /// Returns the config file path: `~/.meshroom/config.json`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Returns the logs directory: `~/.meshroom/logs/`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Load config from a specific file path, writing defaults there if the
    /// file does not exist yet.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Self = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to_path(path)?;
            info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    /// Like [`load_from_path`](Self::load_from_path), but an unreadable or
    /// corrupt file yields the defaults instead of an error.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load_from_path(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Using default config: {e:#}");
                Self::default()
            }
        }
    }

    /// Save config to a specific file path, creating parent directories.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Record a room in the start-up list, replacing any entry with the same
    /// name. Returns true if the list changed.
    pub fn remember_room(&mut self, room: RoomSettings) -> bool {
        match self.rooms.iter_mut().find(|r| r.name == room.name) {
            Some(existing) if *existing == room => false,
            Some(existing) => {
                *existing = room;
                true
            }
            None => {
                self.rooms.push(room);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MeshConfig::default();
        assert_eq!(config.nick, "guest");
        assert_eq!(config.port, 9999);
        assert!(config.discovery.mdns);
        assert!(config.discovery.udp_fallback);
        assert_eq!(config.discovery.udp_port, 9998);
        assert_eq!(config.transport.incoming_capacity, 100);
        assert_eq!(config.rooms.len(), 1);
        assert_eq!(config.rooms[0].name, DEFAULT_ROOM);
        assert!(!config.security.sign_messages);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.ephemeral_logs);
    }

    #[test]
    fn missing_file_writes_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.json");

        let config = MeshConfig::load_from_path(&path).unwrap();
        assert_eq!(config, MeshConfig::default());
        assert!(path.exists());

        // Second load reads the file it just wrote.
        assert_eq!(MeshConfig::load_from_path(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"nick": "alice", "discovery": {"mdns": false}}"#).unwrap();

        let config = MeshConfig::load_from_path(&path).unwrap();
        assert_eq!(config.nick, "alice");
        assert!(!config.discovery.mdns);
        assert!(config.discovery.udp_fallback);
        assert_eq!(config.port, 9999);
    }

    #[test]
    fn corrupt_file_is_an_error_but_load_or_default_recovers() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(MeshConfig::load_from_path(&path).is_err());
        assert_eq!(MeshConfig::load_or_default(&path), MeshConfig::default());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");

        let mut config = MeshConfig::default();
        config.nick = "bob".into();
        config.security.sign_messages = true;
        config.security.shared_secret = Some("s3cret".into());
        config.save_to_path(&path).unwrap();

        assert_eq!(MeshConfig::load_from_path(&path).unwrap(), config);
    }

    #[test]
    fn remember_room_adds_and_replaces() {
        let mut config = MeshConfig::default();
        let secret = RoomSettings {
            name: "ops".into(),
            encrypted: true,
            passphrase: Some("one".into()),
        };
        assert!(config.remember_room(secret.clone()));
        assert!(!config.remember_room(secret));
        assert!(config.remember_room(RoomSettings {
            name: "ops".into(),
            encrypted: true,
            passphrase: Some("two".into()),
        }));
        assert_eq!(config.rooms.len(), 2);
        assert_eq!(config.rooms[1].passphrase.as_deref(), Some("two"));
    }

    #[test]
    fn base_dir_ends_with_meshroom() {
        if let Ok(dir) = MeshConfig::base_dir() {
            assert!(dir.ends_with(".meshroom"));
            assert!(MeshConfig::logs_dir().unwrap().starts_with(&dir));
        }
    }
}
