//! Session Configuration
//!
//! Everything a session needs to know before `start_*`. Loaded from JSON
//! or `NETSYNC_*` environment variables, normalized by [`NetworkConfig::sanitize`],
//! and fingerprinted by [`NetworkConfig::config_hash`] so mismatched peers can
//! be refused during the handshake.

use std::str::FromStr;
use std::time::Duration;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::core::hash::{hash_with_domain, truncate_to_u64, CONFIG_DOMAIN};

use super::channel::ChannelConfig;
use super::transport::ChannelKind;

/// Wire protocol version folded into the config hash.
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed time sync cadence in logical time.
pub const TIME_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Which transport backend `start_*` should build when none was injected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Built-in WebSocket transport (needs a tokio runtime).
    #[default]
    WebSocket,
    /// Caller supplies one through `Session::with_transport`.
    Custom,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "websocket" | "web_socket" | "ws" => Ok(Self::WebSocket),
            "custom" => Ok(Self::Custom),
            other => Err(ConfigError::Invalid(format!("unknown transport '{}'", other))),
        }
    }
}

/// A prefab the spawning collaborator knows how to instantiate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefabConfig {
    /// Unique prefab name.
    pub name: String,
    /// Spawned for every admitted client.
    #[serde(default)]
    pub player: bool,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// JSON could not be parsed.
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    /// Fingerprint serialization failed.
    #[error("config fingerprint failed: {0}")]
    Fingerprint(#[from] bincode::Error),

    /// Signing or verifying key is malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Any other rejected value.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Session configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Wire protocol version.
    pub protocol_version: u16,
    /// Transport backend.
    pub transport: TransportKind,
    /// Address a client connects to.
    pub connect_address: String,
    /// Port a client connects to and a server listens on.
    pub connect_port: u16,
    /// Address a server binds.
    pub bind_address: String,
    /// Send phases per second (<= 0: every step).
    pub send_tick_rate: f64,
    /// Receive phases per second (<= 0: every step).
    pub receive_tick_rate: f64,
    /// Server event ticks per second (<= 0: every step).
    pub event_tick_rate: f64,
    /// Transport events drained per receive phase (0: unlimited).
    pub max_receive_events_per_tick: u32,
    /// How long a client may stay pending, in milliseconds.
    pub approval_timeout_ms: u64,
    /// Route connection requests through an `ApprovalAuthority`.
    pub connection_approval: bool,
    /// Payload a client attaches to its connection request.
    pub connection_data: Vec<u8>,
    /// Run the x25519 key exchange.
    pub enable_encryption: bool,
    /// Sign the server's key share with ed25519.
    pub sign_key_exchange: bool,
    /// Server ed25519 secret key, 32 bytes hex.
    pub server_signing_key: Option<String>,
    /// Trusted server ed25519 public key, 32 bytes hex.
    pub server_verifying_key: Option<String>,
    /// Synchronize the active scene.
    pub enable_scene_switching: bool,
    /// Scenes the server may switch to.
    pub registered_scenes: Vec<String>,
    /// Scene active at start.
    pub active_scene: String,
    /// Let the session drive the spawning collaborator.
    pub handle_object_spawning: bool,
    /// Prefabs known to the spawning collaborator.
    pub networked_prefabs: Vec<PrefabConfig>,
    /// Broadcast time sync every 30 s of logical time.
    pub enable_time_resync: bool,
    /// User channels.
    pub channels: Vec<ChannelConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            transport: TransportKind::WebSocket,
            connect_address: "127.0.0.1".to_string(),
            connect_port: 7777,
            bind_address: "0.0.0.0".to_string(),
            send_tick_rate: 64.0,
            receive_tick_rate: 64.0,
            event_tick_rate: 64.0,
            max_receive_events_per_tick: 500,
            approval_timeout_ms: 10_000,
            connection_approval: false,
            connection_data: Vec::new(),
            enable_encryption: false,
            sign_key_exchange: false,
            server_signing_key: None,
            server_verifying_key: None,
            enable_scene_switching: false,
            registered_scenes: Vec::new(),
            active_scene: String::new(),
            handle_object_spawning: false,
            networked_prefabs: Vec::new(),
            enable_time_resync: false,
            channels: Vec::new(),
        }
    }
}

/// Fields two peers must agree on.
#[derive(Serialize)]
struct ConfigFingerprint<'a> {
    protocol_version: u16,
    channels: Vec<(&'a str, ChannelKind)>,
    scenes: Vec<&'a str>,
    prefabs: Vec<&'a str>,
    encryption: bool,
    signing: bool,
    scene_switching: bool,
    spawning: bool,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}: cannot parse '{}'", key, raw);
            None
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| v == "true" || v == "1")
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
}

fn decode_key(hex_key: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| ConfigError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| ConfigError::InvalidKey(format!("expected 32 bytes, got {}", b.len())))
}

impl NetworkConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults overridden by `NETSYNC_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("NETSYNC_TRANSPORT") {
            config.transport = v;
        }
        if let Ok(v) = std::env::var("NETSYNC_CONNECT_ADDRESS") {
            config.connect_address = v;
        }
        if let Some(v) = env_parse("NETSYNC_PORT") {
            config.connect_port = v;
        }
        if let Ok(v) = std::env::var("NETSYNC_BIND_ADDRESS") {
            config.bind_address = v;
        }
        if let Some(v) = env_parse("NETSYNC_SEND_TICK_RATE") {
            config.send_tick_rate = v;
        }
        if let Some(v) = env_parse("NETSYNC_RECEIVE_TICK_RATE") {
            config.receive_tick_rate = v;
        }
        if let Some(v) = env_parse("NETSYNC_EVENT_TICK_RATE") {
            config.event_tick_rate = v;
        }
        if let Some(v) = env_parse("NETSYNC_MAX_RECEIVE_EVENTS") {
            config.max_receive_events_per_tick = v;
        }
        if let Some(v) = env_parse("NETSYNC_APPROVAL_TIMEOUT_MS") {
            config.approval_timeout_ms = v;
        }
        if let Some(v) = env_flag("NETSYNC_CONNECTION_APPROVAL") {
            config.connection_approval = v;
        }
        if let Ok(v) = std::env::var("NETSYNC_CONNECTION_DATA") {
            config.connection_data = v.into_bytes();
        }
        if let Some(v) = env_flag("NETSYNC_ENCRYPTION") {
            config.enable_encryption = v;
        }
        if let Some(v) = env_flag("NETSYNC_SIGN_KEY_EXCHANGE") {
            config.sign_key_exchange = v;
        }
        config.server_signing_key = std::env::var("NETSYNC_SERVER_SIGNING_KEY").ok();
        config.server_verifying_key = std::env::var("NETSYNC_SERVER_VERIFYING_KEY").ok();
        if let Some(v) = env_flag("NETSYNC_SCENE_SWITCHING") {
            config.enable_scene_switching = v;
        }
        if let Some(v) = env_list("NETSYNC_SCENES") {
            config.registered_scenes = v;
        }
        if let Ok(v) = std::env::var("NETSYNC_ACTIVE_SCENE") {
            config.active_scene = v;
        }
        if let Some(v) = env_flag("NETSYNC_TIME_RESYNC") {
            config.enable_time_resync = v;
        }

        config
    }

    /// Approval timeout as a duration.
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    /// Normalize list fields and report inconsistent settings.
    ///
    /// Never fails: problems are logged and the config is repaired in place.
    pub fn sanitize(&mut self) {
        self.channels.sort_by(|a, b| a.name.cmp(&b.name));
        self.channels.dedup_by(|b, a| {
            let dup = a.name == b.name;
            if dup {
                warn!("Duplicate channel '{}' in config, keeping the first", b.name);
            }
            dup
        });

        self.registered_scenes.sort();
        self.registered_scenes.dedup_by(|b, a| {
            let dup = a == b;
            if dup {
                warn!("Duplicate scene '{}' in config", b);
            }
            dup
        });

        self.networked_prefabs.sort_by(|a, b| a.name.cmp(&b.name));
        self.networked_prefabs.dedup_by(|b, a| {
            let dup = a.name == b.name;
            if dup {
                warn!("Duplicate prefab '{}' in config, keeping the first", b.name);
            }
            dup
        });

        if self.enable_scene_switching
            && !self.active_scene.is_empty()
            && !self.registered_scenes.contains(&self.active_scene)
        {
            warn!(
                "Active scene '{}' is not registered, registering it",
                self.active_scene
            );
            self.registered_scenes.push(self.active_scene.clone());
            self.registered_scenes.sort();
        }

        if self.handle_object_spawning {
            match self.networked_prefabs.iter().filter(|p| p.player).count() {
                0 => warn!("Object spawning enabled without a player prefab"),
                1 => {}
                n => warn!("{} player prefabs configured, the first one is used", n),
            }
            if !self.enable_scene_switching {
                warn!("Object spawning without scene switching: scene objects will not be tracked per scene");
            }
        }

        if self.sign_key_exchange && !self.enable_encryption {
            warn!("Key exchange signing requires encryption, signing ignored");
        }
    }

    /// Fingerprint exchanged in the connection request.
    pub fn config_hash(&self) -> Result<u64, ConfigError> {
        let mut channels: Vec<(&str, ChannelKind)> = self
            .channels
            .iter()
            .map(|c| (c.name.as_str(), c.kind))
            .collect();
        channels.sort();

        let mut scenes: Vec<&str> = if self.enable_scene_switching {
            self.registered_scenes.iter().map(String::as_str).collect()
        } else {
            Vec::new()
        };
        scenes.sort_unstable();

        let mut prefabs: Vec<&str> = if self.handle_object_spawning {
            self.networked_prefabs.iter().map(|p| p.name.as_str()).collect()
        } else {
            Vec::new()
        };
        prefabs.sort_unstable();

        let fingerprint = ConfigFingerprint {
            protocol_version: self.protocol_version,
            channels,
            scenes,
            prefabs,
            encryption: self.enable_encryption,
            signing: self.signing_enabled(),
            scene_switching: self.enable_scene_switching,
            spawning: self.handle_object_spawning,
        };
        let bytes = bincode::serialize(&fingerprint)?;
        Ok(truncate_to_u64(&hash_with_domain(CONFIG_DOMAIN, &bytes)))
    }

    /// Signing only applies on top of encryption.
    pub fn signing_enabled(&self) -> bool {
        self.enable_encryption && self.sign_key_exchange
    }

    /// Index of a registered scene.
    pub fn scene_index(&self, name: &str) -> Option<u32> {
        self.registered_scenes
            .iter()
            .position(|s| s == name)
            .and_then(|i| u32::try_from(i).ok())
    }

    /// Index of the first player prefab.
    pub fn player_prefab(&self) -> Option<u32> {
        self.networked_prefabs
            .iter()
            .position(|p| p.player)
            .and_then(|i| u32::try_from(i).ok())
    }

    /// Parsed server signing key.
    pub fn signing_key(&self) -> Result<Option<SigningKey>, ConfigError> {
        self.server_signing_key
            .as_deref()
            .map(|hex_key| decode_key(hex_key).map(|bytes| SigningKey::from_bytes(&bytes)))
            .transpose()
    }

    /// Parsed trusted server verifying key.
    pub fn verifying_key(&self) -> Result<Option<VerifyingKey>, ConfigError> {
        self.server_verifying_key
            .as_deref()
            .map(|hex_key| {
                let bytes = decode_key(hex_key)?;
                VerifyingKey::from_bytes(&bytes).map_err(|e| ConfigError::InvalidKey(e.to_string()))
            })
            .transpose()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.send_tick_rate, 64.0);
        assert_eq!(config.max_receive_events_per_tick, 500);
        assert_eq!(config.approval_timeout(), Duration::from_secs(10));
        assert!(!config.connection_approval);
    }

    #[test]
    fn test_from_json_partial() {
        let config = NetworkConfig::from_json(
            r#"{"connection_approval": true, "transport": "custom",
                "channels": [{"name": "chat", "kind": "reliable"}]}"#,
        )
        .unwrap();
        assert!(config.connection_approval);
        assert_eq!(config.transport, TransportKind::Custom);
        assert_eq!(config.channels[0].kind, ChannelKind::Reliable);
        assert_eq!(config.connect_port, 7777);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            NetworkConfig::from_json("{not json"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_hash_ignores_channel_order() {
        let a = NetworkConfig {
            channels: vec![
                ChannelConfig::new("x", ChannelKind::Reliable),
                ChannelConfig::new("y", ChannelKind::Unreliable),
            ],
            ..Default::default()
        };
        let mut b = a.clone();
        b.channels.reverse();
        assert_eq!(a.config_hash().unwrap(), b.config_hash().unwrap());
    }

    #[test]
    fn test_hash_tracks_relevant_fields() {
        let base = NetworkConfig::default();
        let mut encrypted = base.clone();
        encrypted.enable_encryption = true;
        assert_ne!(base.config_hash().unwrap(), encrypted.config_hash().unwrap());

        // Tick rates are local tuning, not part of the agreement.
        let mut faster = base.clone();
        faster.send_tick_rate = 30.0;
        assert_eq!(base.config_hash().unwrap(), faster.config_hash().unwrap());
    }

    #[test]
    fn test_sanitize_dedups_and_registers_active_scene() {
        let mut config = NetworkConfig {
            enable_scene_switching: true,
            registered_scenes: vec!["b".into(), "a".into(), "b".into()],
            active_scene: "c".into(),
            channels: vec![
                ChannelConfig::new("chat", ChannelKind::Reliable),
                ChannelConfig::new("chat", ChannelKind::Unreliable),
            ],
            ..Default::default()
        };
        config.sanitize();
        assert_eq!(config.registered_scenes, vec!["a", "b", "c"]);
        assert_eq!(config.channels.len(), 1);
        assert_eq!(config.channels[0].kind, ChannelKind::Reliable);
        assert_eq!(config.scene_index("c"), Some(2));
    }

    #[test]
    fn test_key_parsing() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let config = NetworkConfig {
            server_signing_key: Some(hex::encode(signing.to_bytes())),
            server_verifying_key: Some(hex::encode(signing.verifying_key().to_bytes())),
            ..Default::default()
        };
        assert_eq!(config.signing_key().unwrap().unwrap().to_bytes(), [7u8; 32]);
        assert_eq!(
            config.verifying_key().unwrap().unwrap(),
            signing.verifying_key()
        );

        let bad = NetworkConfig {
            server_signing_key: Some("abcd".into()),
            ..Default::default()
        };
        assert!(matches!(bad.signing_key(), Err(ConfigError::InvalidKey(_))));
    }

    #[test]
    fn test_transport_kind_from_str() {
        assert_eq!("WebSocket".parse::<TransportKind>().unwrap(), TransportKind::WebSocket);
        assert_eq!("custom".parse::<TransportKind>().unwrap(), TransportKind::Custom);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }
}
