//! Configuration for peerfs
//!
//! A single TOML file loaded once at startup. Every key has a default so a
//! partial (or missing) file still yields a usable configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket URL of the signaling relay.
    pub signaling_url: String,
    /// Optional relay-side key sent with `register`.
    pub signaling_key: String,
    /// Prefix for the rendezvous room id; the room name is appended.
    pub room_id_prefix: String,
    /// Prefix for one-shot pairing rooms; the PIN is appended.
    pub pairing_room_id_prefix: String,
    /// Pairing gives up after this many seconds.
    pub pairing_timeout_secs: u64,
    /// Room name shared by publisher and clients.
    pub room_name: String,
    /// Shared-secret password; empty disables authentication.
    pub password: String,
    /// Directory exported by the publisher.
    pub local_path: String,
    /// Allow remote writes to the exported directory.
    pub writable: bool,
    /// Thumbnail cache directory; empty disables thumbnails.
    pub thumbnail_cache_dir: String,
    /// External transcoder binary for video thumbnails; empty disables them.
    pub ffmpeg_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: "wss://ayame-labo.shiguredo.app/signaling".to_string(),
            signaling_key: String::new(),
            room_id_prefix: "peerfs-room-".to_string(),
            pairing_room_id_prefix: "peerfs-pin-".to_string(),
            pairing_timeout_secs: 600,
            room_name: String::new(),
            password: String::new(),
            local_path: ".".to_string(),
            writable: false,
            thumbnail_cache_dir: "cache".to_string(),
            ffmpeg_path: String::new(),
        }
    }
}

impl Config {
    /// Load from `path`, falling back to defaults when the file is missing.
    /// A present-but-broken file is an error: silently ignoring a typo in a
    /// room name or password would be worse than refusing to start.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("config {:?} not found, using default settings", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("loaded config from {:?}", path);
        Ok(config)
    }

    /// Stable room id the publisher listens on.
    pub fn room_id(&self) -> String {
        format!("{}{}", self.room_id_prefix, self.room_name)
    }

    pub fn pairing_room_id(&self, pin: &str) -> String {
        format!("{}{}", self.pairing_room_id_prefix, pin)
    }
}

#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.pairing_timeout_secs, 600);
        assert_eq!(config.thumbnail_cache_dir, "cache");
        assert!(!config.writable);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            room_name = "study"
            password = "s3cret"
            writable = true
            "#,
        )
        .unwrap();
        assert_eq!(config.room_name, "study");
        assert_eq!(config.password, "s3cret");
        assert!(config.writable);
        assert_eq!(config.room_id_prefix, "peerfs-room-");
        assert_eq!(config.room_id(), "peerfs-room-study");
    }

    #[test]
    fn missing_file_is_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/peerfs.toml")).unwrap();
        assert_eq!(config.local_path, ".");
    }

    #[test]
    fn broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "room_name = [not toml").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn roundtrip() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.signaling_url, config.signaling_url);
    }
}
