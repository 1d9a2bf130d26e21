//! Configuration system for Tierlink
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/tierlink/config.toml
//! - Linux: ~/.config/tierlink/config.toml
//! - Windows: %APPDATA%/tierlink/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::rate_limiter::RateLimiterConfig;
use crate::{CHUNK_SIZE, DEFAULT_JOIN_LIMIT, DEFAULT_MESSAGE_LIMIT, MAX_PEERS_PER_ROOM, ROOM_TTL_SECS};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay server settings
    pub signal: SignalConfig,
    /// Negotiation timing
    pub session: SessionConfig,
    /// Rate limits
    pub limits: LimitsConfig,
    /// Chunked transfer settings
    pub transfer: TransferConfig,
}

/// Relay server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Relay port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Database path (None = in-memory)
    pub db_path: Option<PathBuf>,
    /// Room lifetime in seconds
    pub room_ttl_secs: u64,
    /// Maximum peers per room
    pub max_peers_per_room: u32,
    /// Expiry sweep interval in seconds
    pub sweep_interval_secs: u64,
    /// Relay URL peers connect to
    pub url: String,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            db_path: None,
            room_ttl_secs: ROOM_TTL_SECS,
            max_peers_per_room: MAX_PEERS_PER_ROOM,
            sweep_interval_secs: 60,
            url: "ws://127.0.0.1:8787".to_string(),
        }
    }
}

/// Timing for the offer/answer/candidate exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Host polls for the answer at this interval
    pub answer_poll_ms: u64,
    /// Both sides poll for remote candidates at this interval
    pub candidate_poll_ms: u64,
    /// Client offer poll attempts before `Timeout`
    pub offer_poll_attempts: u32,
    /// Delay between offer poll attempts
    pub offer_poll_interval_ms: u64,
    /// Wait for local candidate gathering before submitting a descriptor
    pub gathering_timeout_ms: u64,
    /// Wait for the channel to open after descriptors are exchanged
    pub connect_timeout_ms: u64,
    /// Host gives up waiting for an answer after this long
    pub answer_timeout_ms: u64,
    /// Capacity of session event channels
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            answer_poll_ms: 500,
            candidate_poll_ms: 1000,
            offer_poll_attempts: 20,
            offer_poll_interval_ms: 500,
            gathering_timeout_ms: 2000,
            connect_timeout_ms: 15_000,
            answer_timeout_ms: 600_000,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn answer_poll(&self) -> Duration {
        Duration::from_millis(self.answer_poll_ms)
    }

    pub fn candidate_poll(&self) -> Duration {
        Duration::from_millis(self.candidate_poll_ms)
    }

    pub fn offer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.offer_poll_interval_ms)
    }

    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }
}

/// Rate limit policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Inbound messages per window per peer
    pub messages_per_window: u32,
    pub message_window_ms: u64,
    /// Join attempts per window per room code
    pub joins_per_window: u32,
    pub join_window_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            messages_per_window: DEFAULT_MESSAGE_LIMIT,
            message_window_ms: 1000,
            joins_per_window: DEFAULT_JOIN_LIMIT,
            join_window_secs: 60,
        }
    }
}

impl LimitsConfig {
    pub fn messages(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            limit: self.messages_per_window,
            window: Duration::from_millis(self.message_window_ms),
        }
    }

    pub fn joins(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            limit: self.joins_per_window,
            window: Duration::from_secs(self.join_window_secs),
        }
    }
}

/// Chunked transfer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per chunk
    pub chunk_size: usize,
    /// Pause between chunks on send
    pub inter_chunk_delay_ms: u64,
    /// Largest image accepted for send or reassembly (default 16MB)
    pub max_image_bytes: usize,
    /// Pending transfers idle this long are dropped
    pub stale_transfer_secs: u64,
    /// Incomplete inbound transfers one sender may have open at once
    pub max_pending_per_sender: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            inter_chunk_delay_ms: 5,
            max_image_bytes: 16 * 1024 * 1024, // 16MB
            stale_transfer_secs: 60,
            max_pending_per_sender: 4,
        }
    }
}

impl TransferConfig {
    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_transfer_secs)
    }

    /// Most chunks an accepted image can span
    pub fn max_chunks(&self) -> u32 {
        let chunk = self.chunk_size.max(1);
        let chunks = self.max_image_bytes.div_ceil(chunk).max(1);
        u32::try_from(chunks).unwrap_or(u32::MAX)
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "tierlink", "tierlink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transfer.chunk_size, 16384);
        assert_eq!(config.signal.room_ttl_secs, 3600);
        assert_eq!(config.limits.messages(), RateLimiterConfig::messages());
        assert_eq!(config.limits.joins(), RateLimiterConfig::joins());
        assert_eq!(config.session.answer_poll(), Duration::from_millis(500));
        assert_eq!(config.session.candidate_poll(), Duration::from_millis(1000));
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [session]
            answer_poll_ms = 50
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.session.answer_poll_ms, 50);
        // Other values should be defaults
        assert_eq!(config.session.offer_poll_attempts, 20);
        assert_eq!(config.transfer.inter_chunk_delay_ms, 5);
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[signal]"));
        assert!(sample.contains("[session]"));
        assert!(sample.contains("[limits]"));
        assert!(sample.contains("[transfer]"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.signal.port = 9100;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.signal.port, 9100);
    }

    #[test]
    fn test_max_chunks() {
        let transfer = TransferConfig::default();
        assert_eq!(transfer.max_chunks(), 1024);
    }
}
