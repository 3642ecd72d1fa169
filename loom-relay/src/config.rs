//! Configuration loading for cipherloom-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`). Every
//! table and field is optional; missing values fall back to the defaults
//! below.

use loom_mesh::MeshConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for cipherloom-relay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Rate limiting and size caps.
    pub limits: LimitsConfig,
    /// Encrypted persistence of CRDT state.
    pub persistence: PersistenceConfig,
    /// Relay mesh participation.
    pub mesh: MeshConfig,
    /// WebSocket heartbeat.
    pub heartbeat: HeartbeatConfig,
    /// Cleanup task configuration.
    pub cleanup: CleanupConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP + WebSocket listener (default: 0.0.0.0:3000).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Enable durable storage (default: true). When disabled the relay keeps
    /// invites in an in-memory database and refuses persistence requests.
    #[serde(default = "default_storage_enabled")]
    pub enabled: bool,
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

/// Rate limiting and payload caps.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Length of the per-connection message window in ms (default: 1000).
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    /// Messages allowed per window per connection (default: 50).
    #[serde(default = "default_rate_max_messages")]
    pub rate_max_messages: u32,
    /// Maximum peers in one room or topic (default: 100).
    #[serde(default = "default_max_peers_per_room")]
    pub max_peers_per_room: usize,
    /// Maximum topics one connection may join (default: 50).
    #[serde(default = "default_max_topics_per_peer")]
    pub max_topics_per_peer: usize,
    /// Maximum serialized profile / peer info size (default: 4096).
    #[serde(default = "default_max_profile_bytes")]
    pub max_profile_bytes: usize,
    /// Maximum serialized relay payload size (default: 64KB).
    #[serde(default = "default_max_relay_payload_bytes")]
    pub max_relay_payload_bytes: usize,
    /// Maximum serialized signal payload size (default: 64KB).
    #[serde(default = "default_max_signal_payload_bytes")]
    pub max_signal_payload_bytes: usize,
    /// Maximum decoded `store` blob size (default: 50MB).
    #[serde(default = "default_max_store_payload_bytes")]
    pub max_store_payload_bytes: usize,
    /// Key deliveries allowed per IP per minute (default: 10).
    #[serde(default = "default_key_deliveries_per_minute")]
    pub key_deliveries_per_minute: u32,
}

/// Encrypted persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Encrypt CRDT state at rest with the delivered room key (default: true).
    #[serde(default = "default_encrypted")]
    pub encrypted: bool,
    /// Quiet period before a document write, in ms (default: 1000).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

/// WebSocket heartbeat configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between server pings in seconds (default: 30).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Terminate a connection after this long without traffic (default: 60).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
    /// Interval for removing invites past their expiry (default: 300).
    #[serde(default = "default_expired_interval_secs")]
    pub expired_interval_secs: u64,
    /// Interval for the hard age ceiling sweep (default: 3600).
    #[serde(default = "default_hard_ceiling_interval_secs")]
    pub hard_ceiling_interval_secs: u64,
    /// No invite outlives this age in seconds (default: 86400).
    #[serde(default = "default_invite_max_age_secs")]
    pub invite_max_age_secs: u64,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_storage_enabled() -> bool {
    true
}

fn default_database_path() -> PathBuf {
    PathBuf::from("relay.db")
}

fn default_rate_window_ms() -> u64 {
    1000
}

fn default_rate_max_messages() -> u32 {
    50
}

fn default_max_peers_per_room() -> usize {
    100
}

fn default_max_topics_per_peer() -> usize {
    50
}

fn default_max_profile_bytes() -> usize {
    4096
}

fn default_max_relay_payload_bytes() -> usize {
    64 * 1024
}

fn default_max_signal_payload_bytes() -> usize {
    64 * 1024
}

fn default_max_store_payload_bytes() -> usize {
    50 * 1024 * 1024 // 50MB
}

fn default_key_deliveries_per_minute() -> u32 {
    10
}

fn default_encrypted() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_expired_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_hard_ceiling_interval_secs() -> u64 {
    3600 // 1 hour
}

fn default_invite_max_age_secs() -> u64 {
    24 * 60 * 60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: default_storage_enabled(),
            database: default_database_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_window_ms: default_rate_window_ms(),
            rate_max_messages: default_rate_max_messages(),
            max_peers_per_room: default_max_peers_per_room(),
            max_topics_per_peer: default_max_topics_per_peer(),
            max_profile_bytes: default_max_profile_bytes(),
            max_relay_payload_bytes: default_max_relay_payload_bytes(),
            max_signal_payload_bytes: default_max_signal_payload_bytes(),
            max_store_payload_bytes: default_max_store_payload_bytes(),
            key_deliveries_per_minute: default_key_deliveries_per_minute(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            encrypted: default_encrypted(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_cleanup_enabled(),
            expired_interval_secs: default_expired_interval_secs(),
            hard_ceiling_interval_secs: default_hard_ceiling_interval_secs(),
            invite_max_age_secs: default_invite_max_age_secs(),
        }
    }
}

impl LimitsConfig {
    /// Length of the per-connection rate window.
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }
}

impl PersistenceConfig {
    /// Debounce delay as a [`Duration`].
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl HeartbeatConfig {
    /// Ping interval as a [`Duration`].
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Idle timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would otherwise fail at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        if self.limits.rate_max_messages == 0 || self.limits.rate_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "limits.rate_max_messages and limits.rate_window_ms must be non-zero".into(),
            ));
        }
        if self.limits.max_peers_per_room == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_peers_per_room must be non-zero".into(),
            ));
        }
        if self.heartbeat.ping_interval_secs == 0
            || self.heartbeat.timeout_secs < self.heartbeat.ping_interval_secs
        {
            return Err(ConfigError::Invalid(
                "heartbeat.timeout_secs must be at least heartbeat.ping_interval_secs (> 0)".into(),
            ));
        }
        Ok(())
    }

    /// Parsed listener address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind_address
            .parse()
            .map_err(|_| ConfigError::Invalid(format!(
                "server.bind_address is not a socket address: {}",
                self.server.bind_address
            )))
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
