//! # Configuration Management
//!
//! Centralized configuration for the session engine.
//!
//! ## Configuration Sources
//! - TOML files via [`NetworkConfig::from_file`] / [`NetworkConfig::from_toml`]
//! - Environment overrides via [`NetworkConfig::from_env`] (`BLOCKNET_*`)
//! - Direct instantiation with defaults
//!
//! Durations are written as integer milliseconds.
//!
//! ## Sections
//! - `server`: bind address, registry capacity, lifecycle timeouts
//! - `session`: keepalives and violation tolerance
//! - `reliability`: MTU, retransmission and reassembly limits
//! - `transport`: compression negotiation and decompression bounds
//! - `logging`: subscriber setup

use crate::error::{ProtocolError, Result};
use crate::reliability::datagram::{Frame, DATA_HEADER_LEN};
use crate::utils::compression::{CompressionKind, DecompressionLimits};
use crate::utils::crypto::TAG_LEN;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Protocol version spoken by this server
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest batch accepted after decryption and decompression (1 MiB)
pub const MAX_BATCH_SIZE: usize = 1024 * 1024;

/// Compression header plus AEAD tag added to every sealed batch
pub const BATCH_OVERHEAD: usize = 1 + TAG_LEN;

/// Default datagram payload size, safely under common path MTUs
pub const DEFAULT_MTU: usize = 1400;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub reliability: ReliabilityConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `BLOCKNET_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `BLOCKNET_*` environment variables on top of the current values
    pub fn apply_env_overrides(&mut self) {
        fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
        }

        if let Ok(addr) = std::env::var("BLOCKNET_SERVER_ADDRESS") {
            self.server.address = addr;
        }
        if let Some(val) = env_parse::<usize>("BLOCKNET_MAX_SESSIONS") {
            self.server.max_sessions = val;
        }
        if let Some(val) = env_parse::<u64>("BLOCKNET_IDLE_TIMEOUT_MS") {
            self.server.idle_timeout = Duration::from_millis(val);
        }
        if let Some(val) = env_parse::<u64>("BLOCKNET_KEEPALIVE_INTERVAL_MS") {
            self.session.keepalive_interval = Duration::from_millis(val);
        }
        if let Some(val) = env_parse::<usize>("BLOCKNET_MTU") {
            self.reliability.mtu = val;
        }
        if let Some(val) = env_parse::<bool>("BLOCKNET_COMPRESSION") {
            self.transport.compression_enabled = val;
        }
        if let Ok(level) = std::env::var("BLOCKNET_LOG_LEVEL") {
            if let Ok(level) = level.parse::<Level>() {
                self.logging.log_level = level;
            }
        }
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.session.validate());
        errors.extend(self.reliability.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());

        if self.server.idle_timeout <= self.reliability.max_rto {
            errors.push("Idle timeout must exceed the maximum retransmission timeout".to_string());
        }
        if self.session.keepalive_timeout <= self.session.keepalive_interval {
            errors.push("Keepalive timeout must exceed the keepalive interval".to_string());
        }
        let capacity = self.reliability.max_payload_len();
        if self.transport.max_batch_size.saturating_add(BATCH_OVERHEAD) > capacity {
            errors.push(format!(
                "Max batch size {} exceeds what one reliable payload can carry: {} bytes (max_split_parts x fragment size)",
                self.transport.max_batch_size,
                capacity.saturating_sub(BATCH_OVERHEAD)
            ));
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-wide settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP bind address (e.g., "0.0.0.0:19132")
    pub address: String,

    /// Maximum number of concurrent sessions in the registry
    pub max_sessions: usize,

    /// Capacity of each session's inbound datagram queue
    pub inbound_queue: usize,

    /// Time allowed from first datagram to the play state
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Time the game sink has to produce the spawn snapshot
    #[serde(with = "duration_serde")]
    pub spawn_timeout: Duration,

    /// Sessions silent for longer than this are evicted by the sweep
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Period of the idle sweep
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("0.0.0.0:19132"),
            max_sessions: 1000,
            inbound_queue: 256,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            spawn_timeout: timeout::SPAWN_TIMEOUT,
            idle_timeout: timeout::IDLE_TIMEOUT,
            sweep_interval: Duration::from_secs(1),
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:19132')",
                self.address
            ));
        }

        if self.max_sessions == 0 {
            errors.push("Max sessions must be greater than 0".to_string());
        } else if self.max_sessions > 100_000 {
            errors.push(format!(
                "Max sessions very high: {} (ensure system resources can support this)",
                self.max_sessions
            ));
        }

        if self.inbound_queue == 0 {
            errors.push("Inbound queue must be greater than 0".to_string());
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        }

        if self.spawn_timeout.as_millis() < 10 {
            errors.push("Spawn timeout too short (minimum: 10ms)".to_string());
        }

        if self.idle_timeout.as_millis() < 100 {
            errors.push("Idle timeout too short (minimum: 100ms)".to_string());
        } else if self.idle_timeout.as_secs() > 3600 {
            errors.push("Idle timeout too long (maximum: 1 hour)".to_string());
        }

        if self.sweep_interval.as_millis() < 10 {
            errors.push("Sweep interval too short (minimum: 10ms)".to_string());
        } else if self.sweep_interval > self.idle_timeout {
            errors.push("Sweep interval cannot exceed the idle timeout".to_string());
        }

        if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Per-session protocol settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between server keepalives in the play state
    #[serde(with = "duration_serde")]
    pub keepalive_interval: Duration,

    /// No keepalive from the peer for this long starts a disconnect
    #[serde(with = "duration_serde")]
    pub keepalive_timeout: Duration,

    /// Unexpected or malformed packets tolerated before a forced disconnect
    pub max_violations: u32,

    /// Maximum packets accepted in one batch
    pub max_packets_per_batch: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: timeout::KEEPALIVE_INTERVAL,
            keepalive_timeout: timeout::KEEPALIVE_TIMEOUT,
            max_violations: 16,
            max_packets_per_batch: 1024,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.keepalive_interval.as_millis() < 100 {
            errors.push("Keepalive interval too short (minimum: 100ms)".to_string());
        }
        if self.max_packets_per_batch == 0 {
            errors.push("Max packets per batch must be greater than 0".to_string());
        }

        errors
    }
}

/// Reliability layer settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// Maximum datagram payload in bytes
    pub mtu: usize,

    /// Period of the session tick (ack flush, retransmission scan)
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// Retransmission timeout before any RTT sample exists
    #[serde(with = "duration_serde")]
    pub initial_rto: Duration,

    #[serde(with = "duration_serde")]
    pub min_rto: Duration,

    #[serde(with = "duration_serde")]
    pub max_rto: Duration,

    /// Resends allowed per datagram before the peer is declared lost
    pub max_retransmissions: u32,

    /// A gap is NAKed once this many later sequence numbers have arrived
    pub nak_threshold: u32,

    /// Datagrams further ahead of the lowest missing sequence are dropped
    pub receive_window: u32,

    /// Maximum fragments in one split batch
    pub max_split_parts: u32,

    /// Maximum split batches reassembling at once
    pub max_concurrent_splits: usize,

    /// Maximum frames held per ordering channel while waiting for a gap
    pub max_ordered_backlog: u32,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            tick_interval: Duration::from_millis(10),
            initial_rto: Duration::from_millis(500),
            min_rto: Duration::from_millis(100),
            max_rto: Duration::from_secs(4),
            max_retransmissions: 8,
            nak_threshold: 3,
            receive_window: 2048,
            max_split_parts: 1024,
            max_concurrent_splits: 64,
            max_ordered_backlog: 2048,
        }
    }
}

impl ReliabilityConfig {
    /// Largest payload one `send` can carry once split into fragments
    pub fn max_payload_len(&self) -> usize {
        let per_fragment = self
            .mtu
            .saturating_sub(DATA_HEADER_LEN + Frame::header_len(true, true));
        per_fragment.saturating_mul(self.max_split_parts as usize)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.mtu < 400 {
            errors.push(format!("MTU too small: {} (minimum: 400)", self.mtu));
        } else if self.mtu > 9000 {
            errors.push(format!("MTU too large: {} (maximum: 9000)", self.mtu));
        }

        if self.tick_interval.as_millis() == 0 {
            errors.push("Tick interval must be at least 1ms".to_string());
        }

        if self.min_rto > self.max_rto {
            errors.push("min_rto cannot exceed max_rto".to_string());
        }
        if self.initial_rto < self.min_rto || self.initial_rto > self.max_rto {
            errors.push("initial_rto must lie between min_rto and max_rto".to_string());
        }

        if self.max_retransmissions == 0 {
            errors.push("Max retransmissions must be greater than 0".to_string());
        }

        if self.nak_threshold == 0 {
            errors.push("NAK threshold must be greater than 0".to_string());
        }

        if self.receive_window < 64 {
            errors.push("Receive window too small (minimum: 64)".to_string());
        }

        if self.max_split_parts == 0 || self.max_split_parts > 8192 {
            errors.push(format!(
                "Invalid max split parts: {} (valid range: 1-8192)",
                self.max_split_parts
            ));
        }

        if self.max_concurrent_splits == 0 {
            errors.push("Max concurrent splits must be greater than 0".to_string());
        }

        errors
    }
}

/// Compression negotiation and batch limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Whether the server accepts compression at all
    pub compression_enabled: bool,

    /// Algorithms in server preference order
    pub compression_preference: Vec<CompressionKind>,

    /// Zstd compression level (ignored by LZ4)
    pub compression_level: i32,

    /// Batches smaller than this are sent uncompressed
    pub compression_threshold_bytes: u16,

    /// Largest batch accepted after decompression
    pub max_batch_size: usize,

    /// Maximum decompressed/compressed ratio for large batches
    pub max_expansion_ratio: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            compression_preference: vec![CompressionKind::Zstd, CompressionKind::Lz4],
            compression_level: 3,
            compression_threshold_bytes: 256,
            max_batch_size: MAX_BATCH_SIZE,
            max_expansion_ratio: 128,
        }
    }
}

impl TransportConfig {
    pub fn decompression_limits(&self) -> DecompressionLimits {
        DecompressionLimits {
            max_size: self.max_batch_size,
            max_ratio: self.max_expansion_ratio,
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_batch_size < 1024 {
            errors.push("Max batch size too small (minimum: 1 KB)".to_string());
        } else if self.max_batch_size > 64 * 1024 * 1024 {
            errors.push(format!(
                "Max batch size too large: {} bytes (maximum recommended: 64 MB)",
                self.max_batch_size
            ));
        }

        if self.compression_enabled {
            if self.compression_preference.is_empty() {
                errors.push("Compression enabled but no algorithm listed".to_string());
            }
            if self.compression_level < 1 || self.compression_level > 22 {
                errors.push(format!(
                    "Invalid compression level: {} (valid range: 1-22)",
                    self.compression_level
                ));
            }
        }

        if self.max_expansion_ratio < 2 {
            errors.push("Max expansion ratio must be at least 2".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,

    /// Whether to include the target module in each line
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("blocknet"),
            log_level: Level::INFO,
            json_format: false,
            show_target: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
