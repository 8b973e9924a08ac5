//! Configuration loading for mailroom-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`). Every
//! section and every field is optional; missing values take the defaults
//! below.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for mailroom-relay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Size, buffer and rate limits.
    pub limits: LimitsConfig,
    /// Message lifetime configuration.
    pub messages: MessagesConfig,
    /// Keepalive timing.
    pub keepalive: KeepaliveConfig,
    /// Per-session behavior.
    pub session: SessionConfig,
    /// Expiry sweep configuration.
    pub cleanup: CleanupConfig,
    /// Federation ingress configuration.
    pub federation: FederationConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP/WebSocket listener (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Name reported by discovery and health endpoints.
    #[serde(default = "default_server_name")]
    pub name: String,
}

/// Size, buffer and rate limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum size of one inbound WebSocket frame in bytes (default: 512 KiB).
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Maximum envelope payload size in bytes (default: 256 KiB).
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,
    /// Outbound buffer depth per connection, in frames (default: 256).
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Maximum concurrently registered connections (default: 10000).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum connection attempts per client IP per minute (default: 10).
    #[serde(default = "default_connections_per_ip")]
    pub connections_per_ip: u32,
    /// Maximum envelopes per identity per minute (default: 600).
    #[serde(default = "default_messages_per_minute")]
    pub messages_per_minute: u32,
    /// Maximum envelopes per second across all clients (default: 1000).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
}

/// Message lifetime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesConfig {
    /// TTL applied when an envelope carries none, in seconds (default: 24 hours).
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,
    /// Upper bound on any envelope's TTL, in seconds (default: 7 days).
    #[serde(default = "default_max_ttl")]
    pub max_ttl_secs: u64,
    /// Maximum queued envelopes per recipient; 0 means unlimited (default: 0).
    /// When full, the oldest queued envelope is dropped.
    #[serde(default)]
    pub max_queue_per_recipient: usize,
}

/// Keepalive timing.
#[derive(Debug, Clone, Deserialize)]
pub struct KeepaliveConfig {
    /// Interval between pings, in seconds (default: 54).
    /// Must be shorter than `pong_wait_secs`.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// How long to wait for a pong before dropping the connection (default: 60).
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,
    /// Deadline for a single write to the socket, in seconds (default: 10).
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

/// Per-session behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Send an ack frame to the sender after each routed envelope (default: true).
    #[serde(default = "default_send_acks")]
    pub send_acks: bool,
    /// Maximum frames coalesced into one flush (default: 32).
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

/// Expiry sweep configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Sweep interval in seconds (default: 30).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable the sweep task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

/// Federation ingress configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FederationConfig {
    /// Accept envelopes on `/federation/message` (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Relay domains allowed to forward envelopes here.
    #[serde(default)]
    pub peers: Vec<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it (default: "info").
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "pretty" or "json" (default: "pretty").
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_server_name() -> String {
    "mailroom-relay".to_string()
}

fn default_max_frame_size() -> usize {
    512 * 1024 // 512 KiB
}

fn default_max_payload_size() -> usize {
    256 * 1024 // 256 KiB
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_max_connections() -> usize {
    10_000
}

fn default_connections_per_ip() -> u32 {
    10
}

fn default_messages_per_minute() -> u32 {
    600
}

fn default_global_requests_per_second() -> u32 {
    1000
}

fn default_ttl() -> u64 {
    24 * 60 * 60 // 24 hours
}

fn default_max_ttl() -> u64 {
    7 * 24 * 60 * 60 // 7 days
}

fn default_ping_interval() -> u64 {
    54 // 9/10 of pong wait
}

fn default_pong_wait() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    10
}

fn default_send_acks() -> bool {
    true
}

fn default_max_batch() -> usize {
    32
}

fn default_cleanup_interval() -> u64 {
    30
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            name: default_server_name(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            max_payload_size: default_max_payload_size(),
            outbound_buffer: default_outbound_buffer(),
            max_connections: default_max_connections(),
            connections_per_ip: default_connections_per_ip(),
            messages_per_minute: default_messages_per_minute(),
            global_requests_per_second: default_global_requests_per_second(),
        }
    }
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl(),
            max_ttl_secs: default_max_ttl(),
            max_queue_per_recipient: 0,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            pong_wait_secs: default_pong_wait(),
            write_timeout_secs: default_write_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_acks: default_send_acks(),
            max_batch: default_max_batch(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl KeepaliveConfig {
    /// Ping interval as a `Duration`.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Pong wait as a `Duration`.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Write timeout as a `Duration`.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check that the values are usable together.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        }

        if self.server.bind_address.is_empty() {
            return invalid("server.bind_address", "is required");
        }
        if self.limits.max_frame_size == 0 {
            return invalid("limits.max_frame_size", "must be positive");
        }
        if self.limits.max_payload_size == 0 {
            return invalid("limits.max_payload_size", "must be positive");
        }
        if self.limits.max_payload_size > self.limits.max_frame_size {
            return invalid("limits.max_payload_size", "must not exceed max_frame_size");
        }
        if self.limits.outbound_buffer == 0 {
            return invalid("limits.outbound_buffer", "must be positive");
        }
        if self.limits.max_connections == 0 {
            return invalid("limits.max_connections", "must be positive");
        }
        if self.limits.connections_per_ip == 0
            || self.limits.messages_per_minute == 0
            || self.limits.global_requests_per_second == 0
        {
            return invalid("limits", "rate limit quotas must be positive");
        }
        if self.messages.default_ttl_secs == 0 {
            return invalid("messages.default_ttl_secs", "must be positive");
        }
        if self.messages.default_ttl_secs > self.messages.max_ttl_secs {
            return invalid("messages.default_ttl_secs", "must not exceed max_ttl_secs");
        }
        if self.keepalive.ping_interval_secs == 0 {
            return invalid("keepalive.ping_interval_secs", "must be positive");
        }
        if self.keepalive.ping_interval_secs >= self.keepalive.pong_wait_secs {
            return invalid("keepalive.ping_interval_secs", "must be less than pong_wait_secs");
        }
        if self.keepalive.write_timeout_secs == 0 {
            return invalid("keepalive.write_timeout_secs", "must be positive");
        }
        if self.session.max_batch == 0 {
            return invalid("session.max_batch", "must be positive");
        }
        if self.cleanup.enabled && self.cleanup.interval_secs == 0 {
            return invalid("cleanup.interval_secs", "must be positive when cleanup is enabled");
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return invalid("logging.format", "must be \"pretty\" or \"json\"");
        }
        Ok(())
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
    /// A value is out of range or inconsistent with another.
    #[error("invalid configuration: {field} {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
