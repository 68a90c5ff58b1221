//! Client configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (WAVELINK_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use wavelink_core::CacheSettings;

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the server-push stream endpoint.
    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    /// Base URL of the control plane.
    #[serde(default = "default_control_url")]
    pub control_url: String,

    /// Client identifier; a random one is generated when absent.
    #[serde(default)]
    pub client_id: Option<String>,

    /// Bearer token supplied by the session layer, if any.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Reconnection configuration.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Offline queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Archive configuration.
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between pings in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// How long to wait for the matching pong in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Reconnection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Base backoff delay in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Backoff delay cap in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Automatic attempts before parking until a manual connect.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Timeout for establishing the stream in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

/// Offline queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Bound on pending outbound publishes.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

/// Archive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Ring-buffer capacity per keyspace.
    #[serde(default = "default_archive_capacity")]
    pub capacity: usize,
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub persist_messages: bool,

    #[serde(default = "default_true")]
    pub persist_subscriptions: bool,

    #[serde(default = "default_max_cached")]
    pub max_cached_messages: usize,

    /// Cache entry age limit in seconds; `0` disables age expiry.
    #[serde(default)]
    pub ttl_seconds: u64,

    /// Interval between expiry sweeps in milliseconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Filesystem path for durable storage; in-memory when absent.
    #[serde(default)]
    pub path: Option<String>,
}

// Default value functions
fn default_stream_url() -> String {
    std::env::var("WAVELINK_STREAM_URL").unwrap_or_else(|_| "ws://127.0.0.1:8080/stream".to_string())
}

fn default_control_url() -> String {
    std::env::var("WAVELINK_CONTROL_URL").unwrap_or_else(|_| "http://127.0.0.1:8080/api".to_string())
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    5_000 // 5 seconds
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_max_pending() -> usize {
    256
}

fn default_archive_capacity() -> usize {
    100
}

fn default_max_cached() -> usize {
    200
}

fn default_sweep_interval() -> u64 {
    60_000 // 60 seconds
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream_url: default_stream_url(),
            control_url: default_control_url(),
            client_id: None,
            auth_token: None,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            queue: QueueConfig::default(),
            archive: ArchiveConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_max_attempts(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            capacity: default_archive_capacity(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            persist_messages: true,
            persist_subscriptions: true,
            max_cached_messages: default_max_cached(),
            ttl_seconds: 0,
            sweep_interval_ms: default_sweep_interval(),
            path: None,
        }
    }
}

impl CacheConfig {
    /// The cache settings these options describe, used as defaults when no
    /// persisted settings exist yet.
    #[must_use]
    pub fn to_settings(&self) -> CacheSettings {
        CacheSettings {
            enabled: self.enabled,
            persist_messages: self.persist_messages,
            persist_subscriptions: self.persist_subscriptions,
            max_cached_messages: self.max_cached_messages.max(1),
            ttl_seconds: self.ttl_seconds,
            last_cleanup: chrono::Utc::now(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "wavelink.toml",
            "/etc/wavelink/wavelink.toml",
            "~/.config/wavelink/wavelink.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
