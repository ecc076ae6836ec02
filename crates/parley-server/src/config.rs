//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (PARLEY_HOST, PARLEY_PORT)
//! - TOML configuration file (`parley.toml`, `/etc/parley/parley.toml`,
//!   `~/.config/parley/parley.toml`)

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use parley_core::{DeliveryPolicy, HubConfig, SessionConfig, FALLBACK_ROOM};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Presence configuration.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Room configuration.
    #[serde(default)]
    pub rooms: RoomsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Messages a session may have pending before it is evicted.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Events that may wait for the hub loop.
    #[serde(default = "default_hub_capacity")]
    pub hub_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Read timeout in milliseconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Write timeout in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Inactivity in seconds after which an online user becomes away.
    #[serde(default = "default_auto_away")]
    pub auto_away_timeout_secs: u64,

    /// Let busy senders raise popups.
    #[serde(default = "default_true")]
    pub escalate_busy_senders: bool,
}

/// Room configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    /// Room used when a client names none and no rooms exist.
    #[serde(default = "default_fallback_room")]
    pub fallback: String,

    /// Rooms created at startup.
    #[serde(default = "default_seed_rooms")]
    pub seed: Vec<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("PARLEY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PARLEY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    512
}

fn default_queue_capacity() -> usize {
    256
}

fn default_hub_capacity() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    110_000 // 110 seconds
}

fn default_read_timeout() -> u64 {
    120_000 // 120 seconds
}

fn default_write_timeout() -> u64 {
    20_000 // 20 seconds
}

fn default_auto_away() -> u64 {
    30 * 60
}

fn default_fallback_room() -> String {
    FALLBACK_ROOM.to_string()
}

fn default_seed_rooms() -> Vec<String> {
    vec!["general".to_string(), "random".to_string(), "tech".to_string()]
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            presence: PresenceConfig::default(),
            rooms: RoomsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            queue_capacity: default_queue_capacity(),
            hub_capacity: default_hub_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            read_timeout_ms: default_read_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            auto_away_timeout_secs: default_auto_away(),
            escalate_busy_senders: true,
        }
    }
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            fallback: default_fallback_room(),
            seed: default_seed_rooms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// if the resulting configuration is invalid.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "parley.toml",
            "/etc/parley/parley.toml",
            "~/.config/parley/parley.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.interval_ms >= self.heartbeat.read_timeout_ms {
            bail!(
                "heartbeat.interval_ms ({}) must be shorter than heartbeat.read_timeout_ms ({})",
                self.heartbeat.interval_ms,
                self.heartbeat.read_timeout_ms
            );
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.write_timeout_ms == 0 {
            bail!("heartbeat intervals must be non-zero");
        }
        if self.limits.max_message_size == 0 || self.limits.queue_capacity == 0 {
            bail!("limits must be non-zero");
        }
        if self.rooms.fallback.is_empty() {
            bail!("rooms.fallback must not be empty");
        }
        if !self.transport.websocket_path.starts_with('/') {
            bail!("transport.websocket_path must start with '/'");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Per-session limits and timers.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_message_size: self.limits.max_message_size,
            queue_capacity: self.limits.queue_capacity,
            heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms),
            read_timeout: Duration::from_millis(self.heartbeat.read_timeout_ms),
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
        }
    }

    /// Hub settings.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            intake_capacity: self.limits.hub_capacity,
        }
    }

    /// Delivery policy.
    #[must_use]
    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            escalate_busy_senders: self.presence.escalate_busy_senders,
        }
    }

    /// Auto-away timeout.
    #[must_use]
    pub fn auto_away_timeout(&self) -> Duration {
        Duration::from_secs(self.presence.auto_away_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.limits.max_message_size, 512);
        assert_eq!(config.limits.queue_capacity, 256);
        assert_eq!(config.rooms.seed, vec!["general", "random", "tech"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "127.0.0.1".to_string();
        config.port = 8080;
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        config.host = "not a host".to_string();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            queue_capacity = 64

            [presence]
            escalate_busy_senders = false

            [rooms]
            seed = ["lobby"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.queue_capacity, 64);
        assert_eq!(config.limits.max_message_size, 512);
        assert!(!config.delivery_policy().escalate_busy_senders);
        assert_eq!(config.rooms.seed, vec!["lobby"]);
        assert_eq!(config.rooms.fallback, "general");
    }

    #[test]
    fn test_session_config_mapping() {
        let session = Config::default().session_config();
        assert_eq!(session.heartbeat_interval, Duration::from_secs(110));
        assert_eq!(session.read_timeout, Duration::from_secs(120));
        assert_eq!(session.write_timeout, Duration::from_secs(20));
        assert_eq!(session.max_message_size, 512);
    }

    #[test]
    fn test_heartbeat_must_undercut_read_timeout() {
        let mut config = Config::default();
        config.heartbeat.interval_ms = 120_000;
        assert!(config.validate().is_err());
    }
}
