//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults (`PARLEY_HOST` / `PARLEY_PORT` adjust the bind address)
//! - A TOML file, given with `--config` or found in a default location
//! - Environment variables of the form `PARLEY__SECTION__KEY`

use anyhow::{bail, Context, Result};
use parley_core::{RouterConfig, DEFAULT_MAX_MESSAGES_PER_ROOM, DEFAULT_MAX_PRIVATE_MESSAGES};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file locations, in lookup order.
const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

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

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Rooms and message rules.
    #[serde(default)]
    pub chat: ChatConfig,

    /// History paging.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Persistence backend.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
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
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Events queued per connection before new ones are dropped.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
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

/// Room configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Rooms that always exist.
    #[serde(default = "default_rooms")]
    pub rooms: Vec<String>,

    /// Room every user enters on join.
    #[serde(default = "default_room")]
    pub default_room: String,

    /// Create undeclared rooms on first join.
    #[serde(default = "default_true")]
    pub auto_create_rooms: bool,

    /// Maximum message body plus attachment size in bytes.
    #[serde(default = "default_max_body_len")]
    pub max_body_len: usize,
}

/// History paging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Messages sent on join and room switch.
    #[serde(default = "default_join_size")]
    pub join_size: usize,

    /// Page size when a client names none.
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    /// Largest page a client may request.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    /// Page size of `/api/messages` when no limit is given.
    #[serde(default = "default_api_limit")]
    pub api_default_limit: usize,
}

/// Persistence backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    /// Process-local storage.
    #[default]
    Memory,
    /// No persistence.
    None,
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Backend to use.
    #[serde(default)]
    pub backend: PersistenceBackend,

    /// Deadline for each store call in milliseconds.
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    /// Messages kept per room by the memory backend.
    #[serde(default = "default_max_messages_per_room")]
    pub max_messages_per_room: usize,

    /// Private messages kept by the memory backend.
    #[serde(default = "default_max_private_messages")]
    pub max_private_messages: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,

    /// Filter directives, used when `RUST_LOG` is unset.
    #[serde(default)]
    pub filter: Option<String>,
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

fn default_max_connections() -> usize {
    10_000
}

fn default_max_message_size() -> usize {
    // Attachments travel inline, so frames are allowed to exceed the body limit.
    1024 * 1024
}

fn default_outbox_capacity() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    25_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_rooms() -> Vec<String> {
    vec!["general".into(), "random".into(), "tech".into()]
}

fn default_room() -> String {
    "general".to_string()
}

fn default_max_body_len() -> usize {
    64 * 1024
}

fn default_join_size() -> usize {
    50
}

fn default_page_size() -> usize {
    20
}

fn default_max_page_size() -> usize {
    100
}

fn default_api_limit() -> usize {
    50
}

fn default_max_messages_per_room() -> usize {
    DEFAULT_MAX_MESSAGES_PER_ROOM
}

fn default_max_private_messages() -> usize {
    DEFAULT_MAX_PRIVATE_MESSAGES
}

fn default_store_timeout() -> u64 {
    2_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            chat: ChatConfig::default(),
            history: HistoryConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
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
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            outbox_capacity: default_outbox_capacity(),
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

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            rooms: default_rooms(),
            default_room: default_room(),
            auto_create_rooms: true,
            max_body_len: default_max_body_len(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            join_size: default_join_size(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            api_default_limit: default_api_limit(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::default(),
            timeout_ms: default_store_timeout(),
            max_messages_per_room: default_max_messages_per_room(),
            max_private_messages: default_max_private_messages(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Uses `path` if given, otherwise the first default location that
    /// exists, then applies `PARLEY__*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be parsed or the result is
    /// inconsistent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::find_default_file(),
        };

        let mut builder = ::config::Config::builder();
        if let Some(file) = &file {
            tracing::debug!(path = %file.display(), "Loading config file");
            builder = builder.add_source(
                ::config::File::from(file.as_path())
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("PARLEY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("chat.rooms"),
        );

        let config: Config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn find_default_file() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Check settings that cannot be expressed by serde defaults.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistent setting.
    pub fn validate(&self) -> Result<()> {
        if !self.transport.websocket_path.starts_with('/') {
            bail!("transport.websocket_path must start with '/'");
        }
        if self.chat.default_room.is_empty() || self.chat.default_room.starts_with('$') {
            bail!("chat.default_room is not a valid room name");
        }
        if self.history.max_page_size == 0 || self.history.default_page_size == 0 {
            bail!("history page sizes must be at least 1");
        }
        if self.persistence.max_messages_per_room == 0 || self.persistence.max_private_messages == 0
        {
            bail!("persistence retention limits must be at least 1");
        }
        if self.limits.outbox_capacity == 0 {
            bail!("limits.outbox_capacity must be at least 1");
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms <= self.heartbeat.interval_ms
        {
            bail!("heartbeat.timeout_ms must be greater than heartbeat.interval_ms");
        }
        Ok(())
    }

    /// Render the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
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

    /// Router settings derived from this configuration.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            default_room: self.chat.default_room.clone(),
            rooms: self.chat.rooms.clone(),
            auto_create_rooms: self.chat.auto_create_rooms,
            join_history_size: self.history.join_size,
            default_page_size: self.history.default_page_size,
            max_page_size: self.history.max_page_size,
            store_timeout: Duration::from_millis(self.persistence.timeout_ms),
            outbox_capacity: self.limits.outbox_capacity,
            max_body_len: self.chat.max_body_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.chat.default_room, "general");
        assert_eq!(config.persistence.backend, PersistenceBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 500

            [chat]
            rooms = ["lobby", "ops"]
            default_room = "lobby"
            auto_create_rooms = false

            [persistence]
            backend = "none"
            timeout_ms = 250
            max_messages_per_room = 200
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 500);
        assert_eq!(config.persistence.backend, PersistenceBackend::None);
        assert_eq!(config.history.join_size, 50);
        assert_eq!(config.persistence.max_messages_per_room, 200);
        assert_eq!(
            config.persistence.max_private_messages,
            DEFAULT_MAX_PRIVATE_MESSAGES
        );

        let router = config.router_config();
        assert_eq!(router.default_room, "lobby");
        assert_eq!(router.rooms, ["lobby", "ops"]);
        assert!(!router.auto_create_rooms);
        assert_eq!(router.store_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_load_explicit_file() {
        let path = std::env::temp_dir().join(format!("parley-test-{}.toml", std::process::id()));
        std::fs::write(&path, "[heartbeat]\ninterval_ms = 1000\ntimeout_ms = 3000\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.heartbeat.interval_ms, 1000);
        assert_eq!(config.heartbeat.timeout_ms, 3000);
        assert!(Config::load(Some(Path::new("/nonexistent/parley.toml"))).is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.heartbeat.timeout_ms = config.heartbeat.interval_ms;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.websocket_path = "ws".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.persistence.max_messages_per_room = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.chat.rooms, config.chat.rooms);
    }
}
