//! Server configuration.
//!
//! Configuration is layered:
//! - TOML file (`parley.toml`, `/etc/parley/parley.toml`,
//!   `~/.config/parley/parley.toml`, first match wins)
//! - Environment variables (`PARLEY__PORT`, `PARLEY__LIMITS__MAX_MESSAGE_SIZE`, ...)

use anyhow::{Context, Result};
use parley_core::{
    EngineConfig, IdentityResolver, MessageLimits, PassthroughResolver, RoomBounds,
    StaticTokenResolver,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const CONFIG_PATHS: [&str; 3] = [
    "parley.toml",
    "/etc/parley/parley.toml",
    "~/.config/parley/parley.toml",
];

const ENV_PREFIX: &str = "PARLEY";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource and payload limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub rooms: RoomsConfig,

    #[serde(default)]
    pub typing: TypingConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Accept MessagePack binary frames next to JSON text frames.
    #[serde(default = "default_true")]
    pub binary_frames: bool,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections, counted from the handshake.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue capacity per connection.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,

    #[serde(default = "default_max_image_url_len")]
    pub max_image_url_len: usize,

    #[serde(default = "default_max_read_batch")]
    pub max_read_batch: usize,

    #[serde(default = "default_max_page_limit")]
    pub max_page_limit: u32,
}

/// Topic room configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    #[serde(default = "default_max_title_chars")]
    pub max_title_chars: usize,

    #[serde(default = "default_max_category_chars")]
    pub max_category_chars: usize,

    #[serde(default = "default_min_duration")]
    pub min_duration_minutes: u64,

    #[serde(default = "default_max_duration")]
    pub max_duration_minutes: u64,

    #[serde(default = "default_min_max_users")]
    pub min_max_users: u32,

    #[serde(default = "default_max_max_users")]
    pub max_max_users: u32,

    #[serde(default = "default_max_room_message_chars")]
    pub max_message_chars: usize,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Minutes a purged room keeps answering `ROOM_EXPIRED`.
    #[serde(default = "default_purged_retention")]
    pub purged_retention_minutes: u64,

    /// Maintenance pass interval in milliseconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

/// Typing indicator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// Idle window before an indicator lapses, in milliseconds.
    #[serde(default = "default_typing_idle")]
    pub idle_timeout_ms: u64,
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

/// How caller tokens are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// The token is the identity provider subject.
    #[default]
    Passthrough,
    /// Tokens are looked up in `auth.tokens`.
    Static,
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,

    /// Token -> subject, for `static` mode.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_queue() -> usize {
    256
}

fn default_max_body_chars() -> usize {
    2_000
}

fn default_max_image_url_len() -> usize {
    2_048
}

fn default_max_read_batch() -> usize {
    500
}

fn default_max_page_limit() -> u32 {
    100
}

fn default_max_title_chars() -> usize {
    50
}

fn default_max_category_chars() -> usize {
    32
}

fn default_min_duration() -> u64 {
    1
}

fn default_max_duration() -> u64 {
    1_440 // 24 hours
}

fn default_min_max_users() -> u32 {
    2
}

fn default_max_max_users() -> u32 {
    500
}

fn default_max_room_message_chars() -> usize {
    1_000
}

fn default_history_limit() -> usize {
    100
}

fn default_purged_retention() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    1_000
}

fn default_typing_idle() -> u64 {
    5_000
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
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
            rooms: RoomsConfig::default(),
            typing: TypingConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            binary_frames: true,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
            max_body_chars: default_max_body_chars(),
            max_image_url_len: default_max_image_url_len(),
            max_read_batch: default_max_read_batch(),
            max_page_limit: default_max_page_limit(),
        }
    }
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            max_title_chars: default_max_title_chars(),
            max_category_chars: default_max_category_chars(),
            min_duration_minutes: default_min_duration(),
            max_duration_minutes: default_max_duration(),
            min_max_users: default_min_max_users(),
            max_max_users: default_max_max_users(),
            max_message_chars: default_max_room_message_chars(),
            history_limit: default_history_limit(),
            purged_retention_minutes: default_purged_retention(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_typing_idle(),
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

impl Config {
    /// Load configuration from the first config file found plus environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        let mut builder = ::config::Config::builder();
        if let Some(path) = &file {
            builder = builder
                .add_source(::config::File::from(Path::new(path)).format(::config::FileFormat::Toml));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(::config::Config::try_deserialize)
            .with_context(|| match &file {
                Some(path) => format!("Failed to load config file: {path}"),
                None => "Failed to load config from environment".to_string(),
            })
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

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            limits: MessageLimits {
                max_body_chars: self.limits.max_body_chars,
                max_image_url_len: self.limits.max_image_url_len,
                max_read_batch: self.limits.max_read_batch,
                max_page_limit: self.limits.max_page_limit,
            },
            rooms: RoomBounds {
                max_title_chars: self.rooms.max_title_chars,
                max_category_chars: self.rooms.max_category_chars,
                min_duration_minutes: self.rooms.min_duration_minutes,
                max_duration_minutes: self.rooms.max_duration_minutes,
                min_max_users: self.rooms.min_max_users,
                max_max_users: self.rooms.max_max_users,
                max_message_chars: self.rooms.max_message_chars,
                history_limit: self.rooms.history_limit,
                purged_retention_minutes: self.rooms.purged_retention_minutes,
            },
            typing_idle_timeout: Duration::from_millis(self.typing.idle_timeout_ms),
            queue_capacity: self.limits.outbound_queue.max(1),
        }
    }

    /// The token resolver selected by `auth.mode`.
    #[must_use]
    pub fn identity_resolver(&self) -> Arc<dyn IdentityResolver> {
        match self.auth.mode {
            AuthMode::Passthrough => Arc::new(PassthroughResolver),
            AuthMode::Static => Arc::new(
                self.auth
                    .tokens
                    .iter()
                    .map(|(token, subject)| (token.clone(), subject.clone()))
                    .collect::<StaticTokenResolver>(),
            ),
        }
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms.max(1))
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms.max(1))
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.rooms.sweep_interval_ms.max(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert!(config.transport.binary_frames);
        assert_eq!(config.auth.mode, AuthMode::Passthrough);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

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
            max_connections = 50000
            max_body_chars = 500

            [rooms]
            min_duration_minutes = 0
            sweep_interval_ms = 250

            [typing]
            idle_timeout_ms = 3000

            [auth]
            mode = "static"

            [auth.tokens]
            "secret-1" = "user_1"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.max_message_size, 64 * 1024);
        assert_eq!(config.auth.mode, AuthMode::Static);
        assert_eq!(config.auth.tokens["secret-1"], "user_1");

        let engine = config.engine_config();
        assert_eq!(engine.limits.max_body_chars, 500);
        assert_eq!(engine.rooms.min_duration_minutes, 0);
        assert_eq!(engine.typing_idle_timeout, Duration::from_secs(3));
        assert_eq!(config.sweep_interval(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_static_auth_resolver() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            mode = "static"
            tokens = { "t0k" = "user_7" }
        "#,
        )
        .unwrap();

        let resolver = config.identity_resolver();
        assert_eq!(resolver.resolve("t0k").await.unwrap().subject, "user_7");
        assert!(resolver.resolve("user_7").await.is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("parley-test-{}.toml", std::process::id()));
        std::fs::write(&path, "port = 7001\n[heartbeat]\ntimeout_ms = 1500\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.port, 7001);
        assert_eq!(config.heartbeat_timeout(), Duration::from_millis(1500));
        assert_eq!(config.heartbeat.interval_ms, 30_000);
    }
}
