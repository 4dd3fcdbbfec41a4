//! Configuration Module
//!
//! Provides TOML-based configuration for PulseHub with support for:
//! - Server settings (WebSocket bind address and base path)
//! - Management server settings
//! - Connection and subscription limits
//! - Authentication, idle and send timeouts
//! - Heartbeat and recovery tuning
//! - Static identity tokens
//! - Environment variable overrides (PULSEHUB__* prefix)

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use admin::AdminConfig;
pub use engine::EngineConfig;

mod admin;
mod engine;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// WebSocket server configuration
    pub server: ServerConfig,
    /// Management server configuration
    pub admin: AdminConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// Lifecycle timeouts
    pub timeouts: TimeoutsConfig,
    /// Heartbeat monitor configuration
    pub heartbeat: HeartbeatConfig,
    /// Recovery engine configuration
    pub recovery: RecoveryConfig,
    /// Publish delivery configuration
    pub dispatch: DispatchConfig,
    /// Identity token configuration
    pub auth: AuthConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// WebSocket server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address for WebSocket clients
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Base path of the WebSocket endpoints (default: "/ws").
    /// Per-topic endpoints live at `{ws_path}/health`, `{ws_path}/chat`
    /// and `{ws_path}/notifications`.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ws_path: default_ws_path(),
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of admitted connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum authenticated connections per user; the oldest is evicted
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    /// Maximum inbound message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Maximum topics a single connection may subscribe to
    #[serde(default = "default_max_subscriptions_per_connection")]
    pub max_subscriptions_per_connection: usize,
    /// Per-connection outbound frame queue capacity.
    /// A full queue makes sends wait up to the send timeout.
    #[serde(default = "default_outbound_channel_capacity")]
    pub outbound_channel_capacity: usize,
}

fn default_max_connections() -> usize {
    1000
}
fn default_max_connections_per_user() -> usize {
    5
}
fn default_max_message_size() -> usize {
    64 * 1024
}
fn default_max_subscriptions_per_connection() -> usize {
    64
}
fn default_outbound_channel_capacity() -> usize {
    256
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_connections_per_user: default_max_connections_per_user(),
            max_message_size: default_max_message_size(),
            max_subscriptions_per_connection: default_max_subscriptions_per_connection(),
            outbound_channel_capacity: default_outbound_channel_capacity(),
        }
    }
}

/// Lifecycle timeouts (e.g., "30s", "1h")
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Time allowed between admission and a valid `authenticate`
    #[serde(with = "humantime_serde")]
    pub auth: Duration,
    /// Silence after which a connection without subscriptions is closed
    #[serde(with = "humantime_serde")]
    pub idle: Duration,
    /// Upper bound on a single outbound send
    #[serde(with = "humantime_serde")]
    pub send: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            auth: Duration::from_secs(30),
            idle: Duration::from_secs(3600),
            send: Duration::from_secs(5),
        }
    }
}

/// Heartbeat monitor configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Probe interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Consecutive missed intervals before a connection is marked ERROR
    pub missed_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            missed_threshold: 2,
        }
    }
}

/// Recovery engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Recovery sweep interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Attempts before the connection is disconnected
    pub max_attempts: u32,
    /// First backoff delay
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    /// Backoff ceiling
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    /// Upper bound on a single liveness probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Publish delivery configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Consecutive send failures before a subscriber is marked ERROR
    pub failure_threshold: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
        }
    }
}

/// Identity token configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Static token table consulted by the bundled verifier
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

/// A pre-minted identity token
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Opaque token presented in `authenticate`
    pub token: String,
    /// User the token identifies
    pub user_id: String,
    /// Roles granted to the user
    #[serde(default)]
    pub roles: Vec<String>,
    /// Expiry (RFC 3339); tokens without one never expire
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Revoked tokens are rejected
    #[serde(default)]
    pub revoked: bool,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `PULSEHUB__` prefix with double underscores for nesting:
    ///    - `PULSEHUB__SERVER__BIND=0.0.0.0:8081` overrides `server.bind`
    ///    - `PULSEHUB__LIMITS__MAX_CONNECTIONS=2000` overrides `limits.max_connections`
    ///    - `PULSEHUB__TIMEOUTS__IDLE=30m` overrides `timeouts.idle`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:8080")?
            .set_default("server.ws_path", "/ws")?
            .set_default("admin.enabled", true)?
            .set_default("admin.bind", "127.0.0.1:9090")?
            .set_default("limits.max_connections", 1000)?
            .set_default("limits.max_connections_per_user", 5)?
            .set_default("limits.max_message_size", 64 * 1024)?
            .set_default("limits.max_subscriptions_per_connection", 64)?
            .set_default("limits.outbound_channel_capacity", 256)?
            .set_default("timeouts.auth", "30s")?
            .set_default("timeouts.idle", "1h")?
            .set_default("timeouts.send", "5s")?
            .set_default("heartbeat.interval", "30s")?
            .set_default("heartbeat.missed_threshold", 2)?
            .set_default("recovery.interval", "60s")?
            .set_default("recovery.max_attempts", 5)?
            .set_default("recovery.backoff_base", "1s")?
            .set_default("recovery.backoff_max", "60s")?
            .set_default("recovery.probe_timeout", "5s")?
            .set_default("dispatch.failure_threshold", 3)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("PULSEHUB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid =
            |msg: &str| -> Result<(), ConfigError> { Err(ConfigError::Validation(msg.to_string())) };

        if !self.server.ws_path.starts_with('/') {
            return invalid("server.ws_path must start with '/'");
        }

        if self.limits.max_connections == 0 {
            return invalid("limits.max_connections must be at least 1");
        }
        if self.limits.max_connections_per_user == 0 {
            return invalid("limits.max_connections_per_user must be at least 1");
        }
        if self.limits.max_message_size == 0 {
            return invalid("limits.max_message_size must be at least 1");
        }
        if self.limits.outbound_channel_capacity == 0 {
            return invalid("limits.outbound_channel_capacity must be at least 1");
        }

        if self.timeouts.auth.is_zero() || self.timeouts.send.is_zero() {
            return invalid("timeouts.auth and timeouts.send must be non-zero");
        }

        if self.heartbeat.interval.is_zero() {
            return invalid("heartbeat.interval must be non-zero");
        }
        if self.heartbeat.missed_threshold == 0 {
            return invalid("heartbeat.missed_threshold must be at least 1");
        }

        if self.recovery.interval.is_zero() || self.recovery.probe_timeout.is_zero() {
            return invalid("recovery.interval and recovery.probe_timeout must be non-zero");
        }
        if self.recovery.max_attempts == 0 {
            return invalid("recovery.max_attempts must be at least 1");
        }
        if self.recovery.backoff_base.is_zero() {
            return invalid("recovery.backoff_base must be non-zero");
        }
        if self.recovery.backoff_base > self.recovery.backoff_max {
            return invalid("recovery.backoff_base cannot exceed recovery.backoff_max");
        }

        if self.dispatch.failure_threshold == 0 {
            return invalid("dispatch.failure_threshold must be at least 1");
        }

        let mut seen = HashSet::new();
        for entry in &self.auth.tokens {
            if entry.token.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Token for user '{}' is empty",
                    entry.user_id
                )));
            }
            if entry.user_id.is_empty() {
                return invalid("auth.tokens entries must have a user_id");
            }
            if !seen.insert(entry.token.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate token configured for user '{}'",
                    entry.user_id
                )));
            }
        }

        Ok(())
    }
}
