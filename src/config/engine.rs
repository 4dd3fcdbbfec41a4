//! Runtime engine configuration
//!
//! The flattened, validated settings the registry, dispatcher and background
//! loops run with. Built from a file [`Config`](super::Config) and then
//! adjusted by CLI overrides.

use std::net::SocketAddr;
use std::time::Duration;

use super::Config;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// WebSocket bind address
    pub bind_addr: SocketAddr,
    /// Base WebSocket path
    pub ws_path: String,
    /// Management bind address (`None` disables the management server)
    pub admin_bind_addr: Option<SocketAddr>,
    /// Global connection capacity
    pub max_connections: usize,
    /// Per-user connection cap
    pub max_connections_per_user: usize,
    /// Maximum inbound message size
    pub max_message_size: usize,
    /// Maximum subscriptions per connection
    pub max_subscriptions_per_connection: usize,
    /// Outbound frame queue capacity per connection
    pub outbound_channel_capacity: usize,
    /// Authentication deadline after admission
    pub auth_timeout: Duration,
    /// Idle timeout for connections without subscriptions
    pub idle_timeout: Duration,
    /// Per-send timeout
    pub send_timeout: Duration,
    /// Heartbeat probe interval
    pub heartbeat_interval: Duration,
    /// Missed intervals before HeartbeatTimeout
    pub heartbeat_missed_threshold: u32,
    /// Recovery sweep interval
    pub recovery_interval: Duration,
    /// Maximum recovery attempts
    pub max_recovery_attempts: u32,
    /// Recovery backoff base
    pub recovery_backoff_base: Duration,
    /// Recovery backoff cap
    pub recovery_backoff_max: Duration,
    /// Recovery probe timeout
    pub recovery_probe_timeout: Duration,
    /// Consecutive send failures before ERROR
    pub send_failure_threshold: u32,
}

impl EngineConfig {
    /// Silence after which the heartbeat monitor marks a connection ERROR
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_missed_threshold
    }

    /// Backoff before the attempt following `attempts` failures.
    ///
    /// `base * 2^(attempts - 1)`, capped at the configured maximum.
    pub fn recovery_backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.recovery_backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.recovery_backoff_max)
            .min(self.recovery_backoff_max)
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_addr: config.server.bind,
            ws_path: config.server.ws_path.clone(),
            admin_bind_addr: config.admin.enabled.then_some(config.admin.bind),
            max_connections: config.limits.max_connections,
            max_connections_per_user: config.limits.max_connections_per_user,
            max_message_size: config.limits.max_message_size,
            max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
            outbound_channel_capacity: config.limits.outbound_channel_capacity,
            auth_timeout: config.timeouts.auth,
            idle_timeout: config.timeouts.idle,
            send_timeout: config.timeouts.send,
            heartbeat_interval: config.heartbeat.interval,
            heartbeat_missed_threshold: config.heartbeat.missed_threshold,
            recovery_interval: config.recovery.interval,
            max_recovery_attempts: config.recovery.max_attempts,
            recovery_backoff_base: config.recovery.backoff_base,
            recovery_backoff_max: config.recovery.backoff_max,
            recovery_probe_timeout: config.recovery.probe_timeout,
            send_failure_threshold: config.dispatch.failure_threshold,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}
