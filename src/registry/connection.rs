//! Connection entries and the read-only views handed out by the registry

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashSet;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use super::outbox::Outbox;
use crate::protocol::{ConnectionId, ConnectionState, ErrorCause};
use crate::topic::Endpoint;

/// Registry-owned record of one live connection
pub(crate) struct ConnectionEntry {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub endpoint: Endpoint,
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub subscriptions: AHashSet<String>,
    pub connected_at: DateTime<Utc>,
    /// Any inbound traffic, including pongs
    pub last_activity: Instant,
    /// Inbound application envelopes only
    pub last_message: Instant,
    /// Consecutive failed sends since the last success
    pub retry_count: u32,
    pub recovery_attempts: u32,
    pub error_cause: Option<ErrorCause>,
    pub next_recovery_at: Option<Instant>,
    pub outbox: Arc<Outbox>,
}

impl ConnectionEntry {
    pub fn new(id: ConnectionId, endpoint: Endpoint, outbox: Arc<Outbox>, now: Instant) -> Self {
        Self {
            id,
            state: ConnectionState::Connected,
            endpoint,
            user_id: None,
            roles: Vec::new(),
            subscriptions: AHashSet::new(),
            connected_at: Utc::now(),
            last_activity: now,
            last_message: now,
            retry_count: 0,
            recovery_attempts: 0,
            error_cause: None,
            next_recovery_at: None,
            outbox,
        }
    }

    pub fn health(&self, now: Instant) -> ConnectionHealth {
        let mut subscriptions: Vec<String> = self.subscriptions.iter().cloned().collect();
        subscriptions.sort();

        let idle = now.saturating_duration_since(self.last_activity);
        let last_activity_at = chrono::Duration::from_std(idle)
            .ok()
            .and_then(|elapsed| Utc::now().checked_sub_signed(elapsed))
            .unwrap_or(self.connected_at);

        ConnectionHealth {
            connection_id: self.id,
            state: self.state,
            user_id: self.user_id.clone(),
            roles: self.roles.clone(),
            endpoint: self.endpoint,
            retry_count: self.retry_count,
            recovery_attempts: self.recovery_attempts,
            subscriptions,
            last_activity_at,
            last_activity_secs_ago: idle.as_secs(),
            connected_at: self.connected_at,
            error_cause: self.error_cause,
        }
    }

    pub fn recipient(&self) -> Recipient {
        Recipient {
            id: self.id,
            outbox: self.outbox.clone(),
        }
    }
}

/// A delivery target copied out of the registry
#[derive(Clone)]
pub struct Recipient {
    pub id: ConnectionId,
    pub outbox: Arc<Outbox>,
}

/// Health report for a single connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionHealth {
    pub connection_id: ConnectionId,
    pub state: ConnectionState,
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub endpoint: Endpoint,
    pub retry_count: u32,
    pub recovery_attempts: u32,
    pub subscriptions: Vec<String>,
    /// Wall-clock time of the last inbound traffic
    pub last_activity_at: DateTime<Utc>,
    pub last_activity_secs_ago: u64,
    pub connected_at: DateTime<Utc>,
    pub error_cause: Option<ErrorCause>,
}

/// Aggregate registry view
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub active_connections: usize,
    pub connections_by_state: BTreeMap<String, usize>,
    pub topic_subscribers: BTreeMap<String, usize>,
    pub user_connections: BTreeMap<String, usize>,
}

/// Result of a successful authentication
#[derive(Debug, Clone, PartialEq)]
pub struct AuthOutcome {
    pub user_id: String,
    pub roles: Vec<String>,
    /// Connections of the same user evicted to respect the per-user cap
    pub evicted: Vec<ConnectionId>,
    /// Root topic subscribed automatically for single-family endpoints
    pub auto_subscribed: Option<String>,
}

/// What happened after a failed recovery probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Another attempt is scheduled
    Retry { attempts: u32, next_at: Instant },
    /// Attempts exhausted; the connection was removed
    Exhausted,
    /// Connection is gone or no longer in ERROR
    Skipped,
}
