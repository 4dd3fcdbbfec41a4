//! Connection Registry
//!
//! Owns every live connection, the per-user connection index and the topic
//! subscription index. One mutex guards all three so every state transition,
//! eviction and removal is atomic with respect to subscriber snapshots. No
//! lock is held across I/O: callers receive copies ([`Recipient`],
//! [`ConnectionHealth`], [`RegistrySnapshot`]) and send outside the lock.

mod connection;
mod outbox;
mod subscriptions;

pub use connection::{
    AuthOutcome, ConnectionHealth, Recipient, RecoveryOutcome, RegistrySnapshot,
};
pub use outbox::{Frame, Outbox, OutboxReceiver, SendError};
pub use subscriptions::SubscriptionIndex;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use connection::ConnectionEntry;

use crate::auth::{AuthError, IdentityVerifier};
use crate::config::EngineConfig;
use crate::metrics::Metrics;
use crate::protocol::{CloseReason, ConnectionId, ConnectionState, ErrorCause, ErrorCode};
use crate::topic::{validate_topic, Endpoint};

#[cfg(test)]
pub(crate) mod testing;

/// Registry operation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Global connection capacity reached
    CapacityExceeded,
    /// Identity verification failed
    InvalidToken(AuthError),
    /// Connection is already bound to a user
    AlreadyAuthenticated,
    /// Operation requires an authenticated connection
    NotAuthenticated,
    /// Unknown connection id
    NotFound,
    /// Topic name failed validation
    InvalidTopic(&'static str),
    /// Endpoint does not serve the topic family
    TopicNotAllowed,
    /// Per-connection subscription limit reached
    TooManySubscriptions,
}

impl RegistryError {
    /// Code for the error envelope sent back to the client
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RegistryError::InvalidToken(_) => ErrorCode::InvalidToken,
            RegistryError::AlreadyAuthenticated => ErrorCode::AlreadyAuthenticated,
            RegistryError::NotAuthenticated | RegistryError::NotFound => {
                ErrorCode::NotAuthenticated
            }
            RegistryError::TopicNotAllowed => ErrorCode::TopicNotAllowed,
            RegistryError::TooManySubscriptions => ErrorCode::TooManySubscriptions,
            RegistryError::CapacityExceeded | RegistryError::InvalidTopic(_) => {
                ErrorCode::ValidationError
            }
        }
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::CapacityExceeded => write!(f, "connection capacity exceeded"),
            RegistryError::InvalidToken(e) => write!(f, "invalid token: {}", e),
            RegistryError::AlreadyAuthenticated => write!(f, "connection already authenticated"),
            RegistryError::NotAuthenticated => write!(f, "connection not authenticated"),
            RegistryError::NotFound => write!(f, "connection not found"),
            RegistryError::InvalidTopic(msg) => write!(f, "invalid topic: {}", msg),
            RegistryError::TopicNotAllowed => write!(f, "topic not served by this endpoint"),
            RegistryError::TooManySubscriptions => write!(f, "subscription limit reached"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<AuthError> for RegistryError {
    fn from(e: AuthError) -> Self {
        RegistryError::InvalidToken(e)
    }
}

#[derive(Default)]
struct Inner {
    connections: AHashMap<ConnectionId, ConnectionEntry>,
    /// user_id -> bound connection ids, ordered by admission
    users: AHashMap<String, BTreeSet<ConnectionId>>,
    topics: SubscriptionIndex,
}

/// Connection registry
pub struct Registry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    config: Arc<EngineConfig>,
    verifier: Arc<dyn IdentityVerifier>,
    metrics: Arc<Metrics>,
}

impl Registry {
    pub fn new(
        config: Arc<EngineConfig>,
        verifier: Arc<dyn IdentityVerifier>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
            config,
            verifier,
            metrics,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Admit a freshly handshaken connection in the CONNECTED state.
    ///
    /// Fails without creating an entry when the global capacity is reached.
    pub fn admit(
        &self,
        endpoint: Endpoint,
        outbox: Arc<Outbox>,
    ) -> Result<ConnectionId, RegistryError> {
        let mut inner = self.inner.lock();
        if inner.connections.len() >= self.config.max_connections {
            self.metrics
                .connection_rejected(CloseReason::CapacityExceeded.as_str());
            warn!(
                "Connection refused: capacity of {} reached",
                self.config.max_connections
            );
            return Err(RegistryError::CapacityExceeded);
        }

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        inner
            .connections
            .insert(id, ConnectionEntry::new(id, endpoint, outbox, Instant::now()));
        self.metrics.connection_admitted(endpoint.as_str());
        debug!("Connection {} admitted on {} endpoint", id, endpoint);
        Ok(id)
    }

    /// Verify `token` and bind the connection to the resulting identity.
    ///
    /// If the user is at the per-user cap, their oldest connections are evicted
    /// in the same critical section as the promotion.
    pub async fn authenticate(
        &self,
        id: ConnectionId,
        token: &str,
    ) -> Result<AuthOutcome, RegistryError> {
        self.ensure_unauthenticated(id)?;

        let identity = match self.verifier.verify(token).await {
            Ok(identity) => identity,
            Err(e) => {
                self.metrics.authentication_failed();
                warn!("Connection {} failed authentication: {}", id, e);
                return Err(RegistryError::InvalidToken(e));
            }
        };

        let mut inner = self.inner.lock();
        // Re-check: the connection may have closed or authenticated while the
        // verifier was running
        let endpoint = match inner.connections.get(&id) {
            None => return Err(RegistryError::NotFound),
            Some(entry) if entry.state != ConnectionState::Connected => {
                return Err(RegistryError::AlreadyAuthenticated)
            }
            Some(entry) => entry.endpoint,
        };

        let cap = self.config.max_connections_per_user;
        let mut evicted = Vec::new();
        loop {
            let oldest = match inner.users.get(&identity.user_id) {
                Some(ids) if ids.len() >= cap => ids.first().copied(),
                _ => None,
            };
            let Some(oldest) = oldest else { break };
            self.remove_locked(&mut inner, oldest, CloseReason::SessionLimit);
            self.metrics.evicted();
            warn!(
                "Evicted connection {} of user {}: per-user limit of {} reached",
                oldest, identity.user_id, cap
            );
            evicted.push(oldest);
        }

        inner
            .users
            .entry(identity.user_id.clone())
            .or_default()
            .insert(id);

        let now = Instant::now();
        if let Some(entry) = inner.connections.get_mut(&id) {
            entry.state = ConnectionState::Authenticated;
            entry.user_id = Some(identity.user_id.clone());
            entry.roles = identity.roles.clone();
            entry.last_activity = now;
            entry.last_message = now;
        }

        let auto_subscribed = endpoint.root_topic().map(|root| {
            self.subscribe_locked(&mut inner, id, root);
            root.to_string()
        });

        self.metrics.authenticated();
        debug!("Connection {} authenticated as {}", id, identity.user_id);

        Ok(AuthOutcome {
            user_id: identity.user_id,
            roles: identity.roles,
            evicted,
            auto_subscribed,
        })
    }

    fn ensure_unauthenticated(&self, id: ConnectionId) -> Result<(), RegistryError> {
        let inner = self.inner.lock();
        match inner.connections.get(&id) {
            None => Err(RegistryError::NotFound),
            Some(entry) if entry.state == ConnectionState::Connected => Ok(()),
            Some(_) => Err(RegistryError::AlreadyAuthenticated),
        }
    }

    /// Record inbound transport activity (any frame, including pongs)
    pub fn touch(&self, id: ConnectionId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.connections.get_mut(&id) {
            entry.last_activity = Instant::now();
            entry.outbox.notify_activity();
        }
    }

    /// Record an inbound application envelope
    pub fn touch_message(&self, id: ConnectionId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.connections.get_mut(&id) {
            let now = Instant::now();
            entry.last_activity = now;
            entry.last_message = now;
            entry.outbox.notify_activity();
        }
    }

    /// Move an AUTHENTICATED connection to ERROR.
    ///
    /// Returns whether the connection is in ERROR after the call. Connections
    /// that never authenticated have nothing to recover and return false.
    pub fn mark_error(&self, id: ConnectionId, cause: ErrorCause) -> bool {
        let mut inner = self.inner.lock();
        match inner.connections.get_mut(&id) {
            Some(entry) => self.enter_error(entry, cause),
            None => false,
        }
    }

    fn enter_error(&self, entry: &mut ConnectionEntry, cause: ErrorCause) -> bool {
        match entry.state {
            ConnectionState::Error => true,
            ConnectionState::Authenticated => {
                entry.state = ConnectionState::Error;
                entry.error_cause = Some(cause);
                entry.recovery_attempts = 0;
                entry.next_recovery_at = Some(Instant::now());
                self.metrics.entered_error(cause.as_str());
                warn!("Connection {} entered ERROR: {}", entry.id, cause);
                true
            }
            _ => false,
        }
    }

    /// Remove a connection and all of its memberships, closing its transport.
    ///
    /// Returns false if the connection was already gone.
    pub fn remove(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let mut inner = self.inner.lock();
        self.remove_locked(&mut inner, id, reason)
    }

    fn remove_locked(&self, inner: &mut Inner, id: ConnectionId, reason: CloseReason) -> bool {
        let Some(entry) = inner.connections.remove(&id) else {
            return false;
        };

        if let Some(user_id) = &entry.user_id {
            if let Some(ids) = inner.users.get_mut(user_id) {
                ids.remove(&id);
                if ids.is_empty() {
                    inner.users.remove(user_id);
                }
            }
        }

        for topic in &entry.subscriptions {
            inner.topics.remove(topic, id);
        }

        if entry.state == ConnectionState::Error {
            self.metrics.left_error();
        }
        self.metrics.subscriptions_dropped(entry.subscriptions.len());
        self.metrics
            .connection_removed(entry.endpoint.as_str(), reason.as_str());

        entry.outbox.close(reason);
        debug!("Connection {} removed: {}", id, reason);
        true
    }

    /// Remove every connection; used at shutdown
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let mut inner = self.inner.lock();
        let ids: Vec<ConnectionId> = inner.connections.keys().copied().collect();
        for id in &ids {
            self.remove_locked(&mut inner, *id, reason);
        }
        ids.len()
    }

    /// Subscribe a connection to a topic; idempotent.
    ///
    /// Returns false if the membership already existed.
    pub fn subscribe(&self, id: ConnectionId, topic: &str) -> Result<bool, RegistryError> {
        validate_topic(topic).map_err(RegistryError::InvalidTopic)?;

        let mut inner = self.inner.lock();
        let entry = inner
            .connections
            .get(&id)
            .ok_or(RegistryError::NotFound)?;
        if entry.state != ConnectionState::Authenticated {
            return Err(RegistryError::NotAuthenticated);
        }
        if !entry.endpoint.serves(topic) {
            return Err(RegistryError::TopicNotAllowed);
        }
        if entry.subscriptions.contains(topic) {
            return Ok(false);
        }
        if entry.subscriptions.len() >= self.config.max_subscriptions_per_connection {
            return Err(RegistryError::TooManySubscriptions);
        }

        Ok(self.subscribe_locked(&mut inner, id, topic))
    }

    fn subscribe_locked(&self, inner: &mut Inner, id: ConnectionId, topic: &str) -> bool {
        let Some(entry) = inner.connections.get_mut(&id) else {
            return false;
        };
        if !entry.subscriptions.insert(topic.to_string()) {
            return false;
        }
        inner.topics.insert(topic, id);
        self.metrics.subscription_added();
        debug!("Connection {} subscribed to {}", id, topic);
        true
    }

    /// Unsubscribe a connection from a topic.
    ///
    /// Returns false if the connection was not subscribed.
    pub fn unsubscribe(&self, id: ConnectionId, topic: &str) -> Result<bool, RegistryError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::NotFound)?;
        if entry.state != ConnectionState::Authenticated {
            return Err(RegistryError::NotAuthenticated);
        }
        if !entry.subscriptions.remove(topic) {
            return Ok(false);
        }
        inner.topics.remove(topic, id);
        self.metrics.subscription_removed();
        debug!("Connection {} unsubscribed from {}", id, topic);
        Ok(true)
    }

    /// AUTHENTICATED subscribers of `topic`, copied out of the lock
    pub fn subscribers(&self, topic: &str) -> Vec<Recipient> {
        let inner = self.inner.lock();
        let mut recipients: Vec<Recipient> = inner
            .topics
            .members(topic)
            .filter_map(|id| inner.connections.get(&id))
            .filter(|entry| entry.state == ConnectionState::Authenticated)
            .map(ConnectionEntry::recipient)
            .collect();
        recipients.sort_by_key(|r| r.id);
        recipients
    }

    /// AUTHENTICATED connections of a user, in admission order
    pub fn user_recipients(&self, user_id: &str) -> Vec<Recipient> {
        let inner = self.inner.lock();
        let Some(ids) = inner.users.get(user_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| inner.connections.get(id))
            .filter(|entry| entry.state == ConnectionState::Authenticated)
            .map(ConnectionEntry::recipient)
            .collect()
    }

    /// Outbox of a connection in any live state
    pub fn recipient(&self, id: ConnectionId) -> Option<Recipient> {
        self.inner
            .lock()
            .connections
            .get(&id)
            .map(ConnectionEntry::recipient)
    }

    /// Reset the consecutive failure counter after a successful send
    pub fn record_send_success(&self, id: ConnectionId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.connections.get_mut(&id) {
            entry.retry_count = 0;
        }
    }

    /// Count a failed send; returns whether it moved the connection to ERROR
    pub fn record_send_failure(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.connections.get_mut(&id) else {
            return false;
        };
        entry.retry_count = entry.retry_count.saturating_add(1);
        if entry.retry_count >= self.config.send_failure_threshold
            && entry.state == ConnectionState::Authenticated
        {
            return self.enter_error(entry, ErrorCause::SendFailure);
        }
        false
    }

    /// AUTHENTICATED connections to probe with a heartbeat ping
    pub fn heartbeat_targets(&self) -> Vec<Recipient> {
        let inner = self.inner.lock();
        let mut targets: Vec<Recipient> = inner
            .connections
            .values()
            .filter(|entry| entry.state == ConnectionState::Authenticated)
            .map(ConnectionEntry::recipient)
            .collect();
        targets.sort_by_key(|r| r.id);
        targets
    }

    /// Move AUTHENTICATED connections silent for longer than `timeout` to
    /// ERROR(HeartbeatTimeout); returns the affected ids
    pub fn mark_silent(&self, now: Instant, timeout: std::time::Duration) -> Vec<ConnectionId> {
        let mut inner = self.inner.lock();
        let mut marked = Vec::new();
        for entry in inner.connections.values_mut() {
            if entry.state == ConnectionState::Authenticated
                && now.saturating_duration_since(entry.last_activity) > timeout
                && self.enter_error(entry, ErrorCause::HeartbeatTimeout)
            {
                marked.push(entry.id);
            }
        }
        marked.sort();
        marked
    }

    /// ERROR connections whose next recovery attempt is due
    pub fn recovery_candidates(&self, now: Instant) -> Vec<Recipient> {
        let inner = self.inner.lock();
        let max = self.config.max_recovery_attempts;
        let mut candidates: Vec<Recipient> = inner
            .connections
            .values()
            .filter(|entry| {
                entry.state == ConnectionState::Error
                    && entry.recovery_attempts < max
                    && entry.next_recovery_at.is_some_and(|at| at <= now)
            })
            .map(ConnectionEntry::recipient)
            .collect();
        candidates.sort_by_key(|r| r.id);
        candidates
    }

    /// Restore a recovered connection to AUTHENTICATED, keeping subscriptions
    pub fn recovery_succeeded(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.connections.get_mut(&id) else {
            return false;
        };
        if entry.state != ConnectionState::Error {
            return false;
        }
        entry.state = ConnectionState::Authenticated;
        entry.recovery_attempts = 0;
        entry.retry_count = 0;
        entry.error_cause = None;
        entry.next_recovery_at = None;
        self.metrics.left_error();
        self.metrics.recovery_succeeded();
        info!("Connection {} recovered", id);
        true
    }

    /// Count a failed recovery attempt, scheduling the next one with backoff
    /// or removing the connection once attempts are exhausted
    pub fn recovery_failed(&self, id: ConnectionId) -> RecoveryOutcome {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.connections.get_mut(&id) else {
            return RecoveryOutcome::Skipped;
        };
        if entry.state != ConnectionState::Error {
            return RecoveryOutcome::Skipped;
        }

        entry.recovery_attempts += 1;
        let attempts = entry.recovery_attempts;
        if attempts >= self.config.max_recovery_attempts {
            self.remove_locked(&mut inner, id, CloseReason::RecoveryExhausted);
            self.metrics.recovery_exhausted();
            warn!(
                "Connection {} removed after {} failed recovery attempts",
                id, attempts
            );
            return RecoveryOutcome::Exhausted;
        }

        let next_at = Instant::now() + self.config.recovery_backoff(attempts);
        entry.next_recovery_at = Some(next_at);
        debug!("Connection {} recovery attempt {} failed", id, attempts);
        RecoveryOutcome::Retry { attempts, next_at }
    }

    /// Make a user's ERROR connections due for recovery immediately
    pub fn expedite_recovery(&self, user_id: &str) -> usize {
        let mut inner = self.inner.lock();
        let Inner {
            connections, users, ..
        } = &mut *inner;
        let Some(ids) = users.get(user_id) else {
            return 0;
        };

        let now = Instant::now();
        let mut expedited = 0;
        for id in ids {
            if let Some(entry) = connections.get_mut(id) {
                if entry.state == ConnectionState::Error {
                    entry.next_recovery_at = Some(now);
                    expedited += 1;
                }
            }
        }
        expedited
    }

    /// When the connection becomes idle if nothing else arrives.
    ///
    /// `None` while it holds subscriptions, or if it is gone.
    pub fn idle_deadline(&self, id: ConnectionId) -> Option<Instant> {
        self.inner
            .lock()
            .connections
            .get(&id)
            .filter(|entry| entry.subscriptions.is_empty())
            .map(|entry| entry.last_message + self.config.idle_timeout)
    }

    /// Whether an authenticated connection has had no application traffic for
    /// the idle timeout and holds no subscriptions
    pub fn is_idle(&self, id: ConnectionId, now: Instant) -> bool {
        let inner = self.inner.lock();
        inner.connections.get(&id).is_some_and(|entry| {
            matches!(
                entry.state,
                ConnectionState::Authenticated | ConnectionState::Error
            ) && entry.subscriptions.is_empty()
                && now.saturating_duration_since(entry.last_message) >= self.config.idle_timeout
        })
    }

    /// User bound to an AUTHENTICATED connection
    pub fn authenticated_user(&self, id: ConnectionId) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .connections
            .get(&id)
            .filter(|entry| entry.state == ConnectionState::Authenticated)
            .and_then(|entry| entry.user_id.clone())
    }

    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.inner
            .lock()
            .connections
            .get(&id)
            .map(|entry| entry.state)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.lock().connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live connection ids of a user in admission order
    pub fn user_connections(&self, user_id: &str) -> Vec<ConnectionId> {
        self.inner
            .lock()
            .users
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_health(&self, id: ConnectionId) -> Option<ConnectionHealth> {
        let now = Instant::now();
        self.inner
            .lock()
            .connections
            .get(&id)
            .map(|entry| entry.health(now))
    }

    /// Aggregate counts for the management surface
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.lock();

        let mut connections_by_state = BTreeMap::new();
        for entry in inner.connections.values() {
            *connections_by_state
                .entry(entry.state.as_str().to_string())
                .or_insert(0) += 1;
        }

        RegistrySnapshot {
            active_connections: inner.connections.len(),
            connections_by_state,
            topic_subscribers: inner.topics.counts(),
            user_connections: inner
                .users
                .iter()
                .map(|(user, ids)| (user.clone(), ids.len()))
                .collect(),
        }
    }

    /// Check the cross-index invariants; used by tests
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        let inner = self.inner.lock();

        for (topic, count) in inner.topics.counts() {
            for id in inner.topics.members(&topic) {
                let entry = inner
                    .connections
                    .get(&id)
                    .ok_or_else(|| format!("{} indexed under {} but not live", id, topic))?;
                if !entry.subscriptions.contains(&topic) {
                    return Err(format!("{} indexed under {} without membership", id, topic));
                }
            }
            if count == 0 {
                return Err(format!("empty topic {} retained", topic));
            }
        }

        for entry in inner.connections.values() {
            if !entry.subscriptions.is_empty()
                && !matches!(
                    entry.state,
                    ConnectionState::Authenticated | ConnectionState::Error
                )
            {
                return Err(format!("{} has subscriptions in {}", entry.id, entry.state));
            }
            for topic in &entry.subscriptions {
                if !inner.topics.contains(topic, entry.id) {
                    return Err(format!("{} missing from index for {}", entry.id, topic));
                }
            }
        }

        for (user, ids) in &inner.users {
            if ids.len() > self.config.max_connections_per_user {
                return Err(format!("user {} holds {} connections", user, ids.len()));
            }
            for id in ids {
                let bound = inner
                    .connections
                    .get(id)
                    .and_then(|entry| entry.user_id.as_deref());
                if bound != Some(user.as_str()) {
                    return Err(format!("user index for {} lists stale {}", user, id));
                }
            }
        }

        Ok(())
    }
}
