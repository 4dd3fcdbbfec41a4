//! Helpers for building registries in unit tests

use std::sync::Arc;

use super::{Outbox, OutboxReceiver, Registry};
use crate::auth::TokenVerifier;
use crate::config::{AuthConfig, EngineConfig, TokenConfig};
use crate::metrics::Metrics;
use crate::protocol::ConnectionId;
use crate::topic::Endpoint;

/// Token accepted for `user` by [`registry_with`]
pub fn token_for(user: &str) -> String {
    format!("tok-{}", user)
}

/// Registry whose verifier accepts `token_for(user)` for each listed user
pub fn registry_with(config: EngineConfig, users: &[&str]) -> Arc<Registry> {
    let tokens = users
        .iter()
        .map(|user| TokenConfig {
            token: token_for(user),
            user_id: user.to_string(),
            roles: vec!["member".to_string()],
            expires_at: None,
            revoked: false,
        })
        .collect();
    let verifier = TokenVerifier::new(&AuthConfig { tokens });
    Arc::new(Registry::new(
        Arc::new(config),
        Arc::new(verifier),
        Arc::new(Metrics::new()),
    ))
}

/// Admit a connection, keeping its receiving half alive
pub fn admit(registry: &Registry, endpoint: Endpoint) -> (ConnectionId, Arc<Outbox>, OutboxReceiver) {
    let (outbox, rx) = Outbox::new(registry.config().outbound_channel_capacity);
    let id = registry
        .admit(endpoint, outbox.clone())
        .expect("admission within capacity");
    (id, outbox, rx)
}

/// Admit and authenticate a connection on the combined endpoint
pub async fn connect_user(
    registry: &Registry,
    user: &str,
) -> (ConnectionId, Arc<Outbox>, OutboxReceiver) {
    let (id, outbox, rx) = admit(registry, Endpoint::Combined);
    registry
        .authenticate(id, &token_for(user))
        .await
        .expect("known token");
    (id, outbox, rx)
}
