use pretty_assertions::assert_eq;

use super::*;
use crate::config::EngineConfig;
use crate::monitor::RecoveryEngine;
use crate::protocol::{ConnectionState, ErrorCause};
use crate::registry::testing::connect_user;
use crate::registry::testing::registry_with;
use crate::topic::CHAT;

fn management(registry: &Arc<Registry>) -> (Management, RecoveryEngine) {
    let (engine, handle) = RecoveryEngine::new(registry.clone());
    (Management::new(registry.clone(), handle), engine)
}

#[tokio::test]
async fn test_status_reports_counts() {
    let registry = registry_with(EngineConfig::default(), &["alice", "bob"]);
    let (management, _engine) = management(&registry);
    let (a, _o1, _rx1) = connect_user(&registry, "alice").await;
    let (_b, _o2, _rx2) = connect_user(&registry, "bob").await;
    registry.subscribe(a, CHAT).unwrap();

    let status = management.status();
    assert_eq!(status.active_connections, 2);
    assert_eq!(status.topic_subscribers.get(CHAT), Some(&1));
    assert_eq!(status.user_connections.get("alice"), Some(&1));
    assert_eq!(
        status.connections_by_state.get("authenticated"),
        Some(&2)
    );
}

#[tokio::test]
async fn test_connection_health() {
    let registry = registry_with(EngineConfig::default(), &["alice"]);
    let (management, _engine) = management(&registry);
    let (id, _outbox, _rx) = connect_user(&registry, "alice").await;
    registry.subscribe(id, CHAT).unwrap();

    let health = management.connection_health(id).unwrap();
    assert_eq!(health.connection_id, id);
    assert_eq!(health.state, ConnectionState::Authenticated);
    assert_eq!(health.user_id.as_deref(), Some("alice"));
    assert_eq!(health.subscriptions, vec![CHAT.to_string()]);
    assert_eq!(health.retry_count, 0);
    assert_eq!(health.error_cause, None);

    assert!(management
        .connection_health(ConnectionId::new(999))
        .is_none());
}

#[tokio::test]
async fn test_force_disconnect() {
    let registry = registry_with(EngineConfig::default(), &["alice"]);
    let (management, _engine) = management(&registry);
    let (id, outbox, _rx) = connect_user(&registry, "alice").await;
    registry.subscribe(id, CHAT).unwrap();

    assert!(management.force_disconnect(id));
    assert!(!registry.contains(id));
    assert!(registry.subscribers(CHAT).is_empty());
    assert_eq!(outbox.close_reason(), Some(CloseReason::ForcedDisconnect));

    // Already gone
    assert!(!management.force_disconnect(id));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_user_expedites_error_connections() {
    let registry = registry_with(EngineConfig::default(), &["alice", "bob"]);
    let (management, _engine) = management(&registry);
    let (a1, _o1, _rx1) = connect_user(&registry, "alice").await;
    let (_a2, _o2, _rx2) = connect_user(&registry, "alice").await;
    let (b, _o3, _rx3) = connect_user(&registry, "bob").await;
    registry.mark_error(a1, ErrorCause::SendFailure);
    registry.mark_error(b, ErrorCause::SendFailure);
    registry.recovery_failed(a1);

    let due: Vec<_> = registry
        .recovery_candidates(tokio::time::Instant::now())
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(due, vec![b]);

    assert_eq!(management.reconnect_user("alice"), 1);
    let mut due: Vec<_> = registry
        .recovery_candidates(tokio::time::Instant::now())
        .iter()
        .map(|r| r.id)
        .collect();
    due.sort();
    assert_eq!(due, vec![a1, b]);

    assert_eq!(management.reconnect_user("nobody"), 0);
}
