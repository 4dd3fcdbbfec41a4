//! Dispatcher tests

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;
use crate::codec::Decoder;
use crate::config::EngineConfig;
use crate::protocol::{ConnectionState, ErrorCause};
use crate::registry::testing::{admit, connect_user, registry_with, token_for};
use crate::registry::OutboxReceiver;
use crate::topic::{Endpoint, CHAT, HEALTH_UPDATES};

fn next_json(rx: &mut OutboxReceiver) -> Value {
    match rx.frames.try_recv() {
        Ok(Frame::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

fn envelope(text: &str) -> InboundEnvelope {
    Decoder::new().decode(text).unwrap()
}

#[tokio::test]
async fn test_publish_reaches_subscriber_once() {
    let registry = registry_with(EngineConfig::default(), &["alice", "bob"]);
    let dispatcher = Dispatcher::new(registry.clone());
    let (id, _outbox, mut rx) = connect_user(&registry, "alice").await;
    let (_other, _o2, mut other_rx) = connect_user(&registry, "bob").await;
    registry.subscribe(id, HEALTH_UPDATES).unwrap();

    let report = dispatcher
        .publish(
            HEALTH_UPDATES,
            MessageKind::HealthUpdate,
            json!({"metric": "hr", "value": 75}),
        )
        .await
        .unwrap();

    assert_eq!(
        report,
        PublishReport {
            attempted: 1,
            delivered: 1
        }
    );
    let message = next_json(&mut rx);
    assert_eq!(message["type"], "health_update");
    assert_eq!(message["topic"], HEALTH_UPDATES);
    assert_eq!(message["data"], json!({"metric": "hr", "value": 75}));
    assert!(message["timestamp"].is_string());
    assert!(rx.frames.try_recv().is_err());
    assert!(other_rx.frames.try_recv().is_err());
}

#[tokio::test]
async fn test_publish_without_subscribers() {
    let registry = registry_with(EngineConfig::default(), &[]);
    let dispatcher = Dispatcher::new(registry);
    let report = dispatcher
        .publish(CHAT, MessageKind::ChatMessage, json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(report, PublishReport::default());
}

#[tokio::test]
async fn test_publish_preserves_order_per_subscriber() {
    let registry = registry_with(EngineConfig::default(), &["alice"]);
    let dispatcher = Dispatcher::new(registry.clone());
    let (id, _outbox, mut rx) = connect_user(&registry, "alice").await;
    registry.subscribe(id, CHAT).unwrap();

    for seq in ["m1", "m2", "m3"] {
        dispatcher
            .publish(CHAT, MessageKind::ChatMessage, json!({ "seq": seq }))
            .await
            .unwrap();
    }

    let received: Vec<Value> = (0..3).map(|_| next_json(&mut rx)["data"]["seq"].clone()).collect();
    assert_eq!(received, vec![json!("m1"), json!("m2"), json!("m3")]);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_send_timeouts_move_subscriber_to_error() {
    let registry = registry_with(
        EngineConfig {
            outbound_channel_capacity: 1,
            send_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        },
        &["alice", "bob"],
    );
    let dispatcher = Dispatcher::new(registry.clone());
    let (stuck, stuck_outbox, _stuck_rx) = connect_user(&registry, "alice").await;
    let (healthy, _outbox, mut healthy_rx) = connect_user(&registry, "bob").await;
    registry.subscribe(stuck, HEALTH_UPDATES).unwrap();
    registry.subscribe(healthy, HEALTH_UPDATES).unwrap();

    // Nobody drains the stuck connection, so its queue stays full
    stuck_outbox.try_send(Frame::Ping).unwrap();

    for round in 1..=3 {
        let report = dispatcher
            .publish(HEALTH_UPDATES, MessageKind::HealthUpdate, json!({ "round": round }))
            .await
            .unwrap();
        assert_eq!(
            report,
            PublishReport {
                attempted: 2,
                delivered: 1
            }
        );
        assert_eq!(next_json(&mut healthy_rx)["data"]["round"], json!(round));
    }

    let health = registry.connection_health(stuck).unwrap();
    assert_eq!(health.state, ConnectionState::Error);
    assert_eq!(health.error_cause, Some(ErrorCause::SendFailure));
    assert_eq!(health.retry_count, 3);

    let healthy_state = registry.connection_health(healthy).unwrap();
    assert_eq!(healthy_state.state, ConnectionState::Authenticated);
    assert_eq!(healthy_state.retry_count, 0);

    // ERROR connections are skipped by later publishes
    let report = dispatcher
        .publish(HEALTH_UPDATES, MessageKind::HealthUpdate, json!({ "round": 4 }))
        .await
        .unwrap();
    assert_eq!(report.attempted, 1);
}

#[tokio::test]
async fn test_broadcast_user_reaches_every_connection() {
    let registry = registry_with(EngineConfig::default(), &["alice", "bob"]);
    let dispatcher = Dispatcher::new(registry.clone());
    let (_a1, _o1, mut rx1) = connect_user(&registry, "alice").await;
    let (_a2, _o2, mut rx2) = connect_user(&registry, "alice").await;
    let (_b, _o3, mut bob_rx) = connect_user(&registry, "bob").await;

    let report = dispatcher
        .broadcast_user("alice", MessageKind::Notification, json!({"title": "Lab results ready"}))
        .await
        .unwrap();

    assert_eq!(report.delivered, 2);
    for rx in [&mut rx1, &mut rx2] {
        let message = next_json(rx);
        assert_eq!(message["type"], "notification");
        assert!(message.get("topic").is_none());
    }
    assert!(bob_rx.frames.try_recv().is_err());
}

#[tokio::test]
async fn test_route_authenticate_success() {
    let registry = registry_with(EngineConfig::default(), &["alice"]);
    let dispatcher = Dispatcher::new(registry.clone());
    let mut events = dispatcher.subscribe_events();
    let (id, _outbox, mut rx) = admit(&registry, Endpoint::Combined);

    let route = dispatcher
        .route(
            id,
            envelope(&format!(
                r#"{{"type":"authenticate","data":{{"token":"{}"}},"correlation_id":"c-1"}}"#,
                token_for("alice")
            )),
        )
        .await;

    assert_eq!(route, Route::Continue);
    assert_eq!(registry.state(id), Some(ConnectionState::Authenticated));
    let reply = next_json(&mut rx);
    assert_eq!(reply["type"], "authenticated");
    assert_eq!(reply["data"]["user_id"], "alice");
    assert_eq!(reply["data"]["connection_id"], json!(id.as_u64()));
    assert_eq!(reply["correlation_id"], "c-1");
    assert_eq!(
        events.try_recv().unwrap(),
        EngineEvent::Authenticated {
            connection_id: id,
            user_id: "alice".to_string()
        }
    );
}

#[tokio::test]
async fn test_route_authenticate_on_topic_endpoint_confirms_subscription() {
    let registry = registry_with(EngineConfig::default(), &["alice"]);
    let dispatcher = Dispatcher::new(registry.clone());
    let (id, _outbox, mut rx) = admit(&registry, Endpoint::Notifications);

    dispatcher
        .route(
            id,
            envelope(r#"{"type":"authenticate","data":{"token":"tok-alice"}}"#),
        )
        .await;

    assert_eq!(next_json(&mut rx)["type"], "authenticated");
    let subscribed = next_json(&mut rx);
    assert_eq!(subscribed["type"], "subscribed");
    assert_eq!(subscribed["data"]["topic"], "notifications");
}

#[tokio::test]
async fn test_route_invalid_token_requests_close() {
    let registry = registry_with(EngineConfig::default(), &["alice"]);
    let dispatcher = Dispatcher::new(registry.clone());
    let (id, _outbox, mut rx) = admit(&registry, Endpoint::Combined);

    let route = dispatcher
        .route(
            id,
            envelope(r#"{"type":"authenticate","data":{"token":"forged"}}"#),
        )
        .await;

    assert_eq!(route, Route::Close(CloseReason::InvalidToken));
    let reply = next_json(&mut rx);
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["data"]["code"], "invalid_token");
}

#[tokio::test]
async fn test_route_subscribe_and_unsubscribe() {
    let registry = registry_with(EngineConfig::default(), &["alice"]);
    let dispatcher = Dispatcher::new(registry.clone());
    let (id, _outbox, mut rx) = admit(&registry, Endpoint::Combined);

    dispatcher
        .route(id, envelope(r#"{"type":"subscribe","data":{"topic":"chat"}}"#))
        .await;
    assert_eq!(next_json(&mut rx)["data"]["code"], "not_authenticated");

    dispatcher
        .route(
            id,
            envelope(r#"{"type":"authenticate","data":{"token":"tok-alice"}}"#),
        )
        .await;
    next_json(&mut rx);

    dispatcher
        .route(
            id,
            envelope(r#"{"type":"subscribe","data":{"topic":"chat"},"correlation_id":"s-1"}"#),
        )
        .await;
    let reply = next_json(&mut rx);
    assert_eq!(reply["type"], "subscribed");
    assert_eq!(reply["correlation_id"], "s-1");
    assert_eq!(registry.subscribers(CHAT).len(), 1);

    dispatcher
        .route(id, envelope(r#"{"type":"unsubscribe","data":{"topic":"chat"}}"#))
        .await;
    assert_eq!(next_json(&mut rx)["type"], "unsubscribed");
    assert!(registry.subscribers(CHAT).is_empty());
}

#[tokio::test]
async fn test_route_topic_not_allowed_keeps_connection() {
    let registry = registry_with(EngineConfig::default(), &["alice"]);
    let dispatcher = Dispatcher::new(registry.clone());
    let (id, _outbox, mut rx) = admit(&registry, Endpoint::Health);
    registry.authenticate(id, "tok-alice").await.unwrap();

    let route = dispatcher
        .route(id, envelope(r#"{"type":"subscribe","data":{"topic":"chat"}}"#))
        .await;

    assert_eq!(route, Route::Continue);
    assert_eq!(next_json(&mut rx)["data"]["code"], "topic_not_allowed");
    assert_eq!(registry.state(id), Some(ConnectionState::Authenticated));
}

#[tokio::test]
async fn test_route_heartbeat_and_unknown() {
    let registry = registry_with(EngineConfig::default(), &[]);
    let dispatcher = Dispatcher::new(registry.clone());
    let (id, _outbox, mut rx) = admit(&registry, Endpoint::Combined);

    dispatcher
        .route(id, envelope(r#"{"type":"heartbeat","data":{},"correlation_id":"h"}"#))
        .await;
    let ack = next_json(&mut rx);
    assert_eq!(ack["type"], "heartbeat_ack");
    assert_eq!(ack["correlation_id"], "h");

    let route = dispatcher
        .route(id, envelope(r#"{"type":"teleport","data":{}}"#))
        .await;
    assert_eq!(route, Route::Continue);
    let error = next_json(&mut rx);
    assert_eq!(error["data"]["code"], "validation_error");
    assert_eq!(registry.state(id), Some(ConnectionState::Connected));
}

#[tokio::test]
async fn test_route_client_payload_emits_event() {
    let registry = registry_with(EngineConfig::default(), &["alice"]);
    let dispatcher = Dispatcher::new(registry.clone());
    let (id, _outbox, mut rx) = connect_user(&registry, "alice").await;
    let mut events = dispatcher.subscribe_events();

    dispatcher
        .route(
            id,
            envelope(
                r#"{"type":"chat_message","data":{"room":"r1","text":"hello"},"correlation_id":"m-9"}"#,
            ),
        )
        .await;

    let ack = next_json(&mut rx);
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["data"]["type"], "chat_message");
    assert_eq!(
        events.try_recv().unwrap(),
        EngineEvent::ClientMessage {
            connection_id: id,
            user_id: "alice".to_string(),
            kind: MessageKind::ChatMessage,
            data: json!({"room": "r1", "text": "hello"}),
            correlation_id: Some("m-9".to_string()),
        }
    );
}

#[tokio::test]
async fn test_reject_reports_validation_error() {
    let registry = registry_with(EngineConfig::default(), &[]);
    let dispatcher = Dispatcher::new(registry.clone());
    let (id, _outbox, mut rx) = admit(&registry, Endpoint::Combined);

    let err = Decoder::new().decode("{not json").unwrap_err();
    dispatcher.reject(id, &err).await;

    let reply = next_json(&mut rx);
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["data"]["code"], "validation_error");
    assert_eq!(registry.state(id), Some(ConnectionState::Connected));
}

#[tokio::test]
async fn test_successful_reply_resets_failure_count() {
    let registry = registry_with(EngineConfig::default(), &["alice"]);
    let dispatcher = Dispatcher::new(registry.clone());
    let (id, _outbox, mut rx) = connect_user(&registry, "alice").await;
    registry.record_send_failure(id);
    registry.record_send_failure(id);
    assert_eq!(registry.connection_health(id).unwrap().retry_count, 2);

    let route = dispatcher
        .route(id, envelope(r#"{"type":"heartbeat","data":{}}"#))
        .await;

    assert_eq!(route, Route::Continue);
    assert_eq!(next_json(&mut rx)["type"], "heartbeat_ack");
    assert_eq!(registry.connection_health(id).unwrap().retry_count, 0);
}
