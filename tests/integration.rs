//! Integration Tests for PulseHub
//!
//! These tests run the real server and drive it with WebSocket clients and
//! raw HTTP/1.1 requests against the management surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use pulsehub::config::{AuthConfig, EngineConfig, TokenConfig};
use pulsehub::dispatch::{Dispatcher, EngineEvent};
use pulsehub::protocol::MessageKind;
use pulsehub::{Server, ShutdownHandle, TokenVerifier};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Test configuration helper
fn test_config() -> EngineConfig {
    EngineConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        admin_bind_addr: None,
        ..EngineConfig::default()
    }
}

fn verifier(users: &[&str]) -> TokenVerifier {
    let tokens = users
        .iter()
        .map(|user| TokenConfig {
            token: format!("tok-{}", user),
            user_id: user.to_string(),
            roles: vec!["member".to_string()],
            expires_at: None,
            revoked: false,
        })
        .collect();
    TokenVerifier::new(&AuthConfig { tokens })
}

struct TestServer {
    addr: SocketAddr,
    admin_addr: Option<SocketAddr>,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownHandle,
    task: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    async fn start(config: EngineConfig) -> Self {
        let server = Server::bind(config, Arc::new(verifier(&["alice", "bob"])))
            .await
            .expect("Failed to bind server");
        Self {
            addr: server.local_addr().expect("local addr"),
            admin_addr: server.admin_addr(),
            dispatcher: server.dispatcher(),
            shutdown: server.shutdown_handle(),
            task: tokio::spawn(server.run()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    async fn stop(self) {
        self.shutdown.shutdown();
        let result = timeout(RECV_TIMEOUT, self.task)
            .await
            .expect("server did not stop")
            .expect("server task panicked");
        assert!(result.is_ok());
    }
}

/// Helper struct for WebSocket client operations in tests
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn connect(url: &str) -> Self {
        let (ws, _) = connect_async(url).await.expect("Failed to connect");
        Self { ws }
    }

    async fn send(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .expect("Failed to send");
    }

    /// Next JSON envelope, skipping transport heartbeats
    async fn recv(&mut self) -> Value {
        loop {
            let message = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a message")
                .expect("stream ended")
                .expect("read failed");
            match message {
                Message::Text(text) => return serde_json::from_str(&text).expect("valid JSON"),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("Expected a text frame, got {:?}", other),
            }
        }
    }

    /// Close code sent by the server, skipping anything queued before it
    async fn recv_close(&mut self) -> Option<u16> {
        loop {
            let next = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for close");
            match next {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    async fn authenticate(&mut self, user: &str) -> Value {
        self.send(json!({
            "type": "authenticate",
            "data": { "token": format!("tok-{}", user) }
        }))
        .await;
        let reply = self.recv().await;
        assert_eq!(reply["type"], "authenticated", "reply: {}", reply);
        reply
    }

    async fn subscribe(&mut self, topic: &str) {
        self.send(json!({ "type": "subscribe", "data": { "topic": topic } }))
            .await;
        let reply = self.recv().await;
        assert_eq!(reply["type"], "subscribed");
        assert_eq!(reply["data"]["topic"], topic);
    }
}

/// Send one HTTP/1.1 request and return the status code and body
async fn http_request(addr: SocketAddr, method: &str, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.expect("Failed to connect");
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        method, path, addr
    );
    stream
        .write_all(request.as_bytes())
        .await
        .expect("Failed to write");

    let mut raw = Vec::new();
    timeout(RECV_TIMEOUT, stream.read_to_end(&mut raw))
        .await
        .expect("timed out reading response")
        .expect("Failed to read");
    let raw = String::from_utf8(raw).expect("UTF-8 response");

    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status line");
    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn test_authenticate() {
    let server = TestServer::start(test_config()).await;
    let mut client = TestClient::connect(&server.url("/ws")).await;

    let reply = client.authenticate("alice").await;
    assert_eq!(reply["data"]["user_id"], "alice");
    assert_eq!(reply["data"]["roles"], json!(["member"]));
    assert!(reply["data"]["connection_id"].as_u64().is_some());
    assert!(reply["timestamp"].is_string());

    server.stop().await;
}

#[tokio::test]
async fn test_publish_reaches_subscriber_once() {
    let server = TestServer::start(test_config()).await;
    let mut subscriber = TestClient::connect(&server.url("/ws")).await;
    let mut bystander = TestClient::connect(&server.url("/ws")).await;
    subscriber.authenticate("alice").await;
    bystander.authenticate("bob").await;
    subscriber.subscribe("health_updates").await;

    let report = server
        .dispatcher
        .publish(
            "health_updates",
            MessageKind::HealthUpdate,
            json!({ "metric": "hr", "value": 75 }),
        )
        .await
        .unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.delivered, 1);

    let message = subscriber.recv().await;
    assert_eq!(message["type"], "health_update");
    assert_eq!(message["topic"], "health_updates");
    assert_eq!(message["data"], json!({ "metric": "hr", "value": 75 }));

    // Nothing else is queued for the subscriber, and nothing for the bystander
    subscriber
        .send(json!({ "type": "heartbeat", "data": {} }))
        .await;
    assert_eq!(subscriber.recv().await["type"], "heartbeat_ack");
    bystander
        .send(json!({ "type": "heartbeat", "data": {}, "correlation_id": "hb-1" }))
        .await;
    let ack = bystander.recv().await;
    assert_eq!(ack["type"], "heartbeat_ack");
    assert_eq!(ack["correlation_id"], "hb-1");

    server.stop().await;
}

#[tokio::test]
async fn test_per_topic_endpoint_auto_subscribes() {
    let server = TestServer::start(test_config()).await;
    let mut client = TestClient::connect(&server.url("/ws/chat")).await;
    client.authenticate("alice").await;
    let confirmation = client.recv().await;
    assert_eq!(confirmation["type"], "subscribed");
    assert_eq!(confirmation["data"]["topic"], "chat");

    client
        .send(json!({ "type": "subscribe", "data": { "topic": "notifications" } }))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["data"]["code"], "topic_not_allowed");

    server
        .dispatcher
        .publish("chat.room1", MessageKind::ChatMessage, json!({ "text": "hi" }))
        .await
        .unwrap();
    let report = server
        .dispatcher
        .publish("chat", MessageKind::ChatMessage, json!({ "text": "hello" }))
        .await
        .unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(client.recv().await["data"]["text"], "hello");

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_path_refused() {
    let server = TestServer::start(test_config()).await;
    assert!(connect_async(server.url("/other")).await.is_err());
    assert!(connect_async(server.url("/ws/unknown")).await.is_err());
    server.stop().await;
}

#[tokio::test]
async fn test_invalid_token_closes_connection() {
    let server = TestServer::start(test_config()).await;
    let mut client = TestClient::connect(&server.url("/ws")).await;

    client
        .send(json!({ "type": "authenticate", "data": { "token": "nope" } }))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["data"]["code"], "invalid_token");
    assert_eq!(client.recv_close().await, Some(4001));

    server.stop().await;
}

#[tokio::test]
async fn test_requests_before_authentication_rejected() {
    let server = TestServer::start(test_config()).await;
    let mut client = TestClient::connect(&server.url("/ws")).await;

    client
        .send(json!({ "type": "subscribe", "data": { "topic": "chat" } }))
        .await;
    assert_eq!(client.recv().await["data"]["code"], "not_authenticated");

    client.send(json!({ "type": "teleport" })).await;
    assert_eq!(client.recv().await["data"]["code"], "validation_error");

    client
        .ws
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();
    assert_eq!(client.recv().await["data"]["code"], "validation_error");

    // Still usable after the errors
    client.authenticate("alice").await;

    server.stop().await;
}

#[tokio::test]
async fn test_capacity_exceeded_closes_new_connection() {
    let server = TestServer::start(EngineConfig {
        max_connections: 1,
        ..test_config()
    })
    .await;
    let mut first = TestClient::connect(&server.url("/ws")).await;
    first.authenticate("alice").await;

    let mut second = TestClient::connect(&server.url("/ws")).await;
    assert_eq!(second.recv_close().await, Some(1013));

    // The admitted connection is unaffected
    first.send(json!({ "type": "heartbeat" })).await;
    assert_eq!(first.recv().await["type"], "heartbeat_ack");

    server.stop().await;
}

#[tokio::test]
async fn test_per_user_cap_evicts_oldest() {
    let server = TestServer::start(EngineConfig {
        max_connections_per_user: 2,
        ..test_config()
    })
    .await;
    let mut oldest = TestClient::connect(&server.url("/ws")).await;
    oldest.authenticate("alice").await;
    let mut middle = TestClient::connect(&server.url("/ws")).await;
    middle.authenticate("alice").await;

    let mut newest = TestClient::connect(&server.url("/ws")).await;
    newest.authenticate("alice").await;

    assert_eq!(oldest.recv_close().await, Some(4009));
    middle.send(json!({ "type": "heartbeat" })).await;
    assert_eq!(middle.recv().await["type"], "heartbeat_ack");
    newest.send(json!({ "type": "heartbeat" })).await;
    assert_eq!(newest.recv().await["type"], "heartbeat_ack");

    server.stop().await;
}

#[tokio::test]
async fn test_auth_timeout_closes_connection() {
    let server = TestServer::start(EngineConfig {
        auth_timeout: Duration::from_millis(300),
        ..test_config()
    })
    .await;
    let mut client = TestClient::connect(&server.url("/ws")).await;

    assert_eq!(client.recv_close().await, Some(4008));

    server.stop().await;
}

#[tokio::test]
async fn test_idle_timeout_closes_unsubscribed_connection() {
    let server = TestServer::start(EngineConfig {
        idle_timeout: Duration::from_millis(300),
        ..test_config()
    })
    .await;
    let mut client = TestClient::connect(&server.url("/ws")).await;
    client.authenticate("alice").await;

    assert_eq!(client.recv_close().await, Some(1000));

    server.stop().await;
}

#[tokio::test]
async fn test_subscribed_connection_outlives_idle_timeout() {
    let server = TestServer::start(EngineConfig {
        idle_timeout: Duration::from_millis(300),
        ..test_config()
    })
    .await;
    let mut client = TestClient::connect(&server.url("/ws")).await;
    client.authenticate("alice").await;
    client.subscribe("chat").await;

    tokio::time::sleep(Duration::from_millis(900)).await;

    client.send(json!({ "type": "heartbeat" })).await;
    assert_eq!(client.recv().await["type"], "heartbeat_ack");

    server.stop().await;
}

#[tokio::test]
async fn test_client_messages_become_events() {
    let server = TestServer::start(test_config()).await;
    let mut events = server.dispatcher.subscribe_events();

    let mut client = TestClient::connect(&server.url("/ws")).await;
    client.authenticate("alice").await;
    match timeout(RECV_TIMEOUT, events.recv()).await.unwrap().unwrap() {
        EngineEvent::Authenticated { user_id, .. } => assert_eq!(user_id, "alice"),
        other => panic!("unexpected event {:?}", other),
    }

    client
        .send(json!({
            "type": "chat_message",
            "data": { "text": "hello" },
            "correlation_id": "c-1"
        }))
        .await;
    let ack = client.recv().await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["correlation_id"], "c-1");

    match timeout(RECV_TIMEOUT, events.recv()).await.unwrap().unwrap() {
        EngineEvent::ClientMessage {
            user_id,
            kind,
            data,
            correlation_id,
            ..
        } => {
            assert_eq!(user_id, "alice");
            assert_eq!(kind, MessageKind::ChatMessage);
            assert_eq!(data, json!({ "text": "hello" }));
            assert_eq!(correlation_id.as_deref(), Some("c-1"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let server = TestServer::start(test_config()).await;
    let mut client = TestClient::connect(&server.url("/ws")).await;
    client.authenticate("alice").await;

    server.stop().await;
    assert_eq!(client.recv_close().await, Some(1001));
}

#[tokio::test]
async fn test_management_endpoints() {
    let server = TestServer::start(EngineConfig {
        admin_bind_addr: Some(SocketAddr::from(([127, 0, 0, 1], 0))),
        ..test_config()
    })
    .await;
    let admin = server.admin_addr.expect("management server enabled");

    let mut client = TestClient::connect(&server.url("/ws")).await;
    let reply = client.authenticate("alice").await;
    let id = reply["data"]["connection_id"].as_u64().unwrap();
    client.subscribe("notifications").await;

    let (status, body) = http_request(admin, "GET", "/status").await;
    assert_eq!(status, 200);
    let snapshot: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(snapshot["active_connections"], 1);
    assert_eq!(snapshot["topic_subscribers"]["notifications"], 1);
    assert_eq!(snapshot["user_connections"]["alice"], 1);

    let (status, body) = http_request(admin, "GET", &format!("/connection/{}/health", id)).await;
    assert_eq!(status, 200);
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["state"], "authenticated");
    assert_eq!(health["user_id"], "alice");
    assert_eq!(health["subscriptions"], json!(["notifications"]));

    let (status, _) = http_request(admin, "GET", "/connection/abc/health").await;
    assert_eq!(status, 400);
    let (status, _) = http_request(admin, "GET", "/connection/999999/health").await;
    assert_eq!(status, 404);

    let (status, body) = http_request(admin, "POST", "/user/alice/reconnect").await;
    assert_eq!(status, 200);
    let reconnect: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(reconnect["scheduled"], 0);

    let (status, body) = http_request(admin, "GET", "/metrics").await;
    assert_eq!(status, 200);
    assert!(body.contains("pulsehub_connections_total"));
    // High-water mark of live connections, not the configured capacity
    assert!(body.contains("pulsehub_connections_maximum 1"));

    let (status, _) = http_request(admin, "GET", "/healthz").await;
    assert_eq!(status, 200);

    let (status, _) = http_request(admin, "DELETE", &format!("/connection/{}", id)).await;
    assert_eq!(status, 200);
    assert_eq!(client.recv_close().await, Some(4003));
    let (status, _) = http_request(admin, "DELETE", &format!("/connection/{}", id)).await;
    assert_eq!(status, 404);

    server.stop().await;
}
