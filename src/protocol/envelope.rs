//! Message envelopes
//!
//! Inbound envelopes are decoded into a closed set of messages; anything the
//! server does not recognise lands in [`InboundMessage::Unknown`] so the
//! dispatcher can answer with a validation error instead of guessing.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use super::{ConnectionId, ErrorCode};

/// Payload-carrying message types produced by the domain layer or by clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    HealthUpdate,
    ChatMessage,
    Notification,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::HealthUpdate => "health_update",
            MessageKind::ChatMessage => "chat_message",
            MessageKind::Notification => "notification",
        }
    }

    pub fn from_type(s: &str) -> Option<Self> {
        match s {
            "health_update" => Some(MessageKind::HealthUpdate),
            "chat_message" => Some(MessageKind::ChatMessage),
            "notification" => Some(MessageKind::Notification),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded client message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Authenticate { token: String },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Heartbeat,
    Payload { kind: MessageKind, data: Value },
    /// Well-formed envelope with a type the server does not handle
    Unknown(String),
}

impl InboundMessage {
    /// The envelope `type` this message was decoded from
    pub fn type_name(&self) -> &str {
        match self {
            InboundMessage::Authenticate { .. } => "authenticate",
            InboundMessage::Subscribe { .. } => "subscribe",
            InboundMessage::Unsubscribe { .. } => "unsubscribe",
            InboundMessage::Heartbeat => "heartbeat",
            InboundMessage::Payload { kind, .. } => kind.as_str(),
            InboundMessage::Unknown(kind) => kind,
        }
    }
}

/// A decoded envelope: the message plus its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub message: InboundMessage,
    pub timestamp: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
}

/// Server-to-client envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl OutboundMessage {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            topic: None,
            data,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Echo a request's correlation id on the reply
    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Domain payload delivered to topic subscribers
    pub fn payload(kind: MessageKind, topic: Option<&str>, data: Value) -> Self {
        let mut msg = Self::new(kind.as_str(), data);
        msg.topic = topic.map(str::to_string);
        msg
    }

    pub fn authenticated(id: ConnectionId, user_id: &str, roles: &[String]) -> Self {
        Self::new(
            "authenticated",
            json!({ "connection_id": id, "user_id": user_id, "roles": roles }),
        )
    }

    pub fn subscribed(topic: &str) -> Self {
        Self::new("subscribed", json!({ "topic": topic }))
    }

    pub fn unsubscribed(topic: &str) -> Self {
        Self::new("unsubscribed", json!({ "topic": topic }))
    }

    pub fn heartbeat_ack() -> Self {
        Self::new("heartbeat_ack", json!({}))
    }

    /// Acknowledges a client payload message
    pub fn ack(kind: MessageKind) -> Self {
        Self::new("ack", json!({ "type": kind.as_str() }))
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            "error",
            json!({ "code": code.as_str(), "message": message.into() }),
        )
    }
}
