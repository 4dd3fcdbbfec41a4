//! Message Dispatcher
//!
//! Routes inbound client envelopes to the registry and fans published
//! messages out to live subscribers. A published message is serialized once
//! and the same buffer is queued on every recipient's outbox concurrently,
//! each send bounded by the send timeout. Failed sends are only counted; there
//! is no inline retry.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::codec::Encoder;
use crate::protocol::{
    CloseReason, CodecError, ConnectionId, ErrorCode, InboundEnvelope, InboundMessage,
    MessageKind, OutboundMessage,
};
use crate::registry::{Frame, Recipient, Registry, RegistryError};

#[cfg(test)]
mod tests;

/// Capacity of the engine event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Aggregate result of a publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Recipients the message was handed to
    pub attempted: usize,
    /// Recipients whose outbox accepted the message in time
    pub delivered: usize,
}

/// Events emitted for backend consumers
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A connection authenticated
    Authenticated {
        connection_id: ConnectionId,
        user_id: String,
    },
    /// An authenticated client sent a payload message
    ClientMessage {
        connection_id: ConnectionId,
        user_id: String,
        kind: MessageKind,
        data: Value,
        correlation_id: Option<String>,
    },
}

/// What the connection should do after an inbound message was routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Continue,
    Close(CloseReason),
}

/// Message dispatcher
pub struct Dispatcher {
    registry: Arc<Registry>,
    encoder: Encoder,
    events: broadcast::Sender<EngineEvent>,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let send_timeout = registry.config().send_timeout;
        Self {
            registry,
            encoder: Encoder::new(),
            events,
            send_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Subscribe to engine events
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Publish a message to every AUTHENTICATED subscriber of `topic`
    pub async fn publish(
        &self,
        topic: &str,
        kind: MessageKind,
        data: Value,
    ) -> Result<PublishReport, CodecError> {
        let text = self
            .encoder
            .encode(&OutboundMessage::payload(kind, Some(topic), data))?;
        let recipients = self.registry.subscribers(topic);
        let report = self.deliver(recipients, text).await;
        debug!(
            "Published {} to {}: {}/{} delivered",
            kind.as_str(),
            topic,
            report.delivered,
            report.attempted
        );
        Ok(report)
    }

    /// Deliver a message to every AUTHENTICATED connection of one user
    pub async fn broadcast_user(
        &self,
        user_id: &str,
        kind: MessageKind,
        data: Value,
    ) -> Result<PublishReport, CodecError> {
        let text = self
            .encoder
            .encode(&OutboundMessage::payload(kind, None, data))?;
        let recipients = self.registry.user_recipients(user_id);
        Ok(self.deliver(recipients, text).await)
    }

    async fn deliver(&self, recipients: Vec<Recipient>, text: Arc<str>) -> PublishReport {
        let attempted = recipients.len();
        let sends = recipients.into_iter().map(|recipient| {
            let text = text.clone();
            async move {
                match recipient
                    .outbox
                    .send(Frame::Text(text), self.send_timeout)
                    .await
                {
                    Ok(()) => {
                        self.registry.record_send_success(recipient.id);
                        true
                    }
                    Err(e) => {
                        debug!("Send to connection {} failed: {}", recipient.id, e);
                        if self.registry.record_send_failure(recipient.id) {
                            warn!(
                                "Connection {} moved to ERROR after repeated send failures",
                                recipient.id
                            );
                        }
                        false
                    }
                }
            }
        });

        let delivered = join_all(sends).await.into_iter().filter(|ok| *ok).count();
        self.registry.metrics().published(attempted, delivered);
        PublishReport {
            attempted,
            delivered,
        }
    }

    /// Route a decoded inbound envelope from connection `id`
    pub async fn route(&self, id: ConnectionId, envelope: InboundEnvelope) -> Route {
        self.registry.touch_message(id);
        let correlation_id = envelope.correlation_id;

        match envelope.message {
            InboundMessage::Authenticate { token } => {
                match self.registry.authenticate(id, &token).await {
                    Ok(outcome) => {
                        self.reply(
                            id,
                            OutboundMessage::authenticated(id, &outcome.user_id, &outcome.roles)
                                .with_correlation(correlation_id),
                        )
                        .await;
                        if let Some(topic) = &outcome.auto_subscribed {
                            self.reply(id, OutboundMessage::subscribed(topic)).await;
                        }
                        let _ = self.events.send(EngineEvent::Authenticated {
                            connection_id: id,
                            user_id: outcome.user_id,
                        });
                        Route::Continue
                    }
                    Err(RegistryError::InvalidToken(_)) => {
                        self.reply(
                            id,
                            OutboundMessage::error(ErrorCode::InvalidToken, "authentication failed")
                                .with_correlation(correlation_id),
                        )
                        .await;
                        Route::Close(CloseReason::InvalidToken)
                    }
                    Err(e) => {
                        self.reply_error(id, &e, correlation_id).await;
                        Route::Continue
                    }
                }
            }
            InboundMessage::Subscribe { topic } => {
                match self.registry.subscribe(id, &topic) {
                    Ok(_) => {
                        self.reply(
                            id,
                            OutboundMessage::subscribed(&topic).with_correlation(correlation_id),
                        )
                        .await
                    }
                    Err(e) => self.reply_error(id, &e, correlation_id).await,
                }
                Route::Continue
            }
            InboundMessage::Unsubscribe { topic } => {
                match self.registry.unsubscribe(id, &topic) {
                    Ok(_) => {
                        self.reply(
                            id,
                            OutboundMessage::unsubscribed(&topic).with_correlation(correlation_id),
                        )
                        .await
                    }
                    Err(e) => self.reply_error(id, &e, correlation_id).await,
                }
                Route::Continue
            }
            InboundMessage::Heartbeat => {
                self.reply(
                    id,
                    OutboundMessage::heartbeat_ack().with_correlation(correlation_id),
                )
                .await;
                Route::Continue
            }
            InboundMessage::Payload { kind, data } => {
                let Some(user_id) = self.registry.authenticated_user(id) else {
                    self.reply_error(id, &RegistryError::NotAuthenticated, correlation_id)
                        .await;
                    return Route::Continue;
                };
                let _ = self.events.send(EngineEvent::ClientMessage {
                    connection_id: id,
                    user_id,
                    kind,
                    data,
                    correlation_id: correlation_id.clone(),
                });
                self.reply(id, OutboundMessage::ack(kind).with_correlation(correlation_id))
                    .await;
                Route::Continue
            }
            InboundMessage::Unknown(kind) => {
                self.reply(
                    id,
                    OutboundMessage::error(
                        ErrorCode::ValidationError,
                        format!("unknown message type '{}'", kind),
                    )
                    .with_correlation(correlation_id),
                )
                .await;
                Route::Continue
            }
        }
    }

    /// Answer an envelope that failed to decode; connection state is unchanged
    pub async fn reject(&self, id: ConnectionId, err: &CodecError) {
        self.reply(
            id,
            OutboundMessage::error(ErrorCode::ValidationError, err.to_string()),
        )
        .await;
    }

    async fn reply_error(
        &self,
        id: ConnectionId,
        err: &RegistryError,
        correlation_id: Option<String>,
    ) {
        self.reply(
            id,
            OutboundMessage::error(err.error_code(), err.to_string())
                .with_correlation(correlation_id),
        )
        .await;
    }

    async fn reply(&self, id: ConnectionId, message: OutboundMessage) {
        let Some(recipient) = self.registry.recipient(id) else {
            return;
        };
        let text = match self.encoder.encode(&message) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode {} reply: {}", message.kind, e);
                return;
            }
        };
        match recipient
            .outbox
            .send(Frame::Text(text), self.send_timeout)
            .await
        {
            Ok(()) => self.registry.record_send_success(id),
            Err(e) => {
                debug!("Reply to connection {} failed: {}", id, e);
                self.registry.record_send_failure(id);
            }
        }
    }
}
