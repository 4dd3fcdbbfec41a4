//! Inbound envelope decoder

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::DEFAULT_MAX_MESSAGE_SIZE;
use crate::protocol::{CodecError, InboundEnvelope, InboundMessage, MessageKind};
use crate::topic::validate_topic;

/// Envelope decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum accepted frame size in bytes
    max_message_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Decode one text frame
    pub fn decode(&self, text: &str) -> Result<InboundEnvelope, CodecError> {
        if text.len() > self.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size: text.len(),
                max: self.max_message_size,
            });
        }

        let value: Value = serde_json::from_str(text)?;
        let Value::Object(envelope) = value else {
            return Err(CodecError::InvalidJson(
                "envelope must be a JSON object".to_string(),
            ));
        };

        let kind = match envelope.get("type") {
            Some(Value::String(kind)) => kind.as_str(),
            Some(_) => return Err(CodecError::InvalidField("type")),
            None => return Err(CodecError::MissingField("type")),
        };

        let data = envelope.get("data").cloned().unwrap_or(Value::Null);
        let timestamp = decode_timestamp(&envelope)?;
        let correlation_id = match envelope.get("correlation_id") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id.clone()),
            Some(_) => return Err(CodecError::InvalidField("correlation_id")),
        };

        let message = match kind {
            "authenticate" => InboundMessage::Authenticate {
                token: string_field(&data, "token")?,
            },
            "subscribe" => InboundMessage::Subscribe {
                topic: topic_field(&data)?,
            },
            "unsubscribe" => InboundMessage::Unsubscribe {
                topic: topic_field(&data)?,
            },
            "heartbeat" => InboundMessage::Heartbeat,
            other => match MessageKind::from_type(other) {
                Some(kind) => InboundMessage::Payload { kind, data },
                None => InboundMessage::Unknown(other.to_string()),
            },
        };

        Ok(InboundEnvelope {
            message,
            timestamp,
            correlation_id,
        })
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_timestamp(envelope: &Map<String, Value>) -> Result<Option<DateTime<Utc>>, CodecError> {
    match envelope.get("timestamp") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(ts)) => DateTime::parse_from_rfc3339(ts)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| CodecError::InvalidTimestamp(ts.clone())),
        Some(_) => Err(CodecError::InvalidField("timestamp")),
    }
}

fn string_field(data: &Value, name: &'static str) -> Result<String, CodecError> {
    match data.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(CodecError::InvalidField(name)),
        None => Err(CodecError::MissingField(name)),
    }
}

fn topic_field(data: &Value) -> Result<String, CodecError> {
    let topic = string_field(data, "topic")?;
    validate_topic(&topic).map_err(CodecError::InvalidTopic)?;
    Ok(topic)
}
