//! Codec error types

use std::fmt;

/// Errors that can occur while decoding or encoding an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame exceeds the configured maximum message size
    MessageTooLarge { size: usize, max: usize },
    /// Not valid JSON, or not a JSON object
    InvalidJson(String),
    /// Required field missing
    MissingField(&'static str),
    /// Field present with the wrong shape
    InvalidField(&'static str),
    /// Timestamp is not ISO-8601
    InvalidTimestamp(String),
    /// Topic name rejected by validation
    InvalidTopic(&'static str),
    /// Serialization of an outbound envelope failed
    Encode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageTooLarge { size, max } => {
                write!(f, "message of {} bytes exceeds maximum of {} bytes", size, max)
            }
            Self::InvalidJson(e) => write!(f, "invalid JSON envelope: {}", e),
            Self::MissingField(name) => write!(f, "missing field: {}", name),
            Self::InvalidField(name) => write!(f, "invalid field: {}", name),
            Self::InvalidTimestamp(ts) => write!(f, "invalid timestamp: {}", ts),
            Self::InvalidTopic(msg) => write!(f, "invalid topic: {}", msg),
            Self::Encode(e) => write!(f, "encode error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::InvalidJson(e.to_string())
    }
}
