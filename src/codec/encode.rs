//! Outbound envelope encoder

use std::sync::Arc;

use crate::protocol::{CodecError, OutboundMessage};

/// Envelope encoder
///
/// Produces a shared `Arc<str>` so one serialization can be handed to every
/// subscriber of a publish.
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(&self, message: &OutboundMessage) -> Result<Arc<str>, CodecError> {
        serde_json::to_string(message)
            .map(Arc::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }
}
