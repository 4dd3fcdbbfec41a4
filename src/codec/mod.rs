//! JSON Envelope Codec
//!
//! Decodes inbound text frames into typed [`InboundEnvelope`]s and serializes
//! outbound envelopes once so they can be shared across every recipient.
//!
//! [`InboundEnvelope`]: crate::protocol::InboundEnvelope

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

/// Default maximum inbound message size (64 KiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
