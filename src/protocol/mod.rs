//! Wire protocol definitions and core types
//!
//! Defines the identifiers, connection states and message envelopes shared by
//! the codec, the registry and the dispatcher.

mod envelope;
mod error;
mod reason;

pub use envelope::{InboundEnvelope, InboundMessage, MessageKind, OutboundMessage};
pub use error::CodecError;
pub use reason::{CloseReason, ErrorCause, ErrorCode};

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Process-unique connection identifier.
///
/// Assigned from a monotonic counter at admission time and never reused within
/// a process, so ordering by id is ordering by admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(ConnectionId)
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Transport handshake in progress, not yet admitted
    Connecting,
    /// Admitted, waiting for an `authenticate` envelope
    Connected,
    /// Bound to a user identity and eligible for delivery
    Authenticated,
    /// Failing; owned by the recovery engine until restored or removed
    Error,
    /// Terminal
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Error => "error",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
