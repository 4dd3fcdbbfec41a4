//! Close reasons, error causes and error envelope codes

use std::fmt;

use serde::Serialize;

/// Why a connection was closed.
///
/// Each reason maps to a WebSocket close code sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Client closed the transport
    ClientClosed,
    /// Global connection capacity reached at admission
    CapacityExceeded,
    /// No valid `authenticate` envelope within the auth timeout
    AuthTimeout,
    /// Token rejected by the identity verifier
    InvalidToken,
    /// Oldest connection evicted to admit a newer one for the same user
    SessionLimit,
    /// No application traffic and no subscriptions for the idle timeout
    IdleTimeout,
    /// Recovery attempts exhausted
    RecoveryExhausted,
    /// Operator requested disconnect
    ForcedDisconnect,
    /// Server shutting down
    Shutdown,
}

impl CloseReason {
    /// WebSocket close code
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::ClientClosed | CloseReason::IdleTimeout => 1000,
            CloseReason::Shutdown => 1001,
            CloseReason::RecoveryExhausted => 1011,
            CloseReason::CapacityExceeded => 1013,
            CloseReason::InvalidToken => 4001,
            CloseReason::ForcedDisconnect => 4003,
            CloseReason::AuthTimeout => 4008,
            CloseReason::SessionLimit => 4009,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::CapacityExceeded => "capacity_exceeded",
            CloseReason::AuthTimeout => "auth_timeout",
            CloseReason::InvalidToken => "invalid_token",
            CloseReason::SessionLimit => "session_limit",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::RecoveryExhausted => "recovery_exhausted",
            CloseReason::ForcedDisconnect => "forced_disconnect",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cause of a recoverable ERROR state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    /// Silence longer than the missed-heartbeat threshold
    HeartbeatTimeout,
    /// Outbound sends failed past the failure threshold, or the writer failed
    SendFailure,
    /// Unexpected error reading from the transport
    TransportError,
}

impl ErrorCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCause::HeartbeatTimeout => "heartbeat_timeout",
            ErrorCause::SendFailure => "send_failure",
            ErrorCause::TransportError => "transport_error",
        }
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Code carried in an `error` envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationError,
    NotAuthenticated,
    AlreadyAuthenticated,
    InvalidToken,
    TopicNotAllowed,
    TooManySubscriptions,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::NotAuthenticated => "not_authenticated",
            ErrorCode::AlreadyAuthenticated => "already_authenticated",
            ErrorCode::InvalidToken => "invalid_token",
            ErrorCode::TopicNotAllowed => "topic_not_allowed",
            ErrorCode::TooManySubscriptions => "too_many_subscriptions",
        }
    }
}
