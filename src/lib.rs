//! PulseHub - real-time WebSocket connection and subscription engine
//!
//! Accepts authenticated WebSocket connections, tracks their topic
//! subscriptions, fans published health updates, chat messages and
//! notifications out to live subscribers, and keeps connections healthy with
//! heartbeats and bounded recovery.

pub mod admin;
pub mod auth;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod metrics;
pub mod monitor;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod topic;
pub mod transport;

pub use admin::{AdminServer, Management};
pub use auth::{AuthError, IdentityVerifier, TokenVerifier, UserIdentity};
pub use config::{Config, EngineConfig};
pub use dispatch::{Dispatcher, EngineEvent, PublishReport};
pub use metrics::Metrics;
pub use protocol::{CloseReason, ConnectionId, ConnectionState, MessageKind};
pub use registry::Registry;
pub use server::{Server, ShutdownHandle};
pub use topic::Endpoint;
