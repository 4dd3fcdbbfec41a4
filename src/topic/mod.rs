//! Topics and endpoints
//!
//! Every WebSocket endpoint serves either one topic family or, for the combined
//! endpoint, all of them multiplexed over one connection.

pub mod validation;

pub use validation::{topic_in_family, validate_topic, MAX_TOPIC_LENGTH};

use std::fmt;

use serde::Serialize;

/// Health metric updates
pub const HEALTH_UPDATES: &str = "health_updates";
/// Chat messages
pub const CHAT: &str = "chat";
/// User notifications
pub const NOTIFICATIONS: &str = "notifications";

/// Addressable WebSocket endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// All topics over one connection (`{base}`)
    Combined,
    /// `health_updates` family (`{base}/health`)
    Health,
    /// `chat` family (`{base}/chat`)
    Chat,
    /// `notifications` family (`{base}/notifications`)
    Notifications,
}

impl Endpoint {
    pub const ALL: [Endpoint; 4] = [
        Endpoint::Combined,
        Endpoint::Health,
        Endpoint::Chat,
        Endpoint::Notifications,
    ];

    /// Root topic of the family served, `None` for the combined endpoint
    pub fn root_topic(&self) -> Option<&'static str> {
        match self {
            Endpoint::Combined => None,
            Endpoint::Health => Some(HEALTH_UPDATES),
            Endpoint::Chat => Some(CHAT),
            Endpoint::Notifications => Some(NOTIFICATIONS),
        }
    }

    /// Whether a connection on this endpoint may subscribe to `topic`
    pub fn serves(&self, topic: &str) -> bool {
        match self.root_topic() {
            None => true,
            Some(root) => topic_in_family(topic, root),
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            Endpoint::Combined => "",
            Endpoint::Health => "/health",
            Endpoint::Chat => "/chat",
            Endpoint::Notifications => "/notifications",
        }
    }

    /// Request path of this endpoint under `base`
    pub fn path(&self, base: &str) -> String {
        format!("{}{}", base.trim_end_matches('/'), self.suffix())
    }

    /// Resolve a request path against `base`
    pub fn from_path(path: &str, base: &str) -> Option<Self> {
        let path = path.trim_end_matches('/');
        Self::ALL
            .into_iter()
            .find(|endpoint| endpoint.path(base) == path)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Combined => "combined",
            Endpoint::Health => "health",
            Endpoint::Chat => "chat",
            Endpoint::Notifications => "notifications",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_paths() {
        assert_eq!(Endpoint::Combined.path("/ws"), "/ws");
        assert_eq!(Endpoint::Health.path("/ws/"), "/ws/health");
        assert_eq!(Endpoint::from_path("/ws/chat", "/ws"), Some(Endpoint::Chat));
        assert_eq!(Endpoint::from_path("/ws/", "/ws"), Some(Endpoint::Combined));
        assert_eq!(Endpoint::from_path("/ws/other", "/ws"), None);
        assert_eq!(Endpoint::from_path("/events", "/ws"), None);
    }

    #[test]
    fn test_endpoint_serves_family() {
        assert!(Endpoint::Combined.serves("chat.room1"));
        assert!(Endpoint::Combined.serves(HEALTH_UPDATES));
        assert!(Endpoint::Health.serves(HEALTH_UPDATES));
        assert!(Endpoint::Health.serves("health_updates.heart_rate"));
        assert!(!Endpoint::Health.serves(CHAT));
        assert!(Endpoint::Notifications.serves(NOTIFICATIONS));
        assert!(!Endpoint::Chat.serves(NOTIFICATIONS));
    }
}
