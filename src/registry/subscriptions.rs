//! Topic to connection index
//!
//! Only the topic side lives here; each connection entry keeps its own topic
//! set. Both sides are mutated under the registry lock.

use std::collections::BTreeMap;

use ahash::{AHashMap, AHashSet};

use crate::protocol::ConnectionId;

#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    topics: AHashMap<String, AHashSet<ConnectionId>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a membership; returns false if it already existed
    pub fn insert(&mut self, topic: &str, id: ConnectionId) -> bool {
        match self.topics.get_mut(topic) {
            Some(members) => members.insert(id),
            None => {
                let mut members = AHashSet::new();
                members.insert(id);
                self.topics.insert(topic.to_string(), members);
                true
            }
        }
    }

    /// Remove a membership, dropping the topic once empty
    pub fn remove(&mut self, topic: &str, id: ConnectionId) -> bool {
        let Some(members) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = members.remove(&id);
        if members.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Connection ids subscribed to `topic`
    pub fn members(&self, topic: &str) -> impl Iterator<Item = ConnectionId> + '_ {
        self.topics
            .get(topic)
            .into_iter()
            .flat_map(|members| members.iter().copied())
    }

    pub fn contains(&self, topic: &str, id: ConnectionId) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|members| members.contains(&id))
    }

    /// Whether `id` appears under any topic
    pub fn references(&self, id: ConnectionId) -> bool {
        self.topics.values().any(|members| members.contains(&id))
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Subscriber count per topic
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.topics
            .iter()
            .map(|(topic, members)| (topic.clone(), members.len()))
            .collect()
    }
}
