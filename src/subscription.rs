//! Subscription index.
//!
//! Thread-safe mapping from topic URI to the set of connections subscribed
//! to it. Readers take snapshots; the publish fan-out iterates a snapshot
//! without holding the lock.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::connection::ConnectionId;

/// Mapping from topic URI to subscribed connection IDs.
///
/// Topics are keyed by the plain URI. Applications needing per-user
/// namespacing compose it into the URI themselves.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    topics: RwLock<HashMap<String, HashSet<ConnectionId>>>,
}

impl SubscriptionIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the connections subscribed to a topic.
    ///
    /// The returned list is independent of the index and safe to iterate
    /// while the index is concurrently mutated.
    #[must_use]
    pub fn find(&self, uri: &str) -> Vec<ConnectionId> {
        self.topics
            .read()
            .get(uri)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Subscribes a connection to a topic.
    pub fn add(&self, uri: &str, id: ConnectionId) {
        self.topics
            .write()
            .entry(uri.to_string())
            .or_default()
            .insert(id);
    }

    /// Unsubscribes a connection from a topic. Idempotent.
    pub fn remove(&self, uri: &str, id: ConnectionId) {
        let mut topics = self.topics.write();
        if let Some(ids) = topics.get_mut(uri) {
            ids.remove(&id);
            if ids.is_empty() {
                topics.remove(uri);
            }
        }
    }

    /// Returns true if the connection is subscribed to the topic.
    #[must_use]
    pub fn contains(&self, uri: &str, id: ConnectionId) -> bool {
        self.topics.read().get(uri).is_some_and(|ids| ids.contains(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_find() {
        let index = SubscriptionIndex::new();
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();

        index.add("news", a);
        index.add("news", b);
        index.add("sports", a);

        let mut subscribers = index.find("news");
        subscribers.sort_unstable();
        let mut expected = vec![a, b];
        expected.sort_unstable();
        assert_eq!(subscribers, expected);
        assert_eq!(index.find("sports"), vec![a]);
    }

    #[test]
    fn test_find_unknown_topic_is_empty() {
        let index = SubscriptionIndex::new();
        assert!(index.find("nowhere").is_empty());
    }

    #[test]
    fn test_add_is_idempotent() {
        let index = SubscriptionIndex::new();
        let a = ConnectionId::generate();

        index.add("news", a);
        index.add("news", a);
        assert_eq!(index.find("news").len(), 1);
    }

    #[test]
    fn test_remove() {
        let index = SubscriptionIndex::new();
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();

        index.add("news", a);
        index.add("news", b);
        index.remove("news", a);

        assert_eq!(index.find("news"), vec![b]);
        assert!(!index.contains("news", a));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let index = SubscriptionIndex::new();
        let a = ConnectionId::generate();

        index.remove("news", a);
        index.add("news", a);
        index.remove("news", a);
        index.remove("news", a);

        assert!(index.find("news").is_empty());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let index = SubscriptionIndex::new();
        let a = ConnectionId::generate();

        index.add("news", a);
        let snapshot = index.find("news");
        index.remove("news", a);

        assert_eq!(snapshot, vec![a]);
        assert!(index.find("news").is_empty());
    }
}
