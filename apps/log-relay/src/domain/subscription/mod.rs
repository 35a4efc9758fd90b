//! Subscription Tracking
//!
//! Tracks which source each client is subscribed to and how many clients
//! share each source.
//!
//! # Design
//!
//! - A client holds at most one subscription; subscribing again replaces it
//! - Each source keeps the set of its subscribers
//! - A source with no subscribers is dropped from the table
//!
//! Removing a subscription reports the source that just lost its last
//! subscriber, whose tailer must then stop.

use std::collections::{HashMap, HashSet};

use crate::domain::source::SourceId;

/// Unique identifier for a connected client.
pub type ClientId = u64;

// =============================================================================
// Subscription Table
// =============================================================================

/// Client ↔ source subscription table.
///
/// Not synchronized; the broker keeps it under its own state lock.
///
/// # Example
///
/// ```rust
/// use log_relay::domain::source::SourceId;
/// use log_relay::domain::subscription::SubscriptionTable;
///
/// let mut table = SubscriptionTable::default();
/// let seven = SourceId::parse("7").unwrap();
///
/// table.subscribe(1, seven.clone());
/// table.subscribe(2, seven.clone());
/// assert_eq!(table.subscriber_count(&seven), 2);
///
/// // Last subscriber leaves - the tailer must stop
/// assert_eq!(table.unsubscribe(1), None);
/// assert_eq!(table.unsubscribe(2), Some(seven));
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    client_source: HashMap<ClientId, SourceId>,
    source_clients: HashMap<SourceId, HashSet<ClientId>>,
}

impl SubscriptionTable {
    /// Subscribe `client` to `source`, replacing any previous subscription.
    ///
    /// Returns the previous source if the client was its last subscriber.
    pub fn subscribe(&mut self, client: ClientId, source: SourceId) -> Option<SourceId> {
        if self.client_source.get(&client) == Some(&source) {
            return None;
        }

        let abandoned = self.unsubscribe(client);

        self.client_source.insert(client, source.clone());
        self.source_clients.entry(source).or_default().insert(client);

        abandoned
    }

    /// Remove the subscription held by `client`, if any.
    ///
    /// Returns the source if the client was its last subscriber.
    pub fn unsubscribe(&mut self, client: ClientId) -> Option<SourceId> {
        let source = self.client_source.remove(&client)?;

        let subscribers = self.source_clients.get_mut(&source)?;
        subscribers.remove(&client);
        if subscribers.is_empty() {
            self.source_clients.remove(&source);
            return Some(source);
        }
        None
    }

    /// Drop every subscription to `source`, returning the affected clients.
    pub fn remove_source(&mut self, source: &SourceId) -> Vec<ClientId> {
        let clients: Vec<_> = self
            .source_clients
            .remove(source)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for client in &clients {
            self.client_source.remove(client);
        }

        clients
    }

    /// Get the source a client is subscribed to.
    #[must_use]
    pub fn source_of(&self, client: ClientId) -> Option<&SourceId> {
        self.client_source.get(&client)
    }

    /// Get the subscribers of a source.
    #[must_use]
    pub fn subscribers(&self, source: &SourceId) -> Vec<ClientId> {
        self.source_clients
            .get(source)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of subscribers of a source.
    #[must_use]
    pub fn subscriber_count(&self, source: &SourceId) -> usize {
        self.source_clients.get(source).map_or(0, HashSet::len)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> SourceId {
        SourceId::parse(raw).unwrap()
    }

    #[test]
    fn second_subscriber_shares_source() {
        let mut table = SubscriptionTable::default();

        assert_eq!(table.subscribe(1, id("1")), None);
        assert_eq!(table.subscribe(2, id("1")), None);

        assert_eq!(table.subscriber_count(&id("1")), 2);
    }

    #[test]
    fn resubscribe_replaces_previous_subscription() {
        let mut table = SubscriptionTable::default();
        table.subscribe(1, id("1"));

        let abandoned = table.subscribe(1, id("2"));

        assert_eq!(abandoned, Some(id("1")));
        assert_eq!(table.source_of(1), Some(&id("2")));
        assert!(table.subscribers(&id("1")).is_empty());
    }

    #[test]
    fn resubscribe_keeps_shared_source_alive() {
        let mut table = SubscriptionTable::default();
        table.subscribe(1, id("1"));
        table.subscribe(2, id("1"));

        assert_eq!(table.subscribe(1, id("2")), None);
        assert_eq!(table.subscribers(&id("1")), vec![2]);
    }

    #[test]
    fn resubscribe_same_source_is_noop() {
        let mut table = SubscriptionTable::default();
        table.subscribe(1, id("1"));

        assert_eq!(table.subscribe(1, id("1")), None);
        assert_eq!(table.subscriber_count(&id("1")), 1);
    }

    #[test]
    fn last_unsubscribe_stops_source() {
        let mut table = SubscriptionTable::default();
        table.subscribe(1, id("1"));
        table.subscribe(2, id("1"));

        assert_eq!(table.unsubscribe(1), None);
        assert_eq!(table.unsubscribe(2), Some(id("1")));
        assert_eq!(table.subscriber_count(&id("1")), 0);
    }

    #[test]
    fn unsubscribe_unknown_client_no_changes() {
        let mut table = SubscriptionTable::default();
        table.subscribe(1, id("1"));

        assert_eq!(table.unsubscribe(99), None);
        assert_eq!(table.subscriber_count(&id("1")), 1);
    }

    #[test]
    fn remove_source_drops_all_subscribers() {
        let mut table = SubscriptionTable::default();
        table.subscribe(1, id("1"));
        table.subscribe(2, id("1"));
        table.subscribe(3, id("2"));

        let mut removed = table.remove_source(&id("1"));
        removed.sort_unstable();

        assert_eq!(removed, vec![1, 2]);
        assert!(table.source_of(1).is_none());
        assert_eq!(table.source_of(3), Some(&id("2")));
        assert_eq!(table.subscriber_count(&id("2")), 1);
    }
}
