//! The broker-wide table of retained messages.
use crate::{publication::ApplicationMessage, topic};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

struct RetainedMessage {
    message: ApplicationMessage,
    stored_at: Instant,
}

impl RetainedMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.message
            .message_expiry_interval()
            .map_or(false, |interval| {
                now.saturating_duration_since(self.stored_at) >= Duration::from_secs(interval as u64)
            })
    }
}

/// How a retained publication changed the table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetainedChange {
    Added,
    Replaced,
    Removed,

    /// An empty payload was published to a topic without a retained message.
    Unchanged,
}

/// Retained messages keyed by their exact topic.
#[derive(Default)]
pub struct RetainedMessageStore {
    messages: RwLock<HashMap<String, RetainedMessage>>,
}

impl RetainedMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a retained publication. An empty payload removes the entry of the topic.
    pub fn update(&self, message: &ApplicationMessage) -> RetainedChange {
        let mut messages = self.messages.write();

        if message.payload.is_empty() {
            return match messages.remove(&message.topic) {
                Some(_) => RetainedChange::Removed,
                None => RetainedChange::Unchanged,
            };
        }

        let mut stored = message.clone();
        stored.retain = true;
        let previous = messages.insert(
            message.topic.clone(),
            RetainedMessage {
                message: stored,
                stored_at: Instant::now(),
            },
        );

        match previous {
            Some(_) => RetainedChange::Replaced,
            None => RetainedChange::Added,
        }
    }

    /// The retained messages whose topic matches a filter.
    pub fn matching(&self, filter: &str) -> Vec<ApplicationMessage> {
        let now = Instant::now();
        self.messages
            .read()
            .iter()
            .filter(|(topic, retained)| topic::matches(topic, filter) && !retained.is_expired(now))
            .map(|(_, retained)| retained.message.clone())
            .collect()
    }

    /// Every stored retained message.
    pub fn all(&self) -> Vec<ApplicationMessage> {
        let now = Instant::now();
        self.messages
            .read()
            .values()
            .filter(|retained| !retained.is_expired(now))
            .map(|retained| retained.message.clone())
            .collect()
    }

    /// Replace the table contents, e.g. with messages loaded from storage.
    pub fn load(&self, messages: Vec<ApplicationMessage>) {
        let now = Instant::now();
        let mut table = self.messages.write();
        table.clear();
        for mut message in messages.into_iter().filter(|m| !m.payload.is_empty()) {
            message.retain = true;
            table.insert(
                message.topic.clone(),
                RetainedMessage {
                    message,
                    stored_at: now,
                },
            );
        }
    }

    pub fn clear(&self) {
        self.messages.write().clear();
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::Property;

    #[test]
    fn empty_payload_removes() {
        let store = RetainedMessageStore::new();
        let message = ApplicationMessage::new("a/b", "on");

        assert_eq!(store.update(&message), RetainedChange::Added);
        assert_eq!(store.update(&message), RetainedChange::Replaced);
        assert_eq!(store.matching("a/+").len(), 1);
        assert!(store.matching("a/+")[0].retain);

        let clear = ApplicationMessage::new("a/b", "");
        assert_eq!(store.update(&clear), RetainedChange::Removed);
        assert_eq!(store.update(&clear), RetainedChange::Unchanged);
        assert!(store.matching("#").is_empty());
    }

    #[test]
    fn matches_filters() {
        let store = RetainedMessageStore::new();
        store.update(&ApplicationMessage::new("a/b", "1"));
        store.update(&ApplicationMessage::new("a/c", "2"));
        store.update(&ApplicationMessage::new("$SYS/uptime", "3"));

        assert_eq!(store.matching("a/b").len(), 1);
        assert_eq!(store.matching("a/#").len(), 2);
        assert_eq!(store.matching("#").len(), 2);
        assert_eq!(store.matching("$SYS/#").len(), 1);
        assert_eq!(store.all().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_hidden() {
        let store = RetainedMessageStore::new();
        let mut message = ApplicationMessage::new("a", "1");
        message.properties.push(Property::MessageExpiryInterval(5));
        store.update(&message);

        assert_eq!(store.matching("a").len(), 1);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.matching("a").is_empty());
    }
}
