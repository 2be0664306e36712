//! Topic names, topic filters and the subscription index.
//!
//! Topics are divided into levels by `/`. Filters may use `+` to match exactly one level and, as
//! their last level, `#` to match any number of trailing levels including none. Topics starting
//! with `$` are never matched by a filter whose first level is a wildcard.
use crate::ProtocolError;
use std::collections::HashMap;
use std::hash::Hash;

const SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Check that a topic name can be published to.
pub fn validate_topic_name(topic: &str) -> Result<(), ProtocolError> {
    if topic.is_empty()
        || topic.len() > u16::MAX as usize
        || topic.contains(|c| c == '+' || c == '#' || c == '\0')
    {
        return Err(ProtocolError::InvalidTopicName);
    }

    Ok(())
}

/// Check that a topic filter is well formed.
pub fn validate_filter(filter: &str) -> Result<(), ProtocolError> {
    if filter.is_empty() || filter.len() > u16::MAX as usize || filter.contains('\0') {
        return Err(ProtocolError::InvalidTopicFilter);
    }

    let mut levels = filter.split(SEPARATOR).peekable();
    while let Some(level) = levels.next() {
        let last = levels.peek().is_none();

        if level.contains('#') && (level != MULTI_LEVEL || !last) {
            return Err(ProtocolError::InvalidTopicFilter);
        }

        if level.contains('+') && level != SINGLE_LEVEL {
            return Err(ProtocolError::InvalidTopicFilter);
        }
    }

    Ok(())
}

/// Check if a topic is matched by a filter.
///
/// # Note
/// The filter is assumed to be valid.
pub fn matches(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split(SEPARATOR);
    let mut filter_levels = filter.split(SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // `#` also matches the parent level.
            (Some(MULTI_LEVEL), _) => return true,
            (Some(SINGLE_LEVEL), Some(_)) => {}
            (Some(expected), Some(level)) if expected == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A validated topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter(String);

impl TopicFilter {
    pub fn new(filter: impl Into<String>) -> Result<Self, ProtocolError> {
        let filter = filter.into();
        validate_filter(&filter)?;
        Ok(Self(filter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the filter contains wildcards.
    pub fn is_wildcard(&self) -> bool {
        self.0
            .split(SEPARATOR)
            .any(|level| level == SINGLE_LEVEL || level == MULTI_LEVEL)
    }

    pub fn matches(&self, topic: &str) -> bool {
        matches(topic, &self.0)
    }
}

impl core::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TopicFilter {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

struct TrieNode<K, V> {
    /// Subscribers whose filter ends at this node.
    subscribers: HashMap<K, V>,

    /// Subscribers whose filter ends with `#` below this node.
    multi_wildcard: HashMap<K, V>,

    /// Child nodes by topic level, including `+`.
    children: HashMap<String, TrieNode<K, V>>,
}

impl<K, V> Default for TrieNode<K, V> {
    fn default() -> Self {
        Self {
            subscribers: HashMap::new(),
            multi_wildcard: HashMap::new(),
            children: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> TrieNode<K, V> {
    fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.multi_wildcard.is_empty() && self.children.is_empty()
    }

    fn insert(&mut self, levels: &[&str], key: K, value: V) -> Option<V> {
        match levels {
            [] => self.subscribers.insert(key, value),
            [MULTI_LEVEL] => self.multi_wildcard.insert(key, value),
            [level, remaining @ ..] => self
                .children
                .entry(level.to_string())
                .or_default()
                .insert(remaining, key, value),
        }
    }

    fn remove(&mut self, levels: &[&str], key: &K) -> Option<V> {
        match levels {
            [] => self.subscribers.remove(key),
            [MULTI_LEVEL] => self.multi_wildcard.remove(key),
            [level, remaining @ ..] => {
                let child = self.children.get_mut(*level)?;
                let removed = child.remove(remaining, key);

                // Prune branches that no longer lead to any subscriber.
                if child.is_empty() {
                    self.children.remove(*level);
                }

                removed
            }
        }
    }

    fn collect(&self, levels: &[&str], is_root: bool, result: &mut Vec<(K, V)>) {
        let skip_wildcards = is_root && levels.first().map_or(false, |l| l.starts_with('$'));

        if !skip_wildcards {
            result.extend(self.multi_wildcard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let (level, remaining) = match levels {
            [] => {
                result.extend(self.subscribers.iter().map(|(k, v)| (k.clone(), v.clone())));
                return;
            }
            [level, remaining @ ..] => (level, remaining),
        };

        if !skip_wildcards {
            if let Some(child) = self.children.get(SINGLE_LEVEL) {
                child.collect(remaining, false, result);
            }
        }

        if *level != SINGLE_LEVEL {
            if let Some(child) = self.children.get(*level) {
                child.collect(remaining, false, result);
            }
        }
    }
}

/// A level-keyed trie of subscriptions.
///
/// Each subscriber key holds at most one entry per filter. Lookup cost depends on the depth of
/// the published topic, not the number of subscriptions.
pub struct SubscriptionIndex<K, V> {
    root: TrieNode<K, V>,
    len: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> Default for SubscriptionIndex<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> SubscriptionIndex<K, V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::default(),
            len: 0,
        }
    }

    /// Add or replace the entry of `key` for a filter.
    ///
    /// # Returns
    /// The previous entry of the key for the filter.
    pub fn subscribe(&mut self, filter: &TopicFilter, key: K, value: V) -> Option<V> {
        let levels: Vec<&str> = filter.as_str().split(SEPARATOR).collect();
        let previous = self.root.insert(&levels, key, value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Remove the entry of `key` for a filter. Empty branches are pruned.
    pub fn unsubscribe(&mut self, filter: &TopicFilter, key: &K) -> Option<V> {
        let levels: Vec<&str> = filter.as_str().split(SEPARATOR).collect();
        let removed = self.root.remove(&levels, key);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Find every entry whose filter matches the topic.
    ///
    /// A key subscribed with several overlapping filters appears once per matching filter.
    pub fn subscribers(&self, topic: &str) -> Vec<(K, V)> {
        let levels: Vec<&str> = topic.split(SEPARATOR).collect();
        let mut result = Vec::new();
        self.root.collect(&levels, true, &mut result);
        result
    }

    /// The number of (filter, key) entries in the index.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
