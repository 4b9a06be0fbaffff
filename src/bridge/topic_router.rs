//! Topic Routing
//!
//! Two immutable lookup tables: broker topic to OSC address (forward) and
//! OSC address to broker topic (reverse). Keys are compared as exact,
//! case-sensitive strings; wildcard characters in a broker topic key have no
//! matching semantics here.

use fnv::FnvHashMap;

use crate::config::RouteTable;

/// Resolves endpoints between the broker and the local side
#[derive(Debug, Clone, Default)]
pub struct TopicRouter {
    /// broker topic -> OSC address (None = observe only)
    forward: FnvHashMap<String, Option<String>>,
    /// OSC address -> broker topic (None = no publish)
    reverse: FnvHashMap<String, Option<String>>,
}

impl TopicRouter {
    pub fn new<F, R>(forward: F, reverse: R) -> Self
    where
        F: IntoIterator<Item = (String, Option<String>)>,
        R: IntoIterator<Item = (String, Option<String>)>,
    {
        Self {
            forward: forward.into_iter().collect(),
            reverse: reverse.into_iter().collect(),
        }
    }

    /// Build from the configured route tables
    pub fn from_tables(forward: &RouteTable, reverse: &RouteTable) -> Self {
        Self::new(forward.clone(), reverse.clone())
    }

    /// OSC address paired with a broker topic, if any
    pub fn resolve_forward(&self, topic: &str) -> Option<&str> {
        self.forward.get(topic).and_then(|t| t.as_deref())
    }

    /// Broker topic paired with an OSC address, if any
    pub fn resolve_reverse(&self, address: &str) -> Option<&str> {
        self.reverse.get(address).and_then(|t| t.as_deref())
    }

    /// Whether the topic is a forward key at all (possibly observe only)
    pub fn is_forward_routed(&self, topic: &str) -> bool {
        self.forward.contains_key(topic)
    }

    /// Whether the address is a reverse key at all (possibly without a topic)
    pub fn is_reverse_routed(&self, address: &str) -> bool {
        self.reverse.contains_key(address)
    }

    /// Every broker topic to subscribe, sorted
    pub fn forward_topics(&self) -> Vec<String> {
        self.forward_routes()
            .into_iter()
            .map(|(topic, _)| topic.to_string())
            .collect()
    }

    /// Forward pairs sorted by topic
    pub fn forward_routes(&self) -> Vec<(&str, Option<&str>)> {
        sorted_pairs(&self.forward)
    }

    /// Reverse pairs sorted by address
    pub fn reverse_routes(&self) -> Vec<(&str, Option<&str>)> {
        sorted_pairs(&self.reverse)
    }

    pub fn forward_len(&self) -> usize {
        self.forward.len()
    }

    pub fn reverse_len(&self) -> usize {
        self.reverse.len()
    }
}

fn sorted_pairs(table: &FnvHashMap<String, Option<String>>) -> Vec<(&str, Option<&str>)> {
    let mut pairs: Vec<_> = table
        .iter()
        .map(|(key, value)| (key.as_str(), value.as_deref()))
        .collect();
    pairs.sort_unstable_by_key(|(key, _)| *key);
    pairs
}
