// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management
//!
//! This module provides types for defining exchanges and the routing rules each
//! exchange kind applies. Exchanges are the routing mechanism that determines how
//! published messages are distributed to bound queues.

use serde::{Deserialize, Serialize};

/// Name of the broker's default exchange.
///
/// It always exists, routes to the queue whose name equals the routing key and
/// can be neither declared nor bound explicitly.
pub const DEFAULT_EXCHANGE: &str = "";

/// Represents the exchange kinds supported by the relay.
///
/// Each kind has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    /// Returns true when a binding with `pattern` routes a message published
    /// with `routing_key` through an exchange of this kind.
    pub fn routes(&self, pattern: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Direct => pattern == routing_key,
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => topic_matches(pattern, routing_key),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Matches a topic binding pattern against a routing key.
///
/// Both are split on `.`; `*` matches exactly one word and `#` matches zero or
/// more words. Takes O(segments × words) time.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let words: Vec<&str> = routing_key.split('.').collect();

    // matched[j]: the pattern segments seen so far match exactly words[..j]
    let mut matched = vec![false; words.len() + 1];
    matched[0] = true;

    for segment in pattern.split('.') {
        let mut next = vec![false; words.len() + 1];
        if segment == "#" {
            let mut reachable = false;
            for (j, slot) in next.iter_mut().enumerate() {
                reachable |= matched[j];
                *slot = reachable;
            }
        } else {
            for (j, word) in words.iter().enumerate() {
                next[j + 1] = matched[j] && (segment == "*" || segment == *word);
            }
        }
        matched = next;
    }

    matched[words.len()]
}

/// Definition of an exchange with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure exchange
/// definitions, and deserializes from the `topology.exchanges` configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDefinition {
    pub name: String,
    #[serde(default)]
    pub kind: ExchangeKind,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is created as a non-durable Direct exchange.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: false,
            internal: false,
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Returns a description of the first parameter that differs from `other`,
    /// if any. Used to detect conflicting re-declarations.
    pub fn conflict_with(&self, other: &ExchangeDefinition) -> Option<String> {
        if self.kind != other.kind {
            return Some(format!(
                "exchange `{}` is {} but was declared {}",
                self.name,
                other.kind.as_str(),
                self.kind.as_str()
            ));
        }
        if self.durable != other.durable {
            return Some(format!(
                "exchange `{}` durable flag differs (existing: {})",
                self.name, other.durable
            ));
        }
        if self.auto_delete != other.auto_delete {
            return Some(format!(
                "exchange `{}` auto-delete flag differs (existing: {})",
                self.name, other.auto_delete
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_star_matches_exactly_one_word() {
        assert!(topic_matches("*.message", "greeting.message"));
        assert!(topic_matches("*.message", "bye.message"));
        assert!(!topic_matches("*.message", "a.b.message"));
        assert!(!topic_matches("*.message", "message"));
    }

    #[test]
    fn topic_hash_matches_zero_or_more_words() {
        assert!(topic_matches("#.message", "message"));
        assert!(topic_matches("#.message", "a.b.message"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("audit.#", "audit"));
        assert!(topic_matches("a.#.z", "a.b.c.z"));
        assert!(!topic_matches("a.#.z", "a.b.c"));
    }

    #[test]
    fn many_hash_segments_match_in_linear_time() {
        let key = vec!["a"; 28].join(".");
        let pattern = format!("{}.z", vec!["#"; 10].join("."));

        let started = std::time::Instant::now();
        assert!(!topic_matches(&pattern, &key));
        assert!(topic_matches(&format!("{}.a", vec!["#"; 10].join(".")), &key));
        assert!(started.elapsed() < std::time::Duration::from_millis(100));
    }

    #[test]
    fn topic_literal_words_must_be_equal() {
        assert!(topic_matches("greeting.message", "greeting.message"));
        assert!(!topic_matches("greeting.message", "bye.message"));
    }

    #[test]
    fn direct_and_fanout_routing() {
        assert!(ExchangeKind::Direct.routes("route1", "route1"));
        assert!(!ExchangeKind::Direct.routes("route1", "route2"));
        assert!(!ExchangeKind::Direct.routes("*", "route1"));
        assert!(ExchangeKind::Fanout.routes("", "whatever"));
        assert!(ExchangeKind::Fanout.routes("route1", "route2"));
    }

    #[test]
    fn conflicting_kind_is_reported() {
        let topic = ExchangeDefinition::new("ex").topic();
        let direct = ExchangeDefinition::new("ex").direct();
        assert!(topic.conflict_with(&direct).is_some());
        assert!(topic.conflict_with(&topic.clone()).is_none());
        assert!(topic.clone().durable().conflict_with(&topic).is_some());
    }

    #[test]
    fn kind_deserializes_lowercase() {
        let def: ExchangeDefinition =
            serde_json::from_str(r#"{"name":"fanout_exchange","kind":"fanout"}"#).unwrap();
        assert_eq!(def.kind, ExchangeKind::Fanout);
        assert!(!def.durable);
    }
}
