// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management
//!
//! This module provides types for defining queues and their bindings to
//! exchanges. Queues may be named explicitly or left for the broker to name;
//! either way they are referenced elsewhere by their key (alias or name).

use serde::{Deserialize, Serialize};

/// Definition of a queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue
/// definitions, and deserializes from the `topology.queues` configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDefinition {
    /// Broker-side name; `None` lets the broker generate one
    #[serde(default)]
    pub name: Option<String>,
    /// Logical name used by bindings and subscriptions
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created non-durable, non-exclusive and not
    /// auto-deleted.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: Some(name.to_owned()),
            ..QueueDefinition::default()
        }
    }

    /// Creates a queue whose name is generated by the broker.
    ///
    /// # Parameters
    /// * `alias` - The key bindings and subscriptions use to refer to the queue
    pub fn generated(alias: &str) -> QueueDefinition {
        QueueDefinition {
            alias: Some(alias.to_owned()),
            ..QueueDefinition::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// The key this queue is referenced by, alias first.
    pub fn key(&self) -> Option<&str> {
        self.alias.as_deref().or(self.name.as_deref())
    }

    /// Returns a description of the first flag that differs from `other`.
    pub fn conflict_with(&self, other: &QueueDefinition) -> Option<String> {
        let name = self.key().unwrap_or_default();
        if self.durable != other.durable {
            return Some(format!("queue `{}` durable flag differs", name));
        }
        if self.exclusive != other.exclusive {
            return Some(format!("queue `{}` exclusive flag differs", name));
        }
        if self.auto_delete != other.auto_delete {
            return Some(format!("queue `{}` auto-delete flag differs", name));
        }
        None
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Queue bindings define how messages flow from exchanges to queues based on
/// routing keys and exchange types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueBinding {
    /// Key of the bound queue (alias or name)
    pub queue: String,
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue key.
    ///
    /// By default, the exchange name and routing key are empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue: queue.to_owned(),
            exchange: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    /// Sets the routing key pattern for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
