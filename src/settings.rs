// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Settings
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `RELAY_`-prefixed environment variables with `__` separating nested
//! keys (`RELAY_BROKER__HOST=rabbit`). The defaults reproduce the tutorial
//! topology: a `topic_exchange` feeding `queue0` (`greeting.message`),
//! `queue1` (`bye.message`) and `queue2` (`*.message`).

use crate::{
    broker::AckMode,
    consumer::{ShutdownMode, Subscription},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    topology::TopologySpec,
};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, time::Duration};

/// Top-level configuration settings for the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub server: ServerSettings,
    pub topology: TopologySpec,
    pub publisher: PublisherSettings,
    pub consumer: ConsumerSettings,
}

/// Connection parameters for the AMQP broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
    /// Total connection attempts before giving up
    pub connect_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub publisher_confirms: bool,
}

/// Address the HTTP producer binds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSettings {
    pub exchange: String,
    /// Message kind accepted by `POST /message/{kind}` → routing key
    pub routes: BTreeMap<String, String>,
    pub mandatory: bool,
    /// Entries kept for `GET /message`; 0 disables the history
    pub history_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Queue key from the topology (alias or name)
    pub queue: String,
    pub ack_mode: AckMode,
    pub processing_delay_ms: u64,
    pub max_in_flight: usize,
    pub prefetch: u16,
    pub shutdown: ShutdownMode,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: "amqp-relay".to_owned(),
            connect_attempts: 5,
            retry_backoff_ms: 500,
            max_backoff_ms: 8_000,
            publisher_confirms: true,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 5000,
        }
    }
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            exchange: "topic_exchange".to_owned(),
            routes: BTreeMap::from([
                ("greeting".to_owned(), "greeting.message".to_owned()),
                ("bye".to_owned(), "bye.message".to_owned()),
            ]),
            mandatory: false,
            history_capacity: 100,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue: "queue2".to_owned(),
            ack_mode: AckMode::Auto,
            processing_delay_ms: 5_000,
            max_in_flight: 4,
            prefetch: 10,
            shutdown: ShutdownMode::Drain,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            server: ServerSettings::default(),
            topology: tutorial_topology(),
            publisher: PublisherSettings::default(),
            consumer: ConsumerSettings::default(),
        }
    }
}

/// The topic exchange and three queues the producer has always set up.
pub fn tutorial_topology() -> TopologySpec {
    let exchange = "topic_exchange";
    TopologySpec {
        exchanges: vec![ExchangeDefinition::new(exchange).topic()],
        queues: vec![
            QueueDefinition::new("queue0"),
            QueueDefinition::new("queue1"),
            QueueDefinition::new("queue2"),
        ],
        bindings: vec![
            QueueBinding::new("queue0")
                .exchange(exchange)
                .routing_key("greeting.message"),
            QueueBinding::new("queue1")
                .exchange(exchange)
                .routing_key("bye.message"),
            QueueBinding::new("queue2")
                .exchange(exchange)
                .routing_key("*.message"),
        ],
    }
}

impl Settings {
    /// Loads the configuration from `path` (if given) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Rejects combinations the broker adapter cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publisher.mandatory && !self.broker.publisher_confirms {
            return Err(ConfigError::Message(
                "publisher.mandatory requires broker.publisher_confirms".to_owned(),
            ));
        }

        Ok(())
    }
}

impl ConsumerSettings {
    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.processing_delay_ms)
    }

    /// Subscription for the broker-side queue `queue_name`.
    pub fn subscription(&self, queue_name: &str) -> Subscription {
        Subscription::new(queue_name)
            .ack_mode(self.ack_mode)
            .max_in_flight(self.max_in_flight)
            .prefetch(self.prefetch)
            .shutdown(self.shutdown)
    }
}
