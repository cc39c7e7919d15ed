// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module provides functionality for defining and creating broker topology:
//! exchanges, queues and the bindings between them.
//!
//! The main components are:
//! - `TopologySpec`: Declarative description, usually loaded from configuration
//! - `Topology` trait: Builder-style interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait over a `BrokerChannel`
//! - `ensure_topology` / `ensure_topology_with`: Install a `TopologySpec` in
//!   one call
//!
//! Installation validates the description first, then declares all exchanges,
//! then all queues, and only then binds, whatever order the input used.
//! Every step is idempotent. Broker-named queues are the exception unless the
//! previous `DeclaredTopology` is supplied, in which case installing again
//! changes nothing.

use crate::{
    broker::BrokerChannel,
    errors::{AmqpError, TopologyError},
    exchange::{ExchangeDefinition, DEFAULT_EXCHANGE},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, info};

/// Declarative description of exchanges, queues and bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySpec {
    #[serde(default)]
    pub exchanges: Vec<ExchangeDefinition>,
    #[serde(default)]
    pub queues: Vec<QueueDefinition>,
    #[serde(default)]
    pub bindings: Vec<QueueBinding>,
}

impl TopologySpec {
    /// Checks the description before anything is sent to the broker.
    ///
    /// Every queue needs a key, duplicated entries must agree, and every
    /// binding must reference an exchange and a queue listed here.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut exchanges: HashMap<&str, &ExchangeDefinition> = HashMap::new();
        for def in &self.exchanges {
            if def.name == DEFAULT_EXCHANGE {
                return Err(TopologyError::Invalid(
                    "the default exchange cannot be declared".to_owned(),
                ));
            }
            if let Some(existing) = exchanges.insert(&def.name, def) {
                if let Some(reason) = def.conflict_with(existing) {
                    return Err(TopologyError::Conflict(reason));
                }
            }
        }

        let mut queues: HashMap<&str, &QueueDefinition> = HashMap::new();
        for def in &self.queues {
            let Some(key) = def.key() else {
                return Err(TopologyError::Invalid(
                    "a queue needs a name or an alias".to_owned(),
                ));
            };
            if let Some(existing) = queues.insert(key, def) {
                if existing.name != def.name {
                    return Err(TopologyError::Conflict(format!(
                        "queue key `{}` names two different queues",
                        key
                    )));
                }
                if let Some(reason) = def.conflict_with(existing) {
                    return Err(TopologyError::Conflict(reason));
                }
            }
        }

        for binding in &self.bindings {
            if !exchanges.contains_key(binding.exchange.as_str()) {
                return Err(TopologyError::MissingResource(format!(
                    "binding of `{}` references undeclared exchange `{}`",
                    binding.queue, binding.exchange
                )));
            }
            if !queues.contains_key(binding.queue.as_str()) {
                return Err(TopologyError::MissingResource(format!(
                    "binding to `{}` references undeclared queue `{}`",
                    binding.exchange, binding.queue
                )));
            }
        }

        Ok(())
    }
}

/// Outcome of installing a topology: the broker-side name of every queue,
/// keyed by the queue key used in the description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredTopology {
    pub queues: BTreeMap<String, String>,
}

impl DeclaredTopology {
    /// Broker-side name of the queue with the given key.
    pub fn queue_name(&self, key: &str) -> Option<&str> {
        self.queues.get(key).map(String::as_str)
    }
}

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges, queues, and bindings,
/// as well as installing the topology to the broker.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology to the broker.
    async fn install(&self) -> Result<DeclaredTopology, AmqpError>;
}

/// Implementation of the Topology trait over any broker channel.
pub struct AmqpTopology {
    channel: Arc<dyn BrokerChannel>,
    pub(crate) spec: TopologySpec,
    prior: Option<DeclaredTopology>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> AmqpTopology {
        AmqpTopology::from_spec(channel, TopologySpec::default())
    }

    pub fn from_spec(channel: Arc<dyn BrokerChannel>, spec: TopologySpec) -> AmqpTopology {
        AmqpTopology {
            channel,
            spec,
            prior: None,
        }
    }

    /// Reuses the broker-side names of an earlier install, so unnamed queues
    /// are redeclared under the name they already have.
    pub fn with_prior(mut self, prior: DeclaredTopology) -> Self {
        self.prior = Some(prior);
        self
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.spec.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.spec.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.spec.bindings.push(binding);
        self
    }

    /// Installs the topology to the broker.
    ///
    /// This method performs the following operations in order:
    /// 1. Validates the description
    /// 2. Creates all exchanges
    /// 3. Creates all queues, collecting generated names
    /// 4. Sets up queue-to-exchange bindings
    async fn install(&self) -> Result<DeclaredTopology, AmqpError> {
        self.spec.validate()?;
        self.install_exchanges().await?;
        let declared = self.install_queues().await?;
        self.binding_queues(&declared).await?;

        info!(
            exchanges = self.spec.exchanges.len(),
            queues = declared.queues.len(),
            bindings = self.spec.bindings.len(),
            "topology installed"
        );
        Ok(declared)
    }
}

impl AmqpTopology {
    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        for exch in &self.spec.exchanges {
            self.channel.declare_exchange(exch).await?;
        }

        Ok(())
    }

    async fn install_queues(&self) -> Result<DeclaredTopology, AmqpError> {
        let mut declared = DeclaredTopology::default();

        for def in &self.spec.queues {
            let key = def.key().unwrap_or_default();
            if declared.queues.contains_key(key) {
                continue;
            }

            let known = self
                .prior
                .as_ref()
                .and_then(|prior| prior.queue_name(key));
            let name = match (&def.name, known) {
                (None, Some(known)) => {
                    let mut def = def.clone();
                    def.name = Some(known.to_owned());
                    self.channel.declare_queue(&def).await?
                }
                _ => self.channel.declare_queue(def).await?,
            };
            debug!(key, name = %name, "queue ready");
            declared.queues.insert(key.to_owned(), name);
        }

        Ok(declared)
    }

    async fn binding_queues(&self, declared: &DeclaredTopology) -> Result<(), AmqpError> {
        for binding in &self.spec.bindings {
            let queue = declared.queue_name(&binding.queue).ok_or_else(|| {
                TopologyError::MissingResource(format!("queue `{}`", binding.queue))
            })?;

            self.channel
                .bind_queue(queue, &binding.exchange, &binding.routing_key)
                .await?;
        }

        debug!("queues were bound");

        Ok(())
    }
}

/// Installs `spec` through `channel` for the first time.
///
/// Unnamed queues get a broker-generated name; pass the returned
/// `DeclaredTopology` to [`ensure_topology_with`] on later calls.
pub async fn ensure_topology(
    channel: Arc<dyn BrokerChannel>,
    spec: &TopologySpec,
) -> Result<DeclaredTopology, AmqpError> {
    ensure_topology_with(channel, spec, None).await
}

/// Installs `spec` through `channel`, reusing the queue names in `prior`.
///
/// Calling it again with the result of the previous call changes nothing on
/// the broker: every declaration repeats with identical parameters, including
/// those of generated queues.
pub async fn ensure_topology_with(
    channel: Arc<dyn BrokerChannel>,
    spec: &TopologySpec,
    prior: Option<&DeclaredTopology>,
) -> Result<DeclaredTopology, AmqpError> {
    let topology = AmqpTopology::from_spec(channel, spec.clone());
    match prior {
        Some(prior) => topology.with_prior(prior.clone()).install().await,
        None => topology.install().await,
    }
}
