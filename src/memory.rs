// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A `BrokerChannel` that keeps exchanges, queues, bindings and consumers in
//! memory and applies the same routing rules a RabbitMQ broker does. It backs
//! the test-suite and the `--in-memory` mode of the binary.
//!
//! Deliveries are pushed to consumers round-robin; in manual mode they stay
//! unacknowledged until acked, nacked or rejected, and a consumer created
//! after `qos(n)` holds at most `n` of them at a time. Cancelling a consumer ends
//! its stream but leaves its unacknowledged deliveries pending so in-flight
//! handlers can still settle them.

use crate::{
    broker::{AckMode, BrokerChannel, DeliveryStream},
    errors::{AmqpError, PublishError, TopologyError},
    exchange::{ExchangeDefinition, DEFAULT_EXCHANGE},
    message::{Delivery, OutboundMessage},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    kind: Option<String>,
    message_id: String,
    headers: BTreeMap<String, String>,
    data: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, Stored>,
}

struct ConsumerState {
    queue: String,
    ack_mode: AckMode,
    /// 0 means unlimited
    prefetch: u16,
    outstanding: usize,
    tx: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.ack_mode == AckMode::Auto
            || self.prefetch == 0
            || self.outstanding < usize::from(self.prefetch)
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: BTreeSet<(String, String, String)>,
    consumers: BTreeMap<String, ConsumerState>,
    /// Delivery tag → consumer tag, for unacknowledged deliveries
    owners: HashMap<u64, String>,
    prefetch: u16,
    next_delivery_tag: u64,
    next_consumer: usize,
}

/// Point-in-time view of the declared topology, for comparisons in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub exchanges: BTreeMap<String, ExchangeDefinition>,
    pub queues: BTreeSet<String>,
    /// (queue, exchange, routing key)
    pub bindings: BTreeSet<(String, String, String)>,
}

/// In-memory implementation of [`BrokerChannel`].
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    disconnected: Arc<AtomicBool>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker::default())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, AmqpError> {
        self.state.lock().map_err(|_| AmqpError::InternalError)
    }

    fn ensure_connected(&self) -> Result<(), AmqpError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(PublishError::NotConnected.into())
        }
    }

    /// Simulates losing the connection; every later operation fails with
    /// `PublishError::NotConnected` and open consumer streams end.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        if let Ok(mut state) = self.state.lock() {
            state.consumers.clear();
        }
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        TopologySnapshot {
            exchanges: state
                .exchanges
                .iter()
                .map(|(name, def)| (name.clone(), def.clone()))
                .collect(),
            queues: state.queues.keys().cloned().collect(),
            bindings: state.bindings.clone(),
        }
    }

    /// Number of messages waiting for delivery in `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Number of delivered but unsettled messages in `queue`.
    pub fn unacked_count(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    /// Removes and returns the oldest ready message of `queue`, like a
    /// `basic.get` with auto-ack.
    pub fn pop(&self, queue: &str) -> Option<Vec<u8>> {
        let mut state = self.state.lock().ok()?;
        state
            .queues
            .get_mut(queue)
            .and_then(|q| q.ready.pop_front())
            .map(|stored| stored.data)
    }

    /// Drains every ready message of `queue`.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.pop(queue)).collect()
    }
}

impl State {
    fn dispatch(&mut self, queue: &str) {
        loop {
            let candidates: Vec<String> = self
                .consumers
                .iter()
                .filter(|(_, c)| c.queue == queue && c.has_capacity())
                .map(|(tag, _)| tag.clone())
                .collect();
            if candidates.is_empty() {
                return;
            }

            let Some(stored) = self.queues.get_mut(queue).and_then(|q| q.ready.pop_front())
            else {
                return;
            };

            let tag = candidates[self.next_consumer % candidates.len()].clone();
            self.next_consumer = self.next_consumer.wrapping_add(1);
            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;

            let Some(consumer) = self.consumers.get(&tag) else {
                return;
            };
            let delivery = Delivery {
                delivery_tag,
                exchange: stored.exchange.clone(),
                routing_key: stored.routing_key.clone(),
                redelivered: stored.redelivered,
                kind: stored.kind.clone(),
                message_id: Some(stored.message_id.clone()),
                headers: stored.headers.clone().into_iter().collect(),
                data: stored.data.clone(),
            };
            let ack_mode = consumer.ack_mode;

            if consumer.tx.send(Ok(delivery)).is_err() {
                debug!(consumer = %tag, "consumer went away, requeuing message");
                self.consumers.remove(&tag);
                if let Some(q) = self.queues.get_mut(queue) {
                    q.ready.push_front(stored);
                }
                continue;
            }

            if ack_mode == AckMode::Manual {
                if let Some(q) = self.queues.get_mut(queue) {
                    q.unacked.insert(delivery_tag, stored);
                }
                if let Some(consumer) = self.consumers.get_mut(&tag) {
                    consumer.outstanding += 1;
                }
                self.owners.insert(delivery_tag, tag);
            }
        }
    }

    fn settle(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let found = self.queues.iter_mut().find_map(|(name, q)| {
            q.unacked
                .remove(&delivery_tag)
                .map(|stored| (name.clone(), stored))
        });

        let Some((queue, mut stored)) = found else {
            warn!(delivery_tag, "unknown delivery tag");
            return Err(AmqpError::AckMessageError);
        };

        if let Some(owner) = self.owners.remove(&delivery_tag) {
            if let Some(consumer) = self.consumers.get_mut(&owner) {
                consumer.outstanding = consumer.outstanding.saturating_sub(1);
            }
        }

        if requeue {
            stored.redelivered = true;
            if let Some(q) = self.queues.get_mut(&queue) {
                q.ready.push_front(stored);
            }
        }
        self.dispatch(&queue);

        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_connected()?;
        if def.name == DEFAULT_EXCHANGE {
            return Err(TopologyError::Conflict(
                "the default exchange cannot be redeclared".to_owned(),
            )
            .into());
        }

        let mut state = self.lock()?;
        match state.exchanges.get(&def.name) {
            Some(existing) => match def.conflict_with(existing) {
                Some(reason) => Err(TopologyError::Conflict(reason).into()),
                None => Ok(()),
            },
            None => {
                debug!(name = %def.name, kind = def.kind.as_str(), "exchange declared");
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.ensure_connected()?;
        let mut state = self.lock()?;

        let name = match &def.name {
            Some(name) => name.clone(),
            None => format!("amq.gen-{}", Uuid::new_v4().simple()),
        };

        match state.queues.get(&name) {
            Some(existing) => {
                if let Some(reason) = def.conflict_with(&existing.def) {
                    return Err(TopologyError::Conflict(reason).into());
                }
            }
            None => {
                debug!(name = %name, "queue declared");
                state.queues.insert(
                    name.clone(),
                    QueueState {
                        def: def.clone(),
                        ready: VecDeque::new(),
                        unacked: HashMap::new(),
                    },
                );
            }
        }

        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.ensure_connected()?;
        let mut state = self.lock()?;

        if exchange == DEFAULT_EXCHANGE {
            return Err(TopologyError::Conflict(
                "queues cannot be bound to the default exchange".to_owned(),
            )
            .into());
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(TopologyError::MissingResource(format!("exchange `{}`", exchange)).into());
        }
        if !state.queues.contains_key(queue) {
            return Err(TopologyError::MissingResource(format!("queue `{}`", queue)).into());
        }

        state.bindings.insert((
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        self.ensure_connected()?;
        let mut state = self.lock()?;

        let targets: BTreeSet<String> = if msg.exchange == DEFAULT_EXCHANGE {
            state
                .queues
                .contains_key(&msg.routing_key)
                .then(|| msg.routing_key.clone())
                .into_iter()
                .collect()
        } else {
            let Some(exchange) = state.exchanges.get(&msg.exchange) else {
                return Err(
                    TopologyError::MissingResource(format!("exchange `{}`", msg.exchange)).into(),
                );
            };
            state
                .bindings
                .iter()
                .filter(|(_, ex, pattern)| {
                    *ex == msg.exchange && exchange.kind.routes(pattern, &msg.routing_key)
                })
                .map(|(queue, _, _)| queue.clone())
                .collect()
        };

        if targets.is_empty() {
            if msg.mandatory {
                return Err(PublishError::Unroutable {
                    exchange: msg.exchange.clone(),
                    routing_key: msg.routing_key.clone(),
                }
                .into());
            }
            debug!(
                exchange = %msg.exchange,
                routing_key = %msg.routing_key,
                "unroutable message dropped"
            );
            return Ok(());
        }

        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(Stored {
                    exchange: msg.exchange.clone(),
                    routing_key: msg.routing_key.clone(),
                    kind: msg.kind.clone(),
                    message_id: msg.message_id.clone(),
                    headers: msg.headers.clone(),
                    data: msg.data.clone(),
                    redelivered: false,
                });
            }
            state.dispatch(&queue);
        }

        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.ensure_connected()?;
        self.lock()?.prefetch = prefetch;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_connected()?;
        let mut state = self.lock()?;

        if !state.queues.contains_key(queue) {
            return Err(TopologyError::MissingResource(format!("queue `{}`", queue)).into());
        }
        if state.consumers.contains_key(consumer_tag) {
            return Err(AmqpError::ConsumerDeclarationError(consumer_tag.to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let prefetch = state.prefetch;
        state.consumers.insert(
            consumer_tag.to_owned(),
            ConsumerState {
                queue: queue.to_owned(),
                ack_mode,
                prefetch,
                outstanding: 0,
                tx,
            },
        );
        state.dispatch(queue);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_connected()?;
        self.lock()?.settle(delivery_tag, false)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_connected()?;
        self.lock()?
            .settle(delivery_tag, requeue)
            .map_err(|_| AmqpError::NackMessageError)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_connected()?;
        self.lock()?
            .settle(delivery_tag, requeue)
            .map_err(|_| AmqpError::NackMessageError)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_connected()?;
        match self.lock()?.consumers.remove(consumer_tag) {
            Some(_) => Ok(()),
            None => Err(AmqpError::ConsumerError(format!(
                "unknown consumer `{}`",
                consumer_tag
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(exchange: &str, key: &str, body: &str) -> OutboundMessage {
        OutboundMessage::new(exchange, key, body.as_bytes())
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(&QueueDefinition::new("message_queue"))
            .await
            .unwrap();

        broker
            .publish(&outbound("", "message_queue", "work"))
            .await
            .unwrap();
        broker.publish(&outbound("", "nowhere", "lost")).await.unwrap();

        assert_eq!(broker.drain("message_queue"), vec![b"work".to_vec()]);
    }

    #[tokio::test]
    async fn redeclaring_with_other_kind_conflicts() {
        let broker = InMemoryBroker::new();
        let topic = ExchangeDefinition::new("ex").topic();
        broker.declare_exchange(&topic).await.unwrap();
        broker.declare_exchange(&topic).await.unwrap();

        let err = broker
            .declare_exchange(&ExchangeDefinition::new("ex").fanout())
            .await
            .unwrap_err();
        assert!(matches!(err, AmqpError::Topology(TopologyError::Conflict(_))));
    }

    #[tokio::test]
    async fn binding_requires_existing_resources() {
        let broker = InMemoryBroker::new();
        let err = broker.bind_queue("q", "ex", "k").await.unwrap_err();
        assert!(matches!(
            err,
            AmqpError::Topology(TopologyError::MissingResource(_))
        ));

        broker
            .declare_exchange(&ExchangeDefinition::new("ex"))
            .await
            .unwrap();
        let err = broker.bind_queue("q", "ex", "k").await.unwrap_err();
        assert!(matches!(
            err,
            AmqpError::Topology(TopologyError::MissingResource(_))
        ));
    }

    #[tokio::test]
    async fn generated_queue_names_are_unique() {
        let broker = InMemoryBroker::new();
        let a = broker
            .declare_queue(&QueueDefinition::generated("a"))
            .await
            .unwrap();
        let b = broker
            .declare_queue(&QueueDefinition::generated("b"))
            .await
            .unwrap();
        assert!(a.starts_with("amq.gen-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn mandatory_publish_without_route_fails() {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeDefinition::new("ex").direct())
            .await
            .unwrap();

        let mut msg = outbound("ex", "nobody", "x");
        broker.publish(&msg).await.unwrap();

        msg.mandatory = true;
        let err = broker.publish(&msg).await.unwrap_err();
        assert!(matches!(
            err,
            AmqpError::Publish(PublishError::Unroutable { .. })
        ));
    }

    #[tokio::test]
    async fn manual_nack_with_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        let mut stream = broker.consume("q", "c1", AckMode::Manual).await.unwrap();

        broker.publish(&outbound("", "q", "again")).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        assert_eq!(broker.unacked_count("q"), 1);

        broker.nack(first.delivery_tag, true).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.data, b"again".to_vec());

        broker.ack(second.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count("q"), 0);
        assert!(broker.ack(second.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn prefetch_caps_unacked_deliveries_per_consumer() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        broker.qos(1).await.unwrap();
        let mut busy = broker.consume("q", "c1", AckMode::Manual).await.unwrap();
        let mut idle = broker.consume("q", "c2", AckMode::Manual).await.unwrap();

        for body in ["a", "b", "c"] {
            broker.publish(&outbound("", "q", body)).await.unwrap();
        }
        assert_eq!(broker.unacked_count("q"), 2);
        assert_eq!(broker.ready_count("q"), 1);

        let first = busy.next().await.unwrap().unwrap();
        let second = idle.next().await.unwrap().unwrap();
        assert_eq!(first.data, b"a".to_vec());
        assert_eq!(second.data, b"b".to_vec());

        // The third message waits for whichever consumer acks first.
        broker.ack(second.delivery_tag).await.unwrap();
        let third = idle.next().await.unwrap().unwrap();
        assert_eq!(third.data, b"c".to_vec());
        assert_eq!(broker.ready_count("q"), 0);
        assert_eq!(broker.unacked_count("q"), 2);
    }

    #[tokio::test]
    async fn cancel_ends_the_stream() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        let mut stream = broker.consume("q", "c1", AckMode::Auto).await.unwrap();

        broker.cancel("c1").await.unwrap();
        assert!(stream.next().await.is_none());

        broker.publish(&outbound("", "q", "kept")).await.unwrap();
        assert_eq!(broker.ready_count("q"), 1);
    }

    #[tokio::test]
    async fn disconnected_broker_refuses_work() {
        let broker = InMemoryBroker::new();
        broker.disconnect();
        let err = broker.publish(&outbound("", "q", "x")).await.unwrap_err();
        assert_eq!(err, AmqpError::Publish(PublishError::NotConnected));
    }
}
