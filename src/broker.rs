// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Channel Capability
//!
//! The topology manager, the publisher and the consumer only talk to the
//! broker through the `BrokerChannel` trait. `amqp::AmqpChannel` implements it
//! over a lapin channel; `memory::InMemoryBroker` implements it in-process.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, OutboundMessage},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries for one consumer. It ends when the consumer is
/// cancelled or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Acknowledgment mode of a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// The broker considers a message consumed as soon as it is delivered
    #[default]
    Auto,
    /// The consumer must ack, nack or reject every delivery
    Manual,
}

/// Operations a broker channel must provide.
///
/// Implementations must be safe to share between tasks; callers that need a
/// publish and its confirmation to stay paired serialize access themselves.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Whether the channel is currently usable.
    fn is_connected(&self) -> bool;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns its broker-side name, which is generated
    /// when the definition carries none.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries per consumer.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Stops delivering to the given consumer; its stream then ends.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;
}
