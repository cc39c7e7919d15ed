// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Channel Adapter
//!
//! Implements `BrokerChannel` over a lapin `Channel`. Broker refusals are
//! mapped onto the crate's error taxonomy: `NOT_FOUND` becomes
//! `TopologyError::MissingResource`, `PRECONDITION_FAILED` becomes
//! `TopologyError::Conflict`, and a closed channel becomes
//! `PublishError::NotConnected`.

use crate::{
    broker::{AckMode, BrokerChannel, DeliveryStream},
    errors::{AmqpError, PublishError, TopologyError},
    exchange::ExchangeDefinition,
    message::{Delivery, OutboundMessage},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error};

/// `BrokerChannel` backed by a lapin channel.
pub struct AmqpChannel {
    channel: Channel,
    confirms: bool,
}

impl AmqpChannel {
    /// Wraps `channel`. `confirms` must reflect whether `confirm_select` was
    /// issued on it; mandatory publishes are refused without confirms.
    pub fn new(channel: Channel, confirms: bool) -> AmqpChannel {
        AmqpChannel { channel, confirms }
    }
}

/// Maps a lapin error to the crate taxonomy, using `fallback` for anything
/// without a more specific meaning.
fn classify(err: &lapin::Error, fallback: AmqpError) -> AmqpError {
    match err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                TopologyError::MissingResource(amqp.to_string()).into()
            }
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                TopologyError::Conflict(amqp.to_string()).into()
            }
            _ => fallback,
        },
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            PublishError::NotConnected.into()
        }
        _ => fallback,
    }
}

fn to_field_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in headers {
        btree.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    FieldTable::from(btree)
}

fn from_field_table(table: &Option<FieldTable>) -> HashMap<String, String> {
    let Some(table) = table else {
        return HashMap::default();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| error!("Error decoding header value {:?}", e))
                .ok()
                .map(|value| (key.as_str().to_owned(), value.to_owned())),
            AMQPValue::ShortString(value) => {
                Some((key.as_str().to_owned(), value.as_str().to_owned()))
            }
            _ => None,
        })
        .collect()
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        kind: delivery.properties.kind().as_ref().map(|k| k.as_str().to_owned()),
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned()),
        headers: from_field_table(delivery.properties.headers()),
        data: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_connected(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(classify(
                    &err,
                    AmqpError::DeclareExchangeError(def.name.clone()),
                ))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let name = def.name.clone().unwrap_or_default();
        debug!("creating queue: {:?}", def.key());

        match self
            .channel
            .queue_declare(
                &name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to declare the queue");
                Err(classify(&err, AmqpError::DeclareQueueError(name)))
            }
            Ok(queue) => {
                let declared = queue.name().as_str().to_owned();
                debug!("queue: {} was created", declared);
                Ok(declared)
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(classify(
                    &err,
                    AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned()),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        if msg.mandatory && !self.confirms {
            error!(
                exchange = %msg.exchange,
                routing_key = %msg.routing_key,
                "mandatory publish needs publisher confirms to observe returns"
            );
            return Err(AmqpError::PublishingError(
                "mandatory publish requires publisher confirms".to_owned(),
            ));
        }

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(msg.content_type.clone()))
            .with_message_id(ShortString::from(msg.message_id.clone()))
            .with_headers(to_field_table(&msg.headers));
        if let Some(kind) = &msg.kind {
            properties = properties.with_kind(ShortString::from(kind.clone()));
        }

        let confirm = match self
            .channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: msg.mandatory,
                },
                &msg.data,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(classify(&err, AmqpError::PublishingError(err.to_string())))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        let confirmation = confirm.await.map_err(|err| {
            error!(error = err.to_string(), "error awaiting publisher confirm");
            classify(&err, AmqpError::PublishingError(err.to_string()))
        })?;

        match confirmation {
            Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => {
                Err(PublishError::Unroutable {
                    exchange: msg.exchange.clone(),
                    routing_key: msg.routing_key.clone(),
                }
                .into())
            }
            Confirmation::Nack(None) => {
                Err(AmqpError::PublishingError("broker nacked the message".to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        ack_mode: AckMode,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: ack_mode == AckMode::Auto,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(classify(
                    &err,
                    AmqpError::ConsumerDeclarationError(queue.to_owned()),
                ))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(into_delivery)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::NackMessageError
            })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to cancel the consumer");
                AmqpError::ConsumerError(err.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_round_trip_through_field_table() {
        let headers = BTreeMap::from([("traceparent".to_owned(), "00-abc-01".to_owned())]);
        let table = to_field_table(&headers);
        let back = from_field_table(&Some(table));
        assert_eq!(back.get("traceparent").map(String::as_str), Some("00-abc-01"));
        assert!(from_field_table(&None).is_empty());
    }

    #[test]
    fn non_string_headers_are_skipped() {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        btree.insert(ShortString::from("count"), AMQPValue::LongLongInt(3));
        btree.insert(
            ShortString::from("kind"),
            AMQPValue::ShortString(ShortString::from("greeting")),
        );
        let back = from_field_table(&Some(FieldTable::from(btree)));
        assert_eq!(back.len(), 1);
        assert_eq!(back.get("kind").map(String::as_str), Some("greeting"));
    }

    #[test]
    fn closed_channel_maps_to_not_connected() {
        let err = lapin::Error::InvalidChannelState(lapin::ChannelState::Closed);
        assert_eq!(
            classify(&err, AmqpError::InternalError),
            AmqpError::Publish(PublishError::NotConnected)
        );
    }
}
