// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module publishes payloads to exchanges through a `BrokerChannel`,
//! propagating OpenTelemetry context in the message headers.
//!
//! Publishing is non-mandatory by default: a message no queue matches is
//! silently dropped by the broker. Callers that need to know must set
//! `PublishOptions::mandatory` and handle `PublishError::Unroutable`.

use crate::{
    broker::BrokerChannel,
    codec,
    errors::{AmqpError, PublishError},
    message::OutboundMessage,
    otel,
};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Per-call publish settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Fail with `PublishError::Unroutable` when no queue matches
    pub mandatory: bool,
    /// Value of the AMQP `type` property
    pub kind: Option<String>,
}

impl PublishOptions {
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }
}

/// Publishes messages over a shared broker channel.
///
/// One publish (and its confirmation) is in flight at a time.
pub struct Publisher {
    channel: Arc<dyn BrokerChannel>,
    lock: Mutex<()>,
}

impl Publisher {
    /// Creates a new publisher.
    ///
    /// # Returns
    /// An Arc-wrapped Publisher instance for thread-safe sharing
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Arc<Publisher> {
        Arc::new(Publisher {
            channel,
            lock: Mutex::new(()),
        })
    }

    /// Publishes raw bytes to `exchange` with `routing_key`.
    ///
    /// # Errors
    /// * `PublishError::NotConnected` when the channel is not live
    /// * `PublishError::Unroutable` when mandatory and nothing matched
    /// * `TopologyError::MissingResource` when the exchange does not exist
    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        if !self.channel.is_connected() {
            error!(exchange, routing_key, "no live channel to publish on");
            return Err(PublishError::NotConnected.into());
        }

        let mut msg = OutboundMessage::new(exchange, routing_key, payload);
        msg.mandatory = options.mandatory;
        msg.kind = options.kind.clone();
        otel::inject_context(ctx, &mut msg.headers);

        let _guard = self.lock.lock().await;
        match self.channel.publish(&msg).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                );
                Err(err)
            }
            Ok(()) => {
                debug!(
                    exchange,
                    routing_key,
                    message_id = %msg.message_id,
                    "message published"
                );
                Ok(())
            }
        }
    }

    /// Serializes `payload` as JSON and publishes it.
    pub async fn publish_message<M: Serialize + Sync>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &M,
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let data = codec::encode(payload)?;
        self.publish(ctx, exchange, routing_key, &data, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::MockBrokerChannel, message::Message};

    #[tokio::test]
    async fn refuses_to_publish_without_connection() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_is_connected().return_const(false);
        mock.expect_publish().never();

        let publisher = Publisher::new(Arc::new(mock));
        let err = publisher
            .publish(
                &Context::new(),
                "topic_exchange",
                "greeting.message",
                b"{}",
                &PublishOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::Publish(PublishError::NotConnected));
    }

    #[tokio::test]
    async fn builds_outbound_message() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_is_connected().return_const(true);
        mock.expect_publish()
            .withf(|msg| {
                msg.exchange == "topic_exchange"
                    && msg.routing_key == "bye.message"
                    && msg.mandatory
                    && msg.kind.as_deref() == Some("bye")
                    && msg.content_type == "application/json"
                    && !msg.message_id.is_empty()
                    && serde_json::from_slice::<Message>(&msg.data).is_ok()
            })
            .times(1)
            .returning(|_| Ok(()));

        let publisher = Publisher::new(Arc::new(mock));
        publisher
            .publish_message(
                &Context::new(),
                "topic_exchange",
                "bye.message",
                &Message::new("bye", "see you"),
                &PublishOptions::default().mandatory().kind("bye"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn broker_errors_are_surfaced() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_is_connected().return_const(true);
        mock.expect_publish().returning(|msg| {
            Err(PublishError::Unroutable {
                exchange: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
            }
            .into())
        });

        let publisher = Publisher::new(Arc::new(mock));
        let err = publisher
            .publish(
                &Context::new(),
                "direct_exchange",
                "route9",
                b"x",
                &PublishOptions::default().mandatory(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AmqpError::Publish(PublishError::Unroutable { .. })
        ));
    }
}
