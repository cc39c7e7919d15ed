// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Handlers
//!
//! `ConsumerHandler` is invoked once per delivery and reports an `Outcome`.
//! Two handlers ship with the crate: `LogMessageHandler`, which decodes and
//! logs a `Message`, and `DelayedHandler`, which wraps another handler and
//! simulates slow downstream work.

use crate::{codec, message::Delivery, message::Message};
use async_trait::async_trait;
use opentelemetry::Context;
use std::time::Duration;
use tracing::{error, info};

/// What the consumer should do with a delivery once its handler returns.
///
/// Only meaningful in manual acknowledgment mode; in auto mode the broker has
/// already dropped the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    /// Return the message to the queue for redelivery
    Requeue,
    /// Drop the message
    Reject,
}

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Outcome;
}

/// Decodes deliveries as `Message` and logs them.
///
/// Undecodable payloads are logged and rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMessageHandler;

#[async_trait]
impl ConsumerHandler for LogMessageHandler {
    async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Outcome {
        match codec::decode::<Message>(&delivery.data) {
            Ok(msg) => {
                info!(
                    routing_key = %delivery.routing_key,
                    title = %msg.title,
                    content = %msg.content,
                    "message received"
                );
                Outcome::Ack
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    routing_key = %delivery.routing_key,
                    "discarding undecodable message"
                );
                Outcome::Reject
            }
        }
    }
}

/// Waits `delay` before delegating to the wrapped handler.
pub struct DelayedHandler<H> {
    inner: H,
    delay: Duration,
}

impl<H> DelayedHandler<H> {
    pub fn new(inner: H, delay: Duration) -> DelayedHandler<H> {
        DelayedHandler { inner, delay }
    }
}

#[async_trait]
impl<H: ConsumerHandler> ConsumerHandler for DelayedHandler<H> {
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Outcome {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.exec(ctx, delivery).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn delivery(data: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: "topic_exchange".to_owned(),
            routing_key: "greeting.message".to_owned(),
            redelivered: false,
            kind: None,
            message_id: None,
            headers: HashMap::new(),
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn logs_valid_messages_and_rejects_garbage() {
        let ok = codec::encode(&Message::new("greeting", "hi")).unwrap();
        assert_eq!(
            LogMessageHandler.exec(&Context::new(), &delivery(&ok)).await,
            Outcome::Ack
        );
        assert_eq!(
            LogMessageHandler
                .exec(&Context::new(), &delivery(b"not json"))
                .await,
            Outcome::Reject
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_handler_waits_before_delegating() {
        let handler = DelayedHandler::new(LogMessageHandler, Duration::from_secs(5));
        let data = codec::encode(&Message::new("bye", "later")).unwrap();

        let started = tokio::time::Instant::now();
        let outcome = handler.exec(&Context::new(), &delivery(&data)).await;
        assert_eq!(outcome, Outcome::Ack);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
