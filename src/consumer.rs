// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module subscribes a `ConsumerHandler` to a queue. The delivery loop
//! hands each delivery to a spawned task so a slow handler never stalls the
//! stream; at most `max_in_flight` handlers run at once and they start in the
//! order the broker delivered. Each delivery gets an OpenTelemetry consumer
//! span parented on the context propagated in its headers.
//!
//! In auto-ack mode the broker drops a message as soon as it is delivered, so
//! a failing handler loses it. Manual mode settles each delivery according to
//! the handler's `Outcome`.

use crate::{
    broker::{AckMode, BrokerChannel, DeliveryStream},
    errors::AmqpError,
    handler::{ConsumerHandler, Outcome},
    message::Delivery,
    otel,
};
use futures_util::StreamExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::{sync::Semaphore, task::JoinHandle, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What happens to running handlers when a subscription shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Let in-flight handlers finish
    #[default]
    Drain,
    /// Abort in-flight handlers; unsettled manual-ack deliveries return to the
    /// queue when the channel closes
    Abandon,
}

/// Parameters of one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub queue: String,
    pub ack_mode: AckMode,
    pub consumer_tag: String,
    pub max_in_flight: usize,
    /// Broker-side prefetch, applied in manual mode when non-zero
    pub prefetch: u16,
    pub shutdown: ShutdownMode,
}

impl Subscription {
    /// Auto-ack subscription to `queue` with a unique consumer tag and one
    /// handler at a time.
    pub fn new(queue: &str) -> Subscription {
        Subscription {
            queue: queue.to_owned(),
            ack_mode: AckMode::Auto,
            consumer_tag: format!("amqp-relay-{}", Uuid::new_v4()),
            max_in_flight: 1,
            prefetch: 0,
            shutdown: ShutdownMode::Drain,
        }
    }

    pub fn ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = mode;
        self
    }

    pub fn manual_ack(self) -> Self {
        self.ack_mode(AckMode::Manual)
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_owned();
        self
    }

    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn shutdown(mut self, mode: ShutdownMode) -> Self {
        self.shutdown = mode;
        self
    }
}

/// A running subscription.
pub struct SubscriptionHandle {
    consumer_tag: String,
    mode: ShutdownMode,
    channel: Arc<dyn BrokerChannel>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Stops the subscription.
    ///
    /// The broker consumer is cancelled first so no new deliveries arrive. In
    /// drain mode the loop then finishes whatever was already delivered; in
    /// abandon mode (or when the broker cancel fails) the loop stops at once.
    pub async fn shutdown(self) -> Result<(), AmqpError> {
        info!(consumer_tag = %self.consumer_tag, "shutting down consumer");

        let cancelled = self.channel.cancel(&self.consumer_tag).await;
        if cancelled.is_err() || self.mode == ShutdownMode::Abandon {
            self.token.cancel();
        }

        self.task
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))?;

        cancelled
    }

    /// Resolves once the delivery stream ends, e.g. the broker cancelled the
    /// consumer or the channel closed, and in-flight handlers completed.
    pub async fn wait(self) -> Result<(), AmqpError> {
        self.task
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }
}

/// Starts consuming `subscription.queue`, invoking `handler` per delivery.
pub async fn subscribe(
    channel: Arc<dyn BrokerChannel>,
    subscription: Subscription,
    handler: Arc<dyn ConsumerHandler>,
) -> Result<SubscriptionHandle, AmqpError> {
    if subscription.ack_mode == AckMode::Manual && subscription.prefetch > 0 {
        channel.qos(subscription.prefetch).await?;
    }

    let stream = channel
        .consume(
            &subscription.queue,
            &subscription.consumer_tag,
            subscription.ack_mode,
        )
        .await?;

    info!(
        queue = %subscription.queue,
        consumer_tag = %subscription.consumer_tag,
        ack_mode = ?subscription.ack_mode,
        "waiting for messages"
    );

    let token = CancellationToken::new();
    let task = tokio::spawn(run(
        channel.clone(),
        stream,
        subscription.clone(),
        handler,
        token.clone(),
    ));

    Ok(SubscriptionHandle {
        consumer_tag: subscription.consumer_tag,
        mode: subscription.shutdown,
        channel,
        token,
        task,
    })
}

async fn run(
    channel: Arc<dyn BrokerChannel>,
    mut stream: DeliveryStream,
    subscription: Subscription,
    handler: Arc<dyn ConsumerHandler>,
    token: CancellationToken,
) {
    let limiter = Arc::new(Semaphore::new(subscription.max_in_flight.max(1)));
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => break,

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(err) = joined {
                    if err.is_panic() {
                        error!(error = err.to_string(), "handler panicked");
                    }
                }
            }

            next = stream.next() => {
                let delivery = match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "errors consume msg");
                        continue;
                    }
                    None => {
                        debug!(queue = %subscription.queue, "delivery stream ended");
                        break;
                    }
                };

                let permit = tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        release(channel.as_ref(), &delivery, subscription.ack_mode).await;
                        break;
                    }
                    permit = limiter.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let channel = channel.clone();
                let handler = handler.clone();
                let ack_mode = subscription.ack_mode;
                in_flight.spawn(async move {
                    let _permit = permit;
                    process(channel, handler, delivery, ack_mode).await;
                });
            }
        }
    }

    if token.is_cancelled() && subscription.shutdown == ShutdownMode::Abandon {
        warn!(
            abandoned = in_flight.len(),
            "abandoning in-flight handlers"
        );
        in_flight.abort_all();
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                error!(error = err.to_string(), "handler panicked");
            }
        }
    }

    debug!(queue = %subscription.queue, "consumer stopped");
}

/// Gives back a delivery that was received but will not be handled.
async fn release(channel: &dyn BrokerChannel, delivery: &Delivery, ack_mode: AckMode) {
    match ack_mode {
        AckMode::Manual => {
            if let Err(err) = channel.nack(delivery.delivery_tag, true).await {
                error!(error = err.to_string(), "error whiling requeuing");
            }
        }
        AckMode::Auto => warn!(
            delivery_tag = delivery.delivery_tag,
            "message delivered during shutdown was dropped"
        ),
    }
}

/// Runs the handler for one delivery and settles it.
async fn process(
    channel: Arc<dyn BrokerChannel>,
    handler: Arc<dyn ConsumerHandler>,
    delivery: Delivery,
    ack_mode: AckMode,
) {
    let tracer = global::tracer("amqp consumer");
    let (ctx, mut span) = otel::new_span(&delivery.headers, &tracer, &delivery.routing_key);

    debug!(
        "received: {} - exchange: {}",
        delivery.routing_key, delivery.exchange
    );

    let outcome = handler.exec(&ctx, &delivery).await;

    if ack_mode == AckMode::Auto {
        if outcome == Outcome::Ack {
            span.set_status(Status::Ok);
        } else {
            warn!(
                ?outcome,
                "handler failed but the message was already acknowledged on delivery"
            );
            span.set_status(Status::error("handler failure"));
        }
        return;
    }

    let settled = match outcome {
        Outcome::Ack => channel.ack(delivery.delivery_tag).await,
        Outcome::Requeue => {
            warn!("error whiling handling msg, requeuing for latter");
            channel.nack(delivery.delivery_tag, true).await
        }
        Outcome::Reject => channel.reject(delivery.delivery_tag, false).await,
    };

    match settled {
        Err(err) => {
            error!(error = err.to_string(), ?outcome, "error whiling settling msg");
            span.record_error(&err);
            span.set_status(Status::error("error to settle msg"));
        }
        Ok(()) if outcome == Outcome::Ack => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
        }
        Ok(()) => span.set_status(Status::error("handler failure")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerChannel;
    use async_trait::async_trait;
    use futures_util::stream;
    use opentelemetry::Context;
    use std::collections::HashMap;

    struct Fixed(Outcome);

    #[async_trait]
    impl ConsumerHandler for Fixed {
        async fn exec(&self, _ctx: &Context, _delivery: &Delivery) -> Outcome {
            self.0
        }
    }

    fn delivery(tag: u64) -> Delivery {
        Delivery {
            delivery_tag: tag,
            exchange: String::new(),
            routing_key: "message_queue".to_owned(),
            redelivered: false,
            kind: None,
            message_id: None,
            headers: HashMap::new(),
            data: b"{}".to_vec(),
        }
    }

    fn one_delivery_mock(tag: u64) -> MockBrokerChannel {
        let mut mock = MockBrokerChannel::new();
        mock.expect_consume().times(1).returning(move |_, _, _| {
            Ok(stream::iter(vec![Ok::<_, AmqpError>(delivery(tag))]).boxed())
        });
        mock
    }

    #[tokio::test]
    async fn manual_outcomes_map_to_broker_settlements() {
        let mut mock = one_delivery_mock(7);
        mock.expect_reject()
            .withf(|tag, requeue| *tag == 7 && !*requeue)
            .times(1)
            .returning(|_, _| Ok(()));
        let handle = subscribe(
            Arc::new(mock),
            Subscription::new("message_queue").manual_ack(),
            Arc::new(Fixed(Outcome::Reject)),
        )
        .await
        .unwrap();
        handle.wait().await.unwrap();

        let mut mock = one_delivery_mock(8);
        mock.expect_nack()
            .withf(|tag, requeue| *tag == 8 && *requeue)
            .times(1)
            .returning(|_, _| Ok(()));
        let handle = subscribe(
            Arc::new(mock),
            Subscription::new("message_queue").manual_ack(),
            Arc::new(Fixed(Outcome::Requeue)),
        )
        .await
        .unwrap();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn auto_ack_never_settles() {
        let mut mock = one_delivery_mock(1);
        mock.expect_ack().never();
        mock.expect_nack().never();
        mock.expect_reject().never();

        let handle = subscribe(
            Arc::new(mock),
            Subscription::new("message_queue"),
            Arc::new(Fixed(Outcome::Reject)),
        )
        .await
        .unwrap();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn prefetch_applies_only_in_manual_mode() {
        let mut mock = MockBrokerChannel::new();
        mock.expect_qos()
            .withf(|prefetch| *prefetch == 5)
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_consume()
            .returning(|_, _, _| Ok(stream::empty::<Result<Delivery, AmqpError>>().boxed()));

        let handle = subscribe(
            Arc::new(mock),
            Subscription::new("q").manual_ack().prefetch(5),
            Arc::new(Fixed(Outcome::Ack)),
        )
        .await
        .unwrap();
        handle.wait().await.unwrap();

        let mut mock = MockBrokerChannel::new();
        mock.expect_qos().never();
        mock.expect_consume()
            .returning(|_, _, _| Ok(stream::empty::<Result<Delivery, AmqpError>>().boxed()));
        let handle = subscribe(
            Arc::new(mock),
            Subscription::new("q").prefetch(5),
            Arc::new(Fixed(Outcome::Ack)),
        )
        .await
        .unwrap();
        handle.wait().await.unwrap();
    }

    #[test]
    fn in_flight_is_at_least_one() {
        assert_eq!(Subscription::new("q").max_in_flight(0).max_in_flight, 1);
    }
}
