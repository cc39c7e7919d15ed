// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Relay
//!
//! This module provides the error types returned by topology declaration,
//! publishing, consuming and payload (de)serialization. `AmqpError` is the
//! crate-wide error; topology and publish failures that callers are expected
//! to match on are grouped in `TopologyError` and `PublishError`.

use thiserror::Error;

/// Failures raised while declaring or binding broker resources.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// A resource already exists with different parameters
    #[error("conflicting declaration: {0}")]
    Conflict(String),

    /// A binding or publish referenced an exchange or queue that does not exist
    #[error("missing resource: {0}")]
    MissingResource(String),

    /// The topology description itself is malformed
    #[error("invalid topology: {0}")]
    Invalid(String),
}

/// Failures surfaced per publish call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// There is no live channel to the broker
    #[error("not connected to the broker")]
    NotConnected,

    /// Mandatory delivery was requested and no queue matched
    #[error("message to exchange `{exchange}` with key `{routing_key}` is unroutable")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant provides specific context about what operation failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error encoding or decoding a message payload
    #[error("failure to (de)serialize payload: {0}")]
    SerializationError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl From<serde_json::Error> for AmqpError {
    fn from(err: serde_json::Error) -> Self {
        AmqpError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_errors_convert_and_display() {
        let err: AmqpError = TopologyError::MissingResource("queue `q`".to_owned()).into();
        assert_eq!(err.to_string(), "missing resource: queue `q`");

        let err: AmqpError = PublishError::Unroutable {
            exchange: "ex".to_owned(),
            routing_key: "a.b".to_owned(),
        }
        .into();
        assert!(matches!(
            err,
            AmqpError::Publish(PublishError::Unroutable { .. })
        ));
        assert!(err.to_string().contains("`a.b`"));
    }

    #[test]
    fn binding_error_names_both_sides() {
        let err = AmqpError::BindingExchangeToQueueError("ex".to_owned(), "q".to_owned());
        assert_eq!(
            err.to_string(),
            "failure to binding exchange `ex` to queue `q`"
        );
    }
}
