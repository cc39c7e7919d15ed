// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Types
//!
//! The demo payload published by the HTTP surface, plus the broker-neutral
//! shapes of an outgoing publish and an incoming delivery.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Payload exchanged between the producer and the consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub title: String,
    pub content: String,
}

impl Message {
    pub fn new(title: &str, content: &str) -> Message {
        Message {
            title: title.to_owned(),
            content: content.to_owned(),
        }
    }
}

/// A message ready to be handed to a broker channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub mandatory: bool,
    pub kind: Option<String>,
    pub message_id: String,
    pub content_type: String,
    pub headers: BTreeMap<String, String>,
}

impl OutboundMessage {
    pub fn new(exchange: &str, routing_key: &str, data: &[u8]) -> OutboundMessage {
        OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: data.to_vec(),
            mandatory: false,
            kind: None,
            message_id: Uuid::new_v4().to_string(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            headers: BTreeMap::default(),
        }
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub headers: HashMap<String, String>,
    pub data: Vec<u8>,
}
