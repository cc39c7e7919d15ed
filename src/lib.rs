// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod codec;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod history;
pub mod http;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod settings;
pub mod topology;
