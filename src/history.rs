// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Process-local record of published messages.
//!
//! Informational only: it is bounded, starts empty on every run and is not a
//! system of record.

use crate::message::Message;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

/// Store for messages the producer has published.
pub trait MessageStore: Send + Sync {
    fn record(&self, msg: Message);

    /// Recorded messages, oldest first.
    fn list(&self) -> Vec<Message>;
}

/// Bounded FIFO history; once full the oldest entry is evicted.
///
/// A capacity of zero disables recording.
pub struct SentHistory {
    capacity: usize,
    entries: Mutex<VecDeque<Message>>,
}

impl SentHistory {
    pub fn new(capacity: usize) -> Arc<SentHistory> {
        Arc::new(SentHistory {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        })
    }
}

impl MessageStore for SentHistory {
    fn record(&self, msg: Message) {
        if self.capacity == 0 {
            return;
        }

        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(msg);
    }

    fn list(&self) -> Vec<Message> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
