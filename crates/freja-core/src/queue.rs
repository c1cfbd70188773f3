// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use freja_config::QueueMode;
use freja_model::Message;

/// Thread-safe FIFO queue for steering and follow-up injections.
///
/// Enqueueing is non-blocking and safe from any thread; this is one of the
/// few surfaces shared with code running outside the agent loop.
#[derive(Default)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<Message>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        self.inner.lock().unwrap().push_back(message);
    }

    /// Dequeue according to `mode`: at most one message, or the whole queue.
    pub fn poll(&self, mode: QueueMode) -> Vec<Message> {
        let mut q = self.inner.lock().unwrap();
        match mode {
            QueueMode::OneAtATime => q.pop_front().into_iter().collect(),
            QueueMode::All => q.drain(..).collect(),
        }
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
