//! The two hand-off buffers of the turn pipeline.
//!
//! [`UtteranceQueue`] sits between the capture thread and the dispatcher and
//! drops the oldest utterance on overflow. [`ReplyQueue`] sits between the
//! turn workers and the speaker loop, holds at most one reply, and replaces
//! any unconsumed reply with the newer one.
//!
//! Both expose a synchronous push (callable from non-async audio threads) and
//! an async pop.

use crate::pipeline::lock;
use crate::pipeline::messages::{ReplyItem, Utterance};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Result of pushing into the utterance queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    DroppedOldest,
}

struct UtteranceQueueInner {
    capacity: usize,
    items: Mutex<VecDeque<Utterance>>,
    notify: Notify,
}

/// Bounded utterance buffer with drop-oldest overflow.
#[derive(Clone)]
pub struct UtteranceQueue {
    inner: Arc<UtteranceQueueInner>,
}

impl UtteranceQueue {
    /// Create a queue holding at most `capacity` utterances (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(UtteranceQueueInner {
                capacity,
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueue without blocking, evicting the oldest entry when full.
    pub fn push(&self, utterance: Utterance) -> PushOutcome {
        let outcome = {
            let mut items = lock(&self.inner.items);
            let outcome = if items.len() >= self.inner.capacity {
                let _ = items.pop_front();
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Enqueued
            };
            items.push_back(utterance);
            outcome
        };
        self.inner.notify.notify_one();
        outcome
    }

    /// Wait until an utterance is available and take it.
    pub async fn pop(&self) -> Utterance {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(utterance) = self.try_pop() {
                return utterance;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<Utterance> {
        lock(&self.inner.items).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

struct ReplyQueueInner {
    slot: Mutex<Option<ReplyItem>>,
    notify: Notify,
}

/// Single-slot reply buffer: the newest reply always wins.
#[derive(Clone)]
pub struct ReplyQueue {
    inner: Arc<ReplyQueueInner>,
}

impl Default for ReplyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ReplyQueueInner {
                slot: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Store `item`, returning the unconsumed reply it displaced, if any.
    pub fn replace(&self, item: ReplyItem) -> Option<ReplyItem> {
        let displaced = lock(&self.inner.slot).replace(item);
        self.inner.notify.notify_one();
        displaced
    }

    /// Wait for the next reply and take it.
    pub async fn pop(&self) -> ReplyItem {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(item) = self.take() {
                return item;
            }
            notified.await;
        }
    }

    pub fn take(&self) -> Option<ReplyItem> {
        lock(&self.inner.slot).take()
    }

    /// Number of unconsumed replies (0 or 1).
    pub fn len(&self) -> usize {
        usize::from(lock(&self.inner.slot).is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
