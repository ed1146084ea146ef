//! Bounded outbound message queue with retry bookkeeping.

use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use pulse_core::events::WireMessage;

/// Linear retry backoff step: a failed attempt waits `attempts * 1000ms`.
const RETRY_BACKOFF_STEP_MS: i64 = 1_000;

/// A message waiting for (re)delivery.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: WireMessage,
    pub attempts: u32,
    pub next_retry: DateTime<Utc>,
    pub max_retries: u32,
}

/// Bounded FIFO with oldest-first eviction. Draining for retry follows
/// `(next_retry ascending, insertion order)`; draining for a post-connect
/// flush follows `(priority descending, age ascending)`.
pub struct MessageQueue {
    entries: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue a message, evicting and returning the oldest entry when the
    /// queue is at capacity.
    pub fn push(&mut self, message: WireMessage, max_retries: u32) -> Option<QueuedMessage> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(QueuedMessage {
            message,
            attempts: 0,
            next_retry: Utc::now(),
            max_retries,
        });
        evicted
    }

    /// Remove the entry matching an acknowledged message id.
    pub fn ack(&mut self, message_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.message.id != message_id);
        before != self.entries.len()
    }

    /// Take every entry due for a retry at `now`.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<QueuedMessage> {
        let mut due = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.next_retry <= now {
                due.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        // Stable sort: ties on next_retry keep insertion order.
        due.sort_by_key(|entry| entry.next_retry);
        due
    }

    /// Take everything for the post-connect flush, highest priority first,
    /// oldest first within a priority.
    pub fn drain_for_flush(&mut self) -> Vec<QueuedMessage> {
        let mut all: Vec<QueuedMessage> = self.entries.drain(..).collect();
        all.sort_by(|a, b| {
            b.message
                .priority()
                .cmp(&a.message.priority())
                .then(a.message.timestamp.cmp(&b.message.timestamp))
        });
        all
    }

    /// Put a failed attempt back with linear backoff, or report exhaustion.
    /// Returns `false` when the entry is dropped (retries exhausted).
    pub fn requeue_failed(&mut self, mut entry: QueuedMessage) -> bool {
        entry.attempts += 1;
        if entry.attempts >= entry.max_retries {
            return false;
        }
        entry.next_retry =
            Utc::now() + ChronoDuration::milliseconds(entry.attempts as i64 * RETRY_BACKOFF_STEP_MS);
        self.entries.push_back(entry);
        true
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries.iter().any(|entry| entry.message.id == message_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
