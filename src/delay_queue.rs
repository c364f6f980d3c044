// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded priority queue of messages awaiting redelivery.
//!
//! Each consumer worker owns one [`DelayQueue`]. A transiently failed message
//! is parked here with an ETA; the worker loop drains ready messages and
//! republishes them to its own queue.
//!
//! Ordering is `(eta, arrival sequence)` ascending, so messages with equal
//! ETAs come out in the order they were put.
//!
//! ```text
//!   put(m, eta=t+2) ─┐
//!   put(m, eta=t+0) ─┼──► [ (t+0,#1) (t+1,#2) (t+2,#0) (t+3600,#3) ]
//!   put(m, eta=t+1) ─┘            │
//!                                 ▼ drain_ready(now = t+1)
//!                          (t+0,#1) (t+1,#2)
//! ```

use crate::envelope::Envelope;
use crate::error::ReplicationError;
use crate::transport::DeliveryHandle;
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// A message parked until its ETA.
#[derive(Debug, Clone)]
pub struct DelayedMessage {
    /// Broker handle of the original delivery, nacked once the message is requeued.
    pub delivery: DeliveryHandle,
    pub envelope: Envelope,
    pub eta: DateTime<Utc>,
    /// Arrival sequence, assigned by [`DelayQueue::put`].
    pub seq: u64,
}

impl DelayedMessage {
    pub fn new(delivery: DeliveryHandle, envelope: Envelope, eta: DateTime<Utc>) -> Self {
        Self {
            delivery,
            envelope,
            eta,
            seq: 0,
        }
    }

    pub fn ordering_key(&self) -> (DateTime<Utc>, u64) {
        (self.eta, self.seq)
    }
}

/// Rejected `put`: the queue already holds `max_size` messages.
///
/// The message is handed back so the caller can decide what to do with it.
#[derive(Debug, Error)]
#[error("delay queue at capacity ({max_size} messages)")]
pub struct QueueFull {
    pub max_size: usize,
    pub message: Box<DelayedMessage>,
}

impl From<QueueFull> for ReplicationError {
    fn from(e: QueueFull) -> Self {
        ReplicationError::CapacityExceeded {
            max_size: e.max_size,
        }
    }
}

struct Queued(DelayedMessage);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.0.ordering_key() == other.0.ordering_key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.ordering_key().cmp(&other.0.ordering_key())
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Reverse<Queued>>,
    next_seq: u64,
}

/// Thread-safe min-heap of [`DelayedMessage`]s keyed by `(eta, seq)`.
pub struct DelayQueue {
    inner: Mutex<Inner>,
    max_size: Option<usize>,
}

impl DelayQueue {
    /// Create a queue. `None` means unbounded.
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the heap half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Insert a message, assigning its arrival sequence.
    pub fn put(&self, mut message: DelayedMessage) -> Result<(), QueueFull> {
        let mut inner = self.lock();
        if let Some(max_size) = self.max_size {
            if inner.heap.len() >= max_size {
                return Err(QueueFull {
                    max_size,
                    message: Box::new(message),
                });
            }
        }
        message.seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Reverse(Queued(message)));
        Ok(())
    }

    /// Remove and return the message with the smallest `(eta, seq)`.
    pub fn pop_earliest(&self) -> Option<DelayedMessage> {
        self.lock().heap.pop().map(|Reverse(Queued(m))| m)
    }

    /// Iterate over messages whose ETA has passed, removing them in order.
    ///
    /// Stops at the first message still in the future.
    pub fn drain_ready(&self, now: DateTime<Utc>) -> DrainReady<'_> {
        DrainReady { queue: self, now }
    }

    /// ETA of the earliest message, if any.
    pub fn next_eta(&self) -> Option<DateTime<Utc>> {
        self.lock().heap.peek().map(|Reverse(Queued(m))| m.eta)
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    /// Discard everything. Returns how many messages were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let dropped = inner.heap.len();
        inner.heap.clear();
        dropped
    }
}

impl std::fmt::Debug for DelayQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayQueue")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

/// Iterator returned by [`DelayQueue::drain_ready`].
///
/// Takes the lock per item so no guard is held across the caller's awaits.
pub struct DrainReady<'a> {
    queue: &'a DelayQueue,
    now: DateTime<Utc>,
}

impl Iterator for DrainReady<'_> {
    type Item = DelayedMessage;

    fn next(&mut self) -> Option<Self::Item> {
        let mut inner = self.queue.lock();
        match inner.heap.peek() {
            Some(Reverse(Queued(m))) if m.eta <= self.now => {
                inner.heap.pop().map(|Reverse(Queued(m))| m)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{InstanceData, SignalType};
    use chrono::Duration as ChronoDuration;

    fn message(tag: &str, eta: DateTime<Utc>) -> DelayedMessage {
        DelayedMessage::new(
            DeliveryHandle::new("queue", tag),
            Envelope::new(SignalType::Save, "author", InstanceData::new()),
            eta,
        )
    }

    #[test]
    fn test_pop_follows_eta_order() {
        let t = Utc::now();
        let queue = DelayQueue::new(None);
        for (tag, offset) in [("a", 1), ("b", 0), ("c", 3600), ("d", 2)] {
            queue.put(message(tag, t + ChronoDuration::seconds(offset))).unwrap();
        }

        let order: Vec<String> = std::iter::from_fn(|| queue.pop_earliest())
            .map(|m| m.delivery.tag)
            .collect();
        assert_eq!(order, vec!["b", "a", "d", "c"]);
    }

    #[test]
    fn test_drain_ready_stops_at_future() {
        let t = Utc::now();
        let queue = DelayQueue::new(None);
        for (tag, offset) in [("a", 1), ("b", 0), ("c", 3600), ("d", 2)] {
            queue.put(message(tag, t + ChronoDuration::seconds(offset))).unwrap();
        }

        let ready: Vec<String> = queue
            .drain_ready(t + ChronoDuration::seconds(2))
            .map(|m| m.delivery.tag)
            .collect();
        assert_eq!(ready, vec!["b", "a", "d"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_eta(), Some(t + ChronoDuration::seconds(3600)));
    }

    #[test]
    fn test_equal_eta_is_fifo() {
        let t = Utc::now();
        let queue = DelayQueue::new(None);
        for tag in ["first", "second", "third"] {
            queue.put(message(tag, t)).unwrap();
        }

        let order: Vec<String> = queue.drain_ready(t).map(|m| m.delivery.tag).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_capacity_rejects_and_returns_message() {
        let t = Utc::now();
        let queue = DelayQueue::new(Some(2));
        queue.put(message("a", t)).unwrap();
        queue.put(message("b", t)).unwrap();

        let err = queue.put(message("c", t)).unwrap_err();
        assert_eq!(err.max_size, 2);
        assert_eq!(err.message.delivery.tag, "c");
        assert_eq!(queue.len(), 2);

        let converted: ReplicationError = err.into();
        assert!(matches!(converted, ReplicationError::CapacityExceeded { max_size: 2 }));
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let queue = DelayQueue::new(Some(0));
        assert!(queue.put(message("a", Utc::now())).is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_empty_returns_none() {
        let queue = DelayQueue::new(Some(10));
        assert!(queue.pop_earliest().is_none());
        assert!(queue.next_eta().is_none());
        assert_eq!(queue.drain_ready(Utc::now()).count(), 0);
    }

    #[test]
    fn test_clear_reports_dropped() {
        let queue = DelayQueue::new(None);
        queue.put(message("a", Utc::now())).unwrap();
        queue.put(message("b", Utc::now())).unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_sequence_assigned_on_put() {
        let queue = DelayQueue::new(None);
        let t = Utc::now();
        queue.put(message("a", t)).unwrap();
        queue.put(message("b", t)).unwrap();
        let first = queue.pop_earliest().unwrap();
        let second = queue.pop_earliest().unwrap();
        assert!(first.ordering_key() < second.ordering_key());
    }
}
