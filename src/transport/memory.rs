// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process broker.
//!
//! Mirrors the broker semantics the engine relies on: topic fan-out to bound
//! queues, direct delivery via `target_queue`, per-channel unacked tracking
//! (dropped channels give their unacked deliveries back) and dead letters
//! with TTL. Also exposes failure injection for chaos tests.

use super::{BoxFuture, Channel, DeadLetterEntry, DeadLetterStore, Delivery, DeliveryHandle, Subscription, Transport};
use crate::envelope::Envelope;
use crate::error::{ReplicationError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

struct StoredDeadLetter {
    id: u64,
    body: Vec<u8>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    /// entity type -> queues bound to its topic
    bindings: HashMap<String, BTreeSet<String>>,
    queues: HashMap<String, VecDeque<Delivery>>,
    dead: HashMap<String, Vec<StoredDeadLetter>>,
    published: Vec<Envelope>,
    next_tag: u64,
    next_dead_id: u64,
    unavailable: bool,
}

impl State {
    fn check_available(&self, operation: &str) -> Result<()> {
        if self.unavailable {
            return Err(ReplicationError::transport(operation, "broker unavailable"));
        }
        Ok(())
    }

    fn enqueue(&mut self, queue: &str, payload: Vec<u8>) {
        self.next_tag += 1;
        let delivery = Delivery {
            handle: DeliveryHandle::new(queue, self.next_tag.to_string()),
            payload,
        };
        self.queues.entry(queue.to_string()).or_default().push_back(delivery);
    }

    fn prune_dead(&mut self, queue: &str) {
        let now = Instant::now();
        if let Some(letters) = self.dead.get_mut(queue) {
            letters.retain(|l| l.expires_at.map_or(true, |at| at > now));
        }
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, envelope: &Envelope) -> Result<()> {
        let payload = envelope.to_vec()?;
        {
            let mut state = self.lock();
            state.check_available("publish")?;

            match &envelope.target_queue {
                Some(queue) => state.enqueue(queue, payload),
                None => {
                    let queues: Vec<String> = state
                        .bindings
                        .get(&envelope.entity_type)
                        .map(|qs| qs.iter().cloned().collect())
                        .unwrap_or_default();
                    if queues.is_empty() {
                        debug!(entity_type = %envelope.entity_type, "No queue bound, message dropped by broker");
                    }
                    for queue in queues {
                        state.enqueue(&queue, payload.clone());
                    }
                }
            }
            state.published.push(envelope.clone());
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

/// In-memory [`Transport`] and [`DeadLetterStore`].
///
/// Cloning is cheap and shares the underlying broker.
#[derive(Clone)]
pub struct InMemoryTransport {
    shared: Arc<Shared>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Bind a queue to the topics of the given entity types.
    pub fn declare_queue<S: AsRef<str>>(&self, queue: &str, entity_types: &[S]) {
        let mut state = self.shared.lock();
        state.queues.entry(queue.to_string()).or_default();
        for entity_type in entity_types {
            state
                .bindings
                .entry(entity_type.as_ref().to_string())
                .or_default()
                .insert(queue.to_string());
        }
    }

    /// Simulate the broker going away (`true`) or coming back (`false`).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.lock().unavailable = unavailable;
        self.shared.notify.notify_waiters();
    }

    /// Every envelope accepted by `publish`, in order.
    pub fn published(&self) -> Vec<Envelope> {
        self.shared.lock().published.clone()
    }

    /// Messages waiting in a queue (not yet received by any channel).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Push a raw body straight into a queue, bypassing envelope encoding.
    pub fn inject_raw(&self, queue: &str, payload: Vec<u8>) {
        self.shared.lock().enqueue(queue, payload);
        self.shared.notify.notify_waiters();
    }

    /// Store a raw body in a queue's dead-letter area.
    pub fn inject_dead_letter(&self, queue: &str, body: Vec<u8>) {
        let mut state = self.shared.lock();
        state.next_dead_id += 1;
        let letter = StoredDeadLetter {
            id: state.next_dead_id,
            body,
            expires_at: None,
        };
        state.dead.entry(queue.to_string()).or_default().push(letter);
    }
}

impl Transport for InMemoryTransport {
    fn publish<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.shared.publish(envelope) })
    }

    fn open_channel<'a>(&'a self, subscription: &'a Subscription) -> BoxFuture<'a, Box<dyn Channel>> {
        Box::pin(async move {
            self.shared.lock().check_available("open_channel")?;
            self.declare_queue(&subscription.queue, &subscription.entity_types);
            debug!(
                queue = %subscription.queue,
                consumer = %subscription.consumer,
                "Opened in-memory channel"
            );
            Ok(Box::new(MemoryChannel {
                shared: Arc::clone(&self.shared),
                queue: subscription.queue.clone(),
                unacked: BTreeMap::new(),
            }) as Box<dyn Channel>)
        })
    }
}

impl DeadLetterStore for InMemoryTransport {
    fn dead_letter_count<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let mut state = self.shared.lock();
            state.check_available("dead_letter_count")?;
            state.prune_dead(queue);
            Ok(state.dead.get(queue).map_or(0, Vec::len))
        })
    }

    fn dead_letters<'a>(
        &'a self,
        queue: &'a str,
        limit: Option<usize>,
    ) -> BoxFuture<'a, Vec<DeadLetterEntry>> {
        Box::pin(async move {
            let mut state = self.shared.lock();
            state.check_available("dead_letters")?;
            state.prune_dead(queue);
            let letters = state.dead.get(queue).map(Vec::as_slice).unwrap_or_default();
            Ok(letters
                .iter()
                .take(limit.unwrap_or(usize::MAX))
                .map(|l| DeadLetterEntry {
                    id: l.id.to_string(),
                    body: l.body.clone(),
                })
                .collect())
        })
    }

    fn remove_dead_letter<'a>(&'a self, queue: &'a str, id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut state = self.shared.lock();
            state.check_available("remove_dead_letter")?;
            let Some(letters) = state.dead.get_mut(queue) else {
                return Ok(false);
            };
            let before = letters.len();
            letters.retain(|l| l.id.to_string() != id);
            Ok(letters.len() < before)
        })
    }

    fn purge_dead_letters<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let mut state = self.shared.lock();
            state.check_available("purge_dead_letters")?;
            state.prune_dead(queue);
            Ok(state.dead.remove(queue).map_or(0, |l| l.len()))
        })
    }
}

/// Channel over the in-memory broker.
struct MemoryChannel {
    shared: Arc<Shared>,
    queue: String,
    unacked: BTreeMap<u64, Delivery>,
}

impl MemoryChannel {
    fn settle(&mut self, handle: &DeliveryHandle, operation: &str) -> Result<()> {
        self.shared.lock().check_available(operation)?;
        let removed = handle
            .tag
            .parse::<u64>()
            .ok()
            .and_then(|tag| self.unacked.remove(&tag));
        if removed.is_none() {
            trace!(delivery = %handle, operation, "Settled unknown delivery");
        }
        Ok(())
    }
}

impl Channel for MemoryChannel {
    fn receive(&mut self, max: usize, block: Duration) -> BoxFuture<'_, Vec<Delivery>> {
        Box::pin(async move {
            let deadline = Instant::now() + block;
            loop {
                let notified = self.shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let mut state = self.shared.lock();
                    state.check_available("receive")?;
                    if let Some(ready) = state.queues.get_mut(&self.queue) {
                        let take = ready.len().min(max.max(1));
                        let batch: Vec<Delivery> = ready.drain(..take).collect();
                        if !batch.is_empty() {
                            drop(state);
                            for delivery in &batch {
                                if let Ok(tag) = delivery.handle.tag.parse::<u64>() {
                                    self.unacked.insert(tag, delivery.clone());
                                }
                            }
                            return Ok(batch);
                        }
                    }
                }

                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
                }
            }
        })
    }

    fn ack<'a>(&'a mut self, handle: &'a DeliveryHandle) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.settle(handle, "ack") })
    }

    fn nack<'a>(&'a mut self, handle: &'a DeliveryHandle) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.settle(handle, "nack") })
    }

    fn publish<'a>(&'a mut self, envelope: &'a Envelope) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.shared.publish(envelope) })
    }

    fn dead_letter<'a>(
        &'a mut self,
        envelope: &'a Envelope,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let body = envelope.to_vec()?;
            let mut state = self.shared.lock();
            state.check_available("dead_letter")?;
            state.next_dead_id += 1;
            let letter = StoredDeadLetter {
                id: state.next_dead_id,
                body,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            };
            state.dead.entry(self.queue.clone()).or_default().push(letter);
            Ok(())
        })
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if self.unacked.is_empty() {
            return;
        }
        let unacked = std::mem::take(&mut self.unacked);
        let returned = unacked.len();
        {
            let mut state = self.shared.lock();
            let ready = state.queues.entry(self.queue.clone()).or_default();
            for (_, delivery) in unacked.into_iter().rev() {
                ready.push_front(delivery);
            }
        }
        debug!(queue = %self.queue, returned, "Channel closed, unacked deliveries returned");
        self.shared.notify.notify_waiters();
    }
}
