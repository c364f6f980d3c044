// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Abstract publish/subscribe transport.
//!
//! The engine never talks to a broker client directly. Producers publish
//! through [`Transport::publish`]; each consumer worker opens its own
//! [`Channel`] and owns it exclusively for receive, ack, nack, republish and
//! dead-lettering.
//!
//! # Routing
//!
//! - An envelope without `target_queue` is delivered to every queue bound to
//!   its entity type (one copy per replica service).
//! - An envelope with `target_queue` is delivered only to that queue. This is
//!   how retries are requeued to the worker's own queue and how targeted
//!   SYNC re-publication reaches a single replica.
//!
//! # Implementations
//!
//! - [`memory::InMemoryTransport`]: in-process broker for tests and embedding.
//! - [`redis_streams::RedisTransport`]: Redis Streams consumer groups.
//!
//! # Example
//!
//! ```rust,no_run
//! use cqrs_replication::transport::{BoxFuture, Channel, Subscription, Transport};
//! use cqrs_replication::envelope::Envelope;
//!
//! struct NullTransport;
//!
//! impl Transport for NullTransport {
//!     fn publish<'a>(&'a self, _envelope: &'a Envelope) -> BoxFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn open_channel<'a>(&'a self, _sub: &'a Subscription) -> BoxFuture<'a, Box<dyn Channel>> {
//!         Box::pin(async { Err(cqrs_replication::ReplicationError::transport("open", "unsupported")) })
//!     }
//! }
//! ```

pub mod memory;
pub mod redis_streams;

use crate::envelope::Envelope;
use crate::error::Result;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Type alias for boxed async futures (keeps trait signatures readable).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Identifies one broker delivery for ack/nack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryHandle {
    /// Where the delivery came from (queue or stream key).
    pub source: String,
    /// Broker-assigned delivery tag.
    pub tag: String,
}

impl DeliveryHandle {
    pub fn new(source: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source, self.tag)
    }
}

/// A raw message handed to a worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub handle: DeliveryHandle,
    pub payload: Vec<u8>,
}

/// What a worker channel listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Replica queue (consumer group) name.
    pub queue: String,
    /// Unique name of this worker within the group.
    pub consumer: String,
    /// Entity types whose topic this queue is bound to.
    pub entity_types: Vec<String>,
}

/// A dead letter as stored by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEntry {
    pub id: String,
    /// Raw envelope body, not necessarily valid.
    pub body: Vec<u8>,
}

/// Broker-facing publish side, shared by producers and consumer pools.
pub trait Transport: Send + Sync + 'static {
    /// Publish an envelope, honouring its `target_queue`.
    fn publish<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, ()>;

    /// Open a worker-exclusive channel for a subscription.
    ///
    /// Binds the queue to the subscription's entity types if needed.
    fn open_channel<'a>(&'a self, subscription: &'a Subscription)
        -> BoxFuture<'a, Box<dyn Channel>>;
}

/// A worker-exclusive broker session.
///
/// All methods take `&mut self`: a worker serializes its own publish and ack
/// traffic. Dropping a channel returns unacknowledged deliveries to the broker.
pub trait Channel: Send {
    /// Receive up to `max` deliveries, waiting at most `block` for the first.
    fn receive(&mut self, max: usize, block: Duration) -> BoxFuture<'_, Vec<Delivery>>;

    /// Acknowledge a delivery: it will not be redelivered.
    fn ack<'a>(&'a mut self, handle: &'a DeliveryHandle) -> BoxFuture<'a, ()>;

    /// Reject a delivery without requeue.
    fn nack<'a>(&'a mut self, handle: &'a DeliveryHandle) -> BoxFuture<'a, ()>;

    /// Publish through this channel (used for requeueing retries).
    fn publish<'a>(&'a mut self, envelope: &'a Envelope) -> BoxFuture<'a, ()>;

    /// Store an envelope in the queue's dead-letter area with an optional TTL.
    fn dead_letter<'a>(
        &'a mut self,
        envelope: &'a Envelope,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, ()>;
}

/// Dead-letter inspection, implemented by transports that keep dead letters.
pub trait DeadLetterStore: Send + Sync + 'static {
    fn dead_letter_count<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, usize>;

    /// Dead letters in insertion order, at most `limit` when given.
    fn dead_letters<'a>(
        &'a self,
        queue: &'a str,
        limit: Option<usize>,
    ) -> BoxFuture<'a, Vec<DeadLetterEntry>>;

    /// Remove one dead letter. Returns `false` if it was already gone.
    fn remove_dead_letter<'a>(&'a self, queue: &'a str, id: &'a str) -> BoxFuture<'a, bool>;

    /// Remove all dead letters for a queue. Returns how many were removed.
    fn purge_dead_letters<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, usize>;
}
