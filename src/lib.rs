//! # CQRS Replication
//!
//! Master to replica replication of entity state over a message broker.
//!
//! ## Architecture
//!
//! A master service emits change events inside its unit of work; replica
//! services consume them and apply them to local read models. Every entity
//! snapshot carries a monotonic `revision`, which is the only ordering the
//! replica relies on.
//!
//! ```text
//! ┌────────────── master ──────────────┐          ┌───────────────── replica ─────────────────┐
//! │                                    │          │                                           │
//! │  UnitOfWork ──commit──► Producer ──┼─publish─►│  ConsumerPool ──► Worker (×N)             │
//! │                            ▲       │  topic   │                     │    ▲                │
//! │                            │       │  or      │                     ▼    │ requeue        │
//! │                            │       │  direct  │             ReplicaRegistry  DelayQueue   │
//! │  Reconciler ──SYNC─────────┘       │          │                     │    │                │
//! │     │  (revision diff)             │          │                     ▼    ▼ exhausted      │
//! │     └───────── reads ──────────────┼──────────┼──────────── ReplicaStore  DeadLetters     │
//! └────────────────────────────────────┘          └───────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! 1. **At least once**: a worker acks only after the apply engine decided.
//!    Duplicates and stale deliveries are absorbed by revision comparison.
//! 2. **Bounded retry**: transient failures are parked in a per-worker delay
//!    queue and redelivered after a fixed delay, then dead-lettered.
//! 3. **Repair**: [`reconcile::Reconciler`] finds replicas that drifted and
//!    re-emits targeted SYNC events.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cqrs_replication::{
//!     Change, ConsumerPool, MemoryReplicaStore, Producer, ReplicaModel, ReplicaRegistry,
//!     ReplicationConfig, UnitOfWork,
//! };
//! use cqrs_replication::transport::memory::InMemoryTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> cqrs_replication::Result<()> {
//!     let config = ReplicationConfig::default();
//!     let transport = Arc::new(InMemoryTransport::new());
//!
//!     let mut registry = ReplicaRegistry::new();
//!     let store = Arc::new(MemoryReplicaStore::new());
//!     registry.register(ReplicaModel::new("author", "id", ["id", "name"], store))?;
//!
//!     let mut pool = ConsumerPool::new(&config, Arc::clone(&transport), registry)?;
//!     pool.start().await?;
//!
//!     let producer = Producer::new(transport, &config.producer);
//!     let mut uow = UnitOfWork::new();
//!     let data = serde_json::json!({"id": 1, "name": "Ann", "revision": 0, "updated_at": "2026-01-01T00:00:00Z"});
//!     producer
//!         .emit(Change::save("author", 1, data.as_object().cloned().unwrap_or_default()), Some(&mut uow))
//!         .await;
//!     producer.commit(uow).await;
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod apply;
pub mod circuit_breaker;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod delay_queue;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod producer;
pub mod reconcile;
pub mod resilience;
pub mod transport;

// Re-exports for convenience
pub use apply::{
    ApplyAction, ApplyOutcome, FieldMapping, MemoryReplicaStore, ReplicaHandler, ReplicaModel, ReplicaRegistry,
    ReplicaStore, RevisionGuard, StoreError, UpdateResult,
};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use config::{BrokerConfig, ConsumerConfig, ProducerConfig, ReconcileConfig, ReplicationConfig};
pub use consumer::{ConsumerPool, PoolState};
pub use dead_letter::{DeadLetterAdmin, ReplayReport};
pub use delay_queue::{DelayQueue, DelayedMessage};
pub use envelope::{Envelope, EnvelopeError, InstanceData, InstanceKey, SignalType};
pub use error::{ReplicationError, Result};
pub use producer::{Change, Emission, Producer, UnitOfWork};
pub use reconcile::{MasterSource, ReconcileStats, Reconciler};
pub use transport::memory::InMemoryTransport;
pub use transport::redis_streams::RedisTransport;
pub use transport::{Channel, DeadLetterStore, Transport};
