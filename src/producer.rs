// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Master-side emission of change events.
//!
//! The master calls [`Producer::emit`] after every mutation of a replicated
//! entity. Emission is commit-deferred: inside a [`UnitOfWork`] the envelope
//! is only queued, and [`Producer::commit`] publishes the queue once the
//! master's transaction has committed. A rolled-back unit publishes nothing,
//! so replicas never see changes the master never made.
//!
//! ```text
//!   emit(change, Some(&mut uow)) ──► uow.pending ──► commit(uow) ──► Transport
//!   emit(change, None)            ────────────────────────────────► Transport
//!   uow.rollback()                ──► discarded
//! ```
//!
//! Publishing is fire-and-log: a broker failure is logged, counted and
//! dropped. Reconciliation repairs whatever the replicas missed. Publishes run
//! through a circuit breaker so an unreachable broker fails fast instead of
//! stalling every emission for a connect timeout.
//!
//! # Example
//!
//! ```rust,no_run
//! use cqrs_replication::producer::{Change, Producer, UnitOfWork};
//! use cqrs_replication::transport::memory::InMemoryTransport;
//! use cqrs_replication::config::ProducerConfig;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let producer = Producer::new(Arc::new(InMemoryTransport::new()), &ProducerConfig::default());
//!
//! let mut uow = UnitOfWork::new();
//! let data = json!({"id": 1, "revision": 0, "updated_at": "2026-01-01T00:00:00Z"});
//! producer.emit(Change::save("author", 1, data.as_object().unwrap().clone()), Some(&mut uow)).await;
//! producer.commit(uow).await;
//! # }
//! ```

use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::config::ProducerConfig;
use crate::envelope::{Envelope, InstanceData, InstanceKey, SignalType};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::reconcile::MasterSource;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Produces a correlation id from `(signal, entity_type, key, target queue)`.
pub type CorrelationHook =
    Arc<dyn Fn(SignalType, &str, Option<&InstanceKey>, Option<&str>) -> Option<String> + Send + Sync>;

/// Produces envelope metadata from the instance snapshot.
pub type MetaHook = Arc<dyn Fn(&InstanceData) -> Map<String, Value> + Send + Sync>;

/// A mutation of one master entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub signal_type: SignalType,
    pub entity_type: String,
    pub key: Option<InstanceKey>,
    pub data: InstanceData,
    pub previous_data: Option<InstanceData>,
}

impl Change {
    pub fn save(entity_type: impl Into<String>, key: impl Into<InstanceKey>, data: InstanceData) -> Self {
        Self {
            signal_type: SignalType::Save,
            entity_type: entity_type.into(),
            key: Some(key.into()),
            data,
            previous_data: None,
        }
    }

    pub fn delete(entity_type: impl Into<String>, key: impl Into<InstanceKey>) -> Self {
        Self {
            signal_type: SignalType::Delete,
            entity_type: entity_type.into(),
            key: Some(key.into()),
            data: InstanceData::new(),
            previous_data: None,
        }
    }

    pub fn sync(entity_type: impl Into<String>, key: impl Into<InstanceKey>, data: InstanceData) -> Self {
        Self {
            signal_type: SignalType::Sync,
            entity_type: entity_type.into(),
            key: Some(key.into()),
            data,
            previous_data: None,
        }
    }

    /// Attach the prior values of the changed fields.
    #[must_use]
    pub fn with_previous(mut self, previous: InstanceData) -> Self {
        self.previous_data = Some(previous);
        self
    }
}

/// Envelopes waiting for the master's transaction to commit.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    pending: Vec<Envelope>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &[Envelope] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Discard every pending envelope. Returns how many were dropped.
    pub fn rollback(self) -> usize {
        let count = self.pending.len();
        if count > 0 {
            debug!(count, "Unit of work rolled back, pending envelopes discarded");
        }
        metrics::record_rolled_back(count);
        count
    }
}

/// What happened to an emitted change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    /// Queued in a unit of work.
    Deferred,
    Published,
    /// Publish failed; logged and dropped.
    Dropped,
}

/// Builds envelopes and publishes them.
pub struct Producer<T: Transport> {
    transport: Arc<T>,
    message_ttl: Option<Duration>,
    correlation_hook: Option<CorrelationHook>,
    meta_hook: Option<MetaHook>,
    circuit: CircuitBreaker,
}

impl<T: Transport> Producer<T> {
    pub fn new(transport: Arc<T>, config: &ProducerConfig) -> Self {
        Self {
            transport,
            message_ttl: config.message_ttl(),
            correlation_hook: None,
            meta_hook: None,
            circuit: CircuitBreaker::new("publish", config.circuit_config()),
        }
    }

    /// Install the correlation id policy.
    ///
    /// The hook is called once with a synthetic change; a panic is a
    /// configuration error.
    pub fn with_correlation_hook<F>(mut self, hook: F) -> Result<Self>
    where
        F: Fn(SignalType, &str, Option<&InstanceKey>, Option<&str>) -> Option<String>
            + Send
            + Sync
            + 'static,
    {
        let probe_key = InstanceKey::Int(0);
        catch_unwind(AssertUnwindSafe(|| {
            hook(SignalType::Save, "__probe__", Some(&probe_key), None)
        }))
        .map_err(|_| ReplicationError::Config("correlation hook panicked on probe call".into()))?;

        self.correlation_hook = Some(Arc::new(hook));
        Ok(self)
    }

    /// Install the metadata policy. Validated like the correlation hook.
    pub fn with_meta_hook<F>(mut self, hook: F) -> Result<Self>
    where
        F: Fn(&InstanceData) -> Map<String, Value> + Send + Sync + 'static,
    {
        catch_unwind(AssertUnwindSafe(|| hook(&InstanceData::new())))
            .map_err(|_| ReplicationError::Config("meta hook panicked on probe call".into()))?;

        self.meta_hook = Some(Arc::new(hook));
        Ok(self)
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    fn expires_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.message_ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl))
    }

    /// Build the envelope for a change, optionally targeted at one queue.
    pub fn envelope_for(&self, change: Change, target_queue: Option<&str>) -> Envelope {
        let correlation_id = self.correlation_hook.as_ref().and_then(|hook| {
            hook(change.signal_type, &change.entity_type, change.key.as_ref(), target_queue)
        });
        let meta = self
            .meta_hook
            .as_ref()
            .map(|hook| hook(&change.data))
            .filter(|m| !m.is_empty());
        let expires_at = self.expires_from(Utc::now());

        Envelope {
            signal_type: change.signal_type,
            entity_type: change.entity_type,
            instance_data: change.data,
            instance_key: change.key,
            previous_data: change.previous_data,
            correlation_id,
            target_queue: target_queue.map(str::to_string),
            expires_at,
            retries: 0,
            meta,
        }
    }

    /// Emit one change: deferred inside a unit of work, published otherwise.
    pub async fn emit(&self, change: Change, unit_of_work: Option<&mut UnitOfWork>) -> Emission {
        let envelope = self.envelope_for(change, None);
        match unit_of_work {
            Some(uow) => {
                uow.pending.push(envelope);
                Emission::Deferred
            }
            None => {
                if self.publish(&envelope).await {
                    Emission::Published
                } else {
                    Emission::Dropped
                }
            }
        }
    }

    /// Emit one envelope per change. Returns how many were published or deferred.
    pub async fn emit_bulk<I>(&self, changes: I, mut unit_of_work: Option<&mut UnitOfWork>) -> usize
    where
        I: IntoIterator<Item = Change>,
    {
        let mut accepted = 0;
        for change in changes {
            if self.emit(change, unit_of_work.as_deref_mut()).await != Emission::Dropped {
                accepted += 1;
            }
        }
        accepted
    }

    /// Post-commit hook: publish every pending envelope in emission order.
    ///
    /// The message TTL of deferred envelopes runs from commit, not from emit.
    /// Returns how many were published.
    pub async fn commit(&self, unit_of_work: UnitOfWork) -> usize {
        let total = unit_of_work.pending.len();
        let mut published = 0;
        for mut envelope in unit_of_work.pending {
            envelope.expires_at = self.expires_from(Utc::now());
            if self.publish(&envelope).await {
                published += 1;
            }
        }
        if published < total {
            warn!(total, published, "Unit of work committed with publish failures");
        }
        published
    }

    /// Publish through the circuit breaker. Failures are logged and dropped.
    pub async fn publish(&self, envelope: &Envelope) -> bool {
        let signal = envelope.signal_type.as_str();
        match self.circuit.call(|| self.transport.publish(envelope)).await {
            Ok(()) => {
                debug!(
                    entity_type = %envelope.entity_type,
                    signal,
                    key = ?envelope.instance_key,
                    correlation_id = ?envelope.correlation_id,
                    target_queue = ?envelope.target_queue,
                    "Published envelope"
                );
                metrics::record_published(&envelope.entity_type, signal);
                true
            }
            Err(CircuitError::Rejected) => {
                error!(
                    entity_type = %envelope.entity_type,
                    signal,
                    key = ?envelope.instance_key,
                    "Publish skipped, broker circuit open"
                );
                metrics::record_publish_failure(&envelope.entity_type, "circuit_open");
                false
            }
            Err(CircuitError::Inner(e)) => {
                let reason = match &e {
                    ReplicationError::Serialization(_) => "serialization",
                    _ => "transport",
                };
                error!(
                    entity_type = %envelope.entity_type,
                    signal,
                    key = ?envelope.instance_key,
                    error = %e,
                    "Publish failed, envelope dropped"
                );
                metrics::record_publish_failure(&envelope.entity_type, reason);
                false
            }
        }
    }

    /// Re-publish current master state for `keys` as SYNC envelopes.
    ///
    /// With `target_queue` only that replica receives them. Keys the master
    /// no longer has are skipped. Returns how many were published.
    pub async fn sync(
        &self,
        source: &dyn MasterSource,
        entity_type: &str,
        keys: &[InstanceKey],
        target_queue: Option<&str>,
    ) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let snapshots = source.load(entity_type, keys).await?;
        if snapshots.len() < keys.len() {
            debug!(
                entity_type,
                requested = keys.len(),
                found = snapshots.len(),
                "Some keys vanished from the master before SYNC"
            );
        }

        let mut published = 0;
        for (key, data) in snapshots {
            let envelope = self.envelope_for(Change::sync(entity_type, key, data), target_queue);
            if self.publish(&envelope).await {
                published += 1;
            }
        }
        Ok(published)
    }
}

impl<T: Transport> std::fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("message_ttl", &self.message_ttl)
            .field("correlation_hook", &self.correlation_hook.is_some())
            .field("meta_hook", &self.meta_hook.is_some())
            .field("circuit", &self.circuit)
            .finish()
    }
}
