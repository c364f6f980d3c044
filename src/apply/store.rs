// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica storage seam.
//!
//! The apply engine only needs a handful of keyed operations from the local
//! store: read a revision, create, a revision-guarded update, delete, and bulk
//! revision lookups for reconciliation. The host application implements [`ReplicaStore`] over
//! its own database; [`MemoryReplicaStore`] is provided for tests and
//! embedding.
//!
//! # Error Classification
//!
//! Implementations must classify failures. [`StoreError::Transient`] (lock
//! contention, timeouts, a lost insert race) leads to redelivery;
//! [`StoreError::Permanent`] (constraint violations, bad data) is logged and
//! the message is acknowledged.
//!
//! # Concurrent Writers
//!
//! Workers apply envelopes for the same row concurrently, so the revision read
//! by the apply engine can be stale by the time it writes. [`ReplicaStore::update`]
//! therefore re-checks the stored revision against a [`RevisionGuard`] in the
//! same step as the write (one lock, or `UPDATE ... WHERE revision < $n` in
//! SQL) and reports [`UpdateResult::Superseded`] instead of overwriting a newer
//! row.
//!
//! # Example
//!
//! ```rust,no_run
//! use cqrs_replication::apply::{
//!     ReplicaRecord, ReplicaStore, RevisionGuard, StoreFuture, StoredRevision, UpdateResult,
//! };
//! use cqrs_replication::envelope::InstanceKey;
//! use std::collections::HashMap;
//!
//! struct ReadOnly;
//!
//! impl ReplicaStore for ReadOnly {
//!     fn revision<'a>(&'a self, _key: &'a InstanceKey) -> StoreFuture<'a, Option<StoredRevision>> {
//!         Box::pin(async { Ok(None) })
//!     }
//!     fn create(&self, _record: ReplicaRecord) -> StoreFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!     fn update(&self, _record: ReplicaRecord, _guard: RevisionGuard) -> StoreFuture<'_, UpdateResult> {
//!         Box::pin(async { Ok(UpdateResult::Written) })
//!     }
//!     fn delete<'a>(&'a self, _key: &'a InstanceKey) -> StoreFuture<'a, bool> {
//!         Box::pin(async { Ok(false) })
//!     }
//!     fn revisions<'a>(&'a self, _keys: &'a [InstanceKey]) -> StoreFuture<'a, HashMap<InstanceKey, i64>> {
//!         Box::pin(async { Ok(HashMap::new()) })
//!     }
//!     fn key_page<'a>(&'a self, _after: Option<&'a InstanceKey>, _limit: usize) -> StoreFuture<'a, Vec<InstanceKey>> {
//!         Box::pin(async { Ok(Vec::new()) })
//!     }
//! }
//! ```

use crate::envelope::{InstanceData, InstanceKey};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::ops::Bound;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::RwLock;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Boxed future returned by [`ReplicaStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Classified storage failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Expected to succeed on retry.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Will fail the same way on retry.
    #[error("permanent store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Revision bookkeeping of a stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredRevision {
    pub revision: i64,
    pub updated_at: DateTime<Utc>,
}

/// Which stored revisions an update may replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionGuard {
    /// Only strictly older rows (SAVE).
    Newer,
    /// Older or equal rows (SYNC).
    NewerOrEqual,
}

impl RevisionGuard {
    pub fn admits(self, incoming: i64, stored: i64) -> bool {
        match self {
            RevisionGuard::Newer => incoming > stored,
            RevisionGuard::NewerOrEqual => incoming >= stored,
        }
    }
}

/// Outcome of a guarded update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Written,
    /// The row already held a revision the guard does not replace.
    Superseded(StoredRevision),
}

/// A row as written to the replica.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaRecord {
    pub key: InstanceKey,
    pub revision: i64,
    pub updated_at: DateTime<Utc>,
    /// Local field name -> value, after field mapping.
    pub fields: InstanceData,
}

impl ReplicaRecord {
    pub fn stored_revision(&self) -> StoredRevision {
        StoredRevision {
            revision: self.revision,
            updated_at: self.updated_at,
        }
    }
}

/// Keyed storage used by the apply engine and reconciliation.
pub trait ReplicaStore: Send + Sync + 'static {
    /// Current revision of a row, `None` if absent.
    fn revision<'a>(&'a self, key: &'a InstanceKey) -> StoreFuture<'a, Option<StoredRevision>>;

    /// Insert a new row. A row that appeared concurrently is a transient error.
    fn create(&self, record: ReplicaRecord) -> StoreFuture<'_, ()>;

    /// Overwrite an existing row if `guard` admits its stored revision.
    ///
    /// The check and the write must be atomic. A row deleted concurrently is a
    /// transient error.
    fn update(&self, record: ReplicaRecord, guard: RevisionGuard) -> StoreFuture<'_, UpdateResult>;

    /// Remove a row. Returns `false` if it did not exist.
    fn delete<'a>(&'a self, key: &'a InstanceKey) -> StoreFuture<'a, bool>;

    /// Revisions for the given keys; absent keys are omitted.
    fn revisions<'a>(&'a self, keys: &'a [InstanceKey]) -> StoreFuture<'a, HashMap<InstanceKey, i64>>;

    /// Up to `limit` keys in ascending order, strictly after `after`.
    fn key_page<'a>(
        &'a self,
        after: Option<&'a InstanceKey>,
        limit: usize,
    ) -> StoreFuture<'a, Vec<InstanceKey>>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// Ordered in-memory [`ReplicaStore`].
#[derive(Debug, Default)]
pub struct MemoryReplicaStore {
    rows: RwLock<BTreeMap<InstanceKey, ReplicaRecord>>,
}

impl MemoryReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a row directly.
    pub async fn insert(&self, record: ReplicaRecord) {
        self.rows.write().await.insert(record.key.clone(), record);
    }

    pub async fn get(&self, key: &InstanceKey) -> Option<ReplicaRecord> {
        self.rows.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<InstanceKey> {
        self.rows.read().await.keys().cloned().collect()
    }
}

impl ReplicaStore for MemoryReplicaStore {
    fn revision<'a>(&'a self, key: &'a InstanceKey) -> StoreFuture<'a, Option<StoredRevision>> {
        Box::pin(async move { Ok(self.rows.read().await.get(key).map(ReplicaRecord::stored_revision)) })
    }

    fn create(&self, record: ReplicaRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            if rows.contains_key(&record.key) {
                return Err(StoreError::Transient(format!("row {} created concurrently", record.key)));
            }
            rows.insert(record.key.clone(), record);
            Ok(())
        })
    }

    fn update(&self, record: ReplicaRecord, guard: RevisionGuard) -> StoreFuture<'_, UpdateResult> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            match rows.get_mut(&record.key) {
                Some(row) if guard.admits(record.revision, row.revision) => {
                    *row = record;
                    Ok(UpdateResult::Written)
                }
                Some(row) => Ok(UpdateResult::Superseded(row.stored_revision())),
                None => Err(StoreError::Transient(format!("row {} deleted concurrently", record.key))),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a InstanceKey) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.rows.write().await.remove(key).is_some()) })
    }

    fn revisions<'a>(&'a self, keys: &'a [InstanceKey]) -> StoreFuture<'a, HashMap<InstanceKey, i64>> {
        Box::pin(async move {
            let rows = self.rows.read().await;
            Ok(keys
                .iter()
                .filter_map(|k| rows.get(k).map(|r| (k.clone(), r.revision)))
                .collect())
        })
    }

    fn key_page<'a>(
        &'a self,
        after: Option<&'a InstanceKey>,
        limit: usize,
    ) -> StoreFuture<'a, Vec<InstanceKey>> {
        Box::pin(async move {
            let rows = self.rows.read().await;
            let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
            Ok(rows
                .range::<InstanceKey, _>((lower, Bound::Unbounded))
                .take(limit)
                .map(|(k, _)| k.clone())
                .collect())
        })
    }
}
