// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revision-based reconciliation between master and replica.
//!
//! Two one-pass, bounded-memory diffs, each exposed as a `Stream` of
//! per-page results:
//!
//! - **Out-of-sync diff** ([`Reconciler::out_of_sync`]): the master streams
//!   `(key, revision)` pages, the replica answers with its revisions for those
//!   keys, and every key whose revision differs or is missing is reported.
//!   [`Reconciler::sync_diverged`] re-submits them as SYNC envelopes through
//!   the producer.
//! - **Deleted diff** ([`Reconciler::deleted`]): the replica streams its key
//!   set, the master returns the subset that still exists, and the rest is
//!   reported. [`Reconciler::purge_deleted`] removes them from the replica.
//!
//! ```text
//!   master pages ──► [(1,5) (2,5) (3,5)]
//!   replica revs ──► {1:5, 2:3}
//!   diverged     ──► [2, 3]         ──► Producer::sync(.., SYNC)
//! ```
//!
//! Memory is bounded by `batch_size`: only one page is held at a time.

use crate::apply::ReplicaStore;
use crate::config::ReconcileConfig;
use crate::envelope::{InstanceData, InstanceKey};
use crate::error::Result;
use crate::metrics;
use crate::producer::Producer;
use crate::transport::{BoxFuture, Transport};
use futures::stream::{self, Stream, TryStreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Read access to the master's current state.
pub trait MasterSource: Send + Sync {
    /// Up to `limit` `(key, revision)` pairs in ascending key order, strictly
    /// after `after`.
    fn revision_page<'a>(
        &'a self,
        entity_type: &'a str,
        after: Option<&'a InstanceKey>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<(InstanceKey, i64)>>;

    /// Current snapshots of the given keys. Keys that no longer exist are
    /// omitted.
    fn load<'a>(
        &'a self,
        entity_type: &'a str,
        keys: &'a [InstanceKey],
    ) -> BoxFuture<'a, Vec<(InstanceKey, InstanceData)>>;

    /// The subset of `keys` that still exists on the master.
    fn existing_keys<'a>(
        &'a self,
        entity_type: &'a str,
        keys: &'a [InstanceKey],
    ) -> BoxFuture<'a, HashSet<InstanceKey>>;
}

/// Keys whose replica revision differs from the master's or is missing.
///
/// Order follows `master`.
pub fn revision_diff(master: &[(InstanceKey, i64)], replica: &HashMap<InstanceKey, i64>) -> Vec<InstanceKey> {
    master
        .iter()
        .filter(|(key, revision)| replica.get(key) != Some(revision))
        .map(|(key, _)| key.clone())
        .collect()
}

/// Replica keys the master no longer has.
pub fn missing_keys(replica_keys: &[InstanceKey], existing: &HashSet<InstanceKey>) -> Vec<InstanceKey> {
    replica_keys
        .iter()
        .filter(|key| !existing.contains(*key))
        .cloned()
        .collect()
}

/// One page of a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffBatch {
    /// Keys compared in this page.
    pub scanned: usize,
    /// Keys needing action.
    pub diverged: Vec<InstanceKey>,
}

/// Totals of a reconciliation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub batches: usize,
    pub scanned: usize,
    pub diverged: usize,
    /// SYNC envelopes published.
    pub synced: usize,
    /// Replica rows removed.
    pub deleted: usize,
}

impl ReconcileStats {
    fn add_batch(&mut self, batch: &DiffBatch) {
        self.batches += 1;
        self.scanned += batch.scanned;
        self.diverged += batch.diverged.len();
    }
}

enum Cursor {
    Start,
    After(InstanceKey),
    Done,
}

impl Cursor {
    fn after(&self) -> Option<&InstanceKey> {
        match self {
            Cursor::After(key) => Some(key),
            _ => None,
        }
    }

    /// Position after a page: a short page is the last one.
    fn next(page_keys: &[InstanceKey], limit: usize) -> Self {
        match page_keys.last() {
            Some(last) if page_keys.len() >= limit => Cursor::After(last.clone()),
            _ => Cursor::Done,
        }
    }
}

/// Diff runner for one entity type.
pub struct Reconciler {
    entity_type: String,
    master: Arc<dyn MasterSource>,
    replica: Arc<dyn ReplicaStore>,
    batch_size: usize,
}

impl Reconciler {
    pub fn new(
        entity_type: impl Into<String>,
        master: Arc<dyn MasterSource>,
        replica: Arc<dyn ReplicaStore>,
        config: &ReconcileConfig,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            master,
            replica,
            batch_size: config.batch_size.max(1),
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    // =========================================================================
    // Out-of-sync diff
    // =========================================================================

    /// Pages of keys whose replica revision is stale or missing.
    pub fn out_of_sync(&self) -> impl Stream<Item = Result<DiffBatch>> + Send + '_ {
        stream::try_unfold(Cursor::Start, move |cursor| self.next_diff_page(cursor))
    }

    async fn next_diff_page(&self, cursor: Cursor) -> Result<Option<(DiffBatch, Cursor)>> {
        if matches!(cursor, Cursor::Done) {
            return Ok(None);
        }

        let page = self
            .master
            .revision_page(&self.entity_type, cursor.after(), self.batch_size)
            .await?;
        if page.is_empty() {
            return Ok(None);
        }

        let keys: Vec<InstanceKey> = page.iter().map(|(key, _)| key.clone()).collect();
        let replica = self.replica.revisions(&keys).await?;
        let diverged = revision_diff(&page, &replica);

        debug!(
            entity_type = %self.entity_type,
            scanned = page.len(),
            diverged = diverged.len(),
            "Compared revision page"
        );
        metrics::record_reconcile_batch(&self.entity_type, "diff", page.len(), diverged.len());

        let next = Cursor::next(&keys, self.batch_size);
        Ok(Some((
            DiffBatch {
                scanned: page.len(),
                diverged,
            },
            next,
        )))
    }

    /// Re-publish every diverged key as SYNC, optionally to one replica queue.
    pub async fn sync_diverged<T: Transport>(
        &self,
        producer: &Producer<T>,
        target_queue: Option<&str>,
    ) -> Result<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        let batches = self.out_of_sync();
        futures::pin_mut!(batches);

        while let Some(batch) = batches.try_next().await? {
            stats.add_batch(&batch);
            if !batch.diverged.is_empty() {
                stats.synced += producer
                    .sync(self.master.as_ref(), &self.entity_type, &batch.diverged, target_queue)
                    .await?;
            }
        }

        info!(
            entity_type = %self.entity_type,
            scanned = stats.scanned,
            diverged = stats.diverged,
            synced = stats.synced,
            "Out-of-sync reconciliation finished"
        );
        Ok(stats)
    }

    // =========================================================================
    // Deleted diff
    // =========================================================================

    /// Pages of replica keys that no longer exist on the master.
    pub fn deleted(&self) -> impl Stream<Item = Result<DiffBatch>> + Send + '_ {
        stream::try_unfold(Cursor::Start, move |cursor| self.next_deleted_page(cursor))
    }

    async fn next_deleted_page(&self, cursor: Cursor) -> Result<Option<(DiffBatch, Cursor)>> {
        if matches!(cursor, Cursor::Done) {
            return Ok(None);
        }

        let page = self.replica.key_page(cursor.after(), self.batch_size).await?;
        if page.is_empty() {
            return Ok(None);
        }

        let existing = self.master.existing_keys(&self.entity_type, &page).await?;
        let gone = missing_keys(&page, &existing);

        debug!(
            entity_type = %self.entity_type,
            scanned = page.len(),
            deleted = gone.len(),
            "Compared replica key page"
        );
        metrics::record_reconcile_batch(&self.entity_type, "deleted", page.len(), gone.len());

        let next = Cursor::next(&page, self.batch_size);
        Ok(Some((
            DiffBatch {
                scanned: page.len(),
                diverged: gone,
            },
            next,
        )))
    }

    /// Delete replica rows the master no longer has.
    pub async fn purge_deleted(&self) -> Result<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        let batches = self.deleted();
        futures::pin_mut!(batches);

        while let Some(batch) = batches.try_next().await? {
            stats.add_batch(&batch);
            for key in &batch.diverged {
                if self.replica.delete(key).await? {
                    stats.deleted += 1;
                }
            }
        }

        info!(
            entity_type = %self.entity_type,
            scanned = stats.scanned,
            deleted = stats.deleted,
            "Deleted reconciliation finished"
        );
        Ok(stats)
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("entity_type", &self.entity_type)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::{MemoryReplicaStore, ReplicaRecord};
    use crate::config::ProducerConfig;
    use crate::envelope::SignalType;
    use crate::transport::memory::InMemoryTransport;
    use chrono::Utc;
    use futures::StreamExt;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::ops::Bound;

    struct MapMaster {
        rows: BTreeMap<InstanceKey, i64>,
    }

    impl MapMaster {
        fn new(rows: &[(i64, i64)]) -> Self {
            Self {
                rows: rows.iter().map(|(k, r)| (InstanceKey::Int(*k), *r)).collect(),
            }
        }
    }

    impl MasterSource for MapMaster {
        fn revision_page<'a>(
            &'a self,
            _entity_type: &'a str,
            after: Option<&'a InstanceKey>,
            limit: usize,
        ) -> BoxFuture<'a, Vec<(InstanceKey, i64)>> {
            Box::pin(async move {
                let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
                Ok(self
                    .rows
                    .range::<InstanceKey, _>((lower, Bound::Unbounded))
                    .take(limit)
                    .map(|(k, r)| (k.clone(), *r))
                    .collect())
            })
        }

        fn load<'a>(
            &'a self,
            _entity_type: &'a str,
            keys: &'a [InstanceKey],
        ) -> BoxFuture<'a, Vec<(InstanceKey, InstanceData)>> {
            Box::pin(async move {
                Ok(keys
                    .iter()
                    .filter_map(|k| {
                        self.rows.get(k).map(|rev| {
                            let data = json!({"id": k.to_value(), "revision": rev}).as_object().cloned().unwrap();
                            (k.clone(), data)
                        })
                    })
                    .collect())
            })
        }

        fn existing_keys<'a>(
            &'a self,
            _entity_type: &'a str,
            keys: &'a [InstanceKey],
        ) -> BoxFuture<'a, HashSet<InstanceKey>> {
            Box::pin(async move { Ok(keys.iter().filter(|k| self.rows.contains_key(k)).cloned().collect()) })
        }
    }

    async fn replica(rows: &[(i64, i64)]) -> Arc<MemoryReplicaStore> {
        let store = MemoryReplicaStore::new();
        for (key, revision) in rows {
            store
                .insert(ReplicaRecord {
                    key: InstanceKey::Int(*key),
                    revision: *revision,
                    updated_at: Utc::now(),
                    fields: InstanceData::new(),
                })
                .await;
        }
        Arc::new(store)
    }

    fn config(batch_size: usize) -> ReconcileConfig {
        ReconcileConfig { batch_size }
    }

    #[test]
    fn test_revision_diff_reports_stale_and_missing() {
        let master = vec![
            (InstanceKey::Int(1), 5),
            (InstanceKey::Int(2), 5),
            (InstanceKey::Int(3), 5),
        ];
        let replica: HashMap<_, _> = [(InstanceKey::Int(1), 5), (InstanceKey::Int(2), 3)].into_iter().collect();

        assert_eq!(
            revision_diff(&master, &replica),
            vec![InstanceKey::Int(2), InstanceKey::Int(3)]
        );
    }

    #[test]
    fn test_missing_keys() {
        let replica = vec![InstanceKey::Int(1), InstanceKey::Int(2), InstanceKey::Int(3)];
        let existing: HashSet<_> = [InstanceKey::Int(2)].into_iter().collect();
        assert_eq!(
            missing_keys(&replica, &existing),
            vec![InstanceKey::Int(1), InstanceKey::Int(3)]
        );
    }

    #[tokio::test]
    async fn test_out_of_sync_pages() {
        let master = Arc::new(MapMaster::new(&[(1, 5), (2, 5), (3, 5), (4, 1), (5, 1)]));
        let store = replica(&[(1, 5), (2, 3), (4, 1)]).await;
        let reconciler = Reconciler::new("author", master, store, &config(2));

        let batches: Vec<DiffBatch> = reconciler.out_of_sync().map(|b| b.unwrap()).collect().await;

        assert_eq!(batches.len(), 3);
        let scanned: usize = batches.iter().map(|b| b.scanned).sum();
        assert_eq!(scanned, 5);
        let diverged: Vec<InstanceKey> = batches.into_iter().flat_map(|b| b.diverged).collect();
        assert_eq!(
            diverged,
            vec![InstanceKey::Int(2), InstanceKey::Int(3), InstanceKey::Int(5)]
        );
    }

    #[tokio::test]
    async fn test_out_of_sync_empty_master() {
        let reconciler = Reconciler::new("author", Arc::new(MapMaster::new(&[])), replica(&[]).await, &config(10));
        let batches: Vec<_> = reconciler.out_of_sync().collect().await;
        assert!(batches.is_empty());
    }

    #[tokio::test]
    async fn test_sync_diverged_publishes_sync_envelopes() {
        let master = Arc::new(MapMaster::new(&[(1, 5), (2, 5), (3, 5)]));
        let store = replica(&[(1, 5), (2, 3)]).await;
        let reconciler = Reconciler::new("author", master, store, &config(10));

        let transport = InMemoryTransport::new();
        let producer = Producer::new(Arc::new(transport.clone()), &ProducerConfig::default());

        let stats = reconciler.sync_diverged(&producer, Some("replica")).await.unwrap();
        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.diverged, 2);
        assert_eq!(stats.synced, 2);

        let published = transport.published();
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|e| e.signal_type == SignalType::Sync));
        assert!(published.iter().all(|e| e.target_queue.as_deref() == Some("replica")));
    }

    #[tokio::test]
    async fn test_purge_deleted_removes_orphans() {
        let master = Arc::new(MapMaster::new(&[(2, 1), (4, 1)]));
        let store = replica(&[(1, 1), (2, 1), (3, 1), (4, 1), (5, 1)]).await;
        let reconciler = Reconciler::new("author", master, store.clone(), &config(2));

        let stats = reconciler.purge_deleted().await.unwrap();
        assert_eq!(stats.scanned, 5);
        assert_eq!(stats.deleted, 3);
        assert_eq!(store.keys().await, vec![InstanceKey::Int(2), InstanceKey::Int(4)]);
    }

    #[tokio::test]
    async fn test_deleted_stream_without_orphans() {
        let master = Arc::new(MapMaster::new(&[(1, 1), (2, 1)]));
        let store = replica(&[(1, 1), (2, 1)]).await;
        let reconciler = Reconciler::new("author", master, store, &config(2));

        let batches: Vec<DiffBatch> = reconciler.deleted().map(|b| b.unwrap()).collect().await;
        assert!(batches.iter().all(|b| b.diverged.is_empty()));
    }
}
