// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Master-side fixtures and polling helpers.

use cqrs_replication::apply::{
    MemoryReplicaStore, ReplicaModel, ReplicaRecord, ReplicaRegistry, ReplicaStore, RevisionGuard, StoreError,
    StoreFuture, StoredRevision, UpdateResult,
};
use cqrs_replication::envelope::{Envelope, InstanceData, InstanceKey, SignalType};
use cqrs_replication::reconcile::MasterSource;
use cqrs_replication::transport::{BoxFuture, DeadLetterStore};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An author snapshot as the master would serialize it.
pub fn author(id: i64, revision: i64, name: &str) -> InstanceData {
    json!({
        "id": id,
        "name": name,
        "revision": revision,
        "updated_at": "2026-01-01T00:00:00Z",
    })
    .as_object()
    .cloned()
    .unwrap()
}

pub fn save(id: i64, revision: i64, name: &str) -> Envelope {
    Envelope::new(SignalType::Save, "author", author(id, revision, name)).with_key(id)
}

pub fn delete(id: i64) -> Envelope {
    Envelope::new(SignalType::Delete, "author", InstanceData::new()).with_key(id)
}

/// Registry with one `author` model over `store`.
pub fn author_registry(store: Arc<MemoryReplicaStore>) -> ReplicaRegistry {
    let mut registry = ReplicaRegistry::new();
    registry
        .register(ReplicaModel::new("author", "id", ["id", "name"], store))
        .expect("author model registers");
    registry
}

/// Replica store whose writes fail transiently while the gate is closed.
pub struct GatedStore {
    pub inner: MemoryReplicaStore,
    open: AtomicBool,
    rejected_writes: AtomicUsize,
}

impl GatedStore {
    pub fn closed() -> Self {
        Self {
            inner: MemoryReplicaStore::new(),
            open: AtomicBool::new(false),
            rejected_writes: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn rejected_writes(&self) -> usize {
        self.rejected_writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            self.rejected_writes.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Transient("lock wait timeout".into()))
        }
    }
}

impl ReplicaStore for GatedStore {
    fn revision<'a>(&'a self, key: &'a InstanceKey) -> StoreFuture<'a, Option<StoredRevision>> {
        self.inner.revision(key)
    }

    fn create(&self, record: ReplicaRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check()?;
            self.inner.create(record).await
        })
    }

    fn update(&self, record: ReplicaRecord, guard: RevisionGuard) -> StoreFuture<'_, UpdateResult> {
        Box::pin(async move {
            self.check()?;
            self.inner.update(record, guard).await
        })
    }

    fn delete<'a>(&'a self, key: &'a InstanceKey) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.check()?;
            self.inner.delete(key).await
        })
    }

    fn revisions<'a>(&'a self, keys: &'a [InstanceKey]) -> StoreFuture<'a, HashMap<InstanceKey, i64>> {
        self.inner.revisions(keys)
    }

    fn key_page<'a>(
        &'a self,
        after: Option<&'a InstanceKey>,
        limit: usize,
    ) -> StoreFuture<'a, Vec<InstanceKey>> {
        self.inner.key_page(after, limit)
    }
}

/// In-memory master for a single entity type.
///
/// # Example
/// ```rust,ignore
/// let master = MemoryMaster::default();
/// master.put(1, author(1, 3, "Ann"));
/// master.remove(1);
/// ```
#[derive(Default)]
pub struct MemoryMaster {
    rows: Mutex<BTreeMap<InstanceKey, InstanceData>>,
}

impl MemoryMaster {
    pub fn put(&self, id: i64, data: InstanceData) {
        self.rows.lock().unwrap().insert(InstanceKey::Int(id), data);
    }

    pub fn remove(&self, id: i64) {
        self.rows.lock().unwrap().remove(&InstanceKey::Int(id));
    }
}

impl MasterSource for MemoryMaster {
    fn revision_page<'a>(
        &'a self,
        _entity_type: &'a str,
        after: Option<&'a InstanceKey>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<(InstanceKey, i64)>> {
        Box::pin(async move {
            let rows = self.rows.lock().unwrap();
            let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
            Ok(rows
                .range::<InstanceKey, _>((lower, Bound::Unbounded))
                .take(limit)
                .map(|(k, data)| (k.clone(), data.get("revision").and_then(|r| r.as_i64()).unwrap_or(0)))
                .collect())
        })
    }

    fn load<'a>(
        &'a self,
        _entity_type: &'a str,
        keys: &'a [InstanceKey],
    ) -> BoxFuture<'a, Vec<(InstanceKey, InstanceData)>> {
        Box::pin(async move {
            let rows = self.rows.lock().unwrap();
            Ok(keys
                .iter()
                .filter_map(|k| rows.get(k).map(|data| (k.clone(), data.clone())))
                .collect())
        })
    }

    fn existing_keys<'a>(
        &'a self,
        _entity_type: &'a str,
        keys: &'a [InstanceKey],
    ) -> BoxFuture<'a, HashSet<InstanceKey>> {
        Box::pin(async move {
            let rows = self.rows.lock().unwrap();
            Ok(keys.iter().filter(|k| rows.contains_key(k)).cloned().collect())
        })
    }
}

/// Poll a synchronous condition until it holds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(POLL_INTERVAL).await;
    }
}

pub async fn wait_for_rows(store: &MemoryReplicaStore, expected: usize) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while store.len().await != expected {
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {} rows, have {}",
            expected,
            store.len().await
        );
        sleep(POLL_INTERVAL).await;
    }
}

pub async fn wait_for_revision(store: &MemoryReplicaStore, id: i64, revision: i64) {
    let key = InstanceKey::Int(id);
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if store.get(&key).await.is_some_and(|r| r.revision == revision) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {} at revision {}", id, revision);
        sleep(POLL_INTERVAL).await;
    }
}

pub async fn wait_for_dead_letters<D: DeadLetterStore>(store: &D, queue: &str, expected: usize) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if store.dead_letter_count(queue).await.ok() == Some(expected) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {} dead letters", expected);
        sleep(POLL_INTERVAL).await;
    }
}
