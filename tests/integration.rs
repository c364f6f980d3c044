// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for CQRS Replication
//!
//! In-memory tests run by default. Broker tests use testcontainers for
//! portability - no external docker-compose required.
//!
//! # Running Tests
//! ```bash
//! # In-memory end-to-end tests
//! cargo test --test integration
//!
//! # Redis tests (requires Docker / OrbStack)
//! cargo test --test integration -- --ignored
//! ```
//!
//! # Test Organization
//! - `flow_*` - producer to replica over the in-memory broker
//! - `reconcile_*` - diff and repair against a live pool
//! - `dead_letter_*` - dead letter inspection and replay
//! - `redis_*` - the same paths over Redis Streams

mod common;

use common::*;
use cqrs_replication::apply::{FieldMapping, MemoryReplicaStore, ReplicaModel, ReplicaRegistry};
use cqrs_replication::config::ReplicationConfig;
use cqrs_replication::consumer::{ConsumerPool, PoolState};
use cqrs_replication::dead_letter::DeadLetterAdmin;
use cqrs_replication::envelope::{InstanceKey, SignalType};
use cqrs_replication::producer::{Change, Emission, Producer, UnitOfWork};
use cqrs_replication::reconcile::Reconciler;
use cqrs_replication::transport::memory::InMemoryTransport;
use cqrs_replication::transport::{Subscription, Transport};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::clients::Cli;

/// A running replica named `queue` over `store`.
async fn replica(
    transport: &InMemoryTransport,
    queue: &str,
    store: Arc<MemoryReplicaStore>,
) -> ConsumerPool<InMemoryTransport> {
    transport.declare_queue(queue, &["author"]);
    let config = ReplicationConfig::for_testing(queue);
    let mut pool = ConsumerPool::new(&config, Arc::new(transport.clone()), author_registry(store)).unwrap();
    pool.start().await.unwrap();
    pool
}

fn producer(transport: &InMemoryTransport) -> Producer<InMemoryTransport> {
    Producer::new(Arc::new(transport.clone()), &ReplicationConfig::for_testing("master").producer)
}

// =============================================================================
// Producer -> Replica
// =============================================================================

#[tokio::test]
async fn flow_committed_unit_reaches_replica() {
    let transport = InMemoryTransport::new();
    let store = Arc::new(MemoryReplicaStore::new());
    let mut pool = replica(&transport, "replica", store.clone()).await;
    let producer = producer(&transport);

    let mut uow = UnitOfWork::new();
    for id in 1..=3 {
        let emission = producer
            .emit(Change::save("author", id, author(id, 0, "Ann")), Some(&mut uow))
            .await;
        assert_eq!(emission, Emission::Deferred);
    }
    assert!(transport.published().is_empty());

    assert_eq!(producer.commit(uow).await, 3);
    wait_for_rows(&store, 3).await;

    let row = store.get(&InstanceKey::Int(2)).await.unwrap();
    assert_eq!(row.revision, 0);
    assert_eq!(row.fields.get("name").and_then(|v| v.as_str()), Some("Ann"));

    pool.shutdown().await;
}

#[tokio::test]
async fn flow_rolled_back_unit_publishes_nothing() {
    let transport = InMemoryTransport::new();
    transport.declare_queue("replica", &["author"]);
    let producer = producer(&transport);

    let mut uow = UnitOfWork::new();
    producer
        .emit(Change::save("author", 1, author(1, 0, "Ann")), Some(&mut uow))
        .await;
    producer.emit(Change::delete("author", 2), Some(&mut uow)).await;

    assert_eq!(uow.rollback(), 2);
    assert!(transport.published().is_empty());
    assert_eq!(transport.queue_depth("replica"), 0);
}

#[tokio::test]
async fn flow_out_of_order_delivery_converges() {
    let transport = InMemoryTransport::new();
    let store = Arc::new(MemoryReplicaStore::new());
    let mut pool = replica(&transport, "replica", store.clone()).await;

    // Newer revision first, then a stale one and a duplicate.
    transport.publish(&save(1, 2, "Ann v2")).await.unwrap();
    wait_for_revision(&store, 1, 2).await;
    transport.publish(&save(1, 1, "Ann v1")).await.unwrap();
    transport.publish(&save(1, 2, "Ann v2")).await.unwrap();

    wait_until("all three applied", || pool.stats().received >= 3).await;
    let row = store.get(&InstanceKey::Int(1)).await.unwrap();
    assert_eq!(row.revision, 2);
    assert_eq!(row.fields.get("name").and_then(|v| v.as_str()), Some("Ann v2"));

    pool.shutdown().await;
}

#[tokio::test]
async fn flow_delete_removes_row_and_is_idempotent() {
    let transport = InMemoryTransport::new();
    let store = Arc::new(MemoryReplicaStore::new());
    let mut pool = replica(&transport, "replica", store.clone()).await;

    transport.publish(&save(7, 0, "Bob")).await.unwrap();
    wait_for_rows(&store, 1).await;

    transport.publish(&delete(7)).await.unwrap();
    transport.publish(&delete(7)).await.unwrap();
    wait_until("both deletes acked", || pool.stats().applied >= 3).await;

    assert!(store.is_empty().await);
    assert_eq!(pool.stats().dead_lettered, 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn flow_fan_out_reaches_every_replica() {
    let transport = InMemoryTransport::new();
    let billing = Arc::new(MemoryReplicaStore::new());
    let search = Arc::new(MemoryReplicaStore::new());
    let mut billing_pool = replica(&transport, "billing", billing.clone()).await;
    let mut search_pool = replica(&transport, "search", search.clone()).await;

    producer(&transport)
        .emit(Change::save("author", 1, author(1, 0, "Ann")), None)
        .await;

    wait_for_rows(&billing, 1).await;
    wait_for_rows(&search, 1).await;

    billing_pool.shutdown().await;
    search_pool.shutdown().await;
}

#[tokio::test]
async fn flow_field_mapping_renames_fields() {
    let transport = InMemoryTransport::new();
    transport.declare_queue("replica", &["author"]);
    let store = Arc::new(MemoryReplicaStore::new());

    let mut registry = ReplicaRegistry::new();
    registry
        .register(
            ReplicaModel::new("author", "author_id", ["author_id", "display_name"], store.clone())
                .with_mapping(FieldMapping::new([("id", "author_id"), ("name", "display_name")])),
        )
        .unwrap();

    let config = ReplicationConfig::for_testing("replica");
    let mut pool = ConsumerPool::new(&config, Arc::new(transport.clone()), registry).unwrap();
    pool.start().await.unwrap();

    transport.publish(&save(3, 0, "Cleo")).await.unwrap();
    wait_for_rows(&store, 1).await;

    let row = store.get(&InstanceKey::Int(3)).await.unwrap();
    assert_eq!(row.fields.get("display_name").and_then(|v| v.as_str()), Some("Cleo"));
    assert!(row.fields.get("name").is_none());

    pool.shutdown().await;
}

#[tokio::test]
async fn flow_entity_allow_list_skips_other_types() {
    let transport = InMemoryTransport::new();
    let store = Arc::new(MemoryReplicaStore::new());
    let mut config = ReplicationConfig::for_testing("replica");
    config.consumer.entity_types = Some(vec!["book".to_string()]);

    let mut registry = author_registry(store.clone());
    registry
        .register(ReplicaModel::new("book", "id", ["id"], Arc::new(MemoryReplicaStore::new())))
        .unwrap();

    // Raw injection bypasses topic binding; the allow-list still applies.
    let mut pool = ConsumerPool::new(&config, Arc::new(transport.clone()), registry).unwrap();
    pool.start().await.unwrap();
    transport.inject_raw("replica", save(1, 0, "Ann").to_vec().unwrap());

    wait_until("author envelope received", || pool.stats().received >= 1).await;
    pool.shutdown().await;

    assert!(store.is_empty().await);
    assert_eq!(transport.queue_depth("replica"), 0);
}

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn reconcile_targeted_sync_repairs_one_replica() {
    let transport = InMemoryTransport::new();
    let billing = Arc::new(MemoryReplicaStore::new());
    let search = Arc::new(MemoryReplicaStore::new());
    let mut billing_pool = replica(&transport, "billing", billing.clone()).await;
    let mut search_pool = replica(&transport, "search", search.clone()).await;

    let master = Arc::new(MemoryMaster::default());
    for id in 1..=5 {
        master.put(id, author(id, 4, "current"));
    }

    let config = ReplicationConfig::for_testing("billing");
    let reconciler = Reconciler::new("author", master.clone(), billing.clone(), &config.reconcile);
    let stats = reconciler
        .sync_diverged(&producer(&transport), Some("billing"))
        .await
        .unwrap();

    assert_eq!(stats.scanned, 5);
    assert_eq!(stats.diverged, 5);
    assert_eq!(stats.synced, 5);

    wait_for_rows(&billing, 5).await;
    for envelope in transport.published() {
        assert_eq!(envelope.signal_type, SignalType::Sync);
        assert_eq!(envelope.target_queue.as_deref(), Some("billing"));
    }

    // The second pass finds nothing to do.
    let again = reconciler
        .sync_diverged(&producer(&transport), Some("billing"))
        .await
        .unwrap();
    assert_eq!(again.diverged, 0);

    billing_pool.shutdown().await;
    search_pool.shutdown().await;
    assert!(search.is_empty().await);
}

#[tokio::test]
async fn reconcile_stale_rows_are_brought_forward() {
    let transport = InMemoryTransport::new();
    let store = Arc::new(MemoryReplicaStore::new());
    let mut pool = replica(&transport, "replica", store.clone()).await;

    for id in 1..=3 {
        transport.publish(&save(id, 1, "old")).await.unwrap();
    }
    wait_for_rows(&store, 3).await;

    let master = Arc::new(MemoryMaster::default());
    master.put(1, author(1, 1, "old"));
    master.put(2, author(2, 5, "new"));
    master.put(3, author(3, 1, "old"));

    let mut config = ReplicationConfig::for_testing("replica");
    config.reconcile.batch_size = 2;
    let reconciler = Reconciler::new("author", master, store.clone(), &config.reconcile);
    let stats = reconciler.sync_diverged(&producer(&transport), Some("replica")).await.unwrap();
    assert_eq!(stats.batches, 2);
    assert_eq!(stats.diverged, 1);

    wait_for_revision(&store, 2, 5).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn reconcile_purges_rows_deleted_on_master() {
    let store = Arc::new(MemoryReplicaStore::new());
    let master = Arc::new(MemoryMaster::default());
    let transport = InMemoryTransport::new();
    let mut pool = replica(&transport, "replica", store.clone()).await;

    for id in 1..=4 {
        master.put(id, author(id, 0, "x"));
        transport.publish(&save(id, 0, "x")).await.unwrap();
    }
    wait_for_rows(&store, 4).await;
    pool.shutdown().await;

    // Deletes the replica missed while it was down.
    master.remove(2);
    master.remove(4);

    let config = ReplicationConfig::for_testing("replica");
    let reconciler = Reconciler::new("author", master, store.clone(), &config.reconcile);
    let stats = reconciler.purge_deleted().await.unwrap();

    assert_eq!(stats.deleted, 2);
    assert_eq!(store.keys().await, vec![InstanceKey::Int(1), InstanceKey::Int(3)]);
}

// =============================================================================
// Dead letters
// =============================================================================

#[tokio::test]
async fn dead_letter_replay_applies_after_recovery() {
    let transport = InMemoryTransport::new();
    transport.declare_queue("replica", &["author"]);
    let store = Arc::new(GatedStore::closed());

    let mut registry = ReplicaRegistry::new();
    registry
        .register(ReplicaModel::new("author", "id", ["id", "name"], store.clone()))
        .unwrap();
    let mut config = ReplicationConfig::for_testing("replica");
    config.consumer.max_retries = 1;

    let mut pool = ConsumerPool::new(&config, Arc::new(transport.clone()), registry).unwrap();
    pool.start().await.unwrap();

    transport.publish(&save(1, 0, "Ann")).await.unwrap();
    wait_for_dead_letters(&transport, "replica", 1).await;
    assert_eq!(store.rejected_writes(), 2);

    let admin = DeadLetterAdmin::new(Arc::new(transport.clone()), &config);
    let dumped = admin.dump(None).await.unwrap();
    let dead = cqrs_replication::Envelope::from_slice(&dumped[0].body).unwrap();
    assert_eq!(dead.retries, 1);

    store.open();
    let report = admin.retry_all(Utc::now(), None).await.unwrap();
    assert_eq!(report.replayed, 1);

    wait_for_rows(&store.inner, 1).await;
    assert_eq!(admin.count().await.unwrap(), 0);
    pool.shutdown().await;
}

// =============================================================================
// Redis Streams
// =============================================================================

fn redis_config(broker: &TestBroker<'_>, queue: &str) -> ReplicationConfig {
    let mut config = ReplicationConfig::for_testing(queue);
    config.broker = broker.broker_config();
    config
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_publish_consume_roundtrip() {
    let docker = Cli::default();
    let broker = TestBroker::new(&docker);
    let transport = Arc::new(broker.transport().await);
    transport.declare_queue("replica", &["author"]).await.unwrap();

    let store = Arc::new(MemoryReplicaStore::new());
    let config = redis_config(&broker, "replica");
    let mut pool = ConsumerPool::new(&config, Arc::clone(&transport), author_registry(store.clone())).unwrap();
    pool.start().await.unwrap();

    let producer = Producer::new(Arc::clone(&transport), &config.producer);
    for id in 1..=5 {
        producer.emit(Change::save("author", id, author(id, 0, "Ann")), None).await;
    }

    wait_for_rows(&store, 5).await;
    assert_eq!(broker.stream_len("test:cqrs:topic:author").await.unwrap(), 5);

    pool.shutdown().await;
    assert_eq!(pool.state(), PoolState::Stopped);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_targeted_sync_uses_queue_stream() {
    let docker = Cli::default();
    let broker = TestBroker::new(&docker);
    let transport = Arc::new(broker.transport().await);
    transport.declare_queue("billing", &["author"]).await.unwrap();
    transport.declare_queue("search", &["author"]).await.unwrap();

    let master = Arc::new(MemoryMaster::default());
    master.put(1, author(1, 3, "Ann"));

    let config = redis_config(&broker, "billing");
    let producer = Producer::new(Arc::clone(&transport), &config.producer);
    let published = producer
        .sync(master.as_ref(), "author", &[InstanceKey::Int(1)], Some("billing"))
        .await
        .unwrap();
    assert_eq!(published, 1);

    assert_eq!(broker.stream_len("test:cqrs:queue:billing").await.unwrap(), 1);
    assert_eq!(broker.stream_len("test:cqrs:topic:author").await.unwrap(), 0);

    let billing = Arc::new(MemoryReplicaStore::new());
    let mut pool = ConsumerPool::new(&config, Arc::clone(&transport), author_registry(billing.clone())).unwrap();
    pool.start().await.unwrap();
    wait_for_revision(&billing, 1, 3).await;
    pool.shutdown().await;
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_dead_letters_expire_via_ttl() {
    let docker = Cli::default();
    let broker = TestBroker::new(&docker);
    let transport = broker.transport().await;

    let subscription = Subscription {
        queue: "replica".to_string(),
        consumer: "admin".to_string(),
        entity_types: vec!["author".to_string()],
    };
    let mut channel = transport.open_channel(&subscription).await.unwrap();
    channel
        .dead_letter(&save(1, 0, "Ann"), Some(Duration::from_secs(60)))
        .await
        .unwrap();
    channel.dead_letter(&save(2, 0, "Bob"), None).await.unwrap();

    let ttl = broker.pttl("test:cqrs:dead:replica:1").await.unwrap();
    assert!(ttl > 0 && ttl <= 60_000, "unexpected ttl {}", ttl);
    assert_eq!(broker.pttl("test:cqrs:dead:replica:2").await.unwrap(), -1);

    let config = redis_config(&broker, "replica");
    let admin = DeadLetterAdmin::new(Arc::new(transport), &config);
    assert_eq!(admin.count().await.unwrap(), 2);
    assert_eq!(admin.purge().await.unwrap(), 2);
    assert_eq!(admin.count().await.unwrap(), 0);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_unacked_entries_are_redelivered_to_same_consumer() {
    let docker = Cli::default();
    let broker = TestBroker::new(&docker);
    let transport = broker.transport().await;

    let subscription = Subscription {
        queue: "replica".to_string(),
        consumer: "replica-worker-0".to_string(),
        entity_types: vec!["author".to_string()],
    };
    let mut first = transport.open_channel(&subscription).await.unwrap();
    transport.publish(&save(1, 0, "Ann")).await.unwrap();

    let received = first.receive(10, Duration::from_secs(1)).await.unwrap();
    assert_eq!(received.len(), 1);
    drop(first);

    // A restarted worker with the same name reads its pending entries first.
    let mut second = transport.open_channel(&subscription).await.unwrap();
    let again = second.receive(10, Duration::from_secs(1)).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].payload, received[0].payload);
    second.ack(&again[0].handle).await.unwrap();

    let empty = second.receive(10, Duration::from_millis(100)).await.unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_replayed_entry_parked_for_retry_is_read_once() {
    let docker = Cli::default();
    let broker = TestBroker::new(&docker);
    let transport = Arc::new(broker.transport().await);

    // Leave one entry pending under the name the pool's first worker uses.
    let subscription = Subscription {
        queue: "replica".to_string(),
        consumer: "replica-worker-0".to_string(),
        entity_types: vec!["author".to_string()],
    };
    let mut previous = transport.open_channel(&subscription).await.unwrap();
    transport.publish(&save(1, 0, "Ann")).await.unwrap();
    assert_eq!(previous.receive(10, Duration::from_secs(1)).await.unwrap().len(), 1);
    drop(previous);

    let store = Arc::new(GatedStore::closed());
    let mut registry = ReplicaRegistry::new();
    registry
        .register(ReplicaModel::new("author", "id", ["id", "name"], store.clone()))
        .unwrap();
    let mut config = redis_config(&broker, "replica");
    config.consumer.retry_delay = "10s".to_string();
    let mut pool = ConsumerPool::new(&config, Arc::clone(&transport), registry).unwrap();
    pool.start().await.unwrap();

    wait_until("replayed entry parked", || pool.stats().retries_scheduled == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.rejected_writes(), 1, "parked entry must not be read again");
    assert_eq!(pool.stats().retries_scheduled, 1);

    // New entries still flow while the replayed one waits for its ETA.
    store.open();
    transport.publish(&save(2, 0, "Bob")).await.unwrap();
    wait_for_rows(&store.inner, 1).await;
    assert!(store.inner.get(&InstanceKey::Int(2)).await.is_some());
    assert_eq!(pool.stats().retries_scheduled, 1);

    pool.shutdown().await;
}
