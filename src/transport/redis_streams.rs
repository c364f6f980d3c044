// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams transport.
//!
//! # Key Layout
//!
//! ```text
//! {prefix}cqrs:topic:{entity_type}   stream, one per entity type (fan-out)
//! {prefix}cqrs:queue:{queue}         stream, direct delivery to one queue
//! {prefix}cqrs:dead:{queue}:{n}      string, dead letter with PX TTL
//! {prefix}cqrs:dead-seq:{queue}      counter for dead letter ids
//! ```
//!
//! Each replica queue is a consumer group on every stream it listens to, so
//! every replica service sees every topic entry once, and the workers of one
//! service share the load. Entries carry the envelope JSON in a single `body`
//! field.
//!
//! # Redelivery
//!
//! A worker reads its own pending entries (`XREADGROUP ... 0`) before asking
//! for new ones (`>`), so a crashed worker restarted under the same consumer
//! name picks up exactly what it had not acknowledged. The pending list is
//! paged once per channel: each page starts after the last id returned for
//! that stream, and the first empty page ends the replay. Entries the worker
//! parks for a later retry stay pending without being read twice. Nack is `XACK`: the
//! broker forgets the entry, no requeue.

use super::{BoxFuture, Channel, DeadLetterEntry, DeadLetterStore, Delivery, DeliveryHandle, Subscription, Transport};
use crate::config::BrokerConfig;
use crate::envelope::Envelope;
use crate::error::{ReplicationError, Result};
use crate::resilience::RetryConfig;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Stream field holding the envelope body.
const BODY_FIELD: &str = "body";

/// SCAN page size for dead letter listing.
const SCAN_COUNT: usize = 500;

/// Key naming for one deployment.
#[derive(Debug, Clone)]
struct StreamKeys {
    prefix: String,
    max_len: usize,
}

impl StreamKeys {
    fn topic(&self, entity_type: &str) -> String {
        format!("{}cqrs:topic:{}", self.prefix, entity_type)
    }

    fn queue(&self, queue: &str) -> String {
        format!("{}cqrs:queue:{}", self.prefix, queue)
    }

    fn dead(&self, queue: &str, id: u64) -> String {
        format!("{}cqrs:dead:{}:{}", self.prefix, queue, id)
    }

    fn dead_pattern(&self, queue: &str) -> String {
        format!("{}cqrs:dead:{}:*", self.prefix, queue)
    }

    fn dead_seq(&self, queue: &str) -> String {
        format!("{}cqrs:dead-seq:{}", self.prefix, queue)
    }

    /// Stream an envelope is routed to.
    fn route(&self, envelope: &Envelope) -> String {
        match &envelope.target_queue {
            Some(queue) => self.queue(queue),
            None => self.topic(&envelope.entity_type),
        }
    }

    /// Numeric id from a dead letter key, for ordering.
    fn dead_id(key: &str) -> Option<u64> {
        key.rsplit(':').next().and_then(|id| id.parse().ok())
    }
}

/// Connect with a per-attempt timeout and backoff between attempts.
async fn connect_with_retry(client: &Client, retry: &RetryConfig) -> Result<ConnectionManager> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        match timeout(retry.connection_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => {
                if attempt > 1 {
                    info!(attempt, "Connected to broker after retry");
                }
                return Ok(conn);
            }
            Ok(Err(e)) => {
                if attempt >= retry.max_attempts {
                    return Err(ReplicationError::redis("connect", e));
                }
                warn!(attempt, error = %e, "Broker connection attempt failed, retrying");
            }
            Err(_) => {
                if attempt >= retry.max_attempts {
                    return Err(ReplicationError::transport(
                        "connect",
                        format!("timed out after {} attempts", attempt),
                    ));
                }
                warn!(attempt, "Broker connection attempt timed out, retrying");
            }
        }

        tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
    }
}

async fn xadd(conn: &mut ConnectionManager, keys: &StreamKeys, envelope: &Envelope) -> Result<String> {
    let stream = keys.route(envelope);
    let body = envelope.to_vec()?;

    let id: String = redis::cmd("XADD")
        .arg(&stream)
        .arg("MAXLEN")
        .arg("~")
        .arg(keys.max_len)
        .arg("*")
        .arg(BODY_FIELD)
        .arg(body)
        .query_async(conn)
        .await
        .map_err(|e| ReplicationError::redis("XADD", e))?;

    trace!(stream = %stream, id = %id, "Published envelope");
    Ok(id)
}

/// Create a consumer group at the stream tail, creating the stream if needed.
async fn ensure_group(conn: &mut ConnectionManager, stream: &str, group: &str) -> Result<()> {
    let result: redis::RedisResult<String> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async(conn)
        .await;

    match result {
        Ok(_) => {
            debug!(stream, group, "Created consumer group");
            Ok(())
        }
        Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
        Err(e) => Err(ReplicationError::redis("XGROUP CREATE", e)),
    }
}

/// Extract the envelope body from a stream entry.
fn body_bytes(fields: &HashMap<String, redis::Value>) -> Option<Vec<u8>> {
    match fields.get(BODY_FIELD)? {
        redis::Value::BulkString(bytes) => Some(bytes.clone()),
        redis::Value::SimpleString(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

async fn scan_keys(conn: &mut ConnectionManager, pattern: &str) -> Result<Vec<String>> {
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();

    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await
            .map_err(|e| ReplicationError::redis("SCAN", e))?;

        keys.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }

    keys.sort_by_key(|k| StreamKeys::dead_id(k).unwrap_or(u64::MAX));
    Ok(keys)
}

/// [`Transport`] over Redis Streams consumer groups.
pub struct RedisTransport {
    client: Client,
    conn: ConnectionManager,
    keys: StreamKeys,
    connect_timeout: Duration,
}

impl RedisTransport {
    /// Connect to the broker.
    pub async fn connect(config: &BrokerConfig, retry: &RetryConfig) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| ReplicationError::Config(format!("Invalid Redis URL: {}", e)))?;

        info!(url = %config.redis_url, "Connecting to broker");
        let conn = connect_with_retry(&client, retry).await?;
        info!("Connected to broker");

        Ok(Self {
            client,
            conn,
            keys: StreamKeys {
                prefix: config.key_prefix.clone().unwrap_or_default(),
                max_len: config.stream_max_len,
            },
            connect_timeout: config.connect_timeout_duration(),
        })
    }

    /// Create the consumer groups for a queue without opening a channel.
    ///
    /// Entries published before a queue's group exists are not delivered to
    /// it, so replicas declare their queue at boot.
    pub async fn declare_queue<S: AsRef<str>>(&self, queue: &str, entity_types: &[S]) -> Result<()> {
        let mut conn = self.conn.clone();
        ensure_group(&mut conn, &self.keys.queue(queue), queue).await?;
        for entity_type in entity_types {
            ensure_group(&mut conn, &self.keys.topic(entity_type.as_ref()), queue).await?;
        }
        Ok(())
    }
}

impl Transport for RedisTransport {
    fn publish<'a>(&'a self, envelope: &'a Envelope) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            xadd(&mut conn, &self.keys, envelope).await.map(|_| ())
        })
    }

    fn open_channel<'a>(&'a self, subscription: &'a Subscription) -> BoxFuture<'a, Box<dyn Channel>> {
        Box::pin(async move {
            self.declare_queue(&subscription.queue, &subscription.entity_types)
                .await?;

            // Blocking reads get their own connection so publishes are not queued behind them.
            let conn = timeout(self.connect_timeout, self.client.get_connection_manager())
                .await
                .map_err(|_| ReplicationError::transport("connect", "channel connection timed out"))?
                .map_err(|e| ReplicationError::redis("connect", e))?;

            let mut streams = vec![self.keys.queue(&subscription.queue)];
            streams.extend(subscription.entity_types.iter().map(|e| self.keys.topic(e)));

            debug!(
                queue = %subscription.queue,
                consumer = %subscription.consumer,
                streams = streams.len(),
                "Opened Redis channel"
            );

            Ok(Box::new(RedisChannel {
                conn,
                keys: self.keys.clone(),
                queue: subscription.queue.clone(),
                consumer: subscription.consumer.clone(),
                replay: Some(PendingReplay::new(&streams)),
                streams,
            }) as Box<dyn Channel>)
        })
    }
}

impl DeadLetterStore for RedisTransport {
    fn dead_letter_count<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            Ok(scan_keys(&mut conn, &self.keys.dead_pattern(queue)).await?.len())
        })
    }

    fn dead_letters<'a>(
        &'a self,
        queue: &'a str,
        limit: Option<usize>,
    ) -> BoxFuture<'a, Vec<DeadLetterEntry>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let keys = scan_keys(&mut conn, &self.keys.dead_pattern(queue)).await?;

            let mut entries = Vec::new();
            for key in keys.into_iter().take(limit.unwrap_or(usize::MAX)) {
                let body: Option<Vec<u8>> = conn
                    .get(&key)
                    .await
                    .map_err(|e| ReplicationError::redis("GET", e))?;
                // Expired between SCAN and GET
                let Some(body) = body else { continue };
                let id = StreamKeys::dead_id(&key).map(|id| id.to_string()).unwrap_or(key);
                entries.push(DeadLetterEntry { id, body });
            }
            Ok(entries)
        })
    }

    fn remove_dead_letter<'a>(&'a self, queue: &'a str, id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let Ok(id) = id.parse::<u64>() else {
                return Ok(false);
            };
            let mut conn = self.conn.clone();
            let removed: u64 = conn
                .del(self.keys.dead(queue, id))
                .await
                .map_err(|e| ReplicationError::redis("DEL", e))?;
            Ok(removed > 0)
        })
    }

    fn purge_dead_letters<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let keys = scan_keys(&mut conn, &self.keys.dead_pattern(queue)).await?;
            if keys.is_empty() {
                return Ok(0);
            }
            let removed: usize = conn
                .del(&keys)
                .await
                .map_err(|e| ReplicationError::redis("DEL", e))?;
            Ok(removed)
        })
    }
}

/// Position in this consumer's pending entries, per stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingReplay {
    streams: Vec<String>,
    after: Vec<String>,
}

impl PendingReplay {
    fn new(streams: &[String]) -> Self {
        Self {
            streams: streams.to_vec(),
            after: vec!["0".to_string(); streams.len()],
        }
    }

    /// Move past a page of pending entries. Returns `false` once a page
    /// comes back empty.
    fn advance(&mut self, page: &[Delivery]) -> bool {
        for delivery in page {
            if let Some(i) = self.streams.iter().position(|s| *s == delivery.handle.source) {
                self.after[i] = delivery.handle.tag.clone();
            }
        }
        !page.is_empty()
    }
}

/// One worker's consumer-group session.
struct RedisChannel {
    conn: ConnectionManager,
    keys: StreamKeys,
    queue: String,
    consumer: String,
    streams: Vec<String>,
    /// Set while paging through pending entries from a previous run.
    replay: Option<PendingReplay>,
}

impl RedisChannel {
    /// `block` is `None` for pending reads, which never wait.
    async fn read(&mut self, ids: &[String], max: usize, block: Option<Duration>) -> Result<Vec<Delivery>> {
        let mut opts = StreamReadOptions::default()
            .group(&self.queue, &self.consumer)
            .count(max.max(1));
        if let Some(block) = block {
            // BLOCK 0 would wait forever
            opts = opts.block(block.as_millis().max(1) as usize);
        }

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&self.streams, ids, &opts)
            .await
            .map_err(|e| ReplicationError::redis("XREADGROUP", e))?;

        let mut deliveries = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream.ids {
                let payload = body_bytes(&entry.map).unwrap_or_default();
                deliveries.push(Delivery {
                    handle: DeliveryHandle::new(stream.key.clone(), entry.id),
                    payload,
                });
            }
        }
        Ok(deliveries)
    }

    async fn xack(&mut self, handle: &DeliveryHandle) -> Result<()> {
        let _: u64 = self
            .conn
            .xack(&handle.source, &self.queue, &[&handle.tag])
            .await
            .map_err(|e| ReplicationError::redis("XACK", e))?;
        Ok(())
    }
}

impl Channel for RedisChannel {
    fn receive(&mut self, max: usize, block: Duration) -> BoxFuture<'_, Vec<Delivery>> {
        Box::pin(async move {
            if let Some(mut replay) = self.replay.take() {
                let pending = match self.read(&replay.after, max, None).await {
                    Ok(pending) => pending,
                    Err(e) => {
                        self.replay = Some(replay);
                        return Err(e);
                    }
                };
                if replay.advance(&pending) {
                    debug!(
                        consumer = %self.consumer,
                        count = pending.len(),
                        "Replaying pending entries"
                    );
                    self.replay = Some(replay);
                    return Ok(pending);
                }
                debug!(consumer = %self.consumer, "Pending replay complete");
            }
            let ids = vec![">".to_string(); self.streams.len()];
            self.read(&ids, max, Some(block)).await
        })
    }

    fn ack<'a>(&'a mut self, handle: &'a DeliveryHandle) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.xack(handle).await })
    }

    fn nack<'a>(&'a mut self, handle: &'a DeliveryHandle) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.xack(handle).await })
    }

    fn publish<'a>(&'a mut self, envelope: &'a Envelope) -> BoxFuture<'a, ()> {
        Box::pin(async move { xadd(&mut self.conn, &self.keys, envelope).await.map(|_| ()) })
    }

    fn dead_letter<'a>(
        &'a mut self,
        envelope: &'a Envelope,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let body = envelope.to_vec()?;
            let id: u64 = self
                .conn
                .incr(self.keys.dead_seq(&self.queue), 1u64)
                .await
                .map_err(|e| ReplicationError::redis("INCR", e))?;

            let key = self.keys.dead(&self.queue, id);
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(body);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
            }
            let _: () = cmd
                .query_async(&mut self.conn)
                .await
                .map_err(|e| ReplicationError::redis("SET", e))?;

            debug!(key = %key, ttl_ms = ttl.map(|t| t.as_millis() as u64), "Stored dead letter");
            Ok(())
        })
    }
}
