// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication engine.
//!
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON. Durations are `humantime` strings ("2s", "500ms") parsed through
//! the `*_duration()` accessors, which fall back to the defaults on bad input.
//! [`ReplicationConfig::validate()`] rejects settings that would make the
//! engine misbehave and is called by every component constructor.
//!
//! # Quick Start
//!
//! ```rust
//! use cqrs_replication::config::{ReplicationConfig, ConsumerConfig};
//!
//! let config = ReplicationConfig {
//!     service_name: "billing-replica".into(),
//!     consumer: ConsumerConfig {
//!         workers: 4,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── service_name: String          # Replica queue / consumer group
//! ├── broker: BrokerConfig          # Redis URL, key prefix, stream trimming
//! ├── producer: ProducerConfig      # Message TTL, publish circuit breaker
//! ├── consumer: ConsumerConfig      # Workers, retries, delay queue, dead letters
//! └── reconcile: ReconcileConfig    # Diff batch size
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! service_name: "billing-replica"
//!
//! broker:
//!   redis_url: "redis://broker:6379"
//!   key_prefix: "prod:"
//!
//! producer:
//!   message_ttl_sec: 86400
//!
//! consumer:
//!   workers: 4
//!   max_retries: 30
//!   retry_delay: "2s"
//!   delay_queue_max_size: 1000
//!   entity_types: ["author", "book"]
//!
//! reconcile:
//!   batch_size: 10000
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Name of this replica service.
    /// Used as the queue (consumer group) name and for targeted SYNC.
    pub service_name: String,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub producer: ProducerConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            service_name: "replica".to_string(),
            broker: BrokerConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing: short delays, small queues.
    pub fn for_testing(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            broker: BrokerConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::for_testing(),
            reconcile: ReconcileConfig { batch_size: 100 },
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(ReplicationError::Config("service_name must not be empty".into()));
        }
        self.consumer.validate()?;
        if self.reconcile.batch_size == 0 {
            return Err(ReplicationError::Config("reconcile.batch_size must be at least 1".into()));
        }
        if self.producer.circuit_failure_threshold == 0 {
            return Err(ReplicationError::Config(
                "producer.circuit_failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BrokerConfig: where the broker lives
// ═══════════════════════════════════════════════════════════════════════════════

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Example: `"redis://broker.example.com:6379"`
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every key the transport creates (e.g., "prod:").
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Approximate length topic streams are trimmed to on publish.
    #[serde(default = "default_stream_max_len")]
    pub stream_max_len: usize,

    /// Timeout for each connection attempt.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_stream_max_len() -> usize {
    100_000
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            key_prefix: None,
            stream_max_len: 100_000,
            connect_timeout: "5s".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProducerConfig: emission settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Producer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Envelopes expire this many seconds after emission.
    /// `None` means never.
    #[serde(default = "default_message_ttl_sec")]
    pub message_ttl_sec: Option<u64>,

    /// Consecutive publish failures before the circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long the circuit stays open before probing the broker again.
    #[serde(default = "default_circuit_recovery_timeout")]
    pub circuit_recovery_timeout: String,
}

fn default_message_ttl_sec() -> Option<u64> {
    Some(86_400) // 1 day
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_recovery_timeout() -> String {
    "30s".to_string()
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            message_ttl_sec: Some(86_400),
            circuit_failure_threshold: 5,
            circuit_recovery_timeout: "30s".to_string(),
        }
    }
}

impl ProducerConfig {
    pub fn message_ttl(&self) -> Option<Duration> {
        self.message_ttl_sec.map(Duration::from_secs)
    }

    pub fn circuit_recovery_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.circuit_recovery_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Circuit breaker settings for the publish path.
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            recovery_timeout: self.circuit_recovery_timeout_duration(),
            ..CircuitConfig::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConsumerConfig: worker pool, retry and dead-letter settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Consumer pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Number of independent workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Redeliveries before a message is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between redeliveries.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,

    /// Per-worker delay queue bound. `None` means unbounded.
    #[serde(default = "default_delay_queue_max_size")]
    pub delay_queue_max_size: Option<usize>,

    /// Dead letters expire this many seconds after enqueue.
    /// `None` keeps them until purged.
    #[serde(default = "default_dead_message_ttl_sec")]
    pub dead_message_ttl_sec: Option<u64>,

    /// Delay between reconnect attempts after losing the broker.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: String,

    /// Maximum deliveries fetched per receive.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Longest a receive blocks when idle.
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// Entity types this consumer handles. `None` handles every registered type.
    #[serde(default)]
    pub entity_types: Option<Vec<String>>,

    /// How long shutdown waits for a worker before logging it as stuck.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_workers() -> usize {
    1
}

fn default_max_retries() -> u32 {
    30
}

fn default_retry_delay() -> String {
    "2s".to_string()
}

fn default_delay_queue_max_size() -> Option<usize> {
    Some(1000)
}

fn default_dead_message_ttl_sec() -> Option<u64> {
    Some(864_000) // 10 days
}

fn default_reconnect_delay() -> String {
    "2s".to_string()
}

fn default_prefetch() -> usize {
    10
}

fn default_block_timeout() -> String {
    "1s".to_string()
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: 30,
            retry_delay: "2s".to_string(),
            delay_queue_max_size: Some(1000),
            dead_message_ttl_sec: Some(864_000),
            reconnect_delay: "2s".to_string(),
            prefetch: 10,
            block_timeout: "1s".to_string(),
            entity_types: None,
            drain_timeout: "10s".to_string(),
        }
    }
}

impl ConsumerConfig {
    /// Short delays for tests.
    pub fn for_testing() -> Self {
        Self {
            workers: 1,
            max_retries: 3,
            retry_delay: "20ms".to_string(),
            delay_queue_max_size: Some(100),
            dead_message_ttl_sec: None,
            reconnect_delay: "20ms".to_string(),
            prefetch: 10,
            block_timeout: "20ms".to_string(),
            entity_types: None,
            drain_timeout: "2s".to_string(),
        }
    }

    pub fn retry_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.retry_delay).unwrap_or(Duration::from_secs(2))
    }

    pub fn reconnect_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.reconnect_delay).unwrap_or(Duration::from_secs(2))
    }

    pub fn block_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.block_timeout).unwrap_or(Duration::from_secs(1))
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.drain_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn dead_message_ttl(&self) -> Option<Duration> {
        self.dead_message_ttl_sec.map(Duration::from_secs)
    }

    /// Whether this consumer handles an entity type.
    pub fn handles(&self, entity_type: &str) -> bool {
        self.entity_types
            .as_ref()
            .map_or(true, |allowed| allowed.iter().any(|e| e == entity_type))
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ReplicationError::Config("consumer.workers must be at least 1".into()));
        }
        if self.prefetch == 0 {
            return Err(ReplicationError::Config("consumer.prefetch must be at least 1".into()));
        }
        if self.delay_queue_max_size == Some(0) {
            return Err(ReplicationError::Config(
                "consumer.delay_queue_max_size must be at least 1 (or unset)".into(),
            ));
        }
        for (name, value) in [
            ("retry_delay", &self.retry_delay),
            ("reconnect_delay", &self.reconnect_delay),
            ("block_timeout", &self.block_timeout),
            ("drain_timeout", &self.drain_timeout),
        ] {
            humantime::parse_duration(value).map_err(|e| {
                ReplicationError::Config(format!("consumer.{} '{}' is not a duration: {}", name, value, e))
            })?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReconcileConfig: diff tooling
// ═══════════════════════════════════════════════════════════════════════════════

/// Reconciliation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Keys compared per page.
    #[serde(default = "default_reconcile_batch_size")]
    pub batch_size: usize,
}

fn default_reconcile_batch_size() -> usize {
    10_000
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { batch_size: 10_000 }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
