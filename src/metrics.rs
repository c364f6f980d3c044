// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Producer emissions and publish failures
//! - Consumer deliveries, apply outcomes and rejections
//! - Retry scheduling, requeues and dead letters
//! - Delay queue depth and worker pool state
//! - Reconciliation progress
//! - Circuit breaker calls
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `cqrs_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! # Usage
//!
//! ```rust,no_run
//! use cqrs_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_published("author", "SAVE");
//! metrics::record_apply_latency("author", Duration::from_millis(3));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Producer
// =============================================================================

/// Record an envelope accepted by the broker.
pub fn record_published(entity_type: &str, signal: &str) {
    counter!(
        "cqrs_published_total",
        "entity_type" => entity_type.to_string(),
        "signal" => signal.to_string()
    )
    .increment(1);
}

/// Record a publish that was logged and dropped.
///
/// `reason` is one of `transport`, `circuit_open`, `serialization`.
pub fn record_publish_failure(entity_type: &str, reason: &str) {
    counter!(
        "cqrs_publish_failures_total",
        "entity_type" => entity_type.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record envelopes discarded by a rolled-back unit of work.
pub fn record_rolled_back(count: usize) {
    counter!("cqrs_rolled_back_total").increment(count as u64);
}

// =============================================================================
// Consumer
// =============================================================================

/// Record a delivery received by a worker.
pub fn record_consumed(queue: &str) {
    counter!("cqrs_consumed_total", "queue" => queue.to_string()).increment(1);
}

/// Record a successful apply by action (`created`, `updated`, `duplicate`, ...).
pub fn record_applied(entity_type: &str, action: &str) {
    counter!(
        "cqrs_applied_total",
        "entity_type" => entity_type.to_string(),
        "action" => action.to_string()
    )
    .increment(1);
}

/// Record a message that will not be applied.
///
/// `reason` is one of `malformed`, `unknown_signal`, `no_handler`,
/// `permanent`, `expired`, `filtered`.
pub fn record_rejected(entity_type: &str, reason: &str) {
    counter!(
        "cqrs_rejected_total",
        "entity_type" => entity_type.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record apply latency (handler call only).
pub fn record_apply_latency(entity_type: &str, duration: Duration) {
    histogram!("cqrs_apply_duration_seconds", "entity_type" => entity_type.to_string())
        .record(duration.as_secs_f64());
}

/// Record a transient failure parked in the delay queue.
pub fn record_retry_scheduled(queue: &str, entity_type: &str) {
    counter!(
        "cqrs_retries_scheduled_total",
        "queue" => queue.to_string(),
        "entity_type" => entity_type.to_string()
    )
    .increment(1);
}

/// Record delayed messages republished to the worker's queue.
///
/// `early` marks releases forced by delay queue capacity.
pub fn record_requeued(queue: &str, early: bool) {
    let trigger = if early { "capacity" } else { "eta" };
    counter!("cqrs_requeued_total", "queue" => queue.to_string(), "trigger" => trigger).increment(1);
}

/// Record a message moved to the dead-letter area.
pub fn record_dead_lettered(queue: &str, entity_type: &str) {
    counter!(
        "cqrs_dead_lettered_total",
        "queue" => queue.to_string(),
        "entity_type" => entity_type.to_string()
    )
    .increment(1);
}

/// Set a worker's delay queue depth.
pub fn set_delay_queue_depth(queue: &str, worker_id: usize, depth: usize) {
    gauge!(
        "cqrs_delay_queue_depth",
        "queue" => queue.to_string(),
        "worker" => worker_id.to_string()
    )
    .set(depth as f64);
}

/// Record a worker reconnect after channel loss.
pub fn record_reconnect(queue: &str) {
    counter!("cqrs_reconnects_total", "queue" => queue.to_string()).increment(1);
}

/// Set the consumer pool state (numeric code, see [`crate::consumer::PoolState`]).
pub fn set_pool_state(queue: &str, state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "Reloading" => 3.0,
        "ShuttingDown" => 4.0,
        "Stopped" => 5.0,
        "Failed" => 6.0,
        _ => -1.0,
    };
    gauge!("cqrs_pool_state", "queue" => queue.to_string()).set(value);
}

/// Set the number of live workers.
pub fn set_active_workers(queue: &str, count: usize) {
    gauge!("cqrs_active_workers", "queue" => queue.to_string()).set(count as f64);
}

// =============================================================================
// Reconciliation and dead letters
// =============================================================================

/// Record one reconciliation page. `kind` is `diff` or `deleted`.
pub fn record_reconcile_batch(entity_type: &str, kind: &str, scanned: usize, diverged: usize) {
    counter!(
        "cqrs_reconcile_batches_total",
        "entity_type" => entity_type.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
    counter!(
        "cqrs_reconcile_scanned_total",
        "entity_type" => entity_type.to_string(),
        "kind" => kind.to_string()
    )
    .increment(scanned as u64);
    counter!(
        "cqrs_reconcile_diverged_total",
        "entity_type" => entity_type.to_string(),
        "kind" => kind.to_string()
    )
    .increment(diverged as u64);
}

/// Record a dead-letter replay run.
pub fn record_dead_letter_replay(queue: &str, replayed: usize, skipped: usize) {
    counter!("cqrs_dead_letters_replayed_total", "queue" => queue.to_string()).increment(replayed as u64);
    if skipped > 0 {
        counter!("cqrs_dead_letters_skipped_total", "queue" => queue.to_string()).increment(skipped as u64);
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

/// Record a circuit-protected call. `outcome` is `success`, `failure` or `rejected`.
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "cqrs_circuit_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
