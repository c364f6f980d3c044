// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumer state types.
//!
//! # Pool Lifecycle
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!                                  │
//!                                  │ (workers spawned)
//!                                  ↓
//!            reload()          Running ←──────────┐
//!          ┌────────────────────── │              │
//!          ↓                       │              │
//!      Reloading ──────────────────┼──────────────┘
//!                         shutdown()│
//!                                  ↓
//!                            ShuttingDown ──→ Stopped
//!
//!  Starting ──(invalid config)──→ Failed
//! ```
//!
//! # Delivery Lifecycle
//!
//! ```text
//! Received → Applying → Acked
//!                    └→ Nacked
//!                    └→ AwaitingRedelivery → (requeued) → Received
//!                                         └→ DeadLettered
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// State of a consumer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Built but not started.
    Created,

    /// Validating configuration and spawning workers.
    Starting,

    /// Workers are consuming.
    Running,

    /// Workers are draining and will be respawned with a new configuration.
    Reloading,

    /// Workers are finishing their in-flight message.
    ShuttingDown,

    /// All workers have exited. The pool can be started again.
    Stopped,

    /// Startup failed. Check logs for the configuration error.
    Failed,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolState::Created => write!(f, "Created"),
            PoolState::Starting => write!(f, "Starting"),
            PoolState::Running => write!(f, "Running"),
            PoolState::Reloading => write!(f, "Reloading"),
            PoolState::ShuttingDown => write!(f, "ShuttingDown"),
            PoolState::Stopped => write!(f, "Stopped"),
            PoolState::Failed => write!(f, "Failed"),
        }
    }
}

/// Where a single delivery ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    Applying,
    /// Processed or deliberately skipped.
    Acked,
    /// Rejected without requeue.
    Nacked,
    /// Parked in the worker's delay queue.
    AwaitingRedelivery,
    DeadLettered,
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryState::Received => write!(f, "Received"),
            DeliveryState::Applying => write!(f, "Applying"),
            DeliveryState::Acked => write!(f, "Acked"),
            DeliveryState::Nacked => write!(f, "Nacked"),
            DeliveryState::AwaitingRedelivery => write!(f, "AwaitingRedelivery"),
            DeliveryState::DeadLettered => write!(f, "DeadLettered"),
        }
    }
}

/// Live counters shared by every worker of a pool.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub received: AtomicU64,
    pub applied: AtomicU64,
    pub rejected: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub requeued: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub reconnects: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub applied: u64,
    pub rejected: u64,
    pub retries_scheduled: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub reconnects: u64,
}

impl ConsumerStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
