// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica-side consumer pool.
//!
//! A [`ConsumerPool`] runs N independent [`Worker`]s against one replica
//! queue. Workers share nothing but the broker, the read-only handler
//! registry and atomic counters; there is no ordering across workers and
//! convergence relies on revision comparison in the apply engine.
//!
//! # Lifecycle
//!
//! See [`PoolState`]. Each generation of workers shares one
//! `CancellationToken`. Reload and shutdown cancel it, wait for every worker
//! to finish its in-flight message, and (for reload) spawn a new generation
//! with the new configuration.
//!
//! # Example
//!
//! ```rust,no_run
//! use cqrs_replication::apply::{MemoryReplicaStore, ReplicaModel, ReplicaRegistry};
//! use cqrs_replication::config::ReplicationConfig;
//! use cqrs_replication::consumer::ConsumerPool;
//! use cqrs_replication::transport::memory::InMemoryTransport;
//! use std::sync::Arc;
//!
//! # async fn example() -> cqrs_replication::Result<()> {
//! let mut registry = ReplicaRegistry::new();
//! registry.register(ReplicaModel::new("author", "id", ["id", "name"], Arc::new(MemoryReplicaStore::new())))?;
//!
//! let config = ReplicationConfig::default();
//! let mut pool = ConsumerPool::new(&config, Arc::new(InMemoryTransport::new()), registry)?;
//! pool.start().await?;
//! // ...
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod retry;
pub mod types;
pub mod worker;

pub use retry::{RetryDecision, RetryState};
pub use types::{ConsumerStats, DeliveryState, PoolState, StatsSnapshot};
pub use worker::Worker;

use crate::apply::ReplicaRegistry;
use crate::config::{ConsumerConfig, ReplicationConfig};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::transport::Transport;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Supervisor of a queue's workers.
pub struct ConsumerPool<T: Transport> {
    queue: String,
    transport: Arc<T>,
    registry: Arc<ReplicaRegistry>,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,

    state_tx: watch::Sender<PoolState>,
    state_rx: watch::Receiver<PoolState>,

    /// Cancels the current generation of workers.
    generation: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Transport> ConsumerPool<T> {
    /// Build a pool for `config.service_name`. The whole config is validated.
    pub fn new(config: &ReplicationConfig, transport: Arc<T>, registry: ReplicaRegistry) -> Result<Self> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(PoolState::Created);

        Ok(Self {
            queue: config.service_name.clone(),
            transport,
            registry: Arc::new(registry),
            config: config.consumer.clone(),
            stats: Arc::new(ConsumerStats::default()),
            state_tx,
            state_rx,
            generation: None,
            handles: Vec::new(),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn state(&self) -> PoolState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<PoolState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Workers of the current generation that have not exited.
    pub fn active_workers(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    fn set_state(&self, state: PoolState) {
        let _ = self.state_tx.send(state);
        metrics::set_pool_state(&self.queue, &state.to_string());
    }

    /// Spawn the workers.
    ///
    /// Allowed from `Created` or `Stopped`.
    pub async fn start(&mut self) -> Result<()> {
        let state = self.state();
        if !matches!(state, PoolState::Created | PoolState::Stopped) {
            return Err(ReplicationError::InvalidState {
                expected: "Created or Stopped".to_string(),
                actual: state.to_string(),
            });
        }

        info!(queue = %self.queue, workers = self.config.workers, "Starting consumer pool");
        self.set_state(PoolState::Starting);

        if let Err(e) = self.check_startup() {
            error!(queue = %self.queue, error = %e, "Consumer pool failed to start");
            self.set_state(PoolState::Failed);
            return Err(e);
        }

        self.spawn_workers();
        self.set_state(PoolState::Running);
        info!(queue = %self.queue, workers = self.handles.len(), "Consumer pool running");
        Ok(())
    }

    fn check_startup(&self) -> Result<()> {
        self.config.validate()?;
        if self.registry.is_empty() {
            return Err(ReplicationError::Config("no replica handlers registered".into()));
        }
        Ok(())
    }

    fn spawn_workers(&mut self) {
        let token = CancellationToken::new();

        for id in 0..self.config.workers {
            let worker = Worker::new(
                id,
                self.queue.clone(),
                Arc::clone(&self.transport),
                Arc::clone(&self.registry),
                self.config.clone(),
                Arc::clone(&self.stats),
            );
            self.handles.push(tokio::spawn(worker.run(token.clone())));
            debug!(queue = %self.queue, worker_id = id, "Spawned worker");
        }

        self.generation = Some(token);
        metrics::set_active_workers(&self.queue, self.handles.len());
    }

    /// Cancel the current generation and wait for every worker to exit.
    ///
    /// Workers finish their in-flight message first. A worker still running
    /// after `drain_timeout` is logged and waited for.
    async fn drain(&mut self) {
        if let Some(token) = self.generation.take() {
            token.cancel();
        }

        let handles = std::mem::take(&mut self.handles);
        let task_count = handles.len();
        if task_count > 0 {
            info!(queue = %self.queue, task_count, "Waiting for workers to drain");
        }

        let drain_timeout = self.config.drain_timeout_duration();
        for (i, mut handle) in handles.into_iter().enumerate() {
            let joined = match tokio::time::timeout(drain_timeout, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(worker_id = i, "Worker still busy after drain timeout, waiting");
                    handle.await
                }
            };
            match joined {
                Ok(()) => debug!(worker_id = i, "Worker exited"),
                Err(e) => warn!(worker_id = i, error = %e, "Worker panicked"),
            }
        }

        metrics::set_active_workers(&self.queue, 0);
    }

    /// Restart every worker with a new configuration.
    ///
    /// An invalid configuration is rejected before anything is stopped.
    pub async fn reload(&mut self, config: ConsumerConfig) -> Result<()> {
        let state = self.state();
        if state != PoolState::Running {
            return Err(ReplicationError::InvalidState {
                expected: "Running".to_string(),
                actual: state.to_string(),
            });
        }
        config.validate()?;

        info!(
            queue = %self.queue,
            workers = config.workers,
            "Reloading consumer pool"
        );
        self.set_state(PoolState::Reloading);
        self.drain().await;

        self.config = config;
        self.spawn_workers();
        self.set_state(PoolState::Running);
        info!(queue = %self.queue, workers = self.handles.len(), "Consumer pool reloaded");
        Ok(())
    }

    /// Stop every worker gracefully.
    pub async fn shutdown(&mut self) {
        if matches!(self.state(), PoolState::Stopped) {
            return;
        }

        info!(queue = %self.queue, "Shutting down consumer pool");
        self.set_state(PoolState::ShuttingDown);
        self.drain().await;
        self.set_state(PoolState::Stopped);
        info!(queue = %self.queue, "Consumer pool stopped");
    }

    /// Run the pool until `shutdown` is cancelled, reloading on config changes.
    ///
    /// Starts the pool if it is not running yet. If the config sender goes
    /// away the pool keeps running on its last configuration.
    pub async fn supervise(
        mut self,
        mut config_rx: watch::Receiver<ConsumerConfig>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if self.state() != PoolState::Running {
            self.start().await?;
        }

        let mut config_open = true;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = config_rx.changed(), if config_open => {
                    if changed.is_err() {
                        debug!(queue = %self.queue, "Config channel closed");
                        config_open = false;
                        continue;
                    }
                    let next = config_rx.borrow_and_update().clone();
                    if next == self.config {
                        continue;
                    }
                    if let Err(e) = self.reload(next).await {
                        warn!(queue = %self.queue, error = %e, "Rejected config update");
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }
}

impl<T: Transport> Drop for ConsumerPool<T> {
    fn drop(&mut self) {
        if let Some(token) = self.generation.take() {
            token.cancel();
        }
    }
}

impl<T: Transport> std::fmt::Debug for ConsumerPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerPool")
            .field("queue", &self.queue)
            .field("state", &self.state())
            .field("workers", &self.handles.len())
            .field("registry", &self.registry)
            .finish()
    }
}
