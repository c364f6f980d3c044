// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumer worker: receive, apply, retry, dead-letter.
//!
//! Each worker owns one broker channel and one [`DelayQueue`]. The loop:
//!
//! 1. Requeues every delayed message whose ETA has passed
//! 2. Receives up to `prefetch` deliveries, blocking no longer than the time
//!    until the next delayed message is due
//! 3. Processes each delivery to completion before looking at cancellation
//!
//! # Delivery Outcomes
//!
//! | Situation | Action |
//! |-----------|--------|
//! | Malformed body, unknown signal | NACK |
//! | Entity type outside the allow-list | ACK, skipped |
//! | Expired envelope | ACK, skipped |
//! | No registered handler | NACK |
//! | Applied / permanent rejection | ACK |
//! | Transient rejection | park in delay queue, later republish + NACK |
//! | Transient, retries exhausted | dead-letter + NACK |
//!
//! # Connection Loss
//!
//! Any channel error drops the channel, discards the delay queue and
//! reconnects after `reconnect_delay`, forever. Unacknowledged originals
//! (including the ones that were parked) are redelivered by the broker.

use super::retry::{RetryDecision, RetryState};
use super::types::{ConsumerStats, DeliveryState};
use crate::apply::{ApplyOutcome, ReplicaRegistry};
use crate::config::ConsumerConfig;
use crate::delay_queue::{DelayQueue, DelayedMessage};
use crate::envelope::{Envelope, EnvelopeError};
use crate::error::Result;
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::transport::{Channel, Delivery, DeliveryHandle, Subscription, Transport};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// A single consumer worker.
pub struct Worker<T: Transport> {
    id: usize,
    queue: String,
    transport: Arc<T>,
    registry: Arc<ReplicaRegistry>,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
    delayed: DelayQueue,
}

impl<T: Transport> Worker<T> {
    pub fn new(
        id: usize,
        queue: impl Into<String>,
        transport: Arc<T>,
        registry: Arc<ReplicaRegistry>,
        config: ConsumerConfig,
        stats: Arc<ConsumerStats>,
    ) -> Self {
        let delayed = DelayQueue::new(config.delay_queue_max_size);
        Self {
            id,
            queue: queue.into(),
            transport,
            registry,
            config,
            stats,
            delayed,
        }
    }

    /// Unique consumer name within the queue's group.
    pub fn consumer_name(&self) -> String {
        format!("{}-worker-{}", self.queue, self.id)
    }

    /// Registered entity types this worker is allowed to handle.
    pub fn subscription(&self) -> Subscription {
        Subscription {
            queue: self.queue.clone(),
            consumer: self.consumer_name(),
            entity_types: self
                .registry
                .entity_types()
                .into_iter()
                .filter(|e| self.config.handles(e))
                .collect(),
        }
    }

    pub fn delay_queue(&self) -> &DelayQueue {
        &self.delayed
    }

    // =========================================================================
    // Loop
    // =========================================================================

    /// Run until `token` is cancelled, reconnecting on channel loss.
    pub async fn run(self, token: CancellationToken) {
        let span = info_span!("worker", queue = %self.queue, worker_id = self.id);

        async move {
            info!("Starting consumer worker");
            let reconnect = RetryConfig::fixed(self.config.reconnect_delay_duration());
            let subscription = self.subscription();
            let mut attempt = 0usize;

            loop {
                let opened = tokio::select! {
                    _ = token.cancelled() => break,
                    result = self.transport.open_channel(&subscription) => result,
                };

                let mut channel = match opened {
                    Ok(channel) => {
                        attempt = 0;
                        info!(consumer = %subscription.consumer, "Channel open");
                        channel
                    }
                    Err(e) => {
                        attempt += 1;
                        let delay = reconnect.delay_for_attempt(attempt);
                        warn!(
                            error = %e,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Failed to open channel, retrying"
                        );
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                };

                match self.consume(channel.as_mut(), &token).await {
                    Ok(()) => break,
                    Err(e) => {
                        drop(channel);
                        let dropped = self.delayed.clear();
                        metrics::set_delay_queue_depth(&self.queue, self.id, 0);
                        metrics::record_reconnect(&self.queue);
                        ConsumerStats::incr(&self.stats.reconnects);
                        warn!(
                            error = %e,
                            dropped_redeliveries = dropped,
                            "Channel lost, reconnecting"
                        );

                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(reconnect.delay_for_attempt(1)) => {}
                        }
                    }
                }
            }

            let dropped = self.delayed.clear();
            metrics::set_delay_queue_depth(&self.queue, self.id, 0);
            if dropped > 0 {
                info!(dropped, "Discarded pending redeliveries, broker will redeliver originals");
            }
            info!("Consumer worker stopped");
        }
        .instrument(span)
        .await
    }

    /// Consume from one channel. `Ok` means cancelled, `Err` means the channel failed.
    async fn consume(&self, channel: &mut dyn Channel, token: &CancellationToken) -> Result<()> {
        let block = self.config.block_timeout_duration();

        loop {
            self.release_ready(channel, Utc::now()).await?;

            let wait = self.receive_timeout(block, Utc::now());
            let deliveries = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                result = channel.receive(self.config.prefetch, wait) => result?,
            };

            for delivery in deliveries {
                let handle = delivery.handle.clone();
                let state = self.process_delivery(channel, delivery).await?;
                trace!(delivery = %handle, state = %state, "Delivery settled");

                // Remaining deliveries stay unacked and are returned with the channel.
                if token.is_cancelled() {
                    return Ok(());
                }
            }
        }
    }

    /// How long a receive may block: never past the next delayed ETA.
    pub fn receive_timeout(&self, block: Duration, now: DateTime<Utc>) -> Duration {
        match self.delayed.next_eta() {
            Some(eta) => (eta - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(block)
                .max(Duration::from_millis(1)),
            None => block,
        }
    }

    // =========================================================================
    // Per-delivery processing
    // =========================================================================

    /// Take one delivery from `Received` to its final state.
    ///
    /// Errors are channel failures; the delivery is then left unsettled.
    pub async fn process_delivery(
        &self,
        channel: &mut dyn Channel,
        delivery: Delivery,
    ) -> Result<DeliveryState> {
        ConsumerStats::incr(&self.stats.received);
        metrics::record_consumed(&self.queue);

        let envelope = match Envelope::from_slice(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                let reason = match e {
                    EnvelopeError::UnknownSignal(_) => "unknown_signal",
                    _ => "malformed",
                };
                error!(delivery = %delivery.handle, error = %e, "Rejecting undecodable message");
                metrics::record_rejected("unknown", reason);
                ConsumerStats::incr(&self.stats.rejected);
                channel.nack(&delivery.handle).await?;
                return Ok(DeliveryState::Nacked);
            }
        };

        let span = info_span!(
            "delivery",
            entity_type = %envelope.entity_type,
            signal = %envelope.signal_type,
            key = ?envelope.instance_key,
            correlation_id = ?envelope.correlation_id,
            retries = envelope.retries,
        );
        self.handle_envelope(channel, delivery.handle, envelope)
            .instrument(span)
            .await
    }

    async fn handle_envelope(
        &self,
        channel: &mut dyn Channel,
        handle: DeliveryHandle,
        envelope: Envelope,
    ) -> Result<DeliveryState> {
        if !self.config.handles(&envelope.entity_type) {
            debug!("Entity type not handled by this consumer, skipping");
            metrics::record_rejected(&envelope.entity_type, "filtered");
            channel.ack(&handle).await?;
            return Ok(DeliveryState::Acked);
        }

        if envelope.is_expired(Utc::now()) {
            warn!(expires_at = ?envelope.expires_at, "Envelope expired, skipping");
            metrics::record_rejected(&envelope.entity_type, "expired");
            ConsumerStats::incr(&self.stats.rejected);
            channel.ack(&handle).await?;
            return Ok(DeliveryState::Acked);
        }

        let Some(handler) = self.registry.get(&envelope.entity_type) else {
            error!("No handler registered for entity type");
            metrics::record_rejected(&envelope.entity_type, "no_handler");
            ConsumerStats::incr(&self.stats.rejected);
            channel.nack(&handle).await?;
            return Ok(DeliveryState::Nacked);
        };

        trace!(state = %DeliveryState::Applying, "Applying");
        let started = Instant::now();
        let outcome = handler.apply(&envelope).await;
        metrics::record_apply_latency(&envelope.entity_type, started.elapsed());

        match outcome {
            ApplyOutcome::Applied(action) => {
                debug!(action = %action, "Applied");
                metrics::record_applied(&envelope.entity_type, action.as_str());
                ConsumerStats::incr(&self.stats.applied);
                channel.ack(&handle).await?;
                Ok(DeliveryState::Acked)
            }
            ApplyOutcome::RejectedPermanent(reason) => {
                error!(reason = %reason, "Permanent apply failure, message dropped");
                metrics::record_rejected(&envelope.entity_type, "permanent");
                ConsumerStats::incr(&self.stats.rejected);
                channel.ack(&handle).await?;
                Ok(DeliveryState::Acked)
            }
            ApplyOutcome::RejectedTransient(reason) => {
                warn!(reason = %reason, "Transient apply failure");
                self.schedule_retry(channel, handle, envelope).await
            }
        }
    }

    async fn schedule_retry(
        &self,
        channel: &mut dyn Channel,
        handle: DeliveryHandle,
        mut envelope: Envelope,
    ) -> Result<DeliveryState> {
        let retry = RetryState::new(
            envelope.retries,
            self.config.max_retries,
            self.config.retry_delay_duration(),
        );

        match retry.decide(Utc::now()) {
            RetryDecision::DeadLetter => {
                channel
                    .dead_letter(&envelope, self.config.dead_message_ttl())
                    .await?;
                channel.nack(&handle).await?;
                error!(
                    max_retries = self.config.max_retries,
                    "Retries exhausted, message dead-lettered"
                );
                metrics::record_dead_lettered(&self.queue, &envelope.entity_type);
                ConsumerStats::incr(&self.stats.dead_lettered);
                Ok(DeliveryState::DeadLettered)
            }
            RetryDecision::Redeliver { retries, eta } => {
                envelope.retries = retries;
                let entity_type = envelope.entity_type.clone();
                let message = DelayedMessage::new(handle, envelope, eta);

                if let Err(full) = self.delayed.put(message) {
                    warn!(max_size = full.max_size, "Delay queue full, releasing earliest message");
                    if let Some(earliest) = self.delayed.pop_earliest() {
                        self.requeue(channel, earliest, true).await?;
                    }
                    if let Err(still_full) = self.delayed.put(*full.message) {
                        self.requeue(channel, *still_full.message, true).await?;
                    }
                }

                debug!(retries, eta = %eta, "Redelivery scheduled");
                metrics::record_retry_scheduled(&self.queue, &entity_type);
                metrics::set_delay_queue_depth(&self.queue, self.id, self.delayed.len());
                ConsumerStats::incr(&self.stats.retries_scheduled);
                Ok(DeliveryState::AwaitingRedelivery)
            }
        }
    }

    /// Republish a delayed message to this worker's queue, then NACK the original.
    async fn requeue(&self, channel: &mut dyn Channel, message: DelayedMessage, early: bool) -> Result<()> {
        let DelayedMessage {
            delivery,
            mut envelope,
            ..
        } = message;
        envelope.target_queue = Some(self.queue.clone());

        channel.publish(&envelope).await?;
        channel.nack(&delivery).await?;

        debug!(
            delivery = %delivery,
            entity_type = %envelope.entity_type,
            retries = envelope.retries,
            early,
            "Requeued delayed message"
        );
        metrics::record_requeued(&self.queue, early);
        ConsumerStats::incr(&self.stats.requeued);
        Ok(())
    }

    /// Requeue every delayed message due at `now`. Returns how many.
    pub async fn release_ready(&self, channel: &mut dyn Channel, now: DateTime<Utc>) -> Result<usize> {
        let mut released = 0;
        for message in self.delayed.drain_ready(now) {
            self.requeue(channel, message, false).await?;
            released += 1;
        }
        if released > 0 {
            metrics::set_delay_queue_depth(&self.queue, self.id, self.delayed.len());
        }
        Ok(released)
    }
}

impl<T: Transport> std::fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("delayed", &self.delayed)
            .finish()
    }
}
