// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dead-letter administration for one replica queue.
//!
//! Operators inspect dead letters as raw bodies (they may not even parse),
//! purge them, or replay them. Replay resets `retries`, restarts the expiry
//! clock from the replay time and publishes straight to the queue, so only
//! this consumer sees the message again.

use crate::config::ReplicationConfig;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::metrics;
use crate::transport::{DeadLetterEntry, DeadLetterStore, Transport};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Result of [`DeadLetterAdmin::retry_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Republished and removed.
    pub replayed: usize,
    /// Left in place because the body does not parse.
    pub skipped: usize,
}

pub struct DeadLetterAdmin<T> {
    transport: Arc<T>,
    queue: String,
    message_ttl: Option<Duration>,
}

impl<T: Transport + DeadLetterStore> DeadLetterAdmin<T> {
    /// Administer the dead letters of `config.service_name`.
    ///
    /// Replayed messages get the producer's message TTL.
    pub fn new(transport: Arc<T>, config: &ReplicationConfig) -> Self {
        Self {
            transport,
            queue: config.service_name.clone(),
            message_ttl: config.producer.message_ttl(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn count(&self) -> Result<usize> {
        self.transport.dead_letter_count(&self.queue).await
    }

    /// Raw bodies, oldest first.
    pub async fn dump(&self, limit: Option<usize>) -> Result<Vec<DeadLetterEntry>> {
        self.transport.dead_letters(&self.queue, limit).await
    }

    pub async fn purge(&self) -> Result<usize> {
        let purged = self.transport.purge_dead_letters(&self.queue).await?;
        info!(queue = %self.queue, purged, "Purged dead letters");
        Ok(purged)
    }

    fn replay_envelope(&self, mut envelope: Envelope, now: DateTime<Utc>) -> Envelope {
        envelope.retries = 0;
        envelope.expires_at = self
            .message_ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));
        envelope.target_queue = Some(self.queue.clone());
        envelope
    }

    /// Republish up to `limit` dead letters to this queue.
    ///
    /// An entry is removed only after it was published. A publish failure
    /// stops the replay and is returned; entries already replayed stay
    /// replayed.
    pub async fn retry_all(&self, now: DateTime<Utc>, limit: Option<usize>) -> Result<ReplayReport> {
        let entries = self.transport.dead_letters(&self.queue, limit).await?;
        let mut report = ReplayReport::default();

        for entry in entries {
            let envelope = match Envelope::from_slice(&entry.body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(queue = %self.queue, id = %entry.id, error = %e, "Skipping unparsable dead letter");
                    report.skipped += 1;
                    continue;
                }
            };

            let envelope = self.replay_envelope(envelope, now);
            if let Err(e) = self.transport.publish(&envelope).await {
                metrics::record_dead_letter_replay(&self.queue, report.replayed, report.skipped);
                return Err(e);
            }
            self.transport.remove_dead_letter(&self.queue, &entry.id).await?;
            report.replayed += 1;
        }

        metrics::record_dead_letter_replay(&self.queue, report.replayed, report.skipped);
        info!(
            queue = %self.queue,
            replayed = report.replayed,
            skipped = report.skipped,
            "Replayed dead letters"
        );
        Ok(report)
    }
}

impl<T> std::fmt::Debug for DeadLetterAdmin<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterAdmin")
            .field("queue", &self.queue)
            .field("message_ttl", &self.message_ttl)
            .finish()
    }
}
