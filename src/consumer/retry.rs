// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry decision for transiently failed messages.
//!
//! The delay is fixed: every redelivery waits `retry_delay`, no backoff.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// What to do with a transiently failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Park until `eta`, then redeliver with `retries`.
    Redeliver { retries: u32, eta: DateTime<Utc> },
    /// Retries exhausted.
    DeadLetter,
}

/// Retry bookkeeping for one message, computed on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub retries: u32,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RetryState {
    pub fn new(retries: u32, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            retries,
            max_retries,
            retry_delay,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }

    pub fn decide(&self, now: DateTime<Utc>) -> RetryDecision {
        if self.exhausted() {
            return RetryDecision::DeadLetter;
        }
        let delay = chrono::Duration::from_std(self.retry_delay).unwrap_or(chrono::Duration::zero());
        RetryDecision::Redeliver {
            retries: self.retries + 1,
            eta: now.checked_add_signed(delay).unwrap_or(now),
        }
    }
}
