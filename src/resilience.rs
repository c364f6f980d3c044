// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection retry policy.
//!
//! Two shapes are used:
//!
//! - [`RetryConfig::startup`]: bounded exponential backoff for the first broker
//!   connection, so a wrong URL fails the boot instead of hanging it.
//! - [`RetryConfig::fixed`]: a constant delay, retried forever. Consumer
//!   workers reconnect this way after losing their channel.

use std::time::Duration;

/// Configuration for connection retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    /// `usize::MAX` retries forever.
    pub max_attempts: usize,

    /// Delay after the first failed attempt.
    pub initial_delay: Duration,

    /// Ceiling for the backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (1.0 = fixed delay).
    pub backoff_factor: f64,

    /// Timeout for each individual connection attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Bounded retry for the initial broker connection.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        500ms
    /// 2        750ms
    /// 3        1.12s
    /// ...
    /// 10+      10s (cap)
    /// ```
    pub fn startup() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 1.5,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Constant delay, never gives up.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Override the per-attempt timeout.
    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(delay_secs)
    }
}
