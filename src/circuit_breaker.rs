// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker for the publish path.
//!
//! When the broker is down every emission would otherwise wait for a
//! connection timeout. The producer wraps publishes in a [`CircuitBreaker`]
//! built on the `recloser` crate, so once the broker is known to be failing,
//! publishes are rejected immediately until the recovery timeout elapses.
//!
//! # States
//!
//! - **Closed**: Normal operation, publishes pass through
//! - **Open**: Broker failing, publishes fail fast
//! - **HalfOpen**: Probing whether the broker recovered
//!
//! # Usage
//!
//! ```rust,no_run
//! # use cqrs_replication::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
//! # async fn example() -> Result<(), CircuitError<String>> {
//! let circuit = CircuitBreaker::new("publish", CircuitConfig::default());
//!
//! match circuit.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* published */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, broker presumed down */ }
//!     Err(CircuitError::Inner(e)) => { /* publish error */ }
//! }
//! # Ok(())
//! # }
//! ```

use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }

    /// Get the inner error if present.
    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Size of the sliding window of recent calls; the circuit opens when at
    /// least half of them failed.
    pub failure_threshold: u32,
    /// Number of probe calls in half-open before deciding.
    pub success_threshold: u32,
    /// How long to wait before attempting recovery (half-open).
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Fast recovery for testing.
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(0.5)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// The future built by `f` is not polled when the circuit rejects the call.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "rejected");
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Calls that ran and failed.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Calls refused while open.
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("calls_total", &self.calls_total())
            .field("failures", &self.failures())
            .field("rejections", &self.rejections())
            .finish()
    }
}
