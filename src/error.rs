// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are grouped by where they come from (broker, wire protocol, replica
//! storage, configuration) and carry enough context to be logged without the
//! original call site.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Broker unreachable, publish/ack failure |
//! | `CapacityExceeded` | Yes | Delay queue full (backpressure) |
//! | `Storage` | Transient only | Replica store failure |
//! | `Envelope` | No | Malformed payload, missing key, unknown signal |
//! | `Config` | No | Invalid settings or field mapping |
//! | `Serialization` | No | Envelope could not be encoded |
//! | `InvalidState` | No | Lifecycle method called in the wrong state |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`ReplicationError::is_retryable()`] separates faults that go away on their
//! own (network, lock contention, a full queue) from faults that need a code
//! or configuration change. Protocol faults are never retried: the same bytes
//! will fail the same way.

use crate::apply::StoreError;
use crate::envelope::EnvelopeError;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Broker connection or command error.
    ///
    /// Covers publish, receive and acknowledgement failures. Retryable: the
    /// consumer reconnects with a fixed backoff, the producer logs and drops.
    #[error("Transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// Wire protocol violation.
    ///
    /// The payload is not a valid envelope. Not retryable.
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    /// The delay queue is at capacity.
    ///
    /// Backpressure signal: retry after releasing queued messages.
    #[error("Delay queue at capacity ({max_size} messages)")]
    CapacityExceeded { max_size: usize },

    /// Replica storage failure.
    ///
    /// Retryable only when the store reported a transient condition
    /// (lock contention, timeout).
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Invalid or missing configuration.
    ///
    /// Raised at boot (settings, field mappings, duplicate registrations).
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Envelope encoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Lifecycle state machine violation.
    ///
    /// Occurs when e.g. `start()` is called on a pool that is already running.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without source
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::CapacityExceeded { .. } => true,
            Self::Storage(e) => e.is_transient(),
            Self::Envelope(_) => false, // Same bytes fail the same way
            Self::Config(_) => false,
            Self::Serialization(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for ReplicationError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}
