// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the audit replicator.
//!
//! Run-level failures surface as [`ReplicationError`]. Per-record problems never
//! do: they are folded into the run's [`RunSummary`](crate::RunSummary) as
//! `failed` or `skipped_duplicate` counts.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `SourceUnavailable` | Yes | Source store unreachable, run aborted |
//! | `Query` | No | Page query rejected (bad window, bad SQL) |
//! | `SinkUnavailable` | Yes | Sink unreachable, record left for next run |
//! | `Sink` | No | Local SQLite adapter error |
//! | `Record` | No | Row could not be mapped to an audit record |
//! | `Config` | No | Configuration invalid |
//! | `RunInProgress` | Yes | A run already holds the gate |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Nothing is retried in place. A retryable error means the next scheduled
//! run is expected to succeed where this one did not.

use crate::record::RecordError;
use crate::sink::SinkError;
use crate::source::SourceError;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The source store could not be reached.
    ///
    /// Aborts the current run. The next tick starts over from page 1.
    #[error("Source unavailable: {message}")]
    SourceUnavailable { message: String },

    /// The page query was rejected.
    ///
    /// Covers invalid page coordinates as well as SQL the source refused.
    #[error("Query error: {message}")]
    Query { message: String },

    /// The sink store could not be reached.
    #[error("Sink unavailable: {0}")]
    SinkUnavailable(String),

    /// SQLite error inside one of the bundled adapters.
    #[error("Sink store error: {0}")]
    Sink(#[from] sqlx::Error),

    /// A source row could not be mapped to an audit record.
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Invalid or missing configuration.
    ///
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A replication run is already executing.
    ///
    /// Returned by the manual trigger when the run gate is held.
    #[error("Replication run already in progress")]
    RunInProgress,

    /// Engine state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running engine).
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
    /// Create a query error from any message.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Create a source-unavailable error from any message.
    pub fn source_unavailable(message: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceUnavailable { .. } => true,
            Self::SinkUnavailable(_) => true,
            Self::RunInProgress => true,
            Self::Query { .. } => false, // Same SQL fails the same way next tick
            Self::Sink(_) => false,
            Self::Record(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label used for metrics and abort reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::Query { .. } => "query",
            Self::SinkUnavailable(_) => "sink_unavailable",
            Self::Sink(_) => "sink",
            Self::Record(_) => "record",
            Self::Config(_) => "config",
            Self::RunInProgress => "run_in_progress",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<SourceError> for ReplicationError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Unavailable(message) => Self::SourceUnavailable { message },
            SourceError::Query(message) => Self::Query { message },
        }
    }
}

impl From<SinkError> for ReplicationError {
    fn from(e: SinkError) -> Self {
        match e {
            SinkError::Unavailable(message) => Self::SinkUnavailable(message),
            SinkError::Rejected(message) => Self::Internal(format!("sink rejected write: {message}")),
        }
    }
}
