// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state and run result types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Running
//!    │                            │
//!    │ shutdown()                 │ shutdown()
//!    ↓                            ↓
//! Stopped ←──────────────── ShuttingDown
//! ```

use crate::error::{ReplicationError, Result};
use crate::writer::{DuplicateReason, WriteOutcome};
use std::time::Duration;

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// Engine created but not started. Manual runs are allowed.
    Created = 0,

    /// Scheduler is ticking.
    Running = 1,

    /// `shutdown()` called. Waiting for the in-flight run.
    ShuttingDown = 2,

    /// Shut down. Manual runs are refused.
    Stopped = 3,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Why a run stopped before the last page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortReason {
    /// [`ReplicationError::kind`] of the error that ended the run.
    pub kind: &'static str,
    pub message: String,
    /// Page whose fetch failed.
    pub page: u64,
}

impl AbortReason {
    pub fn from_error(error: &ReplicationError, page: u64) -> Self {
        let message = match error {
            ReplicationError::SourceUnavailable { message } | ReplicationError::Query { message } => {
                message.clone()
            }
            other => other.to_string(),
        };
        Self {
            kind: error.kind(),
            message,
            page,
        }
    }

    /// Rebuild the run-level error for callers of the manual trigger.
    pub fn to_error(&self) -> ReplicationError {
        match self.kind {
            "source_unavailable" => ReplicationError::source_unavailable(self.message.clone()),
            "query" => ReplicationError::query(self.message.clone()),
            _ => ReplicationError::Internal(self.message.clone()),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RunStatus {
    /// Reached a short or empty page.
    #[default]
    Completed,
    /// A page fetch failed.
    Aborted(AbortReason),
    /// The run deadline passed between records.
    Abandoned,
}

/// Duplicate counts split by which check fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkippedBy {
    pub natural_key: u64,
    pub identity: u64,
    pub conflict: u64,
}

/// Result of one replication run. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: u64,
    /// Rows returned by the source, decodable or not.
    pub fetched: u64,
    pub inserted: u64,
    pub skipped_duplicate: u64,
    pub failed: u64,
    /// Pages requested from the source, including a terminating empty one.
    pub pages_fetched: u64,
    pub first_page: Option<u64>,
    pub last_page: Option<u64>,
    pub skipped_by: SkippedBy,
    pub status: RunStatus,
    pub duration: Duration,
}

impl RunSummary {
    pub fn new(run_id: u64) -> Self {
        Self {
            run_id,
            ..Default::default()
        }
    }

    /// Count one page fetch.
    pub fn record_page(&mut self, number: u64, rows: u64) {
        self.pages_fetched += 1;
        self.fetched += rows;
        self.first_page.get_or_insert(number);
        self.last_page = Some(number);
    }

    /// Count one write outcome.
    pub fn record_outcome(&mut self, outcome: &WriteOutcome) {
        match outcome {
            WriteOutcome::Inserted { .. } => self.inserted += 1,
            WriteOutcome::SkippedDuplicate(reason) => {
                self.skipped_duplicate += 1;
                match reason {
                    DuplicateReason::NaturalKey => self.skipped_by.natural_key += 1,
                    DuplicateReason::Identity => self.skipped_by.identity += 1,
                    DuplicateReason::Conflict => self.skipped_by.conflict += 1,
                }
            }
            WriteOutcome::Failed(_) => self.failed += 1,
        }
    }

    /// Fold in write counts gathered by a writer task.
    pub fn merge_writes(&mut self, other: &RunSummary) {
        self.inserted += other.inserted;
        self.skipped_duplicate += other.skipped_duplicate;
        self.failed += other.failed;
        self.skipped_by.natural_key += other.skipped_by.natural_key;
        self.skipped_by.identity += other.skipped_by.identity;
        self.skipped_by.conflict += other.skipped_by.conflict;
    }

    /// Records that reached the writer or were rejected at decode.
    pub fn processed(&self) -> u64 {
        self.inserted + self.skipped_duplicate + self.failed
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// `Err` for aborted runs, `Ok` otherwise. Record failures stay in the summary.
    pub fn into_result(self) -> Result<RunSummary> {
        match &self.status {
            RunStatus::Aborted(reason) => Err(reason.to_error()),
            _ => Ok(self),
        }
    }
}

/// Health snapshot for monitoring endpoints. Collected without I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,

    /// Engine is running and its sink accepts writes.
    pub ready: bool,

    pub sink_accepting_writes: bool,

    /// A run currently holds the gate.
    pub run_in_flight: bool,

    pub runs_started: u64,
    pub ticks_skipped: u64,

    /// Sink circuit looks open from recent rejections.
    pub sink_circuit_open: bool,

    pub last_run: Option<RunSummary>,

    /// Ready and the last run, if any, was not aborted.
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::FailureReason;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn test_engine_state_gauge_values() {
        assert_eq!(EngineState::Created as u8, 0);
        assert_eq!(EngineState::Stopped as u8, 3);
    }

    #[test]
    fn test_summary_counts_outcomes() {
        let mut summary = RunSummary::new(7);
        summary.record_page(1, 3);
        summary.record_outcome(&WriteOutcome::Inserted { uuid: "u".into() });
        summary.record_outcome(&WriteOutcome::SkippedDuplicate(DuplicateReason::NaturalKey));
        summary.record_outcome(&WriteOutcome::Failed(FailureReason::Backpressure));

        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.skipped_duplicate, 1);
        assert_eq!(summary.skipped_by.natural_key, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.processed(), summary.fetched);
    }

    #[test]
    fn test_summary_page_range() {
        let mut summary = RunSummary::new(1);
        assert_eq!(summary.first_page, None);
        summary.record_page(1, 100);
        summary.record_page(2, 100);
        summary.record_page(3, 50);
        assert_eq!(summary.first_page, Some(1));
        assert_eq!(summary.last_page, Some(3));
        assert_eq!(summary.pages_fetched, 3);
        assert_eq!(summary.fetched, 250);
    }

    #[test]
    fn test_merge_writes() {
        let mut total = RunSummary::new(1);
        let mut worker = RunSummary::default();
        worker.record_outcome(&WriteOutcome::SkippedDuplicate(DuplicateReason::Conflict));
        worker.record_outcome(&WriteOutcome::Inserted { uuid: "a".into() });
        total.merge_writes(&worker);
        total.merge_writes(&worker);
        assert_eq!(total.inserted, 2);
        assert_eq!(total.skipped_by.conflict, 2);
        assert_eq!(total.run_id, 1);
    }

    #[test]
    fn test_into_result_only_errs_on_abort() {
        let mut summary = RunSummary::new(1);
        summary.record_outcome(&WriteOutcome::Failed(FailureReason::CircuitOpen));
        assert!(summary.clone().into_result().is_ok());

        summary.status = RunStatus::Abandoned;
        assert!(summary.clone().into_result().is_ok());

        let err = ReplicationError::source_unavailable("connection refused");
        summary.status = RunStatus::Aborted(AbortReason::from_error(&err, 2));
        match summary.into_result() {
            Err(ReplicationError::SourceUnavailable { message }) => {
                assert_eq!(message, "connection refused")
            }
            other => panic!("expected SourceUnavailable, got {other:?}"),
        }
    }
}
