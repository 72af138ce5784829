// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Page fetch latency and size
//! - Write outcomes (inserted, duplicate, failed)
//! - Run results and durations
//! - Scheduler tick skips
//! - Circuit breaker calls
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `audit_replication_` and follow Prometheus
//! conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The crate only emits through the `metrics` facade. Installing a recorder
//! (Prometheus exporter or otherwise) is up to the embedding process.

use crate::coordinator::{EngineState, RunStatus, RunSummary};
use crate::writer::WriteOutcome;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a successful page fetch.
pub fn record_page_fetch(rows: usize, duration: Duration) {
    counter!("audit_replication_pages_fetched_total").increment(1);
    counter!("audit_replication_rows_fetched_total").increment(rows as u64);
    histogram!("audit_replication_page_fetch_duration_seconds").record(duration.as_secs_f64());
    histogram!("audit_replication_page_rows").record(rows as f64);
}

/// Record a failed page fetch by kind ("unavailable", "query").
pub fn record_page_fetch_error(kind: &'static str) {
    counter!("audit_replication_page_fetch_errors_total", "kind" => kind).increment(1);
}

/// Record a source row that could not be decoded.
pub fn record_row_rejected() {
    counter!("audit_replication_rows_rejected_total").increment(1);
}

/// Record the outcome of one sink write.
pub fn record_write_outcome(outcome: &WriteOutcome) {
    counter!(
        "audit_replication_writes_total",
        "outcome" => outcome.label(),
        "reason" => outcome.reason_label()
    )
    .increment(1);
}

/// Record a finished run.
pub fn record_run_complete(summary: &RunSummary) {
    let status = match &summary.status {
        RunStatus::Completed => "completed",
        RunStatus::Aborted(_) => "aborted",
        RunStatus::Abandoned => "abandoned",
    };
    counter!("audit_replication_runs_total", "status" => status).increment(1);
    histogram!("audit_replication_run_duration_seconds").record(summary.duration.as_secs_f64());
    gauge!("audit_replication_last_run_inserted").set(summary.inserted as f64);
    gauge!("audit_replication_last_run_failed").set(summary.failed as f64);
    gauge!("audit_replication_last_run_pages").set(summary.pages_fetched as f64);
}

/// Record a tick skipped because a run was still executing.
pub fn record_tick_skipped() {
    counter!("audit_replication_ticks_skipped_total").increment(1);
}

/// Record whether a run currently holds the gate.
pub fn set_run_in_flight(in_flight: bool) {
    gauge!("audit_replication_run_in_flight").set(if in_flight { 1.0 } else { 0.0 });
}

/// Record the engine lifecycle state.
pub fn set_engine_state(state: EngineState) {
    gauge!("audit_replication_engine_state").set(state as u8 as f64);
}

/// Record a circuit breaker call result ("success", "failure", "rejected").
pub fn record_circuit_call(circuit: &str, result: &'static str) {
    counter!(
        "audit_replication_circuit_calls_total",
        "circuit" => circuit.to_string(),
        "result" => result
    )
    .increment(1);
}

/// Record a SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_sqlite_retry(operation: &str) {
    counter!("audit_replication_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record an SLO violation.
pub fn record_slo_violation(slo: &'static str) {
    counter!("audit_replication_slo_violations_total", "slo" => slo).increment(1);
}
