// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Idempotent sink writes.
//!
//! # Decision Order
//!
//! ```text
//! sink not accepting writes ─────────────► Failed(Backpressure)
//! natural key present ───────────────────► SkippedDuplicate(NaturalKey)
//! [content-derived] uuid present ────────► SkippedDuplicate(Identity)
//! insert → Conflict ─────────────────────► SkippedDuplicate(Conflict)
//! insert → Inserted ─────────────────────► Inserted { uuid }
//! ```
//!
//! Failures never propagate as errors: each write yields exactly one
//! [`WriteOutcome`], and the run keeps going. Nothing is retried within a run.

use crate::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use crate::fingerprint::{IdentityStrategy, RecordFingerprinter};
use crate::record::{AuditRecord, SinkRecord};
use crate::resilience::{RateLimitConfig, RateLimiter};
use crate::sink::{InsertOutcome, SinkError, SinkStore};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a record was not inserted because it already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DuplicateReason {
    /// A row with the same `(session_id, event_timestamp)` exists.
    NaturalKey,
    /// A row with the same content-derived uuid exists.
    Identity,
    /// The sink's uniqueness constraint fired during insert.
    Conflict,
}

/// Why a write failed. The record stays in the source for the next run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Sink unreachable or timed out.
    Transient(String),
    /// Sink refused the row.
    Rejected(String),
    /// Sink reported it is not accepting writes.
    Backpressure,
    /// Circuit breaker is open.
    CircuitOpen,
}

/// Result of writing one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted { uuid: String },
    SkippedDuplicate(DuplicateReason),
    Failed(FailureReason),
}

impl WriteOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Inserted { .. } => "inserted",
            Self::SkippedDuplicate(_) => "skipped_duplicate",
            Self::Failed(_) => "failed",
        }
    }

    pub fn reason_label(&self) -> &'static str {
        match self {
            Self::Inserted { .. } => "none",
            Self::SkippedDuplicate(DuplicateReason::NaturalKey) => "natural_key",
            Self::SkippedDuplicate(DuplicateReason::Identity) => "identity",
            Self::SkippedDuplicate(DuplicateReason::Conflict) => "conflict",
            Self::Failed(FailureReason::Transient(_)) => "transient",
            Self::Failed(FailureReason::Rejected(_)) => "rejected",
            Self::Failed(FailureReason::Backpressure) => "backpressure",
            Self::Failed(FailureReason::CircuitOpen) => "circuit_open",
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }
}

impl fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inserted { uuid } => write!(f, "inserted ({uuid})"),
            Self::Failed(FailureReason::Transient(m)) | Self::Failed(FailureReason::Rejected(m)) => {
                write!(f, "failed ({}: {m})", self.reason_label())
            }
            other => write!(f, "{} ({})", other.label(), other.reason_label()),
        }
    }
}

/// Writes sanitized records to a sink, at most one row per record.
pub struct SinkWriter<S: SinkStore> {
    sink: Arc<S>,
    fingerprinter: Arc<RecordFingerprinter>,
    identity: IdentityStrategy,
    circuit: CircuitBreaker,
    rate_limiter: Option<RateLimiter>,
}

impl<S: SinkStore> SinkWriter<S> {
    pub fn new(
        sink: Arc<S>,
        fingerprinter: Arc<RecordFingerprinter>,
        identity: IdentityStrategy,
        circuit: CircuitConfig,
    ) -> Self {
        Self {
            sink,
            fingerprinter,
            identity,
            circuit: CircuitBreaker::new("sink_writes", circuit),
            rate_limiter: None,
        }
    }

    /// Throttle writes with a token bucket.
    #[must_use]
    pub fn with_rate_limit(mut self, config: Option<RateLimitConfig>) -> Self {
        self.rate_limiter = config.map(RateLimiter::new);
        self
    }

    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub fn identity(&self) -> IdentityStrategy {
        self.identity
    }

    /// Write one already-sanitized record.
    pub async fn write(&self, record: AuditRecord) -> WriteOutcome {
        let outcome = self.write_inner(record).await;
        crate::metrics::record_write_outcome(&outcome);
        outcome
    }

    async fn write_inner(&self, record: AuditRecord) -> WriteOutcome {
        if !self.sink.should_accept_writes() {
            debug!(key = %record.natural_key(), "Sink not accepting writes");
            return WriteOutcome::Failed(FailureReason::Backpressure);
        }

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let key = record.natural_key();
        match self.circuit.call(|| self.dedup_and_insert(record)).await {
            Ok(outcome) => {
                match &outcome {
                    WriteOutcome::SkippedDuplicate(reason) => {
                        debug!(key = %key, ?reason, "Skipped duplicate");
                    }
                    WriteOutcome::Failed(reason) => {
                        warn!(key = %key, ?reason, "Sink rejected record");
                    }
                    WriteOutcome::Inserted { uuid } => {
                        debug!(key = %key, uuid = %uuid, "Inserted record");
                    }
                }
                outcome
            }
            Err(CircuitError::Rejected) => WriteOutcome::Failed(FailureReason::CircuitOpen),
            Err(CircuitError::Inner(e)) => {
                warn!(key = %key, error = %e, "Sink write failed");
                WriteOutcome::Failed(FailureReason::Transient(e.to_string()))
            }
        }
    }

    /// Existence checks then insert. Only transient sink errors escape as
    /// `Err`, so only they count against the circuit.
    async fn dedup_and_insert(&self, record: AuditRecord) -> Result<WriteOutcome, SinkError> {
        match self.try_dedup_and_insert(record).await {
            Err(SinkError::Rejected(message)) => Ok(WriteOutcome::Failed(FailureReason::Rejected(message))),
            other => other,
        }
    }

    async fn try_dedup_and_insert(&self, record: AuditRecord) -> Result<WriteOutcome, SinkError> {
        let key = record.natural_key();
        if self.sink.contains_natural_key(&key).await? {
            return Ok(WriteOutcome::SkippedDuplicate(DuplicateReason::NaturalKey));
        }

        let uuid = self.fingerprinter.assign_identity(&record, self.identity);
        if self.identity == IdentityStrategy::ContentDerived && self.sink.contains_uuid(&uuid).await? {
            return Ok(WriteOutcome::SkippedDuplicate(DuplicateReason::Identity));
        }

        let row = SinkRecord { uuid, record };
        match self.sink.insert(&row).await? {
            InsertOutcome::Inserted => Ok(WriteOutcome::Inserted { uuid: row.uuid }),
            InsertOutcome::Conflict => Ok(WriteOutcome::SkippedDuplicate(DuplicateReason::Conflict)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NaturalKey;
    use crate::sink::{MemorySink, SinkResult};
    use crate::source::BoxFuture;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn record(session: &str) -> AuditRecord {
        let ts = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap().and_hms_opt(1, 0, 0).unwrap();
        AuditRecord::new("Standard", session, ts)
    }

    fn writer<S: SinkStore>(sink: Arc<S>, identity: IdentityStrategy) -> SinkWriter<S> {
        SinkWriter::new(sink, Arc::new(RecordFingerprinter::default()), identity, CircuitConfig::default())
    }

    /// Sink double with scripted answers.
    #[derive(Default)]
    struct ScriptedSink {
        has_key: bool,
        has_uuid: bool,
        conflict: bool,
        unavailable: bool,
        rejecting: bool,
        paused: AtomicBool,
        inserts: AtomicUsize,
        uuid_checks: AtomicUsize,
    }

    impl SinkStore for ScriptedSink {
        fn should_accept_writes(&self) -> bool {
            !self.paused.load(Ordering::SeqCst)
        }

        fn contains_natural_key<'a>(&'a self, _key: &'a NaturalKey) -> BoxFuture<'a, SinkResult<bool>> {
            Box::pin(async move {
                if self.unavailable {
                    return Err(SinkError::Unavailable("connection reset".into()));
                }
                Ok(self.has_key)
            })
        }

        fn contains_uuid<'a>(&'a self, _uuid: &'a str) -> BoxFuture<'a, SinkResult<bool>> {
            self.uuid_checks.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(self.has_uuid) })
        }

        fn insert<'a>(&'a self, _record: &'a SinkRecord) -> BoxFuture<'a, SinkResult<InsertOutcome>> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if self.rejecting {
                    return Err(SinkError::Rejected("NOT NULL constraint failed".into()));
                }
                Ok(if self.conflict { InsertOutcome::Conflict } else { InsertOutcome::Inserted })
            })
        }
    }

    #[tokio::test]
    async fn test_insert_then_duplicate_by_natural_key() {
        let sink = Arc::new(MemorySink::new());
        let w = writer(sink.clone(), IdentityStrategy::Random);

        let first = w.write(record("s1")).await;
        assert!(first.is_inserted());
        let second = w.write(record("s1")).await;
        assert_eq!(second, WriteOutcome::SkippedDuplicate(DuplicateReason::NaturalKey));
        assert_eq!(sink.len().await, 1);
    }

    #[tokio::test]
    async fn test_uuid_never_regenerated_for_stored_record() {
        let sink = Arc::new(MemorySink::new());
        let w = writer(sink.clone(), IdentityStrategy::Random);

        let WriteOutcome::Inserted { uuid } = w.write(record("s1")).await else {
            panic!("expected insert");
        };
        w.write(record("s1")).await;
        assert_eq!(sink.get(&record("s1").natural_key()).await.unwrap().uuid, uuid);
    }

    #[tokio::test]
    async fn test_random_identity_skips_uuid_check() {
        let sink = Arc::new(ScriptedSink { has_uuid: true, ..Default::default() });
        let w = writer(sink.clone(), IdentityStrategy::Random);

        assert!(w.write(record("s1")).await.is_inserted());
        assert_eq!(sink.uuid_checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_content_derived_identity_duplicate() {
        let sink = Arc::new(ScriptedSink { has_uuid: true, ..Default::default() });
        let w = writer(sink.clone(), IdentityStrategy::ContentDerived);

        assert_eq!(
            w.write(record("s1")).await,
            WriteOutcome::SkippedDuplicate(DuplicateReason::Identity)
        );
        assert_eq!(sink.inserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_insert_conflict_is_duplicate() {
        let sink = Arc::new(ScriptedSink { conflict: true, ..Default::default() });
        let w = writer(sink, IdentityStrategy::Random);
        assert_eq!(
            w.write(record("s1")).await,
            WriteOutcome::SkippedDuplicate(DuplicateReason::Conflict)
        );
    }

    #[tokio::test]
    async fn test_transient_failure_reported() {
        let sink = Arc::new(ScriptedSink { unavailable: true, ..Default::default() });
        let w = writer(sink, IdentityStrategy::Random);
        assert!(matches!(
            w.write(record("s1")).await,
            WriteOutcome::Failed(FailureReason::Transient(_))
        ));
        assert_eq!(w.circuit().failures(), 1);
    }

    #[tokio::test]
    async fn test_rejected_row_does_not_count_against_circuit() {
        let sink = Arc::new(ScriptedSink { rejecting: true, ..Default::default() });
        let w = writer(sink, IdentityStrategy::Random);
        for _ in 0..50 {
            assert!(matches!(
                w.write(record("s1")).await,
                WriteOutcome::Failed(FailureReason::Rejected(_))
            ));
        }
        assert_eq!(w.circuit().failures(), 0);
        assert_eq!(w.circuit().rejections(), 0);
    }

    #[tokio::test]
    async fn test_backpressure_fails_without_touching_sink() {
        let sink = Arc::new(ScriptedSink::default());
        sink.paused.store(true, Ordering::SeqCst);
        let w = writer(sink.clone(), IdentityStrategy::Random);

        assert_eq!(w.write(record("s1")).await, WriteOutcome::Failed(FailureReason::Backpressure));
        assert_eq!(sink.inserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast() {
        let sink = Arc::new(ScriptedSink { unavailable: true, ..Default::default() });
        let w = SinkWriter::new(
            sink,
            Arc::new(RecordFingerprinter::default()),
            IdentityStrategy::Random,
            CircuitConfig::for_testing(),
        );

        let mut circuit_open = 0;
        for _ in 0..20 {
            if w.write(record("s1")).await == WriteOutcome::Failed(FailureReason::CircuitOpen) {
                circuit_open += 1;
            }
        }
        assert!(circuit_open > 0);
    }

    #[tokio::test]
    async fn test_rate_limited_writer_still_writes() {
        let sink = Arc::new(MemorySink::new());
        let w = writer(sink.clone(), IdentityStrategy::Random)
            .with_rate_limit(Some(RateLimitConfig { burst_size: 10, refill_rate: 1000 }));
        for i in 0..5 {
            assert!(w.write(record(&format!("s{i}"))).await.is_inserted());
        }
        assert_eq!(sink.len().await, 5);
    }

    #[test]
    fn test_outcome_labels() {
        let outcome = WriteOutcome::Failed(FailureReason::Transient("reset".into()));
        assert_eq!(outcome.label(), "failed");
        assert_eq!(outcome.reason_label(), "transient");
        assert_eq!(outcome.to_string(), "failed (transient: reset)");
        assert_eq!(
            WriteOutcome::SkippedDuplicate(DuplicateReason::NaturalKey).to_string(),
            "skipped_duplicate (natural_key)"
        );
    }
}
