// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The main orchestrator that ties together:
//! - Page fetching via [`crate::pager::Pager`]
//! - Sanitization via [`crate::fingerprint::RecordFingerprinter`]
//! - Idempotent writes via [`crate::writer::SinkWriter`]
//! - The periodic trigger and its overlap guard ([`scheduler`])
//!
//! # Lifecycle
//!
//! 1. `new()` validates config and wires the run. State `Created`.
//! 2. `start()` spawns the scheduler (if enabled). State `Running`.
//! 3. `run_once()` triggers a run manually at any point before shutdown.
//! 4. `shutdown()` stops ticking and waits for the in-flight run.

mod run;
mod scheduler;
mod types;

pub use run::{ReplicationRun, RunSettings};
pub use scheduler::{RunCoordinator, RunGate, RunPermit};
pub use types::{AbortReason, EngineState, HealthCheck, RunStatus, RunSummary, SkippedBy};

use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::fingerprint::RecordFingerprinter;
use crate::metrics;
use crate::pager::{PageQuery, Pager};
use crate::sink::SinkStore;
use crate::source::SourceQuery;
use crate::writer::SinkWriter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `shutdown()` waits for the scheduler and its in-flight run.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// The replication engine.
///
/// Copies audit records from a [`SourceQuery`] into a [`SinkStore`], one run
/// at a time. The source is only ever read. The sink only ever gains rows.
pub struct ReplicationEngine<Src: SourceQuery, S: SinkStore> {
    config: ReplicationConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    sink: Arc<S>,

    /// Run gate, run executor and last result, shared with the scheduler task
    coordinator: Arc<RunCoordinator<Src, S>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    scheduler_handle: Option<JoinHandle<()>>,
}

impl<Src: SourceQuery, S: SinkStore> ReplicationEngine<Src, S> {
    /// Create an engine over a source and sink.
    ///
    /// Fails with `Config` if the configuration is invalid. Nothing is
    /// fetched until a run is triggered.
    pub fn new(config: ReplicationConfig, source: Arc<Src>, sink: Arc<S>) -> Result<Self> {
        Self::with_fingerprinter(config, source, sink, RecordFingerprinter::default())
    }

    /// Create an engine with a custom normalization rule set.
    pub fn with_fingerprinter(
        config: ReplicationConfig,
        source: Arc<Src>,
        sink: Arc<S>,
        fingerprinter: RecordFingerprinter,
    ) -> Result<Self> {
        config.validate()?;

        let fingerprinter = Arc::new(fingerprinter);
        let pager = Pager::new(source, PageQuery::from_config(&config.source)?);

        let rate_limit = config.writer.rate_limit_config();
        if let Some(cfg) = &rate_limit {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for sink writes"
            );
        }
        let writer = Arc::new(
            SinkWriter::new(
                Arc::clone(&sink),
                Arc::clone(&fingerprinter),
                config.sink.identity,
                config.writer.circuit_config(),
            )
            .with_rate_limit(rate_limit),
        );

        let settings = RunSettings {
            page_size: config.source.page_size,
            concurrency: config.writer.concurrency,
            channel_capacity: config.writer.channel_capacity,
            deadline: config.schedule.run_deadline_duration(),
            slo: config.slo.clone(),
        };
        let run = ReplicationRun::new(pager, fingerprinter, writer, settings);

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            state_tx,
            state_rx,
            sink,
            coordinator: Arc::new(RunCoordinator::new(run)),
            shutdown_tx,
            shutdown_rx,
            scheduler_handle: None,
        })
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Whether a run currently holds the gate.
    pub fn run_in_flight(&self) -> bool {
        self.coordinator.gate().is_running()
    }

    /// Ticks skipped because a run was still executing.
    pub fn ticks_skipped(&self) -> u64 {
        self.coordinator.ticks_skipped()
    }

    pub async fn last_summary(&self) -> Option<RunSummary> {
        self.coordinator.last_summary().await
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(state);
    }

    /// Health snapshot for monitoring endpoints. Performs no I/O.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let sink_accepting_writes = self.sink.should_accept_writes();
        let last_run = self.last_summary().await;
        let last_aborted = matches!(
            last_run.as_ref().map(|s| &s.status),
            Some(RunStatus::Aborted(_))
        );

        let ready = state == EngineState::Running && sink_accepting_writes;
        HealthCheck {
            state,
            ready,
            sink_accepting_writes,
            run_in_flight: self.run_in_flight(),
            runs_started: self.coordinator.run().runs_started(),
            ticks_skipped: self.ticks_skipped(),
            sink_circuit_open: self.coordinator.run().writer().circuit().is_likely_open(),
            last_run,
            healthy: ready && !last_aborted,
        }
    }

    /// Start the periodic trigger.
    ///
    /// With `schedule.enabled = false` the engine still moves to `Running`,
    /// and only `run_once()` starts runs.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            table = %self.config.source.table,
            page_size = self.config.source.page_size,
            identity = ?self.config.sink.identity,
            "Starting replication engine"
        );

        if self.config.schedule.enabled {
            let interval = self.config.schedule.interval_duration();
            let coordinator = Arc::clone(&self.coordinator);
            let shutdown_rx = self.shutdown_rx.clone();
            self.scheduler_handle = Some(tokio::spawn(async move {
                scheduler::run_scheduler(coordinator, interval, shutdown_rx).await;
            }));
            info!(interval_ms = interval.as_millis() as u64, "Spawned scheduler task");
        } else {
            info!("Scheduler disabled, runs start only via run_once()");
        }

        self.set_state(EngineState::Running);
        info!("Replication engine running");
        Ok(())
    }

    /// Trigger one run now.
    ///
    /// Returns `RunInProgress` if a run holds the gate, and the abort error
    /// if a page fetch failed. Record-level failures are reported inside
    /// `Ok(summary)`.
    pub async fn run_once(&self) -> Result<RunSummary> {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return Err(ReplicationError::Shutdown);
        }

        match self.coordinator.try_run().await {
            Some(summary) => summary.into_result(),
            None => {
                debug!("Manual trigger refused, run in progress");
                Err(ReplicationError::RunInProgress)
            }
        }
    }

    /// Shutdown the engine gracefully.
    ///
    /// 1. Refuse new manual runs and signal the scheduler to stop ticking
    /// 2. Wait for the scheduler and its in-flight run
    /// 3. Wait for a manual run still holding the gate
    ///
    /// Both waits share one `DRAIN_TIMEOUT` budget.
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);
        let drain_deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;

        if let Some(handle) = self.scheduler_handle.take() {
            match tokio::time::timeout_at(drain_deadline, handle).await {
                Ok(Ok(())) => debug!("Scheduler completed gracefully"),
                Ok(Err(e)) => warn!(error = %e, "Scheduler panicked during shutdown"),
                Err(_) => warn!("Scheduler timed out during shutdown (run left in flight)"),
            }
        }

        if self.run_in_flight() {
            info!("Waiting for manual run to finish");
            let gate = self.coordinator.gate();
            if tokio::time::timeout_at(drain_deadline, gate.wait_released())
                .await
                .is_err()
            {
                warn!("Manual run still in flight at drain timeout");
            }
        }

        self.set_state(EngineState::Stopped);
        info!("Replication engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AuditRecord, NaturalKey, SinkRecord};
    use crate::sink::{InsertOutcome, MemorySink, SinkResult};
    use crate::source::{BoxFuture, MemorySource};
    use chrono::NaiveDate;

    fn source(n: usize) -> Arc<MemorySource> {
        let base = NaiveDate::from_ymd_opt(2024, 5, 5).unwrap().and_hms_opt(5, 0, 0).unwrap();
        let records = (0..n)
            .map(|i| AuditRecord::new("Standard", format!("s{i}"), base + chrono::Duration::seconds(i as i64)));
        Arc::new(MemorySource::with_records(records))
    }

    fn engine(n: usize) -> ReplicationEngine<MemorySource, MemorySink> {
        ReplicationEngine::new(ReplicationConfig::for_testing(), source(n), Arc::new(MemorySink::new())).unwrap()
    }

    /// Memory sink that takes a few milliseconds per insert.
    struct SlowSink(MemorySink);

    impl SinkStore for SlowSink {
        fn contains_natural_key<'a>(&'a self, key: &'a NaturalKey) -> BoxFuture<'a, SinkResult<bool>> {
            self.0.contains_natural_key(key)
        }

        fn contains_uuid<'a>(&'a self, uuid: &'a str) -> BoxFuture<'a, SinkResult<bool>> {
            self.0.contains_uuid(uuid)
        }

        fn insert<'a>(&'a self, record: &'a SinkRecord) -> BoxFuture<'a, SinkResult<InsertOutcome>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.0.insert(record).await
            })
        }
    }

    #[test]
    fn test_engine_initial_state() {
        let engine = engine(0);
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());
        assert!(!engine.run_in_flight());
        assert_eq!(*engine.state_receiver().borrow(), EngineState::Created);
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let mut config = ReplicationConfig::for_testing();
        config.source.page_size = 0;
        let result = ReplicationEngine::new(config, Arc::new(MemorySource::new()), Arc::new(MemorySink::new()));
        assert!(matches!(result, Err(ReplicationError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_once_before_start() {
        let engine = engine(5);
        let summary = engine.run_once().await.unwrap();
        assert_eq!(summary.inserted, 5);
        assert_eq!(engine.last_summary().await.unwrap().run_id, summary.run_id);
        assert_eq!(engine.sink().len().await, 5);
    }

    #[tokio::test]
    async fn test_engine_start_invalid_state() {
        let mut engine = engine(0);
        engine.start().await.unwrap();
        assert!(engine.is_running());

        match engine.start().await {
            Err(ReplicationError::InvalidState { expected, actual }) => {
                assert_eq!(expected, "Created");
                assert_eq!(actual, "Running");
            }
            other => panic!("Expected InvalidState error, got {other:?}"),
        }
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_further_runs() {
        let mut engine = engine(1);
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(matches!(engine.run_once().await, Err(ReplicationError::Shutdown)));
    }

    #[tokio::test]
    async fn test_health_check_reflects_runs() {
        let mut engine = engine(3);
        let before = engine.health_check().await;
        assert!(!before.ready);
        assert!(before.last_run.is_none());

        engine.start().await.unwrap();
        engine.run_once().await.unwrap();
        let after = engine.health_check().await;
        assert!(after.ready);
        assert!(after.healthy);
        assert_eq!(after.runs_started, 1);
        assert_eq!(after.last_run.unwrap().inserted, 3);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_manual_run() {
        let sink = Arc::new(SlowSink(MemorySink::new()));
        let mut engine =
            ReplicationEngine::new(ReplicationConfig::for_testing(), source(20), Arc::clone(&sink)).unwrap();
        engine.start().await.unwrap();

        let coordinator = Arc::clone(&engine.coordinator);
        let manual = tokio::spawn(async move { coordinator.try_run().await });
        while !engine.run_in_flight() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!engine.run_in_flight());
        assert_eq!(sink.0.len().await, 20);

        let summary = manual.await.unwrap().expect("run held the gate");
        assert_eq!(summary.inserted, 20);
    }
}
