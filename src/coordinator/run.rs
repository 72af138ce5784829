// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One end-to-end replication pass.
//!
//! ```text
//! page 1 ─► sanitize ─► write ─► count ─┐
//!   ▲                                   │ full page
//!   └──────────── page n + 1 ◄──────────┘
//!                                       │ short or empty page
//!                                       ▼
//!                                  RunSummary
//! ```
//!
//! A page fetch error aborts the run with the counts gathered so far. Record
//! failures never do. Every run starts at page 1: the sink's natural-key
//! check is what makes re-reading old pages cheap and harmless.
//!
//! # Pipelined Mode
//!
//! With `concurrency > 1` and a sink that declares atomic insert, the page
//! fetcher feeds a bounded channel drained by a fixed pool of writer tasks.
//! Memory stays bounded to one page plus the channel capacity. Against a
//! sink without atomic insert two writers could both pass the existence
//! check for the same key, so those sinks are always written sequentially.

use super::types::{AbortReason, RunStatus, RunSummary};
use crate::config::SloConfig;
use crate::fingerprint::RecordFingerprinter;
use crate::metrics;
use crate::pager::{Page, Pager};
use crate::record::AuditRecord;
use crate::sink::SinkStore;
use crate::source::SourceQuery;
use crate::writer::SinkWriter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Per-run knobs, resolved from config once.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub page_size: u64,
    pub concurrency: usize,
    pub channel_capacity: usize,
    pub deadline: Option<Duration>,
    pub slo: SloConfig,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            concurrency: 1,
            channel_capacity: 256,
            deadline: None,
            slo: SloConfig::default(),
        }
    }
}

/// Executes replication runs. Each [`execute`](Self::execute) call is one run
/// with a fresh run id; callers serialize runs through the run gate.
pub struct ReplicationRun<Src: SourceQuery, S: SinkStore> {
    pager: Pager<Src>,
    fingerprinter: Arc<RecordFingerprinter>,
    writer: Arc<SinkWriter<S>>,
    settings: RunSettings,
    pipelined: bool,
    last_run_id: AtomicU64,
}

impl<Src: SourceQuery, S: SinkStore> ReplicationRun<Src, S> {
    pub fn new(
        pager: Pager<Src>,
        fingerprinter: Arc<RecordFingerprinter>,
        writer: Arc<SinkWriter<S>>,
        settings: RunSettings,
    ) -> Self {
        let atomic = writer.sink().supports_atomic_insert();
        let pipelined = settings.concurrency > 1 && atomic;
        if settings.concurrency > 1 && !atomic {
            warn!(
                concurrency = settings.concurrency,
                "Sink lacks atomic insert, writing sequentially"
            );
        }

        Self {
            pager,
            fingerprinter,
            writer,
            settings,
            pipelined,
            last_run_id: AtomicU64::new(0),
        }
    }

    pub fn is_pipelined(&self) -> bool {
        self.pipelined
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn writer(&self) -> &Arc<SinkWriter<S>> {
        &self.writer
    }

    /// Run ids handed out so far.
    pub fn runs_started(&self) -> u64 {
        self.last_run_id.load(Ordering::Relaxed)
    }

    /// Replicate from page 1 until a short page, an abort, or the deadline.
    pub async fn execute(&self) -> RunSummary {
        let run_id = self.last_run_id.fetch_add(1, Ordering::Relaxed) + 1;
        let span = info_span!("replication_run", run_id);
        self.execute_inner(run_id).instrument(span).await
    }

    async fn execute_inner(&self, run_id: u64) -> RunSummary {
        let started = Instant::now();
        let deadline = self.settings.deadline.map(|d| started + d);
        let mut summary = RunSummary::new(run_id);

        info!(
            page_size = self.settings.page_size,
            pipelined = self.pipelined,
            "Starting replication run"
        );

        if self.pipelined {
            self.run_pipelined(&mut summary, deadline).await;
        } else {
            self.run_sequential(&mut summary, deadline).await;
        }

        summary.duration = started.elapsed();
        if self.settings.slo.is_run_duration_violation(summary.duration) {
            warn!(
                duration_ms = summary.duration.as_millis() as u64,
                slo_ms = self.settings.slo.max_run_duration_ms,
                "Run duration exceeded SLO"
            );
            metrics::record_slo_violation("run_duration");
        }

        match &summary.status {
            RunStatus::Completed => info!(
                fetched = summary.fetched,
                inserted = summary.inserted,
                skipped_duplicate = summary.skipped_duplicate,
                failed = summary.failed,
                pages = summary.pages_fetched,
                duration_ms = summary.duration.as_millis() as u64,
                "Replication run completed"
            ),
            RunStatus::Aborted(reason) => warn!(
                kind = reason.kind,
                page = reason.page,
                inserted = summary.inserted,
                failed = summary.failed,
                "Replication run aborted"
            ),
            RunStatus::Abandoned => warn!(
                inserted = summary.inserted,
                last_page = ?summary.last_page,
                "Replication run abandoned at deadline"
            ),
        }
        metrics::record_run_complete(&summary);
        summary
    }

    async fn run_sequential(&self, summary: &mut RunSummary, deadline: Option<Instant>) {
        let mut page_number = 1;
        loop {
            if page_number > 1 && past(deadline) {
                summary.status = RunStatus::Abandoned;
                return;
            }
            let Some(page) = self.fetch(page_number, summary).await else {
                return;
            };
            let last = page.is_short();

            for record in page.records {
                if past(deadline) {
                    summary.status = RunStatus::Abandoned;
                    return;
                }
                let outcome = self.writer.write(self.fingerprinter.sanitize(record)).await;
                summary.record_outcome(&outcome);
            }

            if last {
                return;
            }
            page_number += 1;
        }
    }

    async fn run_pipelined(&self, summary: &mut RunSummary, deadline: Option<Instant>) {
        let (tx, rx) = mpsc::channel::<AuditRecord>(self.settings.channel_capacity);
        let rx = Arc::new(Mutex::new(rx));
        // Shared so outcomes counted before a writer panics are kept.
        let tally = Arc::new(StdMutex::new(RunSummary::default()));

        let mut workers = JoinSet::new();
        for worker in 0..self.settings.concurrency {
            let rx = Arc::clone(&rx);
            let writer = Arc::clone(&self.writer);
            let tally = Arc::clone(&tally);
            workers.spawn(
                async move {
                    let mut written = 0u64;
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(record) = next else { break };
                        let outcome = writer.write(record).await;
                        lock(&tally).record_outcome(&outcome);
                        written += 1;
                    }
                    debug!(written, "Writer task drained");
                }
                .instrument(info_span!("writer", worker)),
            );
        }

        let sent = self.feed(summary, deadline, &tx).await;
        drop(tx);

        let mut panicked = 0u64;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Writer task panicked");
                panicked += 1;
            }
        }

        let writes = lock(&tally).clone();
        summary.merge_writes(&writes);
        if panicked == 0 {
            return;
        }

        // Records taken by a panicking writer never produced an outcome.
        let lost = sent.saturating_sub(writes.processed());
        summary.failed += lost;
        if !matches!(summary.status, RunStatus::Aborted(_)) {
            summary.status = RunStatus::Aborted(AbortReason {
                kind: "internal",
                message: format!("{panicked} writer task(s) panicked, {lost} record(s) unwritten"),
                page: summary.last_page.unwrap_or(1),
            });
        }
    }

    /// Producer half of pipelined mode. Returns how many records were queued.
    async fn feed(
        &self,
        summary: &mut RunSummary,
        deadline: Option<Instant>,
        tx: &mpsc::Sender<AuditRecord>,
    ) -> u64 {
        let mut sent = 0;
        let mut page_number = 1;
        loop {
            if page_number > 1 && past(deadline) {
                summary.status = RunStatus::Abandoned;
                return sent;
            }
            let Some(page) = self.fetch(page_number, summary).await else {
                return sent;
            };
            let last = page.is_short();

            for record in page.records {
                if past(deadline) {
                    summary.status = RunStatus::Abandoned;
                    return sent;
                }
                if tx.send(self.fingerprinter.sanitize(record)).await.is_err() {
                    error!("All writer tasks exited, stopping run");
                    summary.status = RunStatus::Aborted(AbortReason {
                        kind: "internal",
                        message: "writer tasks exited".to_string(),
                        page: page_number,
                    });
                    return sent;
                }
                sent += 1;
            }

            if last {
                return sent;
            }
            page_number += 1;
        }
    }

    /// Fetch one page and account for it. `None` means the run is aborted.
    async fn fetch(&self, page_number: u64, summary: &mut RunSummary) -> Option<Page> {
        let started = Instant::now();
        match self.pager.fetch_page(page_number, self.settings.page_size).await {
            Ok(page) => {
                let latency = started.elapsed();
                if self.settings.slo.is_page_fetch_violation(latency) {
                    warn!(
                        page = page_number,
                        latency_ms = latency.as_millis() as u64,
                        slo_ms = self.settings.slo.max_page_fetch_latency_ms,
                        "Page fetch exceeded SLO"
                    );
                    metrics::record_slo_violation("page_fetch_latency");
                }

                summary.record_page(page_number, page.row_count());
                for rejected in &page.rejected {
                    warn!(page = page_number, error = %rejected, "Source row rejected");
                    metrics::record_row_rejected();
                    summary.failed += 1;
                }
                Some(page)
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(page = page_number, error = %e, "Page fetch failed, aborting run");
                } else {
                    error!(page = page_number, error = %e, "Page query rejected, aborting run");
                }
                summary.status = RunStatus::Aborted(AbortReason::from_error(&e, page_number));
                None
            }
        }
    }
}

fn lock(tally: &StdMutex<RunSummary>) -> MutexGuard<'_, RunSummary> {
    tally.lock().unwrap_or_else(PoisonError::into_inner)
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}
