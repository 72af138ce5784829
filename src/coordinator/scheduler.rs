// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic trigger with a single-slot overlap guard.
//!
//! # Overlap Policy
//!
//! At most one run executes at any time, whether started by a tick or by the
//! manual trigger. A tick that finds a run in flight is skipped and logged,
//! never queued. Missed ticks (timer starved while a run holds the runtime)
//! are dropped rather than replayed in a burst.

use super::run::ReplicationRun;
use super::types::RunSummary;
use crate::metrics;
use crate::sink::SinkStore;
use crate::source::SourceQuery;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

// ═══════════════════════════════════════════════════════════════════════════════
// RunGate
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-wide single run slot.
#[derive(Debug, Default)]
pub struct RunGate {
    held: AtomicBool,
    released: Notify,
}

impl RunGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the slot, or `None` if a run holds it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<RunPermit> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        metrics::set_run_in_flight(true);
        Some(RunPermit {
            gate: Arc::clone(self),
        })
    }

    pub fn is_running(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Resolve once no run holds the slot.
    pub async fn wait_released(&self) {
        loop {
            // Registered before the check so a release in between is not missed.
            let released = self.released.notified();
            if !self.is_running() {
                return;
            }
            released.await;
        }
    }
}

/// Holds the run slot. Released on drop, including on panic and cancellation.
#[derive(Debug)]
pub struct RunPermit {
    gate: Arc<RunGate>,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.gate.held.store(false, Ordering::Release);
        self.gate.released.notify_waiters();
        metrics::set_run_in_flight(false);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RunCoordinator: gate + run + last result, shared by tick and manual trigger
// ═══════════════════════════════════════════════════════════════════════════════

pub struct RunCoordinator<Src: SourceQuery, S: SinkStore> {
    run: ReplicationRun<Src, S>,
    gate: Arc<RunGate>,
    last_summary: RwLock<Option<RunSummary>>,
    ticks_skipped: AtomicU64,
}

impl<Src: SourceQuery, S: SinkStore> RunCoordinator<Src, S> {
    pub fn new(run: ReplicationRun<Src, S>) -> Self {
        Self {
            run,
            gate: RunGate::new(),
            last_summary: RwLock::new(None),
            ticks_skipped: AtomicU64::new(0),
        }
    }

    pub fn run(&self) -> &ReplicationRun<Src, S> {
        &self.run
    }

    pub fn gate(&self) -> &Arc<RunGate> {
        &self.gate
    }

    /// Execute a run if the slot is free.
    pub async fn try_run(&self) -> Option<RunSummary> {
        let permit = self.gate.try_acquire()?;
        Some(self.run_with_permit(permit).await)
    }

    /// Execute a run under an already acquired permit.
    pub async fn run_with_permit(&self, permit: RunPermit) -> RunSummary {
        let summary = self.run.execute().await;
        *self.last_summary.write().await = Some(summary.clone());
        drop(permit);
        summary
    }

    pub async fn last_summary(&self) -> Option<RunSummary> {
        self.last_summary.read().await.clone()
    }

    pub fn ticks_skipped(&self) -> u64 {
        self.ticks_skipped.load(Ordering::Relaxed)
    }

    fn record_skip(&self) {
        self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
        metrics::record_tick_skipped();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler loop
// ═══════════════════════════════════════════════════════════════════════════════

/// Fire a run every `interval` until shutdown is signaled.
///
/// The first tick fires immediately. Runs are spawned so the loop keeps
/// observing ticks (and skipping them) while a run is in flight. On
/// shutdown the in-flight run, if any, is awaited before returning.
pub async fn run_scheduler<Src: SourceQuery, S: SinkStore>(
    coordinator: Arc<RunCoordinator<Src, S>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("scheduler");

    async move {
        // Mark initial shutdown value as seen so changed() only fires on actual changes
        let _ = shutdown_rx.borrow_and_update();

        info!(interval_ms = interval.as_millis() as u64, "Starting replication scheduler");

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping scheduler");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            let Some(permit) = coordinator.gate().try_acquire() else {
                warn!(
                    skipped_total = coordinator.ticks_skipped() + 1,
                    "Previous run still executing, skipping tick"
                );
                coordinator.record_skip();
                continue;
            };

            let coordinator = Arc::clone(&coordinator);
            in_flight = Some(tokio::spawn(
                async move {
                    coordinator.run_with_permit(permit).await;
                }
                .in_current_span(),
            ));
        }

        if let Some(handle) = in_flight.take() {
            if !handle.is_finished() {
                info!("Waiting for in-flight run to finish");
            }
            if let Err(e) = handle.await {
                warn!(error = %e, "In-flight run panicked");
            }
        }
        debug!("Scheduler stopped");
    }
    .instrument(span)
    .await
}
