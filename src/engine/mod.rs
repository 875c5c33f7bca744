// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine.
//!
//! Drains the operation queue against the durable store. A drain is
//! single-flight: a second [`SyncEngine::run_once`] while one is active
//! returns [`RunOutcome::AlreadySyncing`] without touching the queue.
//!
//! ```text
//!  Idle ──run_once──► Draining ──(all pending items tried)──► Idle
//! ```
//!
//! Each run snapshots the `pending` items in FIFO order and replays them one
//! at a time through [`StorageRouter::apply_durable`]. Failures are
//! classified per item; one item failing never stops the run. When an item
//! fails retryably, later items for the same key are left pending until the
//! next run so they cannot overtake it.
//!
//! [`SyncEngine::run`] is the background loop. It drains on the periodic
//! timer, on a manual [`SyncEngine::trigger`], and when the probe reports
//! the durable store reachable again. Runs with failures back off
//! exponentially until a clean run resets the delay.

mod types;

pub use types::{EngineState, ReplayError, RunOutcome, SyncResult};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::queue::{OperationQueue, OperationStatus, QueueError, SyncStats};
use crate::resilience::health::HealthState;
use crate::resilience::retry::RetryConfig;
use crate::router::StorageRouter;

pub struct SyncEngine {
    router: Arc<StorageRouter>,
    queue: Arc<OperationQueue>,
    draining: AtomicBool,
    state: watch::Sender<EngineState>,
    trigger: Notify,
    shutdown: watch::Receiver<bool>,
}

impl SyncEngine {
    /// `shutdown` flips to `true` when the process is stopping. It is only
    /// checked between items, so an in-flight replay always finishes.
    pub fn new(router: Arc<StorageRouter>, shutdown: watch::Receiver<bool>) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            queue: router.queue().clone(),
            router,
            draining: AtomicBool::new(false),
            state,
            trigger: Notify::new(),
            shutdown,
        }
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Ask the background loop to drain now.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Aggregate queue statistics.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.queue.stats()
    }

    /// Remove every `synced` and `error` item.
    pub fn clear_all(&self) -> usize {
        let removed = self.queue.clear_all();
        crate::metrics::set_queue_depth(&self.queue.stats());
        removed
    }

    /// Destructive: also drops unsynced `pending` items.
    pub fn force_clear(&self) -> usize {
        let removed = self.queue.force_clear();
        crate::metrics::set_queue_depth(&self.queue.stats());
        removed
    }

    /// Give an `error` item a fresh retry budget.
    pub fn requeue(&self, id: &str) -> Result<(), QueueError> {
        self.queue.requeue(id)?;
        crate::metrics::set_queue_depth(&self.queue.stats());
        Ok(())
    }

    /// Drain every `pending` item once.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> RunOutcome {
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("Sync already in progress");
            crate::metrics::record_sync_rejected();
            return RunOutcome::AlreadySyncing;
        }
        let _guard = DrainGuard {
            draining: &self.draining,
            state: &self.state,
        };
        self.state.send_if_modified(|state| {
            if *state == EngineState::Idle {
                *state = EngineState::Draining;
                true
            } else {
                false
            }
        });

        let started = Instant::now();
        let attempted_at = crate::now_millis();
        let pending = self.queue.pending();
        let total = pending.len();
        let mut result = SyncResult::default();
        // Keys with a retryable failure this run
        let mut blocked: HashSet<String> = HashSet::new();

        if total > 0 {
            info!(pending = total, "Sync run starting");
        }

        for (index, op) in pending.into_iter().enumerate() {
            if *self.shutdown.borrow() {
                let remaining = total - index;
                info!(remaining, "Shutdown requested, stopping sync run");
                result.skipped += remaining;
                break;
            }

            let key = op.storage_key();
            if blocked.contains(&key) {
                debug!(id = %op.id, key = %key, "Holding operation behind failed predecessor");
                result.skipped += 1;
                continue;
            }

            let op = match self.queue.mark_syncing(&op.id) {
                Ok(op) => op,
                Err(e) => {
                    // Cleared or requeued since the snapshot
                    debug!(id = %op.id, error = %e, "Operation no longer pending");
                    result.skipped += 1;
                    continue;
                }
            };

            match self.router.apply_durable(&op).await {
                Ok(()) => {
                    if let Err(e) = self.queue.mark_synced(&op.id) {
                        error!(id = %op.id, error = %e, "Failed to mark operation synced");
                    }
                    crate::metrics::record_replay("synced");
                    debug!(id = %op.id, key = %key, kind = %op.kind, "Operation synced");
                    result.processed += 1;
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    result.failed += 1;
                    if retryable {
                        blocked.insert(key.clone());
                    }

                    match self.queue.mark_failed(&op.id, &e.to_string(), retryable) {
                        Ok(OperationStatus::Pending) => {
                            crate::metrics::record_replay("retryable");
                            warn!(id = %op.id, key = %key, attempts = op.attempts + 1, error = %e, "Replay failed, will retry");
                        }
                        Ok(_) => {
                            crate::metrics::record_replay("permanent");
                            error!(id = %op.id, key = %key, kind = %op.kind, error = %e, "Replay failed permanently, operator action needed");
                        }
                        Err(qe) => error!(id = %op.id, error = %qe, "Failed to record replay failure"),
                    }
                }
            }
        }

        self.queue.record_run(attempted_at, result.is_clean());
        let stats = self.queue.stats();
        crate::metrics::set_queue_depth(&stats);
        crate::metrics::record_sync_run(result.processed, result.failed, started.elapsed());

        if total > 0 {
            info!(
                processed = result.processed,
                failed = result.failed,
                skipped = result.skipped,
                pending = stats.pending,
                errors = stats.errors,
                duration_ms = started.elapsed().as_millis() as u64,
                "Sync run complete"
            );
        }

        RunOutcome::Completed(result)
    }

    /// Background loop. Returns once shutdown is signalled.
    ///
    /// `interval` is the period after a clean run and may be changed while
    /// running. Timer ticks skip the drain while the probe reports the
    /// durable store unreachable; the reconnect transition wakes the loop
    /// instead, so an outage does not burn retry budgets.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, mut interval: watch::Receiver<Duration>, backoff: RetryConfig) {
        let mut health = self.router.probe().subscribe();
        let mut shutdown = self.shutdown.clone();
        let mut failures: u32 = 0;

        info!(interval = ?*interval.borrow(), "Sync loop running");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match failures {
                0 => *interval.borrow(),
                n => backoff.backoff_delay(n - 1),
            };

            let forced = tokio::select! {
                _ = tokio::time::sleep(delay) => false,

                _ = self.trigger.notified() => {
                    debug!("Manual sync requested");
                    true
                }

                Ok(()) = health.changed() => {
                    let state = *health.borrow_and_update();
                    if state != HealthState::PrimaryConnected {
                        continue;
                    }
                    info!("Durable store reachable again, syncing queued operations");
                    failures = 0;
                    true
                }

                Ok(()) = interval.changed() => {
                    info!(interval = ?*interval.borrow_and_update(), "Sync interval updated");
                    continue;
                }

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if !forced && self.router.probe().current().await.state != HealthState::PrimaryConnected {
                debug!("Durable store unreachable, skipping scheduled sync");
                continue;
            }

            match self.run_once().await {
                RunOutcome::Completed(result) if result.is_clean() => failures = 0,
                RunOutcome::Completed(_) => {
                    failures = failures.saturating_add(1);
                    debug!(failures, next = ?backoff.backoff_delay(failures - 1), "Backing off after failed run");
                }
                RunOutcome::AlreadySyncing => {}
            }
        }

        self.state.send_replace(EngineState::Stopped);
        info!("Sync loop stopped");
    }
}

/// RAII guard that ends a drain.
struct DrainGuard<'a> {
    draining: &'a AtomicBool,
    state: &'a watch::Sender<EngineState>,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| {
            if *state == EngineState::Draining {
                *state = EngineState::Idle;
                true
            } else {
                false
            }
        });
        self.draining.store(false, Ordering::Release);
    }
}
