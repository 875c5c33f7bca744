// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for offline-sync.
//!
//! Uses the `metrics` crate for backend-agnostic collection. The embedding
//! process picks the exporter (Prometheus, OTEL, ...).
//!
//! # Metric Naming Convention
//! - `offline_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `backend`: durable, fallback
//! - `operation`: get, put, delete, list, ping, replay
//! - `status`: success, error, timeout, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::queue::SyncStats;
use crate::resilience::health::HealthState;

/// Record a storage call outcome
pub fn record_storage_call(backend: &str, operation: &str, status: &str) {
    counter!(
        "offline_sync_storage_calls_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record storage call latency
pub fn record_latency(backend: &str, operation: &str, duration: Duration) {
    histogram!(
        "offline_sync_storage_call_seconds",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a call that hit its timeout ceiling
pub fn record_timeout(backend: &str, operation: &str) {
    counter!(
        "offline_sync_timeouts_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// HEALTH - Probe results and storage state
// ═══════════════════════════════════════════════════════════════════════════

/// Record a probe round-trip
pub fn record_probe(state: HealthState, duration: Duration) {
    counter!(
        "offline_sync_probes_total",
        "state" => state.to_string()
    )
    .increment(1);
    histogram!("offline_sync_probe_seconds").record(duration.as_secs_f64());
}

/// Set health gauge (0 = primary-connected, 1 = fallback-memory, 2 = error)
pub fn set_health_state(state: HealthState) {
    gauge!("offline_sync_health_state").set(state as u8 as f64);
}

/// Record a health transition
pub fn record_health_transition(from: HealthState, to: HealthState) {
    counter!(
        "offline_sync_health_transitions_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ROUTER - Degraded operation
// ═══════════════════════════════════════════════════════════════════════════

/// Record a write that landed on the fallback store only
pub fn record_degraded_write(operation: &str) {
    counter!(
        "offline_sync_degraded_writes_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a read served by the fallback store
pub fn record_degraded_read() {
    counter!("offline_sync_degraded_reads_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE / SYNC - Pending work and reconciliation
// ═══════════════════════════════════════════════════════════════════════════

/// Publish queue depth gauges
pub fn set_queue_depth(stats: &SyncStats) {
    gauge!("offline_sync_queue_items", "status" => "pending").set(stats.pending as f64);
    gauge!("offline_sync_queue_items", "status" => "synced").set(stats.synced as f64);
    gauge!("offline_sync_queue_items", "status" => "error").set(stats.errors as f64);
}

/// Record the outcome of replaying one queued operation
pub fn record_replay(outcome: &str) {
    counter!(
        "offline_sync_replays_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a finished sync run
pub fn record_sync_run(processed: usize, failed: usize, duration: Duration) {
    let status = if failed == 0 { "success" } else { "partial" };
    counter!(
        "offline_sync_runs_total",
        "status" => status
    )
    .increment(1);
    counter!("offline_sync_replayed_items_total").increment(processed as u64);
    histogram!("offline_sync_run_seconds").record(duration.as_secs_f64());
}

/// Record a run request collapsed by single-flight
pub fn record_sync_rejected() {
    counter!(
        "offline_sync_runs_total",
        "status" => "already_syncing"
    )
    .increment(1);
}

/// Record journal write failures
pub fn record_journal_error(operation: &str) {
    counter!(
        "offline_sync_journal_errors_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    backend: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(backend: &'static str, operation: &'static str) -> Self {
        Self {
            backend,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.backend, self.operation, self.start.elapsed());
    }
}
