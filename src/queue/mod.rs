// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation queue.
//!
//! An ordered record of mutations the router could not confirm against the
//! durable store. A single lock guards the backing collection; every method
//! is short and never awaits, so request handlers and the sync engine can
//! call it concurrently.
//!
//! When a [`JournalHandle`] is attached, every mutation is mirrored to the
//! write-ahead journal in the same order it was applied in memory.
//!
//! # Example
//!
//! ```
//! use offline_sync::{OperationQueue, OperationKind, OperationStatus};
//! use serde_json::json;
//!
//! let queue = OperationQueue::new(Some(3));
//! let op = queue.enqueue(OperationKind::Update, "product", Some("p1".into()), json!({"stock": 5}));
//! assert_eq!(op.status, OperationStatus::Pending);
//! assert_eq!(queue.stats().pending, 1);
//! ```

mod types;

pub use types::{OperationKind, OperationStatus, PendingOperation, QueueError, SyncStats};

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::resilience::journal::JournalHandle;

#[derive(Debug, Default)]
struct QueueState {
    ops: Vec<PendingOperation>,
    next_seq: u64,
    last_attempt: Option<i64>,
    last_success: bool,
    last_success_at: Option<i64>,
    /// Storage key -> number of `pending`/`syncing` operations on it
    unsynced: HashMap<String, usize>,
}

impl QueueState {
    fn find_mut(&mut self, id: &str) -> Result<&mut PendingOperation, QueueError> {
        self.ops
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    fn hold(&mut self, key: String) {
        *self.unsynced.entry(key).or_insert(0) += 1;
    }

    fn release(&mut self, key: &str) {
        if let Some(count) = self.unsynced.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.unsynced.remove(key);
            }
        }
    }

    fn recount_unsynced(&mut self) {
        let mut unsynced = HashMap::new();
        for op in self.ops.iter().filter(|op| op.status.is_unsynced()) {
            *unsynced.entry(op.storage_key()).or_insert(0) += 1;
        }
        self.unsynced = unsynced;
    }
}

pub struct OperationQueue {
    state: Mutex<QueueState>,
    /// Retryable failures allowed before an item is parked in `error`
    max_attempts: Option<u32>,
    journal: Option<JournalHandle>,
}

impl OperationQueue {
    #[must_use]
    pub fn new(max_attempts: Option<u32>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_attempts,
            journal: None,
        }
    }

    /// Queue whose mutations are mirrored to a journal.
    #[must_use]
    pub fn with_journal(max_attempts: Option<u32>, journal: JournalHandle) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new(max_attempts)
        }
    }

    /// Load operations recovered from the journal.
    ///
    /// Items are ordered by sequence. An item found `syncing` was cut off by
    /// a restart mid-replay and goes back to `pending`.
    pub fn restore(&self, mut ops: Vec<PendingOperation>) {
        ops.sort_by_key(|op| op.seq);
        let mut state = self.state.lock();

        for op in ops.iter_mut() {
            if op.status == OperationStatus::Syncing {
                op.status = OperationStatus::Pending;
                self.journal_upsert(op);
            }
        }

        state.next_seq = ops.last().map(|op| op.seq + 1).unwrap_or(0).max(state.next_seq);
        let restored = ops.len();
        let mut merged = std::mem::take(&mut state.ops);
        merged.extend(ops);
        merged.sort_by_key(|op| op.seq);
        state.ops = merged;
        state.recount_unsynced();

        if restored > 0 {
            info!(restored, "Operation queue restored from journal");
        }
    }

    /// Append an operation. Always succeeds.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        entity_type: impl Into<String>,
        entity_id: Option<String>,
        payload: Value,
    ) -> PendingOperation {
        let now = crate::now_millis();
        let mut state = self.state.lock();

        let op = PendingOperation {
            id: Uuid::now_v7().to_string(),
            seq: state.next_seq,
            entity_type: entity_type.into(),
            entity_id,
            kind,
            payload,
            created_at: now,
            attempts: 0,
            last_error: None,
            status: OperationStatus::Pending,
            updated_at: now,
        };
        state.next_seq += 1;
        state.hold(op.storage_key());
        state.ops.push(op.clone());
        self.journal_upsert(&op);

        debug!(id = %op.id, kind = %op.kind, key = %op.storage_key(), "Operation queued");
        op
    }

    /// Snapshot in insertion order.
    #[must_use]
    pub fn list(&self) -> Vec<PendingOperation> {
        self.state.lock().ops.clone()
    }

    /// `pending` items in insertion order.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingOperation> {
        self.state
            .lock()
            .ops
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<PendingOperation> {
        self.state.lock().ops.iter().find(|op| op.id == id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().ops.is_empty()
    }

    /// Whether `key` has operations not yet confirmed durable.
    #[must_use]
    pub fn has_unsynced(&self, key: &str) -> bool {
        self.state.lock().unsynced.contains_key(key)
    }

    /// Keys with at least one unsynced operation.
    #[must_use]
    pub fn unsynced_keys(&self) -> HashSet<String> {
        self.state.lock().unsynced.keys().cloned().collect()
    }

    /// `pending → syncing`. At most one item may be syncing at a time.
    pub fn mark_syncing(&self, id: &str) -> Result<PendingOperation, QueueError> {
        let mut state = self.state.lock();

        if let Some(active) = state
            .ops
            .iter()
            .find(|op| op.status == OperationStatus::Syncing)
        {
            return Err(QueueError::AlreadySyncing { id: active.id.clone() });
        }

        let op = state.find_mut(id)?;
        if op.status != OperationStatus::Pending {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: op.status,
                to: OperationStatus::Syncing,
            });
        }
        op.status = OperationStatus::Syncing;
        op.updated_at = crate::now_millis();
        let op = op.clone();
        self.journal_upsert(&op);
        Ok(op)
    }

    /// `syncing → synced`.
    pub fn mark_synced(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let op = state.find_mut(id)?;
        if op.status != OperationStatus::Syncing {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: op.status,
                to: OperationStatus::Synced,
            });
        }
        op.status = OperationStatus::Synced;
        op.updated_at = crate::now_millis();
        let op = op.clone();
        state.release(&op.storage_key());
        self.journal_upsert(&op);
        Ok(())
    }

    /// `syncing → pending` (retryable) or `syncing → error` (permanent).
    ///
    /// A retryable failure increments `attempts`; once `attempts` reaches the
    /// configured ceiling the item is parked in `error` instead. A permanent
    /// failure leaves `attempts` unchanged. Returns the new status.
    pub fn mark_failed(
        &self,
        id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<OperationStatus, QueueError> {
        let max_attempts = self.max_attempts;
        let mut state = self.state.lock();
        let op = state.find_mut(id)?;
        if op.status != OperationStatus::Syncing {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: op.status,
                to: if retryable { OperationStatus::Pending } else { OperationStatus::Error },
            });
        }

        if retryable {
            op.attempts = op.attempts.saturating_add(1);
            match max_attempts {
                Some(max) if op.attempts >= max => {
                    op.status = OperationStatus::Error;
                    op.last_error = Some(format!(
                        "retry limit reached ({} attempts): {}",
                        op.attempts, error
                    ));
                    warn!(id = %op.id, attempts = op.attempts, "Operation hit retry ceiling");
                }
                _ => {
                    op.status = OperationStatus::Pending;
                    op.last_error = Some(error.to_string());
                }
            }
        } else {
            op.status = OperationStatus::Error;
            op.last_error = Some(error.to_string());
        }
        op.updated_at = crate::now_millis();

        let op = op.clone();
        if op.status == OperationStatus::Error {
            state.release(&op.storage_key());
        }
        self.journal_upsert(&op);
        Ok(op.status)
    }

    /// Operator action: move an `error` item back to `pending` with a fresh
    /// retry budget. It keeps its original position in the queue.
    pub fn requeue(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let op = state.find_mut(id)?;
        if op.status != OperationStatus::Error {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: op.status,
                to: OperationStatus::Pending,
            });
        }
        op.status = OperationStatus::Pending;
        op.attempts = 0;
        op.updated_at = crate::now_millis();
        let op = op.clone();
        state.hold(op.storage_key());
        self.journal_upsert(&op);
        info!(id = %op.id, key = %op.storage_key(), "Operation requeued by operator");
        Ok(())
    }

    /// Remove every `synced` and `error` entry. `pending` and `syncing`
    /// entries are never touched. Returns the number removed.
    pub fn clear_all(&self) -> usize {
        self.remove_where(|op| !op.status.is_unsynced(), "clear_all")
    }

    /// Destructive: remove everything except the item currently syncing,
    /// including unsynced `pending` work. Those mutations are lost.
    pub fn force_clear(&self) -> usize {
        let removed = self.remove_where(|op| op.status != OperationStatus::Syncing, "force_clear");
        if removed > 0 {
            warn!(removed, "Operation queue force-cleared; unsynced mutations discarded");
        }
        removed
    }

    /// Record the end of a sync run.
    pub fn record_run(&self, attempted_at: i64, success: bool) {
        let mut state = self.state.lock();
        state.last_attempt = Some(attempted_at);
        state.last_success = success;
        if success {
            state.last_success_at = Some(attempted_at);
        }
    }

    #[must_use]
    pub fn stats(&self) -> SyncStats {
        let state = self.state.lock();
        let mut stats = SyncStats {
            total: state.ops.len(),
            last_sync_attempt: state.last_attempt,
            last_sync_success: state.last_success,
            last_sync_time: state.last_success_at,
            ..Default::default()
        };
        for op in &state.ops {
            match op.status {
                OperationStatus::Pending | OperationStatus::Syncing => stats.pending += 1,
                OperationStatus::Synced => stats.synced += 1,
                OperationStatus::Error => stats.errors += 1,
            }
        }
        stats
    }

    fn remove_where(&self, predicate: impl Fn(&PendingOperation) -> bool, action: &str) -> usize {
        let mut state = self.state.lock();
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut state.ops).into_iter().partition(|op| predicate(op));
        state.ops = kept;
        for op in removed.iter().filter(|op| op.status.is_unsynced()) {
            state.release(&op.storage_key());
        }

        if !removed.is_empty() {
            if let Some(journal) = &self.journal {
                journal.remove(removed.iter().map(|op| op.id.clone()).collect());
            }
            debug!(action, removed = removed.len(), "Queue entries removed");
        }
        removed.len()
    }

    fn journal_upsert(&self, op: &PendingOperation) {
        if let Some(journal) = &self.journal {
            journal.upsert(op.clone());
        }
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new(None)
    }
}
