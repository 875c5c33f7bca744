// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync engine.

use thiserror::Error;

use crate::storage::traits::StorageError;

/// Engine lifecycle.
///
/// There is no failed state: a run always returns to `Idle`, and failures
/// live on the individual queue items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Draining,
    /// Shutdown requested; no further runs start
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Draining => write!(f, "Draining"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Counts for one drain of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncResult {
    /// Items confirmed against the durable store
    pub processed: usize,
    /// Items that failed, retryable or permanent
    pub failed: usize,
    /// Items left pending because an earlier item for the same key failed
    /// this run, or because shutdown was requested
    pub skipped: usize,
}

impl SyncResult {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// What a call to [`super::SyncEngine::run_once`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(SyncResult),
    /// Another run was in progress; nothing was touched
    AlreadySyncing,
}

impl RunOutcome {
    /// The result, if this call actually drained.
    #[must_use]
    pub fn result(&self) -> Option<SyncResult> {
        match self {
            Self::Completed(result) => Some(*result),
            Self::AlreadySyncing => None,
        }
    }
}

/// Classified failure replaying one queued operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// Connectivity or timeout; the item goes back to `pending`
    #[error("{0}")]
    Retryable(String),
    /// The durable store refused the mutation; the item needs an operator
    #[error("{0}")]
    Permanent(String),
}

impl ReplayError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<StorageError> for ReplayError {
    fn from(err: StorageError) -> Self {
        if err.is_transient() {
            Self::Retryable(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}
