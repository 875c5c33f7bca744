// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the operation queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Mutation kind of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Lifecycle of a queued operation.
///
/// ```text
/// Pending → Syncing → Synced
///    ↑         │
///    └─────────┤ (retryable failure, attempts + 1)
///              └────→ Error (permanent failure or retry ceiling)
/// ```
///
/// `Synced` and `Error` are terminal: only an operator action
/// (`clear_all`, `requeue`) touches them afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Syncing,
    Synced,
    Error,
}

impl OperationStatus {
    /// Not yet confirmed against the durable store.
    #[must_use]
    pub fn is_unsynced(self) -> bool {
        matches!(self, Self::Pending | Self::Syncing)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Syncing => write!(f, "syncing"),
            Self::Synced => write!(f, "synced"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A mutation waiting for confirmed application to the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Time-ordered UUID, assigned at enqueue
    pub id: String,
    /// Insertion sequence; FIFO processing order
    pub seq: u64,
    pub entity_type: String,
    /// `None` for creates whose id is not known client-side
    pub entity_id: Option<String>,
    pub kind: OperationKind,
    pub payload: Value,
    /// Epoch millis
    pub created_at: i64,
    /// Retryable replay failures so far
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: OperationStatus,
    /// Epoch millis of the last status change
    pub updated_at: i64,
}

impl PendingOperation {
    /// Durable key this operation targets.
    ///
    /// A create without an entity id is keyed by its own operation id, which
    /// makes replays of it idempotent.
    #[must_use]
    pub fn storage_key(&self) -> String {
        match self.entity_id.as_deref() {
            Some(entity_id) if !entity_id.is_empty() => format!("{}:{}", self.entity_type, entity_id),
            _ => format!("{}:{}", self.entity_type, self.id),
        }
    }
}

/// Aggregate queue statistics, recomputed on every call.
///
/// `pending` includes the item currently `syncing`, so
/// `total == pending + synced + errors` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub total: usize,
    pub pending: usize,
    pub synced: usize,
    pub errors: usize,
    /// Epoch millis of the last sync run
    pub last_sync_attempt: Option<i64>,
    /// The last run finished with zero failures
    pub last_sync_success: bool,
    /// Epoch millis of the last run that finished with zero failures
    pub last_sync_time: Option<i64>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Operation {0} not found")]
    NotFound(String),
    #[error("Operation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: OperationStatus,
        to: OperationStatus,
    },
    #[error("Operation {id} is already syncing")]
    AlreadySyncing { id: String },
}
