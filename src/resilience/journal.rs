// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-ahead journal for the operation queue.
//!
//! The queue itself lives in memory. When a journal is configured, every
//! queue mutation is mirrored into a local SQLite file so queued mutations
//! survive a restart. Writes are handed to a background writer over an
//! unbounded channel: queue methods never wait on disk, and the channel
//! preserves mutation order.
//!
//! Persistence is best-effort. A failed journal write is logged and
//! counted; the in-memory queue stays authoritative for the running process.

use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue::PendingOperation;
use crate::storage::sql::install_drivers;
use crate::storage::traits::StorageError;

pub enum JournalEvent {
    Upsert(PendingOperation),
    Remove(Vec<String>),
    Flush(oneshot::Sender<()>),
}

/// Cheap handle the queue uses to emit journal events.
#[derive(Clone)]
pub struct JournalHandle {
    tx: mpsc::UnboundedSender<JournalEvent>,
}

impl JournalHandle {
    pub fn upsert(&self, op: PendingOperation) {
        self.send(JournalEvent::Upsert(op));
    }

    pub fn remove(&self, ids: Vec<String>) {
        self.send(JournalEvent::Remove(ids));
    }

    /// Wait until every event sent so far has been written.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(JournalEvent::Flush(ack_tx));
        let _ = ack_rx.await;
    }

    fn send(&self, event: JournalEvent) {
        if self.tx.send(event).is_err() {
            warn!("Journal writer stopped; queue change not persisted");
            crate::metrics::record_journal_error("send");
        }
    }
}

/// SQLite-backed queue journal.
pub struct QueueJournal {
    pool: AnyPool,
    path: String,
}

impl QueueJournal {
    /// Open (or create) the journal at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        install_drivers();

        let path = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path);
        info!(path = %path, "Opening queue journal");

        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to open journal at {}: {}", path, e)))?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_operations (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                status TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Backend(format!("Failed to create journal schema: {}", e)))?;

        Ok(Self { pool, path })
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// All journaled operations in sequence order.
    pub async fn load(&self) -> Result<Vec<PendingOperation>, StorageError> {
        let rows = sqlx::query("SELECT id, body FROM pending_operations ORDER BY seq")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut ops = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id").unwrap_or_default();
            let body: String = row
                .try_get::<String, _>("body")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            match serde_json::from_str::<PendingOperation>(&body) {
                Ok(op) => ops.push(op),
                // One bad row must not block recovery of the rest
                Err(e) => error!(id = %id, error = %e, "Skipping unreadable journal entry"),
            }
        }

        if !ops.is_empty() {
            info!(count = ops.len(), path = %self.path, "Loaded operations from journal");
        }
        Ok(ops)
    }

    pub async fn upsert(&self, op: &PendingOperation) -> Result<(), StorageError> {
        let body = serde_json::to_string(op)?;
        sqlx::query(
            "INSERT INTO pending_operations (id, seq, status, body) VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET seq = excluded.seq, status = excluded.status, body = excluded.body",
        )
        .bind(op.id.clone())
        .bind(op.seq as i64)
        .bind(op.status.to_string())
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    pub async fn remove(&self, ids: &[String]) -> Result<u64, StorageError> {
        let mut removed = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM pending_operations WHERE id = ?")
                .bind(id.clone())
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }

    pub async fn count(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM pending_operations")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let count: i64 = row.try_get("cnt").map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(count as u64)
    }

    /// Start the background writer. It runs until every [`JournalHandle`]
    /// clone has been dropped.
    pub fn spawn_writer(self: Arc<Self>) -> (JournalHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    JournalEvent::Upsert(op) => {
                        if let Err(e) = self.upsert(&op).await {
                            error!(id = %op.id, error = %e, "Journal upsert failed");
                            crate::metrics::record_journal_error("upsert");
                        }
                    }
                    JournalEvent::Remove(ids) => match self.remove(&ids).await {
                        Ok(removed) => debug!(removed, "Journal entries removed"),
                        Err(e) => {
                            error!(error = %e, "Journal remove failed");
                            crate::metrics::record_journal_error("remove");
                        }
                    },
                    JournalEvent::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
            debug!("Journal writer stopped");
        });

        (JournalHandle { tx }, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{OperationKind, OperationQueue, OperationStatus};
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_creates_empty_journal() {
        let dir = tempdir().unwrap();
        let journal = QueueJournal::open(dir.path().join("queue.db")).await.unwrap();

        assert_eq!(journal.count().await.unwrap(), 0);
        assert!(journal.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_mutations_are_mirrored() {
        let dir = tempdir().unwrap();
        let journal = Arc::new(QueueJournal::open(dir.path().join("queue.db")).await.unwrap());
        let (handle, _writer) = journal.clone().spawn_writer();
        let queue = OperationQueue::with_journal(None, handle.clone());

        let a = queue.enqueue(OperationKind::Update, "product", Some("p1".into()), json!({"stock": 5}));
        let b = queue.enqueue(OperationKind::Delete, "product", Some("p2".into()), json!(null));
        queue.mark_syncing(&a.id).unwrap();
        queue.mark_synced(&a.id).unwrap();
        handle.flush().await;

        let loaded = journal.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, a.id);
        assert_eq!(loaded[0].status, OperationStatus::Synced);
        assert_eq!(loaded[1].id, b.id);
        assert_eq!(loaded[1].status, OperationStatus::Pending);

        assert_eq!(queue.clear_all(), 1);
        handle.flush().await;
        assert_eq!(journal.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_journal_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("restart.db");

        let (first_id, second_id) = {
            let journal = Arc::new(QueueJournal::open(&path).await.unwrap());
            let (handle, _writer) = journal.clone().spawn_writer();
            let queue = OperationQueue::with_journal(None, handle.clone());

            let a = queue.enqueue(OperationKind::Create, "customer", Some("c1".into()), json!({"name": "Ana"}));
            let b = queue.enqueue(OperationKind::Update, "customer", Some("c1".into()), json!({"name": "Ana M"}));
            queue.mark_syncing(&a.id).unwrap();
            handle.flush().await;
            (a.id, b.id)
        };

        let journal = Arc::new(QueueJournal::open(&path).await.unwrap());
        let queue = OperationQueue::new(None);
        queue.restore(journal.load().await.unwrap());

        let ops = queue.list();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].id, first_id);
        assert_eq!(ops[0].status, OperationStatus::Pending);
        assert_eq!(ops[1].id, second_id);
    }
}
