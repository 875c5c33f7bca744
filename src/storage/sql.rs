// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL durable store (SQLite or MySQL through the sqlx `Any` driver).
//!
//! One table holds every entry:
//! ```sql
//! CREATE TABLE kv_entries (
//!   entry_key VARCHAR(255) PRIMARY KEY,
//!   value LONGTEXT NOT NULL,     -- JSON as text
//!   updated_at BIGINT NOT NULL   -- epoch millis
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver hands MySQL LONGTEXT back as bytes, so text columns are
//! read as `String` first and `Vec<u8>` second.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

use super::traits::{Entry, KvStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Map a driver error onto the storage taxonomy.
///
/// Constraint violations are the store rejecting the payload; pool and I/O
/// failures are connectivity.
fn classify(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db) => match db.kind() {
            sqlx::error::ErrorKind::UniqueViolation
            | sqlx::error::ErrorKind::ForeignKeyViolation
            | sqlx::error::ErrorKind::NotNullViolation
            | sqlx::error::ErrorKind::CheckViolation => StorageError::Rejected(db.to_string()),
            _ => StorageError::Backend(db.to_string()),
        },
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::Connection(err.to_string())
        }
        other => StorageError::Backend(other.to_string()),
    }
}

fn read_text(row: &sqlx::any::AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::connect(connection_string, &RetryConfig::startup()).await
    }

    /// Connect and prepare the schema, retrying per `policy`.
    pub async fn connect(connection_string: &str, policy: &RetryConfig) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", policy, || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 10 })
                .acquire_timeout(Duration::from_secs(3))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(classify)
        })
        .await?;

        let store = Self { pool, is_sqlite };
        if is_sqlite {
            store.enable_wal_mode().await?;
        }
        store.init_schema(policy).await?;
        Ok(store)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self, policy: &RetryConfig) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                entry_key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                entry_key VARCHAR(255) PRIMARY KEY,
                value LONGTEXT NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#
        };

        retry("sql_init_schema", policy, || async {
            sqlx::query(sql).execute(&self.pool).await.map_err(classify)
        })
        .await?;
        Ok(())
    }

    fn upsert_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO kv_entries (entry_key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(entry_key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"
        } else {
            "INSERT INTO kv_entries (entry_key, value, updated_at) VALUES (?, ?, ?) \
             ON DUPLICATE KEY UPDATE value = VALUES(value), updated_at = VALUES(updated_at)"
        }
    }
}

#[async_trait]
impl KvStore for SqlStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let row = retry("sql_get", &RetryConfig::query(), || async {
            sqlx::query("SELECT value FROM kv_entries WHERE entry_key = ?")
                .bind(key.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(classify)
        })
        .await?;

        match row {
            Some(row) => {
                let text = read_text(&row, "value")
                    .ok_or_else(|| StorageError::Backend(format!("Unreadable value for {}", key)))?;
                Ok(Some(serde_json::from_str(&text)?))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let text = serde_json::to_string(value)?;
        sqlx::query(self.upsert_sql())
            .bind(key.to_string())
            .bind(text)
            .bind(crate::now_millis())
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_entries WHERE entry_key = ?")
            .bind(key.to_string())
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>, StorageError> {
        let prefix_len = prefix.chars().count() as i64;
        let rows = retry("sql_list", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT entry_key, value FROM kv_entries WHERE SUBSTR(entry_key, 1, ?) = ? ORDER BY entry_key",
            )
            .bind(prefix_len)
            .bind(prefix.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(classify)
        })
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let (Some(key), Some(text)) = (read_text(&row, "entry_key"), read_text(&row, "value")) else {
                return Err(StorageError::Backend("Unreadable kv_entries row".into()));
            };
            entries.push(Entry {
                key,
                value: serde_json::from_str(&text)?,
            });
        }
        Ok(entries)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(classify)
    }
}
