// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis durable store.
//!
//! Each entry is a plain Redis STRING holding the JSON-encoded value, under
//! an optional namespace prefix:
//!
//! ```text
//! SET pos:product:p1 '{"name":"Coffee","stock":12}'
//! ```
//!
//! Listing uses `SCAN MATCH` so a large keyspace never blocks the server.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use serde_json::Value;

use super::traits::{Entry, KvStore, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

fn classify(err: RedisError) -> StorageError {
    if err.is_timeout() {
        StorageError::Timeout {
            operation: "redis".into(),
            after_ms: 0,
        }
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        StorageError::Connection(err.to_string())
    } else {
        StorageError::Backend(err.to_string())
    }
}

/// Escape Redis glob metacharacters so a prefix matches literally.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub struct RedisStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "pos:" → "pos:product:p1")
    prefix: String,
}

impl RedisStore {
    /// Create a new Redis store without a key prefix.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Create a new Redis store with an optional key prefix.
    ///
    /// ```rust,no_run
    /// # use offline_sync::storage::redis::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = RedisStore::with_prefix("redis://localhost", Some("pos:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        Self::connect(connection_string, prefix, &RetryConfig::startup()).await
    }

    /// Connect, retrying per `policy`.
    pub async fn connect(
        connection_string: &str,
        prefix: Option<&str>,
        policy: &RetryConfig,
    ) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", policy, || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(classify)?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    #[inline]
    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection.clone();
        let mut keys = Vec::new();
        let mut cursor = 0u64;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(classify)?;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        let raw: Option<String> = retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move { conn.get(&key).await }
        })
        .await
        .map_err(classify)?;

        raw.map(|s| serde_json::from_str(&s).map_err(StorageError::from))
            .transpose()
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let encoded = serde_json::to_string(value)?;
        let _: () = conn
            .set(self.prefixed_key(key), encoded)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(self.prefixed_key(key)).await.map_err(classify)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>, StorageError> {
        let pattern = format!("{}*", escape_glob(&self.prefixed_key(prefix)));
        let keys = self.scan_keys(&pattern).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        let mut entries = Vec::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(values) {
            // Deleted between SCAN and MGET
            let Some(raw) = raw else { continue };
            entries.push(Entry {
                key: self.strip_prefix(key).to_string(),
                value: serde_json::from_str(&raw)?,
            });
        }
        Ok(entries)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(())
    }
}
