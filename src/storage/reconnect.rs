// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable store that connects on demand.
//!
//! A till that boots during an outage has no durable connection to hand
//! the router. [`ReconnectingStore`] stands in for it: every call first
//! makes sure a connection exists, opening one if the spacing policy allows
//! another attempt. Once the store answers, the next health check's ping
//! succeeds, `primary-connected` is published and the sync loop drains.
//!
//! Attempts are single-shot and spaced by a [`RetryConfig`] backoff, so a
//! health check or router call never blocks on a connect retry loop.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::traits::{Entry, KvStore, StorageError};
use crate::resilience::retry::RetryConfig;

#[derive(Default)]
struct Attempts {
    failures: u32,
    not_before: Option<Instant>,
}

pub struct ReconnectingStore {
    url: String,
    redis_prefix: Option<String>,
    /// Spacing between failed connect attempts
    backoff: RetryConfig,
    connected: RwLock<Option<Arc<dyn KvStore>>>,
    /// Serializes connect attempts
    attempts: Mutex<Attempts>,
}

impl ReconnectingStore {
    /// Try to connect now (startup retry policy). Failure is logged, not
    /// returned: the store keeps trying on later calls.
    pub async fn connect(url: &str, redis_prefix: Option<&str>, backoff: RetryConfig) -> Self {
        let store = Self::unconnected(url, redis_prefix, backoff);
        match super::connect_durable(url, redis_prefix, &RetryConfig::startup()).await {
            Ok(inner) => *store.connected.write() = Some(inner),
            Err(e) => {
                error!(error = %e, "Durable store unreachable at startup, continuing degraded");
                store.record_failure(&mut *store.attempts.lock().await);
            }
        }
        store
    }

    /// No connection yet; the first call makes the first attempt.
    pub fn unconnected(url: &str, redis_prefix: Option<&str>, backoff: RetryConfig) -> Self {
        Self {
            url: url.to_string(),
            redis_prefix: redis_prefix.map(String::from),
            backoff,
            connected: RwLock::new(None),
            attempts: Mutex::new(Attempts::default()),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.read().is_some()
    }

    async fn store(&self) -> Result<Arc<dyn KvStore>, StorageError> {
        if let Some(store) = self.connected.read().clone() {
            return Ok(store);
        }

        let mut attempts = self.attempts.lock().await;
        // Another caller may have connected while we waited
        if let Some(store) = self.connected.read().clone() {
            return Ok(store);
        }
        if let Some(not_before) = attempts.not_before {
            if Instant::now() < not_before {
                return Err(StorageError::Connection(format!(
                    "durable store not connected (next attempt in {:?})",
                    not_before - Instant::now()
                )));
            }
        }

        match super::connect_durable(&self.url, self.redis_prefix.as_deref(), &RetryConfig::single_attempt()).await {
            Ok(store) => {
                info!(failed_attempts = attempts.failures, "Durable store connected");
                *attempts = Attempts::default();
                *self.connected.write() = Some(store.clone());
                Ok(store)
            }
            Err(e) => {
                self.record_failure(&mut attempts);
                Err(StorageError::Connection(format!("durable store not connected: {}", e)))
            }
        }
    }

    fn record_failure(&self, attempts: &mut Attempts) {
        let delay = self.backoff.backoff_delay(attempts.failures);
        attempts.failures = attempts.failures.saturating_add(1);
        attempts.not_before = Some(Instant::now() + delay);
        debug!(failures = attempts.failures, retry_in = ?delay, "Durable connect failed");
    }
}

#[async_trait]
impl KvStore for ReconnectingStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.store().await?.get(key).await
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.store().await?.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.store().await?.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>, StorageError> {
        self.store().await?.list(prefix).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.store().await?.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn spacing(initial: Duration) -> RetryConfig {
        RetryConfig {
            initial_delay: initial,
            max_delay: initial * 4,
            ..RetryConfig::daemon()
        }
    }

    #[tokio::test]
    async fn test_connects_once_the_store_appears() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("later");
        let url = format!("sqlite://{}?mode=rwc", missing.join("pos.db").display());

        let store = ReconnectingStore::unconnected(&url, None, spacing(Duration::ZERO));
        assert!(matches!(store.ping().await, Err(StorageError::Connection(_))));
        assert!(!store.is_connected());

        std::fs::create_dir_all(&missing).unwrap();
        store.ping().await.unwrap();
        assert!(store.is_connected());

        store.put("product:p1", &json!({"stock": 1})).await.unwrap();
        assert_eq!(store.get("product:p1").await.unwrap(), Some(json!({"stock": 1})));
    }

    #[tokio::test]
    async fn test_attempts_are_spaced() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("later");
        let url = format!("sqlite://{}?mode=rwc", missing.join("pos.db").display());

        let store = ReconnectingStore::unconnected(&url, None, spacing(Duration::from_millis(300)));
        assert!(store.ping().await.is_err());

        // Reachable now, but the next attempt is not due yet
        std::fs::create_dir_all(&missing).unwrap();
        let err = store.ping().await.unwrap_err();
        assert!(err.to_string().contains("next attempt"));
        assert!(!store.is_connected());

        tokio::time::sleep(Duration::from_millis(350)).await;
        store.ping().await.unwrap();
        assert!(store.is_connected());
    }

    #[tokio::test]
    async fn test_errors_while_unconnected_are_transient() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("no/such/dir/pos.db").display());
        let store = ReconnectingStore::unconnected(&url, None, spacing(Duration::ZERO));

        let err = store.put("product:p1", &json!(1)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
