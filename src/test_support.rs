// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Controllable durable store for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::storage::memory::MemoryStore;
use crate::storage::traits::{Entry, KvStore, StorageError};

/// A durable-store stand-in with an outage switch, injected latency and
/// per-key rejection.
pub struct ControlledStore {
    inner: MemoryStore,
    online: AtomicBool,
    latency: Mutex<Duration>,
    rejected: Mutex<HashSet<String>>,
    broken: Mutex<HashSet<String>>,
    writes: Mutex<Vec<(String, Option<Value>)>>,
    write_calls: AtomicU64,
}

impl ControlledStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            online: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            rejected: Mutex::new(HashSet::new()),
            broken: Mutex::new(HashSet::new()),
            writes: Mutex::new(Vec::new()),
            write_calls: AtomicU64::new(0),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn reject(&self, key: &str) {
        self.rejected.lock().insert(key.to_string());
    }

    /// Writes to `key` fail with a connection error until [`Self::heal`].
    pub fn break_key(&self, key: &str) {
        self.broken.lock().insert(key.to_string());
    }

    pub fn heal(&self, key: &str) {
        self.broken.lock().remove(key);
    }

    /// Successful writes in the order they were applied.
    pub fn writes(&self) -> Vec<(String, Option<Value>)> {
        self.writes.lock().clone()
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    async fn gate(&self) -> Result<(), StorageError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Connection("simulated outage".into()))
        }
    }

    fn check_write(&self, key: &str) -> Result<(), StorageError> {
        if self.broken.lock().contains(key) {
            return Err(StorageError::Connection(format!("connection reset writing {}", key)));
        }
        if self.rejected.lock().contains(key) {
            Err(StorageError::Rejected(format!("validation failed for {}", key)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvStore for ControlledStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.gate().await?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.gate().await?;
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.check_write(key)?;
        self.inner.put(key, value).await?;
        self.writes.lock().push((key.to_string(), Some(value.clone())));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.gate().await?;
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.check_write(key)?;
        self.inner.delete(key).await?;
        self.writes.lock().push((key.to_string(), None));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>, StorageError> {
        self.gate().await?;
        self.inner.list(prefix).await
    }
}
