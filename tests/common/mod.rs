// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use offline_sync::{
    Entry, HealthProbe, KvStore, MemoryStore, OperationQueue, StorageError, StorageRouter, SyncEngine,
};

// =============================================================================
// Chaos Store - controllable durable backend
// =============================================================================

/// A durable store whose connectivity, latency and validation can be
/// flipped mid-test.
pub struct ChaosStore {
    inner: MemoryStore,
    online: AtomicBool,
    latency: Mutex<Duration>,
    /// Writes to these keys fail validation (permanent)
    rejected: Mutex<HashSet<String>>,
    /// Writes to these keys fail with a connection reset (transient)
    broken: Mutex<HashSet<String>>,
    writes: Mutex<Vec<(String, Option<Value>)>>,
    calls: AtomicU64,
}

impl ChaosStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            online: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            rejected: Mutex::new(HashSet::new()),
            broken: Mutex::new(HashSet::new()),
            writes: Mutex::new(Vec::new()),
            calls: AtomicU64::new(0),
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

    pub fn break_key(&self, key: &str) {
        self.broken.lock().insert(key.to_string());
    }

    pub fn heal(&self, key: &str) {
        self.broken.lock().remove(key);
    }

    /// Applied writes, in order.
    pub fn writes(&self) -> Vec<(String, Option<Value>)> {
        self.writes.lock().clone()
    }

    /// Applied writes for one key, in order.
    pub fn writes_for(&self, key: &str) -> Vec<Option<Value>> {
        self.writes
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    async fn gate(&self) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Connection("connection refused".into()))
        }
    }

    fn check_write(&self, key: &str) -> Result<(), StorageError> {
        if self.broken.lock().contains(key) {
            return Err(StorageError::Connection("connection reset by peer".into()));
        }
        if self.rejected.lock().contains(key) {
            return Err(StorageError::Rejected(format!("constraint violation on {}", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for ChaosStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.gate().await?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.gate().await?;
        self.check_write(key)?;
        self.inner.put(key, value).await?;
        self.writes.lock().push((key.to_string(), Some(value.clone())));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.gate().await?;
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

// =============================================================================
// Rig - the components wired by hand, no background loop
// =============================================================================

pub struct Rig {
    pub durable: Arc<ChaosStore>,
    pub probe: Arc<HealthProbe>,
    pub queue: Arc<OperationQueue>,
    pub router: Arc<StorageRouter>,
    pub engine: Arc<SyncEngine>,
    pub shutdown: watch::Sender<bool>,
}

impl Rig {
    pub fn new(allow_fallback: bool, max_attempts: Option<u32>) -> Self {
        let durable = Arc::new(ChaosStore::new());
        let queue = Arc::new(OperationQueue::new(max_attempts));
        let probe = Arc::new(HealthProbe::new(
            Some(durable.clone() as Arc<dyn KvStore>),
            allow_fallback,
            Duration::from_millis(250),
            Duration::from_secs(30),
        ));
        let router = Arc::new(StorageRouter::new(
            Some(durable.clone() as Arc<dyn KvStore>),
            Arc::new(MemoryStore::new()),
            probe.clone(),
            queue.clone(),
            Duration::from_millis(500),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let engine = Arc::new(SyncEngine::new(router.clone(), shutdown_rx));
        Self { durable, probe, queue, router, engine, shutdown }
    }

    /// Flip connectivity and re-probe so the router sees it immediately.
    pub async fn set_online(&self, online: bool) {
        self.durable.set_online(online);
        self.probe.check().await;
    }
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for: {}", what);
}
