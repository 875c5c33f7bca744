// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage router.
//!
//! The single key/value surface business code talks to. Each call consults
//! the probe's cached health and picks a backend:
//!
//! ```text
//! primary-connected ──► durable store (write-through to fallback)
//!        │ transient failure: re-probe
//!        ▼
//! fallback-memory  ───► fallback store + queue  (result tagged degraded)
//!
//! error            ───► StorageError::Unavailable
//! ```
//!
//! A write that lands on the fallback store enqueues a [`PendingOperation`]
//! and returns [`WriteReceipt::Degraded`] carrying its id. Callers treat
//! the degraded flag as informational and never retry themselves.
//!
//! While a key has unsynced operations, reads of it are served from the
//! fallback store and new writes to it join the queue behind them, even if
//! the durable store is reachable. Otherwise a fresh write could be
//! overwritten later by the replay of an older one.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::ReplayError;
use crate::metrics::LatencyTimer;
use crate::queue::{OperationKind, OperationQueue, PendingOperation};
use crate::resilience::health::{HealthProbe, HealthState, StorageHealth};
use crate::storage::memory::MemoryStore;
use crate::storage::traits::{EntityKey, Entry, KvStore, StorageError};

/// Outcome of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteReceipt {
    /// Confirmed by the durable store
    Committed,
    /// Held by the fallback store only; replay is queued
    Degraded { operation_id: String },
}

impl WriteReceipt {
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Self::Committed => None,
            Self::Degraded { operation_id } => Some(operation_id),
        }
    }
}

/// A read result and whether it came from the fallback store.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed<T> {
    pub value: T,
    pub degraded: bool,
}

impl<T> Routed<T> {
    fn primary(value: T) -> Self {
        Self { value, degraded: false }
    }

    fn degraded(value: T) -> Self {
        crate::metrics::record_degraded_read();
        Self { value, degraded: true }
    }
}

enum Route {
    Primary(Arc<dyn KvStore>),
    Fallback,
    Unavailable,
}

pub struct StorageRouter {
    durable: Option<Arc<dyn KvStore>>,
    fallback: Arc<MemoryStore>,
    probe: Arc<HealthProbe>,
    queue: Arc<OperationQueue>,
    /// Ceiling for every durable call
    call_timeout: Duration,
    /// Keeps fallback writes and their queue entries in the same order
    degraded_writes: Mutex<()>,
}

impl StorageRouter {
    pub fn new(
        durable: Option<Arc<dyn KvStore>>,
        fallback: Arc<MemoryStore>,
        probe: Arc<HealthProbe>,
        queue: Arc<OperationQueue>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            durable,
            fallback,
            probe,
            queue,
            call_timeout,
            degraded_writes: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn has_durable(&self) -> bool {
        self.durable.is_some()
    }

    pub fn fallback(&self) -> &Arc<MemoryStore> {
        &self.fallback
    }

    pub fn probe(&self) -> &Arc<HealthProbe> {
        &self.probe
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    /// Current health, re-probing if the cached value is stale.
    pub async fn health(&self) -> StorageHealth {
        self.probe.current().await
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<Routed<Option<Value>>, StorageError> {
        let store = match self.route().await {
            Route::Unavailable => return Err(Self::unavailable()),
            Route::Fallback => return self.get_fallback(key).await,
            Route::Primary(store) => store,
        };

        if self.queue.has_unsynced(key) {
            debug!(key, "Serving unsynced key from fallback");
            return self.get_fallback(key).await;
        }

        match self.timed("get", store.get(key)).await {
            Ok(value) => Ok(Routed::primary(value)),
            Err(e) if e.is_transient() => {
                self.failover(e).await?;
                self.get_fallback(key).await
            }
            Err(e) => Err(e),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn list(&self, prefix: &str) -> Result<Routed<Vec<Entry>>, StorageError> {
        let store = match self.route().await {
            Route::Unavailable => return Err(Self::unavailable()),
            Route::Fallback => return Ok(Routed::degraded(self.fallback.list(prefix).await?)),
            Route::Primary(store) => store,
        };

        let entries = match self.timed("list", store.list(prefix)).await {
            Ok(entries) => entries,
            Err(e) if e.is_transient() => {
                self.failover(e).await?;
                return Ok(Routed::degraded(self.fallback.list(prefix).await?));
            }
            Err(e) => return Err(e),
        };

        let unsynced: HashSet<String> = self
            .queue
            .unsynced_keys()
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect();
        if unsynced.is_empty() {
            return Ok(Routed::primary(entries));
        }

        // Overlay keys whose latest value only the fallback store holds
        let mut merged: BTreeMap<String, Value> = entries
            .into_iter()
            .filter(|entry| !unsynced.contains(&entry.key))
            .map(|entry| (entry.key, entry.value))
            .collect();
        for key in unsynced {
            if let Some(value) = self.fallback.get(&key).await? {
                merged.insert(key, value);
            }
        }
        let entries = merged
            .into_iter()
            .map(|(key, value)| Entry { key, value })
            .collect();
        Ok(Routed::degraded(entries))
    }

    /// Write `value` at an `"{entity_type}:{entity_id}"` key.
    #[tracing::instrument(skip(self, value))]
    pub async fn put(&self, key: &str, value: &Value) -> Result<WriteReceipt, StorageError> {
        let entity = Self::entity_key(key)?;
        self.write(entity, OperationKind::Update, Some(value)).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<WriteReceipt, StorageError> {
        let entity = Self::entity_key(key)?;
        self.write(entity, OperationKind::Delete, None).await
    }

    /// Store a new entity under a client-assigned id.
    ///
    /// The id is fixed before anything is written, so a queued create is
    /// replayed against the same key no matter how often it runs.
    #[tracing::instrument(skip(self, value))]
    pub async fn create(
        &self,
        entity_type: &str,
        value: &Value,
    ) -> Result<(EntityKey, WriteReceipt), StorageError> {
        if entity_type.is_empty() || entity_type.contains(':') {
            return Err(StorageError::Rejected(format!("invalid entity type '{}'", entity_type)));
        }
        let entity = EntityKey::new(entity_type, Uuid::now_v7().to_string());
        let receipt = self.write(entity.clone(), OperationKind::Create, Some(value)).await?;
        Ok((entity, receipt))
    }

    /// Apply a queued operation to the durable store only.
    ///
    /// Never touches the fallback store: landing there during a sync is not
    /// progress. A create whose key already holds the same value counts as
    /// applied; a different value is a conflict.
    #[tracing::instrument(skip(self, op), fields(id = %op.id, kind = %op.kind))]
    pub async fn apply_durable(&self, op: &PendingOperation) -> Result<(), ReplayError> {
        let store = self
            .durable
            .as_ref()
            .ok_or_else(|| ReplayError::Retryable("no durable store connected".into()))?;
        let key = op.storage_key();

        match op.kind {
            OperationKind::Create => {
                let existing = self.timed("get", store.get(&key)).await?;
                match existing {
                    Some(existing) if existing == op.payload => {
                        debug!(key = %key, "Create already applied");
                        Ok(())
                    }
                    Some(_) => Err(StorageError::Conflict { key }.into()),
                    None => Ok(self.timed("put", store.put(&key, &op.payload)).await?),
                }
            }
            OperationKind::Update => Ok(self.timed("put", store.put(&key, &op.payload)).await?),
            OperationKind::Delete => Ok(self.timed("delete", store.delete(&key)).await?),
        }
    }

    async fn write(
        &self,
        entity: EntityKey,
        kind: OperationKind,
        value: Option<&Value>,
    ) -> Result<WriteReceipt, StorageError> {
        let key = entity.storage_key();
        let store = match self.route().await {
            Route::Unavailable => return Err(Self::unavailable()),
            Route::Fallback => return self.write_degraded(entity, kind, value, "fallback").await,
            Route::Primary(store) => store,
        };

        if self.queue.has_unsynced(&key) {
            return self.write_degraded(entity, kind, value, "unsynced").await;
        }

        let result = match value {
            Some(value) => self.timed("put", store.put(&key, value)).await,
            None => self.timed("delete", store.delete(&key)).await,
        };

        match result {
            Ok(()) => {
                self.mirror(&key, value).await;
                Ok(WriteReceipt::Committed)
            }
            Err(e) if e.is_transient() => {
                self.failover(e).await?;
                self.write_degraded(entity, kind, value, "failover").await
            }
            Err(e) => Err(e),
        }
    }

    async fn write_degraded(
        &self,
        entity: EntityKey,
        kind: OperationKind,
        value: Option<&Value>,
        reason: &'static str,
    ) -> Result<WriteReceipt, StorageError> {
        let key = entity.storage_key();
        let _order = self.degraded_writes.lock().await;

        match value {
            Some(value) => self.fallback.put(&key, value).await?,
            None => self.fallback.delete(&key).await?,
        }
        crate::metrics::record_storage_call("fallback", if value.is_some() { "put" } else { "delete" }, "success");

        let op = self.queue.enqueue(
            kind,
            entity.entity_type,
            Some(entity.entity_id),
            value.cloned().unwrap_or(Value::Null),
        );
        crate::metrics::record_degraded_write(&kind.to_string());
        info!(key = %key, operation_id = %op.id, reason, "Write held in fallback, replay queued");

        Ok(WriteReceipt::Degraded { operation_id: op.id })
    }

    async fn get_fallback(&self, key: &str) -> Result<Routed<Option<Value>>, StorageError> {
        crate::metrics::record_storage_call("fallback", "get", "success");
        Ok(Routed::degraded(self.fallback.get(key).await?))
    }

    /// Keep the fallback copy current after a confirmed durable write.
    async fn mirror(&self, key: &str, value: Option<&Value>) {
        // Ordered against degraded writes so the check below stays valid
        let _order = self.degraded_writes.lock().await;
        // A queued write for this key is newer than what we just confirmed
        if self.queue.has_unsynced(key) {
            return;
        }
        let result = match value {
            Some(value) => self.fallback.put(key, value).await,
            None => self.fallback.delete(key).await,
        };
        if let Err(e) = result {
            debug!(key, error = %e, "Fallback mirror failed");
        }
    }

    async fn route(&self) -> Route {
        let health = self.probe.current().await;
        match (health.state, &self.durable) {
            (HealthState::PrimaryConnected, Some(store)) => Route::Primary(store.clone()),
            (HealthState::Error, _) => Route::Unavailable,
            _ if self.probe.allows_fallback() => Route::Fallback,
            _ => Route::Unavailable,
        }
    }

    /// Re-probe after a transient durable failure. `Ok` means the caller
    /// should continue on the fallback store.
    async fn failover(&self, err: StorageError) -> Result<(), StorageError> {
        warn!(error = %err, "Durable call failed, re-probing");
        match self.probe.check().await.state {
            HealthState::FallbackMemory => Ok(()),
            HealthState::Error => Err(StorageError::Unavailable(format!(
                "durable store unreachable ({}) and fallback disabled",
                err
            ))),
            // Store answers pings but refused this call
            HealthState::PrimaryConnected => Err(err),
        }
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        let _timer = LatencyTimer::new("durable", operation);
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => {
                let status = if result.is_ok() { "success" } else { "error" };
                crate::metrics::record_storage_call("durable", operation, status);
                result
            }
            Err(_) => {
                crate::metrics::record_timeout("durable", operation);
                Err(StorageError::Timeout {
                    operation: operation.to_string(),
                    after_ms: self.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    fn entity_key(key: &str) -> Result<EntityKey, StorageError> {
        let entity = EntityKey::parse(key);
        if entity.entity_type.is_empty() || entity.entity_id.is_empty() {
            return Err(StorageError::Rejected(format!(
                "key '{}' is not of the form entity_type:entity_id",
                key
            )));
        }
        Ok(entity)
    }

    fn unavailable() -> StorageError {
        StorageError::Unavailable("durable store unreachable and fallback disabled".into())
    }
}
