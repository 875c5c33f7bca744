// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-wide wiring: one probe, fallback store, queue, router, sync
//! engine and boot gate per process, built once at start and torn down at
//! shutdown.
//!
//! # Example
//!
//! ```rust,no_run
//! use offline_sync::{FixedSession, OfflineSync, OfflineSyncConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), offline_sync::StorageError> {
//! let config = OfflineSyncConfig {
//!     durable_url: Some("redis://localhost:6379".into()),
//!     journal_path: Some("./pos_queue.db".into()),
//!     ..Default::default()
//! };
//! let sync = OfflineSync::start(config, Arc::new(FixedSession(None))).await?;
//!
//! let receipt = sync.storage().put("product:p1", &json!({"stock": 5})).await?;
//! if receipt.is_degraded() {
//!     println!("saved locally, {} change(s) waiting to sync", sync.stats().pending);
//! }
//!
//! sync.shutdown().await;
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::boot::{BootGate, BootStatus, SessionSource};
use crate::config::OfflineSyncConfig;
use crate::engine::SyncEngine;
use crate::queue::{OperationQueue, SyncStats};
use crate::resilience::health::{HealthProbe, HealthState, StorageHealth};
use crate::resilience::journal::{JournalHandle, QueueJournal};
use crate::resilience::retry::RetryConfig;
use crate::router::StorageRouter;
use crate::storage::memory::MemoryStore;
use crate::storage::reconnect::ReconnectingStore;
use crate::storage::traits::{KvStore, StorageError};

pub struct OfflineSync {
    config: OfflineSyncConfig,
    probe: Arc<HealthProbe>,
    queue: Arc<OperationQueue>,
    router: Arc<StorageRouter>,
    engine: Arc<SyncEngine>,
    boot_gate: BootGate,
    journal: Option<JournalHandle>,
    shutdown_tx: watch::Sender<bool>,
    interval_tx: watch::Sender<Duration>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineSync {
    /// Connect the configured durable store and start the sync loop.
    ///
    /// A durable store that cannot be reached is not fatal: the process
    /// starts degraded and the probe reports fallback (or error when
    /// fallback is disabled) until a later connect attempt succeeds. A journal that cannot be opened is fatal,
    /// since queued work would silently lose its durability.
    #[tracing::instrument(skip(config, sessions), fields(durable_connected))]
    pub async fn start(
        config: OfflineSyncConfig,
        sessions: Arc<dyn SessionSource>,
    ) -> Result<Self, StorageError> {
        let durable: Option<Arc<dyn KvStore>> = match config.durable_url.as_deref() {
            Some(url) => {
                let backoff = RetryConfig {
                    initial_delay: Duration::from_millis(config.reconnect_initial_ms),
                    max_delay: Duration::from_millis(config.reconnect_max_ms),
                    ..RetryConfig::daemon()
                };
                let store = ReconnectingStore::connect(url, config.redis_prefix.as_deref(), backoff).await;
                tracing::Span::current().record("durable_connected", store.is_connected());
                Some(Arc::new(store))
            }
            None => {
                warn!("No durable store configured, all data is process-local");
                None
            }
        };

        Self::start_with(config, durable, sessions).await
    }

    /// Start around an already-connected durable store.
    pub async fn start_with(
        config: OfflineSyncConfig,
        durable: Option<Arc<dyn KvStore>>,
        sessions: Arc<dyn SessionSource>,
    ) -> Result<Self, StorageError> {
        let started = std::time::Instant::now();
        info!("Starting offline sync");

        let (queue, journal) = match config.journal_path.as_deref() {
            Some(path) => {
                let journal = Arc::new(QueueJournal::open(path).await?);
                let recovered = journal.load().await?;
                let (handle, _writer) = journal.spawn_writer();
                let queue = OperationQueue::with_journal(config.max_attempts, handle.clone());
                queue.restore(recovered);
                (Arc::new(queue), Some(handle))
            }
            None => (Arc::new(OperationQueue::new(config.max_attempts)), None),
        };

        let probe = Arc::new(HealthProbe::new(
            durable.clone(),
            config.allow_fallback,
            config.probe_timeout(),
            config.health_ttl(),
        ));
        let initial = probe.check().await;
        info!(health = %initial.state, "Initial storage probe");

        let router = Arc::new(StorageRouter::new(
            durable,
            Arc::new(MemoryStore::new()),
            probe.clone(),
            queue.clone(),
            config.call_timeout(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = Arc::new(SyncEngine::new(router.clone(), shutdown_rx));
        let boot_gate = BootGate::new(
            router.clone(),
            sessions,
            config.setup_key.clone(),
            config.session_prefix.clone(),
        );

        let (interval_tx, interval_rx) = watch::channel(config.sync_interval());
        let backoff = RetryConfig::sync_loop(
            Duration::from_millis(config.sync_backoff_initial_ms),
            Duration::from_millis(config.sync_backoff_max_ms),
        );
        let loop_engine = engine.clone();
        let sync_task = tokio::spawn(async move {
            loop_engine.run(interval_rx, backoff).await;
        });

        let stats = queue.stats();
        crate::metrics::set_queue_depth(&stats);
        if stats.pending > 0 && initial.state == HealthState::PrimaryConnected {
            info!(pending = stats.pending, "Recovered operations waiting, syncing now");
            engine.trigger();
        }

        info!(
            health = %initial.state,
            pending = stats.pending,
            duration_ms = started.elapsed().as_millis() as u64,
            "Offline sync started"
        );

        Ok(Self {
            config,
            probe,
            queue,
            router,
            engine,
            boot_gate,
            journal,
            shutdown_tx,
            interval_tx,
            sync_task: Mutex::new(Some(sync_task)),
        })
    }

    /// The key/value surface for business code.
    pub fn storage(&self) -> &Arc<StorageRouter> {
        &self.router
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn probe(&self) -> &Arc<HealthProbe> {
        &self.probe
    }

    pub fn boot_gate(&self) -> &BootGate {
        &self.boot_gate
    }

    pub fn config(&self) -> &OfflineSyncConfig {
        &self.config
    }

    /// Probe now, bypassing the cache.
    pub async fn check_health(&self) -> StorageHealth {
        self.probe.check().await
    }

    pub fn stats(&self) -> SyncStats {
        self.engine.stats()
    }

    pub async fn evaluate_boot(&self) -> BootStatus {
        self.boot_gate.evaluate().await
    }

    /// Change the sync period of the running loop.
    pub fn set_sync_interval(&self, interval: Duration) {
        let interval = interval.max(Duration::from_secs(1));
        self.interval_tx.send_replace(interval);
    }

    /// Stop the sync loop and flush the journal. An item being replayed
    /// finishes first.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Shutting down offline sync");
        self.shutdown_tx.send_replace(true);

        let task = self.sync_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Sync loop ended abnormally");
            }
        }

        if let Some(journal) = &self.journal {
            journal.flush().await;
        }

        let stats = self.queue.stats();
        if stats.pending > 0 {
            warn!(pending = stats.pending, journaled = self.journal.is_some(), "Shutting down with unsynced operations");
        }
        info!("Offline sync stopped");
    }
}
