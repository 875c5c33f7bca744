// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backend probe.
//!
//! Round-trips the durable store under a hard timeout and caches the result
//! for a short TTL, so the router can consult health on every call without
//! re-probing. Callers may act on a value up to one TTL old.
//!
//! State changes are broadcast on a `watch` channel; the sync loop listens
//! for transitions into [`HealthState::PrimaryConnected`].

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::storage::traits::KvStore;

/// Which backend the router should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthState {
    PrimaryConnected = 0,
    FallbackMemory = 1,
    Error = 2,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrimaryConnected => write!(f, "primary-connected"),
            Self::FallbackMemory => write!(f, "fallback-memory"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageHealth {
    pub state: HealthState,
    /// Epoch millis of the round-trip that produced this value
    pub checked_at: i64,
}

pub struct HealthProbe {
    durable: Option<Arc<dyn KvStore>>,
    allow_fallback: bool,
    timeout: Duration,
    ttl: Duration,
    /// Last result and when it was taken (monotonic)
    cached: RwLock<Option<(StorageHealth, Instant)>>,
    /// Serializes probes so concurrent stale readers share one round-trip
    checking: Mutex<()>,
    state_tx: watch::Sender<HealthState>,
    consecutive_failures: AtomicU64,
}

impl HealthProbe {
    /// `durable` is `None` when no durable store is configured or it could
    /// not be reached at startup.
    pub fn new(
        durable: Option<Arc<dyn KvStore>>,
        allow_fallback: bool,
        timeout: Duration,
        ttl: Duration,
    ) -> Self {
        // Start pessimistic: the first successful probe counts as a
        // connectivity-restored transition and wakes the sync loop.
        let initial = if allow_fallback {
            HealthState::FallbackMemory
        } else {
            HealthState::Error
        };
        let (state_tx, _) = watch::channel(initial);

        Self {
            durable,
            allow_fallback,
            timeout,
            ttl,
            cached: RwLock::new(None),
            checking: Mutex::new(()),
            state_tx,
            consecutive_failures: AtomicU64::new(0),
        }
    }

    /// State reported when the durable store does not answer.
    #[must_use]
    pub fn degraded_state(&self) -> HealthState {
        if self.allow_fallback {
            HealthState::FallbackMemory
        } else {
            HealthState::Error
        }
    }

    #[must_use]
    pub fn allows_fallback(&self) -> bool {
        self.allow_fallback
    }

    /// Probe now, regardless of the cached value.
    pub async fn check(&self) -> StorageHealth {
        let _guard = self.checking.lock().await;
        self.probe().await
    }

    /// Cached health if younger than the TTL, otherwise probe.
    pub async fn current(&self) -> StorageHealth {
        if let Some(health) = self.fresh() {
            return health;
        }

        let _guard = self.checking.lock().await;
        // Someone else may have probed while we waited for the lock
        if let Some(health) = self.fresh() {
            return health;
        }
        self.probe().await
    }

    /// Last known result without any I/O.
    #[must_use]
    pub fn last_known(&self) -> Option<StorageHealth> {
        self.cached.read().as_ref().map(|(health, _)| *health)
    }

    /// Watch health state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    fn fresh(&self) -> Option<StorageHealth> {
        let cached = self.cached.read();
        match *cached {
            Some((health, taken)) if taken.elapsed() < self.ttl => Some(health),
            _ => None,
        }
    }

    async fn probe(&self) -> StorageHealth {
        let start = Instant::now();

        let state = match &self.durable {
            None => self.degraded_state(),
            Some(store) => match tokio::time::timeout(self.timeout, store.ping()).await {
                Ok(Ok(())) => HealthState::PrimaryConnected,
                Ok(Err(e)) => {
                    debug!(error = %e, "Durable store ping failed");
                    self.degraded_state()
                }
                Err(_) => {
                    debug!(timeout = ?self.timeout, "Durable store ping timed out");
                    crate::metrics::record_timeout("durable", "ping");
                    self.degraded_state()
                }
            },
        };

        if state == HealthState::PrimaryConnected {
            self.consecutive_failures.store(0, Ordering::Release);
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        }

        crate::metrics::record_probe(state, start.elapsed());
        self.publish(state)
    }

    fn publish(&self, state: HealthState) -> StorageHealth {
        let health = StorageHealth {
            state,
            checked_at: crate::now_millis(),
        };
        *self.cached.write() = Some((health, Instant::now()));

        let previous = self.state_tx.send_replace(state);
        if previous != state {
            crate::metrics::record_health_transition(previous, state);
            crate::metrics::set_health_state(state);
            match state {
                HealthState::PrimaryConnected => {
                    info!(from = %previous, "Durable store reachable")
                }
                _ => warn!(from = %previous, to = %state, "Durable store unreachable"),
            }
        }
        health
    }
}
