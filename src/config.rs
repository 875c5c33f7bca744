// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the offline-resilience layer.
//!
//! # Example
//!
//! ```
//! use offline_sync::OfflineSyncConfig;
//!
//! // Minimal config: no durable store, memory fallback allowed
//! let config = OfflineSyncConfig::default();
//! assert!(config.allow_fallback);
//! assert_eq!(config.probe_timeout_ms, 3000);
//!
//! // Production-ish config
//! let config = OfflineSyncConfig {
//!     durable_url: Some("mysql://pos:pos@db/pos".into()),
//!     journal_path: Some("./pos_queue.db".into()),
//!     sync_interval_secs: 30,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;
use std::time::Duration;

/// All fields have defaults. Without a `durable_url` every call lands on the
/// memory fallback (or fails, if `allow_fallback` is off).
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineSyncConfig {
    /// Durable store connection string: `redis://`, `sqlite:` or `mysql://`
    #[serde(default)]
    pub durable_url: Option<String>,

    /// Key prefix when the durable store is a shared Redis
    #[serde(default)]
    pub redis_prefix: Option<String>,

    /// Serve from the memory fallback when the durable store is unreachable
    #[serde(default = "default_allow_fallback")]
    pub allow_fallback: bool,

    /// Ceiling for one health round-trip
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// How long a probe result is reused before re-probing
    #[serde(default = "default_health_ttl_ms")]
    pub health_ttl_ms: u64,

    /// Ceiling for every individual durable-store call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Background sync period after a clean run
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Retryable failures allowed per operation before it is parked in `error`
    /// (`None` retries forever)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,

    /// Backoff after a run with failures
    #[serde(default = "default_sync_backoff_initial_ms")]
    pub sync_backoff_initial_ms: u64,
    #[serde(default = "default_sync_backoff_max_ms")]
    pub sync_backoff_max_ms: u64,

    /// Spacing of reconnect attempts while the durable store has never
    /// answered (e.g. the process booted during an outage)
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// SQLite file journaling the operation queue (disabled when `None`)
    #[serde(default)]
    pub journal_path: Option<String>,

    /// Bootstrap record marking first-run setup as done
    #[serde(default = "default_setup_key")]
    pub setup_key: String,

    /// Prefix of session records read by the boot gate
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
}

fn default_allow_fallback() -> bool { true }
fn default_probe_timeout_ms() -> u64 { 3000 }
fn default_health_ttl_ms() -> u64 { 5000 }
fn default_call_timeout_ms() -> u64 { 3000 }
fn default_sync_interval_secs() -> u64 { 60 }
fn default_max_attempts() -> Option<u32> { Some(10) }
fn default_sync_backoff_initial_ms() -> u64 { 1000 }
fn default_sync_backoff_max_ms() -> u64 { 300_000 } // 5 minutes
fn default_reconnect_initial_ms() -> u64 { 1000 }
fn default_reconnect_max_ms() -> u64 { 60_000 }
fn default_setup_key() -> String { "system:setup".to_string() }
fn default_session_prefix() -> String { "session:".to_string() }

impl Default for OfflineSyncConfig {
    fn default() -> Self {
        Self {
            durable_url: None,
            redis_prefix: None,
            allow_fallback: default_allow_fallback(),
            probe_timeout_ms: default_probe_timeout_ms(),
            health_ttl_ms: default_health_ttl_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            sync_interval_secs: default_sync_interval_secs(),
            max_attempts: default_max_attempts(),
            sync_backoff_initial_ms: default_sync_backoff_initial_ms(),
            sync_backoff_max_ms: default_sync_backoff_max_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            journal_path: None,
            setup_key: default_setup_key(),
            session_prefix: default_session_prefix(),
        }
    }
}

impl OfflineSyncConfig {
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    #[must_use]
    pub fn health_ttl(&self) -> Duration {
        Duration::from_millis(self.health_ttl_ms)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }
}
