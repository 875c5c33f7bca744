// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Boot gate.
//!
//! Answers three questions at process or session start: can storage be
//! used, has first-run setup been completed, and is the caller logged in.
//! Acting on the answers (redirect to setup, to login, or proceed) is the
//! caller's job.
//!
//! The gate fails closed. When storage is unavailable every field is
//! `false`, and a bootstrap record that cannot be read counts as absent.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::resilience::health::HealthState;
use crate::router::StorageRouter;

/// Supplies the session token presented by the current caller.
///
/// Authentication itself lives outside this crate.
pub trait SessionSource: Send + Sync {
    fn session_token(&self) -> Option<String>;
}

/// A session source with a fixed answer.
#[derive(Debug, Clone, Default)]
pub struct FixedSession(pub Option<String>);

impl SessionSource for FixedSession {
    fn session_token(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BootStatus {
    pub storage_available: bool,
    pub setup_complete: bool,
    pub logged_in: bool,
    pub health: HealthState,
    /// Some answer came from the fallback store
    pub degraded: bool,
}

impl BootStatus {
    fn closed(health: HealthState) -> Self {
        Self {
            storage_available: false,
            setup_complete: false,
            logged_in: false,
            health,
            degraded: false,
        }
    }
}

pub struct BootGate {
    router: Arc<StorageRouter>,
    sessions: Arc<dyn SessionSource>,
    /// Record whose `{"complete": true}` marks setup as done
    setup_key: String,
    /// Session records live at `{session_prefix}{token}`
    session_prefix: String,
}

impl BootGate {
    pub fn new(
        router: Arc<StorageRouter>,
        sessions: Arc<dyn SessionSource>,
        setup_key: impl Into<String>,
        session_prefix: impl Into<String>,
    ) -> Self {
        Self {
            router,
            sessions,
            setup_key: setup_key.into(),
            session_prefix: session_prefix.into(),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn evaluate(&self) -> BootStatus {
        let health = self.router.health().await.state;
        if health == HealthState::Error {
            warn!("Storage unavailable, boot gate closed");
            return BootStatus::closed(health);
        }

        let mut degraded = health == HealthState::FallbackMemory;

        let setup_complete = match self.read(&self.setup_key, &mut degraded).await {
            Some(record) => setup_flag(&record),
            None => false,
        };

        let logged_in = match self.sessions.session_token() {
            Some(token) if !token.is_empty() => {
                let key = format!("{}{}", self.session_prefix, token);
                match self.read(&key, &mut degraded).await {
                    Some(record) => session_valid(&record, crate::now_millis()),
                    None => false,
                }
            }
            _ => false,
        };

        let status = BootStatus {
            storage_available: true,
            setup_complete,
            logged_in,
            health,
            degraded,
        };
        debug!(?status, "Boot gate evaluated");
        status
    }

    /// Read a bootstrap record. Any failure reads as absent.
    async fn read(&self, key: &str, degraded: &mut bool) -> Option<Value> {
        match self.router.get(key).await {
            Ok(read) => {
                *degraded |= read.degraded;
                read.value
            }
            Err(e) => {
                warn!(key, error = %e, "Bootstrap record unreadable");
                None
            }
        }
    }
}

fn setup_flag(record: &Value) -> bool {
    match record {
        Value::Bool(complete) => *complete,
        other => other.get("complete").and_then(Value::as_bool).unwrap_or(false),
    }
}

/// A session record is valid unless it carries an `expires_at` (epoch
/// millis) in the past.
fn session_valid(record: &Value, now: i64) -> bool {
    if record.is_null() {
        return false;
    }
    match record.get("expires_at").and_then(Value::as_i64) {
        Some(expires_at) => expires_at > now,
        None => true,
    }
}
