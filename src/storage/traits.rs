// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The key/value interface shared by the durable backends, the fallback
//! store and the router.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Reserved key read by the default [`KvStore::ping`].
pub const HEALTH_CHECK_KEY: &str = "__health_check__";

#[derive(Error, Debug)]
pub enum StorageError {
    /// No primary and no usable fallback.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Storage call '{operation}' timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },
    #[error("Connection error: {0}")]
    Connection(String),
    /// The store refused the payload (validation, constraint).
    #[error("Rejected by store: {0}")]
    Rejected(String),
    #[error("Conflicting value already stored at '{key}'")]
    Conflict { key: String },
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether retrying the same call later can succeed.
    ///
    /// `Backend` is treated as transient: driver errors that are not an
    /// explicit rejection are overwhelmingly connectivity problems.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout { .. } | Self::Connection(_) | Self::Backend(_)
        )
    }
}

/// A stored key and its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Value,
}

/// Entity-scoped storage key: `"{entity_type}:{entity_id}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Split a storage key on its first `:`. A key without a separator is
    /// a bare entity type with an empty id.
    #[must_use]
    pub fn parse(key: &str) -> Self {
        match key.split_once(':') {
            Some((entity_type, entity_id)) => Self::new(entity_type, entity_id),
            None => Self::new(key, ""),
        }
    }

    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.entity_type, self.entity_id)
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn put(&self, key: &str, value: &Value) -> Result<(), StorageError>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    /// Entries whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<Entry>, StorageError>;

    /// Lightweight round-trip used by the health probe.
    async fn ping(&self) -> Result<(), StorageError> {
        self.get(HEALTH_CHECK_KEY).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_round_trip() {
        let key = EntityKey::new("product", "p1");
        assert_eq!(key.storage_key(), "product:p1");
        assert_eq!(EntityKey::parse("product:p1"), key);
    }

    #[test]
    fn test_entity_key_splits_on_first_separator() {
        let key = EntityKey::parse("order:2024:17");
        assert_eq!(key.entity_type, "order");
        assert_eq!(key.entity_id, "2024:17");
    }

    #[test]
    fn test_entity_key_without_separator() {
        let key = EntityKey::parse("settings");
        assert_eq!(key.entity_type, "settings");
        assert!(key.entity_id.is_empty());
    }

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Connection("reset".into()).is_transient());
        assert!(StorageError::Timeout { operation: "put".into(), after_ms: 3000 }.is_transient());
        assert!(!StorageError::Rejected("bad sku".into()).is_transient());
        assert!(!StorageError::Conflict { key: "product:p1".into() }.is_transient());
    }
}
