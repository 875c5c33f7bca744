// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-local fallback store.
//!
//! Contents are lost on restart. It keeps the console responsive while the
//! durable store is unreachable; durability comes from the operation queue
//! replaying writes once the primary is back.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use super::traits::{Entry, KvStore, StorageError};

pub struct MemoryStore {
    data: DashMap<String, Value>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>, StorageError> {
        let mut entries: Vec<Entry> = self
            .data
            .iter()
            .filter(|r| r.key().starts_with(prefix))
            .map(|r| Entry {
                key: r.key().clone(),
                value: r.value().clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
