// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends: the in-memory fallback and the durable stores.

pub mod memory;
pub mod reconnect;
pub mod redis;
pub mod sql;
pub mod traits;

use std::sync::Arc;
use tracing::info;

use crate::resilience::retry::RetryConfig;
use traits::{KvStore, StorageError};

/// Connect the durable store named by `url`, retrying per `policy`.
///
/// `redis://` and `rediss://` URLs open a [`RedisStore`](self::redis::RedisStore) namespaced by
/// `redis_prefix`; anything else goes to the SQL driver.
pub async fn connect_durable(
    url: &str,
    redis_prefix: Option<&str>,
    policy: &RetryConfig,
) -> Result<Arc<dyn KvStore>, StorageError> {
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        info!(backend = "redis", "Connecting durable store");
        let store = self::redis::RedisStore::connect(url, redis_prefix, policy).await?;
        Ok(Arc::new(store))
    } else {
        info!(backend = "sql", "Connecting durable store");
        let store = self::sql::SqlStore::connect(url, policy).await?;
        Ok(Arc::new(store))
    }
}
