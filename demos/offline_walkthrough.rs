// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline walkthrough.
//!
//! Runs entirely in-process against a durable store whose connection can be
//! pulled:
//! 1. Commit a product while the durable store is up
//! 2. Pull the plug and keep selling (writes land in the fallback + queue)
//! 3. Reconnect and let the sync engine replay the queue
//! 4. Show queue stats and the recorded metrics
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=offline_sync=debug cargo run --example offline_walkthrough
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use offline_sync::{
    Entry, FixedSession, KvStore, MemoryStore, OfflineSync, OfflineSyncConfig, StorageError,
};

/// Stand-in for a remote database with a cable you can pull.
struct PluggableStore {
    inner: MemoryStore,
    plugged_in: AtomicBool,
}

impl PluggableStore {
    fn connected(&self) -> Result<(), StorageError> {
        if self.plugged_in.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Connection("network unreachable".into()))
        }
    }
}

#[async_trait]
impl KvStore for PluggableStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.connected()?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.connected()?;
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.connected()?;
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>, StorageError> {
        self.connected()?;
        self.inner.list(prefix).await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .map_err(|_| "failed to install metrics recorder")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let durable = Arc::new(PluggableStore {
        inner: MemoryStore::new(),
        plugged_in: AtomicBool::new(true),
    });
    let config = OfflineSyncConfig {
        sync_interval_secs: 3600,
        ..Default::default()
    };
    let sync = OfflineSync::start_with(
        config,
        Some(durable.clone() as Arc<dyn KvStore>),
        Arc::new(FixedSession(None)),
    )
    .await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Online
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n[1] Durable store up");
    let receipt = sync
        .storage()
        .put("product:espresso", &json!({"price": 250, "stock": 40}))
        .await?;
    println!("    product:espresso -> {:?}", receipt);

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Offline
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n[2] Cable pulled");
    durable.plugged_in.store(false, Ordering::SeqCst);
    println!("    health: {}", sync.check_health().await.state);

    let receipt = sync
        .storage()
        .put("product:espresso", &json!({"price": 250, "stock": 39}))
        .await?;
    println!("    product:espresso -> {:?}", receipt);
    let (order, receipt) = sync
        .storage()
        .create("order", &json!({"lines": [{"sku": "espresso", "qty": 1}], "total": 250}))
        .await?;
    println!("    {} -> {:?}", order, receipt);

    let read = sync.storage().get("product:espresso").await?;
    println!("    read back (degraded={}): {}", read.degraded, read.value.unwrap_or(Value::Null));
    print_stats(&sync);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Reconnect
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n[3] Cable back in");
    durable.plugged_in.store(true, Ordering::SeqCst);
    println!("    health: {}", sync.check_health().await.state);

    let outcome = sync.engine().run_once().await;
    println!("    sync run: {:?}", outcome);
    println!("    durable order: {}", durable.inner.get(&order.storage_key()).await?.unwrap_or(Value::Null));
    print_stats(&sync);

    let cleared = sync.engine().clear_all();
    println!("    cleared {} synced entries", cleared);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n[4] Metrics");
    dump_metrics(&snapshotter);

    sync.shutdown().await;
    println!("\nEngine state: {}", sync.engine().state());
    Ok(())
}

fn print_stats(sync: &OfflineSync) {
    let stats = sync.stats();
    println!(
        "    queue: total={} pending={} synced={} errors={}",
        stats.total, stats.pending, stats.synced, stats.errors
    );
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let value = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => v.into_inner().to_string(),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("    {}{{{}}} = {}", key.name(), labels.join(","), value)
        })
        .collect();
    lines.sort();
    for line in lines {
        println!("{}", line);
    }
}
