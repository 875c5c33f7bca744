// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end offline scenarios: outage, degraded writes, reconnect and
//! reconciliation.
//!
//! Run with: `cargo test --test offline_scenarios`

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;

use common::{wait_until, ChaosStore, Rig};
use offline_sync::{
    FixedSession, HealthState, KvStore, OfflineSync, OfflineSyncConfig, OperationKind,
    OperationStatus, RunOutcome, StorageError, SyncResult, WriteReceipt,
};

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn update_queued_offline_syncs_after_reconnect() {
    let rig = Rig::new(true, Some(10));
    rig.set_online(false).await;
    assert_eq!(rig.router.health().await.state, HealthState::FallbackMemory);

    let receipt = rig.router.put("product:p1", &json!({"stock": 5})).await.unwrap();
    assert!(receipt.is_degraded());

    let ops = rig.queue.list();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].status, OperationStatus::Pending);
    assert_eq!(ops[0].kind, OperationKind::Update);
    assert_eq!(ops[0].entity_type, "product");
    assert_eq!(ops[0].entity_id.as_deref(), Some("p1"));
    assert_eq!(ops[0].payload, json!({"stock": 5}));

    rig.set_online(true).await;
    assert_eq!(rig.router.health().await.state, HealthState::PrimaryConnected);

    let outcome = rig.engine.run_once().await;
    assert_eq!(outcome.result().unwrap().processed, 1);

    assert_eq!(rig.queue.get(&ops[0].id).unwrap().status, OperationStatus::Synced);
    let stats = rig.engine.stats();
    assert_eq!(stats.synced, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(rig.durable.get("product:p1").await.unwrap(), Some(json!({"stock": 5})));
}

#[tokio::test]
async fn permanent_rejection_stays_visible_until_cleared() {
    let rig = Rig::new(true, Some(10));
    rig.set_online(false).await;
    rig.router.put("product:p1", &json!({"stock": -3})).await.unwrap();
    let id = rig.queue.list()[0].id.clone();
    let attempts_before = rig.queue.get(&id).unwrap().attempts;

    rig.durable.reject("product:p1");
    rig.set_online(true).await;
    let result = rig.engine.run_once().await.result().unwrap();
    assert_eq!(result.failed, 1);

    let op = rig.queue.get(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Error);
    assert_eq!(op.attempts, attempts_before);
    assert!(op.last_error.as_deref().unwrap().contains("constraint violation"));

    // Later runs leave it alone and it keeps counting as an error
    for _ in 0..3 {
        rig.engine.run_once().await;
        assert_eq!(rig.engine.stats().errors, 1);
    }

    assert_eq!(rig.engine.clear_all(), 1);
    let stats = rig.engine.stats();
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.total, 0);
}

#[tokio::test]
async fn fallback_write_is_readable_and_queued_exactly_once() {
    let rig = Rig::new(true, None);
    rig.set_online(false).await;
    let before = rig.engine.stats().pending;

    rig.router.put("customer:c7", &json!({"name": "Lu", "tier": "gold"})).await.unwrap();

    let read = rig.router.get("customer:c7").await.unwrap();
    assert!(read.degraded);
    assert_eq!(read.value, Some(json!({"name": "Lu", "tier": "gold"})));
    assert_eq!(rig.engine.stats().pending, before + 1);
    assert_eq!(rig.durable.writes().len(), 0);
}

#[tokio::test]
async fn repeated_runs_converge() {
    let rig = Rig::new(true, None);
    rig.set_online(false).await;

    let n = 8;
    for i in 0..n {
        rig.router.put(&format!("product:p{}", i), &json!({"stock": i})).await.unwrap();
    }
    assert_eq!(rig.engine.stats().pending, n);

    // Two keys keep failing on the first run only
    rig.set_online(true).await;
    rig.durable.break_key("product:p2");
    rig.durable.break_key("product:p5");

    let mut runs = 0;
    while rig.engine.stats().pending > 0 {
        assert!(runs < n, "queue did not converge within {} runs", n);
        rig.engine.run_once().await;
        rig.durable.heal("product:p2");
        rig.durable.heal("product:p5");
        runs += 1;
    }

    let stats = rig.engine.stats();
    assert_eq!(stats.synced, n);
    assert_eq!(stats.pending, 0);
    assert_eq!(rig.durable.len(), n);
    assert!(stats.last_sync_success);
}

#[tokio::test]
async fn same_entity_operations_apply_in_enqueue_order() {
    let rig = Rig::new(true, None);
    rig.set_online(false).await;

    for v in 1..=5 {
        rig.router.put("product:p1", &json!({"v": v})).await.unwrap();
        rig.router.put("product:p2", &json!({"v": v * 10})).await.unwrap();
    }
    rig.router.delete("product:p2").await.unwrap();

    rig.set_online(true).await;
    rig.engine.run_once().await;

    let p1: Vec<_> = rig.durable.writes_for("product:p1");
    assert_eq!(p1, (1..=5).map(|v| Some(json!({"v": v}))).collect::<Vec<_>>());
    assert_eq!(rig.durable.writes_for("product:p2").last(), Some(&None));
    assert_eq!(rig.durable.get("product:p1").await.unwrap(), Some(json!({"v": 5})));
    assert_eq!(rig.durable.get("product:p2").await.unwrap(), None);
}

#[tokio::test]
async fn retryable_failure_holds_back_later_writes_to_same_key() {
    let rig = Rig::new(true, None);
    rig.set_online(false).await;
    rig.router.put("order:o1", &json!({"status": "open"})).await.unwrap();
    rig.router.put("order:o1", &json!({"status": "paid"})).await.unwrap();

    rig.set_online(true).await;
    rig.durable.break_key("order:o1");
    let result = rig.engine.run_once().await.result().unwrap();
    assert_eq!(result, SyncResult { processed: 0, failed: 1, skipped: 1 });

    rig.durable.heal("order:o1");
    rig.engine.run_once().await;
    assert_eq!(rig.durable.get("order:o1").await.unwrap(), Some(json!({"status": "paid"})));
    assert_eq!(
        rig.durable.writes_for("order:o1"),
        vec![Some(json!({"status": "open"})), Some(json!({"status": "paid"}))]
    );
}

#[tokio::test]
async fn replaying_a_synced_create_does_not_duplicate_it() {
    let rig = Rig::new(true, None);
    rig.set_online(false).await;
    let (key, receipt) = rig.router.create("customer", &json!({"name": "Ana"})).await.unwrap();

    rig.set_online(true).await;
    rig.engine.run_once().await;

    let op = rig.queue.get(receipt.operation_id().unwrap()).unwrap();
    assert_eq!(op.status, OperationStatus::Synced);

    // Replay the same mutation again, as a crash between apply and mark would
    rig.router.apply_durable(&op).await.unwrap();

    let customers = rig.durable.list("customer:").await.unwrap();
    assert_eq!(customers.len(), 1);
    assert_eq!(customers[0].key, key.storage_key());
    assert_eq!(rig.durable.writes_for(&key.storage_key()).len(), 1);
}

#[tokio::test]
async fn concurrent_runs_collapse_to_one_drain() {
    let rig = Rig::new(true, None);
    rig.set_online(false).await;
    for i in 0..3 {
        rig.router.put(&format!("supplier:s{}", i), &json!({"i": i})).await.unwrap();
    }
    rig.set_online(true).await;
    rig.durable.set_latency(Duration::from_millis(30));

    let (a, b) = tokio::join!(rig.engine.run_once(), rig.engine.run_once());

    let outcomes = [a, b];
    let rejected = outcomes.iter().filter(|o| **o == RunOutcome::AlreadySyncing).count();
    let drained: usize = outcomes.iter().filter_map(|o| o.result()).map(|r| r.processed).sum();
    assert_eq!(rejected, 1);
    assert_eq!(drained, 3);
    assert_eq!(rig.durable.writes().len(), 3);
}

#[tokio::test]
async fn stats_always_add_up() {
    let rig = Rig::new(true, Some(1));
    rig.set_online(false).await;
    for i in 0..6 {
        rig.router.put(&format!("product:p{}", i), &json!(i)).await.unwrap();
    }
    rig.set_online(true).await;
    rig.durable.reject("product:p1");
    rig.durable.break_key("product:p3");

    let check = |rig: &Rig| {
        let s = rig.engine.stats();
        assert_eq!(s.total, s.pending + s.synced + s.errors);
    };
    check(&rig);
    rig.engine.run_once().await;
    check(&rig);

    let stats = rig.engine.stats();
    assert_eq!(stats.synced, 4);
    // One rejected, one out of retries (ceiling of 1)
    assert_eq!(stats.errors, 2);

    rig.engine.clear_all();
    check(&rig);
    assert_eq!(rig.engine.stats().total, 0);
}

#[tokio::test]
async fn no_fallback_means_unavailable() {
    let rig = Rig::new(false, None);
    rig.set_online(false).await;

    let err = rig.router.put("product:p1", &json!(1)).await.unwrap_err();
    assert!(matches!(err, StorageError::Unavailable(_)));
    assert!(rig.queue.is_empty());
}

// =============================================================================
// Runtime
// =============================================================================

fn runtime_config(journal: Option<String>) -> OfflineSyncConfig {
    OfflineSyncConfig {
        probe_timeout_ms: 250,
        health_ttl_ms: 60_000,
        call_timeout_ms: 500,
        sync_interval_secs: 3600,
        journal_path: journal,
        ..Default::default()
    }
}

#[tokio::test]
async fn runtime_syncs_when_connectivity_returns() {
    let durable = Arc::new(ChaosStore::new());
    durable.set_online(false);
    let sync = OfflineSync::start_with(
        runtime_config(None),
        Some(durable.clone() as Arc<dyn KvStore>),
        Arc::new(FixedSession(None)),
    )
    .await
    .unwrap();
    assert_eq!(sync.probe().last_known().unwrap().state, HealthState::FallbackMemory);

    let receipt = sync.storage().put("product:p1", &json!({"stock": 2})).await.unwrap();
    assert!(receipt.is_degraded());

    durable.set_online(true);
    sync.check_health().await;
    wait_until("queued write synced", || sync.stats().synced == 1).await;
    assert_eq!(durable.get("product:p1").await.unwrap(), Some(json!({"stock": 2})));

    sync.shutdown().await;
}

#[tokio::test]
async fn runtime_journal_survives_restart() {
    let dir = tempdir().unwrap();
    let journal = dir.path().join("queue.db").to_string_lossy().to_string();
    let durable = Arc::new(ChaosStore::new());

    {
        durable.set_online(false);
        let sync = OfflineSync::start_with(
            runtime_config(Some(journal.clone())),
            Some(durable.clone() as Arc<dyn KvStore>),
            Arc::new(FixedSession(None)),
        )
        .await
        .unwrap();
        sync.storage().put("product:p1", &json!({"stock": 1})).await.unwrap();
        sync.storage().put("product:p2", &json!({"stock": 2})).await.unwrap();
        assert_eq!(sync.stats().pending, 2);
        sync.shutdown().await;
    }

    durable.set_online(true);
    let sync = OfflineSync::start_with(
        runtime_config(Some(journal)),
        Some(durable.clone() as Arc<dyn KvStore>),
        Arc::new(FixedSession(None)),
    )
    .await
    .unwrap();

    wait_until("recovered writes synced", || sync.stats().synced == 2).await;
    assert_eq!(durable.get("product:p2").await.unwrap(), Some(json!({"stock": 2})));
    sync.shutdown().await;
}

#[tokio::test]
async fn runtime_boot_gate_reports_state() {
    let durable = Arc::new(ChaosStore::new());
    let sync = OfflineSync::start_with(
        runtime_config(None),
        Some(durable.clone() as Arc<dyn KvStore>),
        Arc::new(FixedSession(Some("tok".into()))),
    )
    .await
    .unwrap();

    let status = sync.evaluate_boot().await;
    assert!(status.storage_available);
    assert!(!status.setup_complete);
    assert!(!status.logged_in);

    let receipt = sync.storage().put("system:setup", &json!({"complete": true})).await.unwrap();
    assert_eq!(receipt, WriteReceipt::Committed);
    sync.storage().put("session:tok", &json!({"user": "cashier-1"})).await.unwrap();

    let status = sync.evaluate_boot().await;
    assert!(status.setup_complete);
    assert!(status.logged_in);
    assert!(!status.degraded);

    sync.shutdown().await;
}

#[tokio::test]
async fn runtime_without_durable_store_runs_on_fallback() {
    let sync = OfflineSync::start(runtime_config(None), Arc::new(FixedSession(None)))
        .await
        .unwrap();
    assert_eq!(sync.check_health().await.state, HealthState::FallbackMemory);

    let receipt = sync.storage().put("product:p1", &json!(1)).await.unwrap();
    assert!(receipt.is_degraded());
    assert_eq!(sync.storage().get("product:p1").await.unwrap().value, Some(json!(1)));

    sync.shutdown().await;
}

#[tokio::test]
async fn runtime_interval_change_takes_effect() {
    let durable = Arc::new(ChaosStore::new());
    durable.set_online(false);
    let config = OfflineSyncConfig {
        health_ttl_ms: 0,
        ..runtime_config(None)
    };
    let sync = OfflineSync::start_with(
        config,
        Some(durable.clone() as Arc<dyn KvStore>),
        Arc::new(FixedSession(None)),
    )
    .await
    .unwrap();

    sync.storage().put("product:p1", &json!({"stock": 3})).await.unwrap();
    durable.set_online(true);

    // Nothing probes on its own; only a scheduled tick can notice the store
    // is back. Sub-second intervals are clamped to one second.
    sync.set_sync_interval(Duration::from_millis(10));
    wait_until("scheduled tick synced the write", || sync.stats().synced == 1).await;
    assert_eq!(durable.get("product:p1").await.unwrap(), Some(json!({"stock": 3})));

    sync.shutdown().await;
}
