//! Registry fan-out: per-connection dedupe, sender exclusion, the inline-
//! vs-notify size policy, and partition isolation.

use serde_json::json;
use tokio::sync::mpsc;

use syncular_realtime::{ConnectionRegistry, NotifyOptions, RegistryLimits};
use syncular_schemas::{ChangeDelta, ChangeOp, PartitionId, ScopeMap, ServerFrame};
use syncular_scope::{PartitionedScopeKey, ScopeKey};

fn pkey(partition: &str, prefix: &str, value: &str) -> PartitionedScopeKey {
    PartitionedScopeKey::new(&PartitionId::new(partition), &ScopeKey::new(prefix, value))
}

fn change(row: &str, payload_len: usize) -> ChangeDelta {
    ChangeDelta {
        table: "tasks".into(),
        row_id: row.into(),
        op: ChangeOp::Upsert,
        row_json: json!({ "id": row, "pad": "x".repeat(payload_len) }),
        row_version: 1,
        scopes: ScopeMap::new(),
    }
}

async fn connect(
    registry: &ConnectionRegistry,
    client: &str,
    keys: Vec<PartitionedScopeKey>,
) -> (
    syncular_realtime::ConnectionHandle,
    mpsc::Receiver<ServerFrame>,
) {
    let (tx, rx) = mpsc::channel(64);
    let handle = registry
        .register(&PartitionId::default(), client, tx, keys)
        .await
        .expect("register");
    (handle, rx)
}

#[tokio::test]
async fn one_frame_per_connection_even_with_many_matching_keys() {
    let registry = ConnectionRegistry::new(RegistryLimits::default());
    let keys = vec![
        pkey("default", "user", "u1"),
        pkey("default", "team", "t1"),
    ];
    let (_h, mut rx) = connect(&registry, "c1", keys.clone()).await;

    let delivered = registry
        .notify_scope_keys(&keys, 7, NotifyOptions::default())
        .await;
    assert_eq!(delivered, 1, "dedupe across matched keys");

    match rx.try_recv().unwrap() {
        ServerFrame::Sync(wake) => assert_eq!(wake.cursor, 7),
        other => panic!("expected sync frame, got {other:?}"),
    }
    assert!(rx.try_recv().is_err(), "exactly one frame");
}

#[tokio::test]
async fn pushing_client_is_excluded_from_its_own_wake() {
    let registry = ConnectionRegistry::new(RegistryLimits::default());
    let keys = vec![pkey("default", "user", "u1")];
    let (_h1, mut rx1) = connect(&registry, "c1", keys.clone()).await;
    let (_h2, mut rx2) = connect(&registry, "c2", keys.clone()).await;

    registry
        .notify_scope_keys(
            &keys,
            7,
            NotifyOptions {
                exclude_client_ids: &["c1".to_string()],
                ..Default::default()
            },
        )
        .await;

    assert!(rx1.try_recv().is_err(), "sender must not be woken");
    match rx2.try_recv().unwrap() {
        ServerFrame::Sync(wake) => assert_eq!(wake.cursor, 7),
        other => panic!("expected sync frame, got {other:?}"),
    }
}

#[tokio::test]
async fn small_changes_inline_large_changes_fall_back_to_notify() {
    let registry = ConnectionRegistry::new(RegistryLimits {
        inline_changes_max_bytes: 64 * 1024,
        ..RegistryLimits::default()
    });
    let keys = vec![pkey("default", "user", "u1")];
    let (_h, mut rx) = connect(&registry, "c1", keys.clone()).await;

    let small = vec![change("r1", 60_000)];
    registry
        .notify_scope_keys(
            &keys,
            1,
            NotifyOptions {
                changes: Some(&small),
                actor_id: Some("actor-1".into()),
                ..Default::default()
            },
        )
        .await;
    match rx.try_recv().unwrap() {
        ServerFrame::Sync(wake) => {
            assert!(wake.changes.is_some(), "63 KB payload rides inline");
            assert_eq!(wake.actor_id.as_deref(), Some("actor-1"));
        }
        other => panic!("unexpected frame {other:?}"),
    }

    let large = vec![change("r2", 80_000)];
    registry
        .notify_scope_keys(
            &keys,
            2,
            NotifyOptions {
                changes: Some(&large),
                actor_id: Some("actor-1".into()),
                ..Default::default()
            },
        )
        .await;
    match rx.try_recv().unwrap() {
        ServerFrame::Sync(wake) => {
            assert!(wake.changes.is_none(), "oversized payload notifies only");
            assert!(wake.actor_id.is_none());
            assert_eq!(wake.cursor, 2);
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn scope_keys_are_partition_isolated() {
    let registry = ConnectionRegistry::new(RegistryLimits::default());

    let (tx_a, mut rx_a) = mpsc::channel(8);
    let _ha = registry
        .register(
            &PartitionId::new("tenant-a"),
            "c1",
            tx_a,
            vec![pkey("tenant-a", "user", "u1")],
        )
        .await
        .unwrap();
    let (tx_b, mut rx_b) = mpsc::channel(8);
    let _hb = registry
        .register(
            &PartitionId::new("tenant-b"),
            "c1",
            tx_b,
            vec![pkey("tenant-b", "user", "u1")],
        )
        .await
        .unwrap();

    registry
        .notify_scope_keys(&[pkey("tenant-a", "user", "u1")], 3, NotifyOptions::default())
        .await;
    assert!(rx_a.try_recv().is_ok());
    assert!(rx_b.try_recv().is_err(), "other partition stays quiet");

    registry.notify_all_clients(&PartitionId::new("tenant-b"), 9).await;
    assert!(rx_b.try_recv().is_ok());
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn updated_scope_set_replaces_the_old_one() {
    let registry = ConnectionRegistry::new(RegistryLimits::default());
    let old = vec![pkey("default", "user", "u1")];
    let (_h, mut rx) = connect(&registry, "c1", old.clone()).await;

    registry
        .update_client_scope_keys(
            &PartitionId::default(),
            "c1",
            vec![pkey("default", "team", "t9")],
        )
        .await;

    registry.notify_scope_keys(&old, 5, NotifyOptions::default()).await;
    assert!(rx.try_recv().is_err(), "old key no longer subscribed");

    registry
        .notify_scope_keys(&[pkey("default", "team", "t9")], 6, NotifyOptions::default())
        .await;
    assert!(rx.try_recv().is_ok());
}
