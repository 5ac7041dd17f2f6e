//! Cross-instance events replayed into the local registry: own echoes are
//! dropped, and events without scope keys resolve them from the change log.

use std::sync::Arc;

use serde_json::json;
use tower::ServiceExt;

use axum::http::Request;
use http_body_util::BodyExt;
use syncular_config::SyncConfig;
use syncular_daemon::auth::StaticTokenAuthenticator;
use syncular_daemon::{routes, state};
use syncular_schemas::{
    CommitBroadcast, InstanceEvent, PartitionId, Principal, ServerFrame,
};
use syncular_scope::{HandlerRegistry, PartitionedScopeKey, PrincipalScopeHandler, ScopeKey};
use syncular_testkit::{principal, MemStorage};

fn test_state() -> Arc<state::AppState> {
    let storage = Arc::new(MemStorage::new());
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(PrincipalScopeHandler::new("tasks")));
    let authenticator = StaticTokenAuthenticator::new()
        .with_token("user-token", principal("actor-1", &["user:u1"]))
        .with_token("admin-token", Principal::admin("ops"));
    let (st, _task) = state::build_state_with_noop_broadcast(
        SyncConfig {
            instance_id: "alpha".to_string(),
            ..SyncConfig::default()
        },
        storage,
        handlers,
        Arc::new(authenticator),
    );
    st
}

fn pkey(prefix: &str, value: &str) -> PartitionedScopeKey {
    PartitionedScopeKey::new(&PartitionId::default(), &ScopeKey::new(prefix, value))
}

#[tokio::test]
async fn remote_commit_event_wakes_subscribed_connections() {
    let st = test_state();
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let _handle = st
        .registry
        .register(&PartitionId::default(), "c1", tx, vec![pkey("user", "u1")])
        .await
        .unwrap();

    routes::apply_instance_event(
        &st,
        InstanceEvent::Commit(CommitBroadcast {
            commit_seq: 7,
            partition_id: PartitionId::default(),
            scope_keys: Some(vec!["user:u1".to_string()]),
            source_instance_id: "beta".to_string(),
        }),
    )
    .await;

    match rx.try_recv().unwrap() {
        ServerFrame::Sync(wake) => assert_eq!(wake.cursor, 7),
        other => panic!("expected sync wake, got {other:?}"),
    }
}

#[tokio::test]
async fn own_echo_is_ignored() {
    let st = test_state();
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let _handle = st
        .registry
        .register(&PartitionId::default(), "c1", tx, vec![pkey("user", "u1")])
        .await
        .unwrap();

    routes::apply_instance_event(
        &st,
        InstanceEvent::Commit(CommitBroadcast {
            commit_seq: 7,
            partition_id: PartitionId::default(),
            scope_keys: Some(vec!["user:u1".to_string()]),
            source_instance_id: "alpha".to_string(),
        }),
    )
    .await;

    assert!(rx.try_recv().is_err(), "self-originated event must be dropped");
}

#[tokio::test]
async fn missing_scope_keys_resolve_from_the_change_log() {
    let st = test_state();

    // Land a real commit so the change log knows its scope keys.
    let push = json!({
        "clientId": "writer",
        "push": {
            "clientCommitId": "x1",
            "schemaVersion": 1,
            "operations": [
                { "table": "tasks", "row_id": "t1", "op": "upsert",
                  "payload": { "id": "t1", "user_id": "u1" } }
            ]
        }
    });
    let resp = routes::build_router(Arc::clone(&st))
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/sync")
                .header("Authorization", "Bearer user-token")
                .header("Content-Type", "application/json")
                .body(axum::body::Body::from(push.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let seq = body["push"]["commitSeq"].as_i64().unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    let _handle = st
        .registry
        .register(&PartitionId::default(), "reader", tx, vec![pkey("user", "u1")])
        .await
        .unwrap();

    routes::apply_instance_event(
        &st,
        InstanceEvent::Commit(CommitBroadcast {
            commit_seq: seq,
            partition_id: PartitionId::default(),
            scope_keys: None,
            source_instance_id: "beta".to_string(),
        }),
    )
    .await;

    match rx.try_recv().unwrap() {
        ServerFrame::Sync(wake) => assert_eq!(wake.cursor, seq),
        other => panic!("expected sync wake, got {other:?}"),
    }
}
