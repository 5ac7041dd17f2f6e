//! Snapshot chunk serving: gzip headers, ETag/304, partition fencing, and
//! the WebSocket connection-cap refusal.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use syncular_config::SyncConfig;
use syncular_daemon::auth::StaticTokenAuthenticator;
use syncular_daemon::{routes, state};
use syncular_schemas::{PartitionId, Principal};
use syncular_scope::{HandlerRegistry, PrincipalScopeHandler};
use syncular_testkit::{principal, MemStorage};

fn test_state(cfg: SyncConfig) -> Arc<state::AppState> {
    let storage = Arc::new(MemStorage::new());
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(PrincipalScopeHandler::new("tasks")));
    let authenticator = StaticTokenAuthenticator::new()
        .with_token("user-token", principal("actor-1", &["user:u1"]))
        .with_token("admin-token", Principal::admin("ops"));
    let (st, _task) = state::build_state_with_noop_broadcast(
        cfg,
        storage,
        handlers,
        Arc::new(authenticator),
    );
    st
}

async fn call(
    st: &Arc<state::AppState>,
    request: Request<axum::body::Body>,
) -> axum::response::Response {
    routes::build_router(Arc::clone(st))
        .oneshot(request)
        .await
        .expect("oneshot failed")
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Push a row and bootstrap so a chunk lands in storage; returns
/// `(chunk_id, sha256)`.
async fn seed_chunk(st: &Arc<state::AppState>) -> (String, String) {
    let push = json!({
        "clientId": "c1",
        "push": {
            "clientCommitId": "x1",
            "schemaVersion": 1,
            "operations": [
                { "table": "tasks", "row_id": "t1", "op": "upsert",
                  "payload": { "id": "t1", "user_id": "u1" } }
            ]
        },
        "pull": {
            "subscriptions": [
                { "id": "s1", "table": "tasks",
                  "scopes": { "user_id": "u1" }, "cursor": -1 }
            ]
        }
    });
    let resp = call(
        st,
        Request::builder()
            .method("POST")
            .uri("/sync")
            .header("Authorization", "Bearer user-token")
            .header("Content-Type", "application/json")
            .body(axum::body::Body::from(push.to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    let snapshot = &body["pull"]["subscriptions"][0]["snapshots"][0];
    (
        snapshot["chunkId"].as_str().unwrap().to_string(),
        snapshot["sha256"].as_str().unwrap().to_string(),
    )
}

fn chunk_request(chunk_id: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(format!("/sync/snapshot-chunks/{chunk_id}"))
        .header("Authorization", "Bearer user-token")
        .body(axum::body::Body::empty())
        .unwrap()
}

#[tokio::test]
async fn chunk_body_is_served_with_integrity_headers() {
    let st = test_state(SyncConfig::default());
    let (chunk_id, sha256) = seed_chunk(&st).await;

    let resp = call(&st, chunk_request(&chunk_id)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["Content-Encoding"], "gzip");
    assert_eq!(resp.headers()["ETag"], format!("\"sha256:{sha256}\""));
    assert_eq!(resp.headers()["X-Sync-Chunk-Id"], chunk_id.as_str());
    assert_eq!(resp.headers()["X-Sync-Sha256"], sha256.as_str());
    assert_eq!(resp.headers()["X-Sync-Compression"], "gzip");

    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let rows = syncular_core::decode_chunk_rows(&bytes).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row_id, "t1");
}

#[tokio::test]
async fn if_none_match_returns_304() {
    let st = test_state(SyncConfig::default());
    let (chunk_id, sha256) = seed_chunk(&st).await;

    let req = Request::builder()
        .method("GET")
        .uri(format!("/sync/snapshot-chunks/{chunk_id}"))
        .header("Authorization", "Bearer user-token")
        .header("If-None-Match", format!("\"sha256:{sha256}\""))
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = call(&st, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn unknown_chunk_is_404() {
    let st = test_state(SyncConfig::default());
    let resp = call(&st, chunk_request("nope")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(resp).await["error"], "NOT_FOUND");
}

#[tokio::test]
async fn partition_mismatch_is_403() {
    let st = test_state(SyncConfig::default());
    let (chunk_id, _) = seed_chunk(&st).await;

    let req = Request::builder()
        .method("GET")
        .uri(format!("/sync/snapshot-chunks/{chunk_id}"))
        .header("Authorization", "Bearer user-token")
        .header(state::PARTITION_HEADER, "tenant-other")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = call(&st, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

// ---------------------------------------------------------------------------
// WS connection cap (pre-upgrade refusal)
// ---------------------------------------------------------------------------

fn upgrade_request(client_id: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(format!("/sync/realtime?clientId={client_id}"))
        .header("Host", "localhost")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
        .header("Sec-WebSocket-Version", "13")
        .body(axum::body::Body::empty())
        .unwrap()
}

#[tokio::test]
async fn per_client_ws_cap_rejects_with_429_before_upgrade() {
    let st = test_state(SyncConfig {
        max_connections_per_client: 1,
        ..SyncConfig::default()
    });

    // Occupy the single slot directly in the registry.
    let (tx, _rx) = tokio::sync::mpsc::channel(8);
    let _handle = st
        .registry
        .register(&PartitionId::default(), "c1", tx, vec![])
        .await
        .unwrap();

    let resp = call(&st, upgrade_request("c1")).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        json_body(resp).await["error"],
        "WEBSOCKET_CONNECTION_LIMIT_CLIENT"
    );

    // A different client still upgrades (101) against the same state.
    let resp = call(&st, upgrade_request("c2")).await;
    assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
}
