//! In-process scenario tests for the combined /sync endpoint.
//!
//! These tests spin up the Axum router **without** binding a TCP socket:
//! each test composes `routes::build_router` and drives it via
//! `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use syncular_config::{RateLimitConfig, SyncConfig};
use syncular_daemon::auth::StaticTokenAuthenticator;
use syncular_daemon::{routes, state};
use syncular_schemas::Principal;
use syncular_scope::{HandlerRegistry, PrincipalScopeHandler};
use syncular_testkit::{principal, MemStorage};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

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
) -> (StatusCode, Value) {
    let resp = routes::build_router(Arc::clone(st))
        .oneshot(request)
        .await
        .expect("oneshot failed");
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("body is not valid JSON")
    };
    (status, body)
}

fn sync_request(token: &str, body: Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri("/sync")
        .header("Authorization", format!("Bearer {token}"))
        .header("Content-Type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

fn push_body(client: &str, commit_id: &str, row: &str) -> Value {
    json!({
        "clientId": client,
        "push": {
            "clientCommitId": commit_id,
            "schemaVersion": 1,
            "operations": [
                { "table": "tasks", "row_id": row, "op": "upsert",
                  "payload": { "id": row, "title": "A", "user_id": "u1" } }
            ]
        }
    })
}

// ---------------------------------------------------------------------------
// Health + auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let st = test_state(SyncConfig::default());
    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, body) = call(&st, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["service"], "syncular-daemon");
}

#[tokio::test]
async fn sync_without_bearer_is_401() {
    let st = test_state(SyncConfig::default());
    let req = Request::builder()
        .method("POST")
        .uri("/sync")
        .header("Content-Type", "application/json")
        .body(axum::body::Body::from(
            json!({ "clientId": "c1" }).to_string(),
        ))
        .unwrap();
    let (status, body) = call(&st, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "UNAUTHENTICATED");
}

#[tokio::test]
async fn sync_with_unknown_token_is_401_invalid_token() {
    let st = test_state(SyncConfig::default());
    let (status, body) = call(&st, sync_request("bogus", json!({ "clientId": "c1" }))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "INVALID_TOKEN");
}

// ---------------------------------------------------------------------------
// Combined push/pull
// ---------------------------------------------------------------------------

#[tokio::test]
async fn push_replay_returns_same_commit_seq_over_http() {
    let st = test_state(SyncConfig::default());

    let (status, first) = call(&st, sync_request("user-token", push_body("c1", "x1", "t1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["ok"], true);
    assert_eq!(first["push"]["status"], "applied");
    let seq = first["push"]["commitSeq"].as_i64().unwrap();

    let (status, second) =
        call(&st, sync_request("user-token", push_body("c1", "x1", "t1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["push"]["commitSeq"].as_i64().unwrap(), seq);
}

#[tokio::test]
async fn combined_push_pull_sees_own_commit() {
    let st = test_state(SyncConfig::default());
    let body = json!({
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
                  "scopes": { "user_id": "u1" }, "cursor": 0 }
            ]
        }
    });
    let (status, resp) = call(&st, sync_request("user-token", body)).await;
    assert_eq!(status, StatusCode::OK);

    let sub = &resp["pull"]["subscriptions"][0];
    assert_eq!(sub["status"], "active");
    assert_eq!(sub["commits"].as_array().unwrap().len(), 1);
    assert_eq!(sub["commits"][0]["commitSeq"], resp["push"]["commitSeq"]);
}

#[tokio::test]
async fn empty_client_id_is_invalid_request() {
    let st = test_state(SyncConfig::default());
    let (status, body) = call(&st, sync_request("user-token", json!({ "clientId": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_REQUEST");
}

#[tokio::test]
async fn too_many_operations_is_400() {
    let st = test_state(SyncConfig {
        max_operations_per_push: 1,
        ..SyncConfig::default()
    });
    let body = json!({
        "clientId": "c1",
        "push": {
            "clientCommitId": "x1",
            "schemaVersion": 1,
            "operations": [
                { "table": "tasks", "row_id": "a", "op": "upsert", "payload": { "id": "a" } },
                { "table": "tasks", "row_id": "b", "op": "upsert", "payload": { "id": "b" } }
            ]
        }
    });
    let (status, resp) = call(&st, sync_request("user-token", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(resp["error"], "TOO_MANY_OPERATIONS");
}

#[tokio::test]
async fn rate_limit_returns_429_with_headers() {
    let st = test_state(SyncConfig {
        rate_limit: RateLimitConfig {
            window_secs: 60,
            sync_max_requests: 1,
            console_max_requests: 10,
        },
        ..SyncConfig::default()
    });

    let (status, _) = call(&st, sync_request("user-token", json!({ "clientId": "c1" }))).await;
    assert_eq!(status, StatusCode::OK);

    let resp = routes::build_router(Arc::clone(&st))
        .oneshot(sync_request("user-token", json!({ "clientId": "c1" })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key("Retry-After"));
    assert_eq!(resp.headers()["X-RateLimit-Limit"], "1");
    assert_eq!(resp.headers()["X-RateLimit-Remaining"], "0");
    assert!(resp.headers().contains_key("X-RateLimit-Reset"));

    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "RATE_LIMITED");
}

#[tokio::test]
async fn request_events_are_recorded_for_pushes() {
    let st = test_state(SyncConfig::default());
    call(&st, sync_request("user-token", push_body("c1", "x1", "t1"))).await;

    // The recorder writes on a detached task.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let page = st
        .storage
        .list_request_events(&Default::default(), 0, 10)
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    let event = &page.items[0];
    assert_eq!(event.client_id, "c1");
    assert_eq!(event.commit_seq, Some(1));
    assert_eq!(
        event.response_status,
        syncular_schemas::ResponseStatus::Success
    );
}
