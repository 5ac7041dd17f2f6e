//! Console surface: admin gating, stats, maintenance operations with audit
//! trails, and the API-key lifecycle.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use syncular_config::SyncConfig;
use syncular_daemon::auth::{ApiKeyAuthenticator, StaticTokenAuthenticator};
use syncular_daemon::{routes, state};
use syncular_db::Storage;
use syncular_schemas::Principal;
use syncular_scope::{HandlerRegistry, PrincipalScopeHandler};
use syncular_testkit::{principal, MemStorage};

fn test_state() -> Arc<state::AppState> {
    let storage = Arc::new(MemStorage::new());
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(PrincipalScopeHandler::new("tasks")));
    let authenticator = StaticTokenAuthenticator::new()
        .with_token("user-token", principal("actor-1", &["user:u1"]))
        .with_token("admin-token", Principal::admin("ops"));
    let (st, _task) = state::build_state_with_noop_broadcast(
        SyncConfig::default(),
        storage,
        handlers,
        Arc::new(authenticator),
    );
    st
}

async fn call(
    st: &Arc<state::AppState>,
    method: &str,
    uri: &str,
    token: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {token}"));
    let request = match body {
        Some(v) => builder
            .header("Content-Type", "application/json")
            .body(axum::body::Body::from(v.to_string()))
            .unwrap(),
        None => {
            builder = builder.header("Content-Type", "application/json");
            builder.body(axum::body::Body::empty()).unwrap()
        }
    };
    let resp = routes::build_router(Arc::clone(st))
        .oneshot(request)
        .await
        .expect("oneshot failed");
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn seed_commit(st: &Arc<state::AppState>) {
    let push = json!({
        "clientId": "c1",
        "push": {
            "clientCommitId": "x1",
            "schemaVersion": 1,
            "operations": [
                { "table": "tasks", "row_id": "t1", "op": "upsert",
                  "payload": { "id": "t1", "user_id": "u1" } }
            ]
        }
    });
    let (status, _) = call(st, "POST", "/sync", "user-token", Some(push)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn console_requires_an_admin_key() {
    let st = test_state();
    let (status, body) = call(&st, "GET", "/console/stats", "user-token", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "FORBIDDEN");

    let (status, _) = call(&st, "GET", "/console/stats", "admin-token", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn stats_reflect_commits_and_clients() {
    let st = test_state();
    seed_commit(&st).await;

    let (status, body) = call(&st, "GET", "/console/stats", "admin-token", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["commitCount"], 1);
    assert_eq!(body["changeCount"], 1);
    assert_eq!(body["clientCount"], 1);
    assert_eq!(body["maxCommitSeq"], 1);
}

#[tokio::test]
async fn commit_detail_and_timeline_are_served() {
    let st = test_state();
    seed_commit(&st).await;

    let (status, commit) = call(&st, "GET", "/console/commits/1", "admin-token", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(commit["commit"]["clientId"], "c1");
    assert_eq!(commit["changes"][0]["rowId"], "t1");

    let (status, _) = call(&st, "GET", "/console/commits/999", "admin-token", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, timeline) = call(&st, "GET", "/console/timeline", "admin-token", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(timeline["total"].as_i64().unwrap() >= 1);
}

#[tokio::test]
async fn prune_and_notify_write_operation_audit_rows() {
    let st = test_state();
    seed_commit(&st).await;

    let (status, _) = call(
        &st,
        "POST",
        "/console/prune/preview",
        "admin-token",
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&st, "POST", "/console/prune", "admin-token", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, notify) = call(
        &st,
        "POST",
        "/console/notify-data-change",
        "admin-token",
        Some(json!({ "tables": ["tasks"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(notify["commitSeq"], 2, "synthetic commit advances the seq");

    let (status, ops) = call(&st, "GET", "/console/operations", "admin-token", None).await;
    assert_eq!(status, StatusCode::OK);
    let types: Vec<&str> = ops["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["operationType"].as_str().unwrap())
        .collect();
    assert!(types.contains(&"prune"));
    assert!(types.contains(&"notify_data_change"));
}

#[tokio::test]
async fn evict_client_removes_cursor_and_audits() {
    let st = test_state();
    seed_commit(&st).await;

    let (status, body) = call(&st, "DELETE", "/console/clients/c1", "admin-token", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let cursor = st
        .storage
        .get_cursor(&syncular_schemas::PartitionId::default(), "c1")
        .await
        .unwrap();
    assert!(cursor.is_none(), "cursor row deleted");

    let (_, ops) = call(&st, "GET", "/console/operations", "admin-token", None).await;
    assert_eq!(ops["items"][0]["operationType"], "evict_client");
}

#[tokio::test]
async fn api_key_lifecycle_create_use_rotate_revoke() {
    // Use the API-key authenticator end to end so minted secrets actually
    // authenticate.
    let storage = Arc::new(MemStorage::new());
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(PrincipalScopeHandler::new("tasks")));
    let dyn_storage: Arc<dyn Storage> = storage.clone();
    let (st, _task) = state::build_state_with_noop_broadcast(
        SyncConfig::default(),
        dyn_storage.clone(),
        handlers,
        Arc::new(ApiKeyAuthenticator::new(dyn_storage)),
    );

    // Bootstrap an admin key row directly (the operator's seed key).
    let material = syncular_daemon::auth::generate_key();
    storage
        .insert_api_key(syncular_schemas::ApiKey {
            key_id: uuid::Uuid::new_v4(),
            key_hash: material.key_hash.clone(),
            key_prefix: material.key_prefix.clone(),
            name: "seed-admin".into(),
            key_type: syncular_schemas::ApiKeyType::Admin,
            scope_keys: vec![],
            actor_id: Some("ops".into()),
            created_at: chrono::Utc::now(),
            expires_at: None,
            last_used_at: None,
            revoked_at: None,
        })
        .await
        .unwrap();
    let admin_secret = material.secret;

    // Create a proxy key through the console.
    let (status, created) = call(
        &st,
        "POST",
        "/console/api-keys",
        &admin_secret,
        Some(json!({
            "name": "mobile-client",
            "keyType": "proxy",
            "scopeKeys": ["user:u1"],
            "actorId": "actor-1"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let proxy_secret = created["secret"].as_str().unwrap().to_string();
    let key_id = created["apiKey"]["keyId"].as_str().unwrap().to_string();
    assert!(proxy_secret.starts_with("syk_"));

    // The minted key pushes through /sync.
    let push = json!({
        "clientId": "c1",
        "push": {
            "clientCommitId": "x1",
            "schemaVersion": 1,
            "operations": [
                { "table": "tasks", "row_id": "t1", "op": "upsert",
                  "payload": { "id": "t1", "user_id": "u1" } }
            ]
        }
    });
    let (status, resp) = call(&st, "POST", "/sync", &proxy_secret, Some(push)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["push"]["status"], "applied");

    // But not the console.
    let (status, _) = call(&st, "GET", "/console/stats", &proxy_secret, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Rotate retires the old secret and mints a working replacement.
    let (status, rotated) = call(
        &st,
        "POST",
        &format!("/console/api-keys/{key_id}/rotate"),
        &admin_secret,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let new_secret = rotated["secret"].as_str().unwrap().to_string();

    let (status, _) = call(&st, "POST", "/sync", &proxy_secret, Some(json!({ "clientId": "c1" }))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED, "old secret is dead");
    let (status, _) = call(&st, "POST", "/sync", &new_secret, Some(json!({ "clientId": "c1" }))).await;
    assert_eq!(status, StatusCode::OK, "rotated secret works");

    // Bulk revoke by id kills the replacement too.
    let new_key_id = rotated["apiKey"]["keyId"].as_str().unwrap();
    let (status, revoked) = call(
        &st,
        "POST",
        "/console/api-keys/bulk-revoke",
        &admin_secret,
        Some(json!({ "keyIds": [new_key_id] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(revoked["revoked"], 1);

    let (status, _) = call(&st, "POST", "/sync", &new_secret, Some(json!({ "clientId": "c1" }))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
