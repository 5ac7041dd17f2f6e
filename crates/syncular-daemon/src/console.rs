//! Single-instance console: observability reads and control mutations.
//! Every mutation writes an operation audit event.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use syncular_core::notify_data_change;
use syncular_db::RequestEventFilter;
use syncular_schemas::{
    ApiKey, ApiKeyCreated, ApiKeyInfo, ApiKeyType, BulkRevokeRequest, BulkRevokeResult,
    ClientInfo, CompactRequest, CreateApiKeyRequest, ErrorCode, EventPruneResult, HandlerInfo,
    NotifyDataChangeRequest, OperationEvent, OperationType, Page, PartitionId, Principal,
    PruneRequest, SyncError,
};

use crate::auth::{generate_key, require_principal};
use crate::error::ApiResult;
use crate::rate_limit::RouteClass;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stats", get(stats))
        .route("/stats/timeseries", get(timeseries))
        .route("/stats/latency", get(latency))
        .route("/commits", get(commits))
        .route("/commits/:seq", get(commit_detail))
        .route("/clients", get(clients))
        .route("/clients/:id", delete(evict_client))
        .route("/handlers", get(handlers))
        .route("/timeline", get(timeline))
        .route("/operations", get(operations))
        .route("/events", get(events).delete(delete_events))
        .route("/events/prune", post(events_prune))
        .route("/events/:id", get(event_detail))
        .route("/events/:id/payload", get(event_payload))
        .route("/prune", post(prune))
        .route("/prune/preview", post(prune_preview))
        .route("/compact", post(compact))
        .route("/notify-data-change", post(notify_data_change_route))
        .route("/api-keys", get(api_keys).post(create_api_key))
        .route("/api-keys/bulk-revoke", post(bulk_revoke))
        .route("/api-keys/:id", get(api_key_detail).delete(delete_api_key))
        .route("/api-keys/:id/rotate", post(rotate_api_key))
        .route("/api-keys/:id/rotate/stage", post(stage_rotate_api_key))
}

// ---------------------------------------------------------------------------
// Auth + shared query shapes
// ---------------------------------------------------------------------------

/// Console access requires an admin key; reads and writes alike.
async fn console_principal(
    st: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<Principal, SyncError> {
    let principal = require_principal(&st.authenticator, headers).await?;
    if principal.key_type != ApiKeyType::Admin {
        return Err(SyncError::forbidden("console requires an admin key"));
    }
    let decision = st
        .rate_limiter
        .check(&principal.actor_id, RouteClass::Console);
    if !decision.allowed {
        return Err(SyncError::new(
            ErrorCode::RateLimited,
            "console rate limit exceeded",
        ));
    }
    Ok(principal)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageQuery {
    offset: Option<i64>,
    limit: Option<i64>,
    partition_id: Option<String>,
}

impl PageQuery {
    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 200)
    }

    fn partition(&self) -> Option<PartitionId> {
        self.partition_id.clone().map(PartitionId::new)
    }
}

async fn audit(
    st: &Arc<AppState>,
    operation_type: OperationType,
    principal: &Principal,
    partition: Option<PartitionId>,
    target_client_id: Option<String>,
    request_payload: Option<Value>,
    result_payload: Option<Value>,
) {
    let event = OperationEvent {
        operation_id: Uuid::new_v4(),
        operation_type,
        console_user_id: Some(principal.actor_id.clone()),
        partition_id: partition,
        target_client_id,
        request_payload,
        result_payload,
        created_at: Utc::now(),
    };
    if let Err(e) = st.storage.insert_operation_event(event).await {
        tracing::warn!(error = %e, "operation audit write failed");
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

async fn stats(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<syncular_schemas::SyncStats>> {
    console_principal(&st, &headers).await?;
    Ok(Json(st.storage.sync_stats(q.partition().as_ref()).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeseriesQuery {
    partition_id: Option<String>,
    hours: Option<i64>,
    bucket_secs: Option<i64>,
}

async fn timeseries(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<TimeseriesQuery>,
) -> ApiResult<Json<Vec<syncular_schemas::TimeseriesBucket>>> {
    console_principal(&st, &headers).await?;
    let since = Utc::now() - chrono::Duration::hours(q.hours.unwrap_or(24).clamp(1, 24 * 30));
    let bucket = q.bucket_secs.unwrap_or(3600).clamp(60, 24 * 3600);
    let partition = q.partition_id.map(PartitionId::new);
    Ok(Json(
        st.storage
            .timeseries(partition.as_ref(), since, bucket)
            .await?,
    ))
}

async fn latency(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<syncular_schemas::LatencyStats>> {
    console_principal(&st, &headers).await?;
    Ok(Json(
        st.storage
            .latency_percentiles(q.partition().as_ref())
            .await?,
    ))
}

// ---------------------------------------------------------------------------
// Commits / clients / handlers / timeline / operations
// ---------------------------------------------------------------------------

async fn commits(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<Page<syncular_schemas::Commit>>> {
    console_principal(&st, &headers).await?;
    Ok(Json(
        st.storage
            .list_commits(q.partition().as_ref(), q.offset(), q.limit())
            .await?,
    ))
}

async fn commit_detail(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(seq): Path<i64>,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<syncular_schemas::CommitWithChanges>> {
    console_principal(&st, &headers).await?;
    let commit = st
        .storage
        .get_commit(q.partition().as_ref(), seq)
        .await?
        .ok_or_else(|| SyncError::not_found(format!("no commit with seq {seq}")))?;
    Ok(Json(commit))
}

async fn clients(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<Page<ClientInfo>>> {
    console_principal(&st, &headers).await?;
    let page = st
        .storage
        .list_cursors(q.partition().as_ref(), q.offset(), q.limit())
        .await?;

    let mut items = Vec::with_capacity(page.items.len());
    for cursor in page.items {
        let connection_count = st
            .registry
            .client_connection_count(&cursor.partition_id, &cursor.client_id)
            .await;
        items.push(ClientInfo {
            partition_id: cursor.partition_id,
            client_id: cursor.client_id,
            actor_id: cursor.actor_id,
            cursor: cursor.cursor,
            effective_scopes: cursor.effective_scopes,
            updated_at: cursor.updated_at,
            connection_count: Some(connection_count as i64),
        });
    }
    Ok(Json(Page {
        items,
        total: page.total,
    }))
}

async fn evict_client(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<Value>> {
    let principal = console_principal(&st, &headers).await?;
    let partition = q.partition().unwrap_or_default();

    let deleted = st.storage.delete_client(&partition, &client_id).await?;
    let closed = st.registry.close_client(&partition, &client_id).await;

    audit(
        &st,
        OperationType::EvictClient,
        &principal,
        Some(partition),
        Some(client_id),
        None,
        Some(json!({ "cursorDeleted": deleted, "connectionsClosed": closed })),
    )
    .await;

    if !deleted && closed == 0 {
        return Err(SyncError::not_found("unknown client").into());
    }
    Ok(Json(json!({ "ok": true })))
}

async fn handlers(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<HandlerInfo>>> {
    console_principal(&st, &headers).await?;
    let out = st
        .handlers
        .tables()
        .map(|(table, h)| HandlerInfo {
            table: table.to_string(),
            description: h.description().map(str::to_string),
        })
        .collect();
    Ok(Json(out))
}

async fn timeline(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<Page<syncular_schemas::TimelineItem>>> {
    console_principal(&st, &headers).await?;
    Ok(Json(
        st.storage
            .timeline(q.partition().as_ref(), q.offset(), q.limit())
            .await?,
    ))
}

async fn operations(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<Page<OperationEvent>>> {
    console_principal(&st, &headers).await?;
    Ok(Json(
        st.storage
            .list_operation_events(q.offset(), q.limit())
            .await?,
    ))
}

// ---------------------------------------------------------------------------
// Request events
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    offset: Option<i64>,
    limit: Option<i64>,
    partition_id: Option<String>,
    event_type: Option<String>,
    client_id: Option<String>,
    actor_id: Option<String>,
    outcome: Option<String>,
}

async fn events(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<EventsQuery>,
) -> ApiResult<Json<Page<syncular_schemas::RequestEvent>>> {
    console_principal(&st, &headers).await?;

    let parse = |s: &Option<String>| -> Option<Value> {
        s.as_ref().map(|v| Value::String(v.clone()))
    };
    let filter = RequestEventFilter {
        partition_id: q.partition_id.clone().map(PartitionId::new),
        event_type: parse(&q.event_type)
            .and_then(|v| serde_json::from_value(v).ok()),
        client_id: q.client_id.clone(),
        actor_id: q.actor_id.clone(),
        outcome: parse(&q.outcome).and_then(|v| serde_json::from_value(v).ok()),
        since: None,
    };
    let offset = q.offset.unwrap_or(0).max(0);
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    Ok(Json(
        st.storage.list_request_events(&filter, offset, limit).await?,
    ))
}

async fn event_detail(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(event_id): Path<Uuid>,
) -> ApiResult<Json<syncular_schemas::RequestEvent>> {
    console_principal(&st, &headers).await?;
    let event = st
        .storage
        .get_request_event(event_id)
        .await?
        .ok_or_else(|| SyncError::not_found(format!("no event '{event_id}'")))?;
    Ok(Json(event))
}

async fn event_payload(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(event_id): Path<Uuid>,
) -> ApiResult<Json<syncular_schemas::PayloadSnapshot>> {
    console_principal(&st, &headers).await?;
    let event = st
        .storage
        .get_request_event(event_id)
        .await?
        .ok_or_else(|| SyncError::not_found(format!("no event '{event_id}'")))?;
    let payload_ref = event
        .payload_ref
        .ok_or_else(|| SyncError::not_found("event has no retained payload"))?;
    let snapshot = st
        .storage
        .get_payload_snapshot(&payload_ref)
        .await?
        .ok_or_else(|| SyncError::not_found("payload snapshot was pruned"))?;
    Ok(Json(snapshot))
}

async fn delete_events(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let principal = console_principal(&st, &headers).await?;
    let deleted = st.storage.prune_request_events(Utc::now(), 0).await?;
    audit(
        &st,
        OperationType::Prune,
        &principal,
        None,
        None,
        Some(json!({ "target": "request_events", "all": true })),
        Some(json!({ "deleted": deleted })),
    )
    .await;
    Ok(Json(json!({ "ok": true, "deleted": deleted })))
}

async fn events_prune(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<EventPruneResult>> {
    let principal = console_principal(&st, &headers).await?;
    let result = st.maintenance.run_event_retention().await?;
    audit(
        &st,
        OperationType::Prune,
        &principal,
        None,
        None,
        Some(json!({ "target": "request_events" })),
        serde_json::to_value(&result).ok(),
    )
    .await;
    Ok(Json(result))
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

async fn prune(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PruneRequest>,
) -> ApiResult<Json<syncular_schemas::PruneResult>> {
    let principal = console_principal(&st, &headers).await?;
    let partition = body.partition_id.clone().unwrap_or_default();
    let result = st
        .maintenance
        .prune(&partition, body.keep_newest_commits)
        .await?;
    audit(
        &st,
        OperationType::Prune,
        &principal,
        Some(partition),
        None,
        serde_json::to_value(&body).ok(),
        serde_json::to_value(&result).ok(),
    )
    .await;
    Ok(Json(result))
}

async fn prune_preview(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PruneRequest>,
) -> ApiResult<Json<syncular_schemas::PrunePreview>> {
    console_principal(&st, &headers).await?;
    let partition = body.partition_id.unwrap_or_default();
    Ok(Json(st.maintenance.prune_preview(&partition).await?))
}

async fn compact(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CompactRequest>,
) -> ApiResult<Json<syncular_schemas::CompactResult>> {
    let principal = console_principal(&st, &headers).await?;
    let partition = body.partition_id.clone().unwrap_or_default();
    let result = st
        .maintenance
        .compact(&partition, body.full_history_hours)
        .await?;
    audit(
        &st,
        OperationType::Compact,
        &principal,
        Some(partition),
        None,
        serde_json::to_value(&body).ok(),
        serde_json::to_value(&result).ok(),
    )
    .await;
    Ok(Json(result))
}

async fn notify_data_change_route(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<NotifyDataChangeRequest>,
) -> ApiResult<Json<syncular_schemas::NotifyDataChangeResult>> {
    let principal = console_principal(&st, &headers).await?;
    if body.tables.is_empty() {
        return Err(SyncError::invalid_request("tables must not be empty").into());
    }
    let partition = body.partition_id.clone().unwrap_or_default();

    let result = notify_data_change(&st.storage, &partition, &body.tables).await?;
    st.registry
        .notify_all_clients(&partition, result.commit_seq)
        .await;

    audit(
        &st,
        OperationType::NotifyDataChange,
        &principal,
        Some(partition),
        None,
        serde_json::to_value(&body).ok(),
        serde_json::to_value(&result).ok(),
    )
    .await;
    Ok(Json(result))
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

async fn api_keys(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<PageQuery>,
) -> ApiResult<Json<Page<ApiKeyInfo>>> {
    console_principal(&st, &headers).await?;
    let page = st.storage.list_api_keys(q.offset(), q.limit()).await?;
    Ok(Json(Page {
        items: page.items.into_iter().map(ApiKeyInfo::from).collect(),
        total: page.total,
    }))
}

async fn api_key_detail(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key_id): Path<Uuid>,
) -> ApiResult<Json<ApiKeyInfo>> {
    console_principal(&st, &headers).await?;
    let key = st
        .storage
        .get_api_key(key_id)
        .await?
        .ok_or_else(|| SyncError::not_found(format!("no api key '{key_id}'")))?;
    Ok(Json(ApiKeyInfo::from(key)))
}

async fn create_api_key(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateApiKeyRequest>,
) -> ApiResult<Json<ApiKeyCreated>> {
    console_principal(&st, &headers).await?;
    if body.name.trim().is_empty() {
        return Err(SyncError::invalid_request("key name must not be empty").into());
    }
    let created = mint_key(&st, &body).await?;
    Ok(Json(created))
}

async fn mint_key(st: &Arc<AppState>, req: &CreateApiKeyRequest) -> ApiResult<ApiKeyCreated> {
    let material = generate_key();
    let key = ApiKey {
        key_id: Uuid::new_v4(),
        key_hash: material.key_hash,
        key_prefix: material.key_prefix,
        name: req.name.clone(),
        key_type: req.key_type,
        scope_keys: req.scope_keys.clone(),
        actor_id: req.actor_id.clone(),
        created_at: Utc::now(),
        expires_at: req.expires_at,
        last_used_at: None,
        revoked_at: None,
    };
    st.storage.insert_api_key(key.clone()).await?;
    Ok(ApiKeyCreated {
        secret: material.secret,
        api_key: ApiKeyInfo::from(key),
    })
}

async fn rotate_api_key(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key_id): Path<Uuid>,
) -> ApiResult<Json<ApiKeyCreated>> {
    console_principal(&st, &headers).await?;
    let old = st
        .storage
        .get_api_key(key_id)
        .await?
        .ok_or_else(|| SyncError::not_found(format!("no api key '{key_id}'")))?;

    let created = mint_key(
        &st,
        &CreateApiKeyRequest {
            name: old.name.clone(),
            key_type: old.key_type,
            scope_keys: old.scope_keys.clone(),
            actor_id: old.actor_id.clone(),
            expires_at: old.expires_at,
        },
    )
    .await?;
    st.storage.revoke_api_key(key_id, Utc::now()).await?;
    Ok(Json(created))
}

/// Staged rotation: the replacement goes live while the old key keeps
/// working until a follow-up `rotate` (or explicit revoke) retires it.
async fn stage_rotate_api_key(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key_id): Path<Uuid>,
) -> ApiResult<Json<ApiKeyCreated>> {
    console_principal(&st, &headers).await?;
    let old = st
        .storage
        .get_api_key(key_id)
        .await?
        .ok_or_else(|| SyncError::not_found(format!("no api key '{key_id}'")))?;

    let created = mint_key(
        &st,
        &CreateApiKeyRequest {
            name: format!("{} (staged)", old.name),
            key_type: old.key_type,
            scope_keys: old.scope_keys.clone(),
            actor_id: old.actor_id.clone(),
            expires_at: old.expires_at,
        },
    )
    .await?;
    Ok(Json(created))
}

async fn delete_api_key(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    console_principal(&st, &headers).await?;
    let revoked = st.storage.revoke_api_key(key_id, Utc::now()).await?;
    if !revoked {
        return Err(SyncError::not_found("unknown or already revoked key").into());
    }
    Ok(Json(json!({ "ok": true })))
}

async fn bulk_revoke(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BulkRevokeRequest>,
) -> ApiResult<Json<BulkRevokeResult>> {
    console_principal(&st, &headers).await?;
    let mut revoked = 0;
    for key_id in body.key_ids {
        if st.storage.revoke_api_key(key_id, Utc::now()).await? {
            revoked += 1;
        }
    }
    Ok(Json(BulkRevokeResult { revoked }))
}
