//! Axum router and the sync-path handlers.
//!
//! `build_router` is the single entry point; `main.rs` attaches middleware
//! layers afterwards. Handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::warn;

use syncular_core::{EventDraft, PushOutcome};
use syncular_schemas::{
    CommitBroadcast, ErrorBody, ErrorCode, InstanceEvent, PushStatus, RequestEventType,
    RequestOutcome, SyncError, SyncPath, SyncRequest, SyncResponse,
};
use syncular_scope::partition_keys;

use crate::auth::require_principal;
use crate::console;
use crate::error::{ApiError, ApiResult};
use crate::rate_limit::{RateDecision, RouteClass};
use crate::state::{
    partition_from_headers, request_id_from_headers, trace_from_headers,
    transport_path_from_headers, AppState,
};
use crate::ws;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
/// Middleware (CORS, tracing) is attached by `main.rs`, not here.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sync", axum::routing::post(sync))
        .route("/sync/snapshot-chunks/:chunk_id", get(snapshot_chunk))
        .route("/sync/realtime", get(realtime_upgrade))
        .nest("/console", console::router())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[derive(serde::Serialize)]
struct HealthResponse {
    ok: bool,
    service: &'static str,
    version: &'static str,
}

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /sync  — combined push/pull
// ---------------------------------------------------------------------------

pub(crate) async fn sync(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SyncRequest>,
) -> Response {
    let started = Instant::now();
    let partition = partition_from_headers(&headers);
    let request_id = request_id_from_headers(&headers);
    let trace = trace_from_headers(&headers);
    let transport_path = transport_path_from_headers(&headers);

    let principal = match require_principal(&st.authenticator, &headers).await {
        Ok(p) => p,
        Err(e) => return ApiError(e).into_response(),
    };

    let decision = st.rate_limiter.check(&principal.actor_id, RouteClass::Sync);
    if !decision.allowed {
        return rate_limited_response(&decision);
    }

    if body.client_id.is_empty() {
        return ApiError(SyncError::invalid_request("clientId must not be empty")).into_response();
    }

    let ctx = syncular_core::SyncContext {
        partition: partition.clone(),
        principal,
        client_id: body.client_id.clone(),
    };

    let base_draft = |event_type: RequestEventType| EventDraft {
        partition: partition.clone(),
        request_id: request_id.clone(),
        trace: trace.clone(),
        event_type,
        sync_path: SyncPath::HttpCombined,
        transport_path,
        actor_id: ctx.principal.actor_id.clone(),
        client_id: ctx.client_id.clone(),
        status_code: 200,
        outcome: RequestOutcome::Applied,
        error_code: None,
        error_message: None,
        duration_ms: 0,
        commit_seq: None,
        operation_count: None,
        row_count: None,
        subscription_count: None,
        scopes_summary: None,
        tables: None,
    };

    // Push runs first so a pull in the same request observes the commit.
    let mut push_response = None;
    if let Some(push) = &body.push {
        match st.ingestor.push(&ctx, push).await {
            Ok(outcome) => {
                if !outcome.replayed && outcome.commit.is_some() {
                    post_commit_effects(&st, &ctx, &outcome).await;
                }
                let mut draft = base_draft(RequestEventType::Push);
                draft.outcome = match outcome.response.status {
                    PushStatus::Applied => RequestOutcome::Applied,
                    PushStatus::Conflict => RequestOutcome::Conflict,
                    PushStatus::Rejected => RequestOutcome::Rejected,
                };
                draft.commit_seq = outcome.response.commit_seq;
                draft.operation_count = Some(push.operations.len() as i64);
                draft.tables = Some(outcome.affected_tables.clone());
                draft.scopes_summary = scopes_summary(
                    outcome.emitted_scope_keys.iter().map(|k| k.as_str()),
                );
                draft.duration_ms = started.elapsed().as_millis() as i64;
                record(&st, draft, &body);
                push_response = Some(outcome.response);
            }
            Err(e) => {
                let mut draft = base_draft(RequestEventType::Push);
                draft.status_code = e.code.http_status();
                draft.outcome = RequestOutcome::Error;
                draft.error_code = Some(e.code.as_str().to_string());
                draft.error_message = Some(e.message.clone());
                draft.operation_count = Some(push.operations.len() as i64);
                draft.duration_ms = started.elapsed().as_millis() as i64;
                record(&st, draft, &body);
                return ApiError(e).into_response();
            }
        }
    }

    let mut pull_response = None;
    if let Some(pull) = &body.pull {
        match st.planner.pull(&ctx, pull).await {
            Ok(outcome) => {
                let keys = partition_keys(&partition, outcome.effective_scope_keys.iter());
                st.registry
                    .update_client_scope_keys(&partition, &ctx.client_id, keys)
                    .await;

                let mut draft = base_draft(RequestEventType::Pull);
                draft.subscription_count = Some(pull.subscriptions.len() as i64);
                draft.row_count = Some(
                    outcome
                        .response
                        .subscriptions
                        .iter()
                        .flat_map(|s| s.commits.iter())
                        .map(|c| c.changes.len() as i64)
                        .sum(),
                );
                draft.scopes_summary = scopes_summary(
                    outcome.effective_scope_keys.iter().map(|k| k.as_str()),
                );
                draft.tables = Some(
                    pull.subscriptions
                        .iter()
                        .map(|s| s.table.clone())
                        .collect(),
                );
                draft.duration_ms = started.elapsed().as_millis() as i64;
                record(&st, draft, &body);
                pull_response = Some(outcome.response);
            }
            Err(e) => {
                let mut draft = base_draft(RequestEventType::Pull);
                draft.status_code = e.code.http_status();
                draft.outcome = RequestOutcome::Error;
                draft.error_code = Some(e.code.as_str().to_string());
                draft.error_message = Some(e.message.clone());
                draft.subscription_count = Some(pull.subscriptions.len() as i64);
                draft.duration_ms = started.elapsed().as_millis() as i64;
                record(&st, draft, &body);
                return ApiError(e).into_response();
            }
        }
    }

    st.maintenance.maybe_trigger_retention();

    Json(SyncResponse {
        ok: true,
        push: push_response,
        pull: pull_response,
    })
    .into_response()
}

/// Realtime wake-ups plus cross-instance publish. Failures here never touch
/// the push response.
pub(crate) async fn post_commit_effects(
    st: &Arc<AppState>,
    ctx: &syncular_core::SyncContext,
    outcome: &PushOutcome,
) {
    let Some(commit) = &outcome.commit else { return };
    let keys = partition_keys(&ctx.partition, outcome.emitted_scope_keys.iter());
    let exclude = [ctx.client_id.clone()];
    st.registry
        .notify_scope_keys(
            &keys,
            commit.commit_seq,
            syncular_realtime::NotifyOptions {
                exclude_client_ids: &exclude,
                changes: Some(&outcome.changes),
                actor_id: Some(commit.actor_id.clone()),
                created_at: Some(commit.created_at),
            },
        )
        .await;

    let event = InstanceEvent::Commit(CommitBroadcast {
        commit_seq: commit.commit_seq,
        partition_id: ctx.partition.clone(),
        scope_keys: Some(
            outcome
                .emitted_scope_keys
                .iter()
                .map(|k| k.as_str().to_string())
                .collect(),
        ),
        source_instance_id: st.cfg.instance_id.clone(),
    });
    let broadcaster = Arc::clone(&st.broadcaster);
    tokio::spawn(async move {
        if let Err(e) = broadcaster.publish(event).await {
            warn!(error = %e, "cross-instance publish failed");
        }
    });
}

/// Replay an event received from another instance into the local registry.
/// Own echoes are dropped; missing scope keys resolve from the change log.
pub async fn apply_instance_event(st: &Arc<AppState>, event: InstanceEvent) {
    match event {
        InstanceEvent::Commit(c) => {
            if c.source_instance_id == st.cfg.instance_id {
                return;
            }
            let flat = match c.scope_keys {
                Some(keys) => keys,
                None => match st
                    .storage
                    .scope_keys_for_commit(&c.partition_id, c.commit_seq)
                    .await
                {
                    Ok(keys) => keys,
                    Err(e) => {
                        warn!(error = %e, "scope key resolution for remote commit failed");
                        return;
                    }
                },
            };
            let keys: Vec<_> = flat
                .iter()
                .filter_map(|s| syncular_scope::ScopeKey::parse(s))
                .map(|k| syncular_scope::PartitionedScopeKey::new(&c.partition_id, &k))
                .collect();
            st.registry
                .notify_scope_keys(&keys, c.commit_seq, Default::default())
                .await;
        }
        InstanceEvent::Presence(p) => {
            if p.source_instance_id == st.cfg.instance_id {
                return;
            }
            let Some(key) = syncular_scope::ScopeKey::parse(&p.scope_key) else {
                return;
            };
            let pkey = syncular_scope::PartitionedScopeKey::new(&p.partition_id, &key);
            match p.action {
                syncular_schemas::PresenceAction::Leave => {
                    st.registry
                        .leave_presence(&p.partition_id, &p.client_id, &pkey)
                        .await;
                }
                _ => {
                    // Remote joins/updates are relayed as broadcasts only;
                    // the authoritative membership lives on the home
                    // instance.
                }
            }
        }
    }
}

fn record(st: &Arc<AppState>, draft: EventDraft, body: &SyncRequest) {
    if st.cfg.record_payloads {
        let request_payload = serde_json::to_value(body).ok();
        st.recorder
            .record_with_payloads(draft, request_payload, None);
    } else {
        st.recorder.record(draft);
    }
}

fn scopes_summary<'a>(keys: impl Iterator<Item = &'a str>) -> Option<String> {
    let joined: Vec<&str> = keys.take(16).collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join(","))
    }
}

pub(crate) fn rate_limited_response(decision: &RateDecision) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ErrorBody {
            error: ErrorCode::RateLimited,
            message: "rate limit exceeded".to_string(),
        }),
    )
        .into_response();
    let headers = response.headers_mut();
    headers.insert(
        "Retry-After",
        HeaderValue::from_str(&decision.retry_after_secs.to_string()).unwrap(),
    );
    headers.insert(
        "X-RateLimit-Limit",
        HeaderValue::from_str(&decision.limit.to_string()).unwrap(),
    );
    headers.insert(
        "X-RateLimit-Remaining",
        HeaderValue::from_str(&decision.remaining.to_string()).unwrap(),
    );
    headers.insert(
        "X-RateLimit-Reset",
        HeaderValue::from_str(&decision.retry_after_secs.to_string()).unwrap(),
    );
    response
}

// ---------------------------------------------------------------------------
// GET /sync/snapshot-chunks/:chunk_id
// ---------------------------------------------------------------------------

pub(crate) async fn snapshot_chunk(
    State(st): State<Arc<AppState>>,
    Path(chunk_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    require_principal(&st.authenticator, &headers).await?;
    let partition = partition_from_headers(&headers);

    let chunk = st
        .storage
        .get_chunk(&chunk_id)
        .await?
        .filter(|c| c.expires_at > chrono::Utc::now())
        .ok_or_else(|| SyncError::not_found(format!("unknown or expired chunk '{chunk_id}'")))?;

    if chunk.partition_id != partition {
        return Err(SyncError::forbidden("chunk belongs to another partition").into());
    }

    let etag = format!("\"sha256:{}\"", chunk.sha256);
    if let Some(if_none_match) = headers
        .get(axum::http::header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if if_none_match == etag {
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }

    let mut response = chunk.body.into_response();
    let h = response.headers_mut();
    h.insert("Content-Type", HeaderValue::from_static("application/x-ndjson"));
    h.insert("Content-Encoding", HeaderValue::from_static("gzip"));
    h.insert("ETag", HeaderValue::from_str(&etag).unwrap());
    h.insert("X-Sync-Chunk-Id", HeaderValue::from_str(&chunk.chunk_id).unwrap());
    h.insert("X-Sync-Sha256", HeaderValue::from_str(&chunk.sha256).unwrap());
    h.insert("X-Sync-Encoding", HeaderValue::from_str(&chunk.encoding).unwrap());
    h.insert(
        "X-Sync-Compression",
        HeaderValue::from_str(&chunk.compression).unwrap(),
    );
    Ok(response)
}

// ---------------------------------------------------------------------------
// GET /sync/realtime  — WebSocket upgrade
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub(crate) struct RealtimeQuery {
    #[serde(rename = "clientId")]
    client_id: String,
}

pub(crate) async fn realtime_upgrade(
    State(st): State<Arc<AppState>>,
    Query(q): Query<RealtimeQuery>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let partition = partition_from_headers(&headers);

    // Caps are enforced before the upgrade so the refusal is a plain HTTP
    // error the client can read.
    if st.registry.connection_count().await >= st.cfg.max_connections_total {
        return cap_response(ErrorCode::WebsocketConnectionLimitTotal);
    }
    if st
        .registry
        .client_connection_count(&partition, &q.client_id)
        .await
        >= st.cfg.max_connections_per_client
    {
        return cap_response(ErrorCode::WebsocketConnectionLimitClient);
    }

    // A bearer on the upgrade request authenticates the socket up front;
    // otherwise the session waits for an in-socket auth message.
    let preauth = match crate::auth::bearer_token(&headers) {
        Some(token) => match st.authenticator.authenticate(token).await {
            Ok(p) => p,
            Err(_) => None,
        },
        None => None,
    };

    let trace = trace_from_headers(&headers);
    upgrade.on_upgrade(move |socket| {
        ws::run_session(st, socket, partition, q.client_id, preauth, trace)
    })
}

fn cap_response(code: ErrorCode) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ErrorBody {
            error: code,
            message: "connection limit reached".to_string(),
        }),
    )
        .into_response()
}
