//! Gateway router: aggregated console reads, single-instance proxies, and
//! instance health.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use syncular_config::InstanceConfig;
use syncular_schemas::{ErrorCode, FailedInstance, InstanceHealth, InstanceInfo, SyncError};

use crate::instances::{
    parse_federated_id, require_single, resolve_federated, select_instances, InstanceSelector,
};
use crate::live;
use crate::merge::{
    extract_local_id, extract_timestamp, merge_sorted, paginate, partial_failure_envelope,
    tag_federated, MergedItem,
};
use crate::state::{upstream_bearer, GatewayError, GatewayResult, GatewayState};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/console", console_router())
        .with_state(state)
}

fn console_router() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/instances", get(instances_list))
        .route("/instances/health", get(instances_health))
        .route("/events/live", get(live::events_live))
        .route("/stats", get(stats))
        .route("/stats/timeseries", get(stats_timeseries))
        .route("/stats/latency", get(stats_latency))
        .route("/commits", get(list_commits))
        .route("/commits/:id", get(commit_detail))
        .route("/clients", get(list_clients))
        .route("/clients/:id", delete(delete_client))
        .route("/handlers", get(proxy_handlers))
        .route("/timeline", get(list_timeline))
        .route("/operations", get(list_operations))
        .route("/events", get(list_events).delete(delete_events))
        .route("/events/prune", post(events_prune))
        .route("/events/:id", get(event_detail))
        .route("/events/:id/payload", get(event_payload))
        .route("/prune", post(prune))
        .route("/prune/preview", post(prune_preview))
        .route("/compact", post(compact))
        .route("/notify-data-change", post(notify_data_change))
        .route("/api-keys", get(list_api_keys).post(create_api_key))
        .route("/api-keys/bulk-revoke", post(bulk_revoke_api_keys))
        .route("/api-keys/:id", get(api_key_detail).delete(delete_api_key))
        .route("/api-keys/:id/rotate", post(rotate_api_key))
        .route("/api-keys/:id/rotate/stage", post(stage_rotate_api_key))
}

async fn health(State(st): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({ "ok": true, "service": st.build.service, "version": st.build.version }))
}

// ---------------------------------------------------------------------------
// Shared query shape
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GatewayQuery {
    instance_id: Option<String>,
    instance_ids: Option<String>,
    offset: Option<i64>,
    limit: Option<i64>,
    partition_id: Option<String>,
    event_type: Option<String>,
    client_id: Option<String>,
    actor_id: Option<String>,
    outcome: Option<String>,
    hours: Option<i64>,
    bucket_secs: Option<i64>,
}

impl GatewayQuery {
    pub(crate) fn selector(&self) -> InstanceSelector {
        InstanceSelector {
            instance_id: self.instance_id.clone(),
            instance_ids: self.instance_ids.clone(),
        }
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 200)
    }

    /// Query pairs forwarded verbatim to downstream consoles.
    fn passthrough(&self) -> String {
        let mut out = String::new();
        let mut push = |key: &str, v: &Option<String>| {
            if let Some(v) = v {
                out.push('&');
                out.push_str(key);
                out.push('=');
                out.push_str(v);
            }
        };
        push("partitionId", &self.partition_id);
        push("eventType", &self.event_type);
        push("clientId", &self.client_id);
        push("actorId", &self.actor_id);
        push("outcome", &self.outcome);
        out
    }
}

// ---------------------------------------------------------------------------
// Fan-out plumbing
// ---------------------------------------------------------------------------

struct InstanceSuccess {
    instance_id: String,
    body: Value,
}

async fn fan_out_get(
    st: &Arc<GatewayState>,
    instances: &[&InstanceConfig],
    path_and_query: &str,
    bearer: Option<&str>,
) -> (Vec<InstanceSuccess>, Vec<FailedInstance>) {
    let futures = instances.iter().map(|instance| {
        let fetcher = Arc::clone(&st.fetcher);
        async move {
            let outcome = fetcher
                .request_json(instance, "GET", path_and_query, bearer, None)
                .await;
            (instance.instance_id.clone(), outcome)
        }
    });

    let mut successes = Vec::new();
    let mut failed = Vec::new();
    for (instance_id, outcome) in join_all(futures).await {
        match outcome {
            Ok(res) if res.status < 400 => successes.push(InstanceSuccess {
                instance_id,
                body: res.body,
            }),
            Ok(res) => failed.push(FailedInstance {
                instance_id,
                reason: format!("HTTP {}", res.status),
                status: Some(res.status),
            }),
            Err(reason) => failed.push(FailedInstance {
                instance_id,
                reason,
                status: None,
            }),
        }
    }
    (successes, failed)
}

fn all_failed_response(failed: Vec<FailedInstance>) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({
            "error": ErrorCode::DownstreamUnavailable,
            "message": "every selected instance failed",
            "failedInstances": failed,
        })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

async fn stats(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    let instances = select_instances(&st.cfg, &q.selector())?;
    let path = format!("/console/stats?{}", q.passthrough());
    let (successes, failed) =
        fan_out_get(&st, &instances, &path, upstream_bearer(&headers)).await;
    if successes.is_empty() {
        return Ok(all_failed_response(failed));
    }

    let mut body = Map::new();
    let mut sums: Map<String, Value> = Map::new();
    for field in ["commitCount", "changeCount", "clientCount", "activeClientCount"] {
        let total: i64 = successes
            .iter()
            .filter_map(|s| s.body.get(field).and_then(Value::as_i64))
            .sum();
        sums.insert(field.to_string(), json!(total));
    }
    body.extend(sums);

    let fold = |field: &str, pick_min: bool| -> Option<i64> {
        let vals: Vec<i64> = successes
            .iter()
            .filter_map(|s| s.body.get(field).and_then(Value::as_i64))
            .collect();
        if vals.is_empty() {
            None
        } else if pick_min {
            vals.into_iter().min()
        } else {
            vals.into_iter().max()
        }
    };
    body.insert("minCommitSeq".into(), json!(fold("minCommitSeq", true)));
    body.insert("maxCommitSeq".into(), json!(fold("maxCommitSeq", false)));
    body.insert("minActiveCursor".into(), json!(fold("minActiveCursor", true)));
    body.insert("maxActiveCursor".into(), json!(fold("maxActiveCursor", false)));

    let mut min_by = Map::new();
    let mut max_by = Map::new();
    for s in &successes {
        if let Some(v) = s.body.get("minCommitSeq").filter(|v| !v.is_null()) {
            min_by.insert(s.instance_id.clone(), v.clone());
        }
        if let Some(v) = s.body.get("maxCommitSeq").filter(|v| !v.is_null()) {
            max_by.insert(s.instance_id.clone(), v.clone());
        }
    }
    body.insert("minCommitSeqByInstance".into(), Value::Object(min_by));
    body.insert("maxCommitSeqByInstance".into(), Value::Object(max_by));
    partial_failure_envelope(&mut body, &failed);

    Ok(Json(Value::Object(body)).into_response())
}

async fn stats_timeseries(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    let instances = select_instances(&st.cfg, &q.selector())?;
    let mut path = format!("/console/stats/timeseries?{}", q.passthrough());
    if let Some(hours) = q.hours {
        path.push_str(&format!("&hours={hours}"));
    }
    if let Some(bucket) = q.bucket_secs {
        path.push_str(&format!("&bucketSecs={bucket}"));
    }
    let (successes, failed) =
        fan_out_get(&st, &instances, &path, upstream_bearer(&headers)).await;
    if successes.is_empty() {
        return Ok(all_failed_response(failed));
    }

    // Bucket by identical timestamp; counts sum and latency averages are
    // weighted by each instance's event count in that bucket.
    #[derive(Default)]
    struct Bucket {
        push_count: i64,
        pull_count: i64,
        error_count: i64,
        weighted_latency: f64,
        weight: i64,
    }
    let mut buckets: std::collections::BTreeMap<String, Bucket> = Default::default();
    for s in &successes {
        let Some(items) = s.body.as_array() else { continue };
        for item in items {
            let Some(ts) = item.get("timestamp").and_then(Value::as_str) else {
                continue;
            };
            let bucket = buckets.entry(ts.to_string()).or_default();
            let push = item.get("pushCount").and_then(Value::as_i64).unwrap_or(0);
            let pull = item.get("pullCount").and_then(Value::as_i64).unwrap_or(0);
            bucket.push_count += push;
            bucket.pull_count += pull;
            bucket.error_count += item.get("errorCount").and_then(Value::as_i64).unwrap_or(0);
            let weight = push + pull;
            bucket.weighted_latency += item
                .get("avgLatencyMs")
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
                * weight as f64;
            bucket.weight += weight;
        }
    }

    let items: Vec<Value> = buckets
        .into_iter()
        .map(|(ts, b)| {
            json!({
                "timestamp": ts,
                "pushCount": b.push_count,
                "pullCount": b.pull_count,
                "errorCount": b.error_count,
                "avgLatencyMs": if b.weight > 0 { b.weighted_latency / b.weight as f64 } else { 0.0 },
            })
        })
        .collect();

    let mut body = Map::new();
    body.insert("items".into(), Value::Array(items));
    partial_failure_envelope(&mut body, &failed);
    Ok(Json(Value::Object(body)).into_response())
}

async fn stats_latency(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    let instances = select_instances(&st.cfg, &q.selector())?;
    let path = format!("/console/stats/latency?{}", q.passthrough());
    let (successes, failed) =
        fan_out_get(&st, &instances, &path, upstream_bearer(&headers)).await;
    if successes.is_empty() {
        return Ok(all_failed_response(failed));
    }

    // Arithmetic mean of per-instance percentiles. An approximation, and
    // flagged as such in the payload.
    let mean = |field: &str| -> f64 {
        let vals: Vec<f64> = successes
            .iter()
            .filter_map(|s| s.body.get(field).and_then(Value::as_f64))
            .collect();
        if vals.is_empty() {
            0.0
        } else {
            vals.iter().sum::<f64>() / vals.len() as f64
        }
    };
    let sample_count: i64 = successes
        .iter()
        .filter_map(|s| s.body.get("sampleCount").and_then(Value::as_i64))
        .sum();

    let mut body = Map::new();
    body.insert("p50Ms".into(), json!(mean("p50Ms")));
    body.insert("p90Ms".into(), json!(mean("p90Ms")));
    body.insert("p99Ms".into(), json!(mean("p99Ms")));
    body.insert("sampleCount".into(), json!(sample_count));
    body.insert("approximate".into(), json!(true));
    partial_failure_envelope(&mut body, &failed);
    Ok(Json(Value::Object(body)).into_response())
}

// ---------------------------------------------------------------------------
// Merged paginated lists
// ---------------------------------------------------------------------------

struct ListSpec {
    path: &'static str,
    ts_fields: &'static [&'static str],
    id_fields: &'static [&'static str],
    federated_field: &'static str,
    local_source_field: &'static str,
    local_out_field: &'static str,
}

const COMMITS: ListSpec = ListSpec {
    path: "/console/commits",
    ts_fields: &["createdAt"],
    id_fields: &["commitSeq"],
    federated_field: "federatedCommitId",
    local_source_field: "commitSeq",
    local_out_field: "localCommitSeq",
};
const CLIENTS: ListSpec = ListSpec {
    path: "/console/clients",
    ts_fields: &["updatedAt"],
    id_fields: &["clientId"],
    federated_field: "federatedClientId",
    local_source_field: "clientId",
    local_out_field: "localClientId",
};
const TIMELINE: ListSpec = ListSpec {
    path: "/console/timeline",
    ts_fields: &["timestamp", "createdAt"],
    id_fields: &["localId"],
    federated_field: "federatedId",
    local_source_field: "localId",
    local_out_field: "localId",
};
const OPERATIONS: ListSpec = ListSpec {
    path: "/console/operations",
    ts_fields: &["createdAt"],
    id_fields: &["operationId"],
    federated_field: "federatedOperationId",
    local_source_field: "operationId",
    local_out_field: "localOperationId",
};
const EVENTS: ListSpec = ListSpec {
    path: "/console/events",
    ts_fields: &["createdAt"],
    id_fields: &["eventId"],
    federated_field: "federatedEventId",
    local_source_field: "eventId",
    local_out_field: "localEventId",
};
const API_KEYS: ListSpec = ListSpec {
    path: "/console/api-keys",
    ts_fields: &["createdAt"],
    id_fields: &["keyId"],
    federated_field: "federatedKeyId",
    local_source_field: "keyId",
    local_out_field: "localKeyId",
};

/// Fetch pages from one instance until it can cover `needed` items or is
/// exhausted, bounded by the page cap.
async fn fetch_pages(
    st: &Arc<GatewayState>,
    instance: &InstanceConfig,
    spec: &ListSpec,
    extra_query: &str,
    needed: i64,
    bearer: Option<&str>,
) -> Result<(Vec<Value>, i64), FailedInstance> {
    let mut items: Vec<Value> = Vec::new();
    let mut total = 0;
    let fail = |reason: String, status: Option<u16>| FailedInstance {
        instance_id: instance.instance_id.clone(),
        reason,
        status,
    };

    for _page in 0..st.cfg.page_fetch_cap {
        let req_limit = (needed - items.len() as i64).clamp(1, 200);
        let path = format!(
            "{}?offset={}&limit={}{}",
            spec.path,
            items.len(),
            req_limit,
            extra_query
        );
        let res = st
            .fetcher
            .request_json(instance, "GET", &path, bearer, None)
            .await
            .map_err(|reason| fail(reason, None))?;
        if res.status >= 400 {
            return Err(fail(format!("HTTP {}", res.status), Some(res.status)));
        }
        let Some(page_items) = res.body.get("items").and_then(Value::as_array) else {
            return Err(fail("response carries no items array".to_string(), None));
        };
        total = res.body.get("total").and_then(Value::as_i64).unwrap_or(0);
        let got = page_items.len() as i64;
        items.extend(page_items.iter().cloned());
        if got < req_limit || items.len() as i64 >= needed {
            break;
        }
    }
    Ok((items, total))
}

async fn merged_list(
    st: Arc<GatewayState>,
    headers: HeaderMap,
    q: GatewayQuery,
    spec: &ListSpec,
) -> GatewayResult<Response> {
    let instances = select_instances(&st.cfg, &q.selector())?;
    let bearer = upstream_bearer(&headers);
    let needed = q.offset() + q.limit();
    let extra = q.passthrough();

    let futures = instances.iter().map(|instance| {
        let st = Arc::clone(&st);
        let extra = extra.clone();
        async move {
            (
                instance.instance_id.clone(),
                fetch_pages(&st, instance, spec, &extra, needed, bearer).await,
            )
        }
    });

    let mut merged: Vec<MergedItem> = Vec::new();
    let mut failed: Vec<FailedInstance> = Vec::new();
    let mut total: i64 = 0;
    let mut any_success = false;
    for (instance_id, outcome) in join_all(futures).await {
        match outcome {
            Ok((items, instance_total)) => {
                any_success = true;
                total += instance_total;
                for mut value in items {
                    let Some(local_id) = extract_local_id(&value, spec.id_fields) else {
                        continue;
                    };
                    let timestamp = extract_timestamp(&value, spec.ts_fields)
                        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                    tag_federated(
                        &mut value,
                        &instance_id,
                        &local_id,
                        spec.federated_field,
                        spec.local_source_field,
                        spec.local_out_field,
                    );
                    merged.push(MergedItem {
                        instance_id: instance_id.clone(),
                        timestamp,
                        local_id,
                        value,
                    });
                }
            }
            Err(f) => failed.push(f),
        }
    }

    if !any_success {
        return Ok(all_failed_response(failed));
    }

    let page = paginate(merge_sorted(merged), q.offset() as usize, q.limit() as usize);
    let mut body = Map::new();
    body.insert(
        "items".into(),
        Value::Array(page.into_iter().map(|m| m.value).collect()),
    );
    body.insert("total".into(), json!(total));
    partial_failure_envelope(&mut body, &failed);
    Ok(Json(Value::Object(body)).into_response())
}

async fn list_commits(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    merged_list(st, headers, q, &COMMITS).await
}

async fn list_clients(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    merged_list(st, headers, q, &CLIENTS).await
}

async fn list_timeline(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    merged_list(st, headers, q, &TIMELINE).await
}

async fn list_operations(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    merged_list(st, headers, q, &OPERATIONS).await
}

async fn list_events(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    merged_list(st, headers, q, &EVENTS).await
}

async fn list_api_keys(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    merged_list(st, headers, q, &API_KEYS).await
}

// ---------------------------------------------------------------------------
// Federated detail endpoints
// ---------------------------------------------------------------------------

async fn federated_detail(
    st: Arc<GatewayState>,
    headers: HeaderMap,
    q: GatewayQuery,
    raw_id: String,
    path_for: fn(&str) -> String,
    ambiguous_code: ErrorCode,
) -> GatewayResult<Response> {
    let id = parse_federated_id(&raw_id)?;
    let instance = resolve_federated(&st.cfg, &id, &q.selector(), ambiguous_code)?;

    let res = st
        .fetcher
        .request_json(
            instance,
            "GET",
            &path_for(&id.local_id),
            upstream_bearer(&headers),
            None,
        )
        .await
        .map_err(|reason| {
            GatewayError(SyncError::new(ErrorCode::DownstreamUnavailable, reason))
        })?;

    let mut body = res.body;
    if let Value::Object(map) = &mut body {
        map.insert("instanceId".into(), json!(instance.instance_id));
    }
    Ok((
        StatusCode::from_u16(res.status).unwrap_or(StatusCode::BAD_GATEWAY),
        Json(body),
    )
        .into_response())
}

async fn commit_detail(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    federated_detail(
        st,
        headers,
        q,
        id,
        |local| format!("/console/commits/{local}"),
        ErrorCode::AmbiguousCommitId,
    )
    .await
}

async fn event_detail(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    federated_detail(
        st,
        headers,
        q,
        id,
        |local| format!("/console/events/{local}"),
        ErrorCode::AmbiguousEventId,
    )
    .await
}

async fn event_payload(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    federated_detail(
        st,
        headers,
        q,
        id,
        |local| format!("/console/events/{local}/payload"),
        ErrorCode::AmbiguousEventId,
    )
    .await
}

async fn api_key_detail(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    federated_detail(
        st,
        headers,
        q,
        id,
        |local| format!("/console/api-keys/{local}"),
        ErrorCode::AmbiguousOperationId,
    )
    .await
}

// ---------------------------------------------------------------------------
// Single-instance proxies
// ---------------------------------------------------------------------------

async fn proxy_single(
    st: Arc<GatewayState>,
    headers: HeaderMap,
    q: GatewayQuery,
    method: &str,
    path: String,
    body: Option<Value>,
) -> GatewayResult<Response> {
    let instance = require_single(select_instances(&st.cfg, &q.selector())?)?;
    match st
        .fetcher
        .request_json(
            instance,
            method,
            &path,
            upstream_bearer(&headers),
            body.as_ref(),
        )
        .await
    {
        Ok(res) => Ok((
            StatusCode::from_u16(res.status).unwrap_or(StatusCode::BAD_GATEWAY),
            Json(res.body),
        )
            .into_response()),
        Err(reason) => {
            warn!(instance = %instance.instance_id, reason, "proxy request failed");
            Ok(all_failed_response(vec![FailedInstance {
                instance_id: instance.instance_id.clone(),
                reason,
                status: None,
            }]))
        }
    }
}

async fn proxy_handlers(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    proxy_single(st, headers, q, "GET", "/console/handlers".to_string(), None).await
}

async fn prune(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
    Json(body): Json<Value>,
) -> GatewayResult<Response> {
    proxy_single(st, headers, q, "POST", "/console/prune".to_string(), Some(body)).await
}

async fn prune_preview(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
    Json(body): Json<Value>,
) -> GatewayResult<Response> {
    proxy_single(
        st,
        headers,
        q,
        "POST",
        "/console/prune/preview".to_string(),
        Some(body),
    )
    .await
}

async fn compact(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
    Json(body): Json<Value>,
) -> GatewayResult<Response> {
    proxy_single(st, headers, q, "POST", "/console/compact".to_string(), Some(body)).await
}

async fn notify_data_change(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
    Json(body): Json<Value>,
) -> GatewayResult<Response> {
    proxy_single(
        st,
        headers,
        q,
        "POST",
        "/console/notify-data-change".to_string(),
        Some(body),
    )
    .await
}

async fn delete_client(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    let path = format!("/console/clients/{id}?{}", q.passthrough());
    proxy_single(st, headers, q, "DELETE", path, None).await
}

async fn delete_events(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    proxy_single(st, headers, q, "DELETE", "/console/events".to_string(), None).await
}

async fn events_prune(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    proxy_single(
        st,
        headers,
        q,
        "POST",
        "/console/events/prune".to_string(),
        None,
    )
    .await
}

async fn create_api_key(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
    Json(body): Json<Value>,
) -> GatewayResult<Response> {
    proxy_single(st, headers, q, "POST", "/console/api-keys".to_string(), Some(body)).await
}

async fn bulk_revoke_api_keys(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(q): Query<GatewayQuery>,
    Json(body): Json<Value>,
) -> GatewayResult<Response> {
    proxy_single(
        st,
        headers,
        q,
        "POST",
        "/console/api-keys/bulk-revoke".to_string(),
        Some(body),
    )
    .await
}

async fn delete_api_key(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    let path = format!("/console/api-keys/{id}");
    proxy_single(st, headers, q, "DELETE", path, None).await
}

async fn rotate_api_key(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    let path = format!("/console/api-keys/{id}/rotate");
    proxy_single(st, headers, q, "POST", path, None).await
}

async fn stage_rotate_api_key(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<GatewayQuery>,
) -> GatewayResult<Response> {
    let path = format!("/console/api-keys/{id}/rotate/stage");
    proxy_single(st, headers, q, "POST", path, None).await
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

async fn instances_list(State(st): State<Arc<GatewayState>>) -> Json<Vec<InstanceInfo>> {
    Json(
        st.cfg
            .instances
            .iter()
            .map(|i| InstanceInfo {
                instance_id: i.instance_id.clone(),
                label: i.label.clone(),
                base_url: i.base_url.clone(),
                enabled: i.enabled,
            })
            .collect(),
    )
}

/// Probe every enabled instance; this endpoint reports failures in-band and
/// never maps them to a 502.
async fn instances_health(
    State(st): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Json<Vec<InstanceHealth>> {
    let bearer = upstream_bearer(&headers);
    let futures = st.cfg.instances.iter().filter(|i| i.enabled).map(|instance| {
        let fetcher = Arc::clone(&st.fetcher);
        async move {
            let started = Instant::now();
            let outcome = fetcher
                .request_json(instance, "GET", "/console/stats", bearer, None)
                .await;
            let elapsed = started.elapsed().as_millis() as i64;
            match outcome {
                Ok(res) if res.status < 400 => InstanceHealth {
                    instance_id: instance.instance_id.clone(),
                    healthy: true,
                    response_time_ms: Some(elapsed),
                    checked_at: Utc::now(),
                    error: None,
                },
                Ok(res) => InstanceHealth {
                    instance_id: instance.instance_id.clone(),
                    healthy: false,
                    response_time_ms: Some(elapsed),
                    checked_at: Utc::now(),
                    error: Some(format!("HTTP {}", res.status)),
                },
                Err(reason) => InstanceHealth {
                    instance_id: instance.instance_id.clone(),
                    healthy: false,
                    response_time_ms: None,
                    checked_at: Utc::now(),
                    error: Some(reason),
                },
            }
        }
    });
    Json(join_all(futures).await)
}
