//! Federation gateway: merged views, partial-failure envelopes, instance
//! selection, and federated-id routing, driven against canned downstream
//! responses.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use syncular_config::{GatewayConfig, InstanceConfig};
use syncular_gateway::fetch::{DownstreamFetch, FetchResult};
use syncular_gateway::{routes, state::GatewayState};

// ---------------------------------------------------------------------------
// Stub downstream
// ---------------------------------------------------------------------------

struct Rule {
    instance: &'static str,
    path_prefix: &'static str,
    result: Result<FetchResult, String>,
}

struct StubFetcher {
    rules: Vec<Rule>,
}

#[async_trait]
impl DownstreamFetch for StubFetcher {
    async fn request_json(
        &self,
        instance: &InstanceConfig,
        _method: &str,
        path_and_query: &str,
        _upstream_bearer: Option<&str>,
        _body: Option<&Value>,
    ) -> Result<FetchResult, String> {
        for rule in &self.rules {
            if rule.instance == instance.instance_id
                && path_and_query.starts_with(rule.path_prefix)
            {
                return rule.result.clone();
            }
        }
        Err(format!("no stub for {} {}", instance.instance_id, path_and_query))
    }
}

fn ok(status: u16, body: Value) -> Result<FetchResult, String> {
    Ok(FetchResult { status, body })
}

fn gateway(instances: &[&str], rules: Vec<Rule>) -> axum::Router {
    let cfg = GatewayConfig {
        instances: instances
            .iter()
            .map(|id| InstanceConfig {
                instance_id: id.to_string(),
                label: id.to_string(),
                base_url: format!("http://{id}.internal"),
                token: None,
                enabled: true,
            })
            .collect(),
        ..GatewayConfig::default()
    };
    let st = GatewayState::new(cfg, Arc::new(StubFetcher { rules }));
    routes::build_router(st)
}

async fn get_json(router: axum::Router, uri: &str) -> (StatusCode, Value) {
    let resp = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(uri)
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

// ---------------------------------------------------------------------------
// Stats merge + partial failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stats_merge_with_one_failing_instance_is_partial_200() {
    let router = gateway(
        &["alpha", "beta"],
        vec![
            Rule {
                instance: "alpha",
                path_prefix: "/console/stats",
                result: ok(
                    200,
                    json!({
                        "commitCount": 10, "changeCount": 25, "clientCount": 3,
                        "activeClientCount": 2, "minCommitSeq": 1, "maxCommitSeq": 40,
                        "minActiveCursor": 12, "maxActiveCursor": 40
                    }),
                ),
            },
            Rule {
                instance: "beta",
                path_prefix: "/console/stats",
                result: ok(503, json!({ "error": "unavailable" })),
            },
        ],
    );

    let (status, body) = get_json(router, "/console/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["commitCount"], 10);
    assert_eq!(body["maxCommitSeq"], 40);
    assert_eq!(body["partial"], true);
    assert_eq!(body["failedInstances"][0]["instanceId"], "beta");
    assert_eq!(body["failedInstances"][0]["reason"], "HTTP 503");
    assert_eq!(body["failedInstances"][0]["status"], 503);
    assert_eq!(body["maxCommitSeqByInstance"]["alpha"], 40);
    assert!(body["maxCommitSeqByInstance"]
        .as_object()
        .unwrap()
        .get("beta")
        .is_none());
}

#[tokio::test]
async fn stats_sum_and_min_max_across_instances() {
    let router = gateway(
        &["alpha", "beta"],
        vec![
            Rule {
                instance: "alpha",
                path_prefix: "/console/stats",
                result: ok(
                    200,
                    json!({
                        "commitCount": 10, "changeCount": 20, "clientCount": 2,
                        "activeClientCount": 1, "minCommitSeq": 5, "maxCommitSeq": 40,
                        "minActiveCursor": null, "maxActiveCursor": 40
                    }),
                ),
            },
            Rule {
                instance: "beta",
                path_prefix: "/console/stats",
                result: ok(
                    200,
                    json!({
                        "commitCount": 4, "changeCount": 6, "clientCount": 1,
                        "activeClientCount": 1, "minCommitSeq": 2, "maxCommitSeq": 9,
                        "minActiveCursor": 7, "maxActiveCursor": 9
                    }),
                ),
            },
        ],
    );

    let (status, body) = get_json(router, "/console/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["commitCount"], 14);
    assert_eq!(body["minCommitSeq"], 2);
    assert_eq!(body["maxCommitSeq"], 40);
    // null cursors are skipped, not treated as zero
    assert_eq!(body["minActiveCursor"], 7);
    assert_eq!(body["partial"], false);
}

#[tokio::test]
async fn every_instance_failing_is_502() {
    let router = gateway(
        &["alpha", "beta"],
        vec![
            Rule {
                instance: "alpha",
                path_prefix: "/console/stats",
                result: Err("connect refused".to_string()),
            },
            Rule {
                instance: "beta",
                path_prefix: "/console/stats",
                result: ok(500, json!({})),
            },
        ],
    );

    let (status, body) = get_json(router, "/console/stats").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "DOWNSTREAM_UNAVAILABLE");
    assert_eq!(body["failedInstances"].as_array().unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Instance selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn zero_enabled_instances_is_400() {
    let router = gateway(&[], vec![]);
    let (status, body) = get_json(router, "/console/stats").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "NO_INSTANCES_SELECTED");
}

#[tokio::test]
async fn mutating_endpoint_requires_exactly_one_instance() {
    let router = gateway(&["alpha", "beta"], vec![]);
    let resp = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/console/prune")
                .header("Content-Type", "application/json")
                .body(axum::body::Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "INSTANCE_REQUIRED");
}

// ---------------------------------------------------------------------------
// Timeline merge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeline_merges_across_instances_in_timestamp_order() {
    let router = gateway(
        &["alpha", "beta"],
        vec![
            Rule {
                instance: "alpha",
                path_prefix: "/console/timeline",
                result: ok(
                    200,
                    json!({
                        "items": [
                            { "kind": "commit", "localId": "40",
                              "timestamp": "2026-08-01T10:04:00Z" }
                        ],
                        "total": 1
                    }),
                ),
            },
            Rule {
                instance: "beta",
                path_prefix: "/console/timeline",
                result: ok(
                    200,
                    json!({
                        "items": [
                            { "kind": "event", "localId": "2001",
                              "timestamp": "2026-08-01T10:05:00Z" },
                            { "kind": "commit", "localId": "39",
                              "timestamp": "2026-08-01T10:03:00Z" }
                        ],
                        "total": 2
                    }),
                ),
            },
        ],
    );

    let (status, body) = get_json(router, "/console/timeline?limit=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["partial"], false);

    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["federatedId"], "beta:2001");
    assert_eq!(items[0]["instanceId"], "beta");
    assert_eq!(items[1]["federatedId"], "alpha:40");
    assert_eq!(items[1]["localId"], "40");
}

#[tokio::test]
async fn commits_tie_break_is_instance_asc_then_seq_desc() {
    let ts = "2026-08-01T10:00:00Z";
    let router = gateway(
        &["beta", "alpha"],
        vec![
            Rule {
                instance: "beta",
                path_prefix: "/console/commits",
                result: ok(
                    200,
                    json!({ "items": [
                        { "commitSeq": 9, "createdAt": ts },
                        { "commitSeq": 10, "createdAt": ts }
                    ], "total": 2 }),
                ),
            },
            Rule {
                instance: "alpha",
                path_prefix: "/console/commits",
                result: ok(
                    200,
                    json!({ "items": [ { "commitSeq": 7, "createdAt": ts } ], "total": 1 }),
                ),
            },
        ],
    );

    let (status, body) = get_json(router, "/console/commits?limit=10").await;
    assert_eq!(status, StatusCode::OK);
    let federated: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["federatedCommitId"].as_str().unwrap())
        .collect();
    assert_eq!(federated, vec!["alpha:7", "beta:10", "beta:9"]);
    assert_eq!(body["items"][1]["localCommitSeq"], 10);
}

// ---------------------------------------------------------------------------
// Federated detail routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn commit_detail_resolves_federated_and_bare_ids() {
    let rules = vec![
        Rule {
            instance: "alpha",
            path_prefix: "/console/commits/42",
            result: ok(
                200,
                json!({ "commit": { "commitSeq": 42 }, "changes": [] }),
            ),
        },
    ];
    let router = gateway(&["alpha", "beta"], rules);

    let (status, body) = get_json(router.clone(), "/console/commits/alpha:42").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instanceId"], "alpha");
    assert_eq!(body["commit"]["commitSeq"], 42);

    // Bare id with two instances is ambiguous.
    let (status, body) = get_json(router.clone(), "/console/commits/42").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "AMBIGUOUS_COMMIT_ID");

    // Bare id plus explicit instanceId resolves.
    let (status, _) = get_json(router.clone(), "/console/commits/42?instanceId=alpha").await;
    assert_eq!(status, StatusCode::OK);

    // Unknown federated instance.
    let (status, body) = get_json(router, "/console/commits/zeta:42").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");
}

// ---------------------------------------------------------------------------
// Latency + timeseries merges
// ---------------------------------------------------------------------------

#[tokio::test]
async fn latency_merge_is_a_flagged_mean() {
    let router = gateway(
        &["alpha", "beta"],
        vec![
            Rule {
                instance: "alpha",
                path_prefix: "/console/stats/latency",
                result: ok(200, json!({ "p50Ms": 10.0, "p90Ms": 20.0, "p99Ms": 40.0, "sampleCount": 100 })),
            },
            Rule {
                instance: "beta",
                path_prefix: "/console/stats/latency",
                result: ok(200, json!({ "p50Ms": 30.0, "p90Ms": 40.0, "p99Ms": 80.0, "sampleCount": 50 })),
            },
        ],
    );

    let (status, body) = get_json(router, "/console/stats/latency").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["p50Ms"], 20.0);
    assert_eq!(body["p99Ms"], 60.0);
    assert_eq!(body["sampleCount"], 150);
    assert_eq!(body["approximate"], true);
}

#[tokio::test]
async fn timeseries_buckets_merge_with_event_weighted_latency() {
    let ts = "2026-08-01T10:00:00Z";
    let router = gateway(
        &["alpha", "beta"],
        vec![
            Rule {
                instance: "alpha",
                path_prefix: "/console/stats/timeseries",
                result: ok(
                    200,
                    json!([{ "timestamp": ts, "pushCount": 2, "pullCount": 0,
                             "errorCount": 1, "avgLatencyMs": 10.0 }]),
                ),
            },
            Rule {
                instance: "beta",
                path_prefix: "/console/stats/timeseries",
                result: ok(
                    200,
                    json!([{ "timestamp": ts, "pushCount": 0, "pullCount": 2,
                             "errorCount": 0, "avgLatencyMs": 30.0 }]),
                ),
            },
        ],
    );

    let (status, body) = get_json(router, "/console/stats/timeseries").await;
    assert_eq!(status, StatusCode::OK);
    let bucket = &body["items"][0];
    assert_eq!(bucket["pushCount"], 2);
    assert_eq!(bucket["pullCount"], 2);
    assert_eq!(bucket["errorCount"], 1);
    // (10 * 2 + 30 * 2) / 4
    assert_eq!(bucket["avgLatencyMs"], 20.0);
}

// ---------------------------------------------------------------------------
// Instances health never maps to 502
// ---------------------------------------------------------------------------

#[tokio::test]
async fn instances_health_reports_failures_in_band() {
    let router = gateway(
        &["alpha", "beta"],
        vec![
            Rule {
                instance: "alpha",
                path_prefix: "/console/stats",
                result: ok(200, json!({ "commitCount": 1 })),
            },
            Rule {
                instance: "beta",
                path_prefix: "/console/stats",
                result: Err("connect refused".to_string()),
            },
        ],
    );

    let (status, body) = get_json(router, "/console/instances/health").await;
    assert_eq!(status, StatusCode::OK);
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 2);
    let alpha = items.iter().find(|i| i["instanceId"] == "alpha").unwrap();
    assert_eq!(alpha["healthy"], true);
    assert!(alpha["responseTimeMs"].is_i64() || alpha["responseTimeMs"].is_u64());
    let beta = items.iter().find(|i| i["instanceId"] == "beta").unwrap();
    assert_eq!(beta["healthy"], false);
    assert_eq!(beta["error"], "connect refused");
}
