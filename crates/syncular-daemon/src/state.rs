//! Shared runtime state for the sync daemon.
//!
//! `build_state` is the single wiring point: every component the handlers
//! touch is constructed here and threaded by reference. Teardown drops the
//! recorder sender, which drains the writer task.

use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Serialize;
use tokio::task::JoinHandle;

use syncular_config::SyncConfig;
use syncular_core::{
    spawn_recorder, CommitIngestor, MaintenanceScheduler, PullPlanner, RecorderHandle,
};
use syncular_db::Storage;
use syncular_realtime::{Broadcaster, ConnectionRegistry, NoopBroadcaster, RegistryLimits};
use syncular_schemas::PartitionId;
use syncular_scope::HandlerRegistry;

use crate::auth::Authenticator;
use crate::rate_limit::RateLimiter;

pub const PARTITION_HEADER: &str = "x-syncular-partition";
pub const TRANSPORT_PATH_HEADER: &str = "x-syncular-transport-path";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

pub struct AppState {
    pub cfg: SyncConfig,
    pub storage: Arc<dyn Storage>,
    pub handlers: HandlerRegistry,
    pub ingestor: CommitIngestor,
    pub planner: PullPlanner,
    pub registry: Arc<ConnectionRegistry>,
    pub recorder: RecorderHandle,
    pub maintenance: Arc<MaintenanceScheduler>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub rate_limiter: RateLimiter,
    pub authenticator: Arc<dyn Authenticator>,
    pub build: BuildInfo,
}

/// Wire the full component graph. The returned join handle belongs to the
/// request-event writer and completes once the state (and with it the
/// recorder sender) is dropped.
pub fn build_state(
    cfg: SyncConfig,
    storage: Arc<dyn Storage>,
    handlers: HandlerRegistry,
    authenticator: Arc<dyn Authenticator>,
    broadcaster: Arc<dyn Broadcaster>,
) -> (Arc<AppState>, JoinHandle<()>) {
    let (recorder, recorder_task) = spawn_recorder(
        Arc::clone(&storage),
        cfg.payload_snapshot_max_bytes,
    );

    let registry = Arc::new(ConnectionRegistry::new(RegistryLimits {
        max_connections_total: cfg.max_connections_total,
        max_connections_per_client: cfg.max_connections_per_client,
        inline_changes_max_bytes: cfg.inline_changes_max_bytes,
    }));

    let state = Arc::new(AppState {
        ingestor: CommitIngestor::new(
            Arc::clone(&storage),
            handlers.clone(),
            cfg.max_operations_per_push,
        ),
        planner: PullPlanner::new(Arc::clone(&storage), handlers.clone(), cfg.clone()),
        maintenance: Arc::new(MaintenanceScheduler::new(Arc::clone(&storage), cfg.clone())),
        rate_limiter: RateLimiter::new(cfg.rate_limit.clone()),
        registry,
        recorder,
        broadcaster,
        authenticator,
        handlers,
        storage,
        build: BuildInfo {
            service: "syncular-daemon",
            version: env!("CARGO_PKG_VERSION"),
        },
        cfg,
    });

    (state, recorder_task)
}

/// Convenience wiring for tests and single-node development: no cross-
/// instance broadcast.
pub fn build_state_with_noop_broadcast(
    cfg: SyncConfig,
    storage: Arc<dyn Storage>,
    handlers: HandlerRegistry,
    authenticator: Arc<dyn Authenticator>,
) -> (Arc<AppState>, JoinHandle<()>) {
    build_state(cfg, storage, handlers, authenticator, Arc::new(NoopBroadcaster))
}

// ---------------------------------------------------------------------------
// Header helpers
// ---------------------------------------------------------------------------

pub fn partition_from_headers(headers: &HeaderMap) -> PartitionId {
    headers
        .get(PARTITION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(PartitionId::new)
        .unwrap_or_default()
}

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

pub fn transport_path_from_headers(headers: &HeaderMap) -> syncular_schemas::TransportPath {
    match headers
        .get(TRANSPORT_PATH_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some("relay") => syncular_schemas::TransportPath::Relay,
        _ => syncular_schemas::TransportPath::Direct,
    }
}

pub fn trace_from_headers(headers: &HeaderMap) -> syncular_core::TraceContext {
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    syncular_core::TraceContext::from_headers(get("traceparent"), get("sentry-trace"))
}
