//! Typed configuration for the sync daemon and the federation gateway.
//!
//! Every limit in the sync protocol is a field here with its documented
//! default, so deployments tune behaviour through the layered YAML files
//! rather than code. Env vars override the bind address and database URL
//! only; everything else flows through the merged config tree.

use serde::{Deserialize, Serialize};

pub const ENV_DATABASE_URL: &str = "SYNCULAR_DATABASE_URL";
pub const ENV_DAEMON_ADDR: &str = "SYNCULAR_ADDR";
pub const ENV_GATEWAY_ADDR: &str = "SYNCULAR_GATEWAY_ADDR";

// ---------------------------------------------------------------------------
// Daemon config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SyncConfig {
    /// Identity used to suppress this node's own cross-instance echoes.
    pub instance_id: String,

    // push
    pub max_operations_per_push: i64,

    // pull
    pub limit_commits_default: i64,
    pub limit_commits_max: i64,
    pub limit_snapshot_rows_default: i64,
    pub limit_snapshot_rows_max: i64,
    pub max_snapshot_pages_max: i64,
    pub max_subscriptions: i64,
    pub snapshot_chunk_ttl_secs: i64,

    // realtime
    pub max_connections_total: usize,
    pub max_connections_per_client: usize,
    pub inline_changes_max_bytes: usize,
    pub heartbeat_interval_secs: u64,
    pub unauthenticated_grace_secs: u64,

    // request events
    pub record_payloads: bool,
    pub payload_snapshot_max_bytes: usize,
    pub request_events_max_age_ms: i64,
    pub request_events_max_rows: i64,
    pub operation_events_max_age_ms: i64,
    pub operation_events_max_rows: i64,

    // maintenance
    pub auto_prune_interval_ms: i64,
    pub full_history_hours: i64,
    pub keep_newest_commits: i64,
    /// Watermark fallback: ignore cursors idle longer than this window.
    pub prune_cursor_window_hours: i64,

    pub rate_limit: RateLimitConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            instance_id: "local".to_string(),
            max_operations_per_push: 200,
            limit_commits_default: 100,
            limit_commits_max: 100,
            limit_snapshot_rows_default: 1000,
            limit_snapshot_rows_max: 5000,
            max_snapshot_pages_max: 10,
            max_subscriptions: 200,
            snapshot_chunk_ttl_secs: 900,
            max_connections_total: 5000,
            max_connections_per_client: 3,
            inline_changes_max_bytes: 64 * 1024,
            heartbeat_interval_secs: 30,
            unauthenticated_grace_secs: 5,
            record_payloads: false,
            payload_snapshot_max_bytes: 64 * 1024,
            request_events_max_age_ms: 7 * 24 * 3600 * 1000,
            request_events_max_rows: 10_000,
            operation_events_max_age_ms: 30 * 24 * 3600 * 1000,
            operation_events_max_rows: 5_000,
            auto_prune_interval_ms: 5 * 60 * 1000,
            full_history_hours: 168,
            keep_newest_commits: 1000,
            prune_cursor_window_hours: 720,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Sliding-window limits per `(actor, route class)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub sync_max_requests: u32,
    pub console_max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            sync_max_requests: 600,
            console_max_requests: 120,
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GatewayConfig {
    pub instances: Vec<InstanceConfig>,
    pub fetch_timeout_ms: u64,
    /// Paged downstream fetches stop after this many pages per instance.
    pub page_fetch_cap: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            fetch_timeout_ms: 10_000,
            page_fetch_cap: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct InstanceConfig {
    pub instance_id: String,
    pub label: String,
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}
