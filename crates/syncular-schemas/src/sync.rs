//! Combined push/pull protocol types (`POST /sync`). CamelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ChangeOp, ScopeMap};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<PullRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Client-chosen idempotency key. Replaying the same
    /// `(clientId, clientCommitId)` returns the prior commit.
    pub client_commit_id: String,
    pub schema_version: i64,
    pub operations: Vec<PushOperation>,
}

/// Operations keep their snake_case `row_id`/`row_version` on the wire
/// (the camelCase spellings are accepted as aliases).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushOperation {
    pub table: String,
    #[serde(alias = "rowId")]
    pub row_id: String,
    pub op: ChangeOp,
    pub payload: Value,
    /// Optional optimistic-concurrency precondition: the current stored
    /// version must equal this, otherwise the operation conflicts.
    #[serde(default, alias = "rowVersion", skip_serializing_if = "Option::is_none")]
    pub row_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_commits: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_snapshot_rows: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_snapshot_pages: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_rows: Option<bool>,
    pub subscriptions: Vec<SubscriptionRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub id: String,
    pub table: String,
    #[serde(default)]
    pub scopes: ScopeMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// `-1` requests a bootstrap snapshot; anything else is incremental.
    pub cursor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_state: Option<BootstrapState>,
}

pub const BOOTSTRAP_CURSOR: i64 = -1;

/// Opaque continuation echoed back by the client between bootstrap pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapState {
    pub token: String,
    /// Commit seq the snapshot was taken at; becomes the cursor once
    /// bootstrap completes.
    pub cursor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_row_id: Option<String>,
    pub page: i64,
    /// Mirrors the chunk TTL; resuming past it means earlier chunks may be
    /// garbage-collected, so the bootstrap restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<PullResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushStatus {
    Applied,
    Rejected,
    Conflict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub status: PushStatus,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_seq: Option<i64>,
    pub results: Vec<OperationResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Ok,
    Error,
    Conflict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub op_index: i64,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl OperationResult {
    pub fn ok(op_index: i64) -> Self {
        Self {
            op_index,
            status: OperationStatus::Ok,
            error: None,
            code: None,
        }
    }

    pub fn error(op_index: i64, code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            op_index,
            status: OperationStatus::Error,
            error: Some(msg.into()),
            code: Some(code.into()),
        }
    }

    pub fn conflict(op_index: i64, msg: impl Into<String>) -> Self {
        Self {
            op_index,
            status: OperationStatus::Conflict,
            error: Some(msg.into()),
            code: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub subscriptions: Vec<SubscriptionResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    /// The caller lost access to a previously authorised row set; the client
    /// must discard its local data for this subscription.
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionResult {
    pub id: String,
    pub status: SubscriptionStatus,
    pub bootstrap: bool,
    pub next_cursor: i64,
    pub commits: Vec<CommitDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<Vec<SnapshotRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_state: Option<BootstrapState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitDelta {
    pub commit_seq: i64,
    pub actor_id: String,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub changes: Vec<ChangeDelta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDelta {
    pub table: String,
    pub row_id: String,
    pub op: ChangeOp,
    pub row_json: Value,
    pub row_version: i64,
    pub scopes: ScopeMap,
}

/// Reference to a stored bootstrap chunk; the body is fetched separately via
/// `GET /sync/snapshot-chunks/:chunkId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRef {
    pub chunk_id: String,
    pub sha256: String,
    pub byte_length: i64,
    pub encoding: String,
    pub compression: String,
    pub row_count: i64,
}
