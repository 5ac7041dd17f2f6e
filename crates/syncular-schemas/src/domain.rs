//! Storage-level domain types: commit log, change log, cursors, chunks,
//! request events, operation audit, API keys.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const DEFAULT_PARTITION: &str = "default";

// ---------------------------------------------------------------------------
// Partition
// ---------------------------------------------------------------------------

/// Logical isolation boundary. Every storage lookup and every scope key is
/// prefixed by exactly one partition; cross-partition reads never happen
/// implicitly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PartitionId {
    fn default() -> Self {
        Self(DEFAULT_PARTITION.to_string())
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Scope values
// ---------------------------------------------------------------------------

/// A scope entry value: a single value or a list of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeValue {
    One(String),
    Many(Vec<String>),
}

impl ScopeValue {
    pub fn values(&self) -> Vec<&str> {
        match self {
            ScopeValue::One(v) => vec![v.as_str()],
            ScopeValue::Many(vs) => vs.iter().map(|v| v.as_str()).collect(),
        }
    }
}

/// Server-materialised scope mapping attached to a change row, keyed by the
/// original column name (e.g. `user_id`).
pub type ScopeMap = BTreeMap<String, ScopeValue>;

// ---------------------------------------------------------------------------
// Commit + Change
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Upsert,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Upsert => "upsert",
            ChangeOp::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub commit_seq: i64,
    pub partition_id: PartitionId,
    pub actor_id: String,
    pub client_id: String,
    pub client_commit_id: String,
    pub created_at: DateTime<Utc>,
    pub change_count: i64,
    pub affected_tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Commit-local ordinal, starting at 0.
    pub change_id: i64,
    pub commit_seq: i64,
    pub table: String,
    pub row_id: String,
    pub op: ChangeOp,
    pub row_json: Value,
    pub row_version: i64,
    pub scopes: ScopeMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitWithChanges {
    pub commit: Commit,
    pub changes: Vec<Change>,
}

// ---------------------------------------------------------------------------
// Client cursor
// ---------------------------------------------------------------------------

/// Exactly one row per `(partition_id, client_id)`. `actor_id` is immutable
/// after the first write; the cursor only ever advances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCursor {
    pub partition_id: PartitionId,
    pub client_id: String,
    pub actor_id: String,
    pub cursor: i64,
    pub effective_scopes: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Snapshot chunk
// ---------------------------------------------------------------------------

/// Immutable, content-addressed page of bootstrap rows. Bodies are
/// newline-delimited JSON rows, gzip-compressed; `sha256` is computed over
/// the compressed bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotChunk {
    pub chunk_id: String,
    pub partition_id: PartitionId,
    /// Table the chunk was cut from; targeted invalidation keys off this.
    pub table: String,
    pub sha256: String,
    pub encoding: String,
    pub compression: String,
    pub byte_length: i64,
    #[serde(with = "serde_bytes_b64")]
    pub body: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

/// Base64 body transport for the rare case a chunk travels as JSON
/// (storage normally keeps it as bytea).
mod serde_bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Request events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestEventType {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPath {
    HttpCombined,
    WsPush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPath {
    Direct,
    Relay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestOutcome {
    Applied,
    Rejected,
    Conflict,
    Error,
}

/// Derived classification persisted alongside the raw status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Failure,
    ClientError,
    ServerError,
}

impl ResponseStatus {
    /// `[200,300) ∧ applied → success`; `[200,300) ∧ error/rejected →
    /// failure`; `[400,500) → client_error`; `[500,…) → server_error`.
    pub fn derive(status_code: u16, outcome: RequestOutcome) -> Self {
        match status_code {
            200..=299 => match outcome {
                RequestOutcome::Applied => ResponseStatus::Success,
                _ => ResponseStatus::Failure,
            },
            400..=499 => ResponseStatus::ClientError,
            _ => ResponseStatus::ServerError,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent {
    pub event_id: Uuid,
    pub partition_id: PartitionId,
    pub request_id: String,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub event_type: RequestEventType,
    pub sync_path: SyncPath,
    pub transport_path: TransportPath,
    pub actor_id: String,
    pub client_id: String,
    pub status_code: i32,
    pub outcome: RequestOutcome,
    pub response_status: ResponseStatus,
    pub error_code: Option<String>,
    pub duration_ms: i64,
    pub commit_seq: Option<i64>,
    pub operation_count: Option<i64>,
    pub row_count: Option<i64>,
    pub subscription_count: Option<i64>,
    pub scopes_summary: Option<String>,
    pub tables: Option<Vec<String>>,
    pub error_message: Option<String>,
    pub payload_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Optional retained request/response bodies for one event. Oversized bodies
/// are replaced by a `{truncated:true, originalSizeBytes, preview}` envelope
/// before they reach storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadSnapshot {
    pub payload_ref: String,
    pub partition_id: PartitionId,
    pub request_payload: Option<Value>,
    pub response_payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Operation audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Prune,
    Compact,
    NotifyDataChange,
    EvictClient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEvent {
    pub operation_id: Uuid,
    pub operation_type: OperationType,
    pub console_user_id: Option<String>,
    pub partition_id: Option<PartitionId>,
    pub target_client_id: Option<String>,
    pub request_payload: Option<Value>,
    pub result_payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyType {
    Relay,
    Proxy,
    Admin,
}

/// The secret itself is never stored; only its SHA-256 hash plus a short
/// display prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub key_id: Uuid,
    pub key_hash: String,
    pub key_prefix: String,
    pub name: String,
    pub key_type: ApiKeyType,
    pub scope_keys: Vec<String>,
    pub actor_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map(|e| e > now).unwrap_or(true)
    }
}

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// Authenticated caller identity as produced by the auth seam.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub actor_id: String,
    pub key_type: ApiKeyType,
    /// Scope keys this principal may subscribe to (`prefix:value` form,
    /// un-partitioned). Empty means unrestricted (admin).
    pub scope_keys: Vec<String>,
}

impl Principal {
    pub fn admin(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            key_type: ApiKeyType::Admin,
            scope_keys: Vec::new(),
        }
    }
}
