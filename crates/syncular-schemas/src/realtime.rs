//! Realtime WebSocket frames and cross-instance broadcast events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::PartitionId;
use crate::sync::{ChangeDelta, PushRequest, PushResponse};

// ---------------------------------------------------------------------------
// Server → client frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerFrame {
    Sync(SyncWake),
    Heartbeat { ts_millis: i64 },
    Presence(PresenceBroadcast),
    PushResponse(PushResponseFrame),
    Error(ErrorFrame),
}

/// Wake-up hint. `changes` is only inlined when the serialised payload fits
/// the inline cap; otherwise the client pulls to reach `cursor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncWake {
    pub cursor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<ChangeDelta>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Join,
    Update,
    Leave,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceBroadcast {
    pub action: PresenceAction,
    pub scope_key: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponseFrame {
    pub request_id: String,
    #[serde(flatten)]
    pub response: PushResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Client → server frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Auth(AuthMessage),
    Push(WsPushMessage),
    Presence(PresenceMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMessage {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsPushMessage {
    pub request_id: String,
    #[serde(flatten)]
    pub push: PushRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub action: PresenceAction,
    pub scope_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

// ---------------------------------------------------------------------------
// Cross-instance broadcast
// ---------------------------------------------------------------------------

/// Event published between instances so every node can wake its own
/// connections. Events from the local instance id are discarded on receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InstanceEvent {
    Commit(CommitBroadcast),
    Presence(PresenceInstanceBroadcast),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitBroadcast {
    pub commit_seq: i64,
    pub partition_id: PartitionId,
    /// When absent the receiving instance resolves the keys from its own
    /// change log before fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_keys: Option<Vec<String>>,
    pub source_instance_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceInstanceBroadcast {
    pub partition_id: PartitionId,
    pub scope_key: String,
    pub client_id: String,
    pub action: PresenceAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub source_instance_id: String,
}
