//! Storage-contract inputs and outcomes shared by every [`crate::Storage`]
//! implementation.

use chrono::{DateTime, Utc};
use serde_json::Value;
use syncular_schemas::{
    ChangeOp, Commit, PartitionId, RequestEventType, RequestOutcome, ScopeMap,
};

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewCommit {
    pub partition_id: PartitionId,
    pub actor_id: String,
    pub client_id: String,
    pub client_commit_id: String,
    pub changes: Vec<NewChange>,
    /// Flat scope keys written to the client cursor alongside the advance.
    pub effective_scopes: Vec<String>,
    /// Normally derived from `changes`; synthetic commits (external
    /// data-change notifications) carry no change rows and set this
    /// explicitly.
    pub affected_tables: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct NewChange {
    pub table: String,
    pub row_id: String,
    pub op: ChangeOp,
    pub row_json: Value,
    /// Optimistic-concurrency precondition from the client, if any.
    pub expected_version: Option<i64>,
    /// Server-materialised scope mapping, the authority for pull filtering.
    pub scopes: ScopeMap,
    /// Flat keys derived from `scopes`, stored denormalised for indexing.
    pub scope_keys: Vec<String>,
}

/// Result of the single serializable ingest transaction.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Applied {
        commit: Commit,
        replayed: bool,
        /// Row versions assigned to each change, in operation order. Empty
        /// on idempotent replay.
        change_versions: Vec<i64>,
    },
    /// At least one `expected_version` precondition failed; nothing was
    /// written.
    VersionConflict { conflicts: Vec<ConflictInfo> },
    /// The client id is already bound to a different actor.
    ActorMismatch { existing_actor: String },
}

#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub op_index: i64,
    pub expected_version: i64,
    pub current_version: Option<i64>,
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum CursorWrite {
    Updated(syncular_schemas::ClientCursor),
    ActorMismatch { existing_actor: String },
}

// ---------------------------------------------------------------------------
// Bootstrap snapshot paging
// ---------------------------------------------------------------------------

/// Latest visible state of one row, as paged out during bootstrap.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub row_id: String,
    pub row_json: Value,
    pub row_version: i64,
    pub scopes: ScopeMap,
}

/// One bootstrap page. `rows` may be shorter than the requested limit when
/// deleted or out-of-scope rows were scanned past; `scanned_last_row_id` is
/// the resume point regardless, and `exhausted` signals the end of the
/// table.
#[derive(Debug, Clone)]
pub struct SnapshotPage {
    pub rows: Vec<SnapshotRow>,
    pub scanned_last_row_id: Option<String>,
    pub exhausted: bool,
}

// ---------------------------------------------------------------------------
// Event queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RequestEventFilter {
    pub partition_id: Option<PartitionId>,
    pub event_type: Option<RequestEventType>,
    pub client_id: Option<String>,
    pub actor_id: Option<String>,
    pub outcome: Option<RequestOutcome>,
    pub since: Option<DateTime<Utc>>,
}
