//! The typed storage interface the sync core is written against.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use syncular_schemas::{
    ApiKey, ClientCursor, Commit, CommitWithChanges, LatencyStats, OperationEvent, Page,
    PartitionId, PayloadSnapshot, RequestEvent, SnapshotChunk, SyncStats, TimelineItem,
    TimeseriesBucket,
};

use crate::types::{
    CursorWrite, IngestOutcome, NewCommit, RequestEventFilter, SnapshotPage,
};

#[async_trait]
pub trait Storage: Send + Sync {
    // -- commit log ---------------------------------------------------------

    /// Apply one client commit in a single serializable transaction:
    /// idempotency lookup, dense seq allocation, commit+change rows, cursor
    /// advance. Never partially applies.
    async fn ingest_commit(&self, commit: NewCommit) -> Result<IngestOutcome>;

    async fn get_commit(
        &self,
        partition: Option<&PartitionId>,
        commit_seq: i64,
    ) -> Result<Option<CommitWithChanges>>;

    /// Commits with `commit_seq > after_seq`, ascending, up to `limit`,
    /// including their change rows. Scope filtering is the caller's job.
    async fn commits_after(
        &self,
        partition: &PartitionId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<CommitWithChanges>>;

    async fn list_commits(
        &self,
        partition: Option<&PartitionId>,
        offset: i64,
        limit: i64,
    ) -> Result<Page<Commit>>;

    async fn max_commit_seq(&self, partition: &PartitionId) -> Result<Option<i64>>;

    /// Flat scope keys emitted by a commit's changes. Used to resolve
    /// cross-instance events that arrive without keys.
    async fn scope_keys_for_commit(
        &self,
        partition: &PartitionId,
        commit_seq: i64,
    ) -> Result<Vec<String>>;

    // -- bootstrap ----------------------------------------------------------

    /// Page of latest row states for `table`, visible under any of
    /// `scope_keys` (empty = unrestricted), ordered by `row_id`, strictly
    /// after `after_row_id`.
    async fn snapshot_rows(
        &self,
        partition: &PartitionId,
        table: &str,
        scope_keys: &[String],
        after_row_id: Option<&str>,
        limit: i64,
    ) -> Result<SnapshotPage>;

    // -- client cursors -----------------------------------------------------

    async fn get_cursor(
        &self,
        partition: &PartitionId,
        client_id: &str,
    ) -> Result<Option<ClientCursor>>;

    /// Advance-only upsert. A regressing cursor is ignored; a different
    /// actor on an existing client id is refused.
    async fn upsert_cursor(
        &self,
        partition: &PartitionId,
        client_id: &str,
        actor_id: &str,
        cursor: i64,
        effective_scopes: &[String],
    ) -> Result<CursorWrite>;

    async fn list_cursors(
        &self,
        partition: Option<&PartitionId>,
        offset: i64,
        limit: i64,
    ) -> Result<Page<ClientCursor>>;

    async fn delete_client(&self, partition: &PartitionId, client_id: &str) -> Result<bool>;

    // -- snapshot chunks ----------------------------------------------------

    async fn put_chunk(&self, chunk: SnapshotChunk) -> Result<()>;

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<SnapshotChunk>>;

    async fn delete_expired_chunks(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn invalidate_chunks(&self, partition: &PartitionId, tables: &[String]) -> Result<u64>;

    // -- request events -----------------------------------------------------

    async fn insert_request_event(&self, event: RequestEvent) -> Result<()>;

    async fn list_request_events(
        &self,
        filter: &RequestEventFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Page<RequestEvent>>;

    async fn get_request_event(&self, event_id: Uuid) -> Result<Option<RequestEvent>>;

    /// Delete events older than the age cutoff, then cap remaining rows.
    /// Returns the number deleted.
    async fn prune_request_events(
        &self,
        older_than: DateTime<Utc>,
        max_rows: i64,
    ) -> Result<u64>;

    async fn put_payload_snapshot(&self, snapshot: PayloadSnapshot) -> Result<()>;

    async fn get_payload_snapshot(&self, payload_ref: &str) -> Result<Option<PayloadSnapshot>>;

    /// Delete payload snapshots no request event references any more.
    async fn delete_unreferenced_payload_snapshots(&self) -> Result<u64>;

    // -- operation audit ----------------------------------------------------

    async fn insert_operation_event(&self, event: OperationEvent) -> Result<()>;

    async fn list_operation_events(&self, offset: i64, limit: i64)
        -> Result<Page<OperationEvent>>;

    async fn get_operation_event(&self, operation_id: Uuid) -> Result<Option<OperationEvent>>;

    async fn prune_operation_events(
        &self,
        older_than: DateTime<Utc>,
        max_rows: i64,
    ) -> Result<u64>;

    // -- maintenance --------------------------------------------------------

    /// Min cursor over clients whose cursor row was touched after
    /// `active_since`. `None` when there are no active clients.
    async fn min_active_cursor(
        &self,
        partition: &PartitionId,
        active_since: DateTime<Utc>,
    ) -> Result<Option<i64>>;

    /// Highest commit seq created strictly before `cutoff`.
    async fn max_seq_before(
        &self,
        partition: &PartitionId,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<i64>>;

    /// How many commits `delete_commits_le` would remove with the same
    /// arguments. Mutates nothing.
    async fn count_prunable(
        &self,
        partition: &PartitionId,
        watermark: i64,
        keep_newest: i64,
    ) -> Result<i64>;

    /// Delete commits (and their changes) with seq ≤ `watermark`, always
    /// keeping the newest `keep_newest` commits of the partition.
    async fn delete_commits_le(
        &self,
        partition: &PartitionId,
        watermark: i64,
        keep_newest: i64,
    ) -> Result<u64>;

    /// Drop superseded per-row history older than `cutoff`, keeping the
    /// latest change per `(table, row_id)`.
    async fn compact_changes(&self, partition: &PartitionId, cutoff: DateTime<Utc>)
        -> Result<u64>;

    // -- console stats ------------------------------------------------------

    async fn sync_stats(&self, partition: Option<&PartitionId>) -> Result<SyncStats>;

    async fn timeseries(
        &self,
        partition: Option<&PartitionId>,
        since: DateTime<Utc>,
        bucket_secs: i64,
    ) -> Result<Vec<TimeseriesBucket>>;

    async fn latency_percentiles(&self, partition: Option<&PartitionId>) -> Result<LatencyStats>;

    async fn timeline(
        &self,
        partition: Option<&PartitionId>,
        offset: i64,
        limit: i64,
    ) -> Result<Page<TimelineItem>>;

    // -- api keys -----------------------------------------------------------

    async fn insert_api_key(&self, key: ApiKey) -> Result<()>;

    async fn get_api_key(&self, key_id: Uuid) -> Result<Option<ApiKey>>;

    async fn get_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>>;

    async fn list_api_keys(&self, offset: i64, limit: i64) -> Result<Page<ApiKey>>;

    async fn touch_api_key_last_used(&self, key_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    async fn revoke_api_key(&self, key_id: Uuid, now: DateTime<Utc>) -> Result<bool>;
}
