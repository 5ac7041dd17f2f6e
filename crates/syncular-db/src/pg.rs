//! Postgres implementation of the [`Storage`] trait.
//!
//! All queries are runtime-bound. The ingest transaction runs serializable
//! and is retried once on transient connection faults; everything else is a
//! single statement (or a short transaction) against the pool.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use syncular_schemas::{
    ApiKey, ApiKeyType, Change, ChangeOp, ClientCursor, Commit, CommitWithChanges, LatencyStats,
    OperationEvent, Page, PartitionId, PayloadSnapshot, RequestEvent, ScopeMap, SnapshotChunk,
    SyncStats, TimelineItem, TimelineKind, TimeseriesBucket,
};

use crate::storage::Storage;
use crate::types::{
    ConflictInfo, CursorWrite, IngestOutcome, NewCommit, RequestEventFilter, SnapshotPage,
    SnapshotRow,
};

/// Window that counts a client cursor as "active" for stats purposes.
const ACTIVE_CURSOR_WINDOW_HOURS: i64 = 24;

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn try_ingest(&self, nc: &NewCommit) -> Result<IngestOutcome> {
        let mut tx = self.pool.begin().await.context("ingest begin failed")?;
        sqlx::query("set transaction isolation level serializable")
            .execute(&mut *tx)
            .await
            .context("set isolation failed")?;

        let p = nc.partition_id.as_str();

        // Idempotent replay: same (client_id, client_commit_id) returns the
        // prior commit without touching anything.
        if let Some(row) = sqlx::query(
            r#"
            select partition_id, commit_seq, actor_id, client_id, client_commit_id,
                   created_at, change_count, affected_tables
            from sync_commits
            where partition_id = $1 and client_id = $2 and client_commit_id = $3
            "#,
        )
        .bind(p)
        .bind(&nc.client_id)
        .bind(&nc.client_commit_id)
        .fetch_optional(&mut *tx)
        .await
        .context("idempotency lookup failed")?
        {
            tx.rollback().await.ok();
            return Ok(IngestOutcome::Applied {
                commit: commit_from_row(&row)?,
                replayed: true,
                change_versions: Vec::new(),
            });
        }

        // Actor immutability on the client cursor row.
        if let Some(row) = sqlx::query(
            "select actor_id from sync_client_cursors where partition_id = $1 and client_id = $2",
        )
        .bind(p)
        .bind(&nc.client_id)
        .fetch_optional(&mut *tx)
        .await
        .context("cursor actor lookup failed")?
        {
            let existing: String = row.get("actor_id");
            if existing != nc.actor_id {
                tx.rollback().await.ok();
                return Ok(IngestOutcome::ActorMismatch {
                    existing_actor: existing,
                });
            }
        }

        // Version preconditions, and the next version for every row touched.
        let mut conflicts = Vec::new();
        let mut next_versions = Vec::with_capacity(nc.changes.len());
        for (idx, ch) in nc.changes.iter().enumerate() {
            let current: Option<i64> = sqlx::query(
                r#"
                select row_version from sync_changes
                where partition_id = $1 and table_name = $2 and row_id = $3
                order by commit_seq desc, change_id desc
                limit 1
                "#,
            )
            .bind(p)
            .bind(&ch.table)
            .bind(&ch.row_id)
            .fetch_optional(&mut *tx)
            .await
            .context("row version lookup failed")?
            .map(|r| r.get("row_version"));

            if let Some(expected) = ch.expected_version {
                if current != Some(expected) {
                    conflicts.push(ConflictInfo {
                        op_index: idx as i64,
                        expected_version: expected,
                        current_version: current,
                    });
                }
            }
            next_versions.push(current.unwrap_or(0) + 1);
        }
        if !conflicts.is_empty() {
            tx.rollback().await.ok();
            return Ok(IngestOutcome::VersionConflict { conflicts });
        }

        // Dense per-partition sequence.
        let commit_seq: i64 = sqlx::query(
            r#"
            insert into sync_partitions (partition_id, next_commit_seq)
            values ($1, 1)
            on conflict (partition_id)
            do update set next_commit_seq = sync_partitions.next_commit_seq + 1
            returning next_commit_seq
            "#,
        )
        .bind(p)
        .fetch_one(&mut *tx)
        .await
        .context("commit seq allocation failed")?
        .get("next_commit_seq");

        let affected_tables: Vec<String> = match &nc.affected_tables {
            Some(tables) => tables.clone(),
            None => {
                let mut tables: Vec<String> =
                    nc.changes.iter().map(|c| c.table.clone()).collect();
                tables.sort();
                tables.dedup();
                tables
            }
        };

        let created_at: DateTime<Utc> = sqlx::query(
            r#"
            insert into sync_commits
              (partition_id, commit_seq, actor_id, client_id, client_commit_id,
               change_count, affected_tables)
            values ($1, $2, $3, $4, $5, $6, $7)
            returning created_at
            "#,
        )
        .bind(p)
        .bind(commit_seq)
        .bind(&nc.actor_id)
        .bind(&nc.client_id)
        .bind(&nc.client_commit_id)
        .bind(nc.changes.len() as i64)
        .bind(&affected_tables)
        .fetch_one(&mut *tx)
        .await
        .context("insert commit failed")?
        .get("created_at");

        for (idx, ch) in nc.changes.iter().enumerate() {
            sqlx::query(
                r#"
                insert into sync_changes
                  (partition_id, commit_seq, change_id, table_name, row_id, op,
                   row_json, row_version, scopes, scope_keys, created_at)
                values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(p)
            .bind(commit_seq)
            .bind(idx as i64)
            .bind(&ch.table)
            .bind(&ch.row_id)
            .bind(ch.op.as_str())
            .bind(&ch.row_json)
            .bind(next_versions[idx])
            .bind(serde_json::to_value(&ch.scopes).context("scopes encode failed")?)
            .bind(&ch.scope_keys)
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .context("insert change failed")?;
        }

        sqlx::query(
            r#"
            insert into sync_client_cursors
              (partition_id, client_id, actor_id, cursor_seq, effective_scopes, updated_at)
            values ($1, $2, $3, $4, $5, now())
            on conflict (partition_id, client_id) do update
            set cursor_seq = greatest(sync_client_cursors.cursor_seq, excluded.cursor_seq),
                effective_scopes = excluded.effective_scopes,
                updated_at = now()
            "#,
        )
        .bind(p)
        .bind(&nc.client_id)
        .bind(&nc.actor_id)
        .bind(commit_seq)
        .bind(serde_json::to_value(&nc.effective_scopes).context("scopes encode failed")?)
        .execute(&mut *tx)
        .await
        .context("cursor advance failed")?;

        tx.commit().await.context("ingest commit failed")?;

        Ok(IngestOutcome::Applied {
            commit: Commit {
                commit_seq,
                partition_id: nc.partition_id.clone(),
                actor_id: nc.actor_id.clone(),
                client_id: nc.client_id.clone(),
                client_commit_id: nc.client_commit_id.clone(),
                created_at,
                change_count: nc.changes.len() as i64,
                affected_tables,
            },
            replayed: false,
            change_versions: next_versions,
        })
    }
}

fn is_transient(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<sqlx::Error>(),
        Some(sqlx::Error::Io(_)) | Some(sqlx::Error::PoolTimedOut)
    )
}

#[async_trait]
impl Storage for PgStorage {
    async fn ingest_commit(&self, commit: NewCommit) -> Result<IngestOutcome> {
        match self.try_ingest(&commit).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if is_transient(&e) => {
                warn!(error = %e, "transient ingest failure, retrying once");
                self.try_ingest(&commit).await
            }
            Err(e) => Err(e),
        }
    }

    async fn get_commit(
        &self,
        partition: Option<&PartitionId>,
        commit_seq: i64,
    ) -> Result<Option<CommitWithChanges>> {
        let row = sqlx::query(
            r#"
            select partition_id, commit_seq, actor_id, client_id, client_commit_id,
                   created_at, change_count, affected_tables
            from sync_commits
            where commit_seq = $1 and ($2::text is null or partition_id = $2)
            limit 1
            "#,
        )
        .bind(commit_seq)
        .bind(partition.map(|p| p.as_str()))
        .fetch_optional(&self.pool)
        .await
        .context("get_commit failed")?;

        let Some(row) = row else { return Ok(None) };
        let commit = commit_from_row(&row)?;

        let changes = sqlx::query(
            r#"
            select change_id, commit_seq, table_name, row_id, op, row_json, row_version, scopes
            from sync_changes
            where partition_id = $1 and commit_seq = $2
            order by change_id
            "#,
        )
        .bind(commit.partition_id.as_str())
        .bind(commit_seq)
        .fetch_all(&self.pool)
        .await
        .context("get_commit changes failed")?
        .iter()
        .map(change_from_row)
        .collect::<Result<Vec<_>>>()?;

        Ok(Some(CommitWithChanges { commit, changes }))
    }

    async fn commits_after(
        &self,
        partition: &PartitionId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<CommitWithChanges>> {
        let commits: Vec<Commit> = sqlx::query(
            r#"
            select partition_id, commit_seq, actor_id, client_id, client_commit_id,
                   created_at, change_count, affected_tables
            from sync_commits
            where partition_id = $1 and commit_seq > $2
            order by commit_seq
            limit $3
            "#,
        )
        .bind(partition.as_str())
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("commits_after failed")?
        .iter()
        .map(commit_from_row)
        .collect::<Result<Vec<_>>>()?;

        if commits.is_empty() {
            return Ok(Vec::new());
        }

        let lo = commits.first().map(|c| c.commit_seq).unwrap_or(0);
        let hi = commits.last().map(|c| c.commit_seq).unwrap_or(0);
        let change_rows = sqlx::query(
            r#"
            select change_id, commit_seq, table_name, row_id, op, row_json, row_version, scopes
            from sync_changes
            where partition_id = $1 and commit_seq between $2 and $3
            order by commit_seq, change_id
            "#,
        )
        .bind(partition.as_str())
        .bind(lo)
        .bind(hi)
        .fetch_all(&self.pool)
        .await
        .context("commits_after changes failed")?;

        let mut out: Vec<CommitWithChanges> = commits
            .into_iter()
            .map(|commit| CommitWithChanges {
                commit,
                changes: Vec::new(),
            })
            .collect();
        for row in &change_rows {
            let ch = change_from_row(row)?;
            if let Some(cwc) = out.iter_mut().find(|c| c.commit.commit_seq == ch.commit_seq) {
                cwc.changes.push(ch);
            }
        }
        Ok(out)
    }

    async fn list_commits(
        &self,
        partition: Option<&PartitionId>,
        offset: i64,
        limit: i64,
    ) -> Result<Page<Commit>> {
        let p = partition.map(|p| p.as_str());
        let total: i64 = sqlx::query(
            "select count(*)::bigint as n from sync_commits where ($1::text is null or partition_id = $1)",
        )
        .bind(p)
        .fetch_one(&self.pool)
        .await
        .context("list_commits count failed")?
        .get("n");

        let items = sqlx::query(
            r#"
            select partition_id, commit_seq, actor_id, client_id, client_commit_id,
                   created_at, change_count, affected_tables
            from sync_commits
            where ($1::text is null or partition_id = $1)
            order by created_at desc, commit_seq desc
            offset $2 limit $3
            "#,
        )
        .bind(p)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_commits failed")?
        .iter()
        .map(commit_from_row)
        .collect::<Result<Vec<_>>>()?;

        Ok(Page { items, total })
    }

    async fn max_commit_seq(&self, partition: &PartitionId) -> Result<Option<i64>> {
        let row = sqlx::query(
            "select max(commit_seq) as seq from sync_commits where partition_id = $1",
        )
        .bind(partition.as_str())
        .fetch_one(&self.pool)
        .await
        .context("max_commit_seq failed")?;
        Ok(row.get("seq"))
    }

    async fn scope_keys_for_commit(
        &self,
        partition: &PartitionId,
        commit_seq: i64,
    ) -> Result<Vec<String>> {
        let row = sqlx::query(
            r#"
            select coalesce(array_agg(distinct k), '{}') as keys
            from sync_changes, unnest(scope_keys) as k
            where partition_id = $1 and commit_seq = $2
            "#,
        )
        .bind(partition.as_str())
        .bind(commit_seq)
        .fetch_one(&self.pool)
        .await
        .context("scope_keys_for_commit failed")?;
        Ok(row.get("keys"))
    }

    async fn snapshot_rows(
        &self,
        partition: &PartitionId,
        table: &str,
        scope_keys: &[String],
        after_row_id: Option<&str>,
        limit: i64,
    ) -> Result<SnapshotPage> {
        let rows = sqlx::query(
            r#"
            select distinct on (row_id)
                   row_id, op, row_json, row_version, scopes, scope_keys
            from sync_changes
            where partition_id = $1 and table_name = $2
              and ($3::text is null or row_id > $3)
            order by row_id asc, commit_seq desc, change_id desc
            limit $4
            "#,
        )
        .bind(partition.as_str())
        .bind(table)
        .bind(after_row_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("snapshot_rows failed")?;

        let exhausted = (rows.len() as i64) < limit;
        let scanned_last_row_id = rows.last().map(|r| r.get::<String, _>("row_id"));

        let mut out = Vec::new();
        for row in &rows {
            let op: String = row.get("op");
            if op == "delete" {
                continue;
            }
            if !scope_keys.is_empty() {
                let keys: Vec<String> = row.get("scope_keys");
                if !keys.iter().any(|k| scope_keys.contains(k)) {
                    continue;
                }
            }
            out.push(SnapshotRow {
                row_id: row.get("row_id"),
                row_json: row.get("row_json"),
                row_version: row.get("row_version"),
                scopes: scopes_from_value(row.get("scopes"))?,
            });
        }

        Ok(SnapshotPage {
            rows: out,
            scanned_last_row_id,
            exhausted,
        })
    }

    async fn get_cursor(
        &self,
        partition: &PartitionId,
        client_id: &str,
    ) -> Result<Option<ClientCursor>> {
        let row = sqlx::query(
            r#"
            select partition_id, client_id, actor_id, cursor_seq, effective_scopes, updated_at
            from sync_client_cursors
            where partition_id = $1 and client_id = $2
            "#,
        )
        .bind(partition.as_str())
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_cursor failed")?;
        row.as_ref().map(cursor_from_row).transpose()
    }

    async fn upsert_cursor(
        &self,
        partition: &PartitionId,
        client_id: &str,
        actor_id: &str,
        cursor: i64,
        effective_scopes: &[String],
    ) -> Result<CursorWrite> {
        let scopes_json =
            serde_json::to_value(effective_scopes).context("scopes encode failed")?;
        let row = sqlx::query(
            r#"
            insert into sync_client_cursors
              (partition_id, client_id, actor_id, cursor_seq, effective_scopes, updated_at)
            values ($1, $2, $3, $4, $5, now())
            on conflict (partition_id, client_id) do update
            set cursor_seq = greatest(sync_client_cursors.cursor_seq, excluded.cursor_seq),
                effective_scopes = excluded.effective_scopes,
                updated_at = now()
            where sync_client_cursors.actor_id = excluded.actor_id
            returning partition_id, client_id, actor_id, cursor_seq, effective_scopes, updated_at
            "#,
        )
        .bind(partition.as_str())
        .bind(client_id)
        .bind(actor_id)
        .bind(cursor)
        .bind(scopes_json)
        .fetch_optional(&self.pool)
        .await
        .context("upsert_cursor failed")?;

        match row {
            Some(row) => Ok(CursorWrite::Updated(cursor_from_row(&row)?)),
            None => {
                // Conflict branch filtered by actor mismatch; report it.
                let existing = sqlx::query(
                    "select actor_id from sync_client_cursors where partition_id = $1 and client_id = $2",
                )
                .bind(partition.as_str())
                .bind(client_id)
                .fetch_one(&self.pool)
                .await
                .context("actor mismatch lookup failed")?;
                Ok(CursorWrite::ActorMismatch {
                    existing_actor: existing.get("actor_id"),
                })
            }
        }
    }

    async fn list_cursors(
        &self,
        partition: Option<&PartitionId>,
        offset: i64,
        limit: i64,
    ) -> Result<Page<ClientCursor>> {
        let p = partition.map(|p| p.as_str());
        let total: i64 = sqlx::query(
            "select count(*)::bigint as n from sync_client_cursors where ($1::text is null or partition_id = $1)",
        )
        .bind(p)
        .fetch_one(&self.pool)
        .await
        .context("list_cursors count failed")?
        .get("n");

        let items = sqlx::query(
            r#"
            select partition_id, client_id, actor_id, cursor_seq, effective_scopes, updated_at
            from sync_client_cursors
            where ($1::text is null or partition_id = $1)
            order by updated_at desc, client_id
            offset $2 limit $3
            "#,
        )
        .bind(p)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_cursors failed")?
        .iter()
        .map(cursor_from_row)
        .collect::<Result<Vec<_>>>()?;

        Ok(Page { items, total })
    }

    async fn delete_client(&self, partition: &PartitionId, client_id: &str) -> Result<bool> {
        let res = sqlx::query(
            "delete from sync_client_cursors where partition_id = $1 and client_id = $2",
        )
        .bind(partition.as_str())
        .bind(client_id)
        .execute(&self.pool)
        .await
        .context("delete_client failed")?;
        Ok(res.rows_affected() > 0)
    }

    async fn put_chunk(&self, chunk: SnapshotChunk) -> Result<()> {
        sqlx::query(
            r#"
            insert into sync_snapshot_chunks
              (chunk_id, partition_id, table_name, sha256, encoding, compression,
               byte_length, body, expires_at)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&chunk.chunk_id)
        .bind(chunk.partition_id.as_str())
        .bind(&chunk.table)
        .bind(&chunk.sha256)
        .bind(&chunk.encoding)
        .bind(&chunk.compression)
        .bind(chunk.byte_length)
        .bind(&chunk.body)
        .bind(chunk.expires_at)
        .execute(&self.pool)
        .await
        .context("put_chunk failed")?;
        Ok(())
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<SnapshotChunk>> {
        let row = sqlx::query(
            r#"
            select chunk_id, partition_id, table_name, sha256, encoding, compression,
                   byte_length, body, expires_at
            from sync_snapshot_chunks
            where chunk_id = $1
            "#,
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_chunk failed")?;

        Ok(row.map(|row| SnapshotChunk {
            chunk_id: row.get("chunk_id"),
            partition_id: PartitionId::new(row.get::<String, _>("partition_id")),
            table: row.get("table_name"),
            sha256: row.get("sha256"),
            encoding: row.get("encoding"),
            compression: row.get("compression"),
            byte_length: row.get("byte_length"),
            body: row.get("body"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn delete_expired_chunks(&self, now: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("delete from sync_snapshot_chunks where expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .context("delete_expired_chunks failed")?;
        Ok(res.rows_affected())
    }

    async fn invalidate_chunks(&self, partition: &PartitionId, tables: &[String]) -> Result<u64> {
        let res = sqlx::query(
            "delete from sync_snapshot_chunks where partition_id = $1 and table_name = any($2)",
        )
        .bind(partition.as_str())
        .bind(tables)
        .execute(&self.pool)
        .await
        .context("invalidate_chunks failed")?;
        Ok(res.rows_affected())
    }

    async fn insert_request_event(&self, event: RequestEvent) -> Result<()> {
        sqlx::query(
            r#"
            insert into sync_request_events
              (event_id, partition_id, request_id, trace_id, span_id, event_type,
               sync_path, transport_path, actor_id, client_id, status_code, outcome,
               response_status, error_code, duration_ms, commit_seq, operation_count,
               row_count, subscription_count, scopes_summary, tables, error_message,
               payload_ref, created_at)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
            "#,
        )
        .bind(event.event_id)
        .bind(event.partition_id.as_str())
        .bind(&event.request_id)
        .bind(&event.trace_id)
        .bind(&event.span_id)
        .bind(enum_str(&event.event_type)?)
        .bind(enum_str(&event.sync_path)?)
        .bind(enum_str(&event.transport_path)?)
        .bind(&event.actor_id)
        .bind(&event.client_id)
        .bind(event.status_code)
        .bind(enum_str(&event.outcome)?)
        .bind(enum_str(&event.response_status)?)
        .bind(&event.error_code)
        .bind(event.duration_ms)
        .bind(event.commit_seq)
        .bind(event.operation_count)
        .bind(event.row_count)
        .bind(event.subscription_count)
        .bind(&event.scopes_summary)
        .bind(&event.tables)
        .bind(&event.error_message)
        .bind(&event.payload_ref)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .context("insert_request_event failed")?;
        Ok(())
    }

    async fn list_request_events(
        &self,
        filter: &RequestEventFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Page<RequestEvent>> {
        let p = filter.partition_id.as_ref().map(|p| p.as_str());
        let et = filter.event_type.as_ref().map(enum_str).transpose()?;
        let oc = filter.outcome.as_ref().map(enum_str).transpose()?;

        let total: i64 = sqlx::query(
            r#"
            select count(*)::bigint as n from sync_request_events
            where ($1::text is null or partition_id = $1)
              and ($2::text is null or event_type = $2)
              and ($3::text is null or client_id = $3)
              and ($4::text is null or actor_id = $4)
              and ($5::text is null or outcome = $5)
              and ($6::timestamptz is null or created_at >= $6)
            "#,
        )
        .bind(p)
        .bind(&et)
        .bind(&filter.client_id)
        .bind(&filter.actor_id)
        .bind(&oc)
        .bind(filter.since)
        .fetch_one(&self.pool)
        .await
        .context("list_request_events count failed")?
        .get("n");

        let items = sqlx::query(
            r#"
            select * from sync_request_events
            where ($1::text is null or partition_id = $1)
              and ($2::text is null or event_type = $2)
              and ($3::text is null or client_id = $3)
              and ($4::text is null or actor_id = $4)
              and ($5::text is null or outcome = $5)
              and ($6::timestamptz is null or created_at >= $6)
            order by created_at desc, event_id desc
            offset $7 limit $8
            "#,
        )
        .bind(p)
        .bind(&et)
        .bind(&filter.client_id)
        .bind(&filter.actor_id)
        .bind(&oc)
        .bind(filter.since)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_request_events failed")?
        .iter()
        .map(request_event_from_row)
        .collect::<Result<Vec<_>>>()?;

        Ok(Page { items, total })
    }

    async fn get_request_event(&self, event_id: Uuid) -> Result<Option<RequestEvent>> {
        let row = sqlx::query("select * from sync_request_events where event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_request_event failed")?;
        row.as_ref().map(request_event_from_row).transpose()
    }

    async fn prune_request_events(
        &self,
        older_than: DateTime<Utc>,
        max_rows: i64,
    ) -> Result<u64> {
        let by_age = sqlx::query("delete from sync_request_events where created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .context("prune_request_events age failed")?
            .rows_affected();

        let by_count = sqlx::query(
            r#"
            delete from sync_request_events where event_id in (
              select event_id from sync_request_events
              order by created_at desc, event_id desc
              offset $1
            )
            "#,
        )
        .bind(max_rows)
        .execute(&self.pool)
        .await
        .context("prune_request_events count failed")?
        .rows_affected();

        Ok(by_age + by_count)
    }

    async fn put_payload_snapshot(&self, snapshot: PayloadSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            insert into sync_payload_snapshots
              (payload_ref, partition_id, request_payload, response_payload, created_at)
            values ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&snapshot.payload_ref)
        .bind(snapshot.partition_id.as_str())
        .bind(&snapshot.request_payload)
        .bind(&snapshot.response_payload)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await
        .context("put_payload_snapshot failed")?;
        Ok(())
    }

    async fn get_payload_snapshot(&self, payload_ref: &str) -> Result<Option<PayloadSnapshot>> {
        let row = sqlx::query("select * from sync_payload_snapshots where payload_ref = $1")
            .bind(payload_ref)
            .fetch_optional(&self.pool)
            .await
            .context("get_payload_snapshot failed")?;
        Ok(row.map(|row| PayloadSnapshot {
            payload_ref: row.get("payload_ref"),
            partition_id: PartitionId::new(row.get::<String, _>("partition_id")),
            request_payload: row.get("request_payload"),
            response_payload: row.get("response_payload"),
            created_at: row.get("created_at"),
        }))
    }

    async fn delete_unreferenced_payload_snapshots(&self) -> Result<u64> {
        let res = sqlx::query(
            r#"
            delete from sync_payload_snapshots s
            where not exists (
              select 1 from sync_request_events e where e.payload_ref = s.payload_ref
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("delete_unreferenced_payload_snapshots failed")?;
        Ok(res.rows_affected())
    }

    async fn insert_operation_event(&self, event: OperationEvent) -> Result<()> {
        sqlx::query(
            r#"
            insert into sync_operation_events
              (operation_id, operation_type, console_user_id, partition_id,
               target_client_id, request_payload, result_payload, created_at)
            values ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.operation_id)
        .bind(enum_str(&event.operation_type)?)
        .bind(&event.console_user_id)
        .bind(event.partition_id.as_ref().map(|p| p.as_str()))
        .bind(&event.target_client_id)
        .bind(&event.request_payload)
        .bind(&event.result_payload)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .context("insert_operation_event failed")?;
        Ok(())
    }

    async fn list_operation_events(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Page<OperationEvent>> {
        let total: i64 = sqlx::query("select count(*)::bigint as n from sync_operation_events")
            .fetch_one(&self.pool)
            .await
            .context("list_operation_events count failed")?
            .get("n");

        let items = sqlx::query(
            r#"
            select * from sync_operation_events
            order by created_at desc, operation_id desc
            offset $1 limit $2
            "#,
        )
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_operation_events failed")?
        .iter()
        .map(operation_event_from_row)
        .collect::<Result<Vec<_>>>()?;

        Ok(Page { items, total })
    }

    async fn get_operation_event(&self, operation_id: Uuid) -> Result<Option<OperationEvent>> {
        let row = sqlx::query("select * from sync_operation_events where operation_id = $1")
            .bind(operation_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_operation_event failed")?;
        row.as_ref().map(operation_event_from_row).transpose()
    }

    async fn prune_operation_events(
        &self,
        older_than: DateTime<Utc>,
        max_rows: i64,
    ) -> Result<u64> {
        let by_age = sqlx::query("delete from sync_operation_events where created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .context("prune_operation_events age failed")?
            .rows_affected();

        let by_count = sqlx::query(
            r#"
            delete from sync_operation_events where operation_id in (
              select operation_id from sync_operation_events
              order by created_at desc, operation_id desc
              offset $1
            )
            "#,
        )
        .bind(max_rows)
        .execute(&self.pool)
        .await
        .context("prune_operation_events count failed")?
        .rows_affected();

        Ok(by_age + by_count)
    }

    async fn min_active_cursor(
        &self,
        partition: &PartitionId,
        active_since: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            select min(cursor_seq) as seq from sync_client_cursors
            where partition_id = $1 and updated_at >= $2
            "#,
        )
        .bind(partition.as_str())
        .bind(active_since)
        .fetch_one(&self.pool)
        .await
        .context("min_active_cursor failed")?;
        Ok(row.get("seq"))
    }

    async fn max_seq_before(
        &self,
        partition: &PartitionId,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            select max(commit_seq) as seq from sync_commits
            where partition_id = $1 and created_at < $2
            "#,
        )
        .bind(partition.as_str())
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .context("max_seq_before failed")?;
        Ok(row.get("seq"))
    }

    async fn count_prunable(
        &self,
        partition: &PartitionId,
        watermark: i64,
        keep_newest: i64,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            select count(*)::bigint as n from sync_commits
            where partition_id = $1 and commit_seq <= $2
              and commit_seq not in (
                select commit_seq from sync_commits
                where partition_id = $1
                order by commit_seq desc limit $3
              )
            "#,
        )
        .bind(partition.as_str())
        .bind(watermark)
        .bind(keep_newest)
        .fetch_one(&self.pool)
        .await
        .context("count_prunable failed")?;
        Ok(row.get("n"))
    }

    async fn delete_commits_le(
        &self,
        partition: &PartitionId,
        watermark: i64,
        keep_newest: i64,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("prune begin failed")?;

        sqlx::query(
            r#"
            delete from sync_changes
            where partition_id = $1 and commit_seq <= $2
              and commit_seq not in (
                select commit_seq from sync_commits
                where partition_id = $1
                order by commit_seq desc limit $3
              )
            "#,
        )
        .bind(partition.as_str())
        .bind(watermark)
        .bind(keep_newest)
        .execute(&mut *tx)
        .await
        .context("prune changes failed")?;

        let deleted = sqlx::query(
            r#"
            delete from sync_commits
            where partition_id = $1 and commit_seq <= $2
              and commit_seq not in (
                select commit_seq from sync_commits
                where partition_id = $1
                order by commit_seq desc limit $3
              )
            "#,
        )
        .bind(partition.as_str())
        .bind(watermark)
        .bind(keep_newest)
        .execute(&mut *tx)
        .await
        .context("prune commits failed")?
        .rows_affected();

        tx.commit().await.context("prune commit failed")?;
        Ok(deleted)
    }

    async fn compact_changes(
        &self,
        partition: &PartitionId,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let res = sqlx::query(
            r#"
            delete from sync_changes c
            where c.partition_id = $1
              and c.created_at < $2
              and exists (
                select 1 from sync_changes n
                where n.partition_id = c.partition_id
                  and n.table_name = c.table_name
                  and n.row_id = c.row_id
                  and (n.commit_seq > c.commit_seq
                       or (n.commit_seq = c.commit_seq and n.change_id > c.change_id))
              )
            "#,
        )
        .bind(partition.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("compact_changes failed")?;
        Ok(res.rows_affected())
    }

    async fn sync_stats(&self, partition: Option<&PartitionId>) -> Result<SyncStats> {
        let p = partition.map(|p| p.as_str());
        let active_since = Utc::now() - Duration::hours(ACTIVE_CURSOR_WINDOW_HOURS);

        let row = sqlx::query(
            r#"
            select
              (select count(*)::bigint from sync_commits
                 where ($1::text is null or partition_id = $1)) as commit_count,
              (select count(*)::bigint from sync_changes
                 where ($1::text is null or partition_id = $1)) as change_count,
              (select count(*)::bigint from sync_client_cursors
                 where ($1::text is null or partition_id = $1)) as client_count,
              (select count(*)::bigint from sync_client_cursors
                 where ($1::text is null or partition_id = $1)
                   and updated_at >= $2) as active_client_count,
              (select min(commit_seq) from sync_commits
                 where ($1::text is null or partition_id = $1)) as min_commit_seq,
              (select max(commit_seq) from sync_commits
                 where ($1::text is null or partition_id = $1)) as max_commit_seq,
              (select min(cursor_seq) from sync_client_cursors
                 where ($1::text is null or partition_id = $1)
                   and updated_at >= $2) as min_active_cursor,
              (select max(cursor_seq) from sync_client_cursors
                 where ($1::text is null or partition_id = $1)
                   and updated_at >= $2) as max_active_cursor
            "#,
        )
        .bind(p)
        .bind(active_since)
        .fetch_one(&self.pool)
        .await
        .context("sync_stats failed")?;

        Ok(SyncStats {
            commit_count: row.get("commit_count"),
            change_count: row.get("change_count"),
            client_count: row.get("client_count"),
            active_client_count: row.get("active_client_count"),
            min_commit_seq: row.get("min_commit_seq"),
            max_commit_seq: row.get("max_commit_seq"),
            min_active_cursor: row.get("min_active_cursor"),
            max_active_cursor: row.get("max_active_cursor"),
        })
    }

    async fn timeseries(
        &self,
        partition: Option<&PartitionId>,
        since: DateTime<Utc>,
        bucket_secs: i64,
    ) -> Result<Vec<TimeseriesBucket>> {
        let rows = sqlx::query(
            r#"
            select
              to_timestamp(floor(extract(epoch from created_at) / $3) * $3) as bucket,
              count(*) filter (where event_type = 'push')::bigint as push_count,
              count(*) filter (where event_type = 'pull')::bigint as pull_count,
              count(*) filter (where response_status in ('client_error', 'server_error', 'failure'))::bigint as error_count,
              coalesce(avg(duration_ms), 0)::float8 as avg_latency_ms
            from sync_request_events
            where ($1::text is null or partition_id = $1) and created_at >= $2
            group by bucket
            order by bucket
            "#,
        )
        .bind(partition.map(|p| p.as_str()))
        .bind(since)
        .bind(bucket_secs)
        .fetch_all(&self.pool)
        .await
        .context("timeseries failed")?;

        Ok(rows
            .iter()
            .map(|row| TimeseriesBucket {
                timestamp: row.get("bucket"),
                push_count: row.get("push_count"),
                pull_count: row.get("pull_count"),
                error_count: row.get("error_count"),
                avg_latency_ms: row.get("avg_latency_ms"),
            })
            .collect())
    }

    async fn latency_percentiles(&self, partition: Option<&PartitionId>) -> Result<LatencyStats> {
        let row = sqlx::query(
            r#"
            select
              coalesce(percentile_cont(0.5) within group (order by duration_ms), 0)::float8 as p50,
              coalesce(percentile_cont(0.9) within group (order by duration_ms), 0)::float8 as p90,
              coalesce(percentile_cont(0.99) within group (order by duration_ms), 0)::float8 as p99,
              count(*)::bigint as n
            from sync_request_events
            where ($1::text is null or partition_id = $1)
            "#,
        )
        .bind(partition.map(|p| p.as_str()))
        .fetch_one(&self.pool)
        .await
        .context("latency_percentiles failed")?;

        Ok(LatencyStats {
            p50_ms: row.get("p50"),
            p90_ms: row.get("p90"),
            p99_ms: row.get("p99"),
            sample_count: row.get("n"),
        })
    }

    async fn timeline(
        &self,
        partition: Option<&PartitionId>,
        offset: i64,
        limit: i64,
    ) -> Result<Page<TimelineItem>> {
        let p = partition.map(|p| p.as_str());

        let total: i64 = sqlx::query(
            r#"
            select
              (select count(*)::bigint from sync_commits
                 where ($1::text is null or partition_id = $1))
            + (select count(*)::bigint from sync_request_events
                 where ($1::text is null or partition_id = $1)) as n
            "#,
        )
        .bind(p)
        .fetch_one(&self.pool)
        .await
        .context("timeline count failed")?
        .get("n");

        let rows = sqlx::query(
            r#"
            select * from (
              select 'commit' as kind, commit_seq::text as local_id, created_at,
                     actor_id, client_id
              from sync_commits
              where ($1::text is null or partition_id = $1)
              union all
              select 'event' as kind, event_id::text as local_id, created_at,
                     actor_id, client_id
              from sync_request_events
              where ($1::text is null or partition_id = $1)
            ) t
            order by created_at desc, local_id desc
            offset $2 limit $3
            "#,
        )
        .bind(p)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("timeline failed")?;

        let items = rows
            .iter()
            .map(|row| {
                let kind: String = row.get("kind");
                TimelineItem {
                    kind: if kind == "commit" {
                        TimelineKind::Commit
                    } else {
                        TimelineKind::Event
                    },
                    local_id: row.get("local_id"),
                    timestamp: row.get("created_at"),
                    actor_id: row.get("actor_id"),
                    client_id: row.get("client_id"),
                    detail: None,
                }
            })
            .collect();

        Ok(Page { items, total })
    }

    async fn insert_api_key(&self, key: ApiKey) -> Result<()> {
        sqlx::query(
            r#"
            insert into sync_api_keys
              (key_id, key_hash, key_prefix, name, key_type, scope_keys, actor_id,
               created_at, expires_at, last_used_at, revoked_at)
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(key.key_id)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(&key.name)
        .bind(enum_str(&key.key_type)?)
        .bind(&key.scope_keys)
        .bind(&key.actor_id)
        .bind(key.created_at)
        .bind(key.expires_at)
        .bind(key.last_used_at)
        .bind(key.revoked_at)
        .execute(&self.pool)
        .await
        .context("insert_api_key failed")?;
        Ok(())
    }

    async fn get_api_key(&self, key_id: Uuid) -> Result<Option<ApiKey>> {
        let row = sqlx::query("select * from sync_api_keys where key_id = $1")
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_api_key failed")?;
        row.as_ref().map(api_key_from_row).transpose()
    }

    async fn get_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>> {
        let row = sqlx::query("select * from sync_api_keys where key_hash = $1")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await
            .context("get_api_key_by_hash failed")?;
        row.as_ref().map(api_key_from_row).transpose()
    }

    async fn list_api_keys(&self, offset: i64, limit: i64) -> Result<Page<ApiKey>> {
        let total: i64 = sqlx::query("select count(*)::bigint as n from sync_api_keys")
            .fetch_one(&self.pool)
            .await
            .context("list_api_keys count failed")?
            .get("n");

        let items = sqlx::query(
            "select * from sync_api_keys order by created_at desc offset $1 limit $2",
        )
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_api_keys failed")?
        .iter()
        .map(api_key_from_row)
        .collect::<Result<Vec<_>>>()?;

        Ok(Page { items, total })
    }

    async fn touch_api_key_last_used(&self, key_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("update sync_api_keys set last_used_at = $2 where key_id = $1")
            .bind(key_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .context("touch_api_key_last_used failed")?;
        Ok(())
    }

    async fn revoke_api_key(&self, key_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            "update sync_api_keys set revoked_at = $2 where key_id = $1 and revoked_at is null",
        )
        .bind(key_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("revoke_api_key failed")?;
        Ok(res.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn commit_from_row(row: &PgRow) -> Result<Commit> {
    Ok(Commit {
        commit_seq: row.get("commit_seq"),
        partition_id: PartitionId::new(row.get::<String, _>("partition_id")),
        actor_id: row.get("actor_id"),
        client_id: row.get("client_id"),
        client_commit_id: row.get("client_commit_id"),
        created_at: row.get("created_at"),
        change_count: row.get("change_count"),
        affected_tables: row.get("affected_tables"),
    })
}

fn change_from_row(row: &PgRow) -> Result<Change> {
    let op: String = row.get("op");
    Ok(Change {
        change_id: row.get("change_id"),
        commit_seq: row.get("commit_seq"),
        table: row.get("table_name"),
        row_id: row.get("row_id"),
        op: match op.as_str() {
            "delete" => ChangeOp::Delete,
            _ => ChangeOp::Upsert,
        },
        row_json: row.get("row_json"),
        row_version: row.get("row_version"),
        scopes: scopes_from_value(row.get("scopes"))?,
    })
}

fn cursor_from_row(row: &PgRow) -> Result<ClientCursor> {
    let scopes: Value = row.get("effective_scopes");
    Ok(ClientCursor {
        partition_id: PartitionId::new(row.get::<String, _>("partition_id")),
        client_id: row.get("client_id"),
        actor_id: row.get("actor_id"),
        cursor: row.get("cursor_seq"),
        effective_scopes: serde_json::from_value(scopes).context("decode effective_scopes")?,
        updated_at: row.get("updated_at"),
    })
}

fn request_event_from_row(row: &PgRow) -> Result<RequestEvent> {
    Ok(RequestEvent {
        event_id: row.get("event_id"),
        partition_id: PartitionId::new(row.get::<String, _>("partition_id")),
        request_id: row.get("request_id"),
        trace_id: row.get("trace_id"),
        span_id: row.get("span_id"),
        event_type: enum_from_str(row.get::<String, _>("event_type"))?,
        sync_path: enum_from_str(row.get::<String, _>("sync_path"))?,
        transport_path: enum_from_str(row.get::<String, _>("transport_path"))?,
        actor_id: row.get("actor_id"),
        client_id: row.get("client_id"),
        status_code: row.get("status_code"),
        outcome: enum_from_str(row.get::<String, _>("outcome"))?,
        response_status: enum_from_str(row.get::<String, _>("response_status"))?,
        error_code: row.get("error_code"),
        duration_ms: row.get("duration_ms"),
        commit_seq: row.get("commit_seq"),
        operation_count: row.get("operation_count"),
        row_count: row.get("row_count"),
        subscription_count: row.get("subscription_count"),
        scopes_summary: row.get("scopes_summary"),
        tables: row.get("tables"),
        error_message: row.get("error_message"),
        payload_ref: row.get("payload_ref"),
        created_at: row.get("created_at"),
    })
}

fn operation_event_from_row(row: &PgRow) -> Result<OperationEvent> {
    Ok(OperationEvent {
        operation_id: row.get("operation_id"),
        operation_type: enum_from_str(row.get::<String, _>("operation_type"))?,
        console_user_id: row.get("console_user_id"),
        partition_id: row
            .get::<Option<String>, _>("partition_id")
            .map(PartitionId::new),
        target_client_id: row.get("target_client_id"),
        request_payload: row.get("request_payload"),
        result_payload: row.get("result_payload"),
        created_at: row.get("created_at"),
    })
}

fn api_key_from_row(row: &PgRow) -> Result<ApiKey> {
    let key_type: String = row.get("key_type");
    Ok(ApiKey {
        key_id: row.get("key_id"),
        key_hash: row.get("key_hash"),
        key_prefix: row.get("key_prefix"),
        name: row.get("name"),
        key_type: match key_type.as_str() {
            "relay" => ApiKeyType::Relay,
            "admin" => ApiKeyType::Admin,
            _ => ApiKeyType::Proxy,
        },
        scope_keys: row.get("scope_keys"),
        actor_id: row.get("actor_id"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        last_used_at: row.get("last_used_at"),
        revoked_at: row.get("revoked_at"),
    })
}

fn scopes_from_value(v: Value) -> Result<ScopeMap> {
    serde_json::from_value(v).context("decode change scopes")
}

/// Serde-derived wire string for a unit enum variant (`"push"`, `"relay"`, …).
fn enum_str<T: serde::Serialize>(v: &T) -> Result<String> {
    match serde_json::to_value(v).context("enum encode failed")? {
        Value::String(s) => Ok(s),
        other => anyhow::bail!("enum did not encode to a string: {other}"),
    }
}

fn enum_from_str<T: serde::de::DeserializeOwned>(s: String) -> Result<T> {
    serde_json::from_value(Value::String(s)).context("enum decode failed")
}
