//! In-memory [`Storage`] implementation.
//!
//! Semantics mirror the Postgres gateway method for method: dense per-
//! partition sequences, idempotent replay, advance-only cursors, actor
//! immutability, age-then-count event retention. State lives behind one
//! `tokio::sync::RwLock`; "transactions" are just the write guard.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use syncular_db::{
    ConflictInfo, CursorWrite, IngestOutcome, NewCommit, RequestEventFilter, SnapshotPage,
    SnapshotRow, Storage,
};
use syncular_schemas::{
    ApiKey, Change, ChangeOp, ClientCursor, Commit, CommitWithChanges, LatencyStats,
    OperationEvent, Page, PartitionId, PayloadSnapshot, RequestEvent, SnapshotChunk, SyncStats,
    TimelineItem, TimelineKind, TimeseriesBucket,
};

const ACTIVE_CURSOR_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone)]
struct StoredChange {
    change: Change,
    scope_keys: Vec<String>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemState {
    next_seq: BTreeMap<String, i64>,
    commits: BTreeMap<(String, i64), Commit>,
    changes: BTreeMap<(String, i64, i64), StoredChange>,
    cursors: BTreeMap<(String, String), ClientCursor>,
    chunks: BTreeMap<String, SnapshotChunk>,
    request_events: Vec<RequestEvent>,
    payloads: BTreeMap<String, PayloadSnapshot>,
    operations: Vec<OperationEvent>,
    api_keys: BTreeMap<Uuid, ApiKey>,
}

#[derive(Default)]
pub struct MemStorage {
    state: RwLock<MemState>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored commit rows, across all partitions. Test helper.
    pub async fn commit_row_count(&self) -> usize {
        self.state.read().await.commits.len()
    }
}

fn latest_version(state: &MemState, p: &str, table: &str, row_id: &str) -> Option<i64> {
    state
        .changes
        .iter()
        .filter(|((sp, _, _), sc)| {
            sp == p && sc.change.table == table && sc.change.row_id == row_id
        })
        .map(|(_, sc)| sc.change.row_version)
        .last()
}

#[async_trait]
impl Storage for MemStorage {
    async fn ingest_commit(&self, nc: NewCommit) -> Result<IngestOutcome> {
        let mut st = self.state.write().await;
        let p = nc.partition_id.as_str().to_string();

        if let Some(existing) = st
            .commits
            .values()
            .find(|c| {
                c.partition_id.as_str() == p
                    && c.client_id == nc.client_id
                    && c.client_commit_id == nc.client_commit_id
            })
            .cloned()
        {
            return Ok(IngestOutcome::Applied {
                commit: existing,
                replayed: true,
                change_versions: Vec::new(),
            });
        }

        if let Some(cur) = st.cursors.get(&(p.clone(), nc.client_id.clone())) {
            if cur.actor_id != nc.actor_id {
                return Ok(IngestOutcome::ActorMismatch {
                    existing_actor: cur.actor_id.clone(),
                });
            }
        }

        let mut conflicts = Vec::new();
        let mut next_versions = Vec::with_capacity(nc.changes.len());
        for (idx, ch) in nc.changes.iter().enumerate() {
            let current = latest_version(&st, &p, &ch.table, &ch.row_id);
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
            return Ok(IngestOutcome::VersionConflict { conflicts });
        }

        let seq = {
            let counter = st.next_seq.entry(p.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let created_at = Utc::now();

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

        let commit = Commit {
            commit_seq: seq,
            partition_id: nc.partition_id.clone(),
            actor_id: nc.actor_id.clone(),
            client_id: nc.client_id.clone(),
            client_commit_id: nc.client_commit_id.clone(),
            created_at,
            change_count: nc.changes.len() as i64,
            affected_tables,
        };
        st.commits.insert((p.clone(), seq), commit.clone());

        for (idx, ch) in nc.changes.into_iter().enumerate() {
            st.changes.insert(
                (p.clone(), seq, idx as i64),
                StoredChange {
                    change: Change {
                        change_id: idx as i64,
                        commit_seq: seq,
                        table: ch.table,
                        row_id: ch.row_id,
                        op: ch.op,
                        row_json: ch.row_json,
                        row_version: next_versions[idx],
                        scopes: ch.scopes,
                    },
                    scope_keys: ch.scope_keys,
                    created_at,
                },
            );
        }

        let entry = st
            .cursors
            .entry((p, nc.client_id.clone()))
            .or_insert_with(|| ClientCursor {
                partition_id: nc.partition_id.clone(),
                client_id: nc.client_id.clone(),
                actor_id: nc.actor_id.clone(),
                cursor: 0,
                effective_scopes: Vec::new(),
                updated_at: created_at,
            });
        entry.cursor = entry.cursor.max(seq);
        entry.effective_scopes = nc.effective_scopes;
        entry.updated_at = created_at;

        Ok(IngestOutcome::Applied {
            commit,
            replayed: false,
            change_versions: next_versions,
        })
    }

    async fn get_commit(
        &self,
        partition: Option<&PartitionId>,
        commit_seq: i64,
    ) -> Result<Option<CommitWithChanges>> {
        let st = self.state.read().await;
        let commit = st
            .commits
            .values()
            .find(|c| {
                c.commit_seq == commit_seq
                    && partition.map(|p| c.partition_id == *p).unwrap_or(true)
            })
            .cloned();
        let Some(commit) = commit else { return Ok(None) };

        let p = commit.partition_id.as_str().to_string();
        let changes = st
            .changes
            .range((p.clone(), commit_seq, 0)..=(p, commit_seq, i64::MAX))
            .map(|(_, sc)| sc.change.clone())
            .collect();
        Ok(Some(CommitWithChanges { commit, changes }))
    }

    async fn commits_after(
        &self,
        partition: &PartitionId,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<CommitWithChanges>> {
        let st = self.state.read().await;
        let p = partition.as_str().to_string();
        let mut out = Vec::new();
        for ((_, seq), commit) in st
            .commits
            .range((p.clone(), after_seq + 1)..=(p.clone(), i64::MAX))
            .take(limit.max(0) as usize)
        {
            let changes = st
                .changes
                .range((p.clone(), *seq, 0)..=(p.clone(), *seq, i64::MAX))
                .map(|(_, sc)| sc.change.clone())
                .collect();
            out.push(CommitWithChanges {
                commit: commit.clone(),
                changes,
            });
        }
        Ok(out)
    }

    async fn list_commits(
        &self,
        partition: Option<&PartitionId>,
        offset: i64,
        limit: i64,
    ) -> Result<Page<Commit>> {
        let st = self.state.read().await;
        let mut items: Vec<Commit> = st
            .commits
            .values()
            .filter(|c| partition.map(|p| c.partition_id == *p).unwrap_or(true))
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.commit_seq.cmp(&a.commit_seq))
        });
        let total = items.len() as i64;
        let items = items
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn max_commit_seq(&self, partition: &PartitionId) -> Result<Option<i64>> {
        let st = self.state.read().await;
        Ok(st
            .commits
            .values()
            .filter(|c| c.partition_id == *partition)
            .map(|c| c.commit_seq)
            .max())
    }

    async fn scope_keys_for_commit(
        &self,
        partition: &PartitionId,
        commit_seq: i64,
    ) -> Result<Vec<String>> {
        let st = self.state.read().await;
        let p = partition.as_str().to_string();
        let mut keys: Vec<String> = st
            .changes
            .range((p.clone(), commit_seq, 0)..=(p, commit_seq, i64::MAX))
            .flat_map(|(_, sc)| sc.scope_keys.clone())
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn snapshot_rows(
        &self,
        partition: &PartitionId,
        table: &str,
        scope_keys: &[String],
        after_row_id: Option<&str>,
        limit: i64,
    ) -> Result<SnapshotPage> {
        let st = self.state.read().await;
        let p = partition.as_str();

        // Latest change per row_id, ordered by row_id.
        let mut latest: BTreeMap<&str, &StoredChange> = BTreeMap::new();
        for ((sp, _, _), sc) in st.changes.iter() {
            if sp != p || sc.change.table != table {
                continue;
            }
            if let Some(after) = after_row_id {
                if sc.change.row_id.as_str() <= after {
                    continue;
                }
            }
            // BTreeMap iteration is seq-ascending, so later wins.
            latest.insert(sc.change.row_id.as_str(), sc);
        }

        let scanned: Vec<&StoredChange> =
            latest.into_values().take(limit.max(0) as usize).collect();
        let exhausted = (scanned.len() as i64) < limit;
        let scanned_last_row_id = scanned.last().map(|sc| sc.change.row_id.clone());

        let rows = scanned
            .into_iter()
            .filter(|sc| sc.change.op != ChangeOp::Delete)
            .filter(|sc| {
                scope_keys.is_empty() || sc.scope_keys.iter().any(|k| scope_keys.contains(k))
            })
            .map(|sc| SnapshotRow {
                row_id: sc.change.row_id.clone(),
                row_json: sc.change.row_json.clone(),
                row_version: sc.change.row_version,
                scopes: sc.change.scopes.clone(),
            })
            .collect();

        Ok(SnapshotPage {
            rows,
            scanned_last_row_id,
            exhausted,
        })
    }

    async fn get_cursor(
        &self,
        partition: &PartitionId,
        client_id: &str,
    ) -> Result<Option<ClientCursor>> {
        let st = self.state.read().await;
        Ok(st
            .cursors
            .get(&(partition.as_str().to_string(), client_id.to_string()))
            .cloned())
    }

    async fn upsert_cursor(
        &self,
        partition: &PartitionId,
        client_id: &str,
        actor_id: &str,
        cursor: i64,
        effective_scopes: &[String],
    ) -> Result<CursorWrite> {
        let mut st = self.state.write().await;
        let key = (partition.as_str().to_string(), client_id.to_string());
        match st.cursors.get_mut(&key) {
            Some(existing) => {
                if existing.actor_id != actor_id {
                    return Ok(CursorWrite::ActorMismatch {
                        existing_actor: existing.actor_id.clone(),
                    });
                }
                existing.cursor = existing.cursor.max(cursor);
                existing.effective_scopes = effective_scopes.to_vec();
                existing.updated_at = Utc::now();
                Ok(CursorWrite::Updated(existing.clone()))
            }
            None => {
                let row = ClientCursor {
                    partition_id: partition.clone(),
                    client_id: client_id.to_string(),
                    actor_id: actor_id.to_string(),
                    cursor,
                    effective_scopes: effective_scopes.to_vec(),
                    updated_at: Utc::now(),
                };
                st.cursors.insert(key, row.clone());
                Ok(CursorWrite::Updated(row))
            }
        }
    }

    async fn list_cursors(
        &self,
        partition: Option<&PartitionId>,
        offset: i64,
        limit: i64,
    ) -> Result<Page<ClientCursor>> {
        let st = self.state.read().await;
        let mut items: Vec<ClientCursor> = st
            .cursors
            .values()
            .filter(|c| partition.map(|p| c.partition_id == *p).unwrap_or(true))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let total = items.len() as i64;
        let items = items
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn delete_client(&self, partition: &PartitionId, client_id: &str) -> Result<bool> {
        let mut st = self.state.write().await;
        Ok(st
            .cursors
            .remove(&(partition.as_str().to_string(), client_id.to_string()))
            .is_some())
    }

    async fn put_chunk(&self, chunk: SnapshotChunk) -> Result<()> {
        let mut st = self.state.write().await;
        st.chunks.insert(chunk.chunk_id.clone(), chunk);
        Ok(())
    }

    async fn get_chunk(&self, chunk_id: &str) -> Result<Option<SnapshotChunk>> {
        let st = self.state.read().await;
        Ok(st.chunks.get(chunk_id).cloned())
    }

    async fn delete_expired_chunks(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut st = self.state.write().await;
        let before = st.chunks.len();
        st.chunks.retain(|_, c| c.expires_at > now);
        Ok((before - st.chunks.len()) as u64)
    }

    async fn invalidate_chunks(&self, partition: &PartitionId, tables: &[String]) -> Result<u64> {
        let mut st = self.state.write().await;
        let before = st.chunks.len();
        st.chunks
            .retain(|_, c| !(c.partition_id == *partition && tables.contains(&c.table)));
        Ok((before - st.chunks.len()) as u64)
    }

    async fn insert_request_event(&self, event: RequestEvent) -> Result<()> {
        let mut st = self.state.write().await;
        st.request_events.push(event);
        Ok(())
    }

    async fn list_request_events(
        &self,
        filter: &RequestEventFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Page<RequestEvent>> {
        let st = self.state.read().await;
        let mut items: Vec<RequestEvent> = st
            .request_events
            .iter()
            .filter(|e| {
                filter
                    .partition_id
                    .as_ref()
                    .map(|p| e.partition_id == *p)
                    .unwrap_or(true)
                    && filter.event_type.map(|t| e.event_type == t).unwrap_or(true)
                    && filter
                        .client_id
                        .as_ref()
                        .map(|c| &e.client_id == c)
                        .unwrap_or(true)
                    && filter
                        .actor_id
                        .as_ref()
                        .map(|a| &e.actor_id == a)
                        .unwrap_or(true)
                    && filter.outcome.map(|o| e.outcome == o).unwrap_or(true)
                    && filter.since.map(|s| e.created_at >= s).unwrap_or(true)
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = items.len() as i64;
        let items = items
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn get_request_event(&self, event_id: Uuid) -> Result<Option<RequestEvent>> {
        let st = self.state.read().await;
        Ok(st
            .request_events
            .iter()
            .find(|e| e.event_id == event_id)
            .cloned())
    }

    async fn prune_request_events(
        &self,
        older_than: DateTime<Utc>,
        max_rows: i64,
    ) -> Result<u64> {
        let mut st = self.state.write().await;
        let before = st.request_events.len();
        st.request_events.retain(|e| e.created_at >= older_than);
        st.request_events
            .sort_by(|a, b| b.created_at.cmp(&a.created_at));
        st.request_events.truncate(max_rows.max(0) as usize);
        Ok((before - st.request_events.len()) as u64)
    }

    async fn put_payload_snapshot(&self, snapshot: PayloadSnapshot) -> Result<()> {
        let mut st = self.state.write().await;
        st.payloads.insert(snapshot.payload_ref.clone(), snapshot);
        Ok(())
    }

    async fn get_payload_snapshot(&self, payload_ref: &str) -> Result<Option<PayloadSnapshot>> {
        let st = self.state.read().await;
        Ok(st.payloads.get(payload_ref).cloned())
    }

    async fn delete_unreferenced_payload_snapshots(&self) -> Result<u64> {
        let mut st = self.state.write().await;
        let referenced: Vec<String> = st
            .request_events
            .iter()
            .filter_map(|e| e.payload_ref.clone())
            .collect();
        let before = st.payloads.len();
        st.payloads.retain(|r, _| referenced.contains(r));
        Ok((before - st.payloads.len()) as u64)
    }

    async fn insert_operation_event(&self, event: OperationEvent) -> Result<()> {
        let mut st = self.state.write().await;
        st.operations.push(event);
        Ok(())
    }

    async fn list_operation_events(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Page<OperationEvent>> {
        let st = self.state.read().await;
        let mut items = st.operations.clone();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = items.len() as i64;
        let items = items
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn get_operation_event(&self, operation_id: Uuid) -> Result<Option<OperationEvent>> {
        let st = self.state.read().await;
        Ok(st
            .operations
            .iter()
            .find(|o| o.operation_id == operation_id)
            .cloned())
    }

    async fn prune_operation_events(
        &self,
        older_than: DateTime<Utc>,
        max_rows: i64,
    ) -> Result<u64> {
        let mut st = self.state.write().await;
        let before = st.operations.len();
        st.operations.retain(|e| e.created_at >= older_than);
        st.operations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        st.operations.truncate(max_rows.max(0) as usize);
        Ok((before - st.operations.len()) as u64)
    }

    async fn min_active_cursor(
        &self,
        partition: &PartitionId,
        active_since: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let st = self.state.read().await;
        Ok(st
            .cursors
            .values()
            .filter(|c| c.partition_id == *partition && c.updated_at >= active_since)
            .map(|c| c.cursor)
            .min())
    }

    async fn max_seq_before(
        &self,
        partition: &PartitionId,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let st = self.state.read().await;
        Ok(st
            .commits
            .values()
            .filter(|c| c.partition_id == *partition && c.created_at < cutoff)
            .map(|c| c.commit_seq)
            .max())
    }

    async fn count_prunable(
        &self,
        partition: &PartitionId,
        watermark: i64,
        keep_newest: i64,
    ) -> Result<i64> {
        let st = self.state.read().await;
        Ok(prunable_seqs(&st, partition, watermark, keep_newest).len() as i64)
    }

    async fn delete_commits_le(
        &self,
        partition: &PartitionId,
        watermark: i64,
        keep_newest: i64,
    ) -> Result<u64> {
        let mut st = self.state.write().await;
        let doomed = prunable_seqs(&st, partition, watermark, keep_newest);
        let p = partition.as_str().to_string();
        for seq in &doomed {
            st.commits.remove(&(p.clone(), *seq));
            let keys: Vec<(String, i64, i64)> = st
                .changes
                .range((p.clone(), *seq, 0)..=(p.clone(), *seq, i64::MAX))
                .map(|(k, _)| k.clone())
                .collect();
            for k in keys {
                st.changes.remove(&k);
            }
        }
        Ok(doomed.len() as u64)
    }

    async fn compact_changes(
        &self,
        partition: &PartitionId,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut st = self.state.write().await;
        let p = partition.as_str();

        let mut latest: BTreeMap<(String, String), (i64, i64)> = BTreeMap::new();
        for ((sp, seq, cid), sc) in st.changes.iter() {
            if sp != p {
                continue;
            }
            latest.insert(
                (sc.change.table.clone(), sc.change.row_id.clone()),
                (*seq, *cid),
            );
        }

        let doomed: Vec<(String, i64, i64)> = st
            .changes
            .iter()
            .filter(|((sp, seq, cid), sc)| {
                sp == p
                    && sc.created_at < cutoff
                    && latest
                        .get(&(sc.change.table.clone(), sc.change.row_id.clone()))
                        .map(|newest| *newest != (*seq, *cid))
                        .unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            st.changes.remove(k);
        }
        Ok(doomed.len() as u64)
    }

    async fn sync_stats(&self, partition: Option<&PartitionId>) -> Result<SyncStats> {
        let st = self.state.read().await;
        let active_since = Utc::now() - Duration::hours(ACTIVE_CURSOR_WINDOW_HOURS);

        let commits: Vec<&Commit> = st
            .commits
            .values()
            .filter(|c| partition.map(|p| c.partition_id == *p).unwrap_or(true))
            .collect();
        let change_count = st
            .changes
            .iter()
            .filter(|((sp, _, _), _)| {
                partition.map(|p| sp == p.as_str()).unwrap_or(true)
            })
            .count() as i64;
        let cursors: Vec<&ClientCursor> = st
            .cursors
            .values()
            .filter(|c| partition.map(|p| c.partition_id == *p).unwrap_or(true))
            .collect();
        let active: Vec<&&ClientCursor> = cursors
            .iter()
            .filter(|c| c.updated_at >= active_since)
            .collect();

        Ok(SyncStats {
            commit_count: commits.len() as i64,
            change_count,
            client_count: cursors.len() as i64,
            active_client_count: active.len() as i64,
            min_commit_seq: commits.iter().map(|c| c.commit_seq).min(),
            max_commit_seq: commits.iter().map(|c| c.commit_seq).max(),
            min_active_cursor: active.iter().map(|c| c.cursor).min(),
            max_active_cursor: active.iter().map(|c| c.cursor).max(),
        })
    }

    async fn timeseries(
        &self,
        partition: Option<&PartitionId>,
        since: DateTime<Utc>,
        bucket_secs: i64,
    ) -> Result<Vec<TimeseriesBucket>> {
        let st = self.state.read().await;
        let mut buckets: BTreeMap<i64, TimeseriesBucket> = BTreeMap::new();
        let mut counts: BTreeMap<i64, i64> = BTreeMap::new();

        for e in st.request_events.iter().filter(|e| {
            e.created_at >= since
                && partition.map(|p| e.partition_id == *p).unwrap_or(true)
        }) {
            let epoch = e.created_at.timestamp() / bucket_secs * bucket_secs;
            let bucket = buckets.entry(epoch).or_insert_with(|| TimeseriesBucket {
                timestamp: DateTime::from_timestamp(epoch, 0).unwrap_or(e.created_at),
                push_count: 0,
                pull_count: 0,
                error_count: 0,
                avg_latency_ms: 0.0,
            });
            match e.event_type {
                syncular_schemas::RequestEventType::Push => bucket.push_count += 1,
                syncular_schemas::RequestEventType::Pull => bucket.pull_count += 1,
            }
            if !matches!(e.response_status, syncular_schemas::ResponseStatus::Success) {
                bucket.error_count += 1;
            }
            let n = counts.entry(epoch).or_insert(0);
            bucket.avg_latency_ms =
                (bucket.avg_latency_ms * (*n as f64) + e.duration_ms as f64) / (*n + 1) as f64;
            *n += 1;
        }

        Ok(buckets.into_values().collect())
    }

    async fn latency_percentiles(&self, partition: Option<&PartitionId>) -> Result<LatencyStats> {
        let st = self.state.read().await;
        let mut samples: Vec<i64> = st
            .request_events
            .iter()
            .filter(|e| partition.map(|p| e.partition_id == *p).unwrap_or(true))
            .map(|e| e.duration_ms)
            .collect();
        samples.sort_unstable();
        let pct = |q: f64| -> f64 {
            if samples.is_empty() {
                return 0.0;
            }
            let idx = ((samples.len() - 1) as f64 * q).round() as usize;
            samples[idx] as f64
        };
        Ok(LatencyStats {
            p50_ms: pct(0.5),
            p90_ms: pct(0.9),
            p99_ms: pct(0.99),
            sample_count: samples.len() as i64,
        })
    }

    async fn timeline(
        &self,
        partition: Option<&PartitionId>,
        offset: i64,
        limit: i64,
    ) -> Result<Page<TimelineItem>> {
        let st = self.state.read().await;
        let mut items: Vec<TimelineItem> = Vec::new();

        for c in st
            .commits
            .values()
            .filter(|c| partition.map(|p| c.partition_id == *p).unwrap_or(true))
        {
            items.push(TimelineItem {
                kind: TimelineKind::Commit,
                local_id: c.commit_seq.to_string(),
                timestamp: c.created_at,
                actor_id: Some(c.actor_id.clone()),
                client_id: Some(c.client_id.clone()),
                detail: None,
            });
        }
        for e in st
            .request_events
            .iter()
            .filter(|e| partition.map(|p| e.partition_id == *p).unwrap_or(true))
        {
            items.push(TimelineItem {
                kind: TimelineKind::Event,
                local_id: e.event_id.to_string(),
                timestamp: e.created_at,
                actor_id: Some(e.actor_id.clone()),
                client_id: Some(e.client_id.clone()),
                detail: None,
            });
        }

        items.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(b.local_id.cmp(&a.local_id))
        });
        let total = items.len() as i64;
        let items = items
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn insert_api_key(&self, key: ApiKey) -> Result<()> {
        let mut st = self.state.write().await;
        st.api_keys.insert(key.key_id, key);
        Ok(())
    }

    async fn get_api_key(&self, key_id: Uuid) -> Result<Option<ApiKey>> {
        let st = self.state.read().await;
        Ok(st.api_keys.get(&key_id).cloned())
    }

    async fn get_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>> {
        let st = self.state.read().await;
        Ok(st
            .api_keys
            .values()
            .find(|k| k.key_hash == key_hash)
            .cloned())
    }

    async fn list_api_keys(&self, offset: i64, limit: i64) -> Result<Page<ApiKey>> {
        let st = self.state.read().await;
        let mut items: Vec<ApiKey> = st.api_keys.values().cloned().collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = items.len() as i64;
        let items = items
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn touch_api_key_last_used(&self, key_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut st = self.state.write().await;
        if let Some(k) = st.api_keys.get_mut(&key_id) {
            k.last_used_at = Some(now);
        }
        Ok(())
    }

    async fn revoke_api_key(&self, key_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut st = self.state.write().await;
        match st.api_keys.get_mut(&key_id) {
            Some(k) if k.revoked_at.is_none() => {
                k.revoked_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn prunable_seqs(
    st: &MemState,
    partition: &PartitionId,
    watermark: i64,
    keep_newest: i64,
) -> Vec<i64> {
    let mut seqs: Vec<i64> = st
        .commits
        .values()
        .filter(|c| c.partition_id == *partition)
        .map(|c| c.commit_seq)
        .collect();
    seqs.sort_unstable();
    let keep_from = seqs.len().saturating_sub(keep_newest.max(0) as usize);
    let kept: Vec<i64> = seqs[keep_from..].to_vec();
    seqs.into_iter()
        .filter(|s| *s <= watermark && !kept.contains(s))
        .collect()
}
