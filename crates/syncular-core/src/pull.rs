//! Pull Planner: streams delta commits per subscription and builds bootstrap
//! snapshot chunks for fresh subscriptions.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use syncular_config::SyncConfig;
use syncular_db::{SnapshotRow, Storage};
use syncular_schemas::{
    BootstrapState, ChangeDelta, CommitDelta, ErrorCode, PullRequest, PullResponse, SnapshotRef,
    SubscriptionRequest, SubscriptionResult, SubscriptionStatus, SyncError, BOOTSTRAP_CURSOR,
};
use syncular_scope::{
    change_matches, HandlerRegistry, ScopeKey, ScopeResolution,
};

use crate::chunk::encode_chunk;
use crate::ingest::SyncContext;

#[derive(Debug, Clone)]
pub struct PullOutcome {
    pub response: PullResponse,
    /// Union of effective scope keys across subscriptions, for the realtime
    /// registry's subscription index.
    pub effective_scope_keys: Vec<ScopeKey>,
}

pub struct PullPlanner {
    storage: Arc<dyn Storage>,
    handlers: HandlerRegistry,
    cfg: SyncConfig,
}

impl PullPlanner {
    pub fn new(storage: Arc<dyn Storage>, handlers: HandlerRegistry, cfg: SyncConfig) -> Self {
        Self {
            storage,
            handlers,
            cfg,
        }
    }

    pub async fn pull(
        &self,
        ctx: &SyncContext,
        req: &PullRequest,
    ) -> Result<PullOutcome, SyncError> {
        if req.subscriptions.len() as i64 > self.cfg.max_subscriptions {
            return Err(SyncError::invalid_request(format!(
                "{} subscriptions exceed the limit of {}",
                req.subscriptions.len(),
                self.cfg.max_subscriptions
            )));
        }
        {
            let mut seen = BTreeSet::new();
            for s in &req.subscriptions {
                if !seen.insert(s.id.as_str()) {
                    return Err(SyncError::invalid_request(format!(
                        "duplicate subscription id '{}'",
                        s.id
                    )));
                }
            }
        }

        let limit_commits = req
            .limit_commits
            .unwrap_or(self.cfg.limit_commits_default)
            .clamp(1, self.cfg.limit_commits_max);
        let limit_snapshot_rows = req
            .limit_snapshot_rows
            .unwrap_or(self.cfg.limit_snapshot_rows_default)
            .clamp(1, self.cfg.limit_snapshot_rows_max);
        let max_snapshot_pages = req
            .max_snapshot_pages
            .unwrap_or(self.cfg.max_snapshot_pages_max)
            .clamp(1, self.cfg.max_snapshot_pages_max);
        let dedupe_rows = req.dedupe_rows.unwrap_or(false);

        let mut results = Vec::with_capacity(req.subscriptions.len());
        let mut all_effective: BTreeSet<ScopeKey> = BTreeSet::new();
        let mut emitted_rows: BTreeSet<(String, String)> = BTreeSet::new();
        let mut cursor_candidates: Vec<i64> = Vec::new();

        for sub in &req.subscriptions {
            let Some(handler) = self.handlers.get(&sub.table) else {
                return Err(SyncError::invalid_subscription(format!(
                    "no handler for table '{}'",
                    sub.table
                )));
            };

            let effective = match handler
                .resolve_scopes(&ctx.principal, &sub.scopes, sub.params.as_ref())
                .await
            {
                ScopeResolution::Granted(keys) => keys,
                ScopeResolution::Denied => {
                    return Err(SyncError::new(
                        ErrorCode::InvalidSubscription,
                        format!(
                            "subscription '{}' requests scopes outside the allowed set",
                            sub.id
                        ),
                    ));
                }
                ScopeResolution::Revoked => {
                    results.push(SubscriptionResult {
                        id: sub.id.clone(),
                        status: SubscriptionStatus::Revoked,
                        bootstrap: false,
                        next_cursor: sub.cursor,
                        commits: Vec::new(),
                        snapshots: None,
                        bootstrap_state: None,
                    });
                    continue;
                }
            };
            all_effective.extend(effective.iter().cloned());

            let result = if sub.cursor == BOOTSTRAP_CURSOR {
                self.bootstrap(
                    ctx,
                    sub,
                    &effective,
                    limit_snapshot_rows,
                    max_snapshot_pages,
                    dedupe_rows.then_some(&mut emitted_rows),
                )
                .await?
            } else {
                self.incremental(ctx, sub, &effective, limit_commits).await?
            };

            if result.next_cursor >= 0 {
                cursor_candidates.push(result.next_cursor);
            }
            results.push(result);
        }

        let effective_scope_keys: Vec<ScopeKey> = all_effective.into_iter().collect();

        // Cursor bookkeeping happens off the response path. The cursor is
        // shared across subscriptions, so the safe advance is the minimum.
        if let Some(candidate) = cursor_candidates.into_iter().min() {
            let storage = Arc::clone(&self.storage);
            let partition = ctx.partition.clone();
            let client_id = ctx.client_id.clone();
            let actor_id = ctx.principal.actor_id.clone();
            let scopes: Vec<String> = effective_scope_keys
                .iter()
                .map(|k| k.as_str().to_string())
                .collect();
            tokio::spawn(async move {
                if let Err(e) = storage
                    .upsert_cursor(&partition, &client_id, &actor_id, candidate, &scopes)
                    .await
                {
                    warn!(client_id = %client_id, error = %e, "cursor update failed");
                }
            });
        }

        Ok(PullOutcome {
            response: PullResponse {
                subscriptions: results,
            },
            effective_scope_keys,
        })
    }

    async fn bootstrap(
        &self,
        ctx: &SyncContext,
        sub: &SubscriptionRequest,
        effective: &BTreeSet<ScopeKey>,
        limit_snapshot_rows: i64,
        max_snapshot_pages: i64,
        mut dedupe: Option<&mut BTreeSet<(String, String)>>,
    ) -> Result<SubscriptionResult, SyncError> {
        let (token, snapshot_cursor, mut last_row_id, mut page, expires_at) =
            match &sub.bootstrap_state {
                Some(bs) => {
                    if bs.token.is_empty() {
                        return Err(SyncError::invalid_request("empty bootstrap token"));
                    }
                    // Past the chunk TTL the earlier pages may already be
                    // garbage-collected; the client restarts from scratch.
                    if bs.expires_at.is_some_and(|e| e <= chrono::Utc::now()) {
                        return Err(SyncError::new(
                            ErrorCode::ChunkExpired,
                            format!("bootstrap for subscription '{}' expired", sub.id),
                        ));
                    }
                    (
                        bs.token.clone(),
                        bs.cursor,
                        bs.last_row_id.clone(),
                        bs.page,
                        bs.expires_at,
                    )
                }
                None => {
                    let seq = self
                        .storage
                        .max_commit_seq(&ctx.partition)
                        .await
                        .map_err(internal)?
                        .unwrap_or(0);
                    let ttl = chrono::Duration::seconds(self.cfg.snapshot_chunk_ttl_secs);
                    (
                        Uuid::new_v4().to_string(),
                        seq,
                        None,
                        0,
                        Some(chrono::Utc::now() + ttl),
                    )
                }
            };

        let scope_key_strings: Vec<String> =
            effective.iter().map(|k| k.as_str().to_string()).collect();

        let mut snapshots: Vec<SnapshotRef> = Vec::new();
        let mut complete = false;

        for _ in 0..max_snapshot_pages {
            let fetched = self
                .storage
                .snapshot_rows(
                    &ctx.partition,
                    &sub.table,
                    &scope_key_strings,
                    last_row_id.as_deref(),
                    limit_snapshot_rows,
                )
                .await
                .map_err(internal)?;

            let rows: Vec<SnapshotRow> = match dedupe.as_deref_mut() {
                Some(seen) => fetched
                    .rows
                    .into_iter()
                    .filter(|r| seen.insert((sub.table.clone(), r.row_id.clone())))
                    .collect(),
                None => fetched.rows,
            };

            if !rows.is_empty() {
                let encoded = encode_chunk(
                    &ctx.partition,
                    &sub.table,
                    &rows,
                    self.cfg.snapshot_chunk_ttl_secs,
                )
                .map_err(internal)?;
                snapshots.push(SnapshotRef {
                    chunk_id: encoded.chunk.chunk_id.clone(),
                    sha256: encoded.chunk.sha256.clone(),
                    byte_length: encoded.chunk.byte_length,
                    encoding: encoded.chunk.encoding.clone(),
                    compression: encoded.chunk.compression.clone(),
                    row_count: encoded.row_count,
                });
                self.storage
                    .put_chunk(encoded.chunk)
                    .await
                    .map_err(internal)?;
            }

            if let Some(scanned) = fetched.scanned_last_row_id {
                last_row_id = Some(scanned);
            }
            page += 1;
            if fetched.exhausted {
                complete = true;
                break;
            }
        }

        Ok(SubscriptionResult {
            id: sub.id.clone(),
            status: SubscriptionStatus::Active,
            bootstrap: true,
            next_cursor: if complete {
                snapshot_cursor
            } else {
                BOOTSTRAP_CURSOR
            },
            commits: Vec::new(),
            snapshots: Some(snapshots),
            bootstrap_state: if complete {
                None
            } else {
                Some(BootstrapState {
                    token,
                    cursor: snapshot_cursor,
                    last_row_id,
                    page,
                    expires_at,
                })
            },
        })
    }

    async fn incremental(
        &self,
        ctx: &SyncContext,
        sub: &SubscriptionRequest,
        effective: &BTreeSet<ScopeKey>,
        limit_commits: i64,
    ) -> Result<SubscriptionResult, SyncError> {
        let mut commits: Vec<CommitDelta> = Vec::new();
        let mut scanned_to = sub.cursor;
        let mut exhausted = false;

        'outer: while (commits.len() as i64) < limit_commits {
            let batch = self
                .storage
                .commits_after(&ctx.partition, scanned_to, limit_commits)
                .await
                .map_err(internal)?;
            if batch.is_empty() {
                exhausted = true;
                break;
            }
            let batch_len = batch.len() as i64;

            for cwc in batch {
                scanned_to = cwc.commit.commit_seq;
                let matching: Vec<ChangeDelta> = cwc
                    .changes
                    .iter()
                    .filter(|c| change_matches(&c.scopes, effective))
                    .map(|c| ChangeDelta {
                        table: c.table.clone(),
                        row_id: c.row_id.clone(),
                        op: c.op,
                        row_json: c.row_json.clone(),
                        row_version: c.row_version,
                        scopes: c.scopes.clone(),
                    })
                    .collect();
                if matching.is_empty() {
                    continue;
                }
                commits.push(CommitDelta {
                    commit_seq: cwc.commit.commit_seq,
                    actor_id: cwc.commit.actor_id.clone(),
                    client_id: cwc.commit.client_id.clone(),
                    created_at: cwc.commit.created_at,
                    changes: matching,
                });
                if commits.len() as i64 >= limit_commits {
                    break 'outer;
                }
            }

            if batch_len < limit_commits {
                exhausted = true;
                break;
            }
        }

        // When the scan drained the log, advance past non-matching commits
        // too; otherwise stop at the last returned commit so nothing is
        // skipped on the next page.
        let next_cursor = if exhausted {
            scanned_to.max(sub.cursor)
        } else {
            commits
                .last()
                .map(|c| c.commit_seq)
                .unwrap_or(sub.cursor)
        };

        Ok(SubscriptionResult {
            id: sub.id.clone(),
            status: SubscriptionStatus::Active,
            bootstrap: false,
            next_cursor,
            commits,
            snapshots: None,
            bootstrap_state: None,
        })
    }
}

fn internal(e: anyhow::Error) -> SyncError {
    SyncError::internal(format!("{e:#}"))
}
