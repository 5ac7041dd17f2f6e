//! Commit Ingestor: validates push payloads, materialises row scopes through
//! the table handlers, and applies the commit through the storage gateway's
//! serializable transaction.

use std::sync::Arc;

use syncular_db::{IngestOutcome, NewChange, NewCommit, Storage};
use syncular_schemas::{
    ChangeDelta, Commit, ErrorCode, OperationResult, PartitionId, Principal, PushRequest,
    PushResponse, PushStatus, SyncError,
};
use syncular_scope::{scope_keys_from_map, HandlerRegistry, ScopeKey};

/// Per-request identity shared by push and pull.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub partition: PartitionId,
    pub principal: Principal,
    pub client_id: String,
}

/// Everything a caller needs after a push: the wire response plus the
/// side-effect inputs (wake-up keys, inline change payloads).
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub response: PushResponse,
    pub commit: Option<Commit>,
    pub replayed: bool,
    pub emitted_scope_keys: Vec<ScopeKey>,
    pub affected_tables: Vec<String>,
    /// Change payloads for the inline-or-notify realtime policy.
    pub changes: Vec<ChangeDelta>,
}

pub struct CommitIngestor {
    storage: Arc<dyn Storage>,
    handlers: HandlerRegistry,
    max_operations_per_push: i64,
}

impl CommitIngestor {
    pub fn new(
        storage: Arc<dyn Storage>,
        handlers: HandlerRegistry,
        max_operations_per_push: i64,
    ) -> Self {
        Self {
            storage,
            handlers,
            max_operations_per_push,
        }
    }

    pub async fn push(
        &self,
        ctx: &SyncContext,
        req: &PushRequest,
    ) -> Result<PushOutcome, SyncError> {
        if req.operations.len() as i64 > self.max_operations_per_push {
            return Err(SyncError::new(
                ErrorCode::TooManyOperations,
                format!(
                    "push carries {} operations, limit is {}",
                    req.operations.len(),
                    self.max_operations_per_push
                ),
            ));
        }
        if req.client_commit_id.is_empty() {
            return Err(SyncError::invalid_request("clientCommitId must not be empty"));
        }

        // Validate operations and materialise row scopes before touching
        // storage. Any per-operation validation error rejects the whole push.
        let mut results: Vec<OperationResult> = Vec::with_capacity(req.operations.len());
        let mut changes: Vec<NewChange> = Vec::with_capacity(req.operations.len());
        let mut rejected = false;

        for (idx, op) in req.operations.iter().enumerate() {
            let idx = idx as i64;
            let Some(handler) = self.handlers.get(&op.table) else {
                rejected = true;
                results.push(OperationResult::error(
                    idx,
                    ErrorCode::InvalidRequest.as_str(),
                    format!("no handler for table '{}'", op.table),
                ));
                continue;
            };
            if op.row_id.is_empty() {
                rejected = true;
                results.push(OperationResult::error(
                    idx,
                    ErrorCode::InvalidRequest.as_str(),
                    "row_id must not be empty",
                ));
                continue;
            }

            let scopes = handler.row_scopes(&op.payload);
            let scope_keys: Vec<String> = scope_keys_from_map(&scopes)
                .into_iter()
                .map(|k| k.as_str().to_string())
                .collect();

            results.push(OperationResult::ok(idx));
            changes.push(NewChange {
                table: op.table.clone(),
                row_id: op.row_id.clone(),
                op: op.op,
                row_json: op.payload.clone(),
                expected_version: op.row_version,
                scopes,
                scope_keys,
            });
        }

        if rejected {
            return Ok(PushOutcome {
                response: PushResponse {
                    status: PushStatus::Rejected,
                    ok: false,
                    commit_seq: None,
                    results,
                },
                commit: None,
                replayed: false,
                emitted_scope_keys: Vec::new(),
                affected_tables: Vec::new(),
                changes: Vec::new(),
            });
        }

        let effective_scopes: Vec<String> = ctx.principal.scope_keys.clone();
        let outcome = self
            .storage
            .ingest_commit(NewCommit {
                partition_id: ctx.partition.clone(),
                actor_id: ctx.principal.actor_id.clone(),
                client_id: ctx.client_id.clone(),
                client_commit_id: req.client_commit_id.clone(),
                changes: changes.clone(),
                effective_scopes,
                affected_tables: None,
            })
            .await
            .map_err(|e| SyncError::internal(format!("ingest failed: {e:#}")))?;

        match outcome {
            IngestOutcome::Applied {
                commit,
                replayed,
                change_versions,
            } => {
                let emitted: Vec<ScopeKey> = {
                    let mut keys: Vec<ScopeKey> = changes
                        .iter()
                        .flat_map(|c| scope_keys_from_map(&c.scopes))
                        .collect();
                    keys.sort();
                    keys.dedup();
                    keys
                };
                let deltas: Vec<ChangeDelta> = changes
                    .into_iter()
                    .enumerate()
                    .map(|(i, c)| ChangeDelta {
                        table: c.table,
                        row_id: c.row_id,
                        op: c.op,
                        row_json: c.row_json,
                        row_version: change_versions.get(i).copied().unwrap_or(0),
                        scopes: c.scopes,
                    })
                    .collect();

                Ok(PushOutcome {
                    response: PushResponse {
                        status: PushStatus::Applied,
                        ok: true,
                        commit_seq: Some(commit.commit_seq),
                        results,
                    },
                    affected_tables: commit.affected_tables.clone(),
                    commit: Some(commit),
                    replayed,
                    emitted_scope_keys: emitted,
                    changes: deltas,
                })
            }
            IngestOutcome::VersionConflict { conflicts } => {
                for c in &conflicts {
                    if let Some(r) = results.iter_mut().find(|r| r.op_index == c.op_index) {
                        *r = OperationResult::conflict(
                            c.op_index,
                            format!(
                                "row_version precondition failed: expected {}, found {}",
                                c.expected_version,
                                c.current_version
                                    .map(|v| v.to_string())
                                    .unwrap_or_else(|| "none".to_string())
                            ),
                        );
                    }
                }
                Ok(PushOutcome {
                    response: PushResponse {
                        status: PushStatus::Conflict,
                        ok: false,
                        commit_seq: None,
                        results,
                    },
                    commit: None,
                    replayed: false,
                    emitted_scope_keys: Vec::new(),
                    affected_tables: Vec::new(),
                    changes: Vec::new(),
                })
            }
            IngestOutcome::ActorMismatch { existing_actor } => Err(SyncError::forbidden(format!(
                "client '{}' is bound to actor '{}'",
                ctx.client_id, existing_actor
            ))),
        }
    }
}
