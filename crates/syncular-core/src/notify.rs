//! External data-change notification: out-of-band pipeline writes advance
//! `commit_seq` through a synthetic commit with no change rows and drop the
//! snapshot chunks the stale tables produced.

use std::sync::Arc;

use anyhow::{bail, Result};
use uuid::Uuid;

use syncular_db::{IngestOutcome, NewCommit, Storage};
use syncular_schemas::{NotifyDataChangeResult, PartitionId};

pub const NOTIFY_ACTOR: &str = "system";
pub const NOTIFY_CLIENT: &str = "system:notify";

pub async fn notify_data_change(
    storage: &Arc<dyn Storage>,
    partition: &PartitionId,
    tables: &[String],
) -> Result<NotifyDataChangeResult> {
    let outcome = storage
        .ingest_commit(NewCommit {
            partition_id: partition.clone(),
            actor_id: NOTIFY_ACTOR.to_string(),
            client_id: NOTIFY_CLIENT.to_string(),
            client_commit_id: Uuid::new_v4().to_string(),
            changes: Vec::new(),
            effective_scopes: Vec::new(),
            affected_tables: Some(tables.to_vec()),
        })
        .await?;

    let commit_seq = match outcome {
        IngestOutcome::Applied { commit, .. } => commit.commit_seq,
        other => bail!("synthetic commit was not applied: {other:?}"),
    };

    let chunks_invalidated = storage.invalidate_chunks(partition, tables).await?;

    Ok(NotifyDataChangeResult {
        commit_seq,
        chunks_invalidated: chunks_invalidated as i64,
    })
}
