//! Maintenance Scheduler: debounced prune, compact, and event retention.
//!
//! Each task owns a single-flight gate. Console-invoked prune/compact wait
//! their turn; the traffic-triggered retention pass skips when one is
//! already running and is additionally debounced by `auto_prune_interval_ms`.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use syncular_config::SyncConfig;
use syncular_db::Storage;
use syncular_schemas::{
    CompactResult, EventPruneResult, PartitionId, PrunePreview, PruneResult,
};

pub struct MaintenanceScheduler {
    storage: Arc<dyn Storage>,
    cfg: SyncConfig,
    prune_gate: Mutex<()>,
    compact_gate: Mutex<()>,
    retention_gate: Mutex<()>,
    last_retention: Mutex<Option<Instant>>,
}

impl MaintenanceScheduler {
    pub fn new(storage: Arc<dyn Storage>, cfg: SyncConfig) -> Self {
        Self {
            storage,
            cfg,
            prune_gate: Mutex::new(()),
            compact_gate: Mutex::new(()),
            retention_gate: Mutex::new(()),
            last_retention: Mutex::new(None),
        }
    }

    /// Watermark: the lowest cursor among recently active clients, raised by
    /// the fallback max-age so an abandoned cursor cannot pin history
    /// forever.
    async fn watermark(&self, partition: &PartitionId) -> Result<Option<i64>> {
        let window = Duration::hours(self.cfg.prune_cursor_window_hours);
        let now = Utc::now();

        let min_cursor = self
            .storage
            .min_active_cursor(partition, now - window)
            .await?;
        let age_floor = self.storage.max_seq_before(partition, now - window).await?;

        Ok(match (min_cursor, age_floor) {
            (Some(c), Some(a)) => Some(c.max(a)),
            (Some(c), None) => Some(c),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        })
    }

    pub async fn prune_preview(&self, partition: &PartitionId) -> Result<PrunePreview> {
        let watermark = self.watermark(partition).await?;
        let commits_to_delete = match watermark {
            Some(w) => {
                self.storage
                    .count_prunable(partition, w, self.cfg.keep_newest_commits)
                    .await?
            }
            None => 0,
        };
        Ok(PrunePreview {
            watermark_commit_seq: watermark,
            commits_to_delete,
        })
    }

    pub async fn prune(
        &self,
        partition: &PartitionId,
        keep_newest: Option<i64>,
    ) -> Result<PruneResult> {
        let _flight = self.prune_gate.lock().await;
        let keep = keep_newest.unwrap_or(self.cfg.keep_newest_commits);

        let watermark = self.watermark(partition).await?;
        let deleted = match watermark {
            Some(w) => self.storage.delete_commits_le(partition, w, keep).await?,
            None => 0,
        };
        info!(partition = %partition, ?watermark, deleted, "prune completed");
        Ok(PruneResult {
            watermark_commit_seq: watermark,
            commits_deleted: deleted as i64,
        })
    }

    pub async fn compact(
        &self,
        partition: &PartitionId,
        full_history_hours: Option<i64>,
    ) -> Result<CompactResult> {
        let _flight = self.compact_gate.lock().await;
        let hours = full_history_hours.unwrap_or(self.cfg.full_history_hours);
        let cutoff = Utc::now() - Duration::hours(hours);

        let deleted = self.storage.compact_changes(partition, cutoff).await?;
        info!(partition = %partition, deleted, "compact completed");
        Ok(CompactResult {
            changes_deleted: deleted as i64,
        })
    }

    /// Age-then-count retention over request events, operation events, and
    /// orphaned payload snapshots; expired snapshot chunks ride along.
    pub async fn run_event_retention(&self) -> Result<EventPruneResult> {
        let _flight = self.retention_gate.lock().await;
        let now = Utc::now();

        let request_events_deleted = self
            .storage
            .prune_request_events(
                now - Duration::milliseconds(self.cfg.request_events_max_age_ms),
                self.cfg.request_events_max_rows,
            )
            .await?;
        let operation_events_deleted = self
            .storage
            .prune_operation_events(
                now - Duration::milliseconds(self.cfg.operation_events_max_age_ms),
                self.cfg.operation_events_max_rows,
            )
            .await?;
        let payload_snapshots_deleted = self
            .storage
            .delete_unreferenced_payload_snapshots()
            .await?;
        self.storage.delete_expired_chunks(now).await?;

        Ok(EventPruneResult {
            request_events_deleted: request_events_deleted as i64,
            operation_events_deleted: operation_events_deleted as i64,
            payload_snapshots_deleted: payload_snapshots_deleted as i64,
        })
    }

    /// Traffic-triggered retention: runs at most once per
    /// `auto_prune_interval_ms`, on a detached task, skipping when one is
    /// already in flight.
    pub fn maybe_trigger_retention(self: &Arc<Self>) {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            {
                let mut last = me.last_retention.lock().await;
                let interval =
                    std::time::Duration::from_millis(me.cfg.auto_prune_interval_ms.max(0) as u64);
                if let Some(at) = *last {
                    if at.elapsed() < interval {
                        return;
                    }
                }
                *last = Some(Instant::now());
            }
            if me.retention_gate.try_lock().is_err() {
                return;
            }
            if let Err(e) = me.run_event_retention().await {
                warn!(error = %e, "event retention failed");
            }
        });
    }
}
