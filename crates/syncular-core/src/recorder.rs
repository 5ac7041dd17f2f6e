//! Request Event Recorder: every push and pull, success or failure, becomes
//! a request-event row. Writes go through a bounded channel to a dedicated
//! writer task so the hot path never waits on storage.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use syncular_db::Storage;
use syncular_schemas::{
    PartitionId, PayloadSnapshot, RequestEvent, RequestEventType, RequestOutcome, ResponseStatus,
    SyncPath, TransportPath,
};

use crate::trace::TraceContext;

const CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Draft
// ---------------------------------------------------------------------------

/// Everything a transport handler knows about one push/pull lifecycle.
/// `into_event` derives the stored classification.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub partition: PartitionId,
    pub request_id: String,
    pub trace: TraceContext,
    pub event_type: RequestEventType,
    pub sync_path: SyncPath,
    pub transport_path: TransportPath,
    pub actor_id: String,
    pub client_id: String,
    pub status_code: u16,
    pub outcome: RequestOutcome,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: i64,
    pub commit_seq: Option<i64>,
    pub operation_count: Option<i64>,
    pub row_count: Option<i64>,
    pub subscription_count: Option<i64>,
    pub scopes_summary: Option<String>,
    pub tables: Option<Vec<String>>,
}

impl EventDraft {
    fn into_event(self, payload_ref: Option<String>) -> RequestEvent {
        RequestEvent {
            event_id: Uuid::new_v4(),
            partition_id: self.partition,
            request_id: self.request_id,
            trace_id: self.trace.trace_id,
            span_id: self.trace.span_id,
            event_type: self.event_type,
            sync_path: self.sync_path,
            transport_path: self.transport_path,
            actor_id: self.actor_id,
            client_id: self.client_id,
            status_code: i32::from(self.status_code),
            outcome: self.outcome,
            response_status: ResponseStatus::derive(self.status_code, self.outcome),
            error_code: self.error_code,
            error_message: self.error_message,
            duration_ms: self.duration_ms,
            commit_seq: self.commit_seq,
            operation_count: self.operation_count,
            row_count: self.row_count,
            subscription_count: self.subscription_count,
            scopes_summary: self.scopes_summary,
            tables: self.tables,
            payload_ref,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

struct RecorderMsg {
    event: RequestEvent,
    payload: Option<PayloadSnapshot>,
}

#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<RecorderMsg>,
    logged: Arc<Mutex<BTreeSet<String>>>,
    payload_cap: usize,
}

impl RecorderHandle {
    /// Enqueue one lifecycle event. Never blocks: a full channel drops the
    /// event with a log-once warning.
    pub fn record(&self, draft: EventDraft) {
        self.record_with_payloads(draft, None, None)
    }

    /// Like [`record`](Self::record) but also retains the request/response
    /// bodies. Bodies over the cap are replaced by a truncation envelope.
    pub fn record_with_payloads(
        &self,
        draft: EventDraft,
        request_payload: Option<Value>,
        response_payload: Option<Value>,
    ) {
        let payload = if request_payload.is_some() || response_payload.is_some() {
            let payload_ref = format!("pl_{}", Uuid::new_v4().simple());
            Some(PayloadSnapshot {
                payload_ref,
                partition_id: draft.partition.clone(),
                request_payload: request_payload.map(|v| truncate_payload(v, self.payload_cap)),
                response_payload: response_payload.map(|v| truncate_payload(v, self.payload_cap)),
                created_at: Utc::now(),
            })
        } else {
            None
        };

        let event = draft.into_event(payload.as_ref().map(|p| p.payload_ref.clone()));
        let msg = RecorderMsg { event, payload };

        if self.tx.try_send(msg).is_err() {
            self.log_once("recorder-queue-full", "request event dropped, queue full");
        }
    }

    fn log_once(&self, key: &str, message: &str) {
        let mut logged = self.logged.lock().expect("recorder log-once poisoned");
        if logged.insert(key.to_string()) {
            warn!(key, "{message}");
        }
    }
}

/// Start the background writer. The returned join handle finishes once every
/// sender is dropped and the queue is drained, which is the shutdown path.
pub fn spawn_recorder(
    storage: Arc<dyn Storage>,
    payload_cap: usize,
) -> (RecorderHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<RecorderMsg>(CHANNEL_CAPACITY);
    let logged: Arc<Mutex<BTreeSet<String>>> = Arc::new(Mutex::new(BTreeSet::new()));

    let handle = tokio::spawn(async move {
        let mut write_logged: BTreeSet<String> = BTreeSet::new();
        while let Some(msg) = rx.recv().await {
            let mut payload_ref = msg.event.payload_ref.clone();
            if let Some(snapshot) = msg.payload {
                if let Err(e) = storage.put_payload_snapshot(snapshot).await {
                    // Payload failures demote to a null ref; the event itself
                    // still lands.
                    if write_logged.insert("payload-write".to_string()) {
                        warn!(error = %e, "payload snapshot write failed");
                    }
                    payload_ref = None;
                }
            }
            let mut event = msg.event;
            event.payload_ref = payload_ref;
            if let Err(e) = storage.insert_request_event(event).await {
                if write_logged.insert("event-write".to_string()) {
                    warn!(error = %e, "request event write failed");
                }
            }
        }
    });

    (
        RecorderHandle {
            tx,
            logged,
            payload_cap,
        },
        handle,
    )
}

// ---------------------------------------------------------------------------
// Payload truncation
// ---------------------------------------------------------------------------

/// Replace an oversized payload with a
/// `{truncated:true, originalSizeBytes, preview}` envelope.
pub fn truncate_payload(value: Value, cap: usize) -> Value {
    let serialized = value.to_string();
    if serialized.len() <= cap {
        return value;
    }
    let preview: String = serialized.chars().take(cap.min(1024)).collect();
    json!({
        "truncated": true,
        "originalSizeBytes": serialized.len(),
        "preview": preview,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_kept_verbatim() {
        let v = json!({"a": 1});
        assert_eq!(truncate_payload(v.clone(), 1024), v);
    }

    #[test]
    fn oversized_payload_becomes_envelope() {
        let v = json!({ "blob": "x".repeat(4096) });
        let out = truncate_payload(v, 1024);
        assert_eq!(out["truncated"], true);
        assert!(out["originalSizeBytes"].as_u64().unwrap() > 1024);
        assert!(out["preview"].as_str().unwrap().len() <= 1024);
    }
}
