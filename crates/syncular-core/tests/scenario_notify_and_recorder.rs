//! External data-change notification and the background request-event
//! recorder.

use std::sync::Arc;

use serde_json::json;
use syncular_core::{
    notify_data_change, spawn_recorder, CommitIngestor, EventDraft, SyncContext, TraceContext,
};
use syncular_db::Storage;
use syncular_schemas::{
    ChangeOp, PartitionId, PushOperation, PushRequest, RequestEventType, RequestOutcome,
    ResponseStatus, SnapshotChunk, SyncPath, TransportPath,
};
use syncular_scope::{HandlerRegistry, PrincipalScopeHandler};
use syncular_testkit::{principal, MemStorage};

fn chunk(id: &str, table: &str) -> SnapshotChunk {
    SnapshotChunk {
        chunk_id: id.to_string(),
        partition_id: PartitionId::default(),
        table: table.to_string(),
        sha256: "00".repeat(32),
        encoding: "ndjson".into(),
        compression: "gzip".into(),
        byte_length: 0,
        body: Vec::new(),
        expires_at: chrono::Utc::now() + chrono::Duration::minutes(15),
    }
}

#[tokio::test]
async fn notify_advances_seq_and_invalidates_table_chunks() {
    let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());

    // One real commit first so the synthetic one lands at seq 2.
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(PrincipalScopeHandler::new("tasks")));
    let ingestor = CommitIngestor::new(storage.clone(), registry, 200);
    ingestor
        .push(
            &SyncContext {
                partition: PartitionId::default(),
                principal: principal("actor-1", &[]),
                client_id: "c1".into(),
            },
            &PushRequest {
                client_commit_id: "a".into(),
                schema_version: 1,
                operations: vec![PushOperation {
                    table: "tasks".into(),
                    row_id: "t1".into(),
                    op: ChangeOp::Upsert,
                    payload: json!({ "id": "t1", "user_id": "u1" }),
                    row_version: None,
                }],
            },
        )
        .await
        .unwrap();

    storage.put_chunk(chunk("stale", "tasks")).await.unwrap();
    storage.put_chunk(chunk("other", "projects")).await.unwrap();

    let result = notify_data_change(
        &storage,
        &PartitionId::default(),
        &["tasks".to_string()],
    )
    .await
    .unwrap();

    assert_eq!(result.commit_seq, 2);
    assert_eq!(result.chunks_invalidated, 1);
    assert!(storage.get_chunk("stale").await.unwrap().is_none());
    assert!(storage.get_chunk("other").await.unwrap().is_some());

    let commit = storage.get_commit(None, 2).await.unwrap().unwrap();
    assert_eq!(commit.commit.affected_tables, vec!["tasks".to_string()]);
    assert_eq!(commit.commit.change_count, 0);
}

#[tokio::test]
async fn recorder_writes_events_and_payload_snapshots_off_path() {
    let mem = Arc::new(MemStorage::new());
    let storage: Arc<dyn Storage> = mem.clone();
    let (handle, join) = spawn_recorder(storage.clone(), 1024);

    let draft = EventDraft {
        partition: PartitionId::default(),
        request_id: "req-1".into(),
        trace: TraceContext::default(),
        event_type: RequestEventType::Push,
        sync_path: SyncPath::HttpCombined,
        transport_path: TransportPath::Direct,
        actor_id: "actor-1".into(),
        client_id: "c1".into(),
        status_code: 200,
        outcome: RequestOutcome::Applied,
        error_code: None,
        error_message: None,
        duration_ms: 12,
        commit_seq: Some(42),
        operation_count: Some(1),
        row_count: None,
        subscription_count: None,
        scopes_summary: Some("user:u1".into()),
        tables: Some(vec!["tasks".into()]),
    };
    handle.record_with_payloads(
        draft.clone(),
        Some(json!({ "clientId": "c1" })),
        Some(json!({ "blob": "x".repeat(4096) })),
    );

    let mut failed = draft;
    failed.status_code = 400;
    failed.outcome = RequestOutcome::Rejected;
    failed.error_code = Some("INVALID_REQUEST".into());
    handle.record(failed);

    // Dropping the handle ends the writer after the queue drains.
    drop(handle);
    join.await.unwrap();

    let page = storage
        .list_request_events(&Default::default(), 0, 10)
        .await
        .unwrap();
    assert_eq!(page.total, 2);

    let applied = page
        .items
        .iter()
        .find(|e| e.outcome == RequestOutcome::Applied)
        .unwrap();
    assert_eq!(applied.response_status, ResponseStatus::Success);
    assert_eq!(applied.commit_seq, Some(42));
    let payload_ref = applied.payload_ref.clone().expect("payload retained");

    let snapshot = storage
        .get_payload_snapshot(&payload_ref)
        .await
        .unwrap()
        .expect("snapshot stored");
    assert_eq!(snapshot.request_payload.unwrap()["clientId"], "c1");
    // Response body was over the 1 KiB cap and became an envelope.
    let resp = snapshot.response_payload.unwrap();
    assert_eq!(resp["truncated"], true);

    let rejected = page
        .items
        .iter()
        .find(|e| e.outcome == RequestOutcome::Rejected)
        .unwrap();
    assert_eq!(rejected.response_status, ResponseStatus::ClientError);
    assert!(rejected.payload_ref.is_none());
}
