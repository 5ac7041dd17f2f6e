//! Replaying a push with the same `(clientId, clientCommitId)` returns the
//! original commit seq and writes exactly one commit row.

use std::sync::Arc;

use serde_json::json;
use syncular_core::{CommitIngestor, SyncContext};
use syncular_db::Storage;
use syncular_schemas::{ChangeOp, PartitionId, PushOperation, PushRequest, PushStatus};
use syncular_scope::{HandlerRegistry, PrincipalScopeHandler};
use syncular_testkit::{principal, MemStorage};

fn registry() -> HandlerRegistry {
    let mut r = HandlerRegistry::new();
    r.register(Arc::new(PrincipalScopeHandler::new("tasks")));
    r
}

fn ctx(client: &str) -> SyncContext {
    SyncContext {
        partition: PartitionId::default(),
        principal: principal("actor-1", &["user:u1"]),
        client_id: client.to_string(),
    }
}

fn push_req(commit_id: &str) -> PushRequest {
    PushRequest {
        client_commit_id: commit_id.to_string(),
        schema_version: 1,
        operations: vec![PushOperation {
            table: "tasks".to_string(),
            row_id: "t1".to_string(),
            op: ChangeOp::Upsert,
            payload: json!({ "id": "t1", "title": "A", "user_id": "u1" }),
            row_version: None,
        }],
    }
}

#[tokio::test]
async fn replay_returns_same_commit_seq() {
    let storage = Arc::new(MemStorage::new());
    let ingestor = CommitIngestor::new(storage.clone() as Arc<dyn Storage>, registry(), 200);

    let first = ingestor.push(&ctx("c1"), &push_req("x1")).await.unwrap();
    assert_eq!(first.response.status, PushStatus::Applied);
    let seq = first.response.commit_seq.unwrap();
    assert!(!first.replayed);

    let second = ingestor.push(&ctx("c1"), &push_req("x1")).await.unwrap();
    assert_eq!(second.response.status, PushStatus::Applied);
    assert_eq!(second.response.commit_seq, Some(seq));
    assert!(second.replayed);

    assert_eq!(storage.commit_row_count().await, 1, "no duplicate commit row");
}

#[tokio::test]
async fn distinct_commit_ids_get_dense_increasing_seqs() {
    let storage = Arc::new(MemStorage::new());
    let ingestor = CommitIngestor::new(storage.clone() as Arc<dyn Storage>, registry(), 200);

    let mut last = 0;
    for i in 0..5 {
        let out = ingestor
            .push(&ctx("c1"), &push_req(&format!("commit-{i}")))
            .await
            .unwrap();
        let seq = out.response.commit_seq.unwrap();
        assert_eq!(seq, last + 1, "commit_seq must be dense");
        last = seq;
    }
}

#[tokio::test]
async fn second_actor_on_same_client_id_is_refused() {
    let storage = Arc::new(MemStorage::new());
    let ingestor = CommitIngestor::new(storage.clone() as Arc<dyn Storage>, registry(), 200);

    ingestor.push(&ctx("c1"), &push_req("x1")).await.unwrap();

    let mut other = ctx("c1");
    other.principal = principal("actor-2", &["user:u1"]);
    let err = ingestor.push(&other, &push_req("x2")).await.unwrap_err();
    assert_eq!(err.code, syncular_schemas::ErrorCode::Forbidden);
}

#[tokio::test]
async fn emitted_scope_keys_come_from_row_payloads() {
    let storage = Arc::new(MemStorage::new());
    let ingestor = CommitIngestor::new(storage.clone() as Arc<dyn Storage>, registry(), 200);

    let out = ingestor.push(&ctx("c1"), &push_req("x1")).await.unwrap();
    let keys: Vec<&str> = out
        .emitted_scope_keys
        .iter()
        .map(|k| k.as_str())
        .collect();
    assert_eq!(keys, vec!["user:u1"]);
    assert_eq!(out.affected_tables, vec!["tasks".to_string()]);
}
