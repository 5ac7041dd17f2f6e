//! Push validation limits and optimistic-concurrency conflicts. A conflict
//! anywhere withholds the whole commit.

use std::sync::Arc;

use serde_json::json;
use syncular_core::{CommitIngestor, SyncContext};
use syncular_db::Storage;
use syncular_schemas::{
    ChangeOp, ErrorCode, OperationStatus, PartitionId, PushOperation, PushRequest, PushStatus,
};
use syncular_scope::{HandlerRegistry, PrincipalScopeHandler};
use syncular_testkit::{principal, MemStorage};

fn setup() -> (Arc<MemStorage>, CommitIngestor) {
    let storage = Arc::new(MemStorage::new());
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(PrincipalScopeHandler::new("tasks")));
    let ingestor = CommitIngestor::new(storage.clone() as Arc<dyn Storage>, registry, 3);
    (storage, ingestor)
}

fn ctx() -> SyncContext {
    SyncContext {
        partition: PartitionId::default(),
        principal: principal("actor-1", &["user:u1"]),
        client_id: "c1".to_string(),
    }
}

fn op(row_id: &str, row_version: Option<i64>) -> PushOperation {
    PushOperation {
        table: "tasks".to_string(),
        row_id: row_id.to_string(),
        op: ChangeOp::Upsert,
        payload: json!({ "id": row_id, "user_id": "u1" }),
        row_version,
    }
}

#[tokio::test]
async fn too_many_operations_is_a_hard_error() {
    let (_, ingestor) = setup();
    let req = PushRequest {
        client_commit_id: "x1".into(),
        schema_version: 1,
        operations: (0..4).map(|i| op(&format!("t{i}"), None)).collect(),
    };
    let err = ingestor.push(&ctx(), &req).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TooManyOperations);
}

#[tokio::test]
async fn unknown_table_rejects_whole_push() {
    let (storage, ingestor) = setup();
    let req = PushRequest {
        client_commit_id: "x1".into(),
        schema_version: 1,
        operations: vec![
            op("t1", None),
            PushOperation {
                table: "nope".to_string(),
                row_id: "r1".to_string(),
                op: ChangeOp::Upsert,
                payload: json!({}),
                row_version: None,
            },
        ],
    };
    let out = ingestor.push(&ctx(), &req).await.unwrap();
    assert_eq!(out.response.status, PushStatus::Rejected);
    assert!(!out.response.ok);
    assert_eq!(out.response.results[0].status, OperationStatus::Ok);
    assert_eq!(out.response.results[1].status, OperationStatus::Error);
    assert_eq!(storage.commit_row_count().await, 0, "nothing applied");
}

#[tokio::test]
async fn version_precondition_conflict_withholds_commit() {
    let (storage, ingestor) = setup();

    // Seed t1 at version 1.
    let seed = PushRequest {
        client_commit_id: "seed".into(),
        schema_version: 1,
        operations: vec![op("t1", None)],
    };
    ingestor.push(&ctx(), &seed).await.unwrap();

    // Expecting version 5 conflicts (current is 1); the t2 op rides along
    // and must not be applied either.
    let req = PushRequest {
        client_commit_id: "x2".into(),
        schema_version: 1,
        operations: vec![op("t1", Some(5)), op("t2", None)],
    };
    let out = ingestor.push(&ctx(), &req).await.unwrap();
    assert_eq!(out.response.status, PushStatus::Conflict);
    assert!(out.response.commit_seq.is_none());
    assert_eq!(out.response.results[0].status, OperationStatus::Conflict);
    assert_eq!(out.response.results[1].status, OperationStatus::Ok);

    assert_eq!(storage.commit_row_count().await, 1, "only the seed commit exists");
}

#[tokio::test]
async fn matching_precondition_applies_and_bumps_version() {
    let (_, ingestor) = setup();

    ingestor
        .push(
            &ctx(),
            &PushRequest {
                client_commit_id: "seed".into(),
                schema_version: 1,
                operations: vec![op("t1", None)],
            },
        )
        .await
        .unwrap();

    let out = ingestor
        .push(
            &ctx(),
            &PushRequest {
                client_commit_id: "x2".into(),
                schema_version: 1,
                operations: vec![op("t1", Some(1))],
            },
        )
        .await
        .unwrap();
    assert_eq!(out.response.status, PushStatus::Applied);
    assert_eq!(out.changes[0].row_version, 2);
}
