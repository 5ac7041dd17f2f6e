//! Connection caps leave no partial state behind; presence joins require an
//! active subscription and leaves fire on full disconnect.

use serde_json::json;
use tokio::sync::mpsc;

use syncular_realtime::{ConnectionRegistry, RegistryLimits};
use syncular_schemas::{ErrorCode, PartitionId, PresenceAction, ServerFrame};
use syncular_scope::{PartitionedScopeKey, ScopeKey};

fn pkey(prefix: &str, value: &str) -> PartitionedScopeKey {
    PartitionedScopeKey::new(&PartitionId::default(), &ScopeKey::new(prefix, value))
}

async fn connect(
    registry: &ConnectionRegistry,
    client: &str,
    keys: Vec<PartitionedScopeKey>,
) -> Result<
    (
        syncular_realtime::ConnectionHandle,
        mpsc::Receiver<ServerFrame>,
    ),
    syncular_schemas::SyncError,
> {
    let (tx, rx) = mpsc::channel(16);
    registry
        .register(&PartitionId::default(), client, tx, keys)
        .await
        .map(|h| (h, rx))
}

#[tokio::test]
async fn per_client_cap_is_enforced_and_frees_on_unregister() {
    let registry = ConnectionRegistry::new(RegistryLimits {
        max_connections_per_client: 1,
        ..RegistryLimits::default()
    });

    let (mut h1, _rx1) = connect(&registry, "c1", vec![]).await.unwrap();
    let err = connect(&registry, "c1", vec![]).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::WebsocketConnectionLimitClient);

    // The refused register left nothing behind: count is still 1 and after
    // unregistering the first socket the client can connect again.
    assert_eq!(
        registry
            .client_connection_count(&PartitionId::default(), "c1")
            .await,
        1
    );
    registry.unregister(&mut h1).await;
    assert!(connect(&registry, "c1", vec![]).await.is_ok());
}

#[tokio::test]
async fn total_cap_is_enforced() {
    let registry = ConnectionRegistry::new(RegistryLimits {
        max_connections_total: 2,
        ..RegistryLimits::default()
    });
    let (_h1, _r1) = connect(&registry, "c1", vec![]).await.unwrap();
    let (_h2, _r2) = connect(&registry, "c2", vec![]).await.unwrap();
    let err = connect(&registry, "c3", vec![]).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::WebsocketConnectionLimitTotal);
    assert_eq!(registry.connection_count().await, 2);
}

#[tokio::test]
async fn unregister_is_idempotent() {
    let registry = ConnectionRegistry::new(RegistryLimits::default());
    let (mut h, _rx) = connect(&registry, "c1", vec![]).await.unwrap();
    registry.unregister(&mut h).await;
    registry.unregister(&mut h).await;
    assert_eq!(registry.connection_count().await, 0);
}

#[tokio::test]
async fn presence_join_requires_scope_subscription() {
    let registry = ConnectionRegistry::new(RegistryLimits::default());
    let key = pkey("room", "r1");
    let (_h, _rx) = connect(&registry, "c1", vec![]).await.unwrap();

    let err = registry
        .join_presence(&PartitionId::default(), "c1", &key, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn presence_broadcasts_to_peers_not_the_originator() {
    let registry = ConnectionRegistry::new(RegistryLimits::default());
    let key = pkey("room", "r1");
    let (_h1, mut rx1) = connect(&registry, "c1", vec![key.clone()]).await.unwrap();
    let (_h2, mut rx2) = connect(&registry, "c2", vec![key.clone()]).await.unwrap();

    registry
        .join_presence(
            &PartitionId::default(),
            "c1",
            &key,
            Some(json!({ "name": "Alice" })),
        )
        .await
        .unwrap();

    assert!(rx1.try_recv().is_err(), "joiner gets no echo");
    match rx2.try_recv().unwrap() {
        ServerFrame::Presence(p) => {
            assert_eq!(p.action, PresenceAction::Join);
            assert_eq!(p.client_id, "c1");
            assert_eq!(p.scope_key, "room:r1");
            assert_eq!(p.metadata.unwrap()["name"], "Alice");
        }
        other => panic!("expected presence frame, got {other:?}"),
    }

    let members = registry.presence_members(&key).await;
    assert_eq!(members.len(), 1);
}

#[tokio::test]
async fn full_disconnect_emits_leave_for_every_occupied_scope() {
    let registry = ConnectionRegistry::new(RegistryLimits::default());
    let room = pkey("room", "r1");
    let doc = pkey("doc", "d1");
    let (mut h1, _rx1) = connect(&registry, "c1", vec![room.clone(), doc.clone()])
        .await
        .unwrap();
    let (_h2, mut rx2) = connect(&registry, "c2", vec![room.clone(), doc.clone()])
        .await
        .unwrap();

    registry
        .join_presence(&PartitionId::default(), "c1", &room, None)
        .await
        .unwrap();
    registry
        .join_presence(&PartitionId::default(), "c1", &doc, None)
        .await
        .unwrap();
    // Drain c2's join frames.
    while rx2.try_recv().is_ok() {}

    registry.unregister(&mut h1).await;

    let mut leave_scopes = Vec::new();
    while let Ok(frame) = rx2.try_recv() {
        if let ServerFrame::Presence(p) = frame {
            assert_eq!(p.action, PresenceAction::Leave);
            leave_scopes.push(p.scope_key);
        }
    }
    leave_scopes.sort();
    assert_eq!(leave_scopes, vec!["doc:d1".to_string(), "room:r1".to_string()]);
    assert!(registry.presence_members(&room).await.is_empty());
}
