//! In-memory connection index.
//!
//! Three maps, all keyed partition-first: client → connections, scope key →
//! clients, scope key → presence entries. One `RwLock` guards them; fan-out
//! iterates under the read guard and sends are `try_send` (a full mailbox
//! drops the frame; the client resyncs on its next pull).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use syncular_schemas::{
    ChangeDelta, ErrorCode, PartitionId, PresenceAction, PresenceBroadcast, ServerFrame,
    SyncError, SyncWake,
};
use syncular_scope::PartitionedScopeKey;

/// Bounded per-connection mailbox; a slow consumer loses frames, not the
/// whole server.
pub const CONNECTION_MAILBOX: usize = 64;

#[derive(Debug, Clone)]
pub struct RegistryLimits {
    pub max_connections_total: usize,
    pub max_connections_per_client: usize,
    pub inline_changes_max_bytes: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_connections_total: 5000,
            max_connections_per_client: 3,
            inline_changes_max_bytes: 64 * 1024,
        }
    }
}

#[derive(Default)]
pub struct NotifyOptions<'a> {
    pub exclude_client_ids: &'a [String],
    pub changes: Option<&'a [ChangeDelta]>,
    pub actor_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

type ClientKey = (String, String); // (partition, client_id)

struct ConnectionEntry {
    client: ClientKey,
    tx: mpsc::Sender<ServerFrame>,
}

#[derive(Clone)]
struct PresenceEntry {
    metadata: Option<Value>,
}

#[derive(Default)]
struct RegistryInner {
    next_conn_id: u64,
    connections: BTreeMap<u64, ConnectionEntry>,
    by_client: BTreeMap<ClientKey, BTreeSet<u64>>,
    client_scopes: BTreeMap<ClientKey, BTreeSet<PartitionedScopeKey>>,
    by_scope: BTreeMap<PartitionedScopeKey, BTreeSet<ClientKey>>,
    presence: BTreeMap<PartitionedScopeKey, BTreeMap<ClientKey, PresenceEntry>>,
}

pub struct ConnectionRegistry {
    limits: RegistryLimits,
    inner: RwLock<RegistryInner>,
}

/// Removal token returned by [`ConnectionRegistry::register`]. Unregister is
/// explicit and idempotent; sessions call it from their close path.
#[derive(Debug)]
pub struct ConnectionHandle {
    conn_id: u64,
    client: ClientKey,
    registered: bool,
}

impl ConnectionRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            limits,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    // -- registration -------------------------------------------------------

    pub async fn register(
        &self,
        partition: &PartitionId,
        client_id: &str,
        tx: mpsc::Sender<ServerFrame>,
        initial_scope_keys: Vec<PartitionedScopeKey>,
    ) -> Result<ConnectionHandle, SyncError> {
        let mut inner = self.inner.write().await;
        let client: ClientKey = (partition.as_str().to_string(), client_id.to_string());

        // Cap checks happen before any mutation so a refusal leaves no
        // partial state behind.
        if inner.connections.len() >= self.limits.max_connections_total {
            return Err(SyncError::new(
                ErrorCode::WebsocketConnectionLimitTotal,
                format!(
                    "instance connection limit of {} reached",
                    self.limits.max_connections_total
                ),
            ));
        }
        let client_conns = inner.by_client.get(&client).map(|s| s.len()).unwrap_or(0);
        if client_conns >= self.limits.max_connections_per_client {
            return Err(SyncError::new(
                ErrorCode::WebsocketConnectionLimitClient,
                format!(
                    "client '{client_id}' already holds {client_conns} connections"
                ),
            ));
        }

        inner.next_conn_id += 1;
        let conn_id = inner.next_conn_id;
        inner.connections.insert(
            conn_id,
            ConnectionEntry {
                client: client.clone(),
                tx,
            },
        );
        inner
            .by_client
            .entry(client.clone())
            .or_default()
            .insert(conn_id);
        Self::set_scopes(&mut inner, &client, initial_scope_keys);

        Ok(ConnectionHandle {
            conn_id,
            client,
            registered: true,
        })
    }

    pub async fn unregister(&self, handle: &mut ConnectionHandle) {
        if !handle.registered {
            return;
        }
        handle.registered = false;

        let leaves = {
            let mut inner = self.inner.write().await;
            inner.connections.remove(&handle.conn_id);

            let last_connection = match inner.by_client.get_mut(&handle.client) {
                Some(set) => {
                    set.remove(&handle.conn_id);
                    set.is_empty()
                }
                None => false,
            };
            if !last_connection {
                return;
            }

            // Full disconnect: drop the client from every index and emit a
            // presence leave for each scope it occupied.
            inner.by_client.remove(&handle.client);
            let scopes = inner
                .client_scopes
                .remove(&handle.client)
                .unwrap_or_default();
            for key in &scopes {
                if let Some(clients) = inner.by_scope.get_mut(key) {
                    clients.remove(&handle.client);
                    if clients.is_empty() {
                        inner.by_scope.remove(key);
                    }
                }
            }

            let mut leaves = Vec::new();
            let occupied: Vec<PartitionedScopeKey> = inner
                .presence
                .iter()
                .filter(|(_, members)| members.contains_key(&handle.client))
                .map(|(k, _)| k.clone())
                .collect();
            for key in occupied {
                if let Some(members) = inner.presence.get_mut(&key) {
                    members.remove(&handle.client);
                    if members.is_empty() {
                        inner.presence.remove(&key);
                    }
                }
                leaves.push(key);
            }
            leaves
        };

        for key in leaves {
            self.broadcast_presence(&key, &handle.client, PresenceAction::Leave, None)
                .await;
        }
    }

    /// Replace the subscribed scope set for every connection of a client.
    pub async fn update_client_scope_keys(
        &self,
        partition: &PartitionId,
        client_id: &str,
        keys: Vec<PartitionedScopeKey>,
    ) {
        let mut inner = self.inner.write().await;
        let client: ClientKey = (partition.as_str().to_string(), client_id.to_string());
        if inner.by_client.contains_key(&client) {
            Self::set_scopes(&mut inner, &client, keys);
        }
    }

    fn set_scopes(inner: &mut RegistryInner, client: &ClientKey, keys: Vec<PartitionedScopeKey>) {
        if let Some(old) = inner.client_scopes.remove(client) {
            for key in old {
                if let Some(clients) = inner.by_scope.get_mut(&key) {
                    clients.remove(client);
                    if clients.is_empty() {
                        inner.by_scope.remove(&key);
                    }
                }
            }
        }
        for key in &keys {
            inner
                .by_scope
                .entry(key.clone())
                .or_default()
                .insert(client.clone());
        }
        inner
            .client_scopes
            .insert(client.clone(), keys.into_iter().collect());
    }

    // -- fan-out ------------------------------------------------------------

    /// Wake every connection subscribed to any of `keys`, exactly once per
    /// connection. Changes ride inline when they fit the size policy.
    pub async fn notify_scope_keys(
        &self,
        keys: &[PartitionedScopeKey],
        commit_seq: i64,
        opts: NotifyOptions<'_>,
    ) -> usize {
        let frame = self.wake_frame(commit_seq, &opts);

        let inner = self.inner.read().await;
        let mut targets: BTreeSet<u64> = BTreeSet::new();
        for key in keys {
            let Some(clients) = inner.by_scope.get(key) else {
                continue;
            };
            for client in clients {
                if opts.exclude_client_ids.contains(&client.1) {
                    continue;
                }
                if let Some(conns) = inner.by_client.get(client) {
                    targets.extend(conns.iter().copied());
                }
            }
        }

        let mut delivered = 0;
        for conn_id in targets {
            if let Some(entry) = inner.connections.get(&conn_id) {
                if entry.tx.try_send(frame.clone()).is_ok() {
                    delivered += 1;
                } else {
                    debug!(conn_id, "wake dropped on backpressure");
                }
            }
        }
        delivered
    }

    /// Partition-wide wake used by external data-change notifications.
    pub async fn notify_all_clients(&self, partition: &PartitionId, commit_seq: i64) -> usize {
        let frame = ServerFrame::Sync(SyncWake {
            cursor: commit_seq,
            changes: None,
            actor_id: None,
            created_at: None,
        });
        let inner = self.inner.read().await;
        let mut delivered = 0;
        for entry in inner.connections.values() {
            if entry.client.0 == partition.as_str()
                && entry.tx.try_send(frame.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    fn wake_frame(&self, commit_seq: i64, opts: &NotifyOptions<'_>) -> ServerFrame {
        let inline = opts.changes.and_then(|changes| {
            let size = serde_json::to_vec(changes).map(|b| b.len()).unwrap_or(usize::MAX);
            (size <= self.limits.inline_changes_max_bytes).then(|| changes.to_vec())
        });
        ServerFrame::Sync(SyncWake {
            cursor: commit_seq,
            actor_id: inline.is_some().then(|| opts.actor_id.clone()).flatten(),
            created_at: inline.is_some().then_some(opts.created_at).flatten(),
            changes: inline,
        })
    }

    // -- presence -----------------------------------------------------------

    /// Join is allowed only while the client is authorised for the scope.
    /// Peers (excluding the joiner) receive the join broadcast.
    pub async fn join_presence(
        &self,
        partition: &PartitionId,
        client_id: &str,
        key: &PartitionedScopeKey,
        metadata: Option<Value>,
    ) -> Result<(), SyncError> {
        let client: ClientKey = (partition.as_str().to_string(), client_id.to_string());
        {
            let mut inner = self.inner.write().await;
            let authorised = inner
                .client_scopes
                .get(&client)
                .map(|s| s.contains(key))
                .unwrap_or(false);
            if !authorised {
                return Err(SyncError::forbidden(format!(
                    "client '{client_id}' is not subscribed to '{key}'"
                )));
            }
            inner
                .presence
                .entry(key.clone())
                .or_default()
                .insert(client.clone(), PresenceEntry { metadata: metadata.clone() });
        }
        self.broadcast_presence(key, &client, PresenceAction::Join, metadata)
            .await;
        Ok(())
    }

    pub async fn update_presence_metadata(
        &self,
        partition: &PartitionId,
        client_id: &str,
        key: &PartitionedScopeKey,
        metadata: Option<Value>,
    ) -> Result<(), SyncError> {
        let client: ClientKey = (partition.as_str().to_string(), client_id.to_string());
        {
            let mut inner = self.inner.write().await;
            let Some(entry) = inner
                .presence
                .get_mut(key)
                .and_then(|m| m.get_mut(&client))
            else {
                return Err(SyncError::not_found(format!(
                    "client '{client_id}' has no presence in '{key}'"
                )));
            };
            entry.metadata = metadata.clone();
        }
        self.broadcast_presence(key, &client, PresenceAction::Update, metadata)
            .await;
        Ok(())
    }

    pub async fn leave_presence(
        &self,
        partition: &PartitionId,
        client_id: &str,
        key: &PartitionedScopeKey,
    ) {
        let client: ClientKey = (partition.as_str().to_string(), client_id.to_string());
        let present = {
            let mut inner = self.inner.write().await;
            match inner.presence.get_mut(key) {
                Some(members) => {
                    let removed = members.remove(&client).is_some();
                    if members.is_empty() {
                        inner.presence.remove(key);
                    }
                    removed
                }
                None => false,
            }
        };
        if present {
            self.broadcast_presence(key, &client, PresenceAction::Leave, None)
                .await;
        }
    }

    /// Presence members of a scope, for peers joining late.
    pub async fn presence_members(&self, key: &PartitionedScopeKey) -> Vec<(String, Option<Value>)> {
        let inner = self.inner.read().await;
        inner
            .presence
            .get(key)
            .map(|m| {
                m.iter()
                    .map(|(client, e)| (client.1.clone(), e.metadata.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn broadcast_presence(
        &self,
        key: &PartitionedScopeKey,
        originator: &ClientKey,
        action: PresenceAction,
        metadata: Option<Value>,
    ) {
        let Some(scope_key) = key.scope_key() else { return };
        let frame = ServerFrame::Presence(PresenceBroadcast {
            action,
            scope_key: scope_key.as_str().to_string(),
            client_id: originator.1.clone(),
            metadata,
        });

        let inner = self.inner.read().await;
        let Some(clients) = inner.by_scope.get(key) else {
            return;
        };
        for client in clients {
            if client == originator {
                continue;
            }
            if let Some(conns) = inner.by_client.get(client) {
                for conn_id in conns {
                    if let Some(entry) = inner.connections.get(conn_id) {
                        let _ = entry.tx.try_send(frame.clone());
                    }
                }
            }
        }
    }

    // -- console helpers ----------------------------------------------------

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn client_connection_count(&self, partition: &PartitionId, client_id: &str) -> usize {
        let inner = self.inner.read().await;
        inner
            .by_client
            .get(&(partition.as_str().to_string(), client_id.to_string()))
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Evict a client: drop all of its connections from the index. Sessions
    /// notice their mailbox sender is gone and close the socket.
    pub async fn close_client(&self, partition: &PartitionId, client_id: &str) -> usize {
        let conn_ids = {
            let inner = self.inner.read().await;
            inner
                .by_client
                .get(&(partition.as_str().to_string(), client_id.to_string()))
                .map(|s| s.iter().copied().collect::<Vec<_>>())
                .unwrap_or_default()
        };
        let mut closed = 0;
        for conn_id in &conn_ids {
            let mut handle = ConnectionHandle {
                conn_id: *conn_id,
                client: (partition.as_str().to_string(), client_id.to_string()),
                registered: true,
            };
            self.unregister(&mut handle).await;
            closed += 1;
        }
        closed
    }
}
