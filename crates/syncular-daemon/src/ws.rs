//! WebSocket session: auth deadline, frame dispatch, heartbeat, and exactly-
//! once unregistration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use syncular_core::{EventDraft, TraceContext};
use syncular_realtime::registry::CONNECTION_MAILBOX;
use syncular_schemas::{
    ClientFrame, ErrorFrame, PartitionId, PresenceAction, Principal, PushResponseFrame,
    PushStatus, RequestEventType, RequestOutcome, ServerFrame, SyncPath, TransportPath,
    WsPushMessage,
};
use syncular_scope::{PartitionedScopeKey, ScopeKey};

use crate::routes::post_commit_effects;
use crate::state::AppState;

/// Close code for sockets that never authenticate.
const CLOSE_UNAUTHENTICATED: u16 = 4001;

pub async fn run_session(
    st: Arc<AppState>,
    socket: WebSocket,
    partition: PartitionId,
    client_id: String,
    preauth: Option<Principal>,
    trace: TraceContext,
) {
    let (mut tx, mut rx) = socket.split();

    // Unauthenticated sockets must present an auth message within the grace
    // window or be closed with 4001.
    let principal = match preauth {
        Some(p) => p,
        None => {
            let grace = Duration::from_secs(st.cfg.unauthenticated_grace_secs);
            match tokio::time::timeout(grace, wait_for_auth(&st, &mut rx)).await {
                Ok(Some(p)) => p,
                _ => {
                    let _ = tx
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_UNAUTHENTICATED,
                            reason: "UNAUTHENTICATED".into(),
                        })))
                        .await;
                    return;
                }
            }
        }
    };

    // Seed the subscription index from the client's stored scopes.
    let initial_keys = initial_scope_keys(&st, &partition, &client_id).await;

    let (mailbox_tx, mut mailbox_rx) = mpsc::channel::<ServerFrame>(CONNECTION_MAILBOX);
    let mut handle = match st
        .registry
        .register(&partition, &client_id, mailbox_tx, initial_keys)
        .await
    {
        Ok(h) => h,
        Err(e) => {
            let _ = send_frame(
                &mut tx,
                &ServerFrame::Error(ErrorFrame {
                    error: e.code.as_str().to_string(),
                    message: Some(e.message),
                    request_id: None,
                }),
            )
            .await;
            let _ = tx.close().await;
            return;
        }
    };

    let mut heartbeat = tokio::time::interval(Duration::from_secs(st.cfg.heartbeat_interval_secs));
    heartbeat.tick().await; // first tick is immediate
    let mut missed_heartbeats: u32 = 0;

    loop {
        tokio::select! {
            frame = mailbox_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    // Registry dropped us (eviction).
                    None => break,
                }
            }
            inbound = rx.next() => {
                let Some(Ok(message)) = inbound else { break };
                missed_heartbeats = 0;
                match message {
                    Message::Text(text) => {
                        if handle_client_frame(&st, &mut tx, &partition, &client_id, &principal, &trace, &text).await.is_err() {
                            break;
                        }
                    }
                    Message::Ping(payload) => {
                        if tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) | Message::Binary(_) => {}
                    Message::Close(_) => break,
                }
            }
            _ = heartbeat.tick() => {
                missed_heartbeats += 1;
                if missed_heartbeats > 2 {
                    debug!(%client_id, "two heartbeats missed, closing");
                    break;
                }
                // Protocol-level ping makes conforming clients answer
                // automatically, which resets the miss counter.
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                let frame = ServerFrame::Heartbeat {
                    ts_millis: chrono::Utc::now().timestamp_millis(),
                };
                if send_frame(&mut tx, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    st.registry.unregister(&mut handle).await;
    let _ = tx.close().await;
}

async fn wait_for_auth(st: &Arc<AppState>, rx: &mut SplitStream<WebSocket>) -> Option<Principal> {
    while let Some(Ok(message)) = rx.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(ClientFrame::Auth(auth)) = serde_json::from_str::<ClientFrame>(&text) else {
            continue;
        };
        match st.authenticator.authenticate(&auth.token).await {
            Ok(Some(principal)) => return Some(principal),
            _ => return None,
        }
    }
    None
}

async fn initial_scope_keys(
    st: &Arc<AppState>,
    partition: &PartitionId,
    client_id: &str,
) -> Vec<PartitionedScopeKey> {
    match st.storage.get_cursor(partition, client_id).await {
        Ok(Some(cursor)) => cursor
            .effective_scopes
            .iter()
            .filter_map(|s| ScopeKey::parse(s))
            .map(|k| PartitionedScopeKey::new(partition, &k))
            .collect(),
        Ok(None) => Vec::new(),
        Err(e) => {
            warn!(error = %e, "cursor lookup for initial scopes failed");
            Vec::new()
        }
    }
}

async fn send_frame(
    tx: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).expect("server frames always serialize");
    tx.send(Message::Text(text)).await
}

#[allow(clippy::too_many_arguments)]
async fn handle_client_frame(
    st: &Arc<AppState>,
    tx: &mut SplitSink<WebSocket, Message>,
    partition: &PartitionId,
    client_id: &str,
    principal: &Principal,
    session_trace: &TraceContext,
    text: &str,
) -> Result<(), axum::Error> {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            return send_frame(
                tx,
                &ServerFrame::Error(ErrorFrame {
                    error: "INVALID_REQUEST".to_string(),
                    message: Some(format!("unparseable frame: {e}")),
                    request_id: None,
                }),
            )
            .await;
        }
    };

    match frame {
        ClientFrame::Auth(_) => Ok(()), // already authenticated
        ClientFrame::Push(push) => {
            handle_ws_push(st, tx, partition, client_id, principal, session_trace, push).await
        }
        ClientFrame::Presence(p) => {
            let Some(key) = ScopeKey::parse(&p.scope_key) else {
                return send_frame(
                    tx,
                    &ServerFrame::Error(ErrorFrame {
                        error: "INVALID_REQUEST".to_string(),
                        message: Some(format!("malformed scope key '{}'", p.scope_key)),
                        request_id: None,
                    }),
                )
                .await;
            };
            let pkey = PartitionedScopeKey::new(partition, &key);
            let outcome = match p.action {
                PresenceAction::Join => {
                    st.registry
                        .join_presence(partition, client_id, &pkey, p.metadata)
                        .await
                }
                PresenceAction::Update => {
                    st.registry
                        .update_presence_metadata(partition, client_id, &pkey, p.metadata)
                        .await
                }
                PresenceAction::Leave => {
                    st.registry.leave_presence(partition, client_id, &pkey).await;
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                return send_frame(
                    tx,
                    &ServerFrame::Error(ErrorFrame {
                        error: e.code.as_str().to_string(),
                        message: Some(e.message),
                        request_id: None,
                    }),
                )
                .await;
            }
            Ok(())
        }
    }
}

async fn handle_ws_push(
    st: &Arc<AppState>,
    tx: &mut SplitSink<WebSocket, Message>,
    partition: &PartitionId,
    client_id: &str,
    principal: &Principal,
    session_trace: &TraceContext,
    message: WsPushMessage,
) -> Result<(), axum::Error> {
    let started = Instant::now();
    let ctx = syncular_core::SyncContext {
        partition: partition.clone(),
        principal: principal.clone(),
        client_id: client_id.to_string(),
    };

    // In-socket trace fields override the upgrade-request context.
    let trace = if message.trace_id.is_some() {
        TraceContext {
            trace_id: message.trace_id.clone(),
            span_id: message.span_id.clone(),
        }
    } else {
        session_trace.clone()
    };

    let mut draft = EventDraft {
        partition: partition.clone(),
        request_id: message.request_id.clone(),
        trace,
        event_type: RequestEventType::Push,
        sync_path: SyncPath::WsPush,
        transport_path: TransportPath::Direct,
        actor_id: principal.actor_id.clone(),
        client_id: client_id.to_string(),
        status_code: 200,
        outcome: RequestOutcome::Applied,
        error_code: None,
        error_message: None,
        duration_ms: 0,
        commit_seq: None,
        operation_count: Some(message.push.operations.len() as i64),
        row_count: None,
        subscription_count: None,
        scopes_summary: None,
        tables: None,
    };

    match st.ingestor.push(&ctx, &message.push).await {
        Ok(outcome) => {
            if !outcome.replayed && outcome.commit.is_some() {
                post_commit_effects(st, &ctx, &outcome).await;
            }
            draft.outcome = match outcome.response.status {
                PushStatus::Applied => RequestOutcome::Applied,
                PushStatus::Conflict => RequestOutcome::Conflict,
                PushStatus::Rejected => RequestOutcome::Rejected,
            };
            draft.commit_seq = outcome.response.commit_seq;
            draft.tables = Some(outcome.affected_tables.clone());
            draft.duration_ms = started.elapsed().as_millis() as i64;
            st.recorder.record(draft);

            send_frame(
                tx,
                &ServerFrame::PushResponse(PushResponseFrame {
                    request_id: message.request_id,
                    response: outcome.response,
                }),
            )
            .await
        }
        Err(e) => {
            draft.status_code = e.code.http_status();
            draft.outcome = RequestOutcome::Error;
            draft.error_code = Some(e.code.as_str().to_string());
            draft.error_message = Some(e.message.clone());
            draft.duration_ms = started.elapsed().as_millis() as i64;
            st.recorder.record(draft);

            send_frame(
                tx,
                &ServerFrame::Error(ErrorFrame {
                    error: e.code.as_str().to_string(),
                    message: Some(e.message),
                    request_id: Some(message.request_id),
                }),
            )
            .await
        }
    }
}
