//! Live events fan-in: one upstream WebSocket bridges N downstream
//! `/console/events/live` sockets. Everything except `connected` and
//! `heartbeat` frames relays upward with `instanceId` injected; a downstream
//! failure becomes an `instance_error` envelope and the session stays open.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use syncular_config::InstanceConfig;

use crate::instances::select_instances;
use crate::routes::GatewayQuery;
use crate::state::{upstream_bearer, GatewayError, GatewayState};

pub(crate) async fn events_live(
    State(st): State<Arc<GatewayState>>,
    Query(q): Query<GatewayQuery>,
    headers: axum::http::HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let instances: Vec<InstanceConfig> = match select_instances(&st.cfg, &q.selector()) {
        Ok(selected) => selected.into_iter().cloned().collect(),
        Err(e) => return GatewayError(e).into_response(),
    };
    let bearer = upstream_bearer(&headers).map(str::to_string);

    upgrade.on_upgrade(move |socket| run_fan_in(socket, instances, bearer))
}

async fn run_fan_in(upstream: WebSocket, instances: Vec<InstanceConfig>, bearer: Option<String>) {
    let (mut up_tx, mut up_rx) = upstream.split();
    let (agg_tx, mut agg_rx) = mpsc::channel::<String>(256);

    let mut workers = Vec::new();
    for instance in instances {
        let agg = agg_tx.clone();
        let bearer = bearer.clone();
        workers.push(tokio::spawn(async move {
            relay_instance(instance, bearer, agg).await;
        }));
    }
    drop(agg_tx);

    loop {
        tokio::select! {
            frame = agg_rx.recv() => {
                match frame {
                    Some(text) => {
                        if up_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break, // every downstream ended
                }
            }
            inbound = up_rx.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {} // upstream pings and stray frames are ignored
                }
            }
        }
    }

    for worker in workers {
        worker.abort();
    }
    let _ = up_tx.close().await;
}

/// Connect one downstream instance and pump its frames into the aggregate
/// channel. Any failure emits an `instance_error` envelope and ends this
/// worker only.
async fn relay_instance(
    instance: InstanceConfig,
    upstream_bearer: Option<String>,
    agg: mpsc::Sender<String>,
) {
    let ws_url = format!(
        "{}/console/events/live",
        instance
            .base_url
            .trim_end_matches('/')
            .replacen("http", "ws", 1)
    );

    let request = match build_request(&ws_url, &instance, upstream_bearer.as_deref()) {
        Ok(r) => r,
        Err(e) => {
            warn!(instance = %instance.instance_id, error = %e, "bad live-events url");
            let _ = agg.send(instance_error(&instance.instance_id)).await;
            return;
        }
    };

    let (mut socket, _) = match connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(instance = %instance.instance_id, error = %e, "live-events connect failed");
            let _ = agg.send(instance_error(&instance.instance_id)).await;
            return;
        }
    };

    while let Some(message) = socket.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                let Ok(mut value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                // Connection chrome stays local to each instance.
                match value.get("type").and_then(Value::as_str) {
                    Some("connected") | Some("heartbeat") => continue,
                    _ => {}
                }
                inject_instance_id(&mut value, &instance.instance_id);
                if agg.send(value.to_string()).await.is_err() {
                    return; // upstream went away
                }
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Binary(_))
            | Ok(WsMessage::Frame(_)) => {}
            Ok(WsMessage::Close(_)) | Err(_) => break,
        }
    }

    let _ = agg.send(instance_error(&instance.instance_id)).await;
}

fn build_request(
    url: &str,
    instance: &InstanceConfig,
    upstream_bearer: Option<&str>,
) -> anyhow::Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = url.into_client_request()?;
    if let Some(token) = instance.token.as_deref().or(upstream_bearer) {
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {token}").parse()?,
        );
    }
    Ok(request)
}

fn inject_instance_id(value: &mut Value, instance_id: &str) {
    match value.get_mut("data") {
        Some(Value::Object(data)) => {
            data.insert("instanceId".into(), json!(instance_id));
        }
        _ => {
            if let Value::Object(map) = value {
                map.insert("data".into(), json!({ "instanceId": instance_id }));
            }
        }
    }
}

fn instance_error(instance_id: &str) -> String {
    json!({
        "type": "instance_error",
        "instanceId": instance_id,
        "timestamp": Utc::now().to_rfc3339(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_is_injected_into_data() {
        let mut v = json!({ "type": "commit", "data": { "commitSeq": 4 } });
        inject_instance_id(&mut v, "alpha");
        assert_eq!(v["data"]["instanceId"], "alpha");
        assert_eq!(v["data"]["commitSeq"], 4);

        let mut bare = json!({ "type": "commit" });
        inject_instance_id(&mut bare, "beta");
        assert_eq!(bare["data"]["instanceId"], "beta");
    }

    #[test]
    fn error_envelope_shape() {
        let v: Value = serde_json::from_str(&instance_error("alpha")).unwrap();
        assert_eq!(v["type"], "instance_error");
        assert_eq!(v["instanceId"], "alpha");
        assert!(v["timestamp"].as_str().is_some());
    }
}
