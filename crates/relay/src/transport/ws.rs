// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket endpoint — command envelopes in, responses and subscribed
//! session events out.
//!
//! Each inbound frame is executed on its own task so a slow command
//! never blocks the socket; responses are funneled back through a
//! per-connection channel and interleave with event fan-out.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::command::{CommandEnvelope, CommandResponse};
use crate::error::ErrorCode;
use crate::events::{Outbound, SubscriberId};
use crate::transport::auth;
use crate::RelayState;

/// Query parameters for the relay WebSocket.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Auth token.
    pub token: Option<String>,
    /// Comma-separated session ids to subscribe to, or "all" (default).
    #[serde(default = "default_sessions")]
    pub sessions: String,
}

fn default_sessions() -> String {
    "all".to_owned()
}

/// `GET /ws` — WebSocket upgrade for the RPC + event stream.
pub async fn ws_handler(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let query_str = query.token.as_ref().map(|t| format!("token={t}")).unwrap_or_default();
    if auth::validate_ws_query(&query_str, state.config.auth_token.as_deref()).is_err() {
        return axum::http::Response::builder()
            .status(401)
            .body(axum::body::Body::from("unauthorized"))
            .unwrap_or_default()
            .into_response();
    }

    ws.on_upgrade(move |socket| handle_connection(state, query, socket)).into_response()
}

fn parse_session_filter(sessions: &str) -> Option<HashSet<String>> {
    if sessions == "all" {
        return None;
    }
    Some(
        sessions
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

/// Per-connection loop: demux inbound commands, mux outbound responses
/// and events.
async fn handle_connection(state: Arc<RelayState>, query: WsQuery, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let hub = state.manager.hub();
    let (subscriber_id, mut event_rx) = hub.add(parse_session_filter(&query.sessions)).await;
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    loop {
        tokio::select! {
            Some(json) = out_rx.recv() => {
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            frame = event_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Ok(json) = serde_json::to_string(&Outbound::Event(frame)) {
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let state = Arc::clone(&state);
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            handle_frame(state, out_tx, subscriber_id, text.to_string()).await;
                        });
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(err = %e, "websocket receive failed");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    hub.remove(subscriber_id).await;
}

/// Execute one inbound frame and push the response back.
async fn handle_frame(
    state: Arc<RelayState>,
    out_tx: mpsc::UnboundedSender<String>,
    subscriber_id: SubscriberId,
    text: String,
) {
    let command = match serde_json::from_str::<CommandEnvelope>(&text) {
        Ok(command) => command,
        Err(e) => {
            let echoed = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(ToOwned::to_owned))
                .unwrap_or_else(|| "unknown".to_owned());
            let resp = CommandResponse::failure(
                None,
                &echoed,
                ErrorCode::ValidationError,
                format!("invalid command envelope: {e}"),
            );
            send_response(&out_tx, resp);
            return;
        }
    };

    let response = state.manager.execute(command.clone()).await;

    // Connection-scoped subscription bookkeeping: creating a session
    // subscribes its creator, switching repoints the subscription.
    if response.success {
        let hub = state.manager.hub();
        match command.command.as_str() {
            "create_session" => {
                let created = response
                    .data
                    .as_ref()
                    .and_then(|d| d.get("sessionId"))
                    .and_then(|v| v.as_str());
                if let Some(session_id) = created {
                    hub.subscribe_session(subscriber_id, session_id).await;
                }
            }
            "switch_session" => {
                if let Some(session_id) = &command.session_id {
                    hub.set_sessions(
                        subscriber_id,
                        Some(HashSet::from([session_id.clone()])),
                    )
                    .await;
                }
            }
            _ => {}
        }
    }

    send_response(&out_tx, response);
}

fn send_response(out_tx: &mpsc::UnboundedSender<String>, response: CommandResponse) {
    if let Ok(json) = serde_json::to_string(&Outbound::Response(response)) {
        let _ = out_tx.send(json);
    }
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
