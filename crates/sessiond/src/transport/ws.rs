// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket control channel (§6): attach/detach, stdin, resize, history-
//! loaded, and ping/pong, plus every server-to-client broadcast a session
//! emits. Mirrors the teacher's `transport/ws.rs` per-connection
//! `tokio::select!` loop, generalized from a fixed set of broadcast
//! channels to a dynamic set keyed by whichever sessions this connection
//! has attached to.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_stream::StreamMap;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::event::{ClientMessage, ServerEvent};
use crate::session::{Session, Visibility};
use crate::transport::auth;
use crate::transport::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    pub user: Option<String>,
}

/// WebSocket upgrade handler. Auth is a single shared bearer token carried
/// as a query param (browsers cannot set a custom header on the upgrade
/// request itself).
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if let Err(e) = auth::validate_ws_token(query.token.as_deref(), state.config.auth_token.as_deref()) {
        return axum::http::Response::builder()
            .status(e.http_status())
            .body(axum::body::Body::from("unauthorized"))
            .unwrap_or_default()
            .into_response();
    }

    let client_id = Uuid::new_v4().to_string();
    let user = query.user.unwrap_or_else(|| "anonymous".to_string());
    ws.on_upgrade(move |socket| handle_connection(state, socket, client_id, user))
        .into_response()
}

/// Per-connection event loop. `client_streams` carries `Stdout` payloads
/// routed directly to this client (§8: no gaps, no duplicates); every
/// other broadcast a session emits arrives on `broadcast_streams`, one
/// subscription per attached session.
async fn handle_connection(state: AppState, socket: WebSocket, client_id: String, user: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut client_streams: StreamMap<String, UnboundedReceiverStream<ServerEvent>> = StreamMap::new();
    let mut broadcast_streams: StreamMap<String, BroadcastStream<ServerEvent>> = StreamMap::new();
    let mut attached: HashMap<String, Arc<Session>> = HashMap::new();

    loop {
        tokio::select! {
            event = client_streams.next() => {
                let Some((_session_id, payload)) = event else { continue };
                if send_json(&mut ws_tx, &payload).await.is_err() {
                    break;
                }
            }
            event = broadcast_streams.next() => {
                let Some((_session_id, Ok(payload))) = event else { continue };
                if send_json(&mut ws_tx, &payload).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match msg {
                    Message::Text(text) => {
                        let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
                        let client_msg = match parsed {
                            Ok(m) => m,
                            Err(_) => {
                                let err = ws_error(ErrorKind::BadRequest, "invalid message");
                                if send_json(&mut ws_tx, &err).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };
                        if let Some(reply) = handle_client_message(
                            &state,
                            client_msg,
                            &client_id,
                            &user,
                            &mut client_streams,
                            &mut broadcast_streams,
                            &mut attached,
                        )
                        .await
                        {
                            if send_json(&mut ws_tx, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    for (session_id, session) in attached.drain() {
        session.detach(&client_id).await;
        client_streams.remove(&session_id);
        broadcast_streams.remove(&session_id);
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_client_message(
    state: &AppState,
    msg: ClientMessage,
    client_id: &str,
    user: &str,
    client_streams: &mut StreamMap<String, UnboundedReceiverStream<ServerEvent>>,
    broadcast_streams: &mut StreamMap<String, BroadcastStream<ServerEvent>>,
    attached: &mut HashMap<String, Arc<Session>>,
) -> Option<ServerEvent> {
    match msg {
        ClientMessage::Attach { session_id } => {
            let resolved = state.registry.resolve(&session_id).await;
            let Some(session) = state.registry.get(&resolved).await else {
                return Some(ws_error(ErrorKind::NotFound, "session not found"));
            };
            let (history_marker, history_byte_offset, should_load_history, rx) =
                session.attach(client_id.to_string()).await;
            client_streams.insert(resolved.clone(), UnboundedReceiverStream::new(rx));
            broadcast_streams.insert(resolved.clone(), BroadcastStream::new(session.subscribe()));
            attached.insert(resolved.clone(), session);
            Some(ServerEvent::Attached {
                session_id: resolved,
                history_marker,
                history_byte_offset,
                should_load_history,
            })
        }

        ClientMessage::Detach { session_id } => {
            let resolved = state.registry.resolve(&session_id).await;
            if let Some(session) = attached.remove(&resolved) {
                session.detach(client_id).await;
                client_streams.remove(&resolved);
                broadcast_streams.remove(&resolved);
            }
            None
        }

        ClientMessage::DetachClient { session_id, target_client_id } => {
            let resolved = state.registry.resolve(&session_id).await;
            if attached.contains_key(&resolved) {
                if let Some(session) = state.registry.get(&resolved).await {
                    session.detach(&target_client_id).await;
                }
            }
            None
        }

        ClientMessage::HistoryLoaded { session_id } => {
            let resolved = state.registry.resolve(&session_id).await;
            if let Some(session) = attached.get(&resolved) {
                session.history_loaded(client_id).await;
            }
            None
        }

        ClientMessage::Stdin { session_id, data } => {
            let resolved = state.registry.resolve(&session_id).await;
            let Some(session) = attached.get(&resolved) else {
                return Some(ws_error(ErrorKind::Conflict, "not attached to session"));
            };
            let summary = session.summary().await;
            if summary.visibility == Visibility::SharedReadonly && session.owner.as_deref() != Some(user) {
                return Some(ws_error(ErrorKind::Forbidden, "session is shared read-only"));
            }
            let opts = crate::input::InjectOptions {
                data,
                by: user.to_string(),
                source: crate::input::InjectSource::User,
                raw: true,
                ..Default::default()
            };
            match session.inject(opts).await {
                Ok(_) => None,
                Err(e) => Some(ws_error(e.kind, &e.message)),
            }
        }

        ClientMessage::Resize { session_id, cols, rows } => {
            let resolved = state.registry.resolve(&session_id).await;
            let Some(session) = attached.get(&resolved) else {
                return None;
            };
            match session.resize(cols, rows).await {
                Ok(()) => None,
                Err(e) => Some(ws_error(e.kind, &e.message)),
            }
        }

        ClientMessage::Ping { timestamp } => Some(ServerEvent::Pong { timestamp }),
    }
}

fn ws_error(kind: ErrorKind, message: &str) -> ServerEvent {
    ServerEvent::SessionUpdated {
        update_type: "error".to_string(),
        session_data: serde_json::json!({ "code": kind.as_str(), "message": message }),
    }
}

async fn send_json<S>(tx: &mut S, msg: &ServerEvent) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = match serde_json::to_string(msg) {
        Ok(t) => t,
        Err(_) => return Err(()),
    };
    tx.send(Message::Text(text.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
