//! Socket handshake and frame loop.
//!
//! Some client stacks cannot attach credentials to an upgrade request,
//! so establishment is split: an authenticated `GET /ws-connect` mints a
//! single-use token valid for 10 seconds, and `GET /ws?token=<t>`
//! consumes it at upgrade time. A bad token closes the socket with a
//! reason instead of refusing the upgrade, so clients see why.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::auth::RequireAuth;
use super::{handlers, AppState};
use crate::db::ConnectTokenRecord;
use crate::sessions::Principal;
use crate::wire::{self, WsMessage};
use crate::{now_unix, random_id};

const CONNECT_TOKEN_TTL_SEC: i64 = 10;

pub(super) async fn handler_ws_connect(
    RequireAuth(principal): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let token = ConnectTokenRecord {
        id: random_id(32),
        expiry_unix_sec: now_unix() + CONNECT_TOKEN_TTL_SEC,
        user_id: principal.user_id,
        user_name: principal.name,
        email: principal.email,
        permissions: principal.permissions,
    };
    match state.ctx.db.create_connect_token(&token, now_unix()).await {
        Ok(()) => Json(serde_json::json!({ "connToken": token.id })).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to store connect token");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "failed to create connect token",
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
pub(super) struct WsQuery {
    #[serde(default)]
    token: String,
}

pub(super) async fn handler_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session(socket, state, query.token))
}

async fn close_with_reason(mut socket: WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        })))
        .await;
}

async fn session(socket: WebSocket, state: Arc<AppState>, token: String) {
    if token.is_empty() {
        return close_with_reason(socket, "connect token missing").await;
    }
    let record = match state.ctx.db.consume_connect_token(&token, now_unix()).await {
        Ok(Some(r)) => r,
        Ok(None) => {
            return close_with_reason(socket, "connect token invalid or expired").await;
        }
        Err(e) => {
            warn!(error = %e, "connect token lookup failed");
            return close_with_reason(socket, "connect token lookup failed").await;
        }
    };

    // Users are created lazily, on first attach.
    let user = match state
        .ctx
        .db
        .get_or_create_user(&record.user_id, &record.user_name, &record.email, now_unix())
        .await
    {
        Ok(u) => u,
        Err(e) => {
            warn!(user_id = %record.user_id, error = %e, "failed to load user record");
            return close_with_reason(socket, "failed to load user record").await;
        }
    };

    let principal = Principal {
        user_id: user.user_id,
        name: user.name,
        email: user.email,
        permissions: record.permissions,
    };
    let session_id = random_id(16);
    let rx = state.sessions.attach(&session_id, principal.clone());
    frame_loop(socket, &state, &session_id, &principal, rx).await;
    state.sessions.detach(&session_id);
}

async fn frame_loop(
    mut socket: WebSocket,
    state: &Arc<AppState>,
    session_id: &str,
    principal: &Principal,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<WsMessage>,
) {
    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(msg) = outbound else { break };
                let Ok(bytes) = wire::encode(&msg) else { continue };
                if socket.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Binary(bytes))) => {
                        let req = match wire::decode(&bytes) {
                            Ok(WsMessage::Request(req)) => req,
                            Ok(other) => {
                                debug!(session_id, ?other, "non-request frame ignored");
                                continue;
                            }
                            Err(e) => {
                                warn!(session_id, error = %e, "undecodable frame");
                                continue;
                            }
                        };
                        let resp =
                            handlers::dispatch(&state.ctx, session_id, principal, req).await;
                        let Ok(bytes) = wire::encode(&WsMessage::Response(resp)) else {
                            continue;
                        };
                        if socket.send(Message::Binary(bytes.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
