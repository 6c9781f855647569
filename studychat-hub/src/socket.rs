//! WebSocket event handling.
//!
//! Connection lifecycle:
//! 1. Wait for an `auth` frame; unknown tokens get `auth:error` and the
//!    socket is closed.
//! 2. Register the connection, answer `auth:ok`, and announce the user
//!    online if this is their first connection.
//! 3. Serve `chat:join` / `chat:leave` / `chat:typing` / `chat:stopTyping`.
//! 4. On disconnect, unregister and announce the user offline if this was
//!    their last connection.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use studychat_proto::codec;
use studychat_proto::event::{ClientEvent, ServerEvent};
use studychat_proto::ids::UserId;
use studychat_proto::presence::PresenceStatus;
use tokio::sync::mpsc;

use crate::hub::{self, ConnId, HubState};

/// axum handler that upgrades `/ws` to a WebSocket connection.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serve one socket until it closes.
pub async fn handle_socket(socket: WebSocket, state: Arc<HubState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(token) = wait_for_auth(&mut ws_receiver).await else {
        tracing::warn!("connection closed before auth");
        return;
    };
    let Some(user_id) = state.authenticate(&token).cloned() else {
        tracing::warn!("rejected unknown token");
        let reply = ServerEvent::AuthError {
            reason: "invalid token".to_string(),
        };
        if let Some(frame) = hub::encode(&reply) {
            let _ = ws_sender.send(frame).await;
        }
        let _ = ws_sender.send(WsMessage::Close(None)).await;
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let (conn_id, first) = state.register(&user_id, tx.clone()).await;
    tracing::info!(conn_id, user_id = %user_id, "connection authenticated");

    if let Some(frame) = hub::encode(&ServerEvent::AuthOk {
        user_id: user_id.clone(),
    }) {
        let _ = tx.send(frame);
    }
    if first {
        announce(&state, &user_id, PresenceStatus::Online).await;
    }

    let writer_user = user_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, WsMessage::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user_id = %writer_user, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let reader_user = user_id.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                WsMessage::Text(text) => {
                    handle_frame(&reader_state, conn_id, &reader_user, text.as_str(), &tx).await;
                }
                WsMessage::Close(_) => {
                    tracing::info!(conn_id, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    let last = state.unregister(conn_id).await;
    tracing::info!(conn_id, user_id = %user_id, "connection closed");
    if last {
        announce(&state, &user_id, PresenceStatus::Offline).await;
    }
}

async fn wait_for_auth(
    receiver: &mut (impl StreamExt<Item = Result<WsMessage, axum::Error>> + Unpin),
) -> Option<String> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            WsMessage::Text(text) => {
                return match codec::decode::<ClientEvent>(text.as_str()) {
                    Ok(ClientEvent::Auth { token }) => Some(token),
                    Ok(other) => {
                        tracing::warn!(event = other.name(), "expected auth");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable first frame");
                        None
                    }
                };
            }
            WsMessage::Close(_) => return None,
            _ => {}
        }
    }
    None
}

async fn announce(state: &HubState, user_id: &UserId, status: PresenceStatus) {
    let event = ServerEvent::StatusChange {
        user_id: user_id.clone(),
        status,
    };
    state.broadcast_all(&event, user_id).await;
}

fn reply(tx: &mpsc::UnboundedSender<WsMessage>, event: &ServerEvent) {
    if let Some(frame) = hub::encode(event) {
        let _ = tx.send(frame);
    }
}

async fn handle_frame(
    state: &HubState,
    conn_id: ConnId,
    user_id: &UserId,
    text: &str,
    tx: &mpsc::UnboundedSender<WsMessage>,
) {
    let event = match codec::decode::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(conn_id, error = %e, "undecodable frame");
            reply(
                tx,
                &ServerEvent::Error {
                    reason: format!("bad frame: {e}"),
                },
            );
            return;
        }
    };

    match event {
        ClientEvent::Join { room_id, ack } => {
            if !state.room_allowed(&room_id) {
                tracing::info!(conn_id, room_id = %room_id, "join refused");
                reply(
                    tx,
                    &ServerEvent::JoinError {
                        room_id,
                        ack,
                        reason: "unknown room".to_string(),
                    },
                );
                return;
            }
            let participants = state.join(conn_id, &room_id).await;
            tracing::info!(conn_id, room_id = %room_id, user_id = %user_id, "joined");
            reply(
                tx,
                &ServerEvent::Joined {
                    room_id,
                    ack,
                    participants,
                },
            );
        }
        ClientEvent::Leave { room_id } => {
            state.leave(conn_id, &room_id).await;
            tracing::info!(conn_id, room_id = %room_id, "left");
        }
        ClientEvent::Typing { room_id } => {
            if state.is_member(conn_id, &room_id).await {
                let event = ServerEvent::Typing {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                };
                state.broadcast_room(&room_id, &event, Some(user_id)).await;
            }
        }
        ClientEvent::StopTyping { room_id } => {
            if state.is_member(conn_id, &room_id).await {
                let event = ServerEvent::StopTyping {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                };
                state.broadcast_room(&room_id, &event, Some(user_id)).await;
            }
        }
        ClientEvent::Auth { .. } => {
            tracing::warn!(conn_id, "duplicate auth ignored");
        }
    }
}
