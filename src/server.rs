//! HTTP surface: health check and the WebSocket session endpoint.
//!
//! `GET /ws/{roomID}?username=<name>` upgrades to a WebSocket, registers the
//! member with its room, writes the history frame (if any), then runs the
//! session loop: inbound frames are decoded and submitted, outbound frames
//! come from the member's broadcast queue. The socket has a single writer —
//! this task — so broadcast enqueues from other rooms' submitters never race
//! a write.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::{SecondsFormat, Utc};
use futures_util::{SinkExt, StreamExt};

use crate::context::Context;
use crate::protocol::{ErrorFrame, Operation};
use crate::room::{Room, SubmitError};

/// Build the router over a fully constructed context.
pub fn router(ctx: Arc<Context>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/{roomID}", get(ws_handler))
        .with_state(ctx)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "WS Server is Live",
        "time": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

async fn ws_handler(
    Path(room_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(ctx): State<Arc<Context>>,
    ws: WebSocketUpgrade,
) -> Response {
    let username = match params.get("username") {
        Some(name) if !name.is_empty() => name.clone(),
        _ => return (StatusCode::BAD_REQUEST, "Missing username").into_response(),
    };
    if room_id.parse::<i64>().is_err() {
        return (StatusCode::BAD_REQUEST, "Invalid room id").into_response();
    }

    ws.on_upgrade(move |socket| handle_session(socket, ctx, room_id, username))
}

async fn handle_session(socket: WebSocket, ctx: Arc<Context>, room_id: String, username: String) {
    let (room, mut join) = match ctx.registry.join(&room_id, &username).await {
        Ok(pair) => pair,
        Err(e) => {
            log::error!("room {room_id}: join failed for {username}: {e}");
            let frame = ErrorFrame::new("Failed to join room", e.to_string());
            let mut socket = socket;
            if let Ok(payload) = serde_json::to_string(&frame) {
                let _ = socket.send(Message::Text(payload.into())).await;
            }
            return;
        }
    };
    log::info!("{username} joined room {room_id}");

    let (mut sink, mut stream) = socket.split();

    // History goes out before the select loop starts draining live
    // broadcasts, so a reconnecting client sees missed ops first.
    if let Some(history) = join.history.take() {
        match serde_json::to_string(&history) {
            Ok(payload) => {
                if sink.send(Message::Text(payload.into())).await.is_err() {
                    ctx.registry.leave(&room_id, join.conn_id).await;
                    return;
                }
            }
            Err(e) => log::error!("room {room_id}: failed to encode history: {e}"),
        }
    }

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Some(error) = handle_frame(&room, text.as_str()).await {
                        let Ok(payload) = serde_json::to_string(&error) else {
                            continue;
                        };
                        if sink.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("{username} left room {room_id}");
                    break;
                }
                Some(Ok(Message::Ping(data))) => {
                    if sink.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::error!("read error from {username} in room {room_id}: {e}");
                    break;
                }
            },
            outbound = join.rx.recv() => match outbound {
                Some(payload) => {
                    if sink.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                // The room dropped this member after a failed enqueue.
                None => break,
            }
        }
    }

    ctx.registry.leave(&room_id, join.conn_id).await;
}

/// Decode and submit one inbound frame; `Some` is an error frame to write
/// back. The session stays open either way.
async fn handle_frame(room: &Room, text: &str) -> Option<ErrorFrame> {
    let op: Operation = match serde_json::from_str(text) {
        Ok(op) => op,
        Err(e) => {
            return Some(ErrorFrame::new("Invalid operation format", e.to_string()));
        }
    };

    match room.submit(op).await {
        // The submitter's ack is its own echo on the outbound queue.
        Ok(applied) => {
            log::debug!(
                "room {} applied {} at version {}",
                room.room_id(),
                applied.op.kind.as_str(),
                applied.server_version
            );
            None
        }
        Err(SubmitError::Invalid(e)) => {
            Some(ErrorFrame::new("Operation validation failed", e.to_string()))
        }
        Err(SubmitError::Storage(e)) => {
            Some(ErrorFrame::new("Failed to write operation", e.to_string()))
        }
        Err(SubmitError::RoomClosed) => {
            Some(ErrorFrame::new("Room closed", "room was compacted"))
        }
    }
}
