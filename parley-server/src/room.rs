//! Multi-party room: every frame is broadcast to every member.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use parley_core::protocol::RoomMessage;
use parley_core::recorder::RecordEvent;

use crate::connection::{ClientConnection, OUTBOUND_CAPACITY};
use crate::handlers::write_frames;
use crate::state::AppState;

pub const JOINED_NOTICE: &str = "someone joined";
pub const LEFT_NOTICE: &str = "someone left";

/// `GET /ws/room`
pub async fn room_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_room_socket(socket, state, peer))
}

async fn handle_room_socket(socket: WebSocket, state: AppState, peer: SocketAddr) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(write_frames(sink, rx));

    let conn_id = uuid::Uuid::new_v4().to_string();
    let peer = peer.to_string();
    // the registry holds the only sender; removal lets the writer finish
    state
        .room
        .add(Arc::new(ClientConnection::new(conn_id.clone(), peer.clone(), tx)))
        .await;
    state.recorder.record(RecordEvent::Connect {
        session_id: conn_id.clone(),
        client_addr: peer.clone(),
    });
    info!(conn_id = %conn_id, peer = %peer, members = state.room.connection_count(), "Room member joined");
    state.room.broadcast(&RoomMessage::system(JOINED_NOTICE)).await;

    let clean = loop {
        let frame = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(Message::Close(_))) | None => break true,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(conn_id = %conn_id, "Room socket error: {}", e);
                break false;
            }
        };
        if let Some(message) = RoomMessage::from_frame(&frame, &state.config.limits) {
            state.room.broadcast(&message).await;
        }
    };

    state.room.remove(&conn_id).await;
    state.recorder.record(RecordEvent::Disconnect {
        session_id: conn_id.clone(),
        client_addr: peer,
    });
    if clean {
        state.room.broadcast(&RoomMessage::system(LEFT_NOTICE)).await;
    }
    info!(conn_id = %conn_id, clean, "Room member left");

    let _ = writer.await;
}
