use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::IntoResponse,
    Json,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{future, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::{ClientConnection, OUTBOUND_CAPACITY};
use crate::dispatch::SessionDispatcher;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub sid: Option<String>,
}

/// `GET /ws?sid=<id>`
pub async fn session_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let sid = state.resolve_sid(params.sid.as_deref());
    ws.on_upgrade(move |socket| handle_session_socket(socket, state, sid, peer))
}

async fn handle_session_socket(socket: WebSocket, state: AppState, sid: String, peer: SocketAddr) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(write_frames(sink, rx));

    let conn = Arc::new(ClientConnection::new(
        uuid::Uuid::new_v4().to_string(),
        peer.to_string(),
        tx,
    ));
    let end = SessionDispatcher::new(state, sid.clone(), conn)
        .run(text_frames(stream))
        .await;

    // the dispatcher owned the only sender, so the writer drains and closes
    if let Err(e) = writer.await {
        debug!(session = %sid, "Writer task ended abnormally: {}", e);
    }
    debug!(session = %sid, ?end, "WebSocket closed");
}

/// `GET /healthz`
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.len(),
        "room_connections": state.room.connection_count(),
    }))
}

/// Drain queued frames into the socket, then close it once every sender is
/// gone.
pub(crate) async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<String>>,
) {
    while let Some(frame) = rx.recv().await {
        if sink.send(Message::Text(frame.as_str().to_owned())).await.is_err() {
            return;
        }
    }
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        })))
        .await;
    let _ = sink.close().await;
}

/// Text payloads of a socket, ending at the first close frame or error.
/// Binary frames are read as lossy UTF-8.
pub(crate) fn text_frames(stream: SplitStream<WebSocket>) -> impl Stream<Item = String> + Send {
    stream
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(text),
                Ok(Message::Binary(bytes)) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                _ => None,
            })
        })
}
