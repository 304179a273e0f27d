use std::net::SocketAddr;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health_handler, session_ws_handler};
use crate::room::room_ws_handler;
use crate::state::AppState;
use crate::sweeper::SessionSweeper;

/// Routes for the configured server mode
pub fn build_router(state: AppState) -> Router {
    let mode = state.config.server.mode;
    let mut app = Router::new().route("/healthz", get(health_handler));
    if mode.serves_phased() {
        app = app.route("/ws", get(session_ws_handler));
    }
    if mode.serves_room() {
        app = app.route("/ws/room", get(room_ws_handler));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `listener` until `shutdown_rx` fires
pub async fn run_server(
    state: AppState,
    listener: TcpListener,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let session = &state.config.session;
    let sweeper = SessionSweeper::new(
        state.sessions.clone(),
        Duration::from_secs(session.idle_ttl_secs),
        Duration::from_secs(session.sweep_interval_secs),
    );
    sweeper.start().await;

    let app = build_router(state.clone());
    tracing::info!(
        "Listening on {} (mode {:?})",
        listener.local_addr()?,
        state.config.server.mode
    );

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.recv().await;
        tracing::info!("Server shutting down signal received");
    })
    .await;

    sweeper.stop().await;
    served?;
    Ok(())
}
