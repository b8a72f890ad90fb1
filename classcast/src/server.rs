//! HTTP server wiring

use axum::{routing::get, Router};
use classcast_core::signaling::SignalingService;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::ws::websocket_handler;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub signaling: Arc<SignalingService>,
}

/// Build the router: health probe plus the class signaling socket.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/class/{class_id}", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
