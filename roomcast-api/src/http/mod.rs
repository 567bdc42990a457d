// Module: http
// HTTP routes and the signaling WebSocket

pub mod error;
pub mod health;
pub mod stats;
pub mod websocket;

use axum::{routing::get, Router};
use roomcast_sfu::SfuManager;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Default cap on a single inbound WebSocket message
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub sfu: Arc<SfuManager>,
    /// Largest inbound WebSocket message accepted, in bytes
    pub max_message_size: usize,
}

/// Create the HTTP router with all routes
pub fn create_router(sfu: Arc<SfuManager>, max_message_size: usize) -> Router {
    let state = AppState {
        sfu,
        max_message_size,
    };

    let router = Router::new()
        // Health check endpoints (for monitoring probes)
        .merge(health::create_health_router())
        // Registry inspection
        .merge(stats::create_stats_router())
        // Signaling channel, one socket per peer
        .route("/ws", get(websocket::websocket_handler));

    // Apply layers before state
    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    router.with_state(state)
}
