//! Registry inspection endpoints

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use roomcast_sfu::{PeerId, PeerSnapshot, RegistryStats};

use crate::http::{AppResult, AppState};

pub fn create_stats_router() -> Router<AppState> {
    Router::new()
        .route("/api/stats", get(get_stats))
        .route("/api/peers/{peer_id}", get(get_peer))
}

/// Number of live peers, transports, producers and consumers
pub async fn get_stats(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.sfu.stats())
}

/// Transports, producers and consumers owned by one peer
pub async fn get_peer(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> AppResult<Json<PeerSnapshot>> {
    let snapshot = state.sfu.registry().get(&PeerId::from(peer_id))?;
    Ok(Json(snapshot))
}
