//! Health and statistics endpoints

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metaverse_sfu::{Error, ManagerStats, RoomId, RoomStats};
use serde_json::json;

use crate::http::{AppResult, AppState};

pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .route("/stats/rooms/{room_id}", get(room_stats))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.manager.pool();
    let status = if state.manager.is_shutting_down() {
        "shutting_down"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "workers": pool.len(),
        "aliveWorkers": pool.alive_count(),
    }))
}

pub async fn stats(State(state): State<AppState>) -> Json<ManagerStats> {
    Json(state.manager.stats().await)
}

pub async fn room_stats(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<RoomStats>> {
    let room_id = RoomId::from(room_id);
    state
        .manager
        .room_stats(&room_id)
        .await
        .map(Json)
        .ok_or_else(|| Error::RoomNotFound(room_id).into())
}
