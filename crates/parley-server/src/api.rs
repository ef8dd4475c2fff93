//! Read-only HTTP API.

use crate::handlers::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_core::rooms::validate_room_name;
use parley_core::RoomStats;
use parley_protocol::{ChatMessage, PresenceEntry, RoomId, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::InvalidRoom(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Health check handler.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.router.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "connections": stats.connection_count,
        "users": stats.user_count,
        "rooms": stats.room_count,
        "persistence": state.router.persistence_backend(),
    }))
}

/// Rooms with member and stored message counts.
pub async fn rooms(State(state): State<Arc<AppState>>) -> Json<Vec<RoomStats>> {
    Json(state.router.room_stats().await)
}

/// Users currently online.
pub async fn users(State(state): State<Arc<AppState>>) -> Json<Vec<PresenceEntry>> {
    Json(state.router.online_users().await)
}

#[derive(Debug, Default, Deserialize)]
pub struct MessagesParams {
    pub limit: Option<usize>,
    pub before: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct MessagesPage {
    pub room: RoomId,
    pub messages: Vec<ChatMessage>,
    pub has_more: bool,
}

/// Most recent messages of a room, oldest first.
pub async fn messages(
    State(state): State<Arc<AppState>>,
    Path(room): Path<RoomId>,
    Query(params): Query<MessagesParams>,
) -> Result<Json<MessagesPage>, ApiError> {
    validate_room_name(&room).map_err(ApiError::InvalidRoom)?;

    let history = &state.config.history;
    let limit = params
        .limit
        .unwrap_or(history.api_default_limit)
        .clamp(1, history.max_page_size);

    let (messages, has_more) = state.router.history_page(&room, params.before, limit).await;
    Ok(Json(MessagesPage {
        room,
        messages,
        has_more,
    }))
}
