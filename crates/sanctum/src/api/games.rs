//! Game room HTTP handlers.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use sanctum_protocol::RoomId;
use serde::{Deserialize, Serialize};

use super::auth::CurrentUser;
use super::error::ApiResult;
use super::state::AppState;
use crate::game::{GameRoom, GameStats, GameType};

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(default = "default_game_type")]
    pub game_type: String,
}

fn default_game_type() -> String {
    GameType::TicTacToe.as_str().to_string()
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub chat_connections: usize,
    pub online_users: usize,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        chat_connections: state.chat.connection_count(),
        online_users: state.chat.online_count(),
    })
}

/// POST /games/rooms
pub async fn create_room(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateRoomRequest>,
) -> ApiResult<(StatusCode, Json<GameRoom>)> {
    let game_type: GameType = request.game_type.parse()?;
    let room = state.games.create_room(user.id(), game_type).await?;
    Ok((StatusCode::CREATED, Json(room)))
}

/// GET /games/rooms/{room_id}
pub async fn get_room(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(room_id): Path<RoomId>,
) -> ApiResult<Json<GameRoom>> {
    Ok(Json(state.games.room(room_id).await?))
}

/// GET /games/rooms/pending/{game_type}
pub async fn pending_rooms(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(game_type): Path<String>,
) -> ApiResult<Json<Vec<GameRoom>>> {
    let game_type: GameType = game_type.parse()?;
    Ok(Json(state.games.pending_rooms(game_type).await?))
}

/// GET /games/stats/{game_type}
pub async fn stats(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(game_type): Path<String>,
) -> ApiResult<Json<GameStats>> {
    let game_type: GameType = game_type.parse()?;
    Ok(Json(state.games.stats(user.id(), game_type).await?))
}
