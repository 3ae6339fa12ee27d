//! API route definitions.

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::state::AppState;
use super::{games, ws};

pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(games::health))
        .route("/ws/chat", get(ws::chat_ws))
        .route("/ws/game", get(ws::game_ws))
        .route("/ws/videochat", get(ws::videochat_ws))
        .route("/games/rooms", post(games::create_room))
        .route("/games/rooms/{room_id}", get(games::get_room))
        .route("/games/rooms/pending/{game_type}", get(games::pending_rooms))
        .route("/games/stats/{game_type}", get(games::stats))
        .layer(trace_layer)
        .with_state(state)
}
