//! WebSocket upgrade endpoints.
//!
//! Each handler validates the request before upgrading, then hands the socket
//! to a pump bound to the right hub.

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use log::{debug, info};
use sanctum_protocol::{GameAction, RoomId};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::auth::CurrentUser;
use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::chat::ChatSocket;
use crate::game::GameSocket;
use crate::signal::SignalSocket;
use crate::ws::{self, Connection, ConnectionOwner, Frame, InboundHandler, PumpConfig};

#[derive(Debug, Deserialize)]
pub struct GameSocketQuery {
    pub room_id: Option<RoomId>,
}

#[derive(Debug, Deserialize)]
pub struct SignalSocketQuery {
    pub room_id: Option<String>,
    pub username: Option<String>,
}

/// GET /ws/chat
pub async fn chat_ws(
    State(state): State<AppState>,
    user: CurrentUser,
    upgrade: WebSocketUpgrade,
) -> Response {
    let user_id = user.id();
    info!("Chat socket upgrade for user {}", user_id);

    upgrade
        .max_message_size(state.pump.max_message_size)
        .on_upgrade(move |socket| async move {
            let (conn, outbound) = Connection::new(user_id, state.pump.send_buffer);
            state.chat.register_user(&conn);
            let adapter = Arc::new(ChatSocket::new(state.chat.clone()));
            drive(socket, conn, outbound, adapter.clone(), adapter, state.pump.clone()).await;
        })
}

/// GET /ws/game?room_id=<id>
pub async fn game_ws(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<GameSocketQuery>,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    let user_id = user.id();
    let room_id = query
        .room_id
        .ok_or_else(|| ApiError::bad_request("room_id is required"))?;
    state.games.room(room_id).await?;
    if !state.games.can_register(user_id, room_id) {
        return Err(ApiError::conflict("game room is full"));
    }
    info!("Game socket upgrade for user {} in room {}", user_id, room_id);

    Ok(upgrade
        .max_message_size(state.pump.max_message_size)
        .on_upgrade(move |socket| async move {
            let (conn, outbound) = Connection::new(user_id, state.pump.send_buffer);
            // The room may have filled up between the check and the upgrade.
            if let Err(e) = state.games.register(user_id, room_id, &conn) {
                conn.send_json(&GameAction::error(room_id, e.client_message()));
                conn.close();
            }
            let adapter = Arc::new(GameSocket::new(state.games.clone(), room_id));
            drive(socket, conn, outbound, adapter.clone(), adapter, state.pump.clone()).await;
        }))
}

/// GET /ws/videochat?room_id=<id>&username=<name>
pub async fn videochat_ws(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<SignalSocketQuery>,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    let user_id = user.id();
    let room_id = query
        .room_id
        .filter(|room| !room.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("room_id is required"))?;
    let username = query
        .username
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| format!("user-{user_id}"));
    info!("Videochat socket upgrade for user {} in room {}", user_id, room_id);

    Ok(upgrade
        .max_message_size(state.pump.max_message_size)
        .on_upgrade(move |socket| async move {
            let (conn, outbound) = Connection::new(user_id, state.pump.send_buffer);
            if state
                .signals
                .join(&room_id, user_id, &username, &conn)
                .await
                .is_err()
            {
                conn.close();
            }
            let adapter = Arc::new(SignalSocket::new(state.signals.clone(), room_id, username));
            drive(socket, conn, outbound, adapter.clone(), adapter, state.pump.clone()).await;
        }))
}

async fn drive<A>(
    socket: WebSocket,
    conn: Arc<Connection>,
    outbound: mpsc::Receiver<Frame>,
    owner: Arc<A>,
    handler: Arc<A>,
    config: PumpConfig,
) where
    A: ConnectionOwner + InboundHandler + 'static,
{
    let conn_id = conn.id();
    let handler: Arc<dyn InboundHandler> = handler;
    let exit = ws::pump::run(socket, conn, outbound, owner, Some(handler), config).await;
    debug!("Connection {} finished: {:?}", conn_id, exit);
}
