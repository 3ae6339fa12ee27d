//! Game socket envelope and inbound commands.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ProtocolError, RoomId, UserId};

crate::wire_kind! {
    /// Discriminator of a [`GameAction`].
    pub enum GameActionKind {
        CreateRoom => "create_room",
        JoinRoom => "join_room",
        MakeMove => "make_move",
        Chat => "chat",
        GameStarted => "game_started",
        GameState => "game_state",
        Error => "error",
        ServerShutdown => "server_shutdown",
    }
}

/// A message sent over a game socket or the `game:room:<id>` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameAction {
    #[serde(rename = "type")]
    pub kind: GameActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub payload: Value,
}

impl GameAction {
    pub fn new(kind: GameActionKind, room_id: RoomId, payload: Value) -> Self {
        Self {
            kind,
            room_id: Some(room_id),
            user_id: None,
            payload,
        }
    }

    /// An `error` action carrying a human readable message.
    pub fn error(room_id: RoomId, message: impl Into<String>) -> Self {
        Self::new(
            GameActionKind::Error,
            room_id,
            serde_json::json!({ "message": message.into() }),
        )
    }

    pub fn shutdown(room_id: RoomId) -> Self {
        Self::new(
            GameActionKind::ServerShutdown,
            room_id,
            serde_json::json!({ "message": "Server is shutting down" }),
        )
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Board coordinates of a move. `x` is the row, `y` the column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub x: i64,
    pub y: i64,
}

/// Inbound game actions understood by the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum GameCommand {
    CreateRoom,
    JoinRoom,
    MakeMove(Move),
    Chat(Value),
    /// Server-only or unrecognised action type.
    Unknown(String),
}

impl GameCommand {
    pub fn decode(action: &GameAction) -> Result<Self, ProtocolError> {
        let command = match &action.kind {
            GameActionKind::CreateRoom => Self::CreateRoom,
            GameActionKind::JoinRoom => Self::JoinRoom,
            GameActionKind::MakeMove => {
                let mv = Move::deserialize(&action.payload).map_err(|e| {
                    ProtocolError::InvalidPayload {
                        kind: action.kind.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Self::MakeMove(mv)
            }
            GameActionKind::Chat => Self::Chat(action.payload.clone()),
            other => Self::Unknown(other.to_string()),
        };
        Ok(command)
    }
}
