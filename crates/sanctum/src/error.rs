//! Errors raised by hub operations.

use sanctum_protocol::RoomId;
use thiserror::Error;

use crate::game::GameStatus;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("game room is full")]
    RoomFull,

    #[error("room {room} already holds {max} peers")]
    PeerLimit { room: String, max: usize },

    #[error("Game room not found")]
    RoomNotFound(RoomId),

    #[error("Game already started or finished")]
    NotJoinable,

    #[error("You are the creator")]
    CreatorCannotJoin,

    #[error("Not your turn")]
    NotYourTurn,

    #[error("Invalid move location")]
    InvalidMove,

    #[error("Invalid move format")]
    InvalidMoveFormat,

    #[error("You are not a participant of this room")]
    NotParticipant,

    #[error("Rooms are created before connecting")]
    CreateOverSocket,

    #[error("illegal status transition from {from} to {to}")]
    InvalidTransition { from: GameStatus, to: GameStatus },

    #[error("unsupported game type: {0}")]
    UnsupportedGame(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl HubError {
    /// Text sent back to the client in an `error` frame.
    ///
    /// Storage failures are not described to clients.
    pub fn client_message(&self) -> String {
        match self {
            Self::Storage(_) => "Internal error, please retry".to_string(),
            other => other.to_string(),
        }
    }

    /// True for errors caused by the caller rather than the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Storage(_) | Self::InvalidTransition { .. })
    }
}

pub type HubResult<T> = Result<T, HubError>;
