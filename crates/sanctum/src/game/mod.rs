//! Turn-based games: board rules, room lifecycle, persistence and the hub.

mod board;
mod hub;
mod repository;
mod room;

pub use board::{Board, BoardError, BoardOutcome, Marker};
pub use hub::{GameHub, GameSettings, GameSocket, ROOM_CAPACITY};
pub use repository::{GameMove, GameRepository, GameStats, SqliteGameRepository};
pub use room::{Finish, GameRoom, GameStatus, GameType, MoveOutcome};
