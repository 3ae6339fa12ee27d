//! Game room model and the rules that move it between states.

use std::fmt;
use std::str::FromStr;

use sanctum_protocol::{Move, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::board::{Board, BoardError, BoardOutcome, Marker};
use crate::error::{HubError, HubResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Pending,
    Active,
    Finished,
    Cancelled,
}

impl GameStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }

    /// Statuses only move forward: pending to active or cancelled, active to finished.
    pub fn can_transition_to(self, next: GameStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active)
                | (Self::Pending, Self::Cancelled)
                | (Self::Active, Self::Finished)
        )
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "finished" => Ok(Self::Finished),
            "cancelled" => Ok(Self::Cancelled),
            other => anyhow::bail!("unknown game status {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameType {
    #[serde(rename = "tictactoe")]
    TicTacToe,
}

impl GameType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TicTacToe => "tictactoe",
        }
    }
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameType {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tictactoe" => Ok(Self::TicTacToe),
            other => Err(HubError::UnsupportedGame(other.to_string())),
        }
    }
}

/// Result of a legal move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Continue { next_turn: UserId },
    Won { winner: UserId, loser: UserId },
    Draw,
}

/// How a finished room affects the players' stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    Win { winner: UserId, loser: UserId },
    Draw { players: [UserId; 2] },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameRoom {
    pub(crate) id: RoomId,
    #[serde(rename = "type")]
    pub(crate) game_type: GameType,
    pub(crate) status: GameStatus,
    pub(crate) creator_id: UserId,
    pub(crate) opponent_id: Option<UserId>,
    pub(crate) winner_id: Option<UserId>,
    pub(crate) is_draw: bool,
    #[serde(rename = "current_state")]
    pub(crate) board: Board,
    pub(crate) next_turn_id: Option<UserId>,
    pub(crate) created_at: Option<String>,
    pub(crate) updated_at: Option<String>,
}

impl GameRoom {
    pub fn new_pending(id: RoomId, creator_id: UserId, game_type: GameType) -> Self {
        Self {
            id,
            game_type,
            status: GameStatus::Pending,
            creator_id,
            opponent_id: None,
            winner_id: None,
            is_draw: false,
            board: Board::new(),
            next_turn_id: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    pub fn game_type(&self) -> GameType {
        self.game_type
    }

    pub fn status(&self) -> GameStatus {
        self.status
    }

    pub fn creator_id(&self) -> UserId {
        self.creator_id
    }

    pub fn opponent_id(&self) -> Option<UserId> {
        self.opponent_id
    }

    pub fn winner_id(&self) -> Option<UserId> {
        self.winner_id
    }

    pub fn is_draw(&self) -> bool {
        self.is_draw
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Only meaningful while the room is active.
    pub fn next_turn_id(&self) -> Option<UserId> {
        match self.status {
            GameStatus::Active => self.next_turn_id,
            _ => None,
        }
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.creator_id == user_id || self.opponent_id == Some(user_id)
    }

    /// The other participant, if both seats are taken.
    pub fn opponent_of(&self, user_id: UserId) -> Option<UserId> {
        let opponent = self.opponent_id?;
        if user_id == self.creator_id {
            Some(opponent)
        } else if user_id == opponent {
            Some(self.creator_id)
        } else {
            None
        }
    }

    pub fn marker_for(&self, user_id: UserId) -> Option<Marker> {
        if user_id == self.creator_id {
            Some(Marker::X)
        } else if self.opponent_id == Some(user_id) {
            Some(Marker::O)
        } else {
            None
        }
    }

    fn transition(&mut self, next: GameStatus) -> HubResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(HubError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Seat `user_id` as the opponent and start the game. The creator moves first.
    pub fn join(&mut self, user_id: UserId) -> HubResult<()> {
        if self.status != GameStatus::Pending {
            return Err(HubError::NotJoinable);
        }
        if self.creator_id == user_id {
            return Err(HubError::CreatorCannotJoin);
        }
        self.transition(GameStatus::Active)?;
        self.opponent_id = Some(user_id);
        self.next_turn_id = Some(self.creator_id);
        Ok(())
    }

    /// Validate and apply a move, finishing the room when it decides the game.
    ///
    /// On error the room is left untouched.
    pub fn apply_move(&mut self, user_id: UserId, mv: Move) -> HubResult<MoveOutcome> {
        if self.status != GameStatus::Active || self.next_turn_id != Some(user_id) {
            return Err(HubError::NotYourTurn);
        }
        let (Some(marker), Some(other)) = (self.marker_for(user_id), self.opponent_of(user_id))
        else {
            return Err(HubError::NotParticipant);
        };

        self.board
            .place(mv.x, mv.y, marker)
            .map_err(|e| match e {
                BoardError::OutOfBounds { .. } | BoardError::Occupied { .. } => {
                    HubError::InvalidMove
                }
                BoardError::BadMarker(_) => HubError::InvalidMoveFormat,
            })?;

        match self.board.outcome() {
            BoardOutcome::InProgress => {
                self.next_turn_id = Some(other);
                Ok(MoveOutcome::Continue { next_turn: other })
            }
            BoardOutcome::Won(_) => {
                self.transition(GameStatus::Finished)?;
                self.winner_id = Some(user_id);
                Ok(MoveOutcome::Won {
                    winner: user_id,
                    loser: other,
                })
            }
            BoardOutcome::Draw => {
                self.transition(GameStatus::Finished)?;
                self.is_draw = true;
                Ok(MoveOutcome::Draw)
            }
        }
    }

    /// Award an active game to the participant who stayed.
    pub fn forfeit(&mut self, absent: UserId) -> HubResult<Finish> {
        let winner = self.opponent_of(absent).ok_or(HubError::NotParticipant)?;
        self.transition(GameStatus::Finished)?;
        self.winner_id = Some(winner);
        Ok(Finish::Win {
            winner,
            loser: absent,
        })
    }

    pub fn cancel(&mut self) -> HubResult<()> {
        self.transition(GameStatus::Cancelled)
    }

    /// The stats update owed by a finished room.
    pub fn finish(&self) -> Option<Finish> {
        if self.status != GameStatus::Finished {
            return None;
        }
        let opponent = self.opponent_id?;
        match self.winner_id {
            Some(winner) => Some(Finish::Win {
                winner,
                loser: if winner == self.creator_id {
                    opponent
                } else {
                    self.creator_id
                },
            }),
            None if self.is_draw => Some(Finish::Draw {
                players: [self.creator_id, opponent],
            }),
            None => None,
        }
    }

    /// Payload of a `game_state` broadcast.
    pub fn state_payload(&self) -> Value {
        json!({
            "board": self.board,
            "status": self.status,
            "winner_id": self.winner_id,
            "next_turn": self.next_turn_id(),
            "is_draw": self.is_draw,
        })
    }

    /// Payload of the `game_started` broadcast.
    pub fn started_payload(&self) -> Value {
        json!({
            "status": self.status,
            "creator_id": self.creator_id,
            "opponent_id": self.opponent_id,
            "next_turn": self.next_turn_id(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_room() -> GameRoom {
        let mut room = GameRoom::new_pending(1, 10, GameType::TicTacToe);
        room.join(20).unwrap();
        room
    }

    #[test]
    fn join_rules() {
        let mut room = GameRoom::new_pending(1, 10, GameType::TicTacToe);
        assert!(matches!(room.join(10), Err(HubError::CreatorCannotJoin)));
        room.join(20).unwrap();
        assert_eq!(room.status(), GameStatus::Active);
        assert_eq!(room.next_turn_id(), Some(10));
        assert!(matches!(room.join(30), Err(HubError::NotJoinable)));
    }

    #[test]
    fn off_turn_move_changes_nothing() {
        let mut room = active_room();
        let before = room.clone();
        assert!(matches!(
            room.apply_move(20, Move { x: 0, y: 0 }),
            Err(HubError::NotYourTurn)
        ));
        assert!(matches!(
            room.apply_move(99, Move { x: 0, y: 0 }),
            Err(HubError::NotYourTurn)
        ));
        assert_eq!(room, before);
    }

    #[test]
    fn occupied_cell_changes_nothing() {
        let mut room = active_room();
        room.apply_move(10, Move { x: 1, y: 1 }).unwrap();
        let before = room.clone();
        assert!(matches!(
            room.apply_move(20, Move { x: 1, y: 1 }),
            Err(HubError::InvalidMove)
        ));
        assert!(matches!(
            room.apply_move(20, Move { x: 5, y: 1 }),
            Err(HubError::InvalidMove)
        ));
        assert_eq!(room, before);
        assert_eq!(room.next_turn_id(), Some(20));
    }

    #[test]
    fn row_win_finishes_room() {
        let mut room = active_room();
        let moves = [(10, 0, 0), (20, 1, 1), (10, 0, 1), (20, 2, 2)];
        for (user, x, y) in moves {
            assert!(matches!(
                room.apply_move(user, Move { x, y }).unwrap(),
                MoveOutcome::Continue { .. }
            ));
        }
        assert_eq!(
            room.apply_move(10, Move { x: 0, y: 2 }).unwrap(),
            MoveOutcome::Won {
                winner: 10,
                loser: 20
            }
        );
        assert_eq!(room.status(), GameStatus::Finished);
        assert_eq!(room.winner_id(), Some(10));
        assert_eq!(room.next_turn_id(), None);
        assert_eq!(
            room.finish(),
            Some(Finish::Win {
                winner: 10,
                loser: 20
            })
        );
        assert!(matches!(
            room.apply_move(20, Move { x: 2, y: 0 }),
            Err(HubError::NotYourTurn)
        ));
    }

    #[test]
    fn statuses_never_move_backwards() {
        let mut room = active_room();
        assert!(matches!(
            room.cancel(),
            Err(HubError::InvalidTransition {
                from: GameStatus::Active,
                to: GameStatus::Cancelled
            })
        ));
        room.forfeit(20).unwrap();
        assert_eq!(room.winner_id(), Some(10));
        assert!(room.forfeit(10).is_err());
        assert!(!GameStatus::Finished.can_transition_to(GameStatus::Active));
        assert!(!GameStatus::Cancelled.can_transition_to(GameStatus::Pending));
    }

    #[test]
    fn pending_room_can_be_cancelled() {
        let mut room = GameRoom::new_pending(1, 10, GameType::TicTacToe);
        room.cancel().unwrap();
        assert_eq!(room.status(), GameStatus::Cancelled);
        assert!(room.finish().is_none());
    }

    #[test]
    fn state_payload_shape() {
        let room = active_room();
        let payload = room.state_payload();
        assert_eq!(payload["status"], "active");
        assert_eq!(payload["next_turn"], 10);
        assert_eq!(payload["board"][0][0], "");
        assert_eq!(payload["is_draw"], false);
        assert!(payload["winner_id"].is_null());
    }
}
