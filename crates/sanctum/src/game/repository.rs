//! Persistence of game rooms, moves and stats.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sanctum_protocol::{RoomId, UserId};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};

use super::board::Board;
use super::room::{Finish, GameRoom, GameStatus, GameType};

/// Per user, per game type counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GameStats {
    pub user_id: UserId,
    pub game_type: String,
    pub wins: i64,
    pub losses: i64,
    pub draws: i64,
    pub total_games: i64,
    pub points: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameMove {
    pub id: i64,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub move_data: String,
    pub move_number: i64,
    pub created_at: String,
}

/// Storage the game hub depends on.
#[async_trait]
pub trait GameRepository: Send + Sync {
    async fn create_room(&self, creator_id: UserId, game_type: GameType) -> Result<GameRoom>;

    async fn room(&self, id: RoomId) -> Result<Option<GameRoom>>;

    /// Rooms still waiting for an opponent, newest first.
    async fn pending_rooms(&self, game_type: GameType) -> Result<Vec<GameRoom>>;

    /// Overwrite the stored room if it is still in `expected` status.
    /// Returns false, writing nothing, when another writer got there first.
    async fn update_room(&self, room: &GameRoom, expected: GameStatus) -> Result<bool>;

    /// Store a move by `user_id` together with the room it produced, and the
    /// stats update when `finish` is set. The write only lands if the stored
    /// room is still active with `user_id` to move; otherwise nothing is
    /// written and `None` comes back.
    async fn commit_move(
        &self,
        room: &GameRoom,
        user_id: UserId,
        move_data: &str,
        finish: Option<Finish>,
        win_points: i64,
    ) -> Result<Option<GameMove>>;

    async fn moves(&self, room_id: RoomId) -> Result<Vec<GameMove>>;

    /// Save a finished room and apply its stats update atomically. Returns
    /// false, writing nothing, if the stored room is no longer active.
    async fn finish_room(&self, room: &GameRoom, finish: Finish, win_points: i64)
    -> Result<bool>;

    /// Stats for a user; all zeros if the user never finished a game.
    async fn stats(&self, user_id: UserId, game_type: GameType) -> Result<GameStats>;
}

#[derive(Debug, Clone)]
pub struct SqliteGameRepository {
    pool: SqlitePool,
}

impl SqliteGameRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const ROOM_COLUMNS: &str = "id, game_type, status, creator_id, opponent_id, winner_id, is_draw, \
                            current_state, next_turn_id, created_at, updated_at";

fn room_from_row(row: &SqliteRow) -> Result<GameRoom> {
    let game_type: String = row.try_get("game_type")?;
    let status: String = row.try_get("status")?;
    let state: String = row.try_get("current_state")?;
    let opt_id = |column: &str| -> Result<Option<u64>> {
        Ok(row.try_get::<Option<i64>, _>(column)?.map(|v| v as u64))
    };

    Ok(GameRoom {
        id: row.try_get::<i64, _>("id")? as u64,
        game_type: game_type.parse()?,
        status: status.parse::<GameStatus>()?,
        creator_id: row.try_get::<i64, _>("creator_id")? as u64,
        opponent_id: opt_id("opponent_id")?,
        winner_id: opt_id("winner_id")?,
        is_draw: row.try_get("is_draw")?,
        board: Board::from_json(&state).context("decoding board state")?,
        next_turn_id: opt_id("next_turn_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn move_from_row(row: &SqliteRow) -> Result<GameMove> {
    Ok(GameMove {
        id: row.try_get("id")?,
        room_id: row.try_get::<i64, _>("game_room_id")? as u64,
        user_id: row.try_get::<i64, _>("user_id")? as u64,
        move_data: row.try_get("move_data")?,
        move_number: row.try_get("move_number")?,
        created_at: row.try_get("created_at")?,
    })
}

fn stats_delta(finish: Finish, win_points: i64) -> Vec<(UserId, GameStats)> {
    let delta = |user_id, wins, losses, draws, points| GameStats {
        user_id,
        game_type: String::new(),
        wins,
        losses,
        draws,
        total_games: 1,
        points,
    };
    match finish {
        Finish::Win { winner, loser } => vec![
            (winner, delta(winner, 1, 0, 0, win_points)),
            (loser, delta(loser, 0, 1, 0, 0)),
        ],
        Finish::Draw { players } => players
            .iter()
            .map(|&user| (user, delta(user, 0, 0, 1, 0)))
            .collect(),
    }
}

async fn apply_stats(
    tx: &mut Transaction<'_, Sqlite>,
    room: &GameRoom,
    finish: Finish,
    win_points: i64,
) -> Result<()> {
    for (user_id, delta) in stats_delta(finish, win_points) {
        sqlx::query(
            r#"
            INSERT INTO game_stats (user_id, game_type, wins, losses, draws, total_games, points)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, game_type) DO UPDATE SET
                wins = wins + excluded.wins,
                losses = losses + excluded.losses,
                draws = draws + excluded.draws,
                total_games = total_games + excluded.total_games,
                points = points + excluded.points
            "#,
        )
        .bind(user_id as i64)
        .bind(room.game_type.as_str())
        .bind(delta.wins)
        .bind(delta.losses)
        .bind(delta.draws)
        .bind(delta.total_games)
        .bind(delta.points)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("Failed to update stats for user {user_id}"))?;
    }
    Ok(())
}

#[async_trait]
impl GameRepository for SqliteGameRepository {
    #[instrument(skip(self))]
    async fn create_room(&self, creator_id: UserId, game_type: GameType) -> Result<GameRoom> {
        let row = sqlx::query(&format!(
            "INSERT INTO game_rooms (game_type, status, creator_id, current_state) \
             VALUES (?, 'pending', ?, ?) RETURNING {ROOM_COLUMNS}"
        ))
        .bind(game_type.as_str())
        .bind(creator_id as i64)
        .bind(Board::new().to_json())
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert game room")?;

        let room = room_from_row(&row)?;
        debug!("Created game room {} for user {}", room.id, creator_id);
        Ok(room)
    }

    #[instrument(skip(self))]
    async fn room(&self, id: RoomId) -> Result<Option<GameRoom>> {
        let row = sqlx::query(&format!("SELECT {ROOM_COLUMNS} FROM game_rooms WHERE id = ?"))
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch game room")?;

        row.as_ref().map(room_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn pending_rooms(&self, game_type: GameType) -> Result<Vec<GameRoom>> {
        let rows = sqlx::query(&format!(
            "SELECT {ROOM_COLUMNS} FROM game_rooms \
             WHERE status = 'pending' AND game_type = ? ORDER BY id DESC"
        ))
        .bind(game_type.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pending game rooms")?;

        rows.iter().map(room_from_row).collect()
    }

    #[instrument(skip(self, room), fields(room_id = room.id, status = %room.status))]
    async fn update_room(&self, room: &GameRoom, expected: GameStatus) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE game_rooms
            SET status = ?, opponent_id = ?, winner_id = ?, is_draw = ?,
                current_state = ?, next_turn_id = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(room.status.as_str())
        .bind(room.opponent_id.map(|v| v as i64))
        .bind(room.winner_id.map(|v| v as i64))
        .bind(room.is_draw)
        .bind(room.board.to_json())
        .bind(room.next_turn_id.map(|v| v as i64))
        .bind(room.id as i64)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to update game room")?;

        Ok(updated.rows_affected() > 0)
    }

    #[instrument(skip(self, room, move_data), fields(room_id = room.id))]
    async fn commit_move(
        &self,
        room: &GameRoom,
        user_id: UserId,
        move_data: &str,
        finish: Option<Finish>,
        win_points: i64,
    ) -> Result<Option<GameMove>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let updated = sqlx::query(
            r#"
            UPDATE game_rooms
            SET status = ?, winner_id = ?, is_draw = ?, current_state = ?,
                next_turn_id = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status = 'active' AND next_turn_id = ?
            "#,
        )
        .bind(room.status.as_str())
        .bind(room.winner_id.map(|v| v as i64))
        .bind(room.is_draw)
        .bind(room.board.to_json())
        .bind(room.next_turn_id.map(|v| v as i64))
        .bind(room.id as i64)
        .bind(user_id as i64)
        .execute(&mut *tx)
        .await
        .context("Failed to update game room")?;
        if updated.rows_affected() == 0 {
            debug!("Stale move by user {} in room {}", user_id, room.id);
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO game_moves (game_room_id, user_id, move_data, move_number)
            SELECT ?, ?, ?, COALESCE(MAX(move_number), 0) + 1
            FROM game_moves WHERE game_room_id = ?
            RETURNING id, game_room_id, user_id, move_data, move_number, created_at
            "#,
        )
        .bind(room.id as i64)
        .bind(user_id as i64)
        .bind(move_data)
        .bind(room.id as i64)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to record game move")?;
        let recorded = move_from_row(&row)?;

        if let Some(finish) = finish {
            apply_stats(&mut tx, room, finish, win_points).await?;
        }

        tx.commit().await.context("Failed to commit game move")?;
        Ok(Some(recorded))
    }

    #[instrument(skip(self))]
    async fn moves(&self, room_id: RoomId) -> Result<Vec<GameMove>> {
        let rows = sqlx::query(
            r#"
            SELECT id, game_room_id, user_id, move_data, move_number, created_at
            FROM game_moves
            WHERE game_room_id = ?
            ORDER BY move_number
            "#,
        )
        .bind(room_id as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list game moves")?;

        rows.iter().map(move_from_row).collect()
    }

    #[instrument(skip(self, room), fields(room_id = room.id))]
    async fn finish_room(&self, room: &GameRoom, finish: Finish, win_points: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let updated = sqlx::query(
            r#"
            UPDATE game_rooms
            SET status = ?, winner_id = ?, is_draw = ?, current_state = ?,
                next_turn_id = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(room.status.as_str())
        .bind(room.winner_id.map(|v| v as i64))
        .bind(room.is_draw)
        .bind(room.board.to_json())
        .bind(room.next_turn_id.map(|v| v as i64))
        .bind(room.id as i64)
        .execute(&mut *tx)
        .await
        .context("Failed to finish game room")?;
        if updated.rows_affected() == 0 {
            return Ok(false);
        }

        apply_stats(&mut tx, room, finish, win_points).await?;

        tx.commit().await.context("Failed to commit finished game")?;
        debug!("Finished game room {} ({:?})", room.id, finish);
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn stats(&self, user_id: UserId, game_type: GameType) -> Result<GameStats> {
        let row = sqlx::query(
            r#"
            SELECT wins, losses, draws, total_games, points
            FROM game_stats
            WHERE user_id = ? AND game_type = ?
            "#,
        )
        .bind(user_id as i64)
        .bind(game_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch game stats")?;

        let mut stats = GameStats {
            user_id,
            game_type: game_type.as_str().to_string(),
            ..GameStats::default()
        };
        if let Some(row) = row {
            stats.wins = row.try_get("wins")?;
            stats.losses = row.try_get("losses")?;
            stats.draws = row.try_get("draws")?;
            stats.total_games = row.try_get("total_games")?;
            stats.points = row.try_get("points")?;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use sanctum_protocol::Move;

    async fn repo() -> SqliteGameRepository {
        let db = Database::in_memory().await.unwrap();
        SqliteGameRepository::new(db.pool().clone())
    }

    #[tokio::test]
    async fn create_and_load_room() {
        let repo = repo().await;
        let room = repo.create_room(1, GameType::TicTacToe).await.unwrap();
        assert_eq!(room.status(), GameStatus::Pending);
        assert_eq!(room.creator_id(), 1);
        assert!(room.created_at.is_some());

        let loaded = repo.room(room.id()).await.unwrap().unwrap();
        assert_eq!(loaded.board(), &Board::new());
        assert!(repo.room(9999).await.unwrap().is_none());

        let pending = repo.pending_rooms(GameType::TicTacToe).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    async fn active_room(repo: &SqliteGameRepository) -> GameRoom {
        let mut room = repo.create_room(1, GameType::TicTacToe).await.unwrap();
        room.join(2).unwrap();
        assert!(repo.update_room(&room, GameStatus::Pending).await.unwrap());
        room
    }

    #[tokio::test]
    async fn committed_board_survives_reload() {
        let repo = repo().await;
        let mut room = active_room(&repo).await;
        room.apply_move(1, Move { x: 2, y: 1 }).unwrap();
        let recorded = repo
            .commit_move(&room, 1, r#"{"x":2,"y":1}"#, None, 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorded.move_number, 1);

        let loaded = repo.room(room.id()).await.unwrap().unwrap();
        assert_eq!(loaded.status(), GameStatus::Active);
        assert_eq!(loaded.opponent_id(), Some(2));
        assert_eq!(loaded.next_turn_id(), Some(2));
        assert_eq!(loaded.board(), room.board());
    }

    #[tokio::test]
    async fn second_join_loses_to_the_first() {
        let repo = repo().await;
        let pending = repo.create_room(1, GameType::TicTacToe).await.unwrap();
        let mut first = pending.clone();
        let mut second = pending;
        first.join(2).unwrap();
        second.join(3).unwrap();

        assert!(repo.update_room(&first, GameStatus::Pending).await.unwrap());
        assert!(!repo.update_room(&second, GameStatus::Pending).await.unwrap());
        let loaded = repo.room(first.id()).await.unwrap().unwrap();
        assert_eq!(loaded.opponent_id(), Some(2));
    }

    #[tokio::test]
    async fn stale_move_writes_nothing() {
        let repo = repo().await;
        let room = active_room(&repo).await;
        let mut here = room.clone();
        let mut there = room;
        here.apply_move(1, Move { x: 0, y: 0 }).unwrap();
        there.apply_move(1, Move { x: 2, y: 2 }).unwrap();

        let kept = repo.commit_move(&here, 1, r#"{"x":0,"y":0}"#, None, 10).await.unwrap();
        assert!(kept.is_some());
        let lost = repo.commit_move(&there, 1, r#"{"x":2,"y":2}"#, None, 10).await.unwrap();
        assert!(lost.is_none());

        let moves = repo.moves(here.id()).await.unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].move_data, r#"{"x":0,"y":0}"#);
        let loaded = repo.room(here.id()).await.unwrap().unwrap();
        assert_eq!(loaded.board(), here.board());
    }

    #[tokio::test]
    async fn winning_move_updates_stats_with_the_move() {
        let repo = repo().await;
        let mut room = active_room(&repo).await;
        let moves = [(1, 0, 0), (2, 1, 0), (1, 0, 1), (2, 1, 1), (1, 0, 2)];
        for (user, x, y) in moves {
            room.apply_move(user, Move { x, y }).unwrap();
            let data = format!(r#"{{"x":{x},"y":{y}}}"#);
            repo.commit_move(&room, user, &data, room.finish(), 10)
                .await
                .unwrap()
                .unwrap();
        }

        let numbers: Vec<i64> = repo
            .moves(room.id())
            .await
            .unwrap()
            .iter()
            .map(|m| m.move_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        let winner = repo.stats(1, GameType::TicTacToe).await.unwrap();
        assert_eq!((winner.wins, winner.points), (1, 10));
        let stored = repo.room(room.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), GameStatus::Finished);
    }

    #[tokio::test]
    async fn finishing_updates_both_players() {
        let repo = repo().await;
        let mut room = active_room(&repo).await;
        let finish = room.forfeit(2).unwrap();
        assert!(repo.finish_room(&room, finish, 10).await.unwrap());
        // Already finished: a second forfeit is refused and stats stay put.
        assert!(!repo.finish_room(&room, finish, 10).await.unwrap());

        let winner = repo.stats(1, GameType::TicTacToe).await.unwrap();
        assert_eq!((winner.wins, winner.losses, winner.total_games, winner.points), (1, 0, 1, 10));
        let loser = repo.stats(2, GameType::TicTacToe).await.unwrap();
        assert_eq!((loser.wins, loser.losses, loser.total_games, loser.points), (0, 1, 1, 0));

        let mut rematch = repo.create_room(2, GameType::TicTacToe).await.unwrap();
        rematch.join(1).unwrap();
        assert!(repo.update_room(&rematch, GameStatus::Pending).await.unwrap());
        assert!(
            repo.finish_room(&rematch, Finish::Draw { players: [2, 1] }, 10)
                .await
                .unwrap()
        );
        let winner = repo.stats(1, GameType::TicTacToe).await.unwrap();
        assert_eq!((winner.draws, winner.total_games, winner.points), (1, 2, 10));

        let stored = repo.room(room.id()).await.unwrap().unwrap();
        assert_eq!(stored.status(), GameStatus::Finished);
        assert_eq!(stored.winner_id(), Some(1));
    }

    #[tokio::test]
    async fn unknown_user_has_zero_stats() {
        let repo = repo().await;
        let stats = repo.stats(42, GameType::TicTacToe).await.unwrap();
        assert_eq!(stats.total_games, 0);
        assert_eq!(stats.game_type, "tictactoe");
    }
}
