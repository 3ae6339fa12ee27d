//! 3x3 tic-tac-toe grid.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Marker {
    X,
    O,
}

impl Marker {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X => "X",
            Self::O => "O",
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoardError {
    #[error("cell ({x}, {y}) is outside the board")]
    OutOfBounds { x: i64, y: i64 },
    #[error("cell ({x}, {y}) is already taken")]
    Occupied { x: i64, y: i64 },
    #[error("unknown cell marker {0:?}")]
    BadMarker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardOutcome {
    InProgress,
    Won(Marker),
    Draw,
}

/// Rows of cells; `cells[x][y]`.
///
/// Serialized as a nested array of strings, `""` marking an empty cell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "[[String; SIZE]; SIZE]", try_from = "[[String; SIZE]; SIZE]")]
pub struct Board {
    cells: [[Option<Marker>; SIZE]; SIZE],
}

const LINES: [[(usize, usize); 3]; 8] = [
    [(0, 0), (0, 1), (0, 2)],
    [(1, 0), (1, 1), (1, 2)],
    [(2, 0), (2, 1), (2, 2)],
    [(0, 0), (1, 0), (2, 0)],
    [(0, 1), (1, 1), (2, 1)],
    [(0, 2), (1, 2), (2, 2)],
    [(0, 0), (1, 1), (2, 2)],
    [(0, 2), (1, 1), (2, 0)],
];

impl Board {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a persisted board. Empty or legacy `{}` state means a fresh board.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "{}" {
            return Ok(Self::new());
        }
        serde_json::from_str(trimmed)
    }

    pub fn to_json(&self) -> String {
        let rows: [[String; SIZE]; SIZE] = self.clone().into();
        serde_json::to_string(&rows).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn get(&self, x: usize, y: usize) -> Option<Marker> {
        self.cells.get(x)?.get(y).copied().flatten()
    }

    /// Write `marker` at `(x, y)` if the cell exists and is free.
    pub fn place(&mut self, x: i64, y: i64, marker: Marker) -> Result<(), BoardError> {
        let (Ok(row), Ok(col)) = (usize::try_from(x), usize::try_from(y)) else {
            return Err(BoardError::OutOfBounds { x, y });
        };
        let cell = self
            .cells
            .get_mut(row)
            .and_then(|r| r.get_mut(col))
            .ok_or(BoardError::OutOfBounds { x, y })?;
        if cell.is_some() {
            return Err(BoardError::Occupied { x, y });
        }
        *cell = Some(marker);
        Ok(())
    }

    pub fn winner(&self) -> Option<Marker> {
        LINES.iter().find_map(|line| {
            let [a, b, c] = line.map(|(x, y)| self.cells[x][y]);
            match (a, b, c) {
                (Some(a), Some(b), Some(c)) if a == b && b == c => Some(a),
                _ => None,
            }
        })
    }

    pub fn is_full(&self) -> bool {
        self.cells.iter().flatten().all(Option::is_some)
    }

    pub fn outcome(&self) -> BoardOutcome {
        match self.winner() {
            Some(marker) => BoardOutcome::Won(marker),
            None if self.is_full() => BoardOutcome::Draw,
            None => BoardOutcome::InProgress,
        }
    }

    pub fn filled(&self) -> usize {
        self.cells.iter().flatten().filter(|c| c.is_some()).count()
    }
}

impl From<Board> for [[String; SIZE]; SIZE] {
    fn from(board: Board) -> Self {
        board
            .cells
            .map(|row| row.map(|cell| cell.map(Marker::as_str).unwrap_or_default().to_string()))
    }
}

impl TryFrom<[[String; SIZE]; SIZE]> for Board {
    type Error = BoardError;

    fn try_from(rows: [[String; SIZE]; SIZE]) -> Result<Self, Self::Error> {
        let mut board = Board::new();
        for (x, row) in rows.iter().enumerate() {
            for (y, cell) in row.iter().enumerate() {
                board.cells[x][y] = match cell.as_str() {
                    "" => None,
                    "X" => Some(Marker::X),
                    "O" => Some(Marker::O),
                    other => return Err(BoardError::BadMarker(other.to_string())),
                };
            }
        }
        Ok(board)
    }
}
