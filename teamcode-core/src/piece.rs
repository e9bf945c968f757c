//! Pieces describe how to read a contiguous line range of one block.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::block::BlockId;

/// Opaque, unique piece identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PieceId(String);

impl PieceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id for pieces created on this client.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PieceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PieceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A view of `length` lines of block `block_id`, starting at `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub piece_id: PieceId,
    pub block_id: BlockId,
    pub start: usize,
    /// Number of lines; zero for placeholder pieces.
    pub length: usize,
    /// Lock owner, empty when unlocked.
    pub username: String,
}

impl Piece {
    pub fn new(piece_id: PieceId, block_id: BlockId, start: usize, length: usize) -> Self {
        Self {
            piece_id,
            block_id,
            start,
            length,
            username: String::new(),
        }
    }

    /// Exclusive end offset within the block.
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        !self.username.is_empty()
    }

    #[inline]
    pub fn is_owned_by(&self, username: &str) -> bool {
        !username.is_empty() && self.username == username
    }
}

/// Renderable projection of a non-empty piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilePiece {
    pub piece_id: PieceId,
    pub text: Vec<String>,
    pub open: bool,
    pub username: String,
}
