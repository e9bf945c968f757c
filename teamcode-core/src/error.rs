use thiserror::Error;

use crate::piece::PieceId;

/// Errors raised by piece table queries and the wire codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Unknown piece: {0}")]
    UnknownPiece(PieceId),
    #[error("Malformed wire data: {0}")]
    MalformedWire(String),
}
