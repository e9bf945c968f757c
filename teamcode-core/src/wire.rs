//! Conversion between [`PieceTable`] and the server's wire format.
//!
//! Wire format (JSON arrays, positional):
//! ```text
//! block: [block_id, closed, [line, line, ...]]
//! piece: [piece_id, block_id, start, length, username?]
//!
//! content response:  { "piece_table": [piece...], "block_list": [block...] }
//! change broadcast:  { "file_path": "...", "piece_table": [piece...],
//!                      "changed_blocks": [block...] }
//! ```
//!
//! `closed` is the negation of [`TextBlock::open`]. Blocks no piece refers
//! to are dropped on decode; the server announces removed blocks as
//! `[id, true, []]` and keeps them out of the piece list.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::block::{BlockId, TextBlock};
use crate::error::CoreError;
use crate::piece::{Piece, PieceId};
use crate::table::PieceTable;

/// `[block_id, closed, lines]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireBlock(pub BlockId, pub bool, pub Vec<String>);

impl WireBlock {
    pub fn from_block(block_id: BlockId, block: &TextBlock) -> Self {
        Self(block_id, !block.open, block.lines.clone())
    }

    pub fn block_id(&self) -> BlockId {
        self.0
    }

    pub fn is_closed(&self) -> bool {
        self.1
    }

    pub fn to_block(&self) -> TextBlock {
        TextBlock::new(self.2.clone(), !self.1)
    }
}

/// `[piece_id, block_id, start, length, username?]`
///
/// The username is optional on input and always written on output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePiece {
    pub piece_id: PieceId,
    pub block_id: BlockId,
    pub start: usize,
    pub length: usize,
    pub username: String,
}

impl From<&Piece> for WirePiece {
    fn from(piece: &Piece) -> Self {
        Self {
            piece_id: piece.piece_id.clone(),
            block_id: piece.block_id,
            start: piece.start,
            length: piece.length,
            username: piece.username.clone(),
        }
    }
}

impl WirePiece {
    pub fn to_piece(&self) -> Piece {
        Piece {
            piece_id: self.piece_id.clone(),
            block_id: self.block_id,
            start: self.start,
            length: self.length,
            username: self.username.clone(),
        }
    }
}

impl Serialize for WirePiece {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(5)?;
        tuple.serialize_element(&self.piece_id)?;
        tuple.serialize_element(&self.block_id)?;
        tuple.serialize_element(&self.start)?;
        tuple.serialize_element(&self.length)?;
        tuple.serialize_element(&self.username)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for WirePiece {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(WirePieceVisitor)
    }
}

struct WirePieceVisitor;

impl<'de> Visitor<'de> for WirePieceVisitor {
    type Value = WirePiece;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a piece tuple [piece_id, block_id, start, length, username?]")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<WirePiece, A::Error> {
        let piece_id = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let block_id = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        let start = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
        let length = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(3, &self))?;
        let username: Option<Option<String>> = seq.next_element()?;

        Ok(WirePiece {
            piece_id,
            block_id,
            start,
            length,
            username: username.flatten().unwrap_or_default(),
        })
    }
}

/// Full document as sent in a `file-content-response`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WireDocument {
    pub piece_table: Vec<WirePiece>,
    pub block_list: Vec<WireBlock>,
}

/// Change notification broadcast after another client's edit or lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireChange {
    pub file_path: String,
    pub piece_table: Vec<WirePiece>,
    #[serde(alias = "changed_block", default)]
    pub changed_blocks: Vec<WireBlock>,
}

/// A decoded change broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeUpdate {
    pub file_path: String,
    /// The caller's blocks merged with the changed ones, under the
    /// broadcast's piece sequence.
    pub piece_table: PieceTable,
    pub changed_blocks: HashMap<BlockId, Arc<TextBlock>>,
}

/// Later rows for the same block id replace earlier ones.
fn collect_blocks(rows: &[WireBlock]) -> HashMap<BlockId, Arc<TextBlock>> {
    rows.iter().fold(HashMap::new(), |mut blocks, row| {
        blocks.insert(row.block_id(), Arc::new(row.to_block()));
        blocks
    })
}

fn collect_pieces(rows: &[WirePiece]) -> Vec<Arc<Piece>> {
    rows.iter().map(|p| Arc::new(p.to_piece())).collect()
}

/// Build a piece table from a content response.
pub fn decode_document(wire: &WireDocument) -> Result<PieceTable, CoreError> {
    let blocks = collect_blocks(&wire.block_list);
    let table = collect_pieces(&wire.piece_table);
    let mut pt = PieceTable::from_parts(blocks, table)?;
    pt.prune_unreferenced();
    log::debug!(
        "decoded document: {} pieces, {} blocks, {} lines",
        pt.piece_count(),
        pt.blocks().len(),
        pt.len()
    );
    Ok(pt)
}

/// Encode a piece table into the content-response shape.
///
/// Each referenced block is written once, in order of first reference.
pub fn encode_document(pt: &PieceTable) -> WireDocument {
    let mut seen = HashSet::new();
    let mut block_list = Vec::new();
    for piece in pt.pieces() {
        if !seen.insert(piece.block_id) {
            continue;
        }
        if let Some(block) = pt.block(piece.block_id) {
            block_list.push(WireBlock::from_block(piece.block_id, block));
        }
    }

    WireDocument {
        piece_table: pt.pieces().iter().map(|p| WirePiece::from(p.as_ref())).collect(),
        block_list,
    }
}

/// Merge a change broadcast into `existing`.
///
/// The piece sequence is replaced wholesale; only the named blocks are
/// inserted or replaced. Unchanged blocks are shared with `existing`.
pub fn decode_change(existing: &PieceTable, wire: &WireChange) -> Result<ChangeUpdate, CoreError> {
    let changed_blocks = collect_blocks(&wire.changed_blocks);

    let mut blocks = existing.blocks().clone();
    blocks.extend(changed_blocks.iter().map(|(id, b)| (*id, Arc::clone(b))));

    let mut piece_table = PieceTable::from_parts(blocks, collect_pieces(&wire.piece_table))?;
    piece_table.prune_unreferenced();

    Ok(ChangeUpdate {
        file_path: wire.file_path.clone(),
        piece_table,
        changed_blocks,
    })
}
