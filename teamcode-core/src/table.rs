//! The piece table value and its algorithms.
//!
//! A `PieceTable` is immutable from the outside: every edit returns a new
//! table. Blocks and pieces are reference counted, so a new snapshot shares
//! every entry it did not touch with the one it was derived from.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::block::{BlockId, TextBlock};
use crate::error::CoreError;
use crate::piece::{FilePiece, Piece, PieceId};

/// A location in table coordinates: piece index plus line offset within it.
///
/// Ordering is lexicographic on `(index, offset)`, which is the document
/// order of two positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TablePosition {
    pub index: usize,
    pub offset: usize,
}

impl TablePosition {
    pub fn new(index: usize, offset: usize) -> Self {
        Self { index, offset }
    }

    /// Return `a` and `b` in document order. Equal positions keep their order.
    pub fn ordered(a: TablePosition, b: TablePosition) -> (TablePosition, TablePosition) {
        if a > b {
            (b, a)
        } else {
            (a, b)
        }
    }
}

/// Half-open range of piece indices `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PieceRange {
    pub start: usize,
    pub end: usize,
}

impl PieceRange {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A logical position named by piece id, as the editor reports it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Anchor {
    pub piece_id: PieceId,
    pub offset: usize,
}

impl Anchor {
    pub fn new(piece_id: impl Into<PieceId>, offset: usize) -> Self {
        Self {
            piece_id: piece_id.into(),
            offset,
        }
    }
}

/// A line range expressed the way the server expects a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchoredRange {
    pub index: usize,
    pub piece_id: PieceId,
    pub offset: usize,
    pub length: usize,
}

/// The client-side document: text blocks plus the ordered piece sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceTable {
    blocks: HashMap<BlockId, Arc<TextBlock>>,
    table: Vec<Arc<Piece>>,
}

impl Default for PieceTable {
    fn default() -> Self {
        Self::empty()
    }
}

impl PieceTable {
    /// A table with one empty piece on one empty block.
    pub fn empty() -> Self {
        Self::from_lines(Vec::new())
    }

    /// Build a table over `text`, split on `\n`. Empty text yields a
    /// single zero-length piece.
    pub fn from_text(text: &str) -> Self {
        if text.is_empty() {
            return Self::empty();
        }
        Self::from_lines(text.split('\n').map(str::to_string).collect())
    }

    /// One closed origin block holding `lines`, one unlocked piece over it.
    pub fn from_lines(lines: Vec<String>) -> Self {
        let length = lines.len();
        let mut blocks = HashMap::new();
        blocks.insert(BlockId::ORIGIN, Arc::new(TextBlock::new(lines, false)));
        let piece = Piece::new(PieceId::generate(), BlockId::ORIGIN, 0, length);
        Self {
            blocks,
            table: vec![Arc::new(piece)],
        }
    }

    /// Assemble a table from parts, checking that every piece is readable.
    pub fn from_parts(
        blocks: HashMap<BlockId, Arc<TextBlock>>,
        table: Vec<Arc<Piece>>,
    ) -> Result<Self, CoreError> {
        let pt = Self { blocks, table };
        pt.validate()?;
        Ok(pt)
    }

    fn validate(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::with_capacity(self.table.len());
        for piece in &self.table {
            if !seen.insert(&piece.piece_id) {
                return Err(CoreError::MalformedWire(format!(
                    "duplicate piece id {}",
                    piece.piece_id
                )));
            }
            let block = self.blocks.get(&piece.block_id).ok_or_else(|| {
                CoreError::MalformedWire(format!(
                    "piece {} references unknown block {}",
                    piece.piece_id, piece.block_id
                ))
            })?;
            if piece.end() > block.len() {
                return Err(CoreError::MalformedWire(format!(
                    "piece {} reads lines {}..{} of block {} with {} lines",
                    piece.piece_id,
                    piece.start,
                    piece.end(),
                    piece.block_id,
                    block.len()
                )));
            }
        }
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn pieces(&self) -> &[Arc<Piece>] {
        &self.table
    }

    pub fn blocks(&self) -> &HashMap<BlockId, Arc<TextBlock>> {
        &self.blocks
    }

    pub fn block(&self, block_id: BlockId) -> Option<&Arc<TextBlock>> {
        self.blocks.get(&block_id)
    }

    pub fn piece_count(&self) -> usize {
        self.table.len()
    }

    pub fn index_of(&self, piece_id: &PieceId) -> Option<usize> {
        self.table.iter().position(|p| &p.piece_id == piece_id)
    }

    pub fn piece(&self, piece_id: &PieceId) -> Result<&Arc<Piece>, CoreError> {
        self.table
            .iter()
            .find(|p| &p.piece_id == piece_id)
            .ok_or_else(|| CoreError::UnknownPiece(piece_id.clone()))
    }

    /// The block a piece reads from.
    pub fn block_of(&self, piece_id: &PieceId) -> Result<&Arc<TextBlock>, CoreError> {
        let piece = self.piece(piece_id)?;
        self.blocks.get(&piece.block_id).ok_or_else(|| {
            CoreError::MalformedWire(format!("missing block {}", piece.block_id))
        })
    }

    /// First piece locked by `username`, if any.
    pub fn owned_by(&self, username: &str) -> Option<&Arc<Piece>> {
        self.table.iter().find(|p| p.is_owned_by(username))
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Number of lines in the logical document.
    pub fn len(&self) -> usize {
        self.table.iter().map(|p| p.length).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Piece index and offset containing `line`, or `None` when out of range.
    pub fn try_line_to_position(&self, line: usize) -> Option<TablePosition> {
        let mut piece_start = 0;
        for (index, piece) in self.table.iter().enumerate() {
            if line >= piece_start && line < piece_start + piece.length {
                return Some(TablePosition::new(index, line - piece_start));
            }
            piece_start += piece.length;
        }
        None
    }

    /// Like [`try_line_to_position`](Self::try_line_to_position), but an
    /// out-of-range line maps to `{index: 0, offset: 0}`.
    pub fn line_to_position(&self, line: usize) -> TablePosition {
        self.try_line_to_position(line).unwrap_or_default()
    }

    /// Logical line at which piece `index` begins.
    pub fn start_of(&self, index: usize) -> usize {
        self.table.iter().take(index).map(|p| p.length).sum()
    }

    /// Pieces covering `length` lines from `line`.
    ///
    /// A zero-length request is anchored to the piece containing `line`.
    /// An invalid start or a request running past the end covers the
    /// whole table.
    pub fn range_covering(&self, line: usize, length: usize) -> PieceRange {
        let full = PieceRange {
            start: 0,
            end: self.table.len(),
        };
        let Some(pos) = self.try_line_to_position(line) else {
            return full;
        };
        if line.saturating_add(length) > self.len() {
            return full;
        }

        let mut covered = self.table[pos.index].length - pos.offset;
        let mut end = pos.index + 1;
        while covered < length && end < self.table.len() {
            covered += self.table[end].length;
            end += 1;
        }
        PieceRange {
            start: pos.index,
            end,
        }
    }

    /// Sort two anchors into document order and measure the lines between
    /// them, both ends inclusive.
    pub fn anchored_range(&self, a: &Anchor, b: &Anchor) -> Result<AnchoredRange, CoreError> {
        let pa = self.anchor_position(a)?;
        let pb = self.anchor_position(b)?;
        let (first, last) = TablePosition::ordered(pa, pb);

        let between: usize = self.table[first.index..last.index]
            .iter()
            .map(|p| p.length)
            .sum();
        let length = (between + last.offset + 1).saturating_sub(first.offset);

        Ok(AnchoredRange {
            index: first.index,
            piece_id: self.table[first.index].piece_id.clone(),
            offset: first.offset,
            length,
        })
    }

    /// Line count between `(start_piece, start_offset)` and
    /// `(end_piece, end_offset)`, inclusive.
    pub fn distance_between(
        &self,
        start_piece: &PieceId,
        start_offset: usize,
        end_piece: &PieceId,
        end_offset: usize,
    ) -> Result<usize, CoreError> {
        let range = self.anchored_range(
            &Anchor::new(start_piece.clone(), start_offset),
            &Anchor::new(end_piece.clone(), end_offset),
        )?;
        Ok(range.length)
    }

    fn anchor_position(&self, anchor: &Anchor) -> Result<TablePosition, CoreError> {
        self.index_of(&anchor.piece_id)
            .map(|index| TablePosition::new(index, anchor.offset))
            .ok_or_else(|| CoreError::UnknownPiece(anchor.piece_id.clone()))
    }

    // ── Text ─────────────────────────────────────────────────────

    /// The full document, one entry per line.
    pub fn stitch(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.len());
        for piece in &self.table {
            if let Some(block) = self.blocks.get(&piece.block_id) {
                lines.extend_from_slice(block.slice(piece.start, piece.length));
            }
        }
        lines
    }

    /// The full document joined with `\n`.
    pub fn stitch_text(&self) -> String {
        self.stitch().join("\n")
    }

    /// Lines belonging to one piece.
    pub fn text_of(&self, piece_id: &PieceId) -> Result<&[String], CoreError> {
        let piece = self.piece(piece_id)?;
        let block = self.block_of(piece_id)?;
        Ok(block.slice(piece.start, piece.length))
    }

    /// Renderable fragments, skipping zero-length pieces.
    pub fn project(&self) -> Vec<FilePiece> {
        self.table
            .iter()
            .filter(|p| p.length > 0)
            .filter_map(|p| {
                let block = self.blocks.get(&p.block_id)?;
                Some(FilePiece {
                    piece_id: p.piece_id.clone(),
                    text: block.slice(p.start, p.length).to_vec(),
                    open: block.open,
                    username: p.username.clone(),
                })
            })
            .collect()
    }

    // ── Edits ────────────────────────────────────────────────────

    /// Replace the text of one piece, returning the new snapshot.
    ///
    /// The piece ends up reading all of `lines` from offset 0 of its block.
    /// If the block is also read by other pieces, the edited piece moves to
    /// a fresh block so their views are unchanged.
    pub fn edit(&self, piece_id: &PieceId, lines: Vec<String>) -> Result<PieceTable, CoreError> {
        let index = self
            .index_of(piece_id)
            .ok_or_else(|| CoreError::UnknownPiece(piece_id.clone()))?;
        let piece = &self.table[index];
        let open = self.block_of(piece_id)?.open;

        let block_id = if self.is_block_shared(piece.block_id, index) {
            self.next_block_id()
        } else {
            piece.block_id
        };

        let new_piece = Piece {
            block_id,
            start: 0,
            length: lines.len(),
            ..Piece::clone(piece)
        };
        log::debug!(
            "edit piece {piece_id}: {} -> {} lines (block {block_id})",
            piece.length,
            new_piece.length
        );

        let mut blocks = self.blocks.clone();
        blocks.insert(block_id, Arc::new(TextBlock::new(lines, open)));
        let mut table = self.table.clone();
        table[index] = Arc::new(new_piece);

        Ok(Self { blocks, table })
    }

    /// Copy of `self` where `piece_id` keeps the piece and block it has in
    /// `local`. Used to stop a broadcast from overwriting text the local
    /// user is editing.
    pub fn keep_local_piece(
        &self,
        local: &PieceTable,
        piece_id: &PieceId,
    ) -> Result<PieceTable, CoreError> {
        let index = self
            .index_of(piece_id)
            .ok_or_else(|| CoreError::UnknownPiece(piece_id.clone()))?;
        let local_piece = local.piece(piece_id)?;
        let local_block = local.block_of(piece_id)?;

        let mut blocks = self.blocks.clone();
        let mut table = self.table.clone();

        if self.is_block_shared(local_piece.block_id, index) {
            let block_id = self.next_block_id();
            table[index] = Arc::new(Piece {
                block_id,
                ..Piece::clone(local_piece)
            });
            blocks.insert(block_id, Arc::clone(local_block));
        } else {
            table[index] = Arc::clone(local_piece);
            blocks.insert(local_piece.block_id, Arc::clone(local_block));
        }

        let mut merged = Self { blocks, table };
        merged.prune_unreferenced();
        Ok(merged)
    }

    /// Drop blocks no piece reads from.
    pub(crate) fn prune_unreferenced(&mut self) {
        let referenced: HashSet<BlockId> = self.table.iter().map(|p| p.block_id).collect();
        self.blocks.retain(|id, _| referenced.contains(id));
    }

    fn is_block_shared(&self, block_id: BlockId, except: usize) -> bool {
        self.table
            .iter()
            .enumerate()
            .any(|(i, p)| i != except && p.block_id == block_id)
    }

    fn next_block_id(&self) -> BlockId {
        self.blocks
            .keys()
            .max()
            .map_or(BlockId::ORIGIN, |id| id.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(n: usize, tag: &str) -> Vec<String> {
        (0..n).map(|i| format!("{tag}{i}")).collect()
    }

    /// One block per piece, with the given piece lengths.
    fn table_with(lengths: &[usize]) -> PieceTable {
        let mut blocks = HashMap::new();
        let mut table = Vec::new();
        for (i, &len) in lengths.iter().enumerate() {
            let id = BlockId(i as u64);
            blocks.insert(id, Arc::new(TextBlock::new(lines(len, &format!("b{i}-")), false)));
            table.push(Arc::new(Piece::new(PieceId::new(format!("p{i}")), id, 0, len)));
        }
        PieceTable::from_parts(blocks, table).unwrap()
    }

    fn pid(s: &str) -> PieceId {
        PieceId::from(s)
    }

    #[test]
    fn test_length_is_sum_of_pieces() {
        let t = table_with(&[5, 7, 19]);
        assert_eq!(t.len(), 31);
        assert_eq!(t.piece_count(), 3);
    }

    #[test]
    fn test_line_to_position_scenario() {
        let t = table_with(&[5, 7, 19]);
        assert_eq!(t.line_to_position(8), TablePosition::new(1, 3));
        assert_eq!(t.line_to_position(0), TablePosition::new(0, 0));
        assert_eq!(t.line_to_position(4), TablePosition::new(0, 4));
        assert_eq!(t.line_to_position(5), TablePosition::new(1, 0));
        assert_eq!(t.line_to_position(30), TablePosition::new(2, 18));
    }

    #[test]
    fn test_line_to_position_out_of_range_falls_back() {
        let t = table_with(&[5, 7, 19]);
        assert_eq!(t.line_to_position(31), TablePosition::default());
        assert_eq!(t.line_to_position(1000), TablePosition::new(0, 0));
        assert!(t.try_line_to_position(31).is_none());
    }

    #[test]
    fn test_line_to_position_skips_empty_pieces() {
        let t = table_with(&[0, 3, 0, 2]);
        assert_eq!(t.line_to_position(0), TablePosition::new(1, 0));
        assert_eq!(t.line_to_position(3), TablePosition::new(3, 0));
    }

    #[test]
    fn test_every_line_lands_in_its_piece() {
        let t = table_with(&[2, 0, 4, 1, 6]);
        for line in 0..t.len() {
            let pos = t.line_to_position(line);
            let start = t.start_of(pos.index);
            assert!(line >= start && line < start + t.pieces()[pos.index].length);
            assert_eq!(line - start, pos.offset);
        }
    }

    #[test]
    fn test_start_of() {
        let t = table_with(&[5, 7, 19]);
        assert_eq!(t.start_of(0), 0);
        assert_eq!(t.start_of(1), 5);
        assert_eq!(t.start_of(2), 12);
        assert_eq!(t.start_of(3), 31);
    }

    #[test]
    fn test_range_covering_scenario() {
        let t = table_with(&[5, 7, 19]);
        assert_eq!(t.range_covering(1, 6), PieceRange { start: 0, end: 2 });
        assert_eq!(t.range_covering(0, 100), PieceRange { start: 0, end: 3 });
    }

    #[test]
    fn test_range_covering_zero_length_is_anchored() {
        let t = table_with(&[5, 7, 19]);
        assert_eq!(t.range_covering(6, 0), PieceRange { start: 1, end: 2 });
    }

    #[test]
    fn test_range_covering_within_one_piece() {
        let t = table_with(&[5, 7, 19]);
        assert_eq!(t.range_covering(13, 4), PieceRange { start: 2, end: 3 });
        assert_eq!(t.range_covering(5, 7), PieceRange { start: 1, end: 2 });
    }

    #[test]
    fn test_range_covering_invalid_start_is_full() {
        let t = table_with(&[5, 7, 19]);
        assert_eq!(t.range_covering(40, 1), PieceRange { start: 0, end: 3 });
        assert_eq!(t.range_covering(20, 12), PieceRange { start: 0, end: 3 });
    }

    #[test]
    fn test_range_covering_empty_document() {
        let t = PieceTable::empty();
        let range = t.range_covering(0, 0);
        assert_eq!(range, PieceRange { start: 0, end: 1 });
        assert_eq!(range.len(), 1);
    }

    #[test]
    fn test_distance_within_one_piece() {
        let t = table_with(&[5, 7, 19]);
        assert_eq!(t.distance_between(&pid("p1"), 2, &pid("p1"), 4).unwrap(), 3);
        assert_eq!(t.distance_between(&pid("p1"), 3, &pid("p1"), 3).unwrap(), 1);
    }

    #[test]
    fn test_distance_across_pieces() {
        let t = table_with(&[5, 7, 19]);
        // lines 3..=4 of p0, all of p1, lines 0..=1 of p2
        assert_eq!(t.distance_between(&pid("p0"), 3, &pid("p2"), 1).unwrap(), 11);
    }

    #[test]
    fn test_anchored_range_orders_anchors() {
        let t = table_with(&[5, 7, 19]);
        let forward = t
            .anchored_range(&Anchor::new("p0", 3), &Anchor::new("p2", 1))
            .unwrap();
        let backward = t
            .anchored_range(&Anchor::new("p2", 1), &Anchor::new("p0", 3))
            .unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward.piece_id, pid("p0"));
        assert_eq!(forward.offset, 3);
        assert_eq!(forward.index, 0);
    }

    #[test]
    fn test_distance_unknown_piece() {
        let t = table_with(&[5, 7]);
        let err = t.distance_between(&pid("nope"), 0, &pid("p1"), 0).unwrap_err();
        assert_eq!(err, CoreError::UnknownPiece(pid("nope")));
    }

    #[test]
    fn test_position_ordering() {
        let a = TablePosition::new(1, 9);
        let b = TablePosition::new(2, 0);
        assert_eq!(TablePosition::ordered(b, a), (a, b));
        assert_eq!(TablePosition::ordered(a, b), (a, b));

        let c = TablePosition::new(1, 2);
        assert!(c < a);
        assert_eq!(TablePosition::ordered(c, c), (c, c));
    }

    #[test]
    fn test_stitch_reads_piece_views() {
        let mut blocks = HashMap::new();
        blocks.insert(BlockId(0), Arc::new(TextBlock::new(lines(6, "o"), false)));
        blocks.insert(BlockId(1), Arc::new(TextBlock::new(vec!["new".into()], true)));
        let table = vec![
            Arc::new(Piece::new(pid("a"), BlockId(0), 0, 2)),
            Arc::new(Piece::new(pid("lock"), BlockId(1), 0, 1)),
            Arc::new(Piece::new(pid("b"), BlockId(0), 4, 2)),
        ];
        let t = PieceTable::from_parts(blocks, table).unwrap();
        assert_eq!(t.stitch(), vec!["o0", "o1", "new", "o4", "o5"]);
        assert_eq!(t.stitch_text(), "o0\no1\nnew\no4\no5");
        assert_eq!(t.text_of(&pid("b")).unwrap(), &["o4".to_string(), "o5".to_string()]);
    }

    #[test]
    fn test_project_skips_empty_pieces() {
        let mut t = table_with(&[2, 0, 3]);
        let lock = Piece {
            username: "alice".into(),
            ..Piece::clone(&t.table[2])
        };
        t.table[2] = Arc::new(lock);

        let file = t.project();
        assert_eq!(file.len(), 2);
        assert_eq!(file[0].piece_id, pid("p0"));
        assert_eq!(file[1].piece_id, pid("p2"));
        assert_eq!(file[1].username, "alice");
        assert_eq!(file[1].text.len(), 3);
    }

    #[test]
    fn test_edit_is_copy_on_write() {
        let t = table_with(&[5, 7, 19]);
        let before = t.clone();
        let edited = t.edit(&pid("p1"), vec!["x".into(), "y".into()]).unwrap();

        assert_eq!(t, before);
        assert_eq!(edited.len(), 5 + 2 + 19);
        assert_eq!(edited.text_of(&pid("p1")).unwrap(), &["x".to_string(), "y".to_string()]);

        assert!(Arc::ptr_eq(&t.table[0], &edited.table[0]));
        assert!(Arc::ptr_eq(&t.table[2], &edited.table[2]));
        assert!(Arc::ptr_eq(&t.blocks[&BlockId(0)], &edited.blocks[&BlockId(0)]));
        assert!(Arc::ptr_eq(&t.blocks[&BlockId(2)], &edited.blocks[&BlockId(2)]));
        assert!(!Arc::ptr_eq(&t.table[1], &edited.table[1]));
    }

    #[test]
    fn test_edit_changes_only_piece_span() {
        let t = table_with(&[3, 4, 2]);
        let edited = t.edit(&pid("p1"), vec!["only".into()]).unwrap();
        let old = t.stitch();
        let new = edited.stitch();
        assert_eq!(new[..3], old[..3]);
        assert_eq!(new[3], "only");
        assert_eq!(new[4..], old[7..]);
    }

    #[test]
    fn test_edit_shared_block_moves_piece() {
        let t = PieceTable::from_lines(lines(6, "o"));
        let origin = t.pieces()[0].piece_id.clone();
        let mut blocks = t.blocks.clone();
        blocks.insert(BlockId(0), Arc::new(TextBlock::new(lines(6, "o"), false)));
        let table = vec![
            Arc::new(Piece::new(origin.clone(), BlockId(0), 0, 3)),
            Arc::new(Piece::new(pid("tail"), BlockId(0), 3, 3)),
        ];
        let t = PieceTable::from_parts(blocks, table).unwrap();

        let edited = t.edit(&pid("tail"), vec!["t".into()]).unwrap();
        assert_eq!(edited.stitch(), vec!["o0", "o1", "o2", "t"]);
        assert_eq!(edited.piece(&pid("tail")).unwrap().block_id, BlockId(1));
        assert!(Arc::ptr_eq(&t.blocks[&BlockId(0)], &edited.blocks[&BlockId(0)]));
    }

    #[test]
    fn test_edit_unknown_piece() {
        let t = table_with(&[1]);
        assert!(matches!(
            t.edit(&pid("missing"), vec![]),
            Err(CoreError::UnknownPiece(_))
        ));
    }

    #[test]
    fn test_from_text() {
        let t = PieceTable::from_text("a\nb\nc");
        assert_eq!(t.len(), 3);
        assert_eq!(t.stitch(), vec!["a", "b", "c"]);

        let empty = PieceTable::from_text("");
        assert_eq!(empty.len(), 0);
        assert_eq!(empty.piece_count(), 1);
        assert!(empty.project().is_empty());
        assert!(empty.block(BlockId::ORIGIN).unwrap().is_empty());
    }

    #[test]
    fn test_from_parts_rejects_bad_pieces() {
        let mut blocks = HashMap::new();
        blocks.insert(BlockId(0), Arc::new(TextBlock::new(lines(2, "x"), false)));

        let too_long = vec![Arc::new(Piece::new(pid("a"), BlockId(0), 1, 2))];
        assert!(PieceTable::from_parts(blocks.clone(), too_long).is_err());

        let missing = vec![Arc::new(Piece::new(pid("a"), BlockId(9), 0, 1))];
        assert!(PieceTable::from_parts(blocks.clone(), missing).is_err());

        let dup = vec![
            Arc::new(Piece::new(pid("a"), BlockId(0), 0, 1)),
            Arc::new(Piece::new(pid("a"), BlockId(0), 1, 1)),
        ];
        assert!(PieceTable::from_parts(blocks, dup).is_err());
    }

    #[test]
    fn test_keep_local_piece() {
        let local = table_with(&[2, 3]);
        let mine = Piece {
            username: "alice".into(),
            ..Piece::clone(&local.table[1])
        };
        let mut local = local;
        local.table[1] = Arc::new(mine);
        let local = local.edit(&pid("p1"), vec!["typing".into()]).unwrap();

        // The broadcast still carries the pre-edit text for p1.
        let mut remote = table_with(&[2, 3]);
        remote.table[1] = Arc::new(Piece {
            username: "alice".into(),
            ..Piece::clone(&remote.table[1])
        });

        let merged = remote.keep_local_piece(&local, &pid("p1")).unwrap();
        assert_eq!(merged.text_of(&pid("p1")).unwrap(), &["typing".to_string()]);
        assert!(Arc::ptr_eq(
            merged.piece(&pid("p1")).unwrap(),
            local.piece(&pid("p1")).unwrap()
        ));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_owned_by() {
        let mut t = table_with(&[1, 1]);
        assert!(t.owned_by("bob").is_none());
        t.table[1] = Arc::new(Piece {
            username: "bob".into(),
            ..Piece::clone(&t.table[1])
        });
        assert_eq!(t.owned_by("bob").unwrap().piece_id, pid("p1"));
        assert!(t.owned_by("").is_none());
    }
}
