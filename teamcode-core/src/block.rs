//! Text blocks: the raw line buffers that pieces point into.
//!
//! A block is never mutated once published in a table. Edits build a new
//! block value and swap the `Arc` in the next table snapshot, so older
//! snapshots keep reading the lines they were created with.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a text block, assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u64);

impl BlockId {
    /// The block holding the original file contents.
    pub const ORIGIN: BlockId = BlockId(0);

    /// The id following this one.
    pub fn next(self) -> BlockId {
        BlockId(self.0 + 1)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A buffer of text lines, stored without line terminators.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextBlock {
    /// True while some client holds an edit lock on a piece of this block.
    pub open: bool,
    pub lines: Vec<String>,
}

impl TextBlock {
    pub fn new(lines: Vec<String>, open: bool) -> Self {
        Self { open, lines }
    }

    /// A closed block with no lines.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of lines in the block.
    #[inline]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines `[start, start + length)`, clamped to the block.
    pub fn slice(&self, start: usize, length: usize) -> &[String] {
        let start = start.min(self.lines.len());
        let end = start.saturating_add(length).min(self.lines.len());
        &self.lines[start..end]
    }
}
