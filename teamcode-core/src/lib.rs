//! # teamcode-core: Piece table buffer for the TeamCode client
//!
//! An open document is a sequence of immutable line fragments ("pieces")
//! that view ranges of shared text blocks. The server owns the authoritative
//! copy; this crate owns the client-side value and its wire conversion.
//!
//! ## Architecture
//!
//! ```text
//!        PieceTable
//!   ┌──────────────────────────────┐
//!   │ table:  [P0] [P1] [P2] ...   │  logical order = document order
//!   │           │    │    │        │
//!   │           ▼    ▼    ▼        │
//!   │ blocks: {0: TextBlock, 7: …} │  Arc-shared between snapshots
//!   └──────────────────────────────┘
//!              ▲          │
//!   decode_*   │          │ encode_document
//!              │          ▼
//!        WireDocument / WireChange (JSON tuples)
//! ```
//!
//! ## Modules
//!
//! - [`block`]: `TextBlock` line buffers
//! - [`piece`]: `Piece`, identifiers and the `FilePiece` projection
//! - [`table`]: `PieceTable` and its query/edit algorithms
//! - [`wire`]: conversion to and from the server wire format

pub mod block;
pub mod error;
pub mod piece;
pub mod table;
pub mod wire;

pub use block::{BlockId, TextBlock};
pub use error::CoreError;
pub use piece::{FilePiece, Piece, PieceId};
pub use table::{Anchor, AnchoredRange, PieceRange, PieceTable, TablePosition};
pub use wire::{
    decode_change, decode_document, encode_document, ChangeUpdate, WireBlock, WireChange,
    WireDocument, WirePiece,
};
