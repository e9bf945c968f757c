//! # teamcode-collab: Synchronization protocol for the TeamCode client
//!
//! Keeps a local [`PieceTable`](teamcode_core::PieceTable) consistent with
//! the server's authoritative copy. Concurrent edits are prevented, not
//! merged: a client must hold the lock on a piece before it may change it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  ClientMessage   ┌──────────────┐   JSON envelope   ┌────────┐
//! │ SessionController│ ───────────────► │ WsTransport  │ ◄───────────────► │ Server │
//! │  (I/O + timeouts)│ ◄─────────────── │ (correlation)│     WebSocket     └────────┘
//! └────────┬─────────┘  ServerMessage   └──────┬───────┘
//!          │                                   │ TransportEvent (fan-out)
//!          ▼                                   ▼
//! ┌──────────────────┐                  subscribers
//! │ SessionState     │  phase, active PieceTable, tabs, cursors, username
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: message envelope and typed message contents
//! - [`transport`]: `Transport` trait and the WebSocket implementation
//! - [`session`]: per-document state machine and controller
//! - [`presence`]: remote cursors and their colors
//! - [`tabs`]: open-document bookmarks
//! - [`config`]: client settings

pub mod config;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod tabs;
pub mod transport;

// Re-exports for convenience
pub use config::{ClientConfig, ConfigError};
pub use presence::{Cursor, CursorBoard, CursorColor};
pub use protocol::{ClientMessage, Envelope, MessageType, ProtocolError, ServerMessage};
pub use session::{
    ChangeOutcome, DocumentPhase, LockOutcome, OpenOutcome, SessionController, SessionError,
    SessionState,
};
pub use tabs::{Direction, Tab, TabList};
pub use transport::{ConnectionState, Transport, TransportEvent, WsTransport};
