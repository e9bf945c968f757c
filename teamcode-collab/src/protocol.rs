//! JSON protocol spoken with the TeamCode server.
//!
//! Wire format (one JSON object per WebSocket text frame):
//! ```text
//! {
//!   "type":          "file-lock-request",
//!   "uuid":          "5f0c…",            unique per message
//!   "sender":        "CLIENT",
//!   "pref_dest":     null,
//!   "content":       { … },               shape depends on "type"
//!   "response_uuid": "…"                  optional, set on responses
//! }
//! ```
//!
//! Envelopes are validated once, at the transport boundary: inbound
//! envelopes become a [`ServerMessage`], outbound ones are built from a
//! [`ClientMessage`]. Nothing past the transport handles raw JSON.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use teamcode_core::{PieceId, WireChange, WireDocument};
use thiserror::Error;
use uuid::Uuid;

/// Sender tag used for every message this client emits.
pub const CLIENT_SENDER: &str = "CLIENT";

/// Message types understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    /// Claim a username for this connection
    LoginRequest,
    LoginResponse,
    /// Announce intent to edit a file
    FileJoin,
    /// Release a file and its locks
    FileLeave,
    FileContentRequest,
    FileContentResponse,
    FileLockRequest,
    FileLockResponse,
    FileUnlockRequest,
    /// Edited text of a locked piece
    FileDelta,
    FileDeltaBroadcast,
    /// Piece table changed after a lock, unlock or leave
    FilePieceTableChangeBroadcast,
    CursorMove,
    CursorMoveBroadcast,
    FileJoinBroadcast,
    FileLeaveBroadcast,
    /// Every cursor in a file
    CursorListRequest,
    CursorListResponse,
    ErrorResponse,
}

impl MessageType {
    const ALL: [MessageType; 19] = [
        MessageType::LoginRequest,
        MessageType::LoginResponse,
        MessageType::FileJoin,
        MessageType::FileLeave,
        MessageType::FileContentRequest,
        MessageType::FileContentResponse,
        MessageType::FileLockRequest,
        MessageType::FileLockResponse,
        MessageType::FileUnlockRequest,
        MessageType::FileDelta,
        MessageType::FileDeltaBroadcast,
        MessageType::FilePieceTableChangeBroadcast,
        MessageType::CursorMove,
        MessageType::CursorMoveBroadcast,
        MessageType::FileJoinBroadcast,
        MessageType::FileLeaveBroadcast,
        MessageType::CursorListRequest,
        MessageType::CursorListResponse,
        MessageType::ErrorResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginRequest => "login-request",
            Self::LoginResponse => "login-response",
            Self::FileJoin => "file-join",
            Self::FileLeave => "file-leave",
            Self::FileContentRequest => "file-content-request",
            Self::FileContentResponse => "file-content-response",
            Self::FileLockRequest => "file-lock-request",
            Self::FileLockResponse => "file-lock-response",
            Self::FileUnlockRequest => "file-unlock-request",
            Self::FileDelta => "file-delta",
            Self::FileDeltaBroadcast => "file-delta-broadcast",
            Self::FilePieceTableChangeBroadcast => "file-piece-table-change-broadcast",
            Self::CursorMove => "cursor-move",
            Self::CursorMoveBroadcast => "cursor-move-broadcast",
            Self::FileJoinBroadcast => "file-join-broadcast",
            Self::FileLeaveBroadcast => "file-leave-broadcast",
            Self::CursorListRequest => "cursor-list-request",
            Self::CursorListResponse => "cursor-list-response",
            Self::ErrorResponse => "error-response",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }
}

// ───────────────────────────────────────────────────────────────────
// Message contents
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

/// The server may rename us to keep usernames unique (`anna` → `anna_1`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub succeed: bool,
    #[serde(default)]
    pub new_username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileJoin {
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLeave {
    pub file_path: String,
    /// Leave even if the server holds unsaved changes.
    pub force_exit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContentRequest {
    pub file_path: String,
    pub start: usize,
    /// `None` requests the whole file.
    pub length: Option<usize>,
}

impl FileContentRequest {
    pub fn whole_file(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            start: 0,
            length: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLockRequest {
    pub file_path: String,
    pub piece_uuid: PieceId,
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLockResponse {
    #[serde(default)]
    pub file_path: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUnlockRequest {
    pub file_path: String,
    pub lock_id: PieceId,
}

/// The full text of one piece after a local edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDelta {
    pub file_path: String,
    pub piece_uuid: PieceId,
    /// Lines joined with `\n`.
    pub content: String,
}

impl FileDelta {
    pub fn from_lines(file_path: impl Into<String>, piece_uuid: PieceId, lines: &[String]) -> Self {
        Self {
            file_path: file_path.into(),
            piece_uuid,
            content: lines.join("\n"),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        if self.content.is_empty() {
            return Vec::new();
        }
        self.content.split('\n').map(str::to_string).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorMove {
    pub file_path: String,
    pub piece_id: PieceId,
    /// Line offset within the piece.
    pub offset: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorMoveBroadcast {
    pub username: String,
    pub file_path: String,
    pub piece_id: PieceId,
    pub offset: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorListRequest {
    pub file_path: String,
}

/// One row of a cursor listing: `[username, piece_id, offset, column]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "(String, PieceId, usize, usize)",
    into = "(String, PieceId, usize, usize)"
)]
pub struct CursorListEntry {
    pub username: String,
    pub piece_id: PieceId,
    pub offset: usize,
    pub column: usize,
}

impl From<(String, PieceId, usize, usize)> for CursorListEntry {
    fn from((username, piece_id, offset, column): (String, PieceId, usize, usize)) -> Self {
        Self {
            username,
            piece_id,
            offset,
            column,
        }
    }
}

impl From<CursorListEntry> for (String, PieceId, usize, usize) {
    fn from(entry: CursorListEntry) -> Self {
        (entry.username, entry.piece_id, entry.offset, entry.column)
    }
}

/// Cursors of everyone in the file the listing was requested for. The
/// server does not name the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorListResponse {
    pub cursor_list: Vec<CursorListEntry>,
}

/// A peer joined or left a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerFileEvent {
    pub username: String,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(default)]
    pub error_code: i64,
}

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub uuid: Uuid,
    #[serde(default, deserialize_with = "sender_as_string")]
    pub sender: String,
    #[serde(default)]
    pub pref_dest: Option<String>,
    #[serde(default)]
    pub content: Value,
    /// Id of the request this message answers, when the server sets it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_uuid: Option<Uuid>,
}

/// The server addresses its own messages with structured senders; keep
/// them as their JSON text.
fn sender_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

impl Envelope {
    /// Create an envelope with a fresh message id.
    pub fn new(msg_type: MessageType, sender: impl Into<String>, content: Value) -> Self {
        Self {
            msg_type: msg_type.as_str().to_string(),
            uuid: Uuid::new_v4(),
            sender: sender.into(),
            pref_dest: None,
            content,
            response_uuid: None,
        }
    }

    /// Known message type, if any.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::parse(&self.msg_type)
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    fn content_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.content.clone()).map_err(|e| {
            ProtocolError::Deserialization(format!("{}: {e}", self.msg_type))
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Typed messages
// ───────────────────────────────────────────────────────────────────

/// Messages this client sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    LoginRequest(LoginRequest),
    FileJoin(FileJoin),
    FileLeave(FileLeave),
    FileContentRequest(FileContentRequest),
    FileLockRequest(FileLockRequest),
    FileUnlockRequest(FileUnlockRequest),
    FileDelta(FileDelta),
    CursorMove(CursorMove),
    CursorListRequest(CursorListRequest),
}

impl ClientMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::LoginRequest(_) => MessageType::LoginRequest,
            Self::FileJoin(_) => MessageType::FileJoin,
            Self::FileLeave(_) => MessageType::FileLeave,
            Self::FileContentRequest(_) => MessageType::FileContentRequest,
            Self::FileLockRequest(_) => MessageType::FileLockRequest,
            Self::FileUnlockRequest(_) => MessageType::FileUnlockRequest,
            Self::FileDelta(_) => MessageType::FileDelta,
            Self::CursorMove(_) => MessageType::CursorMove,
            Self::CursorListRequest(_) => MessageType::CursorListRequest,
        }
    }

    /// The file this message is about, if any.
    pub fn file_path(&self) -> Option<&str> {
        let path = match self {
            Self::LoginRequest(_) => return None,
            Self::FileJoin(m) => &m.file_path,
            Self::FileLeave(m) => &m.file_path,
            Self::FileContentRequest(m) => &m.file_path,
            Self::FileLockRequest(m) => &m.file_path,
            Self::FileUnlockRequest(m) => &m.file_path,
            Self::FileDelta(m) => &m.file_path,
            Self::CursorMove(m) => &m.file_path,
            Self::CursorListRequest(m) => &m.file_path,
        };
        Some(path)
    }

    fn content(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::LoginRequest(m) => serde_json::to_value(m),
            Self::FileJoin(m) => serde_json::to_value(m),
            Self::FileLeave(m) => serde_json::to_value(m),
            Self::FileContentRequest(m) => serde_json::to_value(m),
            Self::FileLockRequest(m) => serde_json::to_value(m),
            Self::FileUnlockRequest(m) => serde_json::to_value(m),
            Self::FileDelta(m) => serde_json::to_value(m),
            Self::CursorMove(m) => serde_json::to_value(m),
            Self::CursorListRequest(m) => serde_json::to_value(m),
        }
    }

    /// Wrap in an envelope with a fresh message id.
    pub fn to_envelope(&self, sender: &str) -> Result<Envelope, ProtocolError> {
        let content = self
            .content()
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Envelope::new(self.message_type(), sender, content))
    }
}

/// Messages the server sends, validated.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    LoginResponse(LoginResponse),
    ContentResponse(WireDocument),
    LockResponse(FileLockResponse),
    PieceTableChange(WireChange),
    Delta(FileDelta),
    CursorMoved(CursorMoveBroadcast),
    PeerJoined(PeerFileEvent),
    PeerLeft(PeerFileEvent),
    CursorList(CursorListResponse),
    Error(ErrorResponse),
    /// A type this client does not handle.
    Unknown(String),
}

impl ServerMessage {
    /// Validate an inbound envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let Some(msg_type) = envelope.message_type() else {
            return Ok(Self::Unknown(envelope.msg_type.clone()));
        };

        let msg = match msg_type {
            MessageType::LoginResponse => Self::LoginResponse(envelope.content_as()?),
            MessageType::FileContentResponse => Self::ContentResponse(envelope.content_as()?),
            MessageType::FileLockResponse => Self::LockResponse(envelope.content_as()?),
            MessageType::FilePieceTableChangeBroadcast => {
                Self::PieceTableChange(envelope.content_as()?)
            }
            MessageType::FileDeltaBroadcast => Self::Delta(envelope.content_as()?),
            MessageType::CursorMoveBroadcast => Self::CursorMoved(envelope.content_as()?),
            MessageType::FileJoinBroadcast => Self::PeerJoined(envelope.content_as()?),
            MessageType::FileLeaveBroadcast => Self::PeerLeft(envelope.content_as()?),
            MessageType::CursorListResponse => Self::CursorList(envelope.content_as()?),
            MessageType::ErrorResponse => Self::Error(envelope.content_as()?),
            other => return Err(ProtocolError::UnexpectedMessage(other.as_str().to_string())),
        };
        Ok(msg)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            Self::LoginResponse(_) => Some(MessageType::LoginResponse),
            Self::ContentResponse(_) => Some(MessageType::FileContentResponse),
            Self::LockResponse(_) => Some(MessageType::FileLockResponse),
            Self::PieceTableChange(_) => Some(MessageType::FilePieceTableChangeBroadcast),
            Self::Delta(_) => Some(MessageType::FileDeltaBroadcast),
            Self::CursorMoved(_) => Some(MessageType::CursorMoveBroadcast),
            Self::PeerJoined(_) => Some(MessageType::FileJoinBroadcast),
            Self::PeerLeft(_) => Some(MessageType::FileLeaveBroadcast),
            Self::CursorList(_) => Some(MessageType::CursorListResponse),
            Self::Error(_) => Some(MessageType::ErrorResponse),
            Self::Unknown(_) => None,
        }
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected message type: {0}")]
    UnexpectedMessage(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Not connected")]
    NotConnected,
}
