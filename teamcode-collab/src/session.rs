//! Per-document session: state machine plus the controller that drives it.
//!
//! ```text
//!            open_file            content response        lock granted
//!  Closed ─────────────► Opening ─────────────────► Open ──────────────► Locked
//!    ▲                      │ timeout / error         ▲  release / revoked  │
//!    │                      └──► previous phase       └─────────────────────┘
//!    └──────────────── close_file (last tab) ───────────────────────────────┘
//! ```
//!
//! [`SessionState`] holds everything and changes only through synchronous
//! methods. [`SessionController`] does the I/O around them and never holds
//! the state lock while waiting on the server. Each open bumps a generation
//! counter; a response carrying an older generation is discarded.

use std::sync::Arc;

use teamcode_core::{
    decode_change, decode_document, Anchor, AnchoredRange, CoreError, PieceId, PieceTable,
    WireChange, WireDocument,
};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};

use crate::config::ClientConfig;
use crate::presence::CursorBoard;
use crate::protocol::{
    ClientMessage, CursorListEntry, CursorListRequest, CursorMove, CursorMoveBroadcast,
    FileContentRequest, FileDelta, FileJoin, FileLeave, FileLockRequest, FileUnlockRequest,
    LoginRequest, MessageType, PeerFileEvent, ProtocolError, ServerMessage,
};
use crate::tabs::{Direction, TabList};
use crate::transport::{Transport, TransportEvent};

/// Lifecycle of the active document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentPhase {
    Closed,
    /// Waiting for the content of `file_path`. `previous` is restored if
    /// the open fails.
    Opening {
        file_path: String,
        previous: Box<DocumentPhase>,
    },
    Open,
    /// The server granted a lock on `range`. `piece_id` is filled in once a
    /// change broadcast shows the locked piece.
    Locked {
        range: AnchoredRange,
        piece_id: Option<PieceId>,
    },
}

impl DocumentPhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opening { .. } => "opening",
            Self::Open => "open",
            Self::Locked { .. } => "locked",
        }
    }
}

/// Session errors. All are recoverable; the last good table is kept.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Lock denied in {0}")]
    LockDenied(String),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("No active document")]
    NoActiveDocument,
    #[error("Cannot {operation} while {phase}")]
    InvalidState {
        operation: &'static str,
        phase: &'static str,
    },
    #[error("Piece {0} is not locked by this user")]
    NotLockOwner(PieceId),
    #[error("Server error {code}: {message}")]
    Server { message: String, code: i64 },
    #[error("Login refused for {0}")]
    LoginRejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened { file_path: String, lines: usize },
    /// Another open or a close happened while waiting; the response was
    /// dropped.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted(AnchoredRange),
    /// The document changed while waiting.
    Superseded,
}

/// What an inbound event did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// A change broadcast replaced the active table. `kept_local` names
    /// a locally locked piece whose text was preserved.
    Applied { kept_local: Option<PieceId> },
    /// A change broadcast no longer shows our lock.
    LockLost,
    /// A delta rewrote one piece.
    PieceUpdated(PieceId),
    CursorsChanged,
    /// The active document was fetched again after a reconnect.
    Resynced,
    /// Not about the active document, or nothing to do.
    Ignored,
}

/// All client-side session data.
#[derive(Debug, Clone)]
pub struct SessionState {
    username: String,
    active_path: Option<String>,
    phase: DocumentPhase,
    table: PieceTable,
    tabs: TabList,
    cursors: CursorBoard,
    generation: u64,
}

impl SessionState {
    pub fn new(username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            cursors: CursorBoard::new(username.clone()),
            username,
            active_path: None,
            phase: DocumentPhase::Closed,
            table: PieceTable::empty(),
            tabs: TabList::new(),
            generation: 0,
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn active_path(&self) -> Option<&str> {
        self.active_path.as_deref()
    }

    pub fn phase(&self) -> &DocumentPhase {
        &self.phase
    }

    pub fn table(&self) -> &PieceTable {
        &self.table
    }

    pub fn tabs(&self) -> &TabList {
        &self.tabs
    }

    pub fn cursors(&self) -> &CursorBoard {
        &self.cursors
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn require_active(&self) -> Result<&str, SessionError> {
        self.active_path
            .as_deref()
            .ok_or(SessionError::NoActiveDocument)
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Take the name the server assigned at login. Pieces are stamped
    /// with it, so ownership checks use it from now on.
    pub fn adopt_username(&mut self, username: &str) {
        if username != self.username {
            log::info!("server renamed {} to {username}", self.username);
        }
        self.username = username.to_string();
        self.cursors.set_local_username(username);
    }

    // ── Opening ──────────────────────────────────────────────────

    /// Enter `Opening` for `file_path`. Returns the generation the response
    /// must carry.
    pub fn begin_open(&mut self, file_path: &str) -> u64 {
        self.generation += 1;
        let previous = match std::mem::replace(&mut self.phase, DocumentPhase::Closed) {
            // Opening twice: fall back to whatever was there before the first.
            DocumentPhase::Opening { previous, .. } => previous,
            other => Box::new(other),
        };
        self.phase = DocumentPhase::Opening {
            file_path: file_path.to_string(),
            previous,
        };
        log::debug!("opening {file_path} (generation {})", self.generation);
        self.generation
    }

    /// Install a content response.
    ///
    /// A malformed document leaves the previous table in place.
    pub fn finish_open(
        &mut self,
        generation: u64,
        file_path: &str,
        wire: &WireDocument,
    ) -> Result<OpenOutcome, SessionError> {
        if !self.is_current(generation) {
            log::debug!("dropping stale content response for {file_path}");
            return Ok(OpenOutcome::Superseded);
        }
        let table = match decode_document(wire) {
            Ok(table) => table,
            Err(e) => {
                self.abandon_open(generation);
                return Err(e.into());
            }
        };

        let lines = table.len();
        self.table = table;
        self.active_path = Some(file_path.to_string());
        self.phase = DocumentPhase::Open;
        self.tabs.open(file_path);
        log::info!("opened {file_path}: {lines} lines");

        Ok(OpenOutcome::Opened {
            file_path: file_path.to_string(),
            lines,
        })
    }

    /// Undo [`begin_open`](Self::begin_open) after a failed request.
    pub fn abandon_open(&mut self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        if let DocumentPhase::Opening { previous, .. } =
            std::mem::replace(&mut self.phase, DocumentPhase::Closed)
        {
            self.phase = *previous;
        }
    }

    // ── Locks ────────────────────────────────────────────────────

    /// Build the lock request for the lines between two anchors.
    pub fn lock_target(
        &self,
        start: &Anchor,
        end: &Anchor,
    ) -> Result<(FileLockRequest, AnchoredRange, u64), SessionError> {
        let file_path = self.require_active()?;
        if self.phase != DocumentPhase::Open {
            return Err(SessionError::InvalidState {
                operation: "request a lock",
                phase: self.phase.name(),
            });
        }

        let range = self.table.anchored_range(start, end)?;
        let request = FileLockRequest {
            file_path: file_path.to_string(),
            piece_uuid: range.piece_id.clone(),
            offset: range.offset,
            length: range.length,
        };
        Ok((request, range, self.generation))
    }

    /// Record the server's answer to a lock request.
    pub fn finish_lock(
        &mut self,
        generation: u64,
        range: AnchoredRange,
        granted: bool,
    ) -> Result<LockOutcome, SessionError> {
        if !self.is_current(generation) || self.phase != DocumentPhase::Open {
            log::debug!("dropping stale lock response");
            return Ok(LockOutcome::Superseded);
        }
        let file_path = self.require_active()?.to_string();
        if !granted {
            log::info!("lock denied in {file_path} at {}+{}", range.piece_id, range.offset);
            return Err(SessionError::LockDenied(file_path));
        }

        log::info!("lock granted in {file_path}: {} lines", range.length);
        self.phase = DocumentPhase::Locked {
            range: range.clone(),
            piece_id: None,
        };
        Ok(LockOutcome::Granted(range))
    }

    /// Build the unlock request for a piece we own and return to `Open`.
    pub fn release_target(&mut self, piece_id: &PieceId) -> Result<FileUnlockRequest, SessionError> {
        let file_path = self.require_active()?.to_string();
        let piece = self.table.piece(piece_id)?;
        if !piece.is_owned_by(&self.username) {
            return Err(SessionError::NotLockOwner(piece_id.clone()));
        }
        if matches!(self.phase, DocumentPhase::Locked { .. }) {
            self.phase = DocumentPhase::Open;
        }
        Ok(FileUnlockRequest {
            file_path,
            lock_id: piece_id.clone(),
        })
    }

    // ── Edits ────────────────────────────────────────────────────

    /// Replace the text of a piece we hold the lock on.
    pub fn apply_local_edit(
        &mut self,
        piece_id: &PieceId,
        lines: Vec<String>,
    ) -> Result<FileDelta, SessionError> {
        let file_path = self.require_active()?.to_string();
        if !self.table.piece(piece_id)?.is_owned_by(&self.username) {
            return Err(SessionError::NotLockOwner(piece_id.clone()));
        }
        let delta = FileDelta::from_lines(file_path, piece_id.clone(), &lines);
        self.table = self.table.edit(piece_id, lines)?;
        Ok(delta)
    }

    /// Merge a change broadcast into the active table.
    ///
    /// A piece we hold locked keeps its local text; the broadcast is not
    /// expected to carry our own edits back, but an echo must not undo them.
    pub fn apply_remote_change(&mut self, wire: &WireChange) -> Result<ChangeOutcome, SessionError> {
        if self.active_path.as_deref() != Some(wire.file_path.as_str()) {
            return Ok(ChangeOutcome::Ignored);
        }

        let update = decode_change(&self.table, wire)?;
        let mut next = update.piece_table;

        let local_lock = self
            .table
            .owned_by(&self.username)
            .map(|p| p.piece_id.clone());
        let mut kept_local = None;
        if let Some(piece_id) = local_lock {
            let still_ours = next
                .piece(&piece_id)
                .map(|p| p.is_owned_by(&self.username))
                .unwrap_or(false);
            if still_ours {
                next = next.keep_local_piece(&self.table, &piece_id)?;
                kept_local = Some(piece_id);
            }
        }

        let owned_now = next.owned_by(&self.username).map(|p| p.piece_id.clone());
        let lock_lost = match &mut self.phase {
            DocumentPhase::Locked { piece_id, .. } => match owned_now {
                Some(id) => {
                    *piece_id = Some(id);
                    false
                }
                // Only a lock we have seen can be lost.
                None => piece_id.is_some(),
            },
            _ => false,
        };
        let outcome = if lock_lost {
            log::info!("lock in {} was released", wire.file_path);
            self.phase = DocumentPhase::Open;
            ChangeOutcome::LockLost
        } else {
            ChangeOutcome::Applied { kept_local }
        };

        log::debug!(
            "applied change to {}: {} pieces, {} changed blocks",
            wire.file_path,
            next.piece_count(),
            update.changed_blocks.len()
        );
        self.table = next;
        Ok(outcome)
    }

    /// Apply another user's edit of one piece.
    pub fn apply_remote_delta(&mut self, delta: &FileDelta) -> Result<ChangeOutcome, SessionError> {
        if self.active_path.as_deref() != Some(delta.file_path.as_str()) {
            return Ok(ChangeOutcome::Ignored);
        }
        if self.table.piece(&delta.piece_uuid)?.is_owned_by(&self.username) {
            log::debug!("ignoring delta for our own piece {}", delta.piece_uuid);
            return Ok(ChangeOutcome::Ignored);
        }
        self.table = self.table.edit(&delta.piece_uuid, delta.lines())?;
        Ok(ChangeOutcome::PieceUpdated(delta.piece_uuid.clone()))
    }

    // ── Cursors ──────────────────────────────────────────────────

    pub fn apply_cursor(&mut self, msg: &CursorMoveBroadcast) -> ChangeOutcome {
        if self.cursors.handle_broadcast(msg) {
            ChangeOutcome::CursorsChanged
        } else {
            ChangeOutcome::Ignored
        }
    }

    /// Replace the cursors of the active document with a full listing.
    pub fn apply_cursor_list(&mut self, listing: &[CursorListEntry]) -> ChangeOutcome {
        let Some(file_path) = self.active_path.as_deref() else {
            return ChangeOutcome::Ignored;
        };
        if matches!(self.phase, DocumentPhase::Opening { .. }) {
            // Might describe the file being left.
            return ChangeOutcome::Ignored;
        }
        self.cursors.replace_file(file_path, listing);
        ChangeOutcome::CursorsChanged
    }

    pub fn remove_peer(&mut self, event: &PeerFileEvent) -> ChangeOutcome {
        match self.cursors.remove(&event.username, &event.file_path) {
            Some(_) => ChangeOutcome::CursorsChanged,
            None => ChangeOutcome::Ignored,
        }
    }

    /// Remember our cursor position and build the message announcing it.
    pub fn record_cursor(
        &mut self,
        piece_id: &PieceId,
        offset: usize,
        column: usize,
    ) -> Result<CursorMove, SessionError> {
        let file_path = self.require_active()?.to_string();
        let index = self
            .table
            .index_of(piece_id)
            .ok_or_else(|| CoreError::UnknownPiece(piece_id.clone()))?;
        let line = self.table.start_of(index) + offset;
        self.tabs.update_position(&file_path, line, column);

        Ok(CursorMove {
            file_path,
            piece_id: piece_id.clone(),
            offset,
            column,
        })
    }

    // ── Tabs ─────────────────────────────────────────────────────

    /// Tear down the active document.
    ///
    /// Returns the closed path and the tab to activate next, if any. With
    /// no tab left the table becomes [`PieceTable::empty`].
    pub fn close_active(&mut self) -> Result<(String, Option<String>), SessionError> {
        let file_path = self.require_active()?.to_string();
        let next = self
            .tabs
            .adjacent(&file_path, Direction::Next)
            .map(|t| t.file_path.clone());

        self.generation += 1;
        self.tabs.remove(&file_path);
        self.cursors.clear_file(&file_path);
        self.active_path = None;
        self.phase = DocumentPhase::Closed;
        self.table = PieceTable::empty();
        log::info!("closed {file_path}");

        Ok((file_path, next))
    }

    /// The tab next to the active one.
    pub fn adjacent_tab(&self, direction: Direction) -> Option<String> {
        let active = self.active_path.as_deref()?;
        self.tabs
            .adjacent(active, direction)
            .map(|t| t.file_path.clone())
    }

    /// Rename a tab; follows the active document if it was the one renamed.
    pub fn rename_tab(&mut self, old_path: &str, new_name: &str) -> Option<String> {
        let new_path = self.tabs.rename(old_path, new_name)?;
        if self.active_path.as_deref() == Some(old_path) {
            self.active_path = Some(new_path.clone());
        }
        self.cursors.rename_file(old_path, &new_path);
        Some(new_path)
    }
}

/// Drives a [`SessionState`] over a [`Transport`].
#[derive(Clone)]
pub struct SessionController {
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<SessionState>>,
    config: ClientConfig,
}

impl SessionController {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let state = SessionState::new(config.username.clone());
        Self {
            transport,
            state: Arc::new(Mutex::new(state)),
            config,
        }
    }

    pub fn state(&self) -> &Arc<Mutex<SessionState>> {
        &self.state
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Snapshot of the active table.
    pub async fn table(&self) -> PieceTable {
        self.state.lock().await.table().clone()
    }

    /// Claim our username on a fresh connection.
    ///
    /// The server keeps names unique and may hand back a different one;
    /// that name is adopted and returned.
    pub async fn login(&self) -> Result<String, SessionError> {
        let requested = self.config.username.clone();
        let request = ClientMessage::LoginRequest(LoginRequest {
            username: requested.clone(),
        });
        let response = tokio::time::timeout(
            self.config.request_timeout(),
            self.transport.request(request, MessageType::LoginResponse),
        )
        .await
        .map_err(|_| SessionError::Timeout(MessageType::LoginResponse.as_str()))??;

        match response {
            ServerMessage::LoginResponse(r) if r.succeed => {
                let username = r.new_username.unwrap_or(requested);
                self.state.lock().await.adopt_username(&username);
                log::info!("logged in as {username}");
                Ok(username)
            }
            ServerMessage::LoginResponse(_) => Err(SessionError::LoginRejected(requested)),
            other => Err(unexpected(other)),
        }
    }

    /// Join `file_path` and fetch its content.
    ///
    /// On failure the file is left again unless it is still the active
    /// document.
    pub async fn open_file(&self, file_path: &str) -> Result<OpenOutcome, SessionError> {
        let generation = self.state.lock().await.begin_open(file_path);

        match self.fetch(file_path).await {
            Ok(wire) => {
                let outcome = self
                    .state
                    .lock()
                    .await
                    .finish_open(generation, file_path, &wire)?;
                if matches!(outcome, OpenOutcome::Opened { .. }) {
                    self.request_cursors(file_path).await;
                }
                Ok(outcome)
            }
            Err(e) => {
                log::warn!("opening {file_path} failed: {e}");
                let still_active = {
                    let mut state = self.state.lock().await;
                    state.abandon_open(generation);
                    state.active_path() == Some(file_path)
                };
                if !still_active {
                    self.leave(file_path).await;
                }
                Err(e)
            }
        }
    }

    /// Ask for everyone's cursor in `file_path`; the listing arrives as an
    /// event.
    async fn request_cursors(&self, file_path: &str) {
        let msg = ClientMessage::CursorListRequest(CursorListRequest {
            file_path: file_path.to_string(),
        });
        if let Err(e) = self.transport.send(msg).await {
            log::debug!("cursor-list-request for {file_path} not sent: {e}");
        }
    }

    async fn fetch(&self, file_path: &str) -> Result<WireDocument, SessionError> {
        self.transport
            .send(ClientMessage::FileJoin(FileJoin {
                file_path: file_path.to_string(),
            }))
            .await?;

        let request = ClientMessage::FileContentRequest(FileContentRequest::whole_file(file_path));
        let response = tokio::time::timeout(
            self.config.request_timeout(),
            self.transport
                .request(request, MessageType::FileContentResponse),
        )
        .await
        .map_err(|_| SessionError::Timeout(MessageType::FileContentResponse.as_str()))??;

        match response {
            ServerMessage::ContentResponse(wire) => Ok(wire),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the server to lock the lines between two anchors.
    ///
    /// Nothing changes locally unless the lock is granted.
    pub async fn request_lock(
        &self,
        start: Anchor,
        end: Anchor,
    ) -> Result<LockOutcome, SessionError> {
        let (request, range, generation) = self.state.lock().await.lock_target(&start, &end)?;
        let request_path = request.file_path.clone();

        let response = tokio::time::timeout(
            self.config.lock_timeout(),
            self.transport.request(
                ClientMessage::FileLockRequest(request),
                MessageType::FileLockResponse,
            ),
        )
        .await
        .map_err(|_| SessionError::Timeout(MessageType::FileLockResponse.as_str()))??;

        match response {
            ServerMessage::LockResponse(r)
                if !r.file_path.is_empty() && r.file_path != request_path =>
            {
                log::debug!("dropping lock response for {}", r.file_path);
                Ok(LockOutcome::Superseded)
            }
            ServerMessage::LockResponse(r) => {
                self.state
                    .lock()
                    .await
                    .finish_lock(generation, range, r.success)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Replace the text of a piece we hold, and push it to the server.
    ///
    /// Refused with [`ProtocolError::NotConnected`] while the transport is
    /// down. If the send itself fails the local text stays until the next
    /// resync replaces it.
    pub async fn edit_piece(&self, piece_id: &PieceId, lines: Vec<String>) -> Result<(), SessionError> {
        if !self.transport.is_open() {
            return Err(ProtocolError::NotConnected.into());
        }
        let delta = self.state.lock().await.apply_local_edit(piece_id, lines)?;
        self.transport.send(ClientMessage::FileDelta(delta)).await?;
        Ok(())
    }

    pub async fn release_lock(&self, piece_id: &PieceId) -> Result<(), SessionError> {
        let request = self.state.lock().await.release_target(piece_id)?;
        self.transport
            .send(ClientMessage::FileUnlockRequest(request))
            .await?;
        Ok(())
    }

    /// Close the active document and open the next tab, if any.
    pub async fn close_file(&self) -> Result<Option<OpenOutcome>, SessionError> {
        let (closed, next) = self.state.lock().await.close_active()?;
        self.leave(&closed).await;

        match next {
            Some(path) => self.open_file(&path).await.map(Some),
            None => Ok(None),
        }
    }

    /// Open the adjacent tab, then leave the document it replaced.
    ///
    /// If the neighbour cannot be opened the current document stays
    /// active and joined.
    pub async fn switch_tab(&self, direction: Direction) -> Result<Option<OpenOutcome>, SessionError> {
        let (current, next) = {
            let state = self.state.lock().await;
            let current = state.require_active()?.to_string();
            (current, state.adjacent_tab(direction))
        };
        let Some(next) = next else {
            return Ok(None);
        };

        let outcome = self.open_file(&next).await?;
        if matches!(outcome, OpenOutcome::Opened { .. }) {
            self.leave(&current).await;
        }
        Ok(Some(outcome))
    }

    pub async fn rename_tab(&self, old_path: &str, new_name: &str) -> Option<String> {
        self.state.lock().await.rename_tab(old_path, new_name)
    }

    /// Announce our cursor. Dropped while the transport is down.
    pub async fn move_cursor(
        &self,
        piece_id: &PieceId,
        offset: usize,
        column: usize,
    ) -> Result<(), SessionError> {
        let msg = self
            .state
            .lock()
            .await
            .record_cursor(piece_id, offset, column)?;
        if self.transport.is_open() {
            self.transport.send(ClientMessage::CursorMove(msg)).await?;
        }
        Ok(())
    }

    async fn leave(&self, file_path: &str) {
        let msg = ClientMessage::FileLeave(FileLeave {
            file_path: file_path.to_string(),
            force_exit: false,
        });
        if let Err(e) = self.transport.send(msg).await {
            log::debug!("file-leave for {file_path} not sent: {e}");
        }
    }

    /// Fetch the active document again.
    pub async fn resync(&self) -> Result<ChangeOutcome, SessionError> {
        let Some(path) = self.state.lock().await.active_path().map(str::to_string) else {
            return Ok(ChangeOutcome::Ignored);
        };
        log::info!("resynchronizing {path}");
        match self.open_file(&path).await? {
            OpenOutcome::Opened { .. } => Ok(ChangeOutcome::Resynced),
            OpenOutcome::Superseded => Ok(ChangeOutcome::Ignored),
        }
    }

    /// Log in again on a new connection and refetch the active document.
    pub async fn rejoin(&self) -> Result<ChangeOutcome, SessionError> {
        if let Err(e) = self.login().await {
            log::warn!("login after reconnect failed: {e}");
        }
        self.resync().await
    }

    /// Apply one transport event.
    pub async fn handle_event(&self, event: TransportEvent) -> Result<ChangeOutcome, SessionError> {
        match event {
            TransportEvent::Opened => self.rejoin().await,
            TransportEvent::Closed => {
                log::warn!("transport closed");
                Ok(ChangeOutcome::Ignored)
            }
            TransportEvent::Message(msg) => self.handle_message(msg).await,
        }
    }

    async fn handle_message(&self, msg: ServerMessage) -> Result<ChangeOutcome, SessionError> {
        let mut state = self.state.lock().await;
        match msg {
            ServerMessage::PieceTableChange(wire) => state.apply_remote_change(&wire),
            ServerMessage::Delta(delta) => state.apply_remote_delta(&delta),
            ServerMessage::CursorMoved(cursor) => Ok(state.apply_cursor(&cursor)),
            ServerMessage::PeerLeft(event) => Ok(state.remove_peer(&event)),
            ServerMessage::CursorList(list) => Ok(state.apply_cursor_list(&list.cursor_list)),
            ServerMessage::PeerJoined(event) => {
                log::info!("{} joined {}", event.username, event.file_path);
                Ok(ChangeOutcome::Ignored)
            }
            ServerMessage::Error(e) => Err(SessionError::Server {
                message: e.message,
                code: e.error_code,
            }),
            ServerMessage::ContentResponse(_)
            | ServerMessage::LockResponse(_)
            | ServerMessage::LoginResponse(_) => {
                log::debug!("dropping unrequested response");
                Ok(ChangeOutcome::Ignored)
            }
            ServerMessage::Unknown(_) => Ok(ChangeOutcome::Ignored),
        }
    }

    /// Process transport events until the transport goes away.
    ///
    /// Reconnects and lagging behind the event stream trigger a resync in
    /// the background so other events keep flowing meanwhile. Its outcome
    /// is reported through `on_change` like any other.
    pub async fn run<F>(&self, mut on_change: F) -> Result<(), SessionError>
    where
        F: FnMut(&ChangeOutcome),
    {
        let mut events = self.transport.subscribe();
        let (resynced_tx, mut resynced_rx) = mpsc::unbounded_channel();
        loop {
            let received = tokio::select! {
                received = events.recv() => received,
                Some(outcome) = resynced_rx.recv() => {
                    if outcome != ChangeOutcome::Ignored {
                        on_change(&outcome);
                    }
                    continue;
                }
            };
            let event = match received {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("missed {skipped} events");
                    self.spawn_resync(false, resynced_tx.clone());
                    continue;
                }
                Err(RecvError::Closed) => return Ok(()),
            };

            if event == TransportEvent::Opened {
                self.spawn_resync(true, resynced_tx.clone());
                continue;
            }
            match self.handle_event(event).await {
                Ok(ChangeOutcome::Ignored) => {}
                Ok(outcome) => on_change(&outcome),
                Err(e) => log::warn!("{e}"),
            }
        }
    }

    fn spawn_resync(&self, login: bool, done: mpsc::UnboundedSender<ChangeOutcome>) {
        let controller = self.clone();
        tokio::spawn(async move {
            let result = if login {
                controller.rejoin().await
            } else {
                controller.resync().await
            };
            match result {
                Ok(outcome) => {
                    let _ = done.send(outcome);
                }
                Err(e) => log::warn!("resync failed: {e}"),
            }
        });
    }
}

fn unexpected(msg: ServerMessage) -> SessionError {
    match msg {
        ServerMessage::Error(e) => SessionError::Server {
            message: e.message,
            code: e.error_code,
        },
        other => {
            let name = other
                .message_type()
                .map(|t| t.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ProtocolError::UnexpectedMessage(name).into()
        }
    }
}
