//! Session controller against a scripted in-memory transport.
//!
//! Each `request` pops the next scripted reply, so tests control exactly
//! when (and whether) the server answers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use teamcode_collab::protocol::{
    CursorListEntry, CursorListResponse, FileDelta, FileLockResponse, LoginResponse,
};
use teamcode_collab::{
    ChangeOutcome, ClientConfig, ClientMessage, DocumentPhase, LockOutcome, MessageType,
    OpenOutcome, ProtocolError, ServerMessage, SessionController, SessionError, Transport,
    TransportEvent,
};
use teamcode_core::{decode_document, Anchor, PieceId, WireChange, WireDocument};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{timeout, Duration};

enum Reply {
    Now(ServerMessage),
    Later(oneshot::Receiver<ServerMessage>),
    Never,
}

struct ScriptedTransport {
    open: AtomicBool,
    sent: Mutex<Vec<ClientMessage>>,
    replies: Mutex<VecDeque<Reply>>,
    events: broadcast::Sender<TransportEvent>,
}

impl ScriptedTransport {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            events,
        })
    }

    fn reply(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_types(&self) -> Vec<MessageType> {
        self.sent().iter().map(|m| m.message_type()).collect()
    }

    fn emit(&self, event: TransportEvent) {
        self.events.send(event).unwrap();
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        if !self.is_open() {
            return Err(ProtocolError::NotConnected);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn request(
        &self,
        message: ClientMessage,
        _response_type: MessageType,
    ) -> Result<ServerMessage, ProtocolError> {
        if !self.is_open() {
            return Err(ProtocolError::NotConnected);
        }
        self.sent.lock().unwrap().push(message);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Now(msg)) => Ok(msg),
            Some(Reply::Later(rx)) => rx.await.map_err(|_| ProtocolError::ConnectionClosed),
            Some(Reply::Never) | None => std::future::pending().await,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        username: "me".into(),
        request_timeout_secs: 1,
        lock_timeout_secs: 1,
        ..ClientConfig::default()
    }
}

fn document(lines: &[&str]) -> WireDocument {
    serde_json::from_value(json!({
        "piece_table": [["p0", 0, 0, lines.len(), ""]],
        "block_list": [[0, true, lines]],
    }))
    .unwrap()
}

fn content(lines: &[&str]) -> ServerMessage {
    ServerMessage::ContentResponse(document(lines))
}

fn lock_response(success: bool) -> ServerMessage {
    ServerMessage::LockResponse(FileLockResponse {
        file_path: "a.txt".into(),
        success,
    })
}

fn login_response(succeed: bool, new_username: Option<&str>) -> ServerMessage {
    ServerMessage::LoginResponse(LoginResponse {
        succeed,
        new_username: new_username.map(str::to_string),
    })
}

/// `me` locks the second line of a three-line document.
fn lock_broadcast() -> ServerMessage {
    let change: WireChange = serde_json::from_value(json!({
        "file_path": "a.txt",
        "piece_table": [
            ["p0", 0, 0, 1, ""],
            ["mine", 1, 0, 1, "me"],
            ["p1", 0, 2, 1, ""]
        ],
        "changed_blocks": [[1, false, ["two"]]],
    }))
    .unwrap();
    ServerMessage::PieceTableChange(change)
}

async fn opened(transport: &Arc<ScriptedTransport>, lines: &[&str]) -> SessionController {
    let controller = SessionController::new(transport.clone(), config());
    transport.reply(Reply::Now(content(lines)));
    controller.open_file("a.txt").await.unwrap();
    controller
}

#[tokio::test]
async fn test_open_sends_join_then_content_request() {
    let transport = ScriptedTransport::new();
    let controller = SessionController::new(transport.clone(), config());
    transport.reply(Reply::Now(content(&["hello", "world"])));

    let outcome = controller.open_file("a.txt").await.unwrap();
    assert_eq!(
        outcome,
        OpenOutcome::Opened {
            file_path: "a.txt".into(),
            lines: 2
        }
    );

    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    match (&sent[0], &sent[1], &sent[2]) {
        (
            ClientMessage::FileJoin(join),
            ClientMessage::FileContentRequest(req),
            ClientMessage::CursorListRequest(cursors),
        ) => {
            assert_eq!(join.file_path, "a.txt");
            assert_eq!(req.file_path, "a.txt");
            assert_eq!(cursors.file_path, "a.txt");
        }
        other => panic!("unexpected messages: {other:?}"),
    }

    let expected = decode_document(&document(&["hello", "world"])).unwrap();
    assert_eq!(controller.table().await, expected);
}

#[tokio::test]
async fn test_lock_denial_leaves_table_unchanged() {
    let transport = ScriptedTransport::new();
    let controller = opened(&transport, &["one", "two", "three"]).await;
    let before = controller.table().await;

    transport.reply(Reply::Now(lock_response(false)));
    let err = controller
        .request_lock(Anchor::new("p0", 2), Anchor::new("p0", 1))
        .await
        .unwrap_err();

    assert_eq!(err, SessionError::LockDenied("a.txt".into()));
    assert_eq!(controller.table().await, before);
    assert_eq!(
        controller.state().lock().await.phase(),
        &DocumentPhase::Open
    );

    match transport.sent().last() {
        Some(ClientMessage::FileLockRequest(req)) => {
            assert_eq!(req.piece_uuid, PieceId::from("p0"));
            assert_eq!((req.offset, req.length), (1, 2));
        }
        other => panic!("expected lock request, got {other:?}"),
    }
}

#[tokio::test]
async fn test_lock_grant_then_edit() {
    let transport = ScriptedTransport::new();
    let controller = opened(&transport, &["one", "two", "three"]).await;

    transport.reply(Reply::Now(lock_response(true)));
    let outcome = controller
        .request_lock(Anchor::new("p0", 1), Anchor::new("p0", 1))
        .await
        .unwrap();
    assert!(matches!(outcome, LockOutcome::Granted(range) if range.length == 1));

    controller
        .handle_event(TransportEvent::Message(lock_broadcast()))
        .await
        .unwrap();

    controller
        .edit_piece(&PieceId::from("mine"), vec!["TWO".into(), "2".into()])
        .await
        .unwrap();
    assert_eq!(
        controller.table().await.stitch(),
        vec!["one", "TWO", "2", "three"]
    );
    match transport.sent().last() {
        Some(ClientMessage::FileDelta(delta)) => assert_eq!(delta.content, "TWO\n2"),
        other => panic!("expected delta, got {other:?}"),
    }

    controller.release_lock(&PieceId::from("mine")).await.unwrap();
    assert_eq!(transport.sent_types().last(), Some(&MessageType::FileUnlockRequest));
}

#[tokio::test]
async fn test_edit_without_lock_is_rejected() {
    let transport = ScriptedTransport::new();
    let controller = opened(&transport, &["one"]).await;

    let err = controller
        .edit_piece(&PieceId::from("p0"), vec!["x".into()])
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::NotLockOwner(PieceId::from("p0")));
    assert_eq!(controller.table().await.stitch(), vec!["one"]);
}

#[tokio::test]
async fn test_edit_while_disconnected_is_refused() {
    let transport = ScriptedTransport::new();
    let controller = opened(&transport, &["one", "two", "three"]).await;
    controller
        .handle_event(TransportEvent::Message(lock_broadcast()))
        .await
        .unwrap();

    transport.open.store(false, Ordering::SeqCst);
    let err = controller
        .edit_piece(&PieceId::from("mine"), vec!["offline".into()])
        .await
        .unwrap_err();

    assert_eq!(err, SessionError::Protocol(ProtocolError::NotConnected));
    assert_eq!(
        controller.table().await.stitch(),
        vec!["one", "two", "three"]
    );
    assert!(!transport.sent_types().contains(&MessageType::FileDelta));
}

#[tokio::test]
async fn test_lock_response_for_other_file_is_superseded() {
    let transport = ScriptedTransport::new();
    let controller = opened(&transport, &["one"]).await;

    transport.reply(Reply::Now(ServerMessage::LockResponse(FileLockResponse {
        file_path: "other.txt".into(),
        success: true,
    })));
    let outcome = controller
        .request_lock(Anchor::new("p0", 0), Anchor::new("p0", 0))
        .await
        .unwrap();

    assert_eq!(outcome, LockOutcome::Superseded);
    assert_eq!(
        controller.state().lock().await.phase(),
        &DocumentPhase::Open
    );
}

#[tokio::test]
async fn test_login_adopts_assigned_username() {
    let transport = ScriptedTransport::new();
    let controller = SessionController::new(transport.clone(), config());

    transport.reply(Reply::Now(login_response(true, Some("me_1"))));
    assert_eq!(controller.login().await.unwrap(), "me_1");
    assert_eq!(controller.state().lock().await.username(), "me_1");
    match transport.sent().last() {
        Some(ClientMessage::LoginRequest(req)) => assert_eq!(req.username, "me"),
        other => panic!("expected login request, got {other:?}"),
    }

    transport.reply(Reply::Now(login_response(false, None)));
    assert_eq!(
        controller.login().await.unwrap_err(),
        SessionError::LoginRejected("me".into())
    );
    assert_eq!(controller.state().lock().await.username(), "me_1");
}

#[tokio::test]
async fn test_cursor_list_fills_board() {
    let transport = ScriptedTransport::new();
    let controller = opened(&transport, &["one", "two"]).await;

    let listing = ServerMessage::CursorList(CursorListResponse {
        cursor_list: vec![CursorListEntry {
            username: "bob".into(),
            piece_id: PieceId::from("p0"),
            offset: 1,
            column: 4,
        }],
    });
    let outcome = controller
        .handle_event(TransportEvent::Message(listing))
        .await
        .unwrap();

    assert_eq!(outcome, ChangeOutcome::CursorsChanged);
    let state = controller.state().lock().await;
    let bob = state.cursors().get("bob", "a.txt").unwrap();
    assert_eq!((bob.line, bob.ch), (1, 4));
}

#[tokio::test]
async fn test_lock_request_times_out() {
    let transport = ScriptedTransport::new();
    let controller = opened(&transport, &["one"]).await;
    let before = controller.table().await;

    transport.reply(Reply::Never);
    let err = controller
        .request_lock(Anchor::new("p0", 0), Anchor::new("p0", 0))
        .await
        .unwrap_err();

    assert_eq!(err, SessionError::Timeout("file-lock-response"));
    assert_eq!(controller.table().await, before);
    assert_eq!(
        controller.state().lock().await.phase(),
        &DocumentPhase::Open
    );
}

#[tokio::test]
async fn test_late_content_response_is_discarded() {
    let transport = ScriptedTransport::new();
    let controller = SessionController::new(transport.clone(), config());

    let (late_tx, late_rx) = oneshot::channel();
    transport.reply(Reply::Later(late_rx));
    let first = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.open_file("a.txt").await })
    };
    while transport.sent().len() < 2 {
        tokio::task::yield_now().await;
    }

    transport.reply(Reply::Now(content(&["b"])));
    controller.open_file("b.txt").await.unwrap();

    late_tx.send(content(&["stale"])).unwrap();
    let outcome = first.await.unwrap().unwrap();

    assert_eq!(outcome, OpenOutcome::Superseded);
    let state = controller.state().lock().await;
    assert_eq!(state.active_path(), Some("b.txt"));
    assert_eq!(state.table().stitch(), vec!["b"]);
}

#[tokio::test]
async fn test_closing_only_tab_resets_document() {
    let transport = ScriptedTransport::new();
    let controller = opened(&transport, &["one", "two"]).await;

    assert_eq!(controller.close_file().await.unwrap(), None);
    assert_eq!(transport.sent_types().last(), Some(&MessageType::FileLeave));

    let table = controller.table().await;
    assert_eq!(table.piece_count(), 1);
    assert_eq!(table.len(), 0);
    assert!(table.stitch().is_empty());
    assert_eq!(controller.state().lock().await.active_path(), None);
}

#[tokio::test]
async fn test_close_reopens_adjacent_tab() {
    let transport = ScriptedTransport::new();
    let controller = opened(&transport, &["a"]).await;
    transport.reply(Reply::Now(content(&["b"])));
    controller.open_file("b.txt").await.unwrap();

    transport.reply(Reply::Now(content(&["a again"])));
    let outcome = controller.close_file().await.unwrap();

    assert!(matches!(outcome, Some(OpenOutcome::Opened { ref file_path, .. }) if file_path == "a.txt"));
    assert_eq!(controller.table().await.stitch(), vec!["a again"]);
    assert_eq!(controller.state().lock().await.tabs().len(), 1);
}

#[tokio::test]
async fn test_switch_tab_wraps() {
    let transport = ScriptedTransport::new();
    let controller = opened(&transport, &["a"]).await;
    transport.reply(Reply::Now(content(&["b"])));
    controller.open_file("b.txt").await.unwrap();

    transport.reply(Reply::Now(content(&["a"])));
    controller
        .switch_tab(teamcode_collab::Direction::Next)
        .await
        .unwrap();

    let state = controller.state().lock().await;
    assert_eq!(state.active_path(), Some("a.txt"));
    assert_eq!(state.tabs().len(), 2);
}

#[tokio::test]
async fn test_failed_switch_keeps_current_file_joined() {
    let transport = ScriptedTransport::new();
    let controller = SessionController::new(transport.clone(), config());
    transport.reply(Reply::Now(content(&["b"])));
    controller.open_file("b.txt").await.unwrap();
    transport.reply(Reply::Now(content(&["one", "two"])));
    controller.open_file("a.txt").await.unwrap();
    transport.reply(Reply::Now(lock_response(true)));
    controller
        .request_lock(Anchor::new("p0", 0), Anchor::new("p0", 0))
        .await
        .unwrap();

    transport.reply(Reply::Never);
    let err = controller
        .switch_tab(teamcode_collab::Direction::Next)
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::Timeout("file-content-response"));

    let state = controller.state().lock().await;
    assert_eq!(state.active_path(), Some("a.txt"));
    assert_eq!(state.phase().name(), "locked");

    let leaves: Vec<String> = transport
        .sent()
        .into_iter()
        .filter_map(|m| match m {
            ClientMessage::FileLeave(leave) => Some(leave.file_path),
            _ => None,
        })
        .collect();
    assert_eq!(leaves, vec!["b.txt".to_string()]);
}

#[tokio::test]
async fn test_switch_leaves_previous_file_after_open() {
    let transport = ScriptedTransport::new();
    let controller = opened(&transport, &["a"]).await;
    transport.reply(Reply::Now(content(&["b"])));
    controller.open_file("b.txt").await.unwrap();

    transport.reply(Reply::Now(content(&["a"])));
    controller
        .switch_tab(teamcode_collab::Direction::Next)
        .await
        .unwrap();

    let types = transport.sent_types();
    let content_requests: Vec<usize> = types
        .iter()
        .enumerate()
        .filter(|(_, t)| **t == MessageType::FileContentRequest)
        .map(|(i, _)| i)
        .collect();
    let leave = types
        .iter()
        .position(|t| *t == MessageType::FileLeave)
        .unwrap();
    assert!(leave > content_requests[2]);
    match &transport.sent()[leave] {
        ClientMessage::FileLeave(msg) => assert_eq!(msg.file_path, "b.txt"),
        other => panic!("expected leave, got {other:?}"),
    }
}

#[tokio::test]
async fn test_run_applies_broadcasts_and_resyncs() {
    let transport = ScriptedTransport::new();
    let controller = opened(&transport, &["one", "two", "three"]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let runner = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .run(move |outcome| {
                    let _ = tx.send(outcome.clone());
                })
                .await
        })
    };
    // Let the loop subscribe.
    while transport.events.receiver_count() == 0 {
        tokio::task::yield_now().await;
    }

    transport.emit(TransportEvent::Message(ServerMessage::Delta(
        FileDelta::from_lines("a.txt", PieceId::from("p0"), &["remote".to_string()]),
    )));
    let outcome = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(outcome, Some(ChangeOutcome::PieceUpdated(PieceId::from("p0"))));
    assert_eq!(controller.table().await.stitch(), vec!["remote"]);

    transport.reply(Reply::Now(login_response(true, None)));
    transport.reply(Reply::Now(content(&["fresh"])));
    transport.emit(TransportEvent::Opened);
    let outcome = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(outcome, Some(ChangeOutcome::Resynced));
    assert_eq!(controller.table().await.stitch(), vec!["fresh"]);
    assert!(transport.sent_types().contains(&MessageType::LoginRequest));

    let joins = transport
        .sent_types()
        .iter()
        .filter(|t| **t == MessageType::FileJoin)
        .count();
    assert_eq!(joins, 2);
    runner.abort();
}
