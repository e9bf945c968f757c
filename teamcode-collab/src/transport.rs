//! Message transport between the session and the server.
//!
//! [`Transport`] is the seam the session controller talks to; [`WsTransport`]
//! implements it over a WebSocket carrying JSON [`Envelope`]s.
//!
//! Inbound messages either resolve a pending [`Transport::request`] or are
//! fanned out to every subscriber as a [`TransportEvent`]. A response is
//! matched to its request by `response_uuid` when the server sets one, and
//! otherwise to the oldest request waiting for that message type. The
//! server answers in order, so a request whose caller gave up keeps its
//! place in line and its late answer is dropped rather than handed to the
//! next caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::protocol::{
    ClientMessage, Envelope, MessageType, ProtocolError, ServerMessage, CLIENT_SENDER,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events fanned out to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection came back after being lost
    Opened,
    /// The connection was lost or closed
    Closed,
    /// A message that did not answer a pending request
    Message(ServerMessage),
}

/// What the session needs from a connection to the server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether messages can be sent right now.
    fn is_open(&self) -> bool;

    /// Fire-and-forget.
    async fn send(&self, message: ClientMessage) -> Result<(), ProtocolError>;

    /// Send `message` and wait for the first matching `response_type`.
    ///
    /// Callers bound the wait themselves; dropping the future abandons
    /// the request.
    async fn request(
        &self,
        message: ClientMessage,
        response_type: MessageType,
    ) -> Result<ServerMessage, ProtocolError>;

    /// Receive lifecycle events and unsolicited messages. Dropping the
    /// receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// How long an abandoned request keeps its place in line.
const ABANDONED_TTL: Duration = Duration::from_secs(60);

struct PendingRequest {
    request_uuid: Uuid,
    response_type: MessageType,
    file_path: Option<String>,
    sent_at: Instant,
    tx: oneshot::Sender<ServerMessage>,
}

impl PendingRequest {
    fn answered_by(&self, msg_type: MessageType, message: &ServerMessage) -> bool {
        if self.response_type != msg_type {
            return false;
        }
        match (message, self.file_path.as_deref()) {
            (ServerMessage::LockResponse(r), Some(path)) if !r.file_path.is_empty() => {
                r.file_path == path
            }
            _ => true,
        }
    }

    fn is_expired(&self) -> bool {
        self.tx.is_closed() && self.sent_at.elapsed() > ABANDONED_TTL
    }
}

/// Where an inbound message goes.
enum Route {
    Deliver(oneshot::Sender<ServerMessage>),
    /// Answer to a request whose caller stopped waiting.
    Discard,
    Broadcast,
}

enum Outbound {
    Text(String),
    Close,
}

/// State shared between the handle and the connection task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    pending: Mutex<Vec<PendingRequest>>,
    events: broadcast::Sender<TransportEvent>,
}

impl Shared {
    fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            state: watch::Sender::new(ConnectionState::Disconnected),
            pending: Mutex::new(Vec::new()),
            events,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Route one inbound text frame.
    async fn dispatch(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Dropping malformed message: {e}");
                return;
            }
        };
        let message = match ServerMessage::from_envelope(&envelope) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping invalid {} message: {e}", envelope.msg_type);
                return;
            }
        };

        match self.route(envelope.response_uuid, &message).await {
            Route::Deliver(tx) => {
                if tx.send(message).is_err() {
                    log::debug!("Dropping late {}", envelope.msg_type);
                }
            }
            Route::Discard => log::debug!("Dropping late {}", envelope.msg_type),
            Route::Broadcast => {
                if let ServerMessage::Unknown(msg_type) = &message {
                    log::debug!("Ignoring unhandled message type {msg_type}");
                }
                self.emit(TransportEvent::Message(message));
            }
        }
    }

    async fn route(&self, response_uuid: Option<Uuid>, message: &ServerMessage) -> Route {
        let mut pending = self.pending.lock().await;
        pending.retain(|p| !p.is_expired());

        let by_uuid = response_uuid
            .and_then(|id| pending.iter().position(|p| p.request_uuid == id));
        let index = by_uuid.or_else(|| {
            let msg_type = message.message_type()?;
            pending.iter().position(|p| p.answered_by(msg_type, message))
        });
        let Some(index) = index else {
            return Route::Broadcast;
        };

        let request = pending.remove(index);
        if request.tx.is_closed() {
            Route::Discard
        } else {
            Route::Deliver(request.tx)
        }
    }

    async fn forget(&self, request_uuid: Uuid) {
        self.pending
            .lock()
            .await
            .retain(|p| p.request_uuid != request_uuid);
    }

    /// Wake every waiter with a closed channel.
    async fn fail_pending(&self) {
        let dropped = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending)
        };
        if !dropped.is_empty() {
            log::debug!("Abandoning {} pending requests", dropped.len());
        }
    }
}

/// [`Transport`] over a WebSocket.
///
/// One background task owns the socket: it forwards queued outbound
/// frames and dispatches inbound ones. When `reconnect_delay` is set, a
/// lost connection is retried at that interval and [`TransportEvent::Opened`]
/// is emitted once it is back.
pub struct WsTransport {
    url: String,
    shared: Arc<Shared>,
    outgoing_tx: mpsc::Sender<Outbound>,
}

impl WsTransport {
    /// Connect to `url`.
    ///
    /// Fails if the first connection attempt fails; later losses are
    /// reported as [`TransportEvent::Closed`].
    pub async fn connect(
        url: impl Into<String>,
        event_capacity: usize,
        reconnect_delay: Option<Duration>,
    ) -> Result<Self, ProtocolError> {
        let url = url.into();
        let shared = Arc::new(Shared::new(event_capacity));
        shared.set_state(ConnectionState::Connecting);

        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                log::warn!("Connection to {url} failed: {e}");
                shared.set_state(ConnectionState::Disconnected);
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        log::info!("Connected to {url}");
        shared.set_state(ConnectionState::Connected);

        let (outgoing_tx, outgoing_rx) = mpsc::channel(256);
        tokio::spawn(drive(
            url.clone(),
            ws,
            outgoing_rx,
            shared.clone(),
            reconnect_delay,
        ));

        Ok(Self {
            url,
            shared,
            outgoing_tx,
        })
    }

    /// Connect using the server URL and channel size from `config`.
    pub async fn from_config(
        config: &ClientConfig,
        reconnect_delay: Option<Duration>,
    ) -> Result<Self, ProtocolError> {
        Self::connect(config.server_url.clone(), config.event_capacity, reconnect_delay).await
    }

    /// Close the socket and stop reconnecting.
    pub async fn close(&self) {
        let _ = self.outgoing_tx.send(Outbound::Close).await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn push(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let text = envelope.encode()?;
        self.outgoing_tx
            .send(Outbound::Text(text))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn is_open(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    async fn send(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        if !self.is_open() {
            return Err(ProtocolError::NotConnected);
        }
        let envelope = message.to_envelope(CLIENT_SENDER)?;
        log::debug!("-> {}", envelope.msg_type);
        self.push(&envelope).await
    }

    async fn request(
        &self,
        message: ClientMessage,
        response_type: MessageType,
    ) -> Result<ServerMessage, ProtocolError> {
        if !self.is_open() {
            return Err(ProtocolError::NotConnected);
        }
        let envelope = message.to_envelope(CLIENT_SENDER)?;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.push(PendingRequest {
            request_uuid: envelope.uuid,
            response_type,
            file_path: message.file_path().map(str::to_string),
            sent_at: Instant::now(),
            tx,
        });

        log::debug!("-> {} (awaiting {})", envelope.msg_type, response_type.as_str());
        if let Err(e) = self.push(&envelope).await {
            // Never sent, so no answer will come.
            self.shared.forget(envelope.uuid).await;
            return Err(e);
        }
        rx.await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }
}

enum ConnectionEnd {
    Lost,
    Shutdown,
}

/// Own the socket for the lifetime of the transport.
async fn drive(
    url: String,
    ws: WsStream,
    mut outgoing_rx: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
    reconnect_delay: Option<Duration>,
) {
    let mut ws = ws;
    loop {
        let end = run_connection(ws, &mut outgoing_rx, &shared).await;

        shared.set_state(ConnectionState::Disconnected);
        shared.fail_pending().await;
        shared.emit(TransportEvent::Closed);

        let (ConnectionEnd::Lost, Some(delay)) = (end, reconnect_delay) else {
            log::info!("Connection to {url} closed");
            return;
        };

        log::warn!("Connection to {url} lost, retrying every {delay:?}");
        shared.set_state(ConnectionState::Reconnecting);
        ws = loop {
            tokio::time::sleep(delay).await;
            if outgoing_rx.is_closed() {
                shared.set_state(ConnectionState::Disconnected);
                return;
            }
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _)) => break ws,
                Err(e) => log::debug!("Reconnect to {url} failed: {e}"),
            }
        };

        log::info!("Reconnected to {url}");
        shared.set_state(ConnectionState::Connected);
        shared.emit(TransportEvent::Opened);
    }
}

async fn run_connection(
    ws: WsStream,
    outgoing_rx: &mut mpsc::Receiver<Outbound>,
    shared: &Shared,
) -> ConnectionEnd {
    let (mut writer, mut reader) = ws.split();
    loop {
        tokio::select! {
            outbound = outgoing_rx.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = writer.send(Message::Text(text.into())).await {
                        log::warn!("WebSocket write failed: {e}");
                        return ConnectionEnd::Lost;
                    }
                }
                // Explicit close, or every handle dropped.
                Some(Outbound::Close) | None => {
                    let _ = writer.send(Message::Close(None)).await;
                    return ConnectionEnd::Shutdown;
                }
            },
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => shared.dispatch(text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Lost,
                Some(Err(e)) => {
                    log::warn!("WebSocket read failed: {e}");
                    return ConnectionEnd::Lost;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}
