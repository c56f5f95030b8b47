//! Transport connection manager: one multiplexed socket per client.
//!
//! ```text
//!            ┌──────────────────── supervisor task ─────────────────────┐
//! connect ──►│ ticket ──► socket ──► select { outbound | inbound | quit } │
//!            │   │ fatal      ▲                    │ close               │
//!            │   ▼            └── ReconnectPolicy ◄┘                     │
//!            │ persistent notice, stop                                  │
//!            └──────────────────────────────────────────────────────────┘
//!                 inbound frame ─► heartbeat? ─► PONG
//!                               ─► ROLE_CALL? ─► ClientEvent::ProfileRefresh
//!                               ─► TopicRouter::dispatch
//! ```
//!
//! All transport failures end here: they become [`ClientEvent`]s or log
//! lines. Nothing in the public API returns a transport error.

use crate::config::ClientConfig;
use crate::marker::{MarkerStore, OnCallMarker};
use crate::notice::{ClientEvent, Notice, CONNECTION_LOST};
use crate::reconnect::{ReconnectAction, ReconnectPolicy};
use crate::router::{ListenerError, Subscription, TopicRouter};
use crate::ticket::{TicketError, TicketIssuer};
use chrono::{DateTime, SecondsFormat, Utc};
use convene_core::{Frame, FrameError, Message, PayloadError, SocketAction, SocketEvent};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Ticket(#[from] TicketError),

    #[error("socket: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

struct Shared {
    config: ClientConfig,
    issuer: Arc<dyn TicketIssuer>,
    markers: Arc<dyn MarkerStore>,
    router: TopicRouter,
    connection_id: RwLock<Option<String>>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    events: mpsc::UnboundedSender<ClientEvent>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    policy: Mutex<ReconnectPolicy>,
}

enum SocketOutcome {
    Closed,
    Shutdown,
}

/// Owns the client's socket. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        config: ClientConfig,
        issuer: Arc<dyn TicketIssuer>,
        markers: Arc<dyn MarkerStore>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (shutdown, _) = watch::channel(false);
        let policy = ReconnectPolicy::new(config.reconnect_delay);

        let shared = Arc::new(Shared {
            config,
            issuer,
            markers,
            router: TopicRouter::new(),
            connection_id: RwLock::new(None),
            last_heartbeat: Mutex::new(None),
            outbound: Mutex::new(None),
            state,
            shutdown,
            events,
            supervisor: Mutex::new(None),
            policy: Mutex::new(policy),
        });
        (Self { shared }, event_rx)
    }

    /// Start the connection loop. Does nothing if it is already running.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut supervisor = self.shared.supervisor.lock();
        if supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        self.shared.shutdown.send_replace(false);
        let shutdown = self.shared.shutdown.subscribe();
        *supervisor = Some(tokio::spawn(supervise(self.shared.clone(), shutdown)));
    }

    /// Encode and send one frame on `topic`. A no-op returning false unless
    /// the socket is open.
    pub fn transmit(&self, store: bool, topic: &str, event: &SocketEvent) -> bool {
        let Some(outbound) = self.shared.outbound.lock().clone() else {
            log::trace!("{} on {topic} dropped: socket not open", event.action());
            return false;
        };
        match self.shared.encode(store, topic, event) {
            Ok(text) => outbound.send(text).is_ok(),
            Err(e) => {
                log::warn!("not sending {} on {topic}: {e}", event.action());
                false
            }
        }
    }

    /// Register a listener for `topic`; drop the returned handle to remove it.
    pub fn subscribe<F>(&self, topic: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&Message) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.shared.router.subscribe(topic, listener)
    }

    pub fn router(&self) -> &TopicRouter {
        &self.shared.router
    }

    /// Connection id of the current socket, if one has opened.
    pub fn connection_id(&self) -> Option<String> {
        self.shared.connection_id.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Time of the most recent server heartbeat.
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self.shared.last_heartbeat.lock()
    }

    /// Window focus changed.
    pub fn focus_changed(&self, focused: bool) {
        let open = self.is_open();
        self.shared
            .policy
            .lock()
            .on_focus_change(focused, open, &*self.shared.markers);
    }

    /// Clear the on-call marker and close the socket for good.
    pub async fn logout(&self) {
        self.shared.markers.store(OnCallMarker::Absent);
        self.shared.shutdown.send_replace(true);

        let task = self.shared.supervisor.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("connection supervisor ended abnormally: {e}");
            }
        }
        self.shared.close();
        log::info!("logged out");
    }
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn close(&self) {
        self.outbound.lock().take();
        self.set_state(ConnectionState::Closed);
    }

    fn encode(&self, store: bool, topic: &str, event: &SocketEvent) -> Result<String, TransportError> {
        let sender = self.connection_id.read().clone().unwrap_or_default();
        let frame = Frame::new(event.action(), topic)
            .with_store(store)
            .with_timestamp(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
            .with_sender(sender)
            .with_payload(event.encode_payload()?);
        Ok(frame.encode()?)
    }

    /// Handle one inbound frame; returns a reply to send, if any.
    fn handle_incoming(&self, bytes: &[u8]) -> Option<String> {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("dropping malformed frame: {e}");
                return None;
            }
        };

        if frame.is_heartbeat() {
            *self.last_heartbeat.lock() = Some(Utc::now());
            return match Frame::pong().encode() {
                Ok(pong) => Some(pong),
                Err(e) => {
                    log::error!("encoding heartbeat reply: {e}");
                    None
                }
            };
        }

        if frame.action == SocketAction::RoleCall {
            log::debug!("role changed, requesting profile refresh");
            self.emit(ClientEvent::ProfileRefresh);
            return None;
        }

        match Message::from_frame(&frame) {
            Ok(message) => {
                self.router.dispatch(&message);
            }
            Err(e) => log::warn!("dropping frame on {}: {e}", frame.topic),
        }
        None
    }

    fn resubscribe(&self) {
        let Some(outbound) = self.outbound.lock().clone() else {
            return;
        };
        for topic in self.router.topics() {
            match self.encode(false, &topic, &SocketEvent::Subscribe) {
                Ok(text) => {
                    log::debug!("resubscribing to {topic}");
                    let _ = outbound.send(text);
                }
                Err(e) => log::warn!("resubscribing to {topic}: {e}"),
            }
        }
    }
}

async fn supervise(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut opened_before = false;

    loop {
        shared.set_state(if opened_before {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        let ticket = match shared.issuer.issue().await {
            Ok(ticket) => ticket,
            Err(e) => {
                log::error!("ticket request failed, giving up: {e}");
                shared.emit(ClientEvent::Notice(Notice::error(CONNECTION_LOST).persistent()));
                shared.close();
                return;
            }
        };

        let url = shared.config.socket_url(&ticket);
        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
            _ = shutdown.changed() => {
                shared.close();
                return;
            }
        };

        let mut failed_to_open = false;
        match connected {
            Ok((socket, _)) => {
                let connection_id = ticket.connection_id().to_string();
                let (tx, rx) = mpsc::unbounded_channel();
                *shared.connection_id.write() = Some(connection_id.clone());
                *shared.outbound.lock() = Some(tx);
                shared.resubscribe();
                shared.set_state(ConnectionState::Open);
                log::info!("socket open as {connection_id}");

                let notice = shared.policy.lock().on_open(&*shared.markers);
                if let Some(notice) = notice {
                    shared.emit(ClientEvent::Notice(notice));
                }
                shared.emit(ClientEvent::Connected { connection_id });
                opened_before = true;

                let outcome = run_socket(&shared, socket, rx, &mut shutdown).await;
                shared.outbound.lock().take();
                if let SocketOutcome::Shutdown = outcome {
                    shared.close();
                    shared.emit(ClientEvent::Disconnected);
                    return;
                }
                shared.emit(ClientEvent::Disconnected);
            }
            Err(e) => {
                log::warn!("socket connect failed: {}", TransportError::from(e));
                failed_to_open = true;
            }
        }

        if *shutdown.borrow() {
            shared.close();
            return;
        }

        let decision = shared.policy.lock().on_close(&*shared.markers);
        log::info!("socket closed, reconnect: {:?}", decision.action);
        if let Some(notice) = decision.notice {
            shared.emit(ClientEvent::Notice(notice));
        }

        match decision.action {
            ReconnectAction::Stay => {
                if failed_to_open {
                    shared.emit(ClientEvent::Notice(Notice::error(CONNECTION_LOST).persistent()));
                }
                shared.close();
                return;
            }
            ReconnectAction::Immediate => {}
            ReconnectAction::After(delay) => {
                shared.set_state(ConnectionState::Reconnecting);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        shared.close();
                        return;
                    }
                }
            }
        }
    }
}

async fn run_socket(
    shared: &Shared,
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> SocketOutcome {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return SocketOutcome::Shutdown;
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(WsMessage::text(text)).await {
                    log::warn!("socket write failed: {e}");
                    return SocketOutcome::Closed;
                }
            }
            incoming = stream.next() => {
                let reply = match incoming {
                    Some(Ok(WsMessage::Text(text))) => shared.handle_incoming(text.as_bytes()),
                    Some(Ok(WsMessage::Binary(data))) => shared.handle_incoming(&data),
                    Some(Ok(WsMessage::Close(_))) | None => return SocketOutcome::Closed,
                    Some(Ok(_)) => None,
                    Some(Err(e)) => {
                        log::warn!("socket read failed: {e}");
                        return SocketOutcome::Closed;
                    }
                };
                if let Some(reply) = reply {
                    if let Err(e) = sink.send(WsMessage::text(reply)).await {
                        log::warn!("heartbeat reply failed: {e}");
                        return SocketOutcome::Closed;
                    }
                }
            }
        }
    }
}
