//! Shared fixtures: an in-process topic relay speaking the frame format, a
//! static ticket issuer and polling helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use convene_collab::media::loopback::LoopbackEngine;
use convene_collab::media::PeerConnection;
use convene_collab::{ClientConfig, SessionHandle, SignalSink, Ticket, TicketError, TicketIssuer};
use convene_core::{Frame, PageRequest, Participant, SocketAction, SocketEvent, PONG};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

// ──── relay ────

struct Client {
    scid: String,
    tx: mpsc::UnboundedSender<WsMessage>,
}

#[derive(Default)]
struct RelayState {
    clients: HashMap<String, Client>,
    topics: HashMap<String, BTreeSet<String>>,
    backlog: HashMap<String, Vec<Frame>>,
    received: Vec<Frame>,
    accepted: usize,
}

impl RelayState {
    fn send(&self, cid: &str, frame: &Frame) {
        if let (Some(client), Ok(text)) = (self.clients.get(cid), frame.encode()) {
            let _ = client.tx.send(WsMessage::text(text));
        }
    }

    fn fan_out(&self, frame: &Frame) {
        if let Some(members) = self.topics.get(&frame.topic) {
            for cid in members {
                self.send(cid, frame);
            }
        }
    }

    fn roster(&self, topic: &str) -> BTreeMap<String, Participant> {
        let mut roster: BTreeMap<String, Participant> = BTreeMap::new();
        for cid in self.topics.get(topic).into_iter().flatten() {
            let Some(client) = self.clients.get(cid) else {
                continue;
            };
            roster
                .entry(client.scid.clone())
                .or_insert_with(|| Participant::new(&client.scid, client.scid.to_uppercase()).online(true))
                .cids
                .push(cid.clone());
        }
        roster
    }

    fn leave(&mut self, topic: &str, cid: &str) {
        let Some(members) = self.topics.get_mut(topic) else {
            return;
        };
        if !members.remove(cid) {
            return;
        }
        let scid = self.clients.get(cid).map(|c| c.scid.clone()).unwrap_or_default();
        let departure = Frame::new(SocketAction::UnsubscribeTopic, topic).with_payload(format!("{scid}:{cid}"));
        self.fan_out(&departure);
    }

    fn handle(&mut self, cid: &str, frame: Frame) {
        self.received.push(frame.clone());
        if frame.payload == PONG {
            return;
        }
        let topic = frame.topic.clone();

        match frame.action {
            SocketAction::Subscribe => {
                self.topics.entry(topic.clone()).or_default().insert(cid.to_string());
                self.send(cid, &Frame::new(SocketAction::Subscribe, topic).with_sender(cid));
            }
            SocketAction::Unsubscribe => self.leave(&topic, cid),
            SocketAction::LoadSubscribers => {
                let payload = serde_json::to_string(&self.roster(&topic)).unwrap();
                let reply = Frame::new(SocketAction::LoadSubscribers, topic)
                    .with_sender(cid)
                    .with_payload(payload);
                self.fan_out(&reply);
            }
            SocketAction::LoadMessages => {
                let request: PageRequest = serde_json::from_str(&frame.payload).unwrap();
                let stored = self.backlog.get(&topic).cloned().unwrap_or_default();
                let size = request.page_size as usize;
                let skip = (request.page.saturating_sub(1) as usize) * size;
                for old in stored.iter().rev().skip(skip).take(size) {
                    let mut old = old.clone();
                    old.historical = true;
                    self.send(cid, &old);
                }
                if stored.len() > skip + size {
                    self.send(cid, &Frame::new(SocketAction::HasMoreMessages, topic));
                }
            }
            _ => {
                let mut frame = frame.with_sender(cid);
                if frame.store {
                    self.backlog.entry(topic).or_default().push(frame.clone());
                }
                frame.store = false;
                self.fan_out(&frame);
            }
        }
    }

    fn disconnect(&mut self, cid: &str) {
        let topics: Vec<String> = self.topics.keys().cloned().collect();
        for topic in topics {
            self.leave(&topic, cid);
        }
        self.clients.remove(cid);
    }
}

/// A topic server for one test.
pub struct Relay {
    port: u16,
    state: Arc<Mutex<RelayState>>,
}

impl Relay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(RelayState::default()));

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });
        Self { port, state }
    }

    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.host()).insecure()
    }

    /// Sockets accepted so far, including closed ones.
    pub fn accepted(&self) -> usize {
        self.state.lock().accepted
    }

    pub fn online(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn members(&self, topic: &str) -> usize {
        self.state.lock().topics.get(topic).map_or(0, |m| m.len())
    }

    /// Frames received from clients, in arrival order.
    pub fn received(&self) -> Vec<Frame> {
        self.state.lock().received.clone()
    }

    pub fn received_count(&self, action: SocketAction) -> usize {
        self.state.lock().received.iter().filter(|f| f.action == action).count()
    }

    /// Send raw text to every connected client.
    pub fn send_raw(&self, text: &str) {
        for client in self.state.lock().clients.values() {
            let _ = client.tx.send(WsMessage::text(text.to_string()));
        }
    }

    pub fn ping_all(&self) {
        let ping = Frame::new(SocketAction::PingChannel, "").with_payload(convene_core::PING);
        self.send_raw(&ping.encode().unwrap());
    }

    pub fn role_call_all(&self) {
        self.send_raw(&Frame::new(SocketAction::RoleCall, "").encode().unwrap());
    }

    /// Drop every client connection from the server side.
    pub fn kick_all(&self) {
        for client in self.state.lock().clients.values() {
            let _ = client.tx.send(WsMessage::Close(None));
        }
    }

    /// Preload stored text on `topic`, oldest first.
    pub fn seed_backlog(&self, topic: &str, sender: &str, lines: &[&str]) {
        let mut state = self.state.lock();
        let backlog = state.backlog.entry(topic.to_string()).or_default();
        for line in lines {
            let payload = serde_json::json!({ "message": line, "style": "written" }).to_string();
            backlog.push(
                Frame::new(SocketAction::Text, topic)
                    .with_sender(sender)
                    .with_timestamp("2026-03-01T10:15:00.000Z")
                    .with_payload(payload),
            );
        }
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<RelayState>>) {
    let mut query = String::new();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        query = request.uri().query().unwrap_or_default().to_string();
        Ok(response)
    };
    let Ok(socket) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    let ticket = query
        .strip_prefix("ticket=")
        .and_then(|t| urlencoding::decode(t).ok())
        .map(|t| t.into_owned())
        .unwrap_or_default();
    let (scid, cid) = ticket.split_once(':').unwrap_or(("anon", "anon"));
    let (scid, cid) = (scid.to_string(), cid.to_string());

    let (tx, mut rx) = mpsc::unbounded_channel();
    {
        let mut state = state.lock();
        state.accepted += 1;
        state.clients.insert(cid.clone(), Client { scid, tx });
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            Some(outgoing) = rx.recv() => {
                let closing = matches!(outgoing, WsMessage::Close(_));
                if sink.send(outgoing).await.is_err() || closing {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(frame) = Frame::decode(text.as_bytes()) {
                        state.lock().handle(&cid, frame);
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    state.lock().disconnect(&cid);
}

// ──── tickets ────

/// Issues `<scid>:<fresh uuid>` tickets, or fails on demand.
pub struct StaticTicketIssuer {
    scid: String,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl StaticTicketIssuer {
    pub fn new(scid: &str) -> Arc<Self> {
        Arc::new(Self {
            scid: scid.to_string(),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TicketIssuer for StaticTicketIssuer {
    async fn issue(&self) -> Result<Ticket, TicketError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TicketError::Unavailable("ticket service down".into()));
        }
        Ticket::parse(format!("{}:{}", self.scid, Uuid::new_v4().simple()))
    }
}

// ──── signaling ────

/// Session sink that checks every outgoing candidate against the sender's
/// own link: both descriptions must already be current.
#[derive(Clone)]
pub struct RecordingSink {
    session: SessionHandle,
    engine: Arc<LoopbackEngine>,
    pub candidates_sent: Arc<AtomicUsize>,
    pub early_candidates: Arc<AtomicUsize>,
}

impl RecordingSink {
    pub fn new(session: SessionHandle, engine: Arc<LoopbackEngine>) -> Self {
        Self {
            session,
            engine,
            candidates_sent: Arc::new(AtomicUsize::new(0)),
            early_candidates: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl SignalSink for RecordingSink {
    fn connection_id(&self) -> Option<String> {
        self.session.connection_id()
    }

    fn send_signal(&self, event: SocketEvent) -> bool {
        if let SocketEvent::Signal(envelope) = &event {
            if envelope.ice.is_some() {
                self.candidates_sent.fetch_add(1, Ordering::SeqCst);
                let settled = envelope
                    .target
                    .as_deref()
                    .and_then(|target| self.engine.peer(target))
                    .is_some_and(|peer| peer.descriptions().is_settled());
                if !settled {
                    self.early_candidates.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        self.session.send_signal(event)
    }
}

// ──── polling ────

/// Poll `check` until it holds, for up to three seconds.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Next item matching `pred`, skipping others, within three seconds.
pub async fn next_matching<T, F: FnMut(&T) -> bool>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    mut pred: F,
) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(item) = rx.recv().await {
            if pred(&item) {
                return Some(item);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}
