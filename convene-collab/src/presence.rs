//! Per-topic presence and backlog protocol.
//!
//! ```text
//! open(topic) ── SUBSCRIBE ──────────────────────────► server
//!             ◄─ SUBSCRIBE (ack) ─────────────────────
//!             ── LOAD_SUBSCRIBERS ───────────────────►
//!             ◄─ LOAD_SUBSCRIBERS {scid: participant} ─  merge into roster
//!                 sender == me?
//!             ── LOAD_MESSAGES {page: 1, pageSize} ──►
//!             ◄─ historical frames, HAS_MORE_MESSAGES ─
//!             ◄─ UNSUBSCRIBE_TOPIC "scid:cid" ────────── mark offline
//! drop        ── UNSUBSCRIBE ────────────────────────►
//! ```
//!
//! Protocol frames are consumed here. Everything else reaches the
//! application as [`SessionEvent::Message`].

use crate::roster::Roster;
use crate::router::{ListenerError, Subscription};
use crate::signaling::SignalSink;
use crate::transport::ConnectionManager;
use convene_core::{Message, PageRequest, Participant, SocketEvent};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a topic session reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The server acknowledged the subscription
    Subscribed,
    /// Roster after a merge
    RosterUpdated(Roster),
    ParticipantLeft { scid: String },
    /// The server holds backlog beyond the pages loaded so far
    MoreHistory,
    Message(Message),
}

#[derive(Debug, Default)]
struct PresenceState {
    subscribed: bool,
    roster: Roster,
    page: u32,
    more_available: bool,
}

struct SessionShared {
    manager: ConnectionManager,
    topic: String,
    page_size: u32,
    state: Mutex<PresenceState>,
    sinks: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        let mut sinks = self.sinks.lock();
        sinks.retain(|sink| sink.send(event.clone()).is_ok());
    }

    fn send(&self, store: bool, event: &SocketEvent) -> bool {
        self.manager.transmit(store, &self.topic, event)
    }

    fn request_page(&self, page: u32) -> bool {
        self.send(
            false,
            &SocketEvent::LoadMessages(PageRequest {
                page,
                page_size: self.page_size,
            }),
        )
    }

    fn handle(&self, message: &Message) -> Result<(), ListenerError> {
        match &message.event {
            SocketEvent::Subscribe => {
                self.state.lock().subscribed = true;
                self.emit(SessionEvent::Subscribed);
                self.send(false, &SocketEvent::Subscribers(BTreeMap::new()));
            }
            SocketEvent::Subscribers(participants) => {
                let roster = {
                    let mut state = self.state.lock();
                    state.roster.merge(participants.values().cloned());
                    state.roster.clone()
                };
                self.emit(SessionEvent::RosterUpdated(roster));

                if self.manager.connection_id().as_deref() == Some(message.sender.as_str()) {
                    {
                        let mut state = self.state.lock();
                        state.page = 1;
                        state.more_available = false;
                    }
                    self.request_page(1);
                }
            }
            SocketEvent::TopicUnsubscribed { socket_id } => {
                let scid = socket_id.split(':').next().unwrap_or_default().to_string();
                if !self.state.lock().roster.mark_offline(&scid) {
                    log::debug!("departure of unknown participant {scid} on {}", self.topic);
                }
                self.emit(SessionEvent::ParticipantLeft { scid });
            }
            SocketEvent::HasMoreMessages => {
                self.state.lock().more_available = true;
                self.emit(SessionEvent::MoreHistory);
            }
            _ => self.emit(SessionEvent::Message(message.clone())),
        }

        if self.sinks.lock().is_empty() {
            return Err(ListenerError::Closed);
        }
        Ok(())
    }
}

/// Membership in one topic. Dropping it leaves the topic.
pub struct TopicSession {
    handle: SessionHandle,
    subscription: Option<Subscription>,
}

impl TopicSession {
    /// Join `topic` and return the session with its event stream.
    pub fn open(
        manager: &ConnectionManager,
        topic: impl Into<String>,
        page_size: u32,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let topic = topic.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            manager: manager.clone(),
            topic: topic.clone(),
            page_size,
            state: Mutex::new(PresenceState::default()),
            sinks: Mutex::new(vec![tx]),
        });

        let listener = Arc::downgrade(&shared);
        let subscription = manager.subscribe(topic.clone(), move |message: &Message| {
            match listener.upgrade() {
                Some(shared) => shared.handle(message),
                None => Err(ListenerError::Closed),
            }
        });

        if subscription.is_first() {
            shared.send(false, &SocketEvent::Subscribe);
        } else {
            // The server already has this client on the topic.
            shared.state.lock().subscribed = true;
            shared.send(false, &SocketEvent::Subscribers(BTreeMap::new()));
        }
        log::debug!("joined {topic}");

        let session = Self {
            handle: SessionHandle { shared },
            subscription: Some(subscription),
        };
        (session, rx)
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Leave the topic. Same as dropping the session.
    pub fn close(self) {}
}

impl std::ops::Deref for TopicSession {
    type Target = SessionHandle;

    fn deref(&self) -> &SessionHandle {
        &self.handle
    }
}

impl Drop for TopicSession {
    fn drop(&mut self) {
        let shared = &self.handle.shared;
        if let Some(subscription) = self.subscription.take() {
            if subscription.unsubscribe() {
                shared.send(false, &SocketEvent::Unsubscribe);
            }
        }
        // Closing the sinks ends every event stream.
        shared.sinks.lock().clear();
        log::debug!("left {}", shared.topic);
    }
}

/// Cloneable access to a topic session's state and send path.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    pub fn connection_id(&self) -> Option<String> {
        self.shared.manager.connection_id()
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.state.lock().subscribed
    }

    pub fn roster(&self) -> Roster {
        self.shared.state.lock().roster.clone()
    }

    pub fn participant(&self, scid: &str) -> Option<Participant> {
        self.shared.state.lock().roster.get(scid).cloned()
    }

    pub fn more_available(&self) -> bool {
        self.shared.state.lock().more_available
    }

    /// Last backlog page requested, 0 before the first.
    pub fn page(&self) -> u32 {
        self.shared.state.lock().page
    }

    /// Request the next backlog page. The "more available" flag is cleared
    /// until the server says otherwise. Returns the page requested.
    pub fn load_more(&self) -> u32 {
        let page = {
            let mut state = self.shared.state.lock();
            state.page += 1;
            state.more_available = false;
            state.page
        };
        self.shared.request_page(page);
        page
    }

    /// Send to everyone on the topic.
    pub fn send(&self, event: &SocketEvent) -> bool {
        self.shared.send(false, event)
    }

    /// Send and ask the server to keep it in the topic backlog.
    pub fn store(&self, event: &SocketEvent) -> bool {
        self.shared.send(true, event)
    }

    /// Another receiver of this session's events, from now on.
    pub fn events(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.sinks.lock().push(tx);
        rx
    }
}

impl SignalSink for SessionHandle {
    fn connection_id(&self) -> Option<String> {
        SessionHandle::connection_id(self)
    }

    fn send_signal(&self, event: SocketEvent) -> bool {
        self.send(&event)
    }
}
