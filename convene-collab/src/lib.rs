//! # convene-collab: real-time core for Convene
//!
//! One multiplexed socket per client carries chat presence, history and
//! call signaling for every topic the client has joined.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   ticket   ┌──────────────────┐
//! │ ConnectionManager│ ─────────► │  TicketIssuer    │
//! │ (socket, PING,   │            └──────────────────┘
//! │  reconnect)      │ ◄────────► OnCallMarker store
//! └────────┬─────────┘
//!          │ Message
//!          ▼
//! ┌──────────────────┐
//! │   TopicRouter    │  topic → listeners
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐  SessionEvent  ┌──────────────────┐
//! │  TopicSession    │ ─────────────► │ CallOrchestrator │ ──► MediaEngine
//! │ (roster, backlog)│ ─────────────► │ ChatLog          │
//! └──────────────────┘                └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`]: ticket handshake, socket loop, heartbeat, reconnect
//! - [`router`]: topic listeners with per-listener fault isolation
//! - [`presence`]: subscribe handshake, roster merge, backlog paging
//! - [`signaling`]: per-peer offer/answer/ICE orchestration
//! - [`media`]: seam to the media engine, plus an in-process loopback
//! - [`chat`]: attributed chat log

pub mod chat;
pub mod config;
pub mod marker;
pub mod media;
pub mod notice;
pub mod presence;
pub mod reconnect;
pub mod roster;
pub mod router;
pub mod signaling;
pub mod ticket;
pub mod transport;

// Re-exports for convenience
pub use chat::{ChatEntry, ChatLog};
pub use config::{CallConfig, ClientConfig, IceServer, MediaConstraints};
pub use marker::{FileMarkerStore, MarkerStore, MemoryMarkerStore, OnCallMarker};
pub use media::{MediaEngine, MediaError, MediaStream, MediaTrack, PeerConnection};
pub use notice::{ClientEvent, Notice, NoticeKind};
pub use presence::{SessionEvent, SessionHandle, TopicSession};
pub use reconnect::{ReconnectAction, ReconnectPolicy};
pub use roster::Roster;
pub use router::{ListenerError, Subscription, TopicRouter};
pub use signaling::{CallEvent, CallHandle, CallOrchestrator, ControlState, PeerLink, SignalSink};
pub use ticket::{HttpTicketIssuer, Ticket, TicketError, TicketIssuer};
pub use transport::{ConnectionManager, ConnectionState, TransportError};
