//! Peer signaling: one [`PeerLink`] per remote participant, driven by the
//! [`CallOrchestrator`] over a topic's control frames.

mod link;
mod orchestrator;

pub use link::{LinkPhase, PeerLink};
pub use orchestrator::{CallEvent, CallHandle, CallOrchestrator, CallSnapshot, ControlState, LinkSnapshot};

use convene_core::SocketEvent;

/// Where the orchestrator sends its control frames, normally a topic
/// session.
pub trait SignalSink: Send + Sync + 'static {
    /// This client's connection id, once the socket has opened.
    fn connection_id(&self) -> Option<String>;

    /// False if the frame could not be sent.
    fn send_signal(&self, event: SocketEvent) -> bool;
}
