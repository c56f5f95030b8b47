use crate::media::{MediaStream, MediaTrack, PeerConnection};
use convene_core::IceCandidate;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    New,
    /// An offer was sent or a remote offer received
    Negotiating,
    /// Both descriptions current, nothing pending
    Stable,
    Closed,
}

/// Signaling state for one remote participant.
///
/// Local candidates always pass through the queue. They leave it only while
/// both descriptions are current, so nothing is sent to a peer that could
/// not yet use it.
pub struct PeerLink {
    remote_id: String,
    serial: u64,
    connection: Arc<dyn PeerConnection>,
    phase: LinkPhase,
    ice_queue: VecDeque<IceCandidate>,
    remote_media: MediaStream,
}

impl PeerLink {
    pub fn new(remote_id: impl Into<String>, serial: u64, connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            remote_id: remote_id.into(),
            serial,
            connection,
            phase: LinkPhase::New,
            ice_queue: VecDeque::new(),
            remote_media: MediaStream::default(),
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Distinguishes this link from earlier ones to the same participant.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn queued(&self) -> usize {
        self.ice_queue.len()
    }

    pub fn remote_media(&self) -> &MediaStream {
        &self.remote_media
    }

    pub fn attach(&self, stream: &MediaStream) {
        for track in stream.tracks() {
            self.connection.add_track(track);
        }
    }

    pub fn detach(&self, stream: &MediaStream) {
        for track in stream.tracks() {
            self.connection.remove_track(track);
        }
    }

    pub fn begin_negotiation(&mut self) {
        if self.phase != LinkPhase::Closed {
            self.phase = LinkPhase::Negotiating;
        }
    }

    /// Queue a freshly gathered local candidate and return whatever may be
    /// sent now, oldest first.
    pub fn offer_candidate(&mut self, candidate: IceCandidate) -> Vec<IceCandidate> {
        if self.phase == LinkPhase::Closed {
            return Vec::new();
        }
        self.ice_queue.push_back(candidate);
        self.settle()
    }

    /// If both descriptions are current, mark the link stable and hand back
    /// the queued candidates in gathering order. The queue is left empty.
    pub fn settle(&mut self) -> Vec<IceCandidate> {
        if self.phase == LinkPhase::Closed || !self.connection.descriptions().is_settled() {
            return Vec::new();
        }
        if self.phase != LinkPhase::Stable {
            log::debug!("link to {} stable", self.remote_id);
            self.phase = LinkPhase::Stable;
        }
        self.ice_queue.drain(..).collect()
    }

    /// Forget candidates gathered for a local offer that was rolled back.
    pub fn discard_queued(&mut self) -> usize {
        let dropped = self.ice_queue.len();
        self.ice_queue.clear();
        dropped
    }

    /// Remote candidates are only applied to a live link that is not
    /// renegotiating.
    pub fn accepts_remote_candidate(&self) -> bool {
        self.phase != LinkPhase::Closed
            && self.connection.descriptions().is_settled()
            && !self.connection.ice_connection_state().is_dead()
    }

    pub fn add_remote_track(&mut self, track: MediaTrack) {
        self.remote_media.add_track(track);
    }

    /// Returns true if there was anything to clear.
    pub fn clear_remote_media(&mut self) -> bool {
        let had_media = !self.remote_media.is_empty();
        self.remote_media = MediaStream::default();
        had_media
    }

    pub fn close(&mut self) {
        self.connection.close();
        self.phase = LinkPhase::Closed;
        self.ice_queue.clear();
        self.remote_media = MediaStream::default();
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote_id", &self.remote_id)
            .field("serial", &self.serial)
            .field("phase", &self.phase)
            .field("queued", &self.ice_queue.len())
            .field("remote_media", &self.remote_media)
            .finish()
    }
}
