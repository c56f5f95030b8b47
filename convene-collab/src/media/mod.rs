//! Seam between the signaling orchestrator and a media engine.
//!
//! The orchestrator never touches devices or codecs. It drives a
//! [`MediaEngine`] that hands out [`PeerConnection`]s and local streams, and
//! hears back through a [`PeerEventSink`]: local ICE candidates, remote
//! tracks and ICE connection state changes.
//!
//! [`loopback`] is an in-process engine with no real devices.

pub mod loopback;

use crate::config::{CallConfig, MediaConstraints};
use async_trait::async_trait;
use convene_core::{IceCandidate, SessionDescription};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("peer connection closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self { id: id.into(), kind }
    }
}

/// A set of tracks from one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaStream {
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    /// Ignores a track already present.
    pub fn add_track(&mut self, track: MediaTrack) {
        if !self.tracks.iter().any(|t| t.id == track.id) {
            self.tracks.push(track);
        }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    /// Failed, disconnected or closed.
    pub fn is_dead(self) -> bool {
        matches!(
            self,
            IceConnectionState::Failed | IceConnectionState::Disconnected | IceConnectionState::Closed
        )
    }
}

/// Which descriptions a connection holds. "Current" ones are agreed by both
/// sides; "pending" ones are mid-negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptionState {
    pub current_local: bool,
    pub current_remote: bool,
    pub pending_local: bool,
    pub pending_remote: bool,
}

impl DescriptionState {
    /// Both descriptions current and nothing pending.
    pub fn is_settled(&self) -> bool {
        self.current_local && self.current_remote && !self.pending_local && !self.pending_remote
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    Track(MediaTrack),
    IceStateChanged(IceConnectionState),
}

/// A [`PeerEvent`] tagged with the link it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSignal {
    pub remote_id: String,
    pub serial: u64,
    pub event: PeerEvent,
}

/// Where a peer connection reports its events.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    remote_id: String,
    serial: u64,
    tx: mpsc::UnboundedSender<PeerSignal>,
}

impl PeerEventSink {
    pub fn new(remote_id: impl Into<String>, serial: u64, tx: mpsc::UnboundedSender<PeerSignal>) -> Self {
        Self {
            remote_id: remote_id.into(),
            serial,
            tx,
        }
    }

    /// False once the orchestrator is gone.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(PeerSignal {
                remote_id: self.remote_id.clone(),
                serial: self.serial,
                event,
            })
            .is_ok()
    }
}

/// One media connection to one remote participant.
///
/// Description operations are serialized by the implementation, the way a
/// browser peer connection queues them.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn add_track(&self, track: &MediaTrack);

    fn remove_track(&self, track: &MediaTrack);

    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MediaError>;

    /// Drop the current local description ahead of renegotiation.
    async fn clear_local_description(&self) -> Result<(), MediaError>;

    /// Withdraw a local offer that has not been answered, returning to
    /// `Stable`. Fails in any other state.
    async fn rollback_local_description(&self) -> Result<(), MediaError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Pending local description if any, else the current one.
    fn local_description(&self) -> Option<SessionDescription>;

    fn descriptions(&self) -> DescriptionState;

    fn signaling_state(&self) -> SignalingState;

    fn ice_connection_state(&self) -> IceConnectionState;

    fn close(&self);
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    fn create_peer(
        &self,
        remote_id: &str,
        config: &CallConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, MediaError>;

    /// Open local capture devices. May take as long as the user needs to
    /// answer a permission prompt.
    async fn acquire_local_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError>;

    fn stop_track(&self, track: &MediaTrack);
}
