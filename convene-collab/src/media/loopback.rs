//! In-process media engine without devices.
//!
//! Peers follow the offer/answer state machine of a browser connection and
//! describe their tracks in the SDP as `a=track:<id> <kind>` lines, so two
//! engines wired through real signaling see each other's tracks. Every local
//! description applied yields two host candidates.

use super::{
    DescriptionState, IceConnectionState, MediaEngine, MediaError, MediaStream, MediaTrack,
    PeerConnection, PeerEvent, PeerEventSink, SignalingState, TrackKind,
};
use crate::config::{CallConfig, MediaConstraints};
use async_trait::async_trait;
use convene_core::{IceCandidate, SdpKind, SessionDescription};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CANDIDATES_PER_DESCRIPTION: usize = 2;

pub struct LoopbackEngine {
    label: String,
    peers: Mutex<HashMap<String, Arc<LoopbackPeer>>>,
    denial: Mutex<Option<String>>,
    acquire_delay: Mutex<Duration>,
    stopped: Mutex<Vec<String>>,
    next_track: AtomicU64,
}

impl LoopbackEngine {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            peers: Mutex::new(HashMap::new()),
            denial: Mutex::new(None),
            acquire_delay: Mutex::new(Duration::ZERO),
            stopped: Mutex::new(Vec::new()),
            next_track: AtomicU64::new(1),
        }
    }

    /// Make the next acquisitions fail as if the user refused.
    pub fn deny_media(&self, reason: impl Into<String>) {
        *self.denial.lock() = Some(reason.into());
    }

    pub fn allow_media(&self) {
        self.denial.lock().take();
    }

    /// Simulate a slow permission prompt.
    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.acquire_delay.lock() = delay;
    }

    /// Most recent peer created for `remote_id`.
    pub fn peer(&self, remote_id: &str) -> Option<Arc<LoopbackPeer>> {
        self.peers.lock().get(remote_id).cloned()
    }

    /// Ids of every track stopped so far.
    pub fn stopped_tracks(&self) -> Vec<String> {
        self.stopped.lock().clone()
    }

    fn track_id(&self, kind: TrackKind) -> String {
        let n = self.next_track.fetch_add(1, Ordering::Relaxed);
        format!("{}-{kind}-{n}", self.label)
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn create_peer(
        &self,
        remote_id: &str,
        _config: &CallConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, MediaError> {
        let peer = Arc::new(LoopbackPeer::new(self.label.clone(), events));
        self.peers.lock().insert(remote_id.to_string(), peer.clone());
        Ok(peer)
    }

    async fn acquire_local_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        let delay = *self.acquire_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.denial.lock().clone() {
            return Err(MediaError::PermissionDenied(reason));
        }

        let mut tracks = vec![MediaTrack::new(self.track_id(TrackKind::Audio), TrackKind::Audio)];
        if constraints.video.is_some() {
            tracks.push(MediaTrack::new(self.track_id(TrackKind::Video), TrackKind::Video));
        }
        Ok(MediaStream::new(tracks))
    }

    fn stop_track(&self, track: &MediaTrack) {
        self.stopped.lock().push(track.id.clone());
    }
}

#[derive(Debug)]
struct PeerState {
    tracks: Vec<MediaTrack>,
    current_local: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    current_remote: Option<SessionDescription>,
    pending_remote: Option<SessionDescription>,
    signaling: SignalingState,
    ice: IceConnectionState,
    announced: HashSet<String>,
    applied: Vec<IceCandidate>,
}

pub struct LoopbackPeer {
    label: String,
    events: PeerEventSink,
    state: Mutex<PeerState>,
    next_candidate: AtomicU64,
}

impl LoopbackPeer {
    fn new(label: String, events: PeerEventSink) -> Self {
        Self {
            label,
            events,
            state: Mutex::new(PeerState {
                tracks: Vec::new(),
                current_local: None,
                pending_local: None,
                current_remote: None,
                pending_remote: None,
                signaling: SignalingState::Stable,
                ice: IceConnectionState::New,
                announced: HashSet::new(),
                applied: Vec::new(),
            }),
            next_candidate: AtomicU64::new(0),
        }
    }

    /// Candidates received from the remote side, in order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn tracks(&self) -> Vec<MediaTrack> {
        self.state.lock().tracks.clone()
    }

    /// Drive the connection into `state` and report it, as a network would.
    pub fn set_ice_state(&self, state: IceConnectionState) {
        self.state.lock().ice = state;
        self.events.emit(PeerEvent::IceStateChanged(state));
    }

    fn sdp(&self, kind: &str, tracks: &[MediaTrack]) -> String {
        let mut sdp = format!("v=0\r\no={} {kind}\r\n", self.label);
        for track in tracks {
            sdp.push_str(&format!("a=track:{} {}\r\n", track.id, track.kind));
        }
        sdp
    }

    fn gather_candidates(&self) {
        for _ in 0..CANDIDATES_PER_DESCRIPTION {
            let n = self.next_candidate.fetch_add(1, Ordering::Relaxed);
            let mut candidate = IceCandidate::new(format!(
                "candidate:{}{n} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.label,
                40_000 + n
            ));
            candidate.sdp_mid = Some("0".to_string());
            candidate.sdp_m_line_index = Some(0);
            self.events.emit(PeerEvent::IceCandidate(candidate));
        }
    }

    fn ensure_open(state: &PeerState) -> Result<(), MediaError> {
        if state.signaling == SignalingState::Closed {
            Err(MediaError::Closed)
        } else {
            Ok(())
        }
    }
}

fn remote_tracks(sdp: &str) -> Vec<MediaTrack> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("a=track:"))
        .filter_map(|rest| {
            let (id, kind) = rest.split_once(' ')?;
            let kind = match kind.trim() {
                "audio" => TrackKind::Audio,
                "video" => TrackKind::Video,
                _ => return None,
            };
            Some(MediaTrack::new(id, kind))
        })
        .collect()
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    fn add_track(&self, track: &MediaTrack) {
        let mut state = self.state.lock();
        if !state.tracks.iter().any(|t| t.id == track.id) {
            state.tracks.push(track.clone());
        }
    }

    fn remove_track(&self, track: &MediaTrack) {
        self.state.lock().tracks.retain(|t| t.id != track.id);
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        Ok(SessionDescription::offer(self.sdp("offer", &state.tracks)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(MediaError::Negotiation("no remote offer to answer".into()));
        }
        Ok(SessionDescription::answer(self.sdp("answer", &state.tracks)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.pending_local = Some(description);
                    state.signaling = SignalingState::HaveLocalOffer;
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => {
                    state.current_remote = state.pending_remote.take();
                    state.current_local = Some(description);
                    state.signaling = SignalingState::Stable;
                }
                (kind, signaling) => {
                    return Err(MediaError::Negotiation(format!(
                        "cannot apply local {kind:?} in {signaling:?}"
                    )))
                }
            }
        }
        self.gather_candidates();
        Ok(())
    }

    async fn clear_local_description(&self) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.signaling == SignalingState::Stable {
            state.current_local = None;
        }
        Ok(())
    }

    async fn rollback_local_description(&self) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.signaling != SignalingState::HaveLocalOffer {
            return Err(MediaError::Negotiation(format!(
                "nothing to roll back in {:?}",
                state.signaling
            )));
        }
        state.pending_local = None;
        state.signaling = SignalingState::Stable;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        let fresh: Vec<MediaTrack> = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            let tracks = remote_tracks(&description.sdp);
            match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => {
                    state.pending_remote = Some(description);
                    state.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                    state.current_local = state.pending_local.take();
                    state.current_remote = Some(description);
                    state.signaling = SignalingState::Stable;
                }
                (kind, signaling) => {
                    return Err(MediaError::Negotiation(format!(
                        "cannot apply remote {kind:?} in {signaling:?}"
                    )))
                }
            }
            tracks
                .into_iter()
                .filter(|t| state.announced.insert(t.id.clone()))
                .collect()
        };
        for track in fresh {
            self.events.emit(PeerEvent::Track(track));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let connected = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if state.current_remote.is_none() {
                return Err(MediaError::Negotiation("candidate before remote description".into()));
            }
            state.applied.push(candidate);
            if state.ice == IceConnectionState::New {
                state.ice = IceConnectionState::Connected;
                true
            } else {
                false
            }
        };
        if connected {
            self.events.emit(PeerEvent::IceStateChanged(IceConnectionState::Connected));
        }
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        let state = self.state.lock();
        state.pending_local.clone().or_else(|| state.current_local.clone())
    }

    fn descriptions(&self) -> DescriptionState {
        let state = self.state.lock();
        DescriptionState {
            current_local: state.current_local.is_some(),
            current_remote: state.current_remote.is_some(),
            pending_local: state.pending_local.is_some(),
            pending_remote: state.pending_remote.is_some(),
        }
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.signaling = SignalingState::Closed;
        state.ice = IceConnectionState::Closed;
    }
}
