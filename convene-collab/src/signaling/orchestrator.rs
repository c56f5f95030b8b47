//! Multi-peer call orchestration over one topic.
//!
//! ```text
//!   A (starts media)                       B
//!   ── STREAM_INQUIRY (everyone) ───────────►  no link to A: create one
//!   ◄────────────────── START_STREAM {target: A}
//!   create link, attach tracks
//!   ── RTC {target: B, sdp: offer} ─────────►  set remote, answer
//!   ◄──────────────── RTC {target: A, sdp: answer}
//!   set remote, flush queued ICE
//!   ◄──────── RTC {ice} ─────── RTC {ice} ──►
//! ```
//!
//! The orchestrator is a single task. Description work is awaited inline so
//! one link never sees two description changes interleave. Media
//! acquisition can wait on a permission prompt, so it runs off-task and
//! reports back tagged with the call epoch it was started under.
//!
//! Crossing offers resolve by connection id: the lower id rolls its offer
//! back and answers, the higher id ignores the incoming offer and waits for
//! that answer.

use super::link::{LinkPhase, PeerLink};
use super::SignalSink;
use crate::config::CallConfig;
use crate::media::{
    MediaEngine, MediaError, MediaStream, PeerConnection, PeerEvent, PeerEventSink, PeerSignal,
    SignalingState,
};
use crate::notice::Notice;
use crate::presence::SessionEvent;
use convene_core::{
    CallTarget, IceCandidate, Message, SessionDescription, SignalEnvelope, SocketAction, SocketEvent,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// What the local start/stop control offers the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Start,
    /// Waiting on local media
    Pending,
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Remote streams by connection id, after any change
    StreamsUpdated(Vec<(String, MediaStream)>),
    ControlChanged(ControlState),
    Notice(Notice),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub remote_id: String,
    pub phase: LinkPhase,
    pub queued: usize,
    pub has_remote_media: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub control: ControlState,
    pub streaming: bool,
    pub links: Vec<LinkSnapshot>,
}

impl CallSnapshot {
    pub fn link(&self, remote_id: &str) -> Option<&LinkSnapshot> {
        self.links.iter().find(|l| l.remote_id == remote_id)
    }
}

enum CallCommand {
    StartMedia { video: bool },
    LeaveCall,
    Snapshot(oneshot::Sender<CallSnapshot>),
    Teardown,
}

struct MediaOutcome {
    epoch: u64,
    result: Result<MediaStream, MediaError>,
}

/// Controls a running orchestrator. Dropping every handle tears it down.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<CallCommand>,
}

impl CallHandle {
    /// Ask for local media and join the call. Ignored while a start is in
    /// progress or media is already live.
    pub fn start_media(&self, video: bool) -> bool {
        self.commands.send(CallCommand::StartMedia { video }).is_ok()
    }

    /// Stop local media and tell the topic. Links stay up.
    pub fn leave_call(&self) -> bool {
        self.commands.send(CallCommand::LeaveCall).is_ok()
    }

    pub async fn snapshot(&self) -> Option<CallSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(CallCommand::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    /// Close every link and stop the orchestrator.
    pub fn teardown(&self) -> bool {
        self.commands.send(CallCommand::Teardown).is_ok()
    }
}

pub struct CallOrchestrator<S: SignalSink> {
    sink: S,
    engine: Arc<dyn MediaEngine>,
    config: CallConfig,
    links: BTreeMap<String, PeerLink>,
    local: Option<MediaStream>,
    control: ControlState,
    epoch: u64,
    next_serial: u64,
    subscribed: bool,
    pinged: bool,
    torn_down: bool,
    events: mpsc::UnboundedSender<CallEvent>,
    peer_tx: mpsc::UnboundedSender<PeerSignal>,
    media_tx: mpsc::UnboundedSender<MediaOutcome>,
}

impl<S: SignalSink> CallOrchestrator<S> {
    /// Start orchestrating calls for the session that feeds `inbound`.
    /// The task ends on teardown or when every handle is dropped; it tears
    /// the call down when `inbound` closes.
    pub fn spawn(
        sink: S,
        engine: Arc<dyn MediaEngine>,
        config: CallConfig,
        inbound: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> (CallHandle, mpsc::UnboundedReceiver<CallEvent>, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();

        let orchestrator = Self {
            sink,
            engine,
            config,
            links: BTreeMap::new(),
            local: None,
            control: ControlState::Start,
            epoch: 0,
            next_serial: 0,
            subscribed: false,
            pinged: false,
            torn_down: false,
            events,
            peer_tx,
            media_tx,
        };
        let task = tokio::spawn(orchestrator.run(inbound, command_rx, peer_rx, media_rx));
        (CallHandle { commands }, event_rx, task)
    }

    async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<SessionEvent>,
        mut commands: mpsc::UnboundedReceiver<CallCommand>,
        mut peers: mpsc::UnboundedReceiver<PeerSignal>,
        mut media: mpsc::UnboundedReceiver<MediaOutcome>,
    ) {
        let mut inbound_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(CallCommand::StartMedia { video }) => self.start_media(video),
                    Some(CallCommand::LeaveCall) => self.leave_call(),
                    Some(CallCommand::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(CallCommand::Teardown) | None => {
                        self.teardown();
                        return;
                    }
                },
                event = inbound.recv(), if inbound_open => match event {
                    Some(event) => self.on_session_event(event).await,
                    None => {
                        inbound_open = false;
                        self.teardown();
                    }
                },
                Some(signal) = peers.recv() => self.on_peer_signal(signal),
                Some(outcome) = media.recv() => self.on_media(outcome).await,
            }
        }
    }

    // ──── outbound ────

    fn send(&self, event: SocketEvent) {
        let action = event.action();
        if !self.sink.send_signal(event) {
            log::debug!("{action} not sent: transport closed");
        }
    }

    fn send_candidates(&self, remote_id: &str, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            self.send(SocketEvent::Signal(SignalEnvelope::candidate(remote_id, candidate)));
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn set_control(&mut self, control: ControlState) {
        if self.control != control {
            self.control = control;
            self.emit(CallEvent::ControlChanged(control));
        }
    }

    fn streams(&self) -> Vec<(String, MediaStream)> {
        self.links
            .values()
            .filter(|link| !link.remote_media().is_empty())
            .map(|link| (link.remote_id().to_string(), link.remote_media().clone()))
            .collect()
    }

    fn emit_streams(&self) {
        self.emit(CallEvent::StreamsUpdated(self.streams()));
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            control: self.control,
            streaming: self.local.is_some(),
            links: self
                .links
                .values()
                .map(|link| LinkSnapshot {
                    remote_id: link.remote_id().to_string(),
                    phase: link.phase(),
                    queued: link.queued(),
                    has_remote_media: !link.remote_media().is_empty(),
                })
                .collect(),
        }
    }

    // ──── links ────

    /// The link to `remote_id`, created with local tracks attached if absent.
    fn ensure_link(&mut self, remote_id: &str) -> Option<&mut PeerLink> {
        if !self.links.contains_key(remote_id) {
            self.next_serial += 1;
            let serial = self.next_serial;
            let events = PeerEventSink::new(remote_id, serial, self.peer_tx.clone());
            let connection = match self.engine.create_peer(remote_id, &self.config, events) {
                Ok(connection) => connection,
                Err(e) => {
                    log::warn!("cannot create peer connection to {remote_id}: {e}");
                    return None;
                }
            };
            let link = PeerLink::new(remote_id, serial, connection);
            if let Some(local) = &self.local {
                link.attach(local);
            }
            log::info!("peer link to {remote_id} created");
            self.links.insert(remote_id.to_string(), link);
        }
        self.links.get_mut(remote_id)
    }

    fn remove_link(&mut self, remote_id: &str) {
        if let Some(mut link) = self.links.remove(remote_id) {
            link.close();
            log::info!("peer link to {remote_id} removed");
            self.emit_streams();
        }
    }

    /// Create and send an offer on the link to `remote_id`.
    async fn offer(&mut self, remote_id: &str) {
        let Some(link) = self.ensure_link(remote_id) else {
            return;
        };
        let connection = link.connection().clone();

        let result = create_offer(&*connection).await;
        match result {
            Ok(offer) => {
                if let Some(link) = self.links.get_mut(remote_id) {
                    link.begin_negotiation();
                }
                self.send(SocketEvent::Signal(SignalEnvelope::description(remote_id, offer)));
            }
            Err(e) => log::warn!("offer to {remote_id} failed: {e}"),
        }
    }

    // ──── inbound ────

    async fn on_session_event(&mut self, event: SessionEvent) {
        if self.torn_down {
            return;
        }
        match event {
            SessionEvent::Subscribed => self.subscribed = true,
            SessionEvent::RosterUpdated(roster) => {
                if self.subscribed && !self.pinged && roster.len() >= 2 {
                    self.pinged = true;
                    self.send(SocketEvent::PingChannel(CallTarget::everyone()));
                }
            }
            SessionEvent::Message(message) => self.on_message(message).await,
            SessionEvent::ParticipantLeft { .. } | SessionEvent::MoreHistory => {}
        }
    }

    /// Whether a call frame concerns this client.
    fn concerns_me(&self, message: &Message) -> bool {
        let me = self.sink.connection_id();
        if me.as_deref() == Some(message.sender.as_str()) {
            return false;
        }
        match message.target() {
            Some(target) => me.as_deref() == Some(target),
            None => matches!(
                message.action(),
                SocketAction::StreamInquiry | SocketAction::PingChannel | SocketAction::StopStream
            ),
        }
    }

    async fn on_message(&mut self, message: Message) {
        if !self.concerns_me(&message) {
            return;
        }
        let sender = message.sender.as_str();

        match &message.event {
            SocketEvent::PingChannel(_) => {
                if self.local.is_some() {
                    self.invite(sender);
                }
            }
            SocketEvent::StreamInquiry(_) => {
                if !self.links.contains_key(sender) {
                    self.invite(sender);
                }
            }
            SocketEvent::StartStream(_) => self.offer(sender).await,
            SocketEvent::StopStream(_) => {
                let cleared = self
                    .links
                    .get_mut(sender)
                    .is_some_and(|link| link.clear_remote_media());
                if cleared {
                    log::debug!("{sender} stopped streaming");
                    self.emit_streams();
                }
            }
            SocketEvent::Signal(envelope) => {
                if let Some(sdp) = &envelope.sdp {
                    self.on_description(sender, sdp.clone()).await;
                } else if let Some(ice) = &envelope.ice {
                    self.on_remote_candidate(sender, ice.clone()).await;
                }
            }
            _ => {}
        }
    }

    /// Ask `remote_id` to send us an offer.
    fn invite(&mut self, remote_id: &str) {
        if self.ensure_link(remote_id).is_some() {
            self.send(SocketEvent::StartStream(CallTarget::to(remote_id)));
        }
    }

    async fn on_description(&mut self, remote_id: &str, description: SessionDescription) {
        let is_offer = description.is_offer();
        if !is_offer && !self.links.contains_key(remote_id) {
            log::debug!("answer from {remote_id} without a link ignored");
            return;
        }
        let yields = self.yields_to(remote_id);
        let Some(link) = self.ensure_link(remote_id) else {
            return;
        };
        let connection = link.connection().clone();
        let signaling = connection.signaling_state();

        if is_offer {
            if signaling == SignalingState::HaveLocalOffer {
                if !yields {
                    log::debug!("offer from {remote_id} crosses ours, keeping ours");
                    return;
                }
                let dropped = link.discard_queued();
                log::debug!("offer from {remote_id} crosses ours, rolling back ({dropped} candidates dropped)");
            }
            link.begin_negotiation();
        } else if signaling != SignalingState::HaveLocalOffer {
            log::debug!("answer from {remote_id} ignored in {signaling:?}");
            return;
        }

        let result = apply_description(&*connection, description).await;

        match result {
            Ok(answer) => {
                if let Some(answer) = answer {
                    self.send(SocketEvent::Signal(SignalEnvelope::description(remote_id, answer)));
                }
                let flushed = match self.links.get_mut(remote_id) {
                    Some(link) => link.settle(),
                    None => Vec::new(),
                };
                self.send_candidates(remote_id, flushed);
            }
            Err(e) => log::warn!("description from {remote_id} not applied: {e}"),
        }
    }

    /// When offers cross, the side with the lower connection id withdraws
    /// its own and answers.
    fn yields_to(&self, remote_id: &str) -> bool {
        self.sink
            .connection_id()
            .map_or(true, |me| me.as_str() < remote_id)
    }

    async fn on_remote_candidate(&mut self, remote_id: &str, candidate: IceCandidate) {
        let connection = match self.links.get(remote_id) {
            Some(link) if link.accepts_remote_candidate() => link.connection().clone(),
            Some(_) => {
                log::debug!("dropping candidate from {remote_id}: link not settled");
                return;
            }
            None => {
                log::debug!("dropping candidate from {remote_id}: no link");
                return;
            }
        };
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            log::debug!("dropping candidate from {remote_id}: {e}");
        }
    }

    fn on_peer_signal(&mut self, signal: PeerSignal) {
        if self.torn_down {
            return;
        }
        let PeerSignal {
            remote_id,
            serial,
            event,
        } = signal;
        let Some(link) = self.links.get_mut(&remote_id) else {
            return;
        };
        if link.serial() != serial {
            return;
        }

        match event {
            PeerEvent::IceCandidate(candidate) => {
                let ready = link.offer_candidate(candidate);
                self.send_candidates(&remote_id, ready);
            }
            PeerEvent::Track(track) => {
                link.add_remote_track(track);
                self.emit_streams();
            }
            PeerEvent::IceStateChanged(state) if state.is_dead() => {
                log::info!("connection to {remote_id} is {state:?}");
                self.remove_link(&remote_id);
            }
            PeerEvent::IceStateChanged(state) => {
                log::trace!("connection to {remote_id} is {state:?}");
            }
        }
    }

    // ──── local media ────

    fn start_media(&mut self, video: bool) {
        if self.torn_down || self.control != ControlState::Start || self.local.is_some() {
            log::debug!("start ignored: media already starting or live");
            return;
        }
        self.set_control(ControlState::Pending);

        let engine = self.engine.clone();
        let constraints = self.config.constraints(video);
        let epoch = self.epoch;
        let tx = self.media_tx.clone();
        tokio::spawn(async move {
            let result = engine.acquire_local_media(&constraints).await;
            let _ = tx.send(MediaOutcome { epoch, result });
        });
    }

    async fn on_media(&mut self, outcome: MediaOutcome) {
        if self.torn_down || outcome.epoch != self.epoch {
            if let Ok(stream) = outcome.result {
                log::debug!("discarding media acquired for an earlier call");
                self.stop_tracks(&stream);
            }
            return;
        }

        let stream = match outcome.result {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("local media unavailable: {e}");
                self.set_control(ControlState::Start);
                self.emit(CallEvent::Notice(Notice::error(e.to_string())));
                return;
            }
        };

        for link in self.links.values() {
            link.attach(&stream);
        }
        self.local = Some(stream);

        let remotes: Vec<String> = self.links.keys().cloned().collect();
        for remote_id in remotes {
            self.offer(&remote_id).await;
        }
        self.send(SocketEvent::StreamInquiry(CallTarget::everyone()));
        self.set_control(ControlState::Stop);
    }

    fn stop_tracks(&self, stream: &MediaStream) {
        for track in stream.tracks() {
            self.engine.stop_track(track);
        }
    }

    fn leave_call(&mut self) {
        if self.torn_down {
            return;
        }
        // A start still in flight belongs to the call being left.
        self.epoch += 1;
        if let Some(local) = self.local.take() {
            for link in self.links.values() {
                link.detach(&local);
            }
            self.stop_tracks(&local);
        }
        self.send(SocketEvent::StopStream(CallTarget::everyone()));
        self.set_control(ControlState::Start);
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.epoch += 1;
        for (_, mut link) in std::mem::take(&mut self.links) {
            link.close();
        }
        if let Some(local) = self.local.take() {
            self.stop_tracks(&local);
        }
        self.set_control(ControlState::Start);
        self.emit_streams();
        log::info!("call torn down");
    }
}

async fn create_offer(connection: &dyn PeerConnection) -> Result<SessionDescription, MediaError> {
    let offer = connection.create_offer().await?;
    connection.set_local_description(offer.clone()).await?;
    Ok(offer)
}

/// Apply a remote description; for an offer, returns the answer to send.
async fn apply_description(
    connection: &dyn PeerConnection,
    description: SessionDescription,
) -> Result<Option<SessionDescription>, MediaError> {
    if !description.is_offer() {
        connection.set_remote_description(description).await?;
        return Ok(None);
    }

    // An offer needs a fresh local description: withdraw an unanswered
    // offer of ours, or drop the current one when renegotiating.
    match connection.signaling_state() {
        SignalingState::HaveLocalOffer => connection.rollback_local_description().await?,
        SignalingState::Stable if connection.descriptions().current_local => {
            connection.clear_local_description().await?
        }
        _ => {}
    }
    connection.set_remote_description(description).await?;
    let answer = connection.create_answer().await?;
    connection.set_local_description(answer.clone()).await?;
    Ok(Some(answer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::loopback::LoopbackEngine;
    use crate::media::IceConnectionState;
    use crate::roster::Roster;
    use convene_core::Participant;
    use parking_lot::Mutex;
    use std::time::Duration;

    const TOPIC: &str = "exchange/1:session42";

    #[derive(Clone, Default)]
    struct CapturingSink {
        sent: Arc<Mutex<Vec<SocketEvent>>>,
    }

    impl CapturingSink {
        fn take(&self) -> Vec<SocketEvent> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl SignalSink for CapturingSink {
        fn connection_id(&self) -> Option<String> {
            Some("me".into())
        }

        fn send_signal(&self, event: SocketEvent) -> bool {
            self.sent.lock().push(event);
            true
        }
    }

    struct Rig {
        sink: CapturingSink,
        engine: Arc<LoopbackEngine>,
        inbound: mpsc::UnboundedSender<SessionEvent>,
        handle: CallHandle,
        events: mpsc::UnboundedReceiver<CallEvent>,
        task: JoinHandle<()>,
    }

    fn rig() -> Rig {
        let sink = CapturingSink::default();
        let engine = Arc::new(LoopbackEngine::new("me"));
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (handle, events, task) =
            CallOrchestrator::spawn(sink.clone(), engine.clone(), CallConfig::default(), inbound_rx);
        Rig {
            sink,
            engine,
            inbound,
            handle,
            events,
            task,
        }
    }

    fn message(sender: &str, event: SocketEvent) -> SessionEvent {
        SessionEvent::Message(Message {
            store: false,
            historical: false,
            timestamp: String::new(),
            topic: TOPIC.into(),
            sender: sender.into(),
            event,
        })
    }

    /// Round-trip through the orchestrator so everything queued before is
    /// handled.
    async fn settle(rig: &Rig) -> CallSnapshot {
        tokio::time::sleep(Duration::from_millis(10)).await;
        rig.handle.snapshot().await.unwrap()
    }

    fn remote_offer(sdp: &str) -> SocketEvent {
        SocketEvent::Signal(SignalEnvelope::description("me", SessionDescription::offer(sdp)))
    }

    #[tokio::test]
    async fn test_frames_for_others_are_ignored() {
        let rig = rig();
        rig.inbound
            .send(message("peer", SocketEvent::StartStream(CallTarget::to("someone-else"))))
            .unwrap();
        rig.inbound
            .send(message("me", SocketEvent::StreamInquiry(CallTarget::everyone())))
            .unwrap();
        rig.inbound
            .send(message("peer", SocketEvent::StartStream(CallTarget::everyone())))
            .unwrap();

        let snapshot = settle(&rig).await;
        assert!(snapshot.links.is_empty());
        assert!(rig.sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_inquiry_without_link_invites_once() {
        let rig = rig();
        for _ in 0..2 {
            rig.inbound
                .send(message("peer", SocketEvent::StreamInquiry(CallTarget::everyone())))
                .unwrap();
        }

        let snapshot = settle(&rig).await;
        assert_eq!(snapshot.links.len(), 1);
        assert_eq!(snapshot.link("peer").unwrap().phase, LinkPhase::New);
        assert_eq!(
            rig.sink.take(),
            vec![SocketEvent::StartStream(CallTarget::to("peer"))]
        );
    }

    #[tokio::test]
    async fn test_channel_ping_only_answered_while_streaming() {
        let rig = rig();
        rig.inbound
            .send(message("peer", SocketEvent::PingChannel(CallTarget::everyone())))
            .unwrap();
        assert!(settle(&rig).await.links.is_empty());

        rig.handle.start_media(false);
        let snapshot = settle(&rig).await;
        assert!(snapshot.streaming);
        assert_eq!(
            rig.sink.take(),
            vec![SocketEvent::StreamInquiry(CallTarget::everyone())]
        );

        rig.inbound
            .send(message("peer", SocketEvent::PingChannel(CallTarget::everyone())))
            .unwrap();
        settle(&rig).await;
        assert_eq!(
            rig.sink.take(),
            vec![SocketEvent::StartStream(CallTarget::to("peer"))]
        );
    }

    #[tokio::test]
    async fn test_start_stream_sends_offer_with_local_tracks() {
        let mut rig = rig();
        rig.handle.start_media(true);
        settle(&rig).await;
        rig.sink.take();

        rig.inbound
            .send(message("peer", SocketEvent::StartStream(CallTarget::to("me"))))
            .unwrap();
        let snapshot = settle(&rig).await;
        assert_eq!(snapshot.link("peer").unwrap().phase, LinkPhase::Negotiating);
        // Candidates gathered for the pending offer stay queued.
        assert_eq!(snapshot.link("peer").unwrap().queued, 2);

        let sent = rig.sink.take();
        assert_eq!(sent.len(), 1);
        let SocketEvent::Signal(envelope) = &sent[0] else {
            panic!("expected an offer, got {sent:?}");
        };
        assert_eq!(envelope.target.as_deref(), Some("peer"));
        let offer = envelope.sdp.as_ref().unwrap();
        assert!(offer.is_offer());
        assert!(offer.sdp.contains("video"));

        assert_eq!(
            rig.events.recv().await,
            Some(CallEvent::ControlChanged(ControlState::Pending))
        );
        assert_eq!(
            rig.events.recv().await,
            Some(CallEvent::ControlChanged(ControlState::Stop))
        );
    }

    #[tokio::test]
    async fn test_remote_offer_is_answered_and_candidates_follow() {
        let mut rig = rig();
        rig.inbound
            .send(message("peer", remote_offer("v=0\r\na=track:peer-audio-1 audio\r\n")))
            .unwrap();
        let snapshot = settle(&rig).await;
        let link = snapshot.link("peer").unwrap();
        assert_eq!(link.phase, LinkPhase::Stable);
        assert_eq!(link.queued, 0);
        assert!(link.has_remote_media);

        let sent = rig.sink.take();
        let SocketEvent::Signal(first) = &sent[0] else {
            panic!("expected an answer first, got {sent:?}");
        };
        assert!(!first.sdp.as_ref().unwrap().is_offer());
        let candidates = sent[1..]
            .iter()
            .filter(|e| matches!(e, SocketEvent::Signal(s) if s.ice.is_some()))
            .count();
        assert_eq!(candidates, 2);

        match rig.events.recv().await {
            Some(CallEvent::StreamsUpdated(streams)) => assert_eq!(streams[0].0, "peer"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_stream_clears_only_that_sender() {
        let rig = rig();
        rig.inbound
            .send(message("peer", remote_offer("v=0\r\na=track:peer-audio-1 audio\r\n")))
            .unwrap();
        rig.inbound
            .send(message("other", remote_offer("v=0\r\na=track:other-audio-1 audio\r\n")))
            .unwrap();
        settle(&rig).await;

        rig.inbound
            .send(message("peer", SocketEvent::StopStream(CallTarget::everyone())))
            .unwrap();
        let snapshot = settle(&rig).await;
        assert!(!snapshot.link("peer").unwrap().has_remote_media);
        assert!(snapshot.link("other").unwrap().has_remote_media);
        assert_eq!(snapshot.links.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_connection_removes_link() {
        let mut rig = rig();
        rig.inbound
            .send(message("peer", remote_offer("v=0\r\na=track:peer-video-1 video\r\n")))
            .unwrap();
        settle(&rig).await;
        while rig.events.try_recv().is_ok() {}

        rig.engine
            .peer("peer")
            .unwrap()
            .set_ice_state(IceConnectionState::Failed);
        let snapshot = settle(&rig).await;
        assert!(snapshot.link("peer").is_none());
        assert_eq!(rig.events.try_recv().ok(), Some(CallEvent::StreamsUpdated(Vec::new())));
    }

    #[tokio::test]
    async fn test_candidates_for_unsettled_link_are_dropped() {
        let rig = rig();
        rig.inbound
            .send(message("peer", SocketEvent::StreamInquiry(CallTarget::everyone())))
            .unwrap();
        rig.inbound
            .send(message(
                "peer",
                SocketEvent::Signal(SignalEnvelope::candidate("me", IceCandidate::new("candidate:1"))),
            ))
            .unwrap();
        settle(&rig).await;
        assert!(rig.engine.peer("peer").unwrap().applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_media_failure_resets_control_and_notifies() {
        let mut rig = rig();
        rig.engine.deny_media("Permission denied");
        rig.handle.start_media(true);

        assert_eq!(
            rig.events.recv().await,
            Some(CallEvent::ControlChanged(ControlState::Pending))
        );
        assert_eq!(
            rig.events.recv().await,
            Some(CallEvent::ControlChanged(ControlState::Start))
        );
        match rig.events.recv().await {
            Some(CallEvent::Notice(notice)) => assert!(notice.message.contains("Permission denied")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!settle(&rig).await.streaming);
        assert!(rig.sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_second_start_while_pending_is_ignored() {
        let rig = rig();
        rig.engine.set_acquire_delay(Duration::from_millis(30));
        rig.handle.start_media(false);
        rig.handle.start_media(false);
        tokio::time::sleep(Duration::from_millis(80)).await;

        let snapshot = rig.handle.snapshot().await.unwrap();
        assert!(snapshot.streaming);
        assert_eq!(snapshot.control, ControlState::Stop);
        let inquiries = rig
            .sink
            .take()
            .into_iter()
            .filter(|e| matches!(e, SocketEvent::StreamInquiry(_)))
            .count();
        assert_eq!(inquiries, 1);
    }

    #[tokio::test]
    async fn test_leave_during_acquisition_discards_late_media() {
        let rig = rig();
        rig.engine.set_acquire_delay(Duration::from_millis(30));
        rig.handle.start_media(true);
        rig.handle.leave_call();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let snapshot = rig.handle.snapshot().await.unwrap();
        assert!(!snapshot.streaming);
        assert_eq!(snapshot.control, ControlState::Start);
        assert_eq!(rig.engine.stopped_tracks().len(), 2);
        assert_eq!(
            rig.sink.take(),
            vec![SocketEvent::StopStream(CallTarget::everyone())]
        );
    }

    fn remote_answer(sdp: &str) -> SocketEvent {
        SocketEvent::Signal(SignalEnvelope::description("me", SessionDescription::answer(sdp)))
    }

    fn answers(sent: &[SocketEvent]) -> usize {
        sent.iter()
            .filter(|e| matches!(e, SocketEvent::Signal(s) if s.sdp.as_ref().is_some_and(|d| !d.is_offer())))
            .count()
    }

    fn candidates(sent: &[SocketEvent]) -> usize {
        sent.iter()
            .filter(|e| matches!(e, SocketEvent::Signal(s) if s.ice.is_some()))
            .count()
    }

    /// Invite `remote`, then start media so an offer to it is outstanding.
    async fn offer_outstanding(rig: &Rig, remote: &str) {
        rig.inbound
            .send(message(remote, SocketEvent::StreamInquiry(CallTarget::everyone())))
            .unwrap();
        settle(rig).await;
        rig.handle.start_media(false);
        settle(rig).await;
        assert_eq!(
            rig.engine.peer(remote).unwrap().signaling_state(),
            SignalingState::HaveLocalOffer
        );
        rig.sink.take();
    }

    #[tokio::test]
    async fn test_crossing_offer_from_higher_id_is_answered() {
        let rig = rig();
        offer_outstanding(&rig, "peer").await;

        rig.inbound
            .send(message("peer", remote_offer("v=0\r\na=track:peer-audio-1 audio\r\n")))
            .unwrap();
        let snapshot = settle(&rig).await;

        let sent = rig.sink.take();
        assert_eq!(answers(&sent), 1);
        // Only candidates for the answer; the withdrawn offer's are gone.
        assert_eq!(candidates(&sent), 2);
        let link = snapshot.link("peer").unwrap();
        assert_eq!(link.phase, LinkPhase::Stable);
        assert_eq!(link.queued, 0);
        assert!(link.has_remote_media);
        let peer = rig.engine.peer("peer").unwrap();
        assert_eq!(peer.signaling_state(), SignalingState::Stable);
        assert!(peer.descriptions().is_settled());
    }

    #[tokio::test]
    async fn test_crossing_offer_from_lower_id_keeps_ours() {
        let rig = rig();
        offer_outstanding(&rig, "ada").await;

        rig.inbound
            .send(message("ada", remote_offer("v=0\r\na=track:ada-audio-1 audio\r\n")))
            .unwrap();
        let snapshot = settle(&rig).await;
        assert!(rig.sink.take().is_empty());
        assert_eq!(snapshot.link("ada").unwrap().phase, LinkPhase::Negotiating);
        assert_eq!(snapshot.link("ada").unwrap().queued, 2);

        // Ada yields and answers ours.
        rig.inbound
            .send(message("ada", remote_answer("v=0\r\na=track:ada-audio-1 audio\r\n")))
            .unwrap();
        let snapshot = settle(&rig).await;
        assert_eq!(snapshot.link("ada").unwrap().phase, LinkPhase::Stable);
        assert_eq!(candidates(&rig.sink.take()), 2);
        assert!(rig.engine.peer("ada").unwrap().descriptions().is_settled());
    }

    #[tokio::test]
    async fn test_stray_answer_leaves_stable_link_settled() {
        let rig = rig();
        rig.inbound
            .send(message("peer", remote_offer("v=0\r\na=track:peer-audio-1 audio\r\n")))
            .unwrap();
        settle(&rig).await;
        rig.sink.take();
        let peer = rig.engine.peer("peer").unwrap();
        let before = peer.descriptions();
        assert!(before.is_settled());

        rig.inbound
            .send(message("peer", remote_answer("v=0\r\n")))
            .unwrap();
        let snapshot = settle(&rig).await;
        assert_eq!(peer.descriptions(), before);
        assert_eq!(snapshot.link("peer").unwrap().phase, LinkPhase::Stable);
        assert!(rig.sink.take().is_empty());

        // Remote candidates still apply.
        rig.inbound
            .send(message(
                "peer",
                SocketEvent::Signal(SignalEnvelope::candidate("me", IceCandidate::new("candidate:1"))),
            ))
            .unwrap();
        settle(&rig).await;
        assert_eq!(peer.applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn test_answer_from_unknown_sender_creates_no_link() {
        let rig = rig();
        rig.inbound
            .send(message("peer", remote_answer("v=0\r\n")))
            .unwrap();
        assert!(settle(&rig).await.links.is_empty());
        assert!(rig.engine.peer("peer").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_stays_pending_through_slow_prompt() {
        let rig = rig();
        rig.engine.set_acquire_delay(Duration::from_secs(20));
        rig.handle.start_media(true);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let waiting = rig.handle.snapshot().await.unwrap();
        assert_eq!(waiting.control, ControlState::Pending);
        assert!(!waiting.streaming);

        tokio::time::sleep(Duration::from_secs(20)).await;
        let live = rig.handle.snapshot().await.unwrap();
        assert_eq!(live.control, ControlState::Stop);
        assert!(live.streaming);
    }

    #[tokio::test]
    async fn test_leave_call_stops_tracks_and_keeps_links() {
        let rig = rig();
        rig.handle.start_media(false);
        settle(&rig).await;
        rig.inbound
            .send(message("peer", SocketEvent::StartStream(CallTarget::to("me"))))
            .unwrap();
        settle(&rig).await;
        rig.sink.take();

        rig.handle.leave_call();
        let snapshot = settle(&rig).await;
        assert!(!snapshot.streaming);
        assert_eq!(snapshot.links.len(), 1);
        assert_eq!(rig.engine.stopped_tracks().len(), 1);
        assert!(rig.engine.peer("peer").unwrap().tracks().is_empty());
        assert_eq!(
            rig.sink.take(),
            vec![SocketEvent::StopStream(CallTarget::everyone())]
        );
    }

    #[tokio::test]
    async fn test_ping_once_when_roster_has_company() {
        let rig = rig();
        let mut roster = Roster::new();
        roster.merge([Participant::new("s1", "Ada").with_cid("me")]);

        rig.inbound.send(SessionEvent::Subscribed).unwrap();
        rig.inbound.send(SessionEvent::RosterUpdated(roster.clone())).unwrap();
        roster.merge([Participant::new("s2", "Bo").with_cid("peer")]);
        rig.inbound.send(SessionEvent::RosterUpdated(roster.clone())).unwrap();
        rig.inbound.send(SessionEvent::RosterUpdated(roster)).unwrap();
        settle(&rig).await;

        assert_eq!(
            rig.sink.take(),
            vec![SocketEvent::PingChannel(CallTarget::everyone())]
        );
    }

    #[tokio::test]
    async fn test_teardown_closes_links_and_ignores_later_frames() {
        let rig = rig();
        rig.inbound
            .send(message("peer", remote_offer("v=0\r\n")))
            .unwrap();
        settle(&rig).await;
        let peer = rig.engine.peer("peer").unwrap();

        drop(rig.inbound);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let snapshot = rig.handle.snapshot().await.unwrap();
        assert!(snapshot.links.is_empty());
        assert_eq!(peer.signaling_state(), SignalingState::Closed);

        rig.handle.start_media(false);
        assert!(!rig.handle.snapshot().await.unwrap().streaming);

        rig.handle.teardown();
        rig.task.await.unwrap();
    }
}
