//! Perfect-negotiation engine.
//!
//! Each [`Peer`] runs one task that owns the peer-connection and consumes two
//! queues: commands from the handle and events from the platform. Everything
//! that touches the negotiation flags happens on that task, one message at a
//! time. The responder is the polite side: it rolls back its own offer when a
//! remote one collides with it. The initiator ignores colliding offers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mesh_protocol::{SessionDescription, Signal};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, Span};

use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::media::{DataFrame, MediaStream, MediaTrack};
use crate::platform::{
    ConnectionState, IceConnectionState, PeerConnection, PeerConnectionFactory, PlatformEvent,
    SignalingState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn is_polite(self) -> bool {
        matches!(self, Role::Responder)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    New,
    Negotiating,
    Stable,
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Payload to relay to the remote engine.
    Signal(Signal),
    /// The data channel opened.
    Connect,
    Data(DataFrame),
    Stream(MediaStream),
    RemoveStream(MediaStream),
    Track { track: MediaTrack, stream_id: String },
    RemoveTrack { track: MediaTrack, stream_id: String },
    Error(PeerError),
    /// Terminal. Emitted exactly once.
    Close,
}

type Reply = oneshot::Sender<Result<(), PeerError>>;

enum Command {
    Signal(Signal),
    Send(DataFrame, Reply),
    AddTrack {
        track: MediaTrack,
        stream_id: String,
        reply: Reply,
    },
    RemoveTrack {
        track_id: String,
        reply: Reply,
    },
    Close,
}

struct Shared {
    closed: AtomicBool,
    connected: AtomicBool,
    phase: Mutex<NegotiationPhase>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn set_phase(&self, phase: NegotiationPhase) {
        let mut current = self.phase.lock();
        if *current != NegotiationPhase::Closed {
            *current = phase;
        }
    }
}

/// Handle to a running engine. Dropping it closes the engine.
pub struct Peer {
    role: Role,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl Peer {
    /// Spawns the engine task. Must be called inside a tokio runtime.
    ///
    /// The initiator creates the data channel as soon as its connection
    /// exists, which starts the first negotiation.
    pub fn new(
        role: Role,
        factory: Arc<dyn PeerConnectionFactory>,
        config: PeerConfig,
        parent: &Span,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            phase: Mutex::new(NegotiationPhase::New),
        });
        let span = tracing::debug_span!(target: "mesh::peer", parent: parent, "peer", role = role.as_str());
        tokio::spawn(
            run(
                role,
                factory,
                config,
                Arc::clone(&shared),
                events,
                command_rx,
            )
            .instrument(span),
        );
        (
            Self {
                role,
                commands,
                shared,
            },
            event_rx,
        )
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> NegotiationPhase {
        *self.shared.phase.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Queues one inbound negotiation payload. Ignored once closed.
    pub fn signal(&self, signal: Signal) {
        if self.is_closed() {
            tracing::trace!(target: "mesh::peer", kind = signal.label(), "signal after close dropped");
            return;
        }
        let _ = self.commands.send(Command::Signal(signal));
    }

    pub async fn send(&self, frame: impl Into<DataFrame>) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        if !self.is_connected() {
            return Err(PeerError::NotReady);
        }
        let frame = frame.into();
        self.request(|reply| Command::Send(frame, reply)).await
    }

    pub async fn add_stream(&self, stream: &MediaStream) -> Result<(), PeerError> {
        for track in &stream.tracks {
            self.add_track(track, stream).await?;
        }
        Ok(())
    }

    pub async fn remove_stream(&self, stream: &MediaStream) -> Result<(), PeerError> {
        for track in &stream.tracks {
            self.remove_track(track).await?;
        }
        Ok(())
    }

    pub async fn add_track(&self, track: &MediaTrack, stream: &MediaStream) -> Result<(), PeerError> {
        let track = track.clone();
        let stream_id = stream.id.clone();
        self.request(|reply| Command::AddTrack {
            track,
            stream_id,
            reply,
        })
        .await
    }

    pub async fn remove_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let track_id = track.id.clone();
        self.request(|reply| Command::RemoveTrack { track_id, reply })
            .await
    }

    /// Tears the engine down. Idempotent; a single [`PeerEvent::Close`] follows.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.connected.store(false, Ordering::Release);
        self.shared.set_phase(NegotiationPhase::Closed);
        let _ = self.commands.send(Command::Close);
    }

    async fn request(&self, build: impl FnOnce(Reply) -> Command) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| PeerError::Closed)?;
        response.await.unwrap_or(Err(PeerError::Closed))
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Stop,
}

async fn run(
    role: Role,
    factory: Arc<dyn PeerConnectionFactory>,
    config: PeerConfig,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<PeerEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let (pc, mut platform) = match factory.create(&config).await {
        Ok(created) => created,
        Err(err) => {
            tracing::warn!(target: "mesh::peer", error = %err, "failed to create peer connection");
            if !shared.closed.swap(true, Ordering::AcqRel) {
                let _ = events.send(PeerEvent::Error(err));
            }
            shared.set_phase(NegotiationPhase::Closed);
            let _ = events.send(PeerEvent::Close);
            return;
        }
    };

    let mut negotiator = Negotiator {
        role,
        config,
        shared,
        events,
        pc,
        pending_offer: false,
        ignoring_remote_offer: false,
        ice_restarts: 0,
        remote_streams: HashMap::new(),
    };

    if role == Role::Initiator && !negotiator.shared.is_closed() {
        let label = negotiator.config.channel_label.clone();
        let ordered = negotiator.config.ordered;
        if let Err(err) = negotiator.pc.create_data_channel(&label, ordered).await {
            negotiator.fail(err);
            negotiator.teardown().await;
            return;
        }
        tracing::debug!(target: "mesh::peer", %label, "data channel created");
    }

    while !negotiator.shared.is_closed() {
        let step = tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Close) | None => Step::Stop,
                Some(command) => negotiator.handle_command(command).await,
            },
            event = platform.recv() => match event {
                Some(event) => negotiator.handle_platform(event).await,
                None => {
                    tracing::debug!(target: "mesh::peer", "platform event stream ended");
                    Step::Stop
                }
            },
        };
        if step == Step::Stop {
            break;
        }
    }
    negotiator.teardown().await;
}

struct Negotiator {
    role: Role,
    config: PeerConfig,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<PeerEvent>,
    pc: Arc<dyn PeerConnection>,
    pending_offer: bool,
    ignoring_remote_offer: bool,
    ice_restarts: u32,
    /// Remote stream id to the tracks seen on it.
    remote_streams: HashMap<String, Vec<MediaTrack>>,
}

impl Negotiator {
    /// Drops everything except the final close once the engine is closed, so
    /// results of operations that finish after close never reach the caller.
    fn emit(&self, event: PeerEvent) {
        if self.shared.is_closed() {
            tracing::trace!(target: "mesh::peer", ?event, "event after close dropped");
            return;
        }
        let _ = self.events.send(event);
    }

    fn fail(&self, err: PeerError) -> Step {
        tracing::warn!(target: "mesh::peer", error = %err, "negotiation failed");
        self.emit(PeerEvent::Error(err));
        Step::Stop
    }

    fn settle_phase(&self) {
        if self.pc.signaling_state() == SignalingState::Stable {
            let connected = self.shared.connected.load(Ordering::Acquire);
            self.shared.set_phase(if connected {
                NegotiationPhase::Connected
            } else {
                NegotiationPhase::Stable
            });
        }
    }

    async fn handle_command(&mut self, command: Command) -> Step {
        match command {
            Command::Signal(Signal::Candidate(candidate)) => {
                if let Err(err) = self.pc.add_ice_candidate(candidate).await {
                    if self.ignoring_remote_offer {
                        tracing::debug!(target: "mesh::peer", error = %err, "candidate for ignored offer dropped");
                    } else {
                        tracing::warn!(target: "mesh::peer", error = %err, "failed to add remote candidate");
                        self.emit(PeerEvent::Error(err));
                    }
                }
                Step::Continue
            }
            Command::Signal(Signal::Sdp(desc)) => self.handle_description(desc).await,
            Command::Send(frame, reply) => {
                let result = if self.shared.connected.load(Ordering::Acquire) {
                    self.pc.send(frame).await
                } else {
                    Err(PeerError::NotReady)
                };
                let _ = reply.send(result);
                Step::Continue
            }
            Command::AddTrack {
                track,
                stream_id,
                reply,
            } => {
                tracing::debug!(target: "mesh::peer", track = %track.id, stream = %stream_id, "adding track");
                let _ = reply.send(self.pc.add_track(&track, &stream_id).await);
                Step::Continue
            }
            Command::RemoveTrack { track_id, reply } => {
                tracing::debug!(target: "mesh::peer", track = %track_id, "removing track");
                let _ = reply.send(self.pc.remove_track(&track_id).await);
                Step::Continue
            }
            Command::Close => Step::Stop,
        }
    }

    async fn handle_description(&mut self, desc: SessionDescription) -> Step {
        let is_offer = desc.is_offer();
        let offer_collision = is_offer
            && (self.pending_offer || self.pc.signaling_state() != SignalingState::Stable);
        self.ignoring_remote_offer = !self.role.is_polite() && offer_collision;
        if self.ignoring_remote_offer {
            tracing::debug!(target: "mesh::peer", "colliding remote offer ignored");
            return Step::Continue;
        }

        if offer_collision {
            tracing::debug!(target: "mesh::peer", "colliding remote offer accepted, rolling back");
            if let Err(err) = self.pc.rollback().await {
                return self.fail(err);
            }
            self.pending_offer = false;
        }

        if is_offer {
            self.shared.set_phase(NegotiationPhase::Negotiating);
        }
        tracing::trace!(target: "mesh::peer", kind = desc.kind.as_str(), op = "set_remote_description", state = "start");
        if let Err(err) = self.pc.set_remote_description(desc).await {
            return self.fail(err);
        }
        if self.shared.is_closed() {
            return Step::Stop;
        }

        if is_offer {
            match self.pc.set_local_description().await {
                Ok(answer) => {
                    if self.shared.is_closed() {
                        return Step::Stop;
                    }
                    self.emit(PeerEvent::Signal(Signal::Sdp(answer)));
                }
                Err(err) => return self.fail(err),
            }
        }
        self.settle_phase();
        Step::Continue
    }

    async fn negotiate(&mut self) -> Step {
        if self.pc.signaling_state() != SignalingState::Stable {
            tracing::debug!(target: "mesh::peer", "negotiation deferred until stable");
            return Step::Continue;
        }
        self.pending_offer = true;
        self.shared.set_phase(NegotiationPhase::Negotiating);
        tracing::trace!(target: "mesh::peer", op = "set_local_description", state = "start");
        let result = self.pc.set_local_description().await;
        self.pending_offer = false;
        if self.shared.is_closed() {
            return Step::Stop;
        }
        match result {
            Ok(offer) => {
                self.emit(PeerEvent::Signal(Signal::Sdp(offer)));
                Step::Continue
            }
            Err(err) => self.fail(err),
        }
    }

    async fn restart_ice(&mut self) -> Step {
        if self.ice_restarts >= self.config.max_ice_restarts {
            return self.fail(PeerError::negotiation("ice connectivity failed"));
        }
        self.ice_restarts += 1;
        tracing::info!(target: "mesh::peer", attempt = self.ice_restarts, "restarting ice");
        match self.pc.restart_ice().await {
            Ok(()) => Step::Continue,
            Err(err) => self.fail(err),
        }
    }

    async fn handle_platform(&mut self, event: PlatformEvent) -> Step {
        match event {
            PlatformEvent::NegotiationNeeded => self.negotiate().await,
            PlatformEvent::IceCandidate(candidate) => {
                self.emit(PeerEvent::Signal(Signal::Candidate(candidate)));
                Step::Continue
            }
            PlatformEvent::IceConnectionState(state) => {
                tracing::trace!(target: "mesh::peer", ?state, "ice connection state");
                match state {
                    IceConnectionState::Failed => self.restart_ice().await,
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        self.ice_restarts = 0;
                        Step::Continue
                    }
                    _ => Step::Continue,
                }
            }
            PlatformEvent::ConnectionState(state) => {
                tracing::debug!(target: "mesh::peer", ?state, "connection state");
                match state {
                    ConnectionState::Disconnected | ConnectionState::Closed => Step::Stop,
                    ConnectionState::Failed if self.ice_restarts >= self.config.max_ice_restarts => {
                        self.fail(PeerError::negotiation("connection failed"))
                    }
                    _ => Step::Continue,
                }
            }
            PlatformEvent::DataChannel { label } => {
                tracing::debug!(target: "mesh::peer", %label, "remote data channel adopted");
                Step::Continue
            }
            PlatformEvent::DataChannelOpen => {
                if !self.shared.connected.swap(true, Ordering::AcqRel) {
                    self.settle_phase();
                    self.emit(PeerEvent::Connect);
                }
                Step::Continue
            }
            PlatformEvent::DataChannelMessage(frame) => {
                tracing::trace!(target: "mesh::peer", len = frame.len(), "data frame");
                self.emit(PeerEvent::Data(frame));
                Step::Continue
            }
            PlatformEvent::DataChannelClosed => {
                tracing::debug!(target: "mesh::peer", "data channel closed");
                Step::Stop
            }
            PlatformEvent::DataChannelError(message) => {
                self.emit(PeerEvent::Error(PeerError::Platform(message)));
                Step::Continue
            }
            PlatformEvent::Track { track, stream_id } => {
                self.remote_track_added(track, stream_id);
                Step::Continue
            }
            PlatformEvent::TrackRemoved {
                track_id,
                stream_id,
            } => {
                self.remote_track_removed(&track_id, stream_id);
                Step::Continue
            }
        }
    }

    fn remote_track_added(&mut self, track: MediaTrack, stream_id: String) {
        let known_stream = self.remote_streams.contains_key(&stream_id);
        let tracks = self.remote_streams.entry(stream_id.clone()).or_default();
        if tracks.iter().any(|known| known.id == track.id) {
            return;
        }
        tracks.push(track.clone());
        let snapshot = tracks.clone();
        if !known_stream {
            self.emit(PeerEvent::Stream(MediaStream::new(stream_id.clone(), snapshot)));
        }
        self.emit(PeerEvent::Track { track, stream_id });
    }

    fn remote_track_removed(&mut self, track_id: &str, stream_id: String) {
        let Some(tracks) = self.remote_streams.get_mut(&stream_id) else {
            return;
        };
        let Some(position) = tracks.iter().position(|track| track.id == track_id) else {
            return;
        };
        let track = tracks.remove(position);
        let emptied = tracks.is_empty();
        self.emit(PeerEvent::RemoveTrack {
            track,
            stream_id: stream_id.clone(),
        });
        if emptied {
            self.remote_streams.remove(&stream_id);
            self.emit(PeerEvent::RemoveStream(MediaStream::new(stream_id, Vec::new())));
        }
    }

    async fn teardown(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.connected.store(false, Ordering::Release);
        self.shared.set_phase(NegotiationPhase::Closed);
        self.pc.close().await;
        tracing::debug!(target: "mesh::peer", "closed");
        let _ = self.events.send(PeerEvent::Close);
    }
}
