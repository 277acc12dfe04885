//! One logical session with a remote identity.
//!
//! A [`Call`] owns a single negotiation engine and the session id both ends
//! use to route signals to it. Callers start their engine immediately; callees
//! queue everything that arrives until the application calls
//! [`Call::answer`]. Stream metadata travels in-band on the data channel as a
//! `stream-meta` control frame sent just before the stream is attached.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use mesh_peer::{
    DataFrame, MediaStream, MediaTrack, Peer, PeerConfig, PeerConnectionFactory, PeerError,
    PeerEvent, Role,
};
use mesh_protocol::{ControlMessage, Signal, SignalEnvelope, SignalKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn, Instrument, Span};
use uuid::Uuid;

use crate::error::MeshError;
use crate::router::SessionRouter;
use crate::signaling::Signaling;

const CALL_PREFIX: &str = "call:";
const ROOM_PREFIX: &str = "room:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

impl CallRole {
    pub fn as_str(self) -> &'static str {
        match self {
            CallRole::Caller => "caller",
            CallRole::Callee => "callee",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Open,
    Close,
    Error(MeshError),
    Data(DataFrame),
    Stream {
        stream: MediaStream,
        metadata: Option<String>,
    },
    RemoveStream {
        stream: MediaStream,
        metadata: Option<String>,
    },
    Track {
        track: MediaTrack,
        stream_id: String,
        metadata: Option<String>,
    },
    RemoveTrack {
        track: MediaTrack,
        stream_id: String,
        metadata: Option<String>,
    },
}

/// A [`CallEvent`] tagged with the session it came from, so one receiver can
/// serve many sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEnvelope {
    pub session_id: String,
    pub peer_id: String,
    pub event: CallEvent,
}

pub type CallEvents = mpsc::UnboundedReceiver<CallEnvelope>;

/// Everything a session needs from the client that created it.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) signaling: Arc<dyn Signaling>,
    pub(crate) factory: Arc<dyn PeerConnectionFactory>,
    pub(crate) peer_config: PeerConfig,
    pub(crate) router: SessionRouter,
    pub(crate) span: Span,
}

#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

struct CallInner {
    session_id: String,
    peer_id: String,
    role: CallRole,
    room_id: Option<String>,
    metadata: Option<String>,
    context: SessionContext,
    sink: mpsc::UnboundedSender<CallEnvelope>,
    state: Mutex<CallState>,
    span: Span,
}

#[derive(Default)]
struct CallState {
    engine: Option<Arc<Peer>>,
    pending: VecDeque<Signal>,
    stream_metadata: HashMap<String, Option<String>>,
    offered: bool,
    open: bool,
    closed: bool,
}

impl Call {
    /// Starts a session towards `target` with an initiator engine.
    pub(crate) fn outgoing(
        context: &SessionContext,
        target: &str,
        metadata: Option<String>,
        room_id: Option<String>,
        sink: mpsc::UnboundedSender<CallEnvelope>,
    ) -> Call {
        let prefix = if room_id.is_some() {
            ROOM_PREFIX
        } else {
            CALL_PREFIX
        };
        let session_id = format!("{prefix}{}", Uuid::new_v4().simple());
        let call = Call::build(
            context,
            session_id,
            target.to_string(),
            CallRole::Caller,
            room_id,
            metadata,
            sink,
        );
        context.router.register(&call);
        {
            let mut state = call.inner.state.lock();
            state.engine = Some(call.start_engine(Role::Initiator));
        }
        debug!(target: "mesh::call", parent: &call.inner.span, "session started");
        call
    }

    /// Adopts a session opened by `source`; the opening payload waits in the
    /// queue until [`Call::answer`].
    pub(crate) fn incoming(
        context: &SessionContext,
        source: String,
        envelope: SignalEnvelope,
        sink: mpsc::UnboundedSender<CallEnvelope>,
    ) -> Call {
        let SignalEnvelope {
            session_id,
            room_id,
            metadata,
            signal,
            ..
        } = envelope;
        let call = Call::build(
            context,
            session_id,
            source,
            CallRole::Callee,
            room_id,
            metadata,
            sink,
        );
        call.inner.state.lock().pending.push_back(signal);
        context.router.register(&call);
        debug!(target: "mesh::call", parent: &call.inner.span, "session offered");
        call
    }

    fn build(
        context: &SessionContext,
        session_id: String,
        peer_id: String,
        role: CallRole,
        room_id: Option<String>,
        metadata: Option<String>,
        sink: mpsc::UnboundedSender<CallEnvelope>,
    ) -> Call {
        let span = tracing::debug_span!(
            target: "mesh::call",
            parent: &context.span,
            "call",
            session = %session_id,
            peer = %peer_id,
            role = role.as_str()
        );
        Call {
            inner: Arc::new(CallInner {
                session_id,
                peer_id,
                role,
                room_id,
                metadata,
                context: context.clone(),
                sink,
                state: Mutex::new(CallState::default()),
                span,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// The remote identity.
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn role(&self) -> CallRole {
        self.inner.role
    }

    pub fn room_id(&self) -> Option<&str> {
        self.inner.room_id.as_deref()
    }

    /// Metadata attached when the session was opened. Callers see their own
    /// value; callees see the value the caller sent.
    pub fn metadata(&self) -> Option<&str> {
        self.inner.metadata.as_deref()
    }

    pub fn is_open(&self) -> bool {
        let state = self.inner.state.lock();
        state.open && !state.closed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn is_answered(&self) -> bool {
        self.inner.state.lock().engine.is_some()
    }

    /// Accepts an inbound session. Queued signals reach the new engine in
    /// arrival order before anything delivered afterwards.
    pub fn answer(&self) -> Result<(), MeshError> {
        if self.inner.role == CallRole::Caller {
            return Err(MeshError::InvalidRole(CallRole::Caller.as_str()));
        }
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(MeshError::Closed);
        }
        if state.engine.is_some() {
            return Ok(());
        }
        let engine = self.start_engine(Role::Responder);
        let queued = state.pending.len();
        for signal in state.pending.drain(..) {
            engine.signal(signal);
        }
        state.engine = Some(engine);
        debug!(target: "mesh::call", parent: &self.inner.span, queued, "session answered");
        Ok(())
    }

    pub async fn send(&self, data: impl Into<DataFrame>) -> Result<(), MeshError> {
        let engine = self.engine()?;
        engine.send(data).await.map_err(MeshError::from)
    }

    /// Announces `metadata` for the stream, then attaches it.
    pub async fn add_stream(
        &self,
        stream: &MediaStream,
        metadata: Option<String>,
    ) -> Result<(), MeshError> {
        let engine = self.engine()?;
        self.announce(&engine, &stream.id, metadata).await?;
        engine.add_stream(stream).await.map_err(MeshError::from)
    }

    pub async fn remove_stream(&self, stream: &MediaStream) -> Result<(), MeshError> {
        let engine = self.engine()?;
        engine.remove_stream(stream).await.map_err(MeshError::from)
    }

    /// Attaches one track. The remote side reports whatever metadata was last
    /// announced for `stream`.
    pub async fn add_track(&self, track: &MediaTrack, stream: &MediaStream) -> Result<(), MeshError> {
        let engine = self.engine()?;
        engine.add_track(track, stream).await.map_err(MeshError::from)
    }

    pub async fn remove_track(&self, track: &MediaTrack) -> Result<(), MeshError> {
        let engine = self.engine()?;
        engine.remove_track(track).await.map_err(MeshError::from)
    }

    /// Closes the engine, unregisters the session and emits `Close` once.
    pub fn close(&self) {
        let engine = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.open = false;
            state.pending.clear();
            state.stream_metadata.clear();
            state.engine.take()
        };
        self.inner.context.router.unregister(&self.inner.session_id);
        if let Some(engine) = engine {
            engine.close();
        }
        debug!(target: "mesh::call", parent: &self.inner.span, "session closed");
        self.dispatch(CallEvent::Close);
    }

    /// Delivers a relayed signal, queueing it until the engine exists.
    pub(crate) fn deliver(&self, signal: Signal) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.closed {
            trace!(target: "mesh::call", parent: &self.inner.span, kind = signal.label(), "signal after close dropped");
            return;
        }
        match state.engine.as_ref() {
            Some(engine) => engine.signal(signal),
            None => state.pending.push_back(signal),
        }
    }

    /// Surfaces `error` and ends the session.
    pub(crate) fn fail(&self, error: MeshError) {
        warn!(target: "mesh::call", parent: &self.inner.span, %error, "session failed");
        self.emit(CallEvent::Error(error));
        self.close();
    }

    fn engine(&self) -> Result<Arc<Peer>, MeshError> {
        let state = self.inner.state.lock();
        if state.closed {
            return Err(MeshError::Closed);
        }
        state
            .engine
            .clone()
            .ok_or(MeshError::NotReady("session has not been answered"))
    }

    fn start_engine(&self, role: Role) -> Arc<Peer> {
        let (peer, events) = Peer::new(
            role,
            Arc::clone(&self.inner.context.factory),
            self.inner.context.peer_config.clone(),
            &self.inner.span,
        );
        tokio::spawn(pump(Arc::downgrade(&self.inner), events).instrument(self.inner.span.clone()));
        Arc::new(peer)
    }

    async fn announce(
        &self,
        engine: &Peer,
        stream_id: &str,
        metadata: Option<String>,
    ) -> Result<(), MeshError> {
        if !self.inner.context.peer_config.ordered {
            return Err(MeshError::UnorderedChannel);
        }
        let control = ControlMessage::StreamMeta {
            stream_id: stream_id.to_string(),
            metadata,
        };
        let text = control
            .to_text()
            .map_err(|err| MeshError::Protocol(err.to_string()))?;
        engine.send(text).await.map_err(|err| match err {
            PeerError::NotReady => MeshError::NotReady("data channel is not open"),
            other => MeshError::Peer(other),
        })
    }

    /// Returns false once the engine has closed.
    fn on_engine_event(&self, event: PeerEvent) -> bool {
        match event {
            PeerEvent::Signal(signal) => self.route(signal),
            PeerEvent::Connect => {
                self.inner.state.lock().open = true;
                debug!(target: "mesh::call", parent: &self.inner.span, "session open");
                self.emit(CallEvent::Open);
            }
            PeerEvent::Data(frame) => {
                match frame.as_text().and_then(ControlMessage::parse) {
                    Some(ControlMessage::StreamMeta {
                        stream_id,
                        metadata,
                    }) => {
                        trace!(target: "mesh::call", parent: &self.inner.span, stream = %stream_id, "stream metadata");
                        self.inner
                            .state
                            .lock()
                            .stream_metadata
                            .insert(stream_id, metadata);
                    }
                    None => self.emit(CallEvent::Data(frame)),
                }
            }
            PeerEvent::Stream(stream) => {
                let metadata = self.stream_metadata(&stream.id);
                self.emit(CallEvent::Stream { stream, metadata });
            }
            PeerEvent::RemoveStream(stream) => {
                let metadata = self
                    .inner
                    .state
                    .lock()
                    .stream_metadata
                    .remove(&stream.id)
                    .flatten();
                self.emit(CallEvent::RemoveStream { stream, metadata });
            }
            PeerEvent::Track { track, stream_id } => {
                let metadata = self.stream_metadata(&stream_id);
                self.emit(CallEvent::Track {
                    track,
                    stream_id,
                    metadata,
                });
            }
            PeerEvent::RemoveTrack { track, stream_id } => {
                let metadata = self.stream_metadata(&stream_id);
                self.emit(CallEvent::RemoveTrack {
                    track,
                    stream_id,
                    metadata,
                });
            }
            PeerEvent::Error(err) => {
                warn!(target: "mesh::call", parent: &self.inner.span, error = %err, "engine error");
                self.emit(CallEvent::Error(err.into()));
            }
            PeerEvent::Close => {
                self.close();
                return false;
            }
        }
        true
    }

    fn stream_metadata(&self, stream_id: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .stream_metadata
            .get(stream_id)
            .cloned()
            .flatten()
    }

    /// The caller's first offer opens the session at the relay; everything
    /// else is a plain signal. A session whose opening offer cannot be sent
    /// fails, since nothing would ever reach the remote.
    fn route(&self, signal: Signal) {
        let kind = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            if self.inner.role == CallRole::Caller && !state.offered && signal.is_offer() {
                state.offered = true;
                SignalKind::OpenSession
            } else {
                SignalKind::Signal
            }
        };
        let envelope = SignalEnvelope {
            target: self.inner.peer_id.clone(),
            source: None,
            session_id: self.inner.session_id.clone(),
            room_id: self.inner.room_id.clone(),
            metadata: match kind {
                SignalKind::OpenSession => self.inner.metadata.clone(),
                SignalKind::Signal => None,
            },
            signal,
        };
        trace!(target: "mesh::call", parent: &self.inner.span, kind = ?kind, "routing signal");
        if let Err(err) = self.inner.context.signaling.signal(kind, envelope) {
            match kind {
                SignalKind::OpenSession => self.fail(err.into()),
                SignalKind::Signal => {
                    warn!(target: "mesh::call", parent: &self.inner.span, error = %err, "failed to route signal");
                    self.emit(CallEvent::Error(err.into()));
                }
            }
        }
    }

    fn emit(&self, event: CallEvent) {
        if self.inner.state.lock().closed {
            return;
        }
        self.dispatch(event);
    }

    fn dispatch(&self, event: CallEvent) {
        let _ = self.inner.sink.send(CallEnvelope {
            session_id: self.inner.session_id.clone(),
            peer_id: self.inner.peer_id.clone(),
            event,
        });
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("session_id", &self.inner.session_id)
            .field("peer_id", &self.inner.peer_id)
            .field("role", &self.inner.role)
            .field("room_id", &self.inner.room_id)
            .finish()
    }
}

async fn pump(call: Weak<CallInner>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = call.upgrade() else {
            break;
        };
        if !(Call { inner }).on_engine_event(event) {
            break;
        }
    }
}
