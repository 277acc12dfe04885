use std::sync::{Arc, Weak};
use std::time::Duration;

use mesh_peer::PeerConnectionFactory;
use mesh_protocol::SignalKind;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument, Span};

use crate::call::{Call, CallEvents, SessionContext};
use crate::config::ClientConfig;
use crate::error::MeshError;
use crate::room::{Room, RoomInput};
use crate::router::SessionRouter;
use crate::signaling::{
    Signaling, SignalingEvent, SignalingEvents, SignalingState, WebSocketSignaling,
};

#[derive(Debug)]
pub enum ClientEvent {
    /// The relay confirmed this identity.
    Open { peer_id: String },
    Disconnected,
    /// A relay error not tied to any live session.
    Error(MeshError),
    /// A remote peer opened a standalone session. Call [`Call::answer`] to
    /// accept it or [`Call::close`] to reject it.
    Call { call: Call, events: CallEvents },
}

/// Entry point: one relay identity plus the sessions and rooms opened under it.
pub struct MeshClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    context: SessionContext,
    ready_timeout: Duration,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientEvent>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl MeshClient {
    pub fn new(
        signaling: Arc<dyn Signaling>,
        factory: Arc<dyn PeerConnectionFactory>,
        config: &ClientConfig,
    ) -> Result<Self, MeshError> {
        let signaling_events = signaling.take_events()?;
        let span = tracing::info_span!(
            target: "mesh::client",
            parent: &config.span,
            "mesh_client",
            id = %signaling.id()
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            context: SessionContext {
                signaling,
                factory,
                peer_config: config.peer.clone(),
                router: SessionRouter::default(),
                span: span.clone(),
            },
            ready_timeout: config.ready_timeout,
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            dispatcher: Mutex::new(None),
            span: span.clone(),
        });
        let dispatcher = tokio::spawn(
            dispatch(Arc::downgrade(&inner), signaling_events).instrument(span),
        );
        *inner.dispatcher.lock() = Some(dispatcher);
        Ok(Self { inner })
    }

    /// Client signaling over the relay websocket named in `config`.
    pub fn websocket(
        config: &ClientConfig,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> Result<Self, MeshError> {
        let signaling = Arc::new(WebSocketSignaling::from_config(config));
        Self::new(signaling, factory, config)
    }

    /// Websocket signaling with webrtc-rs peer connections.
    #[cfg(feature = "webrtc")]
    pub fn webrtc(config: &ClientConfig) -> Result<Self, MeshError> {
        Self::websocket(config, Arc::new(mesh_peer::WebRtcFactory::new()))
    }

    pub fn id(&self) -> String {
        self.inner.context.signaling.id()
    }

    pub fn state(&self) -> SignalingState {
        self.inner.context.signaling.state()
    }

    /// Follows relay connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<SignalingState> {
        self.inner.context.signaling.watch_state()
    }

    /// Connects and waits for the relay to confirm the identity.
    pub async fn connect(&self) -> Result<String, MeshError> {
        let signaling = &self.inner.context.signaling;
        match tokio::time::timeout(self.inner.ready_timeout, signaling.connect()).await {
            Ok(Ok(peer_id)) => {
                info!(target: "mesh::client", parent: &self.inner.span, %peer_id, "connected to relay");
                Ok(peer_id)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                warn!(
                    target: "mesh::client",
                    parent: &self.inner.span,
                    timeout_ms = self.inner.ready_timeout.as_millis() as u64,
                    "relay did not confirm identity in time"
                );
                signaling.disconnect().await;
                Err(MeshError::NotReady("timed out waiting for the relay"))
            }
        }
    }

    /// Connects again after the relay connection dropped. Live sessions are
    /// unaffected.
    pub async fn reconnect(&self) -> Result<String, MeshError> {
        if self.state() != SignalingState::Disconnected {
            return Err(MeshError::NotReady("relay connection is still active"));
        }
        self.connect().await
    }

    pub async fn disconnect(&self) {
        self.inner.context.signaling.disconnect().await;
    }

    /// Opens a standalone session to `target`.
    pub fn call(
        &self,
        target: &str,
        metadata: Option<String>,
    ) -> Result<(Call, CallEvents), MeshError> {
        self.ensure_ready()?;
        let (sink, events) = mpsc::unbounded_channel();
        let call = Call::outgoing(&self.inner.context, target, metadata, None, sink);
        Ok((call, events))
    }

    pub fn join(&self, room_id: &str, metadata: Option<String>) -> Result<Room, MeshError> {
        self.ensure_ready()?;
        Room::join(&self.inner.context, room_id, metadata)
    }

    pub async fn recv(&self) -> Option<ClientEvent> {
        self.inner.events_rx.lock().await.recv().await
    }

    /// Closes every session, leaves every room and drops the relay connection.
    pub async fn close(&self) {
        let router = &self.inner.context.router;
        for room_id in router.room_ids() {
            if let Some(port) = router.room(&room_id) {
                port.room.leave();
            }
        }
        for call in router.sessions() {
            call.close();
        }
        self.inner.context.signaling.disconnect().await;
        debug!(target: "mesh::client", parent: &self.inner.span, "client closed");
    }

    fn ensure_ready(&self) -> Result<(), MeshError> {
        match self.state() {
            SignalingState::Ready => Ok(()),
            _ => Err(MeshError::NotReady("signaling")),
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
    }
}

async fn dispatch(client: Weak<ClientInner>, mut events: SignalingEvents) {
    while let Some(event) = events.recv().await {
        let Some(inner) = client.upgrade() else {
            break;
        };
        inner.handle(event);
    }
}

impl ClientInner {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }

    fn handle(&self, event: SignalingEvent) {
        let router = &self.context.router;
        match event {
            SignalingEvent::Connected { peer_id } => self.emit(ClientEvent::Open { peer_id }),
            SignalingEvent::Disconnected => self.emit(ClientEvent::Disconnected),
            SignalingEvent::Error { error, session_id } => {
                match session_id.as_deref().and_then(|id| router.session(id)) {
                    Some(call) => call.fail(error.into()),
                    None => self.emit(ClientEvent::Error(error.into())),
                }
            }
            SignalingEvent::Signal { kind, envelope } => {
                if let Some(call) = router.session(&envelope.session_id) {
                    call.deliver(envelope.signal);
                    return;
                }
                if kind != SignalKind::OpenSession {
                    trace!(
                        target: "mesh::client",
                        session = %envelope.session_id,
                        "signal for an unknown session dropped"
                    );
                    return;
                }
                let Some(source) = envelope.source.clone() else {
                    return;
                };
                match envelope.room_id.clone() {
                    Some(room_id) => match router.room(&room_id) {
                        Some(port) => {
                            let call =
                                Call::incoming(&self.context, source, envelope, port.sink.clone());
                            let _ = port.inputs.send(RoomInput::Incoming(call));
                        }
                        None => debug!(
                            target: "mesh::client",
                            room = %room_id,
                            peer = %source,
                            "session for a room not joined ignored"
                        ),
                    },
                    None => {
                        let (sink, events) = mpsc::unbounded_channel();
                        let call = Call::incoming(&self.context, source, envelope, sink);
                        debug!(
                            target: "mesh::client",
                            session = %call.session_id(),
                            peer = %call.peer_id(),
                            "incoming session"
                        );
                        self.emit(ClientEvent::Call { call, events });
                    }
                }
            }
            SignalingEvent::Join {
                room_id,
                peer_id,
                metadata,
            } => {
                if let Some(port) = router.room(&room_id) {
                    let _ = port.inputs.send(RoomInput::Join { peer_id, metadata });
                }
            }
            SignalingEvent::Leave { room_id, peer_id } => {
                if let Some(port) = router.room(&room_id) {
                    let _ = port.inputs.send(RoomInput::Leave { peer_id });
                }
            }
        }
    }
}
