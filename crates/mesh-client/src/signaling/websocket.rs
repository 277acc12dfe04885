use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use mesh_protocol::{ClientMessage, ServerMessage, SignalEnvelope, SignalKind};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn, Instrument, Span};
use url::Url;
use uuid::Uuid;

use super::{Signaling, SignalingEvent, SignalingEvents, SignalingState};
use crate::config::ClientConfig;
use crate::error::SignalingError;

type ReadySender = oneshot::Sender<Result<String, SignalingError>>;

/// Relay connection over a websocket at `<relay_url>?id=<identity>`.
pub struct WebSocketSignaling {
    inner: Arc<Inner>,
}

struct Inner {
    relay_url: String,
    requested_id: String,
    heartbeat: Duration,
    assigned_id: Mutex<Option<String>>,
    state: watch::Sender<SignalingState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: Mutex<Option<SignalingEvents>>,
    tasks: Mutex<Option<ConnectionTasks>>,
    generation: AtomicU64,
    span: Span,
}

struct ConnectionTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl WebSocketSignaling {
    pub fn new(
        relay_url: impl Into<String>,
        peer_id: Option<String>,
        heartbeat: Duration,
        parent: &Span,
    ) -> Self {
        let requested_id = peer_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = tracing::debug_span!(
            target: "mesh::signaling",
            parent: parent,
            "signaling",
            id = %requested_id
        );
        let (state, _) = watch::channel(SignalingState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                relay_url: relay_url.into(),
                requested_id,
                heartbeat,
                assigned_id: Mutex::new(None),
                state,
                outbound: Mutex::new(None),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                tasks: Mutex::new(None),
                generation: AtomicU64::new(0),
                span,
            }),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.relay_url.clone(),
            config.peer_id.clone(),
            config.heartbeat_interval,
            &config.span,
        )
    }

    fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        if self.state() != SignalingState::Ready {
            return Err(SignalingError::NotReady);
        }
        let outbound = self.inner.outbound.lock();
        let sender = outbound.as_ref().ok_or(SignalingError::NotReady)?;
        sender.send(message).map_err(|_| SignalingError::NotReady)
    }
}

#[async_trait]
impl Signaling for WebSocketSignaling {
    fn id(&self) -> String {
        self.inner
            .assigned_id
            .lock()
            .clone()
            .unwrap_or_else(|| self.inner.requested_id.clone())
    }

    fn state(&self) -> SignalingState {
        *self.inner.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<SignalingState> {
        self.inner.state.subscribe()
    }

    async fn connect(&self) -> Result<String, SignalingError> {
        let inner = &self.inner;
        let mut previous = SignalingState::Disconnected;
        inner.state.send_if_modified(|state| {
            previous = *state;
            if *state == SignalingState::Disconnected {
                *state = SignalingState::Connecting;
                true
            } else {
                false
            }
        });
        match previous {
            SignalingState::Disconnected => {}
            SignalingState::Ready => return Ok(self.id()),
            SignalingState::Connecting | SignalingState::Connected => {
                return Err(SignalingError::NotReady)
            }
        }

        let url = match websocket_url(&inner.relay_url, &inner.requested_id) {
            Ok(url) => url,
            Err(err) => {
                inner.set_state(SignalingState::Disconnected);
                return Err(err);
            }
        };
        let (stream, _) = match connect_async(url.as_str()).await {
            Ok(pair) => pair,
            Err(err) => {
                inner.set_state(SignalingState::Disconnected);
                return Err(SignalingError::Network(format!(
                    "websocket connect failed: {err}"
                )));
            }
        };
        debug!(target: "mesh::signaling", parent: &inner.span, %url, "relay websocket connected");
        inner.set_state(SignalingState::Connected);

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut ws_write, mut ws_read) = stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (ready_tx, ready_rx) = oneshot::channel();

        // The slots stay locked until the handles are stored, so a reader that
        // ends early tears down this connection and not a half-installed one.
        {
            let mut outbound_slot = inner.outbound.lock();
            let mut tasks_slot = inner.tasks.lock();

            let writer = tokio::spawn(
                async move {
                    while let Some(message) = send_rx.recv().await {
                        let text = match message.to_text() {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(target: "mesh::signaling", error = %err, "dropping unencodable message");
                                continue;
                            }
                        };
                        trace!(target: "mesh::signaling", len = text.len(), "ws out");
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_write.close().await;
                }
                .instrument(inner.span.clone()),
            );

            let reader_inner = Arc::clone(inner);
            let reader = tokio::spawn(
                async move {
                    let mut ready = Some(ready_tx);
                    while let Some(frame) = ws_read.next().await {
                        match frame {
                            Ok(Message::Text(text)) => {
                                trace!(target: "mesh::signaling", len = text.len(), "ws in");
                                match ServerMessage::from_text(&text) {
                                    Ok(message) => reader_inner.handle(message, &mut ready),
                                    Err(err) => {
                                        warn!(target: "mesh::signaling", error = %err, "undecodable relay message")
                                    }
                                }
                            }
                            Ok(Message::Close(_)) => break,
                            Ok(_) => {}
                            Err(err) => {
                                match &err {
                                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                                        debug!(target: "mesh::signaling", "relay websocket closed: {err}")
                                    }
                                    _ => warn!(target: "mesh::signaling", "relay websocket error: {err}"),
                                }
                                break;
                            }
                        }
                    }
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(SignalingError::Network(
                            "relay closed the connection before confirming the identity".into(),
                        )));
                    }
                    reader_inner.drop_connection(generation);
                }
                .instrument(inner.span.clone()),
            );

            let heartbeat_tx = send_tx.clone();
            let period = inner.heartbeat;
            let heartbeat = tokio::spawn(
                async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                            break;
                        }
                    }
                }
                .instrument(inner.span.clone()),
            );

            *outbound_slot = Some(send_tx);
            *tasks_slot = Some(ConnectionTasks {
                reader,
                writer,
                heartbeat,
            });
        }

        let outcome = ready_rx.await.unwrap_or_else(|_| {
            Err(SignalingError::Network(
                "relay connection dropped during handshake".into(),
            ))
        });
        match outcome {
            Ok(peer_id) => {
                debug!(target: "mesh::signaling", parent: &inner.span, %peer_id, "identity confirmed");
                Ok(peer_id)
            }
            Err(err) => {
                warn!(target: "mesh::signaling", parent: &inner.span, error = %err, "relay refused connection");
                inner.drop_connection(generation);
                Err(err)
            }
        }
    }

    async fn disconnect(&self) {
        if self.state() == SignalingState::Disconnected {
            return;
        }
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner.drop_connection(generation);
    }

    fn signal(&self, kind: SignalKind, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        self.send(ClientMessage::routed(kind, envelope))
    }

    fn join(&self, room_id: &str, metadata: Option<String>) -> Result<(), SignalingError> {
        self.send(ClientMessage::RoomJoin {
            room_id: room_id.to_string(),
            metadata,
        })
    }

    fn leave(&self, room_id: &str) -> Result<(), SignalingError> {
        self.send(ClientMessage::RoomLeave {
            room_id: room_id.to_string(),
        })
    }

    fn take_events(&self) -> Result<SignalingEvents, SignalingError> {
        self.inner
            .events_rx
            .lock()
            .take()
            .ok_or(SignalingError::EventsTaken)
    }
}

impl Drop for WebSocketSignaling {
    fn drop(&mut self) {
        if let Some(tasks) = self.inner.tasks.lock().take() {
            tasks.reader.abort();
            tasks.writer.abort();
            tasks.heartbeat.abort();
        }
    }
}

impl Inner {
    fn set_state(&self, state: SignalingState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: SignalingEvent) {
        let _ = self.events_tx.send(event);
    }

    fn handle(&self, message: ServerMessage, ready: &mut Option<ReadySender>) {
        match message {
            ServerMessage::IdentityOpen { peer_id } => {
                *self.assigned_id.lock() = Some(peer_id.clone());
                self.set_state(SignalingState::Ready);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(peer_id.clone()));
                }
                self.emit(SignalingEvent::Connected { peer_id });
            }
            ServerMessage::Error {
                code,
                message,
                session_id,
            } => {
                let error = SignalingError::Routing { code, message };
                if code.is_fatal() {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(error.clone()));
                    }
                }
                self.emit(SignalingEvent::Error { error, session_id });
            }
            ServerMessage::OpenSession(envelope) => self.route(SignalKind::OpenSession, envelope),
            ServerMessage::Signal(envelope) => self.route(SignalKind::Signal, envelope),
            ServerMessage::RoomJoin {
                room_id,
                peer_id,
                metadata,
            } => self.emit(SignalingEvent::Join {
                room_id,
                peer_id,
                metadata,
            }),
            ServerMessage::RoomLeave { room_id, peer_id } => {
                self.emit(SignalingEvent::Leave { room_id, peer_id })
            }
            ServerMessage::Pong => trace!(target: "mesh::signaling", "pong"),
        }
    }

    fn route(&self, kind: SignalKind, envelope: SignalEnvelope) {
        if envelope.source.is_none() {
            debug!(
                target: "mesh::signaling",
                session = %envelope.session_id,
                "dropping relayed signal without a source"
            );
            return;
        }
        self.emit(SignalingEvent::Signal { kind, envelope });
    }

    /// Tears down the connection identified by `generation`; later calls for
    /// the same generation are no-ops.
    fn drop_connection(&self, generation: u64) -> bool {
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.outbound.lock().take();
        if let Some(tasks) = self.tasks.lock().take() {
            // The writer drains what is queued and closes the socket itself.
            tasks.heartbeat.abort();
            tasks.reader.abort();
        }
        self.set_state(SignalingState::Disconnected);
        self.emit(SignalingEvent::Disconnected);
        debug!(target: "mesh::signaling", parent: &self.span, "relay connection dropped");
        true
    }
}

fn websocket_url(relay_url: &str, id: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| SignalingError::Network(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        other => {
            return Err(SignalingError::Network(format!(
                "unsupported relay url scheme {other}"
            )))
        }
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::Network("invalid websocket scheme".into()))?;
    }
    url.set_query(None);
    url.query_pairs_mut().append_pair("id", id);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_carries_identity() {
        let url = websocket_url("ws://127.0.0.1:9000/ws", "alice").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/ws?id=alice");
    }

    #[test]
    fn http_relay_urls_become_websocket_urls() {
        let url = websocket_url("https://relay.example.com/ws?stale=1", "bob").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/ws?id=bob");
    }

    #[test]
    fn unsupported_schemes_are_rejected() {
        assert!(matches!(
            websocket_url("ftp://relay/ws", "carol"),
            Err(SignalingError::Network(_))
        ));
    }

    #[test]
    fn sends_fail_before_ready() {
        let signaling = WebSocketSignaling::new(
            "ws://127.0.0.1:9/ws",
            Some("dave".into()),
            Duration::from_secs(30),
            &Span::none(),
        );
        assert_eq!(signaling.state(), SignalingState::Disconnected);
        assert_eq!(signaling.id(), "dave");
        assert_eq!(
            signaling.join("r1", None),
            Err(SignalingError::NotReady)
        );
        assert!(signaling.take_events().is_ok());
        assert_eq!(
            signaling.take_events().err(),
            Some(SignalingError::EventsTaken)
        );
    }
}
