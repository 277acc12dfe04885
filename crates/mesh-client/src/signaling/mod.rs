//! Relay-facing signaling contract.
//!
//! A [`Signaling`] implementation owns the connection to the relay and
//! reports everything it hears as [`SignalingEvent`]s on a single stream.
//! Sessions and rooms never talk to the relay directly; the client
//! dispatcher consumes the stream and routes by session id.

mod websocket;

#[cfg(test)]
pub(crate) mod recording;

use async_trait::async_trait;
use mesh_protocol::{SignalEnvelope, SignalKind};
use tokio::sync::{mpsc, watch};

use crate::error::SignalingError;

pub use websocket::WebSocketSignaling;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Disconnected,
    Connecting,
    /// Socket is up but the relay has not confirmed the identity yet.
    Connected,
    Ready,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Connected {
        peer_id: String,
    },
    Disconnected,
    Error {
        error: SignalingError,
        session_id: Option<String>,
    },
    Signal {
        kind: SignalKind,
        envelope: SignalEnvelope,
    },
    Join {
        room_id: String,
        peer_id: String,
        metadata: Option<String>,
    },
    Leave {
        room_id: String,
        peer_id: String,
    },
}

pub type SignalingEvents = mpsc::UnboundedReceiver<SignalingEvent>;

#[async_trait]
pub trait Signaling: Send + Sync {
    /// Identity confirmed by the relay, or the requested one before that.
    fn id(&self) -> String;

    fn state(&self) -> SignalingState;

    fn watch_state(&self) -> watch::Receiver<SignalingState>;

    /// Opens the relay connection and resolves once the identity is confirmed.
    async fn connect(&self) -> Result<String, SignalingError>;

    async fn disconnect(&self);

    /// Fails with `NotReady` unless the connection is `Ready`.
    fn signal(&self, kind: SignalKind, envelope: SignalEnvelope) -> Result<(), SignalingError>;

    fn join(&self, room_id: &str, metadata: Option<String>) -> Result<(), SignalingError>;

    fn leave(&self, room_id: &str) -> Result<(), SignalingError>;

    /// The event stream can be taken once.
    fn take_events(&self) -> Result<SignalingEvents, SignalingError>;
}
