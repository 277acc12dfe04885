//! The peer-connection capability an engine drives.
//!
//! A platform owns the actual transport (ICE, DTLS, SCTP, RTP). Engines only
//! see the operations below and the [`PlatformEvent`] stream handed out when a
//! connection is created.

use std::sync::Arc;

use async_trait::async_trait;
use mesh_protocol::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::media::{DataFrame, MediaTrack};

pub mod loopback;
#[cfg(feature = "webrtc")]
pub mod webrtc;

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
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    NegotiationNeeded,
    IceCandidate(IceCandidate),
    IceConnectionState(IceConnectionState),
    ConnectionState(ConnectionState),
    /// The remote side announced its data channel and this side adopted it.
    DataChannel { label: String },
    DataChannelOpen,
    DataChannelMessage(DataFrame),
    DataChannelClosed,
    DataChannelError(String),
    Track { track: MediaTrack, stream_id: String },
    TrackRemoved { track_id: String, stream_id: String },
}

pub type PlatformEvents = mpsc::UnboundedReceiver<PlatformEvent>;

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Creates the connection's single data channel.
    async fn create_data_channel(&self, label: &str, ordered: bool) -> Result<(), PeerError>;

    /// Creates and applies the description the current signaling state calls
    /// for: an offer from `stable`, an answer from `have-remote-offer`.
    async fn set_local_description(&self) -> Result<SessionDescription, PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Discards a local offer that has not been answered.
    async fn rollback(&self) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    fn signaling_state(&self) -> SignalingState;

    /// Marks the next offer as an ICE restart and requests negotiation.
    async fn restart_ice(&self) -> Result<(), PeerError>;

    async fn send(&self, frame: DataFrame) -> Result<(), PeerError>;

    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), PeerError>;

    async fn remove_track(&self, track_id: &str) -> Result<(), PeerError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, PlatformEvents), PeerError>;
}
