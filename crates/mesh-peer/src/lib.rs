//! Per-connection negotiation for mesh sessions.
//!
//! [`Peer`] drives one platform peer-connection through offer/answer and ICE
//! exchange. Platforms plug in through [`PeerConnectionFactory`]: the
//! [`loopback`](platform::loopback) network runs in-process, and the
//! `webrtc` feature adds a webrtc-rs backend.

mod config;
mod error;
mod media;
mod peer;
pub mod platform;

pub use config::{IceServer, PeerConfig};
pub use error::PeerError;
pub use media::{DataFrame, MediaStream, MediaTrack, TrackKind};
pub use peer::{NegotiationPhase, Peer, PeerEvent, Role};
pub use platform::loopback::{LoopbackNetwork, LoopbackPeer, Operation};
pub use platform::{PeerConnection, PeerConnectionFactory, PlatformEvent, SignalingState};
#[cfg(feature = "webrtc")]
pub use platform::webrtc::WebRtcFactory;
