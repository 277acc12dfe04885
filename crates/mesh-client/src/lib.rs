//! Sessions and full-mesh rooms on top of a signaling relay.
//!
//! [`MeshClient`] holds the relay connection and routes every inbound signal
//! to the [`Call`] that owns its session id. [`Room`]s keep one call per
//! member and fan operations out across them.

mod call;
mod client;
mod config;
mod error;
mod room;
mod router;
pub mod signaling;

pub use call::{Call, CallEnvelope, CallEvent, CallEvents, CallRole};
pub use client::{ClientEvent, MeshClient};
pub use config::ClientConfig;
pub use error::{MeshError, SignalingError};
pub use mesh_peer::{DataFrame, MediaStream, MediaTrack, PeerConfig, TrackKind};
pub use room::{FanOut, Room, RoomEvent};
pub use signaling::{Signaling, SignalingEvent, SignalingState, WebSocketSignaling};
