//! Messages exchanged between mesh clients, the relay, and connected peers.
//!
//! Three layers live here:
//! - [`signal`]: the negotiation payloads one peer-connection hands to another.
//! - [`wire`]: the relay framing that routes those payloads and carries room membership.
//! - [`control`]: the in-band messages sessions exchange over their own data channel.

pub mod control;
mod error;
pub mod signal;
pub mod wire;

pub use control::ControlMessage;
pub use error::ProtocolError;
pub use signal::{IceCandidate, SdpType, SessionDescription, Signal};
pub use wire::{
    validate_identity, ClientMessage, RelayErrorCode, ServerMessage, SignalEnvelope, SignalKind,
    MAX_IDENTITY_LEN,
};
