use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("data channel is not open")]
    NotReady,
    #[error("peer connection is closed")]
    Closed,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("platform error: {0}")]
    Platform(String),
}

impl PeerError {
    pub(crate) fn negotiation<E: std::fmt::Display>(err: E) -> Self {
        PeerError::Negotiation(err.to_string())
    }

    pub(crate) fn platform<E: std::fmt::Display>(err: E) -> Self {
        PeerError::Platform(err.to_string())
    }
}
