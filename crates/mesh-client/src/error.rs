use mesh_peer::PeerError;
use mesh_protocol::RelayErrorCode;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling is not ready")]
    NotReady,
    #[error("signaling transport error: {0}")]
    Network(String),
    #[error("relay error ({code:?}): {message}")]
    Routing {
        code: RelayErrorCode,
        message: String,
    },
    #[error("signaling protocol error: {0}")]
    Protocol(String),
    #[error("signaling events already taken")]
    EventsTaken,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeshError {
    #[error("not ready: {0}")]
    NotReady(&'static str),
    #[error("operation is not valid on a {0} session")]
    InvalidRole(&'static str),
    #[error("session is closed")]
    Closed,
    #[error("routing failed ({code:?}): {message}")]
    Routing {
        code: RelayErrorCode,
        message: String,
    },
    #[error("room {0} is already joined")]
    AlreadyJoined(String),
    #[error("{0} is not a member of the room")]
    UnknownMember(String),
    #[error("stream metadata requires an ordered data channel")]
    UnorderedChannel,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Signaling(SignalingError),
}

impl From<SignalingError> for MeshError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::Routing { code, message } => MeshError::Routing { code, message },
            SignalingError::NotReady => MeshError::NotReady("signaling"),
            other => MeshError::Signaling(other),
        }
    }
}
