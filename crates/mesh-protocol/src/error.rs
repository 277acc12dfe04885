use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("invalid identity {identity:?}: {reason}")]
    InvalidIdentity {
        identity: String,
        reason: &'static str,
    },
}
