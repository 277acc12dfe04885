use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::signal::Signal;

pub const MAX_IDENTITY_LEN: usize = 64;

/// Point-to-point negotiation message. `source` is filled in by the relay from
/// the sender's registered identity and ignored when a client sets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    pub signal: Signal,
}

/// Separates the first offer of a session from everything after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    OpenSession,
    Signal,
}

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    OpenSession(SignalEnvelope),
    Signal(SignalEnvelope),
    RoomJoin {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<String>,
    },
    RoomLeave {
        room_id: String,
    },
    Ping,
}

impl ClientMessage {
    pub fn routed(kind: SignalKind, envelope: SignalEnvelope) -> Self {
        match kind {
            SignalKind::OpenSession => ClientMessage::OpenSession(envelope),
            SignalKind::Signal => ClientMessage::Signal(envelope),
        }
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    IdentityOpen {
        peer_id: String,
    },
    Error {
        code: RelayErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    OpenSession(SignalEnvelope),
    Signal(SignalEnvelope),
    RoomJoin {
        room_id: String,
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<String>,
    },
    RoomLeave {
        room_id: String,
        peer_id: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(code: RelayErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            session_id: None,
        }
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayErrorCode {
    MissingId,
    InvalidId,
    IdTaken,
    UnknownTarget,
    BadMessage,
}

impl RelayErrorCode {
    /// Identity failures end the connection.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            RelayErrorCode::MissingId | RelayErrorCode::InvalidId | RelayErrorCode::IdTaken
        )
    }
}

/// Identities are 1..=64 characters of ASCII alphanumerics, `-`, `_`, `.` or `:`.
pub fn validate_identity(identity: &str) -> Result<(), ProtocolError> {
    let reason = if identity.is_empty() {
        Some("identity is empty")
    } else if identity.len() > MAX_IDENTITY_LEN {
        Some("identity is too long")
    } else if !identity
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        Some("identity contains unsupported characters")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ProtocolError::InvalidIdentity {
            identity: identity.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{SessionDescription, Signal};

    fn envelope() -> SignalEnvelope {
        SignalEnvelope {
            target: "bob".into(),
            source: None,
            session_id: "call:1".into(),
            room_id: None,
            metadata: Some("hello".into()),
            signal: Signal::Sdp(SessionDescription::offer("v=0")),
        }
    }

    #[test]
    fn open_session_flattens_envelope() {
        let text = ClientMessage::OpenSession(envelope()).to_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "open_session");
        assert_eq!(value["target"], "bob");
        assert_eq!(value["session_id"], "call:1");
        assert_eq!(value["signal"]["type"], "sdp");
        assert!(value.get("source").is_none());
        assert!(value.get("room_id").is_none());
    }

    #[test]
    fn server_messages_parse_from_relay_text() {
        let open = ServerMessage::from_text(r#"{"type":"identity_open","peer_id":"alice"}"#).unwrap();
        assert_eq!(
            open,
            ServerMessage::IdentityOpen {
                peer_id: "alice".into()
            }
        );

        let err = ServerMessage::from_text(
            r#"{"type":"error","code":"unknown_target","message":"nobody","session_id":"call:9"}"#,
        )
        .unwrap();
        match err {
            ServerMessage::Error {
                code, session_id, ..
            } => {
                assert_eq!(code, RelayErrorCode::UnknownTarget);
                assert!(!code.is_fatal());
                assert_eq!(session_id.as_deref(), Some("call:9"));
            }
            other => panic!("unexpected message {other:?}"),
        }

        let join = ServerMessage::from_text(r#"{"type":"room_join","room_id":"r1","peer_id":"c"}"#)
            .unwrap();
        assert!(matches!(join, ServerMessage::RoomJoin { metadata: None, .. }));
    }

    #[test]
    fn routed_picks_message_kind() {
        assert!(matches!(
            ClientMessage::routed(SignalKind::OpenSession, envelope()),
            ClientMessage::OpenSession(_)
        ));
        assert!(matches!(
            ClientMessage::routed(SignalKind::Signal, envelope()),
            ClientMessage::Signal(_)
        ));
    }

    #[test]
    fn identity_rules() {
        assert!(validate_identity("alice").is_ok());
        assert!(validate_identity("room:peer-1_a.b").is_ok());
        assert!(validate_identity("").is_err());
        assert!(validate_identity("has space").is_err());
        assert!(validate_identity(&"x".repeat(MAX_IDENTITY_LEN + 1)).is_err());
    }
}
