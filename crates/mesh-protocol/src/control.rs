use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// In-band messages a session sends over its own data channel.
///
/// Only text frames are inspected. A frame that does not parse as one of these
/// variants is ordinary application data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Sent immediately before the stream it describes is attached.
    StreamMeta {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(default)]
        metadata: Option<String>,
    },
}

impl ControlMessage {
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
