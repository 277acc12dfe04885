#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Settings applied to every peer-connection an engine allocates.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    pub channel_label: String,
    /// Stream metadata relies on ordered delivery; sessions refuse to attach
    /// streams when this is off.
    pub ordered: bool,
    /// ICE restarts attempted before a failed connection is torn down.
    pub max_ice_restarts: u32,
}

impl PeerConfig {
    /// Host candidates only, for same-machine setups.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:global.stun.twilio.com:3478"),
            ],
            channel_label: "mesh-data".to_string(),
            ordered: true,
            max_ice_restarts: 3,
        }
    }
}
