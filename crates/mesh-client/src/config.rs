use std::env;
use std::time::Duration;

use mesh_peer::PeerConfig;
use tracing::Span;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay websocket endpoint, e.g. `ws://127.0.0.1:8080/ws`.
    pub relay_url: String,
    /// Identity to request. A random one is generated when absent.
    pub peer_id: Option<String>,
    /// How long `connect` waits for the relay to confirm the identity.
    pub ready_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub peer: PeerConfig,
    /// Parent for every span the client and its sessions create.
    pub span: Span,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let localhost_only = env::var("MESH_LOCALHOST_ONLY")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self {
            relay_url: env::var("MESH_RELAY_URL").unwrap_or(defaults.relay_url),
            peer_id: env::var("MESH_PEER_ID").ok().filter(|id| !id.is_empty()),
            ready_timeout: env::var("MESH_READY_TIMEOUT_MS")
                .ok()
                .and_then(|ms| ms.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.ready_timeout),
            heartbeat_interval: env::var("MESH_HEARTBEAT_SECS")
                .ok()
                .and_then(|secs| secs.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            peer: if localhost_only {
                PeerConfig::localhost()
            } else {
                defaults.peer
            },
            span: defaults.span,
        }
    }

    pub fn with_relay(mut self, relay_url: impl Into<String>) -> Self {
        self.relay_url = relay_url.into();
        self
    }

    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080/ws".to_string(),
            peer_id: None,
            ready_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            peer: PeerConfig::default(),
            span: Span::none(),
        }
    }
}
