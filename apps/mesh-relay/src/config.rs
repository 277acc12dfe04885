use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: IpAddr,
    /// Connections silent for longer than this are dropped.
    pub heartbeat_timeout: Duration,
    pub monitor_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("MESH_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            bind: env::var("MESH_RELAY_BIND")
                .ok()
                .and_then(|addr| addr.parse().ok())
                .unwrap_or(defaults.bind),
            heartbeat_timeout: env::var("MESH_RELAY_HEARTBEAT_TIMEOUT_SECS")
                .ok()
                .and_then(|t| t.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_timeout),
            monitor_interval: env::var("MESH_RELAY_MONITOR_INTERVAL_SECS")
                .ok()
                .and_then(|t| t.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.monitor_interval),
        }
    }

    /// Ephemeral port on the loopback interface.
    pub fn local() -> Self {
        Self {
            port: 0,
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::default()
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            heartbeat_timeout: Duration::from_secs(600), // 10 minutes
            monitor_interval: Duration::from_secs(60),
        }
    }
}
