use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use mesh_protocol::{validate_identity, ClientMessage, ServerMessage};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

use mesh_relay::Config;

#[derive(Parser, Debug)]
#[command(name = "mesh-relay")]
#[command(about = "Mesh signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Drop connections silent for this many seconds
    #[arg(long)]
    pub heartbeat_timeout_secs: Option<u64>,

    /// Log filter, e.g. `info,relay=debug` (falls back to RUST_LOG, then `info`)
    #[arg(long, env = "MESH_RELAY_LOG")]
    pub log: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a relay and print every message it sends
    Probe {
        /// Relay websocket endpoint
        #[arg(short, long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,

        /// Identity to register
        #[arg(short, long)]
        id: String,

        /// Room to join after connecting
        #[arg(short, long)]
        room: Option<String>,

        /// Seconds to listen before exiting
        #[arg(long, default_value_t = 10)]
        secs: u64,
    },
}

impl Cli {
    /// Applies flags on top of the environment configuration.
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(secs) = self.heartbeat_timeout_secs {
            config.heartbeat_timeout = Duration::from_secs(secs);
        }
        config
    }
}

pub async fn run_probe(url: String, id: String, room: Option<String>, secs: u64) -> Result<()> {
    validate_identity(&id)?;
    let endpoint = relay_endpoint(&url, &id)?;
    let (ws, _) = connect_async(endpoint.as_str())
        .await
        .with_context(|| format!("failed to connect to {endpoint}"))?;
    debug!(target: "relay", %endpoint, "probe connected");
    let (mut write, mut read) = ws.split();

    if let Some(room_id) = room {
        let join = ClientMessage::RoomJoin {
            room_id,
            metadata: None,
        };
        write.send(Message::Text(join.to_text()?)).await?;
    }

    let deadline = tokio::time::sleep(Duration::from_secs(secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    println!("{text}");
                    if let Ok(ServerMessage::Error { code, message, .. }) = ServerMessage::from_text(&text) {
                        if code.is_fatal() {
                            bail!("relay refused identity {id}: {message}");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }
    let _ = write.close().await;
    Ok(())
}

/// Adds `id` to the relay url, keeping any other query parameters.
fn relay_endpoint(url: &str, id: &str) -> Result<Url> {
    let mut endpoint = Url::parse(url).with_context(|| format!("invalid relay url {url}"))?;
    let kept: Vec<(String, String)> = endpoint
        .query_pairs()
        .filter(|(key, _)| key != "id")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    endpoint.set_query(None);
    endpoint
        .query_pairs_mut()
        .extend_pairs(kept)
        .append_pair("id", id);
    Ok(endpoint)
}
