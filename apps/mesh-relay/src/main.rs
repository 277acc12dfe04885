mod cli;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use mesh_relay::Config;

#[tokio::main]
async fn main() {
    let mut cli = Cli::parse();

    let filter = match cli.log.as_deref() {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(Commands::Probe { url, id, room, secs }) = cli.command.take() {
        if let Err(e) = cli::run_probe(url, id, room, secs).await {
            error!("probe failed: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    let config = cli.apply(Config::from_env());
    info!(
        target: "relay",
        port = config.port,
        bind = %config.bind,
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        "starting mesh relay"
    );
    if let Err(e) = mesh_relay::run(config).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}
