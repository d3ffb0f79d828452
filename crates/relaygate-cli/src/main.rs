mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use relaygate_client::{
    Gateway, Notification, NotificationKind, WebSocketConnector, DEFAULT_ROOM,
};

/// relaygate: local HTTP CONNECT proxy over a remote tunneling service.
#[derive(Parser)]
#[command(name = "relaygate", version, about = "Client-side TCP tunneling gateway")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Room (connection point) to join.
    #[arg(short, long, default_value = DEFAULT_ROOM)]
    room: String,

    /// Ask the service for its connection points instead of joining a room.
    #[arg(long)]
    list_rooms: bool,

    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    let overlay = config::load_overlay(&cli.config)?;
    let gateway = Gateway::from_overlay(&overlay, Arc::new(WebSocketConnector));
    gateway.add_event(&NotificationKind::ALL, log_notification);

    if cli.list_rooms {
        gateway.check_connection_points()?;
    } else {
        info!(room = %cli.room, "joining room");
        gateway.connect_to(&cli.room)?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    gateway.close().await;
    Ok(())
}

/// Log the notifications the bus does not already trace on its own.
fn log_notification(notification: &Notification) {
    match notification {
        Notification::Gateway(addr) => {
            info!(host = %addr.host, port = addr.port, "proxy ready, point clients at it")
        }
        Notification::ConnectionPoints(points) => info!(points = %points, "connection points"),
        Notification::ConnectionPointUnreachable(room) => {
            warn!(room = %room, "connection point unreachable")
        }
        Notification::IpAssigned(address) => info!(address = %address, "ip assigned"),
        Notification::IdAssigned(id) => debug!(id = %id, "id assigned"),
        Notification::Channel(conf) => debug!(conf = %conf, "channel configuration"),
        Notification::SocketBytes(bytes) => debug!(
            connection = %bytes.connection_id,
            read = bytes.read,
            written = bytes.written,
            "connection closed"
        ),
        Notification::Error(_)
        | Notification::Warning(_)
        | Notification::Info(_)
        | Notification::TunnelStatus(_) => {}
    }
}
