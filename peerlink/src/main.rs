use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use peerlink_core::{logging, Config};
use peerlink_peer::{MediaSource, RtcPeerConnectionFactory, Session, SessionConfig};
use peerlink_signaling::{PeerInfo, RestMailbox, RoomId, UserId};

/// Join a PeerLink room and stay in the call until it ends
#[derive(Debug, Parser)]
#[command(name = "peerlink", version, about)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, env = "PEERLINK_CONFIG")]
    config: Option<String>,

    /// Room to join
    #[arg(short, long, env = "PEERLINK_ROOM")]
    room: String,

    /// Local participant id; decides the role against the peer's id
    #[arg(short, long, env = "PEERLINK_USER_ID")]
    user_id: String,

    /// Display name announced to the peer
    #[arg(short, long, env = "PEERLINK_NAME")]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!("Configuration validation failed with {} error(s)", errors.len());
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("PeerLink starting...");

    // 3. Signaling and media
    let mailbox =
        RestMailbox::from_config(&config.signaling).context("Failed to create mailbox client")?;
    info!(endpoint = %mailbox.endpoint(), "Using REST mailbox");
    let factory = RtcPeerConnectionFactory::new(&config.webrtc);

    let local = PeerInfo {
        id: UserId::from(args.user_id.as_str()),
        name: args.name.unwrap_or_else(|| args.user_id.clone()),
    };

    // 4. Join the room
    let session = Session::join(
        SessionConfig::from(&config),
        Arc::new(mailbox),
        Arc::new(factory),
        RoomId::from(args.room.as_str()),
        local,
        MediaSource::camera(),
    )
    .await
    .context("Failed to join room")?;

    let mut status = session.subscribe();
    let reporter = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let s = status.borrow_and_update().clone();
            info!(
                signaling = %s.signaling,
                ice = %s.ice,
                connection = %s.connection,
                role = ?s.role,
                peer = ?s.remote_peer,
                generation = s.generation,
                "Session status"
            );
        }
    });

    // 5. Run until the call ends or we are interrupted
    tokio::select! {
        reason = session.ended() => {
            warn!(reason = %reason, "Call ended");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Leaving room...");
        }
    }

    session.leave().await;
    reporter.abort();
    info!("PeerLink stopped");
    Ok(())
}
