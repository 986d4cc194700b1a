//! Gridlock World Server
//!
//! Opens (or creates) the world in `GRIDLOCK_WORLD_DIR` and serves it over
//! WebSocket until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gridlock::{
    VERSION, CHUNK_SIZE,
    game::{map::Map, storage::DirectoryStorage},
    network::{GameServer, ServerConfig, WebSocketServer},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();
    info!("Gridlock Server v{}", VERSION);
    info!("Chunk size: {}x{}", CHUNK_SIZE, CHUNK_SIZE);
    info!("World directory: {}", config.world_dir.display());

    let storage = Arc::new(DirectoryStorage::new(config.world_dir.clone()));
    let map = Map::open(storage, &config.creator)
        .await
        .with_context(|| format!("opening world at {}", config.world_dir.display()))?;
    info!(
        "World created {} by {}",
        map.metadata().created_at.to_rfc3339(),
        map.metadata().creator
    );

    let server = Arc::new(GameServer::new(Arc::new(map), config));
    let ws = Arc::new(WebSocketServer::new(server));

    let signal_ws = ws.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                signal_ws.shutdown();
            }
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
    });

    ws.run().await.context("serving world")?;
    info!("Server stopped");
    Ok(())
}
