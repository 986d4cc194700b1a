//! Game Server
//!
//! Transport-independent request handling: join, leave, chunk streaming
//! and moves. The WebSocket front end and in-process clients both drive
//! this type.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::point::{ChunkIndex, Point};
use crate::game::chunk::ChunkSnapshot;
use crate::game::entity::{Entity, PlayerId};
use crate::game::loader::LoadError;
use crate::game::map::{Map, MapError};
use crate::game::transaction::MoveError;
use crate::network::auth::{authorize_join, AuthConfig, AuthError};
use crate::network::protocol::{ClientInfo, ClientUpdate, MoveRequest, MoveResult, RejectReason, ServerMessage};
use crate::network::session::{ClientSession, Outbound, SessionRegistry};

/// Attempts to chase a moving avatar when removing it.
const DESPAWN_ATTEMPTS: usize = 4;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket bind address.
    pub bind_addr: SocketAddr,
    /// World directory for [`DirectoryStorage`](crate::game::storage::DirectoryStorage).
    pub world_dir: PathBuf,
    /// Creator recorded when a new world is made.
    pub creator: String,
    /// Where avatars spawn.
    pub spawn_origin: Point,
    /// How far from the origin to look for a free tile.
    pub spawn_radius: u32,
    /// Period of background saves.
    pub autosave_interval: Duration,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Join authentication.
    pub auth: AuthConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            world_dir: PathBuf::from("world"),
            creator: "gridlock".to_string(),
            spawn_origin: Point::new(0, 0),
            spawn_radius: 8,
            autosave_interval: Duration::from_secs(60),
            max_connections: 1000,
            auth: AuthConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `GRIDLOCK_*` variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_or("GRIDLOCK_BIND_ADDR", defaults.bind_addr),
            world_dir: std::env::var("GRIDLOCK_WORLD_DIR").map(PathBuf::from).unwrap_or(defaults.world_dir),
            creator: std::env::var("GRIDLOCK_CREATOR").unwrap_or(defaults.creator),
            spawn_origin: defaults.spawn_origin,
            spawn_radius: env_or("GRIDLOCK_SPAWN_RADIUS", defaults.spawn_radius),
            autosave_interval: Duration::from_secs(env_or(
                "GRIDLOCK_AUTOSAVE_SECS",
                defaults.autosave_interval.as_secs(),
            )),
            max_connections: env_or("GRIDLOCK_MAX_CONNECTIONS", defaults.max_connections),
            auth: AuthConfig::from_env(),
            version: defaults.version,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Ignoring unparseable setting");
            default
        }),
        Err(_) => default,
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Why a join, leave or chunk request failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// The player id is already joined.
    #[error("player {0} is already joined")]
    DuplicatePlayer(PlayerId),

    /// The player id is not joined.
    #[error("player {0} is not joined")]
    UnknownPlayer(PlayerId),

    /// Join authentication failed.
    #[error("authentication failed: {0}")]
    AuthFailed(#[from] AuthError),

    /// No free tile near the spawn point.
    #[error("no free spawn position")]
    NoSpawnPosition,

    /// Unload for a chunk the player is not receiving.
    #[error("chunk {0} is not loaded by this player")]
    NotSubscribed(ChunkIndex),

    /// A chunk could not be loaded.
    #[error(transparent)]
    ChunkLoad(#[from] LoadError),

    /// Spawning the avatar failed.
    #[error(transparent)]
    Move(#[from] MoveError),
}

impl ServerError {
    /// Wire reason.
    pub fn reason(&self) -> RejectReason {
        match self {
            ServerError::DuplicatePlayer(_) => RejectReason::DuplicatePlayer,
            ServerError::UnknownPlayer(_) => RejectReason::UnknownPlayer,
            ServerError::AuthFailed(_) => RejectReason::AuthFailed,
            ServerError::NoSpawnPosition => RejectReason::NoSpawnPosition,
            ServerError::NotSubscribed(_) => RejectReason::NotSubscribed,
            ServerError::ChunkLoad(_) => RejectReason::ChunkUnavailable,
            ServerError::Move(e) => RejectReason::from(e),
        }
    }
}

// =============================================================================
// GAME SERVER
// =============================================================================

/// The authoritative server over one [`Map`].
pub struct GameServer {
    map: Arc<Map>,
    sessions: Arc<SessionRegistry>,
    config: ServerConfig,
}

impl GameServer {
    /// Serve `map`. Installs the session registry as the map's event sink.
    pub fn new(map: Arc<Map>, config: ServerConfig) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        map.set_sink(sessions.clone());
        Self { map, sessions, config }
    }

    /// The world.
    pub fn map(&self) -> &Arc<Map> {
        &self.map
    }

    /// Joined players.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Admit a player and spawn its avatar near the spawn origin.
    /// Updates for loaded chunks go to `outbound`.
    #[instrument(skip(self, info, outbound), fields(player = %info.player_id.short()))]
    pub async fn join(&self, info: ClientInfo, outbound: Outbound) -> Result<Point, ServerError> {
        if let Err(e) = authorize_join(&info, &self.config.auth) {
            warn!(error = %e, "Join refused");
            return Err(e.into());
        }

        let player = info.player_id;
        self.sessions
            .insert(ClientSession::new(player, info.display_name.clone(), outbound))
            .map_err(|_| ServerError::DuplicatePlayer(player))?;

        let spawned = self
            .map
            .spawn_near(Entity::player(player), self.config.spawn_origin, self.config.spawn_radius)
            .await;
        let position = match spawned {
            Ok(Some(position)) => position,
            Ok(None) => {
                self.sessions.remove(player);
                warn!("No free spawn position");
                return Err(ServerError::NoSpawnPosition);
            }
            Err(e) => {
                self.sessions.remove(player);
                warn!(error = %e, "Spawn failed");
                return Err(e.into());
            }
        };

        // A leave that raced the spawn already dropped the session.
        if !self.sessions.contains(player) {
            if let Err(e) = self.despawn_avatar(player, Some(position)).await {
                warn!(error = %e, "Failed to remove avatar of player who left during join");
            }
            return Err(ServerError::UnknownPlayer(player));
        }

        info!(name = %info.display_name, %position, "Player joined");
        Ok(position)
    }

    /// Remove a joined player: despawn its avatar and drop its chunks.
    pub async fn leave(&self, player: PlayerId) -> Result<(), ServerError> {
        let session = self.sessions.remove(player).ok_or(ServerError::UnknownPlayer(player))?;
        self.retire(session).await;
        Ok(())
    }

    /// Like [`leave`](Self::leave) but silent if the player is not joined.
    /// Returns whether anything was removed.
    pub async fn disconnect(&self, player: PlayerId) -> bool {
        match self.sessions.remove(player) {
            Some(session) => {
                self.retire(session).await;
                true
            }
            None => false,
        }
    }

    async fn retire(&self, session: ClientSession) {
        let player = session.player_id;
        if let Err(e) = self.despawn_avatar(player, session.last_position).await {
            warn!(player = %player.short(), error = %e, "Failed to remove avatar");
        }
        for index in session.chunks {
            if let Err(e) = self.map.release_chunk(index).await {
                warn!(player = %player.short(), chunk = %index, error = %e, "Failed to release chunk");
            }
        }
        info!(player = %player.short(), name = %session.display_name, "Player left");
    }

    async fn despawn_avatar(&self, player: PlayerId, hint: Option<Point>) -> Result<(), MoveError> {
        let mut last_error = None;
        for _ in 0..DESPAWN_ATTEMPTS {
            let Some(position) = self.map.locate_player(player).or(hint) else {
                return Ok(());
            };
            match self.map.remove_player(player, position).await {
                Ok(_) => return Ok(()),
                Err(e @ (MoveError::EntityMismatch(_) | MoveError::Vacant(_))) => {
                    // Moved between lookup and commit.
                    if self.map.locate_player(player).is_some_and(|now| now != position) {
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Start streaming a chunk to `player`. The snapshot is queued as a
    /// `ChunkAdded` update before any later change to the chunk.
    #[instrument(level = "debug", skip(self), fields(player = %player.short()))]
    pub async fn load_chunk(&self, player: PlayerId, index: ChunkIndex) -> Result<ChunkSnapshot, ServerError> {
        if !self.sessions.contains(player) {
            return Err(ServerError::UnknownPlayer(player));
        }
        let sessions = &self.sessions;
        let (snapshot, added) = self
            .map
            .subscribe_chunk(index, |snapshot| sessions.add_chunk(player, snapshot))
            .await?;

        match added {
            Some(true) => Ok(snapshot),
            Some(false) => {
                // Already streaming; the earlier load holds the reference.
                self.release(index).await;
                Ok(snapshot)
            }
            None => {
                self.release(index).await;
                Err(ServerError::UnknownPlayer(player))
            }
        }
    }

    /// Stop streaming a chunk to `player`.
    #[instrument(level = "debug", skip(self), fields(player = %player.short()))]
    pub async fn unload_chunk(&self, player: PlayerId, index: ChunkIndex) -> Result<(), ServerError> {
        if !self.sessions.remove_chunk(player, index) {
            return Err(if self.sessions.contains(player) {
                ServerError::NotSubscribed(index)
            } else {
                ServerError::UnknownPlayer(player)
            });
        }
        self.map.release_chunk(index).await?;
        Ok(())
    }

    async fn release(&self, index: ChunkIndex) {
        if let Err(e) = self.map.release_chunk(index).await {
            warn!(chunk = %index, error = %e, "Failed to release chunk");
        }
    }

    /// Move the requester's avatar one tile.
    #[instrument(level = "debug", skip(self), fields(player = %request.player_id.short()))]
    pub async fn move_player(&self, request: MoveRequest) -> MoveResult {
        if !self.sessions.contains(request.player_id) {
            return MoveResult::Rejected {
                reason: RejectReason::UnknownPlayer,
            };
        }
        match self.map.move_player(request.player_id, request.source, request.target).await {
            Ok(events) => MoveResult::Accepted {
                effects: events.iter().filter_map(ClientUpdate::from_event).collect(),
            },
            Err(e) => {
                debug!(error = %e, "Move rejected");
                MoveResult::Rejected {
                    reason: RejectReason::from(&e),
                }
            }
        }
    }

    /// Write every changed chunk and the world metadata.
    pub async fn save(&self) -> Result<usize, MapError> {
        let saved = self.map.save().await?;
        if saved > 0 {
            debug!(chunks = saved, "Saved world");
        }
        Ok(saved)
    }

    /// Tell every client the server is stopping, remove every avatar and
    /// save.
    pub async fn shutdown(&self, reason: &str) -> Result<usize, MapError> {
        self.sessions.broadcast(&ServerMessage::Shutdown {
            reason: reason.to_string(),
        });
        for player in self.sessions.players() {
            self.disconnect(player).await;
        }
        let saved = self.save().await?;
        info!(chunks = saved, "Server stopped");
        Ok(saved)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::game::chunk::Chunk;
    use crate::game::events::DespawnCause;
    use crate::game::storage::{MapMetadata, MemoryStorage};
    use crate::game::tile::Tile;

    fn pid(n: u8) -> PlayerId {
        PlayerId::new([n; 16])
    }

    fn p(x: i32, y: i32) -> Point {
        Point::new(x, y)
    }

    fn origin_chunk() -> ChunkIndex {
        ChunkIndex::new(0, 0)
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            spawn_origin: p(8, 8),
            spawn_radius: 4,
            ..Default::default()
        }
    }

    fn server_over(storage: Arc<MemoryStorage>, config: ServerConfig) -> GameServer {
        let map = Arc::new(Map::new(storage, MapMetadata::new("test")));
        GameServer::new(map, config)
    }

    fn server() -> GameServer {
        server_over(Arc::new(MemoryStorage::new()), test_config())
    }

    struct TestClient {
        id: PlayerId,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
        spawn: Point,
    }

    impl TestClient {
        fn updates(&mut self) -> Vec<ClientUpdate> {
            let mut out = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                if let ServerMessage::Update { update } = message {
                    out.push(update);
                }
            }
            out
        }
    }

    async fn join(server: &GameServer, n: u8) -> TestClient {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawn = server.join(ClientInfo::new(pid(n), format!("p{}", n)), tx).await.unwrap();
        TestClient { id: pid(n), rx, spawn }
    }

    fn request(player: PlayerId, source: Point, target: Point) -> MoveRequest {
        MoveRequest { player_id: player, source, target }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8080);
        assert!(!config.auth.is_configured());
    }

    #[tokio::test]
    async fn test_join_spawns_avatar() {
        let server = server();
        let client = join(&server, 1).await;
        assert_eq!(client.spawn, p(8, 8));
        assert_eq!(server.map().locate_player(pid(1)), None);

        let location = server.map().try_get(p(8, 8)).await.unwrap();
        assert!(location.tile.entity.unwrap().is_player(pid(1)));
        assert_eq!(server.sessions().position_of(pid(1)), Some(p(8, 8)));
    }

    #[tokio::test]
    async fn test_duplicate_join_rejected() {
        let server = server();
        let _first = join(&server, 1).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = server.join(ClientInfo::new(pid(1), "again"), tx).await.unwrap_err();
        assert_eq!(err, ServerError::DuplicatePlayer(pid(1)));
        assert_eq!(err.reason(), RejectReason::DuplicatePlayer);
        assert_eq!(server.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_far_apart_move_is_rejected_not_adjacent() {
        let server = server();
        let client = join(&server, 1).await;

        let result = server.move_player(request(pid(1), p(-1, 0), p(i32::MAX, 0))).await;
        assert_eq!(result, MoveResult::Rejected { reason: RejectReason::NotAdjacent });
        let result = server.move_player(request(pid(1), p(i32::MIN, i32::MIN), p(i32::MAX, i32::MAX))).await;
        assert_eq!(result, MoveResult::Rejected { reason: RejectReason::NotAdjacent });

        // The player is untouched and can still leave and come back.
        assert!(server.sessions().contains(pid(1)));
        let location = server.map().try_get(client.spawn).await.unwrap();
        assert!(location.tile.entity.unwrap().is_player(pid(1)));
        server.leave(pid(1)).await.unwrap();
        let again = join(&server, 1).await;
        assert_eq!(again.spawn, client.spawn);
    }

    #[tokio::test]
    async fn test_load_chunk_outside_world_is_refused() {
        let server = server();
        let _client = join(&server, 1).await;
        let index = ChunkIndex::new(i32::MIN, i32::MAX);

        let err = server.load_chunk(pid(1), index).await.unwrap_err();
        assert_eq!(err, ServerError::ChunkLoad(LoadError::OutOfWorld(index)));
        assert_eq!(err.reason(), RejectReason::ChunkUnavailable);
        assert_eq!(server.unload_chunk(pid(1), index).await, Err(ServerError::NotSubscribed(index)));
        assert!(server.sessions().contains(pid(1)));
    }

    #[tokio::test]
    async fn test_leave_then_join_again() {
        let server = server();
        let first = join(&server, 1).await;
        server.leave(pid(1)).await.unwrap();
        assert!(server.map().try_get(first.spawn).await.unwrap().tile.entity.is_none());
        assert_eq!(server.leave(pid(1)).await, Err(ServerError::UnknownPlayer(pid(1))));
        assert!(!server.disconnect(pid(1)).await);

        let second = join(&server, 1).await;
        assert_eq!(second.spawn, first.spawn);
    }

    #[tokio::test]
    async fn test_load_chunk_streams_snapshot_then_changes() {
        let server = server();
        let mut a = join(&server, 1).await;
        let snapshot = server.load_chunk(a.id, origin_chunk()).await.unwrap();
        assert!(snapshot.tile_at(a.spawn).unwrap().entity.is_some());
        assert_eq!(server.map().loader().reference_count(origin_chunk()), 1);

        let result = server.move_player(request(a.id, a.spawn, a.spawn + p(1, 0))).await;
        assert!(result.is_accepted());

        let updates = a.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0], ClientUpdate::ChunkAdded { chunk: snapshot });
        assert!(matches!(updates[1], ClientUpdate::EntityMoved { .. }));

        // Loading twice keeps a single reference.
        server.load_chunk(a.id, origin_chunk()).await.unwrap();
        assert_eq!(server.map().loader().reference_count(origin_chunk()), 1);

        server.unload_chunk(a.id, origin_chunk()).await.unwrap();
        assert_eq!(
            server.unload_chunk(a.id, origin_chunk()).await,
            Err(ServerError::NotSubscribed(origin_chunk()))
        );
        assert!(server.map().loader().get_if_loaded(origin_chunk()).is_none());
    }

    #[tokio::test]
    async fn test_overlapping_clients_see_same_order() {
        let server = server();
        let mut a = join(&server, 1).await;
        let mut b = join(&server, 2).await;
        assert_eq!(b.spawn, p(7, 7));
        server.load_chunk(a.id, origin_chunk()).await.unwrap();
        server.load_chunk(b.id, origin_chunk()).await.unwrap();
        a.updates();
        b.updates();

        let moves = [
            request(a.id, p(8, 8), p(9, 8)),
            request(b.id, p(7, 7), p(7, 6)),
            request(a.id, p(9, 8), p(10, 8)),
        ];
        for m in moves {
            assert!(server.move_player(m).await.is_accepted());
        }

        let seen_by_a = a.updates();
        let seen_by_b = b.updates();
        assert_eq!(seen_by_a.len(), 3);
        assert_eq!(seen_by_a, seen_by_b);
    }

    #[tokio::test]
    async fn test_move_by_unknown_player_rejected() {
        let server = server();
        let result = server.move_player(request(pid(5), p(0, 0), p(1, 0))).await;
        assert_eq!(
            result,
            MoveResult::Rejected {
                reason: RejectReason::UnknownPlayer
            }
        );
        assert_eq!(
            server.load_chunk(pid(5), origin_chunk()).await.unwrap_err(),
            ServerError::UnknownPlayer(pid(5))
        );
    }

    #[tokio::test]
    async fn test_rejected_move_reports_reason() {
        let storage = Arc::new(MemoryStorage::new());
        let mut chunk = Chunk::empty(origin_chunk());
        chunk.set_tile(p(9, 8), Tile::wall());
        storage.insert(chunk.snapshot());
        let server = server_over(storage, test_config());
        let a = join(&server, 1).await;

        let result = server.move_player(request(a.id, a.spawn, p(9, 8))).await;
        assert_eq!(
            result,
            MoveResult::Rejected {
                reason: RejectReason::Blocked
            }
        );
        let result = server.move_player(request(a.id, a.spawn, p(10, 8))).await;
        assert_eq!(
            result,
            MoveResult::Rejected {
                reason: RejectReason::NotAdjacent
            }
        );
    }

    #[tokio::test]
    async fn test_leave_is_seen_by_others() {
        let server = server();
        let a = join(&server, 1).await;
        let mut b = join(&server, 2).await;
        server.load_chunk(a.id, origin_chunk()).await.unwrap();
        server.load_chunk(b.id, origin_chunk()).await.unwrap();
        b.updates();

        assert!(server.move_player(request(a.id, p(8, 8), p(9, 8))).await.is_accepted());
        server.leave(a.id).await.unwrap();

        let updates = b.updates();
        assert!(updates.iter().any(|u| matches!(
            u,
            ClientUpdate::EntityDespawned { position, cause: DespawnCause::Destroyed, .. } if *position == p(9, 8)
        )));
        assert_eq!(server.map().loader().reference_count(origin_chunk()), 1);
    }

    #[tokio::test]
    async fn test_join_requires_token_when_auth_configured() {
        let config = ServerConfig {
            auth: AuthConfig::shared_secret("server-secret-for-tests-only"),
            ..test_config()
        };
        let server = server_over(Arc::new(MemoryStorage::new()), config);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = server.join(ClientInfo::new(pid(1), "anon"), tx).await.unwrap_err();
        assert_eq!(err, ServerError::AuthFailed(AuthError::MissingToken));
        assert!(server.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_notifies_and_clears() {
        let storage = Arc::new(MemoryStorage::new());
        let server = server_over(storage.clone(), test_config());
        let mut a = join(&server, 1).await;

        server.shutdown("maintenance").await.unwrap();
        let mut saw_shutdown = false;
        while let Ok(message) = a.rx.try_recv() {
            saw_shutdown |= matches!(message, ServerMessage::Shutdown { .. });
        }
        assert!(saw_shutdown);
        assert!(server.sessions().is_empty());
        let stored = storage.stored(origin_chunk()).unwrap();
        assert!(stored.tile_at(a.spawn).unwrap().entity.is_none());
    }
}
