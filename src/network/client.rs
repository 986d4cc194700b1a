//! Game Client
//!
//! A player's read-only mirror of the world. The client never changes its
//! cache on its own; it sends requests through a [`ServerStub`] and applies
//! whatever updates the server pushes back, in arrival order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::point::{ChunkIndex, Direction, Point};
use crate::game::chunk::{ChunkSnapshot, Location};
use crate::game::entity::{Entity, PlayerId};
use crate::network::protocol::{ClientInfo, ClientUpdate, MoveRequest, MoveResult, RejectReason, ServerMessage};
use crate::network::server::{GameServer, ServerError};

// =============================================================================
// ERRORS
// =============================================================================

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server refused the request.
    #[error("rejected ({reason:?}): {message}")]
    Rejected {
        /// Machine-readable reason
        reason: RejectReason,
        /// Human-readable detail
        message: String,
    },

    /// The transport went away. The cache has been discarded.
    #[error("connection lost")]
    ConnectionLost,

    /// No server connection.
    #[error("not connected")]
    NotConnected,

    /// `connect` on a connected client.
    #[error("already connected")]
    AlreadyConnected,

    /// The server answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl From<ServerError> for ClientError {
    fn from(e: ServerError) -> Self {
        ClientError::Rejected {
            reason: e.reason(),
            message: e.to_string(),
        }
    }
}

// =============================================================================
// SERVER STUB
// =============================================================================

/// Accepted join.
#[derive(Debug)]
pub struct JoinAccepted {
    /// Where the avatar was placed.
    pub spawn: Point,
    /// Pushed messages (updates, shutdown) in server order.
    pub pushes: mpsc::UnboundedReceiver<ServerMessage>,
}

/// The requests a client can make, independent of transport.
pub trait ServerStub: Send + Sync {
    /// Enter the world.
    fn join(&self, info: ClientInfo) -> BoxFuture<'_, Result<JoinAccepted, ClientError>>;

    /// Leave the world.
    fn leave(&self, player: PlayerId) -> BoxFuture<'_, Result<(), ClientError>>;

    /// Start receiving a chunk. Its contents arrive as a pushed
    /// `ChunkAdded` update.
    fn load_chunk(&self, player: PlayerId, index: ChunkIndex) -> BoxFuture<'_, Result<(), ClientError>>;

    /// Stop receiving a chunk.
    fn unload_chunk(&self, player: PlayerId, index: ChunkIndex) -> BoxFuture<'_, Result<(), ClientError>>;

    /// Move the avatar one tile.
    fn move_player(&self, request: MoveRequest) -> BoxFuture<'_, Result<MoveResult, ClientError>>;
}

/// In-process stub over a shared [`GameServer`].
#[derive(Clone)]
pub struct LocalServer {
    server: Arc<GameServer>,
}

impl LocalServer {
    /// Stub for `server`.
    pub fn new(server: Arc<GameServer>) -> Self {
        Self { server }
    }
}

impl ServerStub for LocalServer {
    fn join(&self, info: ClientInfo) -> BoxFuture<'_, Result<JoinAccepted, ClientError>> {
        Box::pin(async move {
            let (tx, pushes) = mpsc::unbounded_channel();
            let spawn = self.server.join(info, tx).await?;
            Ok(JoinAccepted { spawn, pushes })
        })
    }

    fn leave(&self, player: PlayerId) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move { Ok(self.server.leave(player).await?) })
    }

    fn load_chunk(&self, player: PlayerId, index: ChunkIndex) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            self.server.load_chunk(player, index).await?;
            Ok(())
        })
    }

    fn unload_chunk(&self, player: PlayerId, index: ChunkIndex) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move { Ok(self.server.unload_chunk(player, index).await?) })
    }

    fn move_player(&self, request: MoveRequest) -> BoxFuture<'_, Result<MoveResult, ClientError>> {
        Box::pin(async move { Ok(self.server.move_player(request).await) })
    }
}

// =============================================================================
// CACHE
// =============================================================================

/// Chunks the client has received plus its own avatar state.
#[derive(Debug, Clone)]
pub struct ClientCache {
    player: PlayerId,
    chunks: BTreeMap<ChunkIndex, ChunkSnapshot>,
    position: Option<Point>,
    facing: Option<Direction>,
}

impl ClientCache {
    /// Empty cache for `player`.
    pub fn new(player: PlayerId) -> Self {
        Self {
            player,
            chunks: BTreeMap::new(),
            position: None,
            facing: None,
        }
    }

    /// Apply one pushed update.
    pub fn apply(&mut self, update: &ClientUpdate) {
        self.track(update);
        match update {
            ClientUpdate::ChunkAdded { chunk } => {
                self.chunks.insert(chunk.index, chunk.clone());
            }
            ClientUpdate::ChunkRemoved { index } => {
                self.chunks.remove(index);
            }
            ClientUpdate::EntityMoved { from, to, entity } => {
                self.set_entity(*from, None);
                self.set_entity(*to, Some(entity.clone()));
            }
            ClientUpdate::EntitySpawned { position, entity } => {
                self.set_entity(*position, Some(entity.clone()));
            }
            ClientUpdate::EntityDespawned { position, .. } => {
                self.set_entity(*position, None);
            }
            ClientUpdate::TilePropertyChanged { position, tile, .. } => {
                // Occupancy is carried by entity updates.
                if let Some(slot) = self.chunks.get_mut(&position.chunk_index()).and_then(|c| c.tile_at_mut(*position)) {
                    slot.kind = tile.kind.clone();
                }
            }
        }
    }

    /// Follow the client's own avatar without touching tiles.
    pub fn track(&mut self, update: &ClientUpdate) {
        match update {
            ClientUpdate::EntityMoved { to: at, entity, .. } | ClientUpdate::EntitySpawned { position: at, entity }
                if entity.is_player(self.player) =>
            {
                self.position = Some(*at);
                if let Entity::Player { facing, .. } = entity {
                    self.facing = Some(*facing);
                }
            }
            ClientUpdate::EntityDespawned { entity, .. } if entity.is_player(self.player) => {
                self.position = None;
            }
            _ => {}
        }
    }

    fn set_entity(&mut self, position: Point, entity: Option<Entity>) {
        if let Some(slot) = self.chunks.get_mut(&position.chunk_index()).and_then(|c| c.tile_at_mut(position)) {
            slot.entity = entity;
        }
    }

    /// Cached location, if its chunk has been received.
    pub fn location(&self, position: Point) -> Option<Location> {
        let tile = self.chunks.get(&position.chunk_index())?.tile_at(position)?;
        Some(Location {
            position,
            tile: tile.clone(),
        })
    }

    /// Cached chunk.
    pub fn chunk(&self, index: ChunkIndex) -> Option<&ChunkSnapshot> {
        self.chunks.get(&index)
    }

    /// Indices of cached chunks, ascending.
    pub fn chunk_indices(&self) -> Vec<ChunkIndex> {
        self.chunks.keys().copied().collect()
    }

    /// Last confirmed avatar position.
    pub fn position(&self) -> Option<Point> {
        self.position
    }

    /// Last confirmed avatar facing.
    pub fn facing(&self) -> Option<Direction> {
        self.facing
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.position = None;
        self.facing = None;
    }
}

// =============================================================================
// GAME CLIENT
// =============================================================================

/// One player's connection and mirror.
pub struct GameClient {
    info: ClientInfo,
    stub: Option<Arc<dyn ServerStub>>,
    pushes: Option<mpsc::UnboundedReceiver<ServerMessage>>,
    cache: ClientCache,
    interest: BTreeSet<ChunkIndex>,
}

impl GameClient {
    /// Disconnected client.
    pub fn new(info: ClientInfo) -> Self {
        let cache = ClientCache::new(info.player_id);
        Self {
            info,
            stub: None,
            pushes: None,
            cache,
            interest: BTreeSet::new(),
        }
    }

    /// Player id.
    pub fn player_id(&self) -> PlayerId {
        self.info.player_id
    }

    /// True between a successful connect and disconnect / connection loss.
    pub fn is_connected(&self) -> bool {
        self.stub.is_some()
    }

    /// Local mirror.
    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    /// Cached location.
    pub fn location(&self, position: Point) -> Option<Location> {
        self.cache.location(position)
    }

    /// Last confirmed avatar position.
    pub fn position(&self) -> Option<Point> {
        self.cache.position()
    }

    /// Join through `stub`. Returns the spawn position.
    pub async fn connect(&mut self, stub: Arc<dyn ServerStub>) -> Result<Point, ClientError> {
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }
        let accepted = stub.join(self.info.clone()).await?;
        info!(player = %self.info.player_id.short(), spawn = %accepted.spawn, "Connected");
        self.stub = Some(stub);
        self.pushes = Some(accepted.pushes);
        self.cache.position = Some(accepted.spawn);
        Ok(accepted.spawn)
    }

    /// Leave and drop the cache.
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        let stub = self.stub.clone().ok_or(ClientError::NotConnected)?;
        let result = stub.leave(self.info.player_id).await;
        self.reset();
        match result {
            Err(ClientError::ConnectionLost) => Ok(()),
            other => other,
        }
    }

    fn reset(&mut self) {
        self.stub = None;
        self.pushes = None;
        self.cache.clear();
        self.interest.clear();
    }

    fn settle<T>(&mut self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if matches!(result, Err(ClientError::ConnectionLost)) {
            warn!(player = %self.info.player_id.short(), "Connection lost, discarding cache");
            self.reset();
        }
        result
    }

    fn stub(&self) -> Result<Arc<dyn ServerStub>, ClientError> {
        self.stub.clone().ok_or(ClientError::NotConnected)
    }

    /// Ask to move the avatar one step. The cache changes only when the
    /// resulting updates arrive.
    pub async fn move_player(&mut self, direction: Direction) -> Result<MoveResult, ClientError> {
        let stub = self.stub()?;
        // Pushes by other players may have moved the avatar.
        self.drain_updates()?;
        let source = self.cache.position().ok_or(ClientError::NotConnected)?;
        let target = source.checked_step(direction).ok_or_else(|| ClientError::Rejected {
            reason: RejectReason::Blocked,
            message: format!("{} is at the edge of the world", source),
        })?;
        let request = MoveRequest {
            player_id: self.info.player_id,
            source,
            target,
        };

        let result = stub.move_player(request).await;
        let result = self.settle(result)?;
        match &result {
            MoveResult::Accepted { effects } => {
                for effect in effects {
                    self.cache.track(effect);
                }
            }
            MoveResult::Rejected { reason } => {
                debug!(?direction, ?reason, "Move rejected");
            }
        }
        Ok(result)
    }

    /// Apply one pushed update to the cache.
    pub fn on_update(&mut self, update: &ClientUpdate) {
        self.cache.apply(update);
    }

    fn on_push(&mut self, message: ServerMessage) -> Result<Option<ClientUpdate>, ClientError> {
        match message {
            ServerMessage::Update { update } => {
                self.on_update(&update);
                Ok(Some(update))
            }
            ServerMessage::Shutdown { reason } => {
                info!(%reason, "Server shut down");
                self.settle(Err(ClientError::ConnectionLost))
            }
            ServerMessage::Error { reason, message } => {
                warn!(?reason, %message, "Server reported error");
                Ok(None)
            }
            other => {
                debug!(?other, "Ignoring unexpected push");
                Ok(None)
            }
        }
    }

    /// Apply every update already received. Returns how many were applied.
    pub fn drain_updates(&mut self) -> Result<usize, ClientError> {
        let mut applied = 0;
        loop {
            let next = match self.pushes.as_mut() {
                Some(pushes) => pushes.try_recv(),
                None => return Err(ClientError::NotConnected),
            };
            match next {
                Ok(message) => {
                    if self.on_push(message)?.is_some() {
                        applied += 1;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return Ok(applied),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return self.settle(Err(ClientError::ConnectionLost));
                }
            }
        }
    }

    /// Wait for and apply the next update.
    pub async fn next_update(&mut self) -> Result<ClientUpdate, ClientError> {
        loop {
            let next = match self.pushes.as_mut() {
                Some(pushes) => pushes.recv().await,
                None => return Err(ClientError::NotConnected),
            };
            match next {
                Some(message) => {
                    if let Some(update) = self.on_push(message)? {
                        return Ok(update);
                    }
                }
                None => return self.settle(Err(ClientError::ConnectionLost)),
            }
        }
    }

    /// Load every chunk within `radius` chunks of `center` and unload the
    /// rest.
    pub async fn update_interest(&mut self, center: Point, radius: u32) -> Result<(), ClientError> {
        let stub = self.stub()?;
        let player = self.info.player_id;
        let wanted: BTreeSet<ChunkIndex> = center.chunk_index().square(radius).collect();

        let stale: Vec<ChunkIndex> = self.interest.difference(&wanted).copied().collect();
        for index in stale {
            let result = stub.unload_chunk(player, index).await;
            self.settle(result)?;
            self.interest.remove(&index);
        }

        let fresh: Vec<ChunkIndex> = wanted.difference(&self.interest).copied().collect();
        for index in fresh {
            let result = stub.load_chunk(player, index).await;
            self.settle(result)?;
            self.interest.insert(index);
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::map::Map;
    use crate::game::storage::{MapMetadata, MemoryStorage};
    use crate::game::tile::Tile;
    use crate::network::server::ServerConfig;

    fn pid(n: u8) -> PlayerId {
        PlayerId::new([n; 16])
    }

    fn p(x: i32, y: i32) -> Point {
        Point::new(x, y)
    }

    fn local() -> (Arc<GameServer>, Arc<dyn ServerStub>) {
        let map = Arc::new(Map::new(Arc::new(MemoryStorage::new()), MapMetadata::new("test")));
        let config = ServerConfig {
            spawn_origin: p(8, 8),
            ..Default::default()
        };
        let server = Arc::new(GameServer::new(map, config));
        (server.clone(), Arc::new(LocalServer::new(server)))
    }

    fn client(n: u8) -> GameClient {
        GameClient::new(ClientInfo::new(pid(n), format!("p{}", n)))
    }

    #[tokio::test]
    async fn test_connect_and_reject_second_connect() {
        let (_server, stub) = local();
        let mut a = client(1);
        assert_eq!(a.connect(stub.clone()).await.unwrap(), p(8, 8));
        assert!(a.is_connected());
        assert!(matches!(a.connect(stub).await, Err(ClientError::AlreadyConnected)));
    }

    #[tokio::test]
    async fn test_duplicate_player_is_rejected_through_stub() {
        let (_server, stub) = local();
        let mut a = client(1);
        let mut twin = client(1);
        a.connect(stub.clone()).await.unwrap();
        let err = twin.connect(stub).await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected { reason: RejectReason::DuplicatePlayer, .. }));
        assert!(!twin.is_connected());
    }

    #[tokio::test]
    async fn test_move_applies_only_when_update_arrives() {
        let (_server, stub) = local();
        let mut a = client(1);
        a.connect(stub).await.unwrap();
        a.update_interest(p(8, 8), 0).await.unwrap();
        a.drain_updates().unwrap();
        assert!(a.location(p(8, 8)).unwrap().tile.entity.unwrap().is_player(pid(1)));

        let result = a.move_player(Direction::North).await.unwrap();
        assert!(result.is_accepted());
        assert_eq!(a.position(), Some(p(8, 9)));
        // Tiles are untouched until the push is applied.
        assert!(a.location(p(8, 9)).unwrap().tile.entity.is_none());

        assert_eq!(a.drain_updates().unwrap(), 1);
        assert!(a.location(p(8, 8)).unwrap().tile.entity.is_none());
        assert!(a.location(p(8, 9)).unwrap().tile.entity.unwrap().is_player(pid(1)));
        assert_eq!(a.cache().facing(), Some(Direction::North));
    }

    #[tokio::test]
    async fn test_other_players_moves_reach_cache() {
        let (_server, stub) = local();
        let mut a = client(1);
        let mut b = client(2);
        a.connect(stub.clone()).await.unwrap();
        let b_spawn = b.connect(stub).await.unwrap();
        a.update_interest(p(8, 8), 0).await.unwrap();
        b.update_interest(p(8, 8), 0).await.unwrap();

        b.move_player(Direction::West).await.unwrap();
        a.drain_updates().unwrap();
        let moved_to = b_spawn.step(Direction::West);
        assert!(a.location(moved_to).unwrap().tile.entity.unwrap().is_player(pid(2)));

        // The move drained the snapshot, so the move itself is next.
        let update = b.next_update().await.unwrap();
        assert!(matches!(update, ClientUpdate::EntityMoved { to, .. } if to == moved_to));
    }

    #[tokio::test]
    async fn test_interest_follows_center() {
        let (server, stub) = local();
        let mut a = client(1);
        a.connect(stub).await.unwrap();

        a.update_interest(p(8, 8), 1).await.unwrap();
        a.drain_updates().unwrap();
        assert_eq!(a.cache().chunk_indices().len(), 9);

        a.update_interest(p(40, 8), 0).await.unwrap();
        a.drain_updates().unwrap();
        assert_eq!(a.cache().chunk_indices(), vec![ChunkIndex::new(2, 0)]);
        assert_eq!(server.sessions().chunks_of(pid(1)).map(|c| c.len()), Some(1));
    }

    #[tokio::test]
    async fn test_connection_loss_discards_cache() {
        let (server, stub) = local();
        let mut a = client(1);
        a.connect(stub.clone()).await.unwrap();
        a.update_interest(p(8, 8), 0).await.unwrap();
        a.drain_updates().unwrap();
        assert!(a.location(p(8, 8)).is_some());

        // Server-side cleanup drops the outbound queue.
        assert!(server.disconnect(pid(1)).await);
        assert!(matches!(a.drain_updates(), Err(ClientError::ConnectionLost)));
        assert!(!a.is_connected());
        assert!(a.location(p(8, 8)).is_none());

        // The same id can join again.
        a.connect(stub).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect() {
        let (server, stub) = local();
        let mut a = client(1);
        a.connect(stub.clone()).await.unwrap();
        a.disconnect().await.unwrap();
        assert!(server.sessions().is_empty());
        assert!(matches!(a.disconnect().await, Err(ClientError::NotConnected)));
        assert_eq!(a.connect(stub).await.unwrap(), p(8, 8));
    }

    #[test]
    fn test_cache_ignores_uncached_chunks() {
        let mut cache = ClientCache::new(pid(1));
        let chunk = crate::game::chunk::Chunk::empty(ChunkIndex::new(0, 0));
        cache.apply(&ClientUpdate::ChunkAdded { chunk: chunk.snapshot() });

        // Half of this move lands in a chunk we do not have.
        cache.apply(&ClientUpdate::EntityMoved {
            from: p(16, 0),
            to: p(15, 0),
            entity: Entity::Box,
        });
        assert_eq!(cache.location(p(15, 0)).unwrap().tile.entity, Some(Entity::Box));
        assert!(cache.location(p(16, 0)).is_none());

        cache.apply(&ClientUpdate::TilePropertyChanged {
            position: p(15, 0),
            property: crate::game::tile::TileProperty::Open,
            tile: Tile::gate(true),
        });
        let location = cache.location(p(15, 0)).unwrap();
        assert_eq!(location.tile.kind, Tile::gate(true).kind);
        assert_eq!(location.tile.entity, Some(Entity::Box));

        cache.apply(&ClientUpdate::ChunkRemoved { index: ChunkIndex::new(0, 0) });
        assert!(cache.location(p(15, 0)).is_none());
    }
}
