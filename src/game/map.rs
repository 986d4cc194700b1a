//! World Map
//!
//! Presents the chunked world as one infinite grid.
//!
//! The map owns a [`ChunkLoader`] and serialises every transaction commit
//! through a FIFO async mutex, so commits apply in request-arrival order and
//! no reader ever sees half of one. Resolution runs under that lock; when it
//! needs a chunk that is not loaded the lock is released, the chunk is
//! loaded (and pinned for the rest of the request), and resolution restarts.
//!
//! Property-change notifications are an explicit registry keyed by
//! `(position, property)`. Committed events are also delivered, in order,
//! to an optional [`EventSink`] and to a broadcast tap.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::core::hash::{ContentHash, ContentHasher, HashDomain};
use crate::core::point::{ChunkIndex, Point};
use crate::game::chunk::{Chunk, ChunkSnapshot, Location};
use crate::game::entity::{Entity, PlayerId};
use crate::game::events::{MapEvent, PropertyChange};
use crate::game::loader::{ChunkLoader, ChunkObserver, LoadError, SharedChunk};
use crate::game::storage::{MapMetadata, StorageError, WorldStorage};
use crate::game::tile::{Tile, TileProperty};
use crate::game::transaction::{MoveError, MoveTransaction, TileSource, Unloaded};

/// Free-tile searches per spawn before reporting no room.
const SPAWN_SEARCHES: usize = 16;

/// Capacity of the broadcast event tap.
const EVENT_TAP_CAPACITY: usize = 1024;

/// Map-level failures outside of transactions.
#[derive(Debug, Error)]
pub enum MapError {
    /// Metadata could not be read or written.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Chunk load or flush failed.
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Receives committed events, in commit order, inside the commit critical
/// section. Implementations must not block or call back into the map.
pub trait EventSink: Send + Sync {
    /// Events of one committed transaction.
    fn publish(&self, events: &[MapEvent]);
}

/// Property subscription callback.
pub type PropertyHandler = Arc<dyn Fn(&PropertyChange) + Send + Sync>;

/// Handle returned by [`Map::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscriptions {
    by_key: BTreeMap<(Point, TileProperty), Vec<(SubscriptionId, PropertyHandler)>>,
    by_id: BTreeMap<SubscriptionId, (Point, TileProperty)>,
}

/// State the loader reports into and transactions read from.
struct MapShared {
    attached: RwLock<BTreeSet<ChunkIndex>>,
    teleporters: RwLock<BTreeMap<u8, BTreeSet<Point>>>,
    players: RwLock<BTreeMap<PlayerId, Point>>,
    subscriptions: RwLock<Subscriptions>,
    next_subscription: AtomicU64,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
    events: broadcast::Sender<MapEvent>,
}

impl MapShared {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_TAP_CAPACITY);
        Self {
            attached: RwLock::new(BTreeSet::new()),
            teleporters: RwLock::new(BTreeMap::new()),
            players: RwLock::new(BTreeMap::new()),
            subscriptions: RwLock::new(Subscriptions::default()),
            next_subscription: AtomicU64::new(1),
            sink: RwLock::new(None),
            events,
        }
    }

    /// Fan committed events out to the sink, subscribers and the tap.
    fn publish(&self, events: &[MapEvent]) {
        for event in events {
            match event {
                MapEvent::EntityMoved { to, entity, .. } => {
                    if let Some(id) = entity.player_id() {
                        self.players.write().unwrap_or_else(PoisonError::into_inner).insert(id, *to);
                    }
                }
                MapEvent::EntitySpawned { position, entity } => {
                    if let Some(id) = entity.player_id() {
                        self.players.write().unwrap_or_else(PoisonError::into_inner).insert(id, *position);
                    }
                }
                MapEvent::EntityDespawned { entity, .. } => {
                    if let Some(id) = entity.player_id() {
                        self.players.write().unwrap_or_else(PoisonError::into_inner).remove(&id);
                    }
                }
                _ => {}
            }
        }

        let sink = self.sink.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(sink) = sink {
            sink.publish(events);
        }

        for event in events {
            self.notify(event);
            let _ = self.events.send(event.clone());
        }
    }

    fn notify(&self, event: &MapEvent) {
        for (position, property) in event.property_changes() {
            let handlers: Vec<PropertyHandler> = {
                let subs = self.subscriptions.read().unwrap_or_else(PoisonError::into_inner);
                match subs.by_key.get(&(position, property)) {
                    Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                    None => continue,
                }
            };
            let change = PropertyChange {
                position,
                property,
                event: event.clone(),
            };
            for handler in handlers {
                handler(&change);
            }
        }
    }

    fn partner(&self, channel: u8, from: Point) -> Option<Point> {
        let teleporters = self.teleporters.read().unwrap_or_else(PoisonError::into_inner);
        teleporters.get(&channel)?.iter().copied().find(|p| *p != from)
    }
}

impl ChunkObserver for MapShared {
    fn chunk_attached(&self, chunk: &SharedChunk) {
        let chunk = chunk.read().unwrap_or_else(PoisonError::into_inner);
        let index = chunk.index();
        {
            let mut teleporters = self.teleporters.write().unwrap_or_else(PoisonError::into_inner);
            let mut players = self.players.write().unwrap_or_else(PoisonError::into_inner);
            for (position, tile) in chunk.iter() {
                if let Some(channel) = tile.kind.teleporter_channel() {
                    teleporters.entry(channel).or_default().insert(position);
                }
                if let Some(id) = tile.entity.as_ref().and_then(Entity::player_id) {
                    players.insert(id, position);
                }
            }
        }
        self.attached.write().unwrap_or_else(PoisonError::into_inner).insert(index);
        let _ = self.events.send(MapEvent::ChunkAdded { index });
    }

    fn chunk_detached(&self, chunk: &SharedChunk) {
        let index = chunk.read().unwrap_or_else(PoisonError::into_inner).index();
        self.attached.write().unwrap_or_else(PoisonError::into_inner).remove(&index);
        {
            let mut teleporters = self.teleporters.write().unwrap_or_else(PoisonError::into_inner);
            for positions in teleporters.values_mut() {
                positions.retain(|p| p.chunk_index() != index);
            }
            teleporters.retain(|_, positions| !positions.is_empty());
        }
        self.players
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, p| p.chunk_index() != index);
        let _ = self.events.send(MapEvent::ChunkRemoved { index });
    }
}

/// Read view over loaded chunks, used for resolution.
struct LoadedView<'a> {
    loader: &'a ChunkLoader,
    shared: &'a MapShared,
}

impl TileSource for LoadedView<'_> {
    fn tile_at(&self, position: Point) -> Result<Tile, Unloaded> {
        let index = position.chunk_index();
        let chunk = self.loader.get_if_loaded(index).ok_or(Unloaded(index))?;
        let chunk = chunk.read().unwrap_or_else(PoisonError::into_inner);
        chunk.tile(position).cloned().ok_or(Unloaded(index))
    }

    fn teleporter_partner(&self, channel: u8, from: Point) -> Option<Point> {
        self.shared.partner(channel, from)
    }
}

/// The authoritative world.
pub struct Map {
    loader: ChunkLoader,
    shared: Arc<MapShared>,
    commit: tokio::sync::Mutex<()>,
    metadata: MapMetadata,
}

impl Map {
    /// Map over `storage` with known metadata.
    pub fn new(storage: Arc<dyn WorldStorage>, metadata: MapMetadata) -> Self {
        let shared = Arc::new(MapShared::new());
        let loader = ChunkLoader::with_observer(storage, shared.clone());
        Self {
            loader,
            shared,
            commit: tokio::sync::Mutex::new(()),
            metadata,
        }
    }

    /// Open the world in `storage`, creating and saving fresh metadata if
    /// none exists.
    pub async fn open(storage: Arc<dyn WorldStorage>, creator: &str) -> Result<Self, MapError> {
        let metadata = match storage.load_metadata().await? {
            Some(metadata) => {
                info!(creator = %metadata.creator, created_at = %metadata.created_at, "Opened existing world");
                metadata
            }
            None => {
                let metadata = MapMetadata::new(creator);
                storage.save_metadata(metadata.clone()).await?;
                info!(creator = %metadata.creator, "Created new world");
                metadata
            }
        };
        Ok(Self::new(storage, metadata))
    }

    /// World identity.
    pub fn metadata(&self) -> &MapMetadata {
        &self.metadata
    }

    /// Underlying chunk loader.
    pub fn loader(&self) -> &ChunkLoader {
        &self.loader
    }

    /// Install the event emitter. Replaces any previous sink.
    pub fn set_sink(&self, sink: Arc<dyn EventSink>) {
        *self.shared.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Subscribe to every committed event (and chunk attach / detach).
    pub fn events(&self) -> broadcast::Receiver<MapEvent> {
        self.shared.events.subscribe()
    }

    // ===== Lookup =====

    /// Location at `position`, loading its chunk for the duration of the read.
    pub async fn try_get(&self, position: Point) -> Result<Location, LoadError> {
        let index = position.chunk_index();
        let chunk = self.loader.acquire(index).await?;
        let location = read_location(&chunk, position);
        self.loader.unload(index, false).await?;
        Ok(location)
    }

    /// Location at `position` if its chunk is loaded. Never loads.
    pub fn get_if_loaded(&self, position: Point) -> Option<Location> {
        let chunk = self.loader.get_if_loaded(position.chunk_index())?;
        let chunk = chunk.read().unwrap_or_else(PoisonError::into_inner);
        chunk.location(position)
    }

    /// Last committed position of a player's avatar, if its chunk is loaded.
    pub fn locate_player(&self, player: PlayerId) -> Option<Point> {
        self.shared
            .players
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&player)
            .copied()
    }

    /// Indices of attached chunks, ascending.
    pub fn attached_chunks(&self) -> Vec<ChunkIndex> {
        self.shared
            .attached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Hash of every loaded chunk, in index order.
    pub fn state_hash(&self) -> ContentHash {
        let mut hasher = ContentHasher::new(HashDomain::World);
        for chunk in self.loader.loaded_chunks() {
            chunk.read().unwrap_or_else(PoisonError::into_inner).hash_into(&mut hasher);
        }
        hasher.finish()
    }

    // ===== Subscriptions =====

    /// Call `handler` whenever `property` of the tile at `position` changes.
    ///
    /// Handlers run inside the commit critical section and must not start
    /// transactions.
    pub fn subscribe<F>(&self, position: Point, property: TileProperty, handler: F) -> SubscriptionId
    where
        F: Fn(&PropertyChange) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.shared.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        subs.by_key
            .entry((position, property))
            .or_default()
            .push((id, Arc::new(handler)));
        subs.by_id.insert(id, (position, property));
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.shared.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        let Some(key) = subs.by_id.remove(&id) else {
            return false;
        };
        if let Some(list) = subs.by_key.get_mut(&key) {
            list.retain(|(existing, _)| *existing != id);
            if list.is_empty() {
                subs.by_key.remove(&key);
            }
        }
        true
    }

    // ===== Transactions =====

    /// Move whatever occupies `source` one step to `target`.
    pub async fn move_entity(&self, source: Point, target: Point) -> Result<Vec<MapEvent>, MoveError> {
        self.execute(MoveTransaction::relocate(source, target)).await
    }

    /// Move `player`'s avatar from `source` to `target`.
    pub async fn move_player(&self, player: PlayerId, source: Point, target: Point) -> Result<Vec<MapEvent>, MoveError> {
        self.execute(MoveTransaction::move_player(player, source, target)).await
    }

    /// Spawn `entity` at `position`.
    pub async fn create_entity(&self, entity: Entity, position: Point) -> Result<Entity, MoveError> {
        self.execute(MoveTransaction::spawn(position, entity.clone())).await?;
        Ok(entity)
    }

    /// Remove whatever occupies `position`.
    pub async fn destroy_entity(&self, position: Point) -> Result<Entity, MoveError> {
        let events = self.execute(MoveTransaction::despawn(position)).await?;
        despawned_entity(&events).ok_or(MoveError::Vacant(position))
    }

    /// Remove `player`'s avatar from `position`.
    pub async fn remove_player(&self, player: PlayerId, position: Point) -> Result<Entity, MoveError> {
        let events = self.execute(MoveTransaction::despawn_player(player, position)).await?;
        despawned_entity(&events).ok_or(MoveError::Vacant(position))
    }

    /// Resolve and commit one transaction, loading chunks as resolution
    /// demands. Returns the committed events.
    #[instrument(level = "debug", skip(self, transaction), fields(op = ?transaction.operation()))]
    pub async fn execute(&self, transaction: MoveTransaction) -> Result<Vec<MapEvent>, MoveError> {
        let mut pinned: Vec<ChunkIndex> = Vec::new();

        // Every restart pins one more chunk, so this ends once the chain
        // has everything it touches loaded or a load fails.
        let result = loop {
            let attempt = {
                let _commit = self.commit.lock().await;
                self.resolve_and_apply(transaction.clone())
            };
            match attempt {
                Err(MoveError::Unloaded(index)) if pinned.contains(&index) => {
                    warn!(chunk = %index, "Pinned chunk reported unloaded, giving up");
                    break Err(MoveError::Unloaded(index));
                }
                Err(MoveError::Unloaded(index)) => {
                    debug!(chunk = %index, "Resolution needs chunk, loading");
                    match self.loader.acquire(index).await {
                        Ok(_) => pinned.push(index),
                        Err(e) => break Err(MoveError::ChunkLoad(e)),
                    }
                }
                other => break other,
            }
        };

        for index in pinned {
            if let Err(e) = self.loader.unload(index, false).await {
                warn!(chunk = %index, error = %e, "Failed to release pinned chunk");
            }
        }
        result
    }

    /// Must be called with the commit lock held.
    fn resolve_and_apply(&self, mut transaction: MoveTransaction) -> Result<Vec<MapEvent>, MoveError> {
        let view = LoadedView {
            loader: &self.loader,
            shared: &self.shared,
        };
        transaction.resolve(&view)?;
        let changes = transaction.take_changes()?;

        let chunks: Vec<SharedChunk> = changes
            .chunks()
            .into_iter()
            .map(|index| self.loader.get_if_loaded(index).ok_or(MoveError::Unloaded(index)))
            .collect::<Result<_, _>>()?;

        // Ascending index order.
        let mut guards: Vec<RwLockWriteGuard<'_, Chunk>> = chunks
            .iter()
            .map(|c| c.write().unwrap_or_else(PoisonError::into_inner))
            .collect();
        if let Some(detached) = guards.iter().find(|g| !g.is_attached()) {
            return Err(MoveError::Unloaded(detached.index()));
        }

        for (position, tile) in changes.tiles {
            let index = position.chunk_index();
            if let Some(guard) = guards.iter_mut().find(|g| g.index() == index) {
                guard.set_tile(position, tile);
            }
        }
        for guard in guards.iter_mut() {
            guard.mark_modified();
        }
        drop(guards);

        self.shared.publish(&changes.events);
        Ok(changes.events)
    }

    // ===== Streaming =====

    /// Take a reference on a chunk and snapshot it inside the commit
    /// critical section, calling `register` before any later commit can
    /// publish. Anything committed before the snapshot is in it; anything
    /// after reaches whatever `register` installed.
    pub async fn subscribe_chunk<F, R>(&self, index: ChunkIndex, register: F) -> Result<(ChunkSnapshot, R), LoadError>
    where
        F: FnOnce(&ChunkSnapshot) -> R,
    {
        let chunk = self.loader.acquire(index).await?;
        let _commit = self.commit.lock().await;
        let snapshot = chunk.read().unwrap_or_else(PoisonError::into_inner).snapshot();
        let registered = register(&snapshot);
        Ok((snapshot, registered))
    }

    /// Drop one reference on a chunk.
    pub async fn release_chunk(&self, index: ChunkIndex) -> Result<(), LoadError> {
        self.loader.unload(index, false).await.map(|_| ())
    }

    /// Nearest tile to `origin` (Chebyshev rings, row-major within a ring)
    /// that `entity` could be spawned on, searching up to `radius` tiles out.
    pub async fn find_free_position(&self, entity: &Entity, origin: Point, radius: u32) -> Result<Option<Point>, LoadError> {
        let mut pinned: BTreeMap<ChunkIndex, SharedChunk> = BTreeMap::new();
        let mut found = None;
        let mut failure = None;

        'search: for ring in 0..=radius as i32 {
            for dy in -ring..=ring {
                for dx in -ring..=ring {
                    if dx.abs() != ring && dy.abs() != ring {
                        continue;
                    }
                    let position = origin + Point::new(dx, dy);
                    let index = position.chunk_index();
                    if !pinned.contains_key(&index) {
                        match self.loader.acquire(index).await {
                            Ok(chunk) => {
                                pinned.insert(index, chunk);
                            }
                            Err(e) => {
                                failure = Some(e);
                                break 'search;
                            }
                        }
                    }
                    let free = pinned
                        .get(&index)
                        .map(|chunk| {
                            let chunk = chunk.read().unwrap_or_else(PoisonError::into_inner);
                            chunk.tile(position).is_some_and(|t| t.can_host(entity))
                        })
                        .unwrap_or(false);
                    if free {
                        found = Some(position);
                        break 'search;
                    }
                }
            }
        }

        for index in pinned.into_keys() {
            if let Err(e) = self.loader.unload(index, false).await {
                warn!(chunk = %index, error = %e, "Failed to release search chunk");
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(found),
        }
    }

    /// Spawn `entity` on the nearest free tile around `origin`.
    pub async fn spawn_near(&self, entity: Entity, origin: Point, radius: u32) -> Result<Option<Point>, MoveError> {
        // A concurrent commit can take the chosen tile; search again.
        for _ in 0..SPAWN_SEARCHES {
            let Some(position) = self.find_free_position(&entity, origin, radius).await? else {
                return Ok(None);
            };
            match self.create_entity(entity.clone(), position).await {
                Ok(_) => return Ok(Some(position)),
                Err(MoveError::Occupied(_)) | Err(MoveError::Blocked { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    // ===== Persistence =====

    /// Write metadata and every changed chunk.
    pub async fn save(&self) -> Result<usize, MapError> {
        self.loader.storage().save_metadata(self.metadata.clone()).await?;
        Ok(self.loader.save_changes().await?)
    }

    /// Write every changed chunk.
    pub async fn save_changes(&self) -> Result<usize, LoadError> {
        self.loader.save_changes().await
    }
}

fn read_location(chunk: &SharedChunk, position: Point) -> Location {
    let chunk = chunk.read().unwrap_or_else(PoisonError::into_inner);
    chunk.location(position).unwrap_or(Location {
        position,
        tile: Tile::default(),
    })
}

fn despawned_entity(events: &[MapEvent]) -> Option<Entity> {
    events.iter().find_map(|event| match event {
        MapEvent::EntityDespawned { entity, .. } => Some(entity.clone()),
        _ => None,
    })
}

// =============================================================================
// TESTS
// =============================================================================
