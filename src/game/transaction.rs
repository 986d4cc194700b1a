//! Move Transactions
//!
//! Resolves one move, spawn or despawn into a complete change set, or into
//! nothing at all.
//!
//! ## Resolution
//!
//! Reads go through an overlay of staged tiles on top of a [`TileSource`].
//! Nothing touches the source until the map applies the finished
//! [`ChangeSet`], so an aborted transaction leaves no trace.
//!
//! For a move, the push chain is first scanned forward from the mover
//! until a free (or collectible) tile is found. The chain is then stepped
//! from its far end back to the mover, re-validating entry at each step so
//! that triggers fired by earlier steps (a button closing a gate) are seen
//! by later ones.
//!
//! ```text
//!   Pending ──resolve──► Resolving ──take_changes──► Committed
//!                           │
//!                           └──error──► Aborted
//! ```

use std::collections::BTreeMap;

use thiserror::Error;

use crate::core::point::{ChunkIndex, Direction, Point};
use crate::game::entity::{Displacement, Entity, PlayerId};
use crate::game::events::{DespawnCause, MapEvent};
use crate::game::loader::LoadError;
use crate::game::tile::{Arrival, Departure, Tile, TileKind, TileProperty};

/// A read hit a chunk that is not loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("chunk {0} is not loaded")]
pub struct Unloaded(pub ChunkIndex);

/// Read access to committed world state.
pub trait TileSource {
    /// Committed tile at `position`.
    fn tile_at(&self, position: Point) -> Result<Tile, Unloaded>;

    /// Paired teleporter for an arrival at `from` on `channel`, if one is loaded.
    fn teleporter_partner(&self, channel: u8, from: Point) -> Option<Point>;
}

/// Why a transaction did not commit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoveError {
    /// The target tile or its occupant refuses entry.
    #[error("move from {from} to {to} is blocked")]
    Blocked {
        /// Mover position
        from: Point,
        /// Refused target
        to: Point,
    },

    /// Something further down the push chain refused to move.
    #[error("push chain from {from} cannot be resolved (stopped at {stopped_at})")]
    ChainUnresolvable {
        /// Mover position
        from: Point,
        /// Tile that refused
        stopped_at: Point,
    },

    /// Source and target are not orthogonal neighbours.
    #[error("{from} and {to} are not adjacent")]
    NotAdjacent {
        /// Source position
        from: Point,
        /// Target position
        to: Point,
    },

    /// The source tile does not hold the expected entity.
    #[error("no matching entity at {0}")]
    EntityMismatch(Point),

    /// Spawn target already has an occupant.
    #[error("tile {0} is occupied")]
    Occupied(Point),

    /// Despawn target is empty.
    #[error("tile {0} is empty")]
    Vacant(Point),

    /// Resolution needs a chunk that is not loaded.
    #[error("chunk {0} is not loaded")]
    Unloaded(ChunkIndex),

    /// A chunk needed for resolution could not be loaded.
    #[error("chunk load failed: {0}")]
    ChunkLoad(#[from] LoadError),

    /// The transaction was already resolved or aborted.
    #[error("transaction is {0:?}, not pending")]
    Finished(TransactionState),
}

impl From<Unloaded> for MoveError {
    fn from(e: Unloaded) -> Self {
        MoveError::Unloaded(e.0)
    }
}

impl MoveError {
    /// Whether the request itself was refused by game rules (as opposed to
    /// an infrastructure problem).
    pub fn is_rule_violation(&self) -> bool {
        matches!(
            self,
            MoveError::Blocked { .. }
                | MoveError::ChainUnresolvable { .. }
                | MoveError::NotAdjacent { .. }
                | MoveError::EntityMismatch(_)
                | MoveError::Occupied(_)
                | MoveError::Vacant(_)
        )
    }
}

/// Transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Created, not yet resolved.
    Pending,
    /// Resolved successfully; changes are staged.
    Resolving,
    /// Changes handed to the map.
    Committed,
    /// Resolution failed; nothing staged.
    Aborted,
}

/// What the transaction was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Move the occupant of `source` one step to `target`.
    Move {
        /// Mover's tile
        source: Point,
        /// Adjacent destination
        target: Point,
        /// Required avatar owner, if any
        player: Option<PlayerId>,
    },
    /// Place a new entity.
    Spawn {
        /// Destination
        position: Point,
        /// New entity
        entity: Entity,
    },
    /// Remove an entity.
    Despawn {
        /// Tile to clear
        position: Point,
        /// Required avatar owner, if any
        player: Option<PlayerId>,
    },
}

/// Staged tiles and ordered events of a resolved transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Final state of every touched tile
    pub tiles: BTreeMap<Point, Tile>,
    /// Events in resolution order
    pub events: Vec<MapEvent>,
}

impl ChangeSet {
    /// Chunks touched, ascending.
    pub fn chunks(&self) -> Vec<ChunkIndex> {
        let mut chunks: Vec<_> = self.tiles.keys().map(|p| p.chunk_index()).collect();
        chunks.sort();
        chunks.dedup();
        chunks
    }
}

/// One single-use move attempt.
#[derive(Debug, Clone)]
pub struct MoveTransaction {
    operation: Operation,
    state: TransactionState,
    staged: BTreeMap<Point, Tile>,
    events: Vec<MapEvent>,
}

impl MoveTransaction {
    /// Transaction for an arbitrary operation.
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            state: TransactionState::Pending,
            staged: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Move whatever occupies `source`.
    pub fn relocate(source: Point, target: Point) -> Self {
        Self::new(Operation::Move { source, target, player: None })
    }

    /// Move `player`'s avatar, which must be at `source`.
    pub fn move_player(player: PlayerId, source: Point, target: Point) -> Self {
        Self::new(Operation::Move { source, target, player: Some(player) })
    }

    /// Place `entity` at `position`.
    pub fn spawn(position: Point, entity: Entity) -> Self {
        Self::new(Operation::Spawn { position, entity })
    }

    /// Remove the occupant of `position`.
    pub fn despawn(position: Point) -> Self {
        Self::new(Operation::Despawn { position, player: None })
    }

    /// Remove `player`'s avatar, which must be at `position`.
    pub fn despawn_player(player: PlayerId, position: Point) -> Self {
        Self::new(Operation::Despawn { position, player: Some(player) })
    }

    /// Requested operation.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Events recorded so far.
    pub fn events(&self) -> &[MapEvent] {
        &self.events
    }

    /// Resolve against `world`. On failure all staged changes are dropped.
    pub fn resolve<S: TileSource + ?Sized>(&mut self, world: &S) -> Result<(), MoveError> {
        if self.state != TransactionState::Pending {
            return Err(MoveError::Finished(self.state));
        }
        self.state = TransactionState::Resolving;

        let result = match self.operation.clone() {
            Operation::Move { source, target, player } => self.resolve_move(world, source, target, player),
            Operation::Spawn { position, entity } => self.resolve_spawn(world, position, entity),
            Operation::Despawn { position, player } => self.resolve_despawn(world, position, player),
        };

        if let Err(e) = result {
            self.staged.clear();
            self.events.clear();
            self.state = TransactionState::Aborted;
            return Err(e);
        }
        Ok(())
    }

    /// Hand the staged changes over for commit.
    pub fn take_changes(&mut self) -> Result<ChangeSet, MoveError> {
        if self.state != TransactionState::Resolving {
            return Err(MoveError::Finished(self.state));
        }
        self.state = TransactionState::Committed;
        Ok(ChangeSet {
            tiles: std::mem::take(&mut self.staged),
            events: std::mem::take(&mut self.events),
        })
    }

    // ===== Overlay =====

    fn read<S: TileSource + ?Sized>(&self, world: &S, position: Point) -> Result<Tile, MoveError> {
        match self.staged.get(&position) {
            Some(tile) => Ok(tile.clone()),
            None => Ok(world.tile_at(position)?),
        }
    }

    fn stage(&mut self, position: Point, tile: Tile) {
        #[cfg(feature = "debug-tracing")]
        tracing::trace!(%position, kind = tile.kind.name(), occupied = tile.entity.is_some(), "Staged tile");
        self.staged.insert(position, tile);
    }

    fn record(&mut self, event: MapEvent) {
        self.events.push(event);
    }

    // ===== Operations =====

    fn resolve_move<S: TileSource + ?Sized>(
        &mut self,
        world: &S,
        source: Point,
        target: Point,
        player: Option<PlayerId>,
    ) -> Result<(), MoveError> {
        let direction = Direction::between(source, target).ok_or(MoveError::NotAdjacent { from: source, to: target })?;

        let mover = self
            .read(world, source)?
            .entity
            .ok_or(MoveError::EntityMismatch(source))?;
        if let Some(id) = player {
            if !mover.is_player(id) {
                return Err(MoveError::EntityMismatch(source));
            }
        }

        let refuse = |at: Point| {
            if at == target {
                MoveError::Blocked { from: source, to: target }
            } else {
                MoveError::ChainUnresolvable { from: source, stopped_at: at }
            }
        };

        // Scan forward for the end of the push chain.
        let mut chain = vec![source];
        let mut pusher = mover;
        let mut cursor = target;
        loop {
            let tile = self.read(world, cursor)?;
            if !tile.kind.accepts(&pusher) {
                return Err(refuse(cursor));
            }
            let Some(occupant) = tile.entity else {
                break;
            };
            match occupant.displaced_by(&pusher) {
                Displacement::Push => {
                    chain.push(cursor);
                    pusher = occupant;
                    cursor = cursor.checked_step(direction).ok_or_else(|| refuse(cursor))?;
                }
                Displacement::Collect => break,
                Displacement::Block => return Err(refuse(cursor)),
            }
        }

        // Step from the far end back to the mover.
        for &from in chain.iter().rev() {
            let to = from.checked_step(direction).ok_or_else(|| refuse(from))?;
            let entity = self.read(world, from)?.entity.ok_or_else(|| refuse(from))?;
            let destination = self.read(world, to)?;
            if !destination.kind.accepts(&entity) {
                return Err(refuse(to));
            }
            if let Some(occupant) = destination.entity {
                match occupant.displaced_by(&entity) {
                    Displacement::Collect => self.remove_entity(world, to, DespawnCause::Collected)?,
                    _ => return Err(refuse(to)),
                }
            }
            self.step_entity(world, from, to, direction)?;
        }
        Ok(())
    }

    fn resolve_spawn<S: TileSource + ?Sized>(&mut self, world: &S, position: Point, entity: Entity) -> Result<(), MoveError> {
        let mut tile = self.read(world, position)?;
        if tile.entity.is_some() {
            return Err(MoveError::Occupied(position));
        }
        if !tile.kind.accepts(&entity) {
            return Err(MoveError::Blocked { from: position, to: position });
        }

        // Spawns are placed directly; only a button reacts.
        let press = tile.kind.arrival(&entity) == Arrival::Press;
        tile.entity = Some(entity.clone());
        self.stage(position, tile);
        self.record(MapEvent::spawned(position, entity));
        if press {
            self.set_pressed(world, position, true)?;
        }
        Ok(())
    }

    fn resolve_despawn<S: TileSource + ?Sized>(
        &mut self,
        world: &S,
        position: Point,
        player: Option<PlayerId>,
    ) -> Result<(), MoveError> {
        let tile = self.read(world, position)?;
        let Some(entity) = tile.entity else {
            return Err(MoveError::Vacant(position));
        };
        if let Some(id) = player {
            if !entity.is_player(id) {
                return Err(MoveError::EntityMismatch(position));
            }
        }
        self.remove_entity(world, position, DespawnCause::Destroyed)
    }

    // ===== Steps =====

    /// Move the occupant of `from` into `to`, which has already been
    /// validated and cleared.
    fn step_entity<S: TileSource + ?Sized>(
        &mut self,
        world: &S,
        from: Point,
        to: Point,
        direction: Direction,
    ) -> Result<(), MoveError> {
        let mut origin = self.read(world, from)?;
        let Some(mut entity) = origin.entity.take() else {
            return Ok(());
        };
        let departure = origin.kind.departure(&entity);
        self.stage(from, origin);
        entity.on_moved(direction);

        let mut arrived = self.read(world, to)?;
        let mut followups = Vec::new();
        match arrived.kind.arrival(&entity) {
            Arrival::Occupy => {
                self.place(to, arrived, entity.clone());
                self.record(MapEvent::moved(from, to, entity));
            }
            Arrival::Press => {
                self.place(to, arrived, entity.clone());
                self.record(MapEvent::moved(from, to, entity));
                followups.push(to);
            }
            Arrival::Recolor(color) => {
                if let Entity::Balloon { color: paint } = &mut entity {
                    *paint = color;
                }
                if let TileKind::Ink { consumed, .. } = &mut arrived.kind {
                    *consumed = true;
                }
                arrived.entity = Some(entity.clone());
                self.stage(to, arrived.clone());
                self.record(MapEvent::moved(from, to, entity));
                self.record(MapEvent::property(to, TileProperty::Consumed, arrived));
            }
            Arrival::Pop => {
                self.record(MapEvent::despawned(from, entity, DespawnCause::Popped));
            }
            Arrival::Teleport(channel) => {
                let exit = world
                    .teleporter_partner(channel, to)
                    .filter(|p| *p != to)
                    .and_then(|p| self.read(world, p).ok().map(|tile| (p, tile)))
                    .filter(|(_, tile)| tile.can_host(&entity));
                match exit {
                    Some((exit, exit_tile)) => {
                        self.place(exit, exit_tile, entity.clone());
                        self.record(MapEvent::moved(from, exit, entity));
                    }
                    None => {
                        self.place(to, arrived, entity.clone());
                        self.record(MapEvent::moved(from, to, entity));
                    }
                }
            }
        }

        if departure == Departure::Release {
            self.set_pressed(world, from, false)?;
        }
        for button in followups {
            self.set_pressed(world, button, true)?;
        }
        Ok(())
    }

    fn place(&mut self, position: Point, mut tile: Tile, entity: Entity) {
        tile.entity = Some(entity);
        self.stage(position, tile);
    }

    /// Take the occupant off `position` and fire its departure trigger.
    fn remove_entity<S: TileSource + ?Sized>(
        &mut self,
        world: &S,
        position: Point,
        cause: DespawnCause,
    ) -> Result<(), MoveError> {
        let mut tile = self.read(world, position)?;
        let Some(entity) = tile.entity.take() else {
            return Err(MoveError::Vacant(position));
        };
        let departure = tile.kind.departure(&entity);
        self.stage(position, tile);
        self.record(MapEvent::despawned(position, entity, cause));
        if departure == Departure::Release {
            self.set_pressed(world, position, false)?;
        }
        Ok(())
    }

    // ===== Triggers =====

    fn set_pressed<S: TileSource + ?Sized>(&mut self, world: &S, button: Point, pressed: bool) -> Result<(), MoveError> {
        let mut tile = self.read(world, button)?;
        let gates = match &mut tile.kind {
            TileKind::Button { pressed: state, gates, .. } if *state != pressed => {
                *state = pressed;
                gates.clone()
            }
            _ => return Ok(()),
        };
        self.stage(button, tile.clone());
        self.record(MapEvent::property(button, TileProperty::Pressed, tile));

        for gate in gates {
            self.toggle_gate(world, gate)?;
        }
        Ok(())
    }

    fn toggle_gate<S: TileSource + ?Sized>(&mut self, world: &S, position: Point) -> Result<(), MoveError> {
        let mut tile = self.read(world, position)?;
        let TileKind::Gate { open } = &mut tile.kind else {
            tracing::debug!(%position, kind = tile.kind.name(), "Button linked to a non-gate tile");
            return Ok(());
        };
        *open = !*open;
        self.stage(position, tile.clone());
        self.record(MapEvent::property(position, TileProperty::Open, tile));
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
