//! Map Events
//!
//! Events produced by committed transactions and by chunk lifecycle changes.
//! Transactions record them in resolution order; the map publishes them
//! only after the commit has been applied.

use serde::{Serialize, Deserialize};

use crate::core::point::{ChunkIndex, Point};
use crate::game::entity::Entity;
use crate::game::tile::{Tile, TileProperty};

/// Why an entity left the map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DespawnCause {
    /// Explicit removal (player left, editor delete).
    Destroyed,
    /// A coin picked up by a player.
    Collected,
    /// A balloon that crossed a pin.
    Popped,
}

/// One observable change to the map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MapEvent {
    /// A chunk became resident.
    ChunkAdded {
        /// Chunk index
        index: ChunkIndex,
    },

    /// A chunk was evicted.
    ChunkRemoved {
        /// Chunk index
        index: ChunkIndex,
    },

    /// An entity changed tiles.
    EntityMoved {
        /// Tile it left
        from: Point,
        /// Tile it now occupies
        to: Point,
        /// Entity state after the move
        entity: Entity,
    },

    /// An entity appeared.
    EntitySpawned {
        /// Where
        position: Point,
        /// What
        entity: Entity,
    },

    /// An entity was removed.
    EntityDespawned {
        /// Tile it was removed from
        position: Point,
        /// Entity state at removal
        entity: Entity,
        /// Why
        cause: DespawnCause,
    },

    /// A tile's mechanism state changed.
    TilePropertyChanged {
        /// Where
        position: Point,
        /// Which property
        property: TileProperty,
        /// Tile state after the change
        tile: Tile,
    },
}

impl MapEvent {
    /// Create entity moved event.
    pub fn moved(from: Point, to: Point, entity: Entity) -> Self {
        MapEvent::EntityMoved { from, to, entity }
    }

    /// Create entity spawned event.
    pub fn spawned(position: Point, entity: Entity) -> Self {
        MapEvent::EntitySpawned { position, entity }
    }

    /// Create entity despawned event.
    pub fn despawned(position: Point, entity: Entity, cause: DespawnCause) -> Self {
        MapEvent::EntityDespawned { position, entity, cause }
    }

    /// Create tile property event.
    pub fn property(position: Point, property: TileProperty, tile: Tile) -> Self {
        MapEvent::TilePropertyChanged { position, property, tile }
    }

    /// Positions this event touches. Empty for chunk lifecycle events.
    pub fn positions(&self) -> Vec<Point> {
        match self {
            MapEvent::ChunkAdded { .. } | MapEvent::ChunkRemoved { .. } => Vec::new(),
            MapEvent::EntityMoved { from, to, .. } => vec![*from, *to],
            MapEvent::EntitySpawned { position, .. }
            | MapEvent::EntityDespawned { position, .. }
            | MapEvent::TilePropertyChanged { position, .. } => vec![*position],
        }
    }

    /// Chunks this event touches.
    pub fn chunks(&self) -> Vec<ChunkIndex> {
        match self {
            MapEvent::ChunkAdded { index } | MapEvent::ChunkRemoved { index } => vec![*index],
            _ => {
                let mut chunks: Vec<_> = self.positions().into_iter().map(Point::chunk_index).collect();
                chunks.dedup();
                chunks
            }
        }
    }

    /// `(position, property)` pairs this event changes, for subscribers.
    pub fn property_changes(&self) -> Vec<(Point, TileProperty)> {
        match self {
            MapEvent::ChunkAdded { .. } | MapEvent::ChunkRemoved { .. } => Vec::new(),
            MapEvent::EntityMoved { from, to, .. } => {
                vec![(*from, TileProperty::Entity), (*to, TileProperty::Entity)]
            }
            MapEvent::EntitySpawned { position, .. } | MapEvent::EntityDespawned { position, .. } => {
                vec![(*position, TileProperty::Entity)]
            }
            MapEvent::TilePropertyChanged { position, property, .. } => vec![(*position, *property)],
        }
    }
}

/// Payload handed to property subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyChange {
    /// Tile position
    pub position: Point,
    /// Changed property
    pub property: TileProperty,
    /// Event that caused the change
    pub event: MapEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::Color;

    #[test]
    fn test_move_across_chunk_border_touches_both_chunks() {
        let event = MapEvent::moved(Point::new(15, 0), Point::new(16, 0), Entity::Box);
        assert_eq!(event.chunks(), vec![ChunkIndex::new(0, 0), ChunkIndex::new(1, 0)]);
        assert_eq!(event.property_changes().len(), 2);

        let inside = MapEvent::moved(Point::new(1, 0), Point::new(2, 0), Entity::Box);
        assert_eq!(inside.chunks(), vec![ChunkIndex::new(0, 0)]);
    }

    #[test]
    fn test_event_json_shape() {
        let event = MapEvent::despawned(Point::new(3, 4), Entity::balloon(Color::Red), DespawnCause::Popped);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"entity_despawned\""));
        assert!(json.contains("\"cause\":\"popped\""));
        let back: MapEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
