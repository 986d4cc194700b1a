//! World Module
//!
//! Tiles, chunks, and the authoritative map.
//!
//! ## Module Structure
//!
//! - `entity`: Players, boxes, balloons, and other occupants
//! - `tile`: Tile kinds, properties, and their movement rules
//! - `chunk`: Fixed-size tile squares and their snapshots
//! - `storage`: Persistence backends
//! - `loader`: Reference-counted chunk cache
//! - `transaction`: Move resolution and all-or-nothing commit
//! - `events`: Committed changes, in commit order
//! - `map`: The authoritative world

pub mod entity;
pub mod tile;
pub mod chunk;
pub mod storage;
pub mod loader;
pub mod transaction;
pub mod events;
pub mod map;

// Re-export key types
pub use entity::{Color, Entity, EntityKind, PlayerId};
pub use tile::{Tile, TileKind, TileProperty};
pub use chunk::{Chunk, ChunkSnapshot, Location};
pub use storage::{DirectoryStorage, MapMetadata, MemoryStorage, StorageError, WorldStorage};
pub use loader::{ChunkLoader, LoadError};
pub use transaction::{MoveError, MoveTransaction};
pub use events::{DespawnCause, MapEvent, PropertyChange};
pub use map::{EventSink, Map, MapError};
