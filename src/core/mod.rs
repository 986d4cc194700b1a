//! Core primitives.
//!
//! Grid geometry and content hashing. Nothing in here knows about tiles,
//! chunks loading, or the network.

pub mod point;
pub mod hash;

// Re-export core types
pub use point::{Point, Direction, ChunkIndex, CHUNK_SIZE, CHUNK_AREA};
pub use hash::{ContentHash, ContentHasher, HashDomain};
