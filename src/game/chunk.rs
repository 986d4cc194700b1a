//! Chunks
//!
//! A chunk is a `CHUNK_SIZE` x `CHUNK_SIZE` block of tiles, the unit of
//! loading, saving and streaming. Every in-bounds local offset always
//! yields a tile; unwritten cells are plain paths.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::hash::{ContentHash, ContentHasher, HashDomain};
use crate::core::point::{ChunkIndex, Point, CHUNK_AREA, CHUNK_SIZE};
use crate::game::tile::Tile;

/// Snapshot that cannot become a chunk.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("chunk {index} snapshot holds {found} tiles, expected {expected}", expected = CHUNK_AREA)]
pub struct InvalidSnapshot {
    /// Index the snapshot claimed
    pub index: ChunkIndex,
    /// Number of tiles it carried
    pub found: usize,
}

/// One addressable world cell, read out of a chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Absolute position
    pub position: Point,
    /// Tile at that position (never absent)
    pub tile: Tile,
}

/// Serializable chunk content, used by storage and the wire protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    /// Chunk-space index
    pub index: ChunkIndex,
    /// Row-major tiles, `CHUNK_AREA` long
    pub tiles: Vec<Tile>,
}

impl ChunkSnapshot {
    /// Tile at an absolute position, if it falls inside this snapshot.
    pub fn tile_at(&self, position: Point) -> Option<&Tile> {
        if !self.index.contains(position) {
            return None;
        }
        self.tiles.get(local_slot(position.local_offset()))
    }

    /// Mutable tile at an absolute position.
    pub fn tile_at_mut(&mut self, position: Point) -> Option<&mut Tile> {
        if !self.index.contains(position) {
            return None;
        }
        self.tiles.get_mut(local_slot(position.local_offset()))
    }
}

#[inline]
fn local_slot(local: Point) -> usize {
    (local.y * CHUNK_SIZE + local.x) as usize
}

/// In-memory chunk.
///
/// `revision` counts committed mutations; `saved_revision` is the revision
/// last written to storage. The chunk is dirty while they differ.
#[derive(Clone, Debug)]
pub struct Chunk {
    index: ChunkIndex,
    tiles: Vec<Tile>,
    revision: u64,
    saved_revision: u64,
    attached: bool,
}

impl Chunk {
    /// All-path chunk at `index`.
    pub fn empty(index: ChunkIndex) -> Self {
        Self {
            index,
            tiles: vec![Tile::default(); CHUNK_AREA],
            revision: 0,
            saved_revision: 0,
            attached: false,
        }
    }

    /// Rebuild a clean chunk from a stored snapshot.
    pub fn from_snapshot(snapshot: ChunkSnapshot) -> Result<Self, InvalidSnapshot> {
        if snapshot.tiles.len() != CHUNK_AREA {
            return Err(InvalidSnapshot {
                index: snapshot.index,
                found: snapshot.tiles.len(),
            });
        }
        Ok(Self {
            index: snapshot.index,
            tiles: snapshot.tiles,
            revision: 0,
            saved_revision: 0,
            attached: false,
        })
    }

    /// Copy out the content.
    pub fn snapshot(&self) -> ChunkSnapshot {
        ChunkSnapshot {
            index: self.index,
            tiles: self.tiles.clone(),
        }
    }

    /// Chunk-space index.
    pub fn index(&self) -> ChunkIndex {
        self.index
    }

    /// Tile at an absolute position inside this chunk.
    pub fn tile(&self, position: Point) -> Option<&Tile> {
        if !self.index.contains(position) {
            return None;
        }
        self.tiles.get(local_slot(position.local_offset()))
    }

    /// Location at an absolute position inside this chunk.
    pub fn location(&self, position: Point) -> Option<Location> {
        self.tile(position).map(|tile| Location {
            position,
            tile: tile.clone(),
        })
    }

    /// Overwrite a tile. Returns false when `position` is outside the chunk.
    ///
    /// Does not touch the revision; callers that mutate committed state
    /// call [`Chunk::mark_modified`].
    pub fn set_tile(&mut self, position: Point, tile: Tile) -> bool {
        if !self.index.contains(position) {
            return false;
        }
        match self.tiles.get_mut(local_slot(position.local_offset())) {
            Some(slot) => {
                *slot = tile;
                true
            }
            None => false,
        }
    }

    /// Iterate `(absolute position, tile)` in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (Point, &Tile)> + '_ {
        let origin = self.index.origin();
        self.tiles.iter().enumerate().map(move |(i, tile)| {
            let i = i as i32;
            (origin + Point::new(i % CHUNK_SIZE, i / CHUNK_SIZE), tile)
        })
    }

    // ===== Dirty tracking =====

    /// Record a committed mutation.
    pub fn mark_modified(&mut self) {
        self.revision += 1;
    }

    /// Current revision.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Has anything changed since the last save?
    pub fn is_dirty(&self) -> bool {
        self.revision != self.saved_revision
    }

    /// Record that `revision` has been written to storage.
    ///
    /// Ignored if the chunk was modified again in the meantime, so the
    /// newer changes stay dirty.
    pub fn mark_saved(&mut self, revision: u64) {
        if revision == self.revision {
            self.saved_revision = revision;
        }
    }

    // ===== Attachment =====

    /// Whether the map currently has this chunk attached.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Set by the map on attach / detach.
    pub fn set_attached(&mut self, attached: bool) {
        self.attached = attached;
    }

    /// Content hash, independent of revision and attachment.
    pub fn content_hash(&self) -> ContentHash {
        let mut hasher = ContentHasher::new(HashDomain::Chunk);
        self.hash_into(&mut hasher);
        hasher.finish()
    }

    /// Feed index and all tiles into a hasher.
    pub fn hash_into(&self, hasher: &mut ContentHasher) {
        hasher.chunk_index(self.index);
        for tile in &self.tiles {
            tile.hash_into(hasher);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::Entity;

    #[test]
    fn test_every_local_offset_has_a_tile() {
        let chunk = Chunk::empty(ChunkIndex::new(-1, 2));
        let origin = chunk.index().origin();
        for y in 0..CHUNK_SIZE {
            for x in 0..CHUNK_SIZE {
                let tile = chunk.tile(origin + Point::new(x, y));
                assert_eq!(tile, Some(&Tile::path()));
            }
        }
        assert!(chunk.tile(origin + Point::new(CHUNK_SIZE, 0)).is_none());
        assert!(chunk.tile(origin + Point::new(-1, 0)).is_none());
    }

    #[test]
    fn test_iter_positions_match_tiles() {
        let mut chunk = Chunk::empty(ChunkIndex::new(1, -1));
        let p = Point::new(19, -3);
        assert!(chunk.set_tile(p, Tile::wall()));
        let found: Vec<_> = chunk.iter().filter(|(_, t)| **t == Tile::wall()).map(|(p, _)| p).collect();
        assert_eq!(found, vec![p]);
    }

    #[test]
    fn test_snapshot_roundtrip_and_validation() {
        let mut chunk = Chunk::empty(ChunkIndex::new(0, 0));
        chunk.set_tile(Point::new(3, 4), Tile::path().with_entity(Entity::Box));
        let snapshot = chunk.snapshot();
        assert_eq!(snapshot.tile_at(Point::new(3, 4)).and_then(|t| t.entity.clone()), Some(Entity::Box));

        let restored = Chunk::from_snapshot(snapshot.clone()).unwrap();
        assert_eq!(restored.content_hash(), chunk.content_hash());

        let mut short = snapshot;
        short.tiles.truncate(10);
        let err = Chunk::from_snapshot(short).unwrap_err();
        assert_eq!(err.found, 10);
    }

    #[test]
    fn test_dirty_tracking_survives_concurrent_edit() {
        let mut chunk = Chunk::empty(ChunkIndex::new(0, 0));
        assert!(!chunk.is_dirty());

        chunk.mark_modified();
        let saving = chunk.revision();
        chunk.mark_modified();
        chunk.mark_saved(saving);
        assert!(chunk.is_dirty());

        chunk.mark_saved(chunk.revision());
        assert!(!chunk.is_dirty());
    }

    #[test]
    fn test_content_hash_ignores_revision() {
        let mut a = Chunk::empty(ChunkIndex::new(2, 2));
        let b = Chunk::empty(ChunkIndex::new(2, 2));
        a.mark_modified();
        a.set_attached(true);
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), Chunk::empty(ChunkIndex::new(2, 3)).content_hash());
    }
}
