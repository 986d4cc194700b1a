//! Content Hashing
//!
//! SHA-256 fingerprints of world content. Two equal hashes mean equal
//! tiles and occupants; revision counters and attachment flags are never
//! fed in. Used to prove an aborted move left the map untouched and to tag
//! chunk writes in logs.

use std::fmt;

use sha2::{Sha256, Digest};
use super::point::{ChunkIndex, Point};

/// What is being hashed. Each domain seeds the digest differently so a
/// chunk and a world with the same bytes never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashDomain {
    /// One chunk.
    Chunk,
    /// Every loaded chunk, in index order.
    World,
}

impl HashDomain {
    fn seed(self) -> &'static [u8] {
        match self {
            HashDomain::Chunk => b"gridlock/chunk/v1",
            HashDomain::World => b"gridlock/world/v1",
        }
    }
}

/// 256-bit content fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Raw digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First four bytes as hex.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

/// Streaming hasher for grid content. Feed order is part of the hash.
pub struct ContentHasher {
    digest: Sha256,
}

impl ContentHasher {
    /// Hasher seeded for `domain`.
    pub fn new(domain: HashDomain) -> Self {
        let mut digest = Sha256::new();
        digest.update(domain.seed());
        Self { digest }
    }

    /// Variant discriminant or small enum value.
    #[inline]
    pub fn tag(&mut self, value: u8) {
        self.digest.update([value]);
    }

    /// Boolean state.
    #[inline]
    pub fn flag(&mut self, value: bool) {
        self.tag(value as u8);
    }

    /// Length prefix for a variable-size list.
    #[inline]
    pub fn count(&mut self, len: usize) {
        self.digest.update((len as u64).to_le_bytes());
    }

    /// Absolute position.
    #[inline]
    pub fn point(&mut self, point: Point) {
        self.digest.update(point.x.to_le_bytes());
        self.digest.update(point.y.to_le_bytes());
    }

    /// Chunk index, fed as its origin tile.
    #[inline]
    pub fn chunk_index(&mut self, index: ChunkIndex) {
        self.point(index.origin());
    }

    /// Player id bytes.
    #[inline]
    pub fn player(&mut self, id: &[u8; 16]) {
        self.digest.update(id);
    }

    /// Finish the digest.
    pub fn finish(self) -> ContentHash {
        ContentHash(self.digest.finalize().into())
    }
}

// =============================================================================
// TESTS
// =============================================================================
