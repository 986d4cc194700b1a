//! Grid Geometry
//!
//! Integer points, the four cardinal directions, and chunk addressing.
//! All chunk math uses floor semantics so negative coordinates map into
//! the chunk to their south-west rather than folding onto chunk zero.

use std::fmt;
use std::ops::{Add, Neg, Sub};
use serde::{Serialize, Deserialize};

/// Side length of a chunk, in tiles.
pub const CHUNK_SIZE: i32 = 16;

/// Number of tiles held by one chunk.
pub const CHUNK_AREA: usize = (CHUNK_SIZE * CHUNK_SIZE) as usize;

/// Absolute integer position on the world grid.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    /// X coordinate (grows eastward)
    pub x: i32,
    /// Y coordinate (grows northward)
    pub y: i32,
}

impl Point {
    /// The origin.
    pub const ZERO: Self = Self { x: 0, y: 0 };

    /// Create a new point.
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Floor division of both components.
    ///
    /// `(-1, 17).div_floor(16) == (-1, 1)`.
    #[inline]
    pub fn div_floor(self, divisor: i32) -> Self {
        Self {
            x: self.x.div_euclid(divisor),
            y: self.y.div_euclid(divisor),
        }
    }

    /// Floor modulo of both components, always in `0..divisor`.
    #[inline]
    pub fn rem_floor(self, divisor: i32) -> Self {
        Self {
            x: self.x.rem_euclid(divisor),
            y: self.y.rem_euclid(divisor),
        }
    }

    /// Step one tile in a direction. Overflows at the edge of the grid;
    /// use [`checked_step`](Self::checked_step) for positions a client chose.
    #[inline]
    pub fn step(self, direction: Direction) -> Self {
        self + direction.offset()
    }

    /// Step one tile, or `None` past the edge of the grid.
    #[inline]
    pub fn checked_step(self, direction: Direction) -> Option<Self> {
        let offset = direction.offset();
        Some(Self::new(self.x.checked_add(offset.x)?, self.y.checked_add(offset.y)?))
    }

    /// Manhattan distance to another point.
    #[inline]
    pub fn manhattan(self, other: Self) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }

    /// Chessboard distance to another point.
    #[inline]
    pub fn chebyshev(self, other: Self) -> u32 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }

    /// Index of the chunk holding this point.
    #[inline]
    pub fn chunk_index(self) -> ChunkIndex {
        let p = self.div_floor(CHUNK_SIZE);
        ChunkIndex::new(p.x, p.y)
    }

    /// Offset of this point inside its chunk.
    #[inline]
    pub fn local_offset(self) -> Point {
        self.rem_floor(CHUNK_SIZE)
    }
}

impl Add for Point {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Neg for Point {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

impl fmt::Debug for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Point({}, {})", self.x, self.y)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

// =============================================================================
// DIRECTION
// =============================================================================

/// One of the four cardinal unit steps.
///
/// "No direction" is expressed as `Option<Direction>::None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// +Y
    North,
    /// +X
    East,
    /// -Y
    South,
    /// -X
    West,
}

impl Direction {
    /// All directions, clockwise from north.
    pub const ALL: [Direction; 4] = [
        Direction::North,
        Direction::East,
        Direction::South,
        Direction::West,
    ];

    /// Unit offset for this direction.
    #[inline]
    pub const fn offset(self) -> Point {
        match self {
            Direction::North => Point::new(0, 1),
            Direction::East => Point::new(1, 0),
            Direction::South => Point::new(0, -1),
            Direction::West => Point::new(-1, 0),
        }
    }

    /// Direction pointing the other way.
    #[inline]
    pub const fn opposite(self) -> Self {
        match self {
            Direction::North => Direction::South,
            Direction::East => Direction::West,
            Direction::South => Direction::North,
            Direction::West => Direction::East,
        }
    }

    /// Map a unit offset back to a direction.
    pub fn from_offset(offset: Point) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.offset() == offset)
    }

    /// Direction of a single orthogonal step from `from` to `to`, if it is one.
    pub fn between(from: Point, to: Point) -> Option<Self> {
        let dx = i64::from(to.x) - i64::from(from.x);
        let dy = i64::from(to.y) - i64::from(from.y);
        match (dx, dy) {
            (0, 1) => Some(Direction::North),
            (1, 0) => Some(Direction::East),
            (0, -1) => Some(Direction::South),
            (-1, 0) => Some(Direction::West),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Direction::North => "north",
            Direction::East => "east",
            Direction::South => "south",
            Direction::West => "west",
        };
        f.write_str(name)
    }
}

// =============================================================================
// CHUNK INDEX
// =============================================================================

/// Position of a chunk in chunk space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ChunkIndex {
    /// Chunk column
    pub x: i32,
    /// Chunk row
    pub y: i32,
}

impl ChunkIndex {
    /// Create a new chunk index.
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Chunk holding a world position.
    #[inline]
    pub fn containing(position: Point) -> Self {
        position.chunk_index()
    }

    /// World position of the chunk's (0, 0) tile. Only meaningful for
    /// indices inside the grid, see [`checked_origin`](Self::checked_origin).
    #[inline]
    pub fn origin(self) -> Point {
        Point::new(self.x * CHUNK_SIZE, self.y * CHUNK_SIZE)
    }

    /// Origin tile, or `None` when the chunk lies outside the `i32` grid.
    #[inline]
    pub fn checked_origin(self) -> Option<Point> {
        Some(Point::new(self.x.checked_mul(CHUNK_SIZE)?, self.y.checked_mul(CHUNK_SIZE)?))
    }

    /// Whether every tile of this chunk has an `i32` position.
    #[inline]
    pub fn in_world(self) -> bool {
        self.checked_origin().is_some()
    }

    /// World position of a local offset inside this chunk.
    #[inline]
    pub fn world_position(self, local: Point) -> Point {
        self.origin() + local
    }

    /// Whether a world position falls inside this chunk.
    #[inline]
    pub fn contains(self, position: Point) -> bool {
        position.chunk_index() == self
    }

    /// All chunk indices in the square of the given radius around `self`,
    /// row by row.
    /// Indices that would leave `i32` are skipped.
    pub fn square(self, radius: u32) -> impl Iterator<Item = ChunkIndex> {
        let r = radius.min(i32::MAX as u32) as i32;
        (-r..=r).flat_map(move |dy| {
            (-r..=r).filter_map(move |dx| Some(ChunkIndex::new(self.x.checked_add(dx)?, self.y.checked_add(dy)?)))
        })
    }
}

impl fmt::Debug for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk[{}, {}]", self.x, self.y)
    }
}

impl fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.y)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_chunk_index_negative() {
        assert_eq!(Point::new(-1, -1).chunk_index(), ChunkIndex::new(-1, -1));
        assert_eq!(Point::new(-16, 0).chunk_index(), ChunkIndex::new(-1, 0));
        assert_eq!(Point::new(-17, 15).chunk_index(), ChunkIndex::new(-2, 0));
        assert_eq!(Point::new(-1, 17).local_offset(), Point::new(15, 1));
    }

    #[test]
    fn test_direction_offsets() {
        let origin = Point::ZERO;
        for dir in Direction::ALL {
            let next = origin.step(dir);
            assert_eq!(Direction::between(origin, next), Some(dir));
            assert_eq!(next.step(dir.opposite()), origin);
        }
        assert_eq!(Direction::between(origin, Point::new(1, 1)), None);
        assert_eq!(Direction::between(origin, Point::new(0, 2)), None);
        assert_eq!(Direction::between(origin, origin), None);
    }

    #[test]
    fn test_far_apart_points_are_not_adjacent() {
        assert_eq!(Direction::between(Point::new(-1, 0), Point::new(i32::MAX, 0)), None);
        assert_eq!(Direction::between(Point::new(i32::MIN, 0), Point::new(i32::MAX, 0)), None);
        assert_eq!(
            Direction::between(Point::new(i32::MAX - 1, 0), Point::new(i32::MAX, 0)),
            Some(Direction::East)
        );
    }

    #[test]
    fn test_checked_step_stops_at_grid_edge() {
        let edge = Point::new(i32::MAX, i32::MIN);
        assert_eq!(edge.checked_step(Direction::East), None);
        assert_eq!(edge.checked_step(Direction::South), None);
        assert_eq!(edge.checked_step(Direction::West), Some(Point::new(i32::MAX - 1, i32::MIN)));
        assert_eq!(edge.checked_step(Direction::North), Some(Point::new(i32::MAX, i32::MIN + 1)));
    }

    #[test]
    fn test_chunk_indices_outside_grid() {
        let last = Point::new(i32::MAX, i32::MIN).chunk_index();
        assert!(last.in_world());
        assert_eq!(last.checked_origin(), Some(Point::new(i32::MAX - (CHUNK_SIZE - 1), i32::MIN)));
        assert!(!ChunkIndex::new(last.x + 1, 0).in_world());
        assert!(!ChunkIndex::new(0, last.y - 1).in_world());
        assert!(!ChunkIndex::new(i32::MAX, i32::MAX).in_world());
    }

    #[test]
    fn test_square_skips_indices_past_the_edge() {
        assert_eq!(ChunkIndex::new(i32::MAX, 0).square(1).count(), 6);
    }

    #[test]
    fn test_square_iteration() {
        let all: Vec<_> = ChunkIndex::new(0, 0).square(1).collect();
        assert_eq!(all.len(), 9);
        assert_eq!(all[0], ChunkIndex::new(-1, -1));
        assert_eq!(all[8], ChunkIndex::new(1, 1));
    }

    proptest! {
        #[test]
        fn prop_chunk_roundtrip(x in -100_000i32..100_000, y in -100_000i32..100_000) {
            let p = Point::new(x, y);
            let index = p.chunk_index();
            let local = p.local_offset();
            prop_assert!(local.x >= 0 && local.x < CHUNK_SIZE);
            prop_assert!(local.y >= 0 && local.y < CHUNK_SIZE);
            prop_assert_eq!(index.world_position(local), p);
            prop_assert!(index.contains(p));
        }
    }
}
