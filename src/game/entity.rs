//! Entity Definitions
//!
//! Movable occupants of tiles. Each variant declares how it reacts to
//! moving and how it reacts to something else wanting its tile.

use std::fmt;
use serde::{Serialize, Deserialize};

use crate::core::hash::ContentHasher;
use crate::core::point::Direction;

// =============================================================================
// PLAYER ID
// =============================================================================

/// Unique player identifier (UUID as bytes).
///
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Default)]
pub struct PlayerId(pub [u8; 16]);

impl PlayerId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Fresh random id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    /// Create from UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s)
            .ok()
            .map(|u| Self(*u.as_bytes()))
    }

    /// Convert to UUID string.
    pub fn to_uuid_string(&self) -> String {
        uuid::Uuid::from_bytes(self.0).to_string()
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First four bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlayerId({})", self.short())
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uuid_string())
    }
}

// =============================================================================
// COLOR
// =============================================================================

/// Paint color carried by balloons, ink and pins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Color {
    /// Red paint.
    Red = 0,
    /// Orange paint.
    Orange = 1,
    /// Yellow paint.
    Yellow = 2,
    /// Green paint.
    Green = 3,
    /// Blue paint.
    Blue = 4,
    /// Purple paint.
    Purple = 5,
}

impl Color {
    /// Get color from index (0-5).
    pub fn from_index(index: u8) -> Option<Color> {
        match index {
            0 => Some(Color::Red),
            1 => Some(Color::Orange),
            2 => Some(Color::Yellow),
            3 => Some(Color::Green),
            4 => Some(Color::Blue),
            5 => Some(Color::Purple),
            _ => None,
        }
    }
}

// =============================================================================
// ENTITY
// =============================================================================

/// Kind tag of an entity, without its state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EntityKind {
    /// [`Entity::Player`]
    Player = 0,
    /// [`Entity::Box`]
    Box = 1,
    /// [`Entity::Balloon`]
    Balloon = 2,
    /// [`Entity::Coin`]
    Coin = 3,
    /// [`Entity::Piston`]
    Piston = 4,
}

/// What happens to an occupant when another entity wants its tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Displacement {
    /// Occupant is shoved one step further in the same direction.
    Push,
    /// Occupant is removed from the map and the mover takes its place.
    Collect,
    /// Occupant refuses to leave.
    Block,
}

/// A movable occupant of a tile.
///
/// An empty tile holds `None`; there is no stored "null" entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    /// A connected player's avatar.
    Player {
        /// Owning player
        id: PlayerId,
        /// Direction of the last step taken
        facing: Direction,
    },
    /// Pushable crate.
    Box,
    /// Pushable balloon; pins pop it, ink repaints it.
    Balloon {
        /// Current paint
        color: Color,
    },
    /// Collectible coin.
    Coin,
    /// Fixed piston.
    Piston {
        /// Direction the piston head points, if extended
        extension: Option<Direction>,
    },
}

impl Entity {
    /// Player avatar facing the default direction.
    pub fn player(id: PlayerId) -> Self {
        Entity::Player { id, facing: Direction::South }
    }

    /// Balloon of a color.
    pub fn balloon(color: Color) -> Self {
        Entity::Balloon { color }
    }

    /// Kind tag.
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Player { .. } => EntityKind::Player,
            Entity::Box => EntityKind::Box,
            Entity::Balloon { .. } => EntityKind::Balloon,
            Entity::Coin => EntityKind::Coin,
            Entity::Piston { .. } => EntityKind::Piston,
        }
    }

    /// Owning player, for avatars.
    pub fn player_id(&self) -> Option<PlayerId> {
        match self {
            Entity::Player { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Is this the avatar of `player`?
    pub fn is_player(&self, player: PlayerId) -> bool {
        self.player_id() == Some(player)
    }

    /// React to being the subject of a move.
    pub fn on_moved(&mut self, direction: Direction) {
        if let Entity::Player { facing, .. } = self {
            *facing = direction;
        }
    }

    /// How this entity reacts when `mover` wants its tile.
    pub fn displaced_by(&self, mover: &Entity) -> Displacement {
        match self {
            Entity::Box | Entity::Balloon { .. } => Displacement::Push,
            Entity::Coin => match mover {
                Entity::Player { .. } => Displacement::Collect,
                _ => Displacement::Block,
            },
            Entity::Player { .. } | Entity::Piston { .. } => Displacement::Block,
        }
    }

    /// Hash this entity's state.
    pub fn hash_into(&self, hasher: &mut ContentHasher) {
        hasher.tag(self.kind() as u8);
        match self {
            Entity::Player { id, facing } => {
                hasher.player(&id.0);
                hasher.tag(*facing as u8);
            }
            Entity::Balloon { color } => hasher.tag(*color as u8),
            Entity::Piston { extension } => {
                hasher.tag(extension.map_or(0xff, |d| d as u8));
            }
            Entity::Box | Entity::Coin => {}
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
