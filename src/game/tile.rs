//! Tile Definitions
//!
//! Tiles are the terrain and mechanisms of the grid. Every tile variant
//! answers the same three questions for the transaction engine:
//!
//! - `accepts`   - may this entity enter at all?
//! - `departure` - what happens when the occupant leaves?
//! - `arrival`   - what happens when an entity arrives?
//!
//! The answers are plain data ([`Arrival`], [`Departure`]); the engine
//! applies them, so cascades stay inside one transaction.

use serde::{Serialize, Deserialize};

use crate::core::hash::ContentHasher;
use crate::core::point::Point;
use crate::game::entity::{Color, Entity, EntityKind};

/// Which occupants press a button.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TriggerFilter {
    /// Any entity presses it.
    Anything = 0,
    /// Only player avatars.
    PlayersOnly = 1,
    /// Anything except player avatars.
    ObjectsOnly = 2,
}

impl TriggerFilter {
    /// Does this entity press the button?
    pub fn admits(self, entity: &Entity) -> bool {
        let is_player = entity.kind() == EntityKind::Player;
        match self {
            TriggerFilter::Anything => true,
            TriggerFilter::PlayersOnly => is_player,
            TriggerFilter::ObjectsOnly => !is_player,
        }
    }
}

/// Observable per-tile properties, used as subscription keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileProperty {
    /// The occupant changed (moved in, moved out, spawned, despawned).
    Entity,
    /// A button was pressed or released.
    Pressed,
    /// A gate opened or closed.
    Open,
    /// An ink tile was used up.
    Consumed,
}

impl TileProperty {
    /// Wire / log name.
    pub fn as_str(self) -> &'static str {
        match self {
            TileProperty::Entity => "entity",
            TileProperty::Pressed => "pressed",
            TileProperty::Open => "open",
            TileProperty::Consumed => "consumed",
        }
    }
}

/// Terrain variant with its mechanism state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TileKind {
    /// Plain walkable floor. The default for unwritten cells.
    Path,
    /// Never enterable.
    Wall,
    /// Toggles its linked gates when pressed or released.
    Button {
        /// Currently held down by an eligible occupant
        pressed: bool,
        /// Who can press it
        filter: TriggerFilter,
        /// Gates toggled on every press and release
        gates: Vec<Point>,
    },
    /// Enterable only while open.
    Gate {
        /// Open state
        open: bool,
    },
    /// Repaints the first balloon to cross it, then is spent.
    Ink {
        /// Paint color
        color: Color,
        /// Already used
        consumed: bool,
    },
    /// Pops balloons not painted its own color.
    Pin {
        /// Safe color
        color: Color,
    },
    /// Sends arrivals to the other teleporter on the same channel.
    Teleporter {
        /// Pairing channel
        channel: u8,
    },
}

/// What arriving on a tile does to the arriving entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arrival {
    /// Entity simply occupies the tile.
    Occupy,
    /// Entity occupies the tile and presses the button.
    Press,
    /// Entity is repainted, occupies the tile, and the ink is spent.
    Recolor(Color),
    /// Entity is removed from the map instead of occupying the tile.
    Pop,
    /// Entity continues to the partner teleporter on this channel.
    Teleport(u8),
}

/// What leaving a tile does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Departure {
    /// Nothing.
    Leave,
    /// The button is released.
    Release,
}

impl TileKind {
    /// Short variant name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            TileKind::Path => "path",
            TileKind::Wall => "wall",
            TileKind::Button { .. } => "button",
            TileKind::Gate { .. } => "gate",
            TileKind::Ink { .. } => "ink",
            TileKind::Pin { .. } => "pin",
            TileKind::Teleporter { .. } => "teleporter",
        }
    }

    /// May `entity` enter this tile right now?
    ///
    /// Gates are only consulted here, at the moment of entry; a gate that
    /// closes on an occupant does not evict it.
    pub fn accepts(&self, _entity: &Entity) -> bool {
        match self {
            TileKind::Wall => false,
            TileKind::Gate { open } => *open,
            _ => true,
        }
    }

    /// Effect of `entity` arriving here.
    pub fn arrival(&self, entity: &Entity) -> Arrival {
        match self {
            TileKind::Button { pressed: false, filter, .. } if filter.admits(entity) => Arrival::Press,
            TileKind::Ink { color, consumed: false } if entity.kind() == EntityKind::Balloon => {
                Arrival::Recolor(*color)
            }
            TileKind::Pin { color } => match entity {
                Entity::Balloon { color: paint } if paint != color => Arrival::Pop,
                _ => Arrival::Occupy,
            },
            TileKind::Teleporter { channel } => Arrival::Teleport(*channel),
            _ => Arrival::Occupy,
        }
    }

    /// Effect of `entity` leaving (or being removed from) this tile.
    pub fn departure(&self, entity: &Entity) -> Departure {
        match self {
            TileKind::Button { pressed: true, filter, .. } if filter.admits(entity) => Departure::Release,
            _ => Departure::Leave,
        }
    }

    /// Linked gate positions, for buttons.
    pub fn linked_gates(&self) -> &[Point] {
        match self {
            TileKind::Button { gates, .. } => gates,
            _ => &[],
        }
    }

    /// Teleporter channel, if this is a teleporter.
    pub fn teleporter_channel(&self) -> Option<u8> {
        match self {
            TileKind::Teleporter { channel } => Some(*channel),
            _ => None,
        }
    }

    /// Hash this tile's mechanism state.
    pub fn hash_into(&self, hasher: &mut ContentHasher) {
        match self {
            TileKind::Path => hasher.tag(0),
            TileKind::Wall => hasher.tag(1),
            TileKind::Button { pressed, filter, gates } => {
                hasher.tag(2);
                hasher.flag(*pressed);
                hasher.tag(*filter as u8);
                hasher.count(gates.len());
                for gate in gates {
                    hasher.point(*gate);
                }
            }
            TileKind::Gate { open } => {
                hasher.tag(3);
                hasher.flag(*open);
            }
            TileKind::Ink { color, consumed } => {
                hasher.tag(4);
                hasher.tag(*color as u8);
                hasher.flag(*consumed);
            }
            TileKind::Pin { color } => {
                hasher.tag(5);
                hasher.tag(*color as u8);
            }
            TileKind::Teleporter { channel } => {
                hasher.tag(6);
                hasher.tag(*channel);
            }
        }
    }
}

/// One grid cell's content: terrain plus at most one occupant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    /// Terrain variant
    pub kind: TileKind,
    /// Occupant, if any
    pub entity: Option<Entity>,
}

impl Default for Tile {
    fn default() -> Self {
        Self::path()
    }
}

impl Tile {
    /// Empty tile of a kind.
    pub fn new(kind: TileKind) -> Self {
        Self { kind, entity: None }
    }

    /// Empty path tile.
    pub fn path() -> Self {
        Self::new(TileKind::Path)
    }

    /// Wall tile.
    pub fn wall() -> Self {
        Self::new(TileKind::Wall)
    }

    /// Released button linked to `gates`.
    pub fn button(filter: TriggerFilter, gates: Vec<Point>) -> Self {
        Self::new(TileKind::Button { pressed: false, filter, gates })
    }

    /// Gate in the given state.
    pub fn gate(open: bool) -> Self {
        Self::new(TileKind::Gate { open })
    }

    /// Fresh ink of a color.
    pub fn ink(color: Color) -> Self {
        Self::new(TileKind::Ink { color, consumed: false })
    }

    /// Pin of a color.
    pub fn pin(color: Color) -> Self {
        Self::new(TileKind::Pin { color })
    }

    /// Teleporter on a channel.
    pub fn teleporter(channel: u8) -> Self {
        Self::new(TileKind::Teleporter { channel })
    }

    /// Same tile with an occupant.
    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Is the tile unoccupied?
    pub fn is_vacant(&self) -> bool {
        self.entity.is_none()
    }

    /// Free and enterable by `entity`.
    pub fn can_host(&self, entity: &Entity) -> bool {
        self.is_vacant() && self.kind.accepts(entity)
    }

    /// Hash terrain and occupant.
    pub fn hash_into(&self, hasher: &mut ContentHasher) {
        self.kind.hash_into(hasher);
        match &self.entity {
            Some(entity) => {
                hasher.flag(true);
                entity.hash_into(hasher);
            }
            None => hasher.flag(false),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::PlayerId;

    fn player() -> Entity {
        Entity::player(PlayerId::new([7; 16]))
    }

    #[test]
    fn test_walls_and_gates() {
        assert!(!TileKind::Wall.accepts(&player()));
        assert!(!TileKind::Gate { open: false }.accepts(&player()));
        assert!(TileKind::Gate { open: true }.accepts(&Entity::Box));
        assert!(TileKind::Path.accepts(&Entity::Coin));
    }

    #[test]
    fn test_button_filters() {
        let players_only = TileKind::Button {
            pressed: false,
            filter: TriggerFilter::PlayersOnly,
            gates: vec![],
        };
        assert_eq!(players_only.arrival(&player()), Arrival::Press);
        assert_eq!(players_only.arrival(&Entity::Box), Arrival::Occupy);

        let objects_only = TileKind::Button {
            pressed: true,
            filter: TriggerFilter::ObjectsOnly,
            gates: vec![],
        };
        assert_eq!(objects_only.departure(&Entity::Box), Departure::Release);
        assert_eq!(objects_only.departure(&player()), Departure::Leave);
        // Already pressed: a second arrival does not press again
        assert_eq!(objects_only.arrival(&Entity::Box), Arrival::Occupy);
    }

    #[test]
    fn test_ink_only_paints_balloons_once() {
        let fresh = TileKind::Ink { color: Color::Green, consumed: false };
        let spent = TileKind::Ink { color: Color::Green, consumed: true };
        assert_eq!(fresh.arrival(&Entity::balloon(Color::Red)), Arrival::Recolor(Color::Green));
        assert_eq!(fresh.arrival(&Entity::Box), Arrival::Occupy);
        assert_eq!(spent.arrival(&Entity::balloon(Color::Red)), Arrival::Occupy);
    }

    #[test]
    fn test_pin_spares_matching_balloons() {
        let pin = TileKind::Pin { color: Color::Blue };
        assert_eq!(pin.arrival(&Entity::balloon(Color::Red)), Arrival::Pop);
        assert_eq!(pin.arrival(&Entity::balloon(Color::Blue)), Arrival::Occupy);
        assert_eq!(pin.arrival(&player()), Arrival::Occupy);
    }

    #[test]
    fn test_can_host() {
        assert!(Tile::path().can_host(&Entity::Box));
        assert!(!Tile::path().with_entity(Entity::Coin).can_host(&Entity::Box));
        assert!(!Tile::wall().can_host(&Entity::Box));
        assert_eq!(Tile::default(), Tile::path());
    }
}
