//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are JSON. Requests carry a client-chosen `request_id` that
//! the matching response echoes; pushed updates carry none.

use serde::{Serialize, Deserialize};

use crate::core::point::{ChunkIndex, Point};
use crate::game::chunk::ChunkSnapshot;
use crate::game::entity::{Entity, PlayerId};
use crate::game::events::{DespawnCause, MapEvent};
use crate::game::tile::{Tile, TileProperty};
use crate::game::transaction::MoveError;

/// Client-chosen request correlation id.
pub type RequestId = u64;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Identity presented on join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Player identifier.
    pub player_id: PlayerId,
    /// Name shown to other players.
    pub display_name: String,
    /// Bearer token, required when the server has auth configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ClientInfo {
    /// Unauthenticated identity.
    pub fn new(player_id: PlayerId, display_name: impl Into<String>) -> Self {
        Self {
            player_id,
            display_name: display_name.into(),
            token: None,
        }
    }

    /// Attach a bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// A request to move the sender's avatar one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRequest {
    /// Requesting player.
    pub player_id: PlayerId,
    /// Where the client believes its avatar stands.
    pub source: Point,
    /// Adjacent destination.
    pub target: Point,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Enter the world.
    Join {
        /// Correlation id
        request_id: RequestId,
        /// Who is joining
        info: ClientInfo,
    },

    /// Leave the world. The connection stays open.
    Leave {
        /// Correlation id
        request_id: RequestId,
    },

    /// Start receiving a chunk and its updates.
    LoadChunk {
        /// Correlation id
        request_id: RequestId,
        /// Chunk to stream
        index: ChunkIndex,
    },

    /// Stop receiving a chunk.
    UnloadChunk {
        /// Correlation id
        request_id: RequestId,
        /// Chunk to drop
        index: ChunkIndex,
    },

    /// Move the joined player's avatar.
    Move {
        /// Correlation id
        request_id: RequestId,
        /// Avatar position as the client sees it
        source: Point,
        /// Adjacent destination
        target: Point,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back
        timestamp: u64,
    },
}

impl ClientMessage {
    /// Correlation id, if this is a request that gets a response.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ClientMessage::Join { request_id, .. }
            | ClientMessage::Leave { request_id }
            | ClientMessage::LoadChunk { request_id, .. }
            | ClientMessage::UnloadChunk { request_id, .. }
            | ClientMessage::Move { request_id, .. } => Some(*request_id),
            ClientMessage::Ping { .. } => None,
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Player id already joined.
    DuplicatePlayer,
    /// Request names a player that is not joined.
    UnknownPlayer,
    /// Token missing or invalid.
    AuthFailed,
    /// No free tile near the spawn point.
    NoSpawnPosition,
    /// The target tile refuses the avatar.
    Blocked,
    /// A push chain could not be resolved.
    ChainUnresolvable,
    /// Source and target are not neighbours.
    NotAdjacent,
    /// The source tile does not hold the requester's avatar.
    NotYourEntity,
    /// A chunk the request needed could not be loaded.
    ChunkUnavailable,
    /// Unload for a chunk the player never loaded.
    NotSubscribed,
    /// The message could not be parsed or is not valid in this state.
    InvalidMessage,
    /// Anything else.
    InternalError,
}

impl From<&MoveError> for RejectReason {
    fn from(error: &MoveError) -> Self {
        match error {
            MoveError::Blocked { .. } | MoveError::Occupied(_) => RejectReason::Blocked,
            MoveError::ChainUnresolvable { .. } => RejectReason::ChainUnresolvable,
            MoveError::NotAdjacent { .. } => RejectReason::NotAdjacent,
            MoveError::EntityMismatch(_) | MoveError::Vacant(_) => RejectReason::NotYourEntity,
            MoveError::Unloaded(_) | MoveError::ChunkLoad(_) => RejectReason::ChunkUnavailable,
            MoveError::Finished(_) => RejectReason::InternalError,
        }
    }
}

/// Outcome of a move request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MoveResult {
    /// Committed; `effects` are every change it caused, in order.
    Accepted {
        /// Committed side effects
        effects: Vec<ClientUpdate>,
    },
    /// Refused; the world is unchanged.
    Rejected {
        /// Why
        reason: RejectReason,
    },
}

impl MoveResult {
    /// True if the move committed.
    pub fn is_accepted(&self) -> bool {
        matches!(self, MoveResult::Accepted { .. })
    }
}

/// Change pushed to a client for a chunk it has loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientUpdate {
    /// Full chunk contents; always the first update for a chunk.
    ChunkAdded {
        /// Snapshot taken at subscription time
        chunk: ChunkSnapshot,
    },
    /// The client no longer receives this chunk.
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
        /// Where
        position: Point,
        /// What
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

impl ClientUpdate {
    /// Wire form of a committed map event. Chunk lifecycle events are
    /// server-internal and have no client form.
    pub fn from_event(event: &MapEvent) -> Option<Self> {
        Some(match event.clone() {
            MapEvent::ChunkAdded { .. } | MapEvent::ChunkRemoved { .. } => return None,
            MapEvent::EntityMoved { from, to, entity } => ClientUpdate::EntityMoved { from, to, entity },
            MapEvent::EntitySpawned { position, entity } => ClientUpdate::EntitySpawned { position, entity },
            MapEvent::EntityDespawned { position, entity, cause } => {
                ClientUpdate::EntityDespawned { position, entity, cause }
            }
            MapEvent::TilePropertyChanged { position, property, tile } => {
                ClientUpdate::TilePropertyChanged { position, property, tile }
            }
        })
    }
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join accepted.
    Joined {
        /// Correlation id
        request_id: RequestId,
        /// Where the avatar was placed
        spawn: Point,
    },

    /// Leave completed.
    Left {
        /// Correlation id
        request_id: RequestId,
    },

    /// Chunk subscription active. Its contents arrive as a
    /// [`ClientUpdate::ChunkAdded`] ahead of this response.
    ChunkLoaded {
        /// Correlation id
        request_id: RequestId,
        /// Chunk index
        index: ChunkIndex,
    },

    /// Chunk subscription dropped.
    ChunkUnloaded {
        /// Correlation id
        request_id: RequestId,
        /// Chunk index
        index: ChunkIndex,
    },

    /// Move outcome.
    MoveResult {
        /// Correlation id
        request_id: RequestId,
        /// Accepted or rejected
        result: MoveResult,
    },

    /// Request refused.
    Rejected {
        /// Correlation id
        request_id: RequestId,
        /// Machine-readable reason
        reason: RejectReason,
        /// Human-readable detail
        message: String,
    },

    /// Pushed world change.
    Update {
        /// The change
        update: ClientUpdate,
    },

    /// Pong response.
    Pong {
        /// Client timestamp from the ping
        timestamp: u64,
        /// Server time in milliseconds
        server_time: u64,
    },

    /// Unsolicited error, e.g. an unparseable message.
    Error {
        /// Machine-readable reason
        reason: RejectReason,
        /// Human-readable detail
        message: String,
    },

    /// Server is going away.
    Shutdown {
        /// Why
        reason: String,
    },
}

impl ServerMessage {
    /// Correlation id if this answers a request.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ServerMessage::Joined { request_id, .. }
            | ServerMessage::Left { request_id }
            | ServerMessage::ChunkLoaded { request_id, .. }
            | ServerMessage::ChunkUnloaded { request_id, .. }
            | ServerMessage::MoveResult { request_id, .. }
            | ServerMessage::Rejected { request_id, .. } => Some(*request_id),
            ServerMessage::Update { .. }
            | ServerMessage::Pong { .. }
            | ServerMessage::Error { .. }
            | ServerMessage::Shutdown { .. } => None,
        }
    }

    /// Rejection response.
    pub fn rejected(request_id: RequestId, reason: RejectReason, message: impl Into<String>) -> Self {
        ServerMessage::Rejected {
            request_id,
            reason,
            message: message.into(),
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
