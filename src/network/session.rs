//! Client Sessions
//!
//! Per-player server state: the outbound queue, the set of chunks the
//! player receives, and the last known avatar position. The registry is
//! the map's event sink and routes each committed event to every session
//! whose chunk set it touches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::trace;

use crate::core::point::{ChunkIndex, Point};
use crate::game::chunk::ChunkSnapshot;
use crate::game::entity::PlayerId;
use crate::game::events::MapEvent;
use crate::game::map::EventSink;
use crate::network::protocol::{ClientUpdate, ServerMessage};

/// Outbound queue feeding one client.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// One joined player.
#[derive(Debug)]
pub struct ClientSession {
    /// Player identifier.
    pub player_id: PlayerId,
    /// Display name.
    pub display_name: String,
    /// Where updates go.
    pub outbound: Outbound,
    /// Chunks this client receives.
    pub chunks: BTreeSet<ChunkIndex>,
    /// Avatar position as of the last commit the server saw.
    pub last_position: Option<Point>,
    /// When the join was accepted.
    pub joined_at: Instant,
}

impl ClientSession {
    /// New session with no chunks.
    pub fn new(player_id: PlayerId, display_name: impl Into<String>, outbound: Outbound) -> Self {
        Self {
            player_id,
            display_name: display_name.into(),
            outbound,
            chunks: BTreeSet::new(),
            last_position: None,
            joined_at: Instant::now(),
        }
    }

    /// Queue a message. A closed queue means the client is gone; the
    /// server notices on disconnect.
    pub fn send(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }

    /// True if any of `chunks` is loaded by this client.
    pub fn interested_in(&self, chunks: &[ChunkIndex]) -> bool {
        chunks.iter().any(|c| self.chunks.contains(c))
    }
}

/// All joined players, keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<PlayerId, ClientSession>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Fails, returning it, if the id is taken.
    pub fn insert(&self, session: ClientSession) -> Result<(), ClientSession> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&session.player_id) {
            return Err(session);
        }
        sessions.insert(session.player_id, session);
        Ok(())
    }

    /// Remove and return a session.
    pub fn remove(&self, player: PlayerId) -> Option<ClientSession> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner).remove(&player)
    }

    /// True if `player` is joined.
    pub fn contains(&self, player: PlayerId) -> bool {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).contains_key(&player)
    }

    /// Number of joined players.
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if nobody is joined.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Joined player ids, ascending.
    pub fn players(&self) -> Vec<PlayerId> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).keys().copied().collect()
    }

    /// Chunks `player` receives.
    pub fn chunks_of(&self, player: PlayerId) -> Option<BTreeSet<ChunkIndex>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&player)
            .map(|s| s.chunks.clone())
    }

    /// Last known avatar position.
    pub fn position_of(&self, player: PlayerId) -> Option<Point> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&player)
            .and_then(|s| s.last_position)
    }

    /// Start streaming a chunk to `player`, queueing its snapshot first.
    ///
    /// Returns `None` if the player is not joined, otherwise whether the
    /// chunk was newly added to its set. Must run where no commit can
    /// publish between the snapshot and this call.
    pub fn add_chunk(&self, player: PlayerId, snapshot: &ChunkSnapshot) -> Option<bool> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let session = sessions.get_mut(&player)?;
        let added = session.chunks.insert(snapshot.index);
        session.send(ServerMessage::Update {
            update: ClientUpdate::ChunkAdded { chunk: snapshot.clone() },
        });
        Some(added)
    }

    /// Stop streaming a chunk to `player`. Returns false if it was not
    /// streaming.
    pub fn remove_chunk(&self, player: PlayerId, index: ChunkIndex) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let Some(session) = sessions.get_mut(&player) else {
            return false;
        };
        if !session.chunks.remove(&index) {
            return false;
        }
        session.send(ServerMessage::Update {
            update: ClientUpdate::ChunkRemoved { index },
        });
        true
    }

    /// Send `message` to every session.
    pub fn broadcast(&self, message: &ServerMessage) {
        for session in self.sessions.read().unwrap_or_else(PoisonError::into_inner).values() {
            session.send(message.clone());
        }
    }
}

impl EventSink for SessionRegistry {
    fn publish(&self, events: &[MapEvent]) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        for event in events {
            let Some(update) = ClientUpdate::from_event(event) else {
                continue;
            };
            // Avatars also move when pushed by someone else.
            let landed = match event {
                MapEvent::EntityMoved { to, entity, .. } => entity.player_id().map(|id| (id, *to)),
                MapEvent::EntitySpawned { position, entity } => entity.player_id().map(|id| (id, *position)),
                _ => None,
            };
            if let Some((id, at)) = landed {
                if let Some(session) = sessions.get_mut(&id) {
                    session.last_position = Some(at);
                }
            }

            let chunks = event.chunks();
            for session in sessions.values().filter(|s| s.interested_in(&chunks)) {
                trace!(player = %session.player_id.short(), ?update, "Routing update");
                session.send(ServerMessage::Update { update: update.clone() });
            }
        }
    }
}
