//! # Gridlock World Server
//!
//! Authoritative server for a shared, unbounded tile-puzzle world.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    GRIDLOCK SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/             - Grid primitives                         │
//! │  ├── point.rs      - Points, directions, chunk indices       │
//! │  └── hash.rs       - Content hashing                         │
//! │                                                              │
//! │  game/             - The world                               │
//! │  ├── tile.rs       - Tiles and movement rules                │
//! │  ├── chunk.rs      - 16x16 tile chunks                       │
//! │  ├── loader.rs     - Reference-counted chunk cache           │
//! │  ├── transaction.rs- Move resolution and commit              │
//! │  ├── map.rs        - Authoritative map                       │
//! │  └── storage.rs    - Persistence                             │
//! │                                                              │
//! │  network/          - Sessions and transport                  │
//! │  ├── server.rs     - Join, leave, chunks, moves              │
//! │  ├── session.rs    - Per-player state and update routing     │
//! │  ├── websocket.rs  - WebSocket listener                      │
//! │  ├── client.rs     - Client-side mirror                      │
//! │  └── remote.rs     - WebSocket client stub                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering Guarantee
//!
//! Every accepted move commits under one lock and is published to
//! subscribers before the lock is released. Two clients watching the same
//! chunk therefore observe the same changes in the same order, and a
//! client's own move effects arrive before the move's response.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use core::point::{ChunkIndex, Direction, Point, CHUNK_SIZE};
pub use game::entity::{Entity, PlayerId};
pub use game::map::Map;
pub use network::server::{GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
