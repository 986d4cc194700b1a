//! Network Layer
//!
//! Sessions, the request handlers, and both ends of the WebSocket link.
//! All world changes go through `game::map`; this layer only routes.

pub mod auth;
pub mod protocol;
pub mod session;
pub mod server;
pub mod websocket;
pub mod client;
pub mod remote;

pub use auth::{AuthConfig, AuthError, JoinClaims, VerifyKey};
pub use protocol::{
    ClientInfo, ClientMessage, ClientUpdate, MoveRequest, MoveResult, RejectReason, ServerMessage,
};
pub use session::{ClientSession, SessionRegistry};
pub use server::{GameServer, ServerConfig, ServerError};
pub use websocket::{TransportError, WebSocketServer};
pub use client::{ClientError, GameClient, LocalServer, ServerStub};
pub use remote::RemoteServer;
