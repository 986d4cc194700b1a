//! WebSocket Front End
//!
//! Accepts connections, decodes JSON frames into requests against the
//! [`GameServer`] and writes responses and pushed updates back in order.
//! A connection that closes or errors is treated as a leave.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::game::entity::PlayerId;
use crate::network::protocol::{
    ClientMessage, MoveRequest, MoveResult, RejectReason, RequestId, ServerMessage,
};
use crate::network::server::GameServer;
use crate::network::session::Outbound;

/// How long a closing connection may take to flush its queue.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the listener stopped.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Listener socket could not be opened.
    #[error("cannot listen: {0}")]
    Listen(#[from] std::io::Error),

    /// Handshake or framing failure.
    #[error("websocket: {0}")]
    Frame(#[from] tokio_tungstenite::tungstenite::Error),

    /// The world could not be written out after the last connection closed.
    #[error("final save: {0}")]
    Save(#[from] crate::game::map::MapError),
}

/// Per-connection request state.
struct Connection {
    addr: SocketAddr,
    player: Option<PlayerId>,
    outbound: Outbound,
}

/// WebSocket listener in front of a [`GameServer`].
pub struct WebSocketServer {
    server: Arc<GameServer>,
    /// Open connections and the player each has joined as.
    connections: Arc<RwLock<BTreeMap<SocketAddr, Option<PlayerId>>>>,
    stop: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Front end for `server`.
    pub fn new(server: Arc<GameServer>) -> Self {
        Self {
            server,
            connections: Arc::new(RwLock::new(BTreeMap::new())),
            stop: broadcast::channel(1).0,
        }
    }

    /// The game server behind this front end.
    pub fn server(&self) -> &Arc<GameServer> {
        &self.server
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.server.config().bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until [`shutdown`](Self::shutdown),
    /// then save the world.
    #[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TransportError> {
        info!(version = %self.server.config().version, "Game server listening");

        let autosave_server = self.server.clone();
        let autosave_handle = tokio::spawn(async move {
            Self::run_autosave_loop(autosave_server).await;
        });

        let mut stop = self.stop.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let limit = self.server.config().max_connections;
                        if self.connections.read().await.len() >= limit {
                            warn!(%peer, limit, "Refusing connection, server full");
                            continue;
                        }
                        debug!(%peer, "Accepted connection");
                        self.spawn_connection(stream, peer);
                    }
                    Err(e) => error!(error = %e, "accept() failed"),
                },
                _ = stop.recv() => {
                    info!("Stopping listener");
                    break;
                }
            }
        }

        autosave_handle.abort();
        self.server.shutdown("world is going offline").await?;
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let server = self.server.clone();
        let connections = self.connections.clone();
        let stop = self.stop.subscribe();
        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(socket) => {
                    connections.write().await.insert(peer, None);
                    run_connection(server, connections.clone(), socket, peer, stop).await;
                    connections.write().await.remove(&peer);
                }
                Err(e) => warn!(%peer, error = %e, "Handshake failed"),
            }
        });
    }

    async fn run_autosave_loop(server: Arc<GameServer>) {
        let mut ticker = interval(server.config().autosave_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match server.map().save_changes().await {
                Ok(0) => {}
                Ok(saved) => debug!(chunks = saved, "Autosaved"),
                Err(e) => warn!(error = %e, "Autosave failed"),
            }
        }
    }

    /// Stop accepting, close every connection and save.
    pub fn shutdown(&self) {
        // No receivers just means nothing is running yet.
        let _ = self.stop.send(());
    }

    /// Open connection count.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

type Socket = tokio_tungstenite::WebSocketStream<TcpStream>;
type Registry = Arc<RwLock<BTreeMap<SocketAddr, Option<PlayerId>>>>;

/// Read frames from one socket until it closes or the listener stops.
/// Leaving is implied by the socket going away.
async fn run_connection(
    server: Arc<GameServer>,
    connections: Registry,
    socket: Socket,
    peer: SocketAddr,
    mut stop: broadcast::Receiver<()>,
) {
    let (sink, mut frames) = socket.split();
    let (outbound, queue) = mpsc::unbounded_channel::<ServerMessage>();
    let writer = tokio::spawn(write_frames(sink, queue));
    let mut connection = Connection { addr: peer, player: None, outbound };

    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = stop.recv() => {
                let _ = connection.outbound.send(ServerMessage::Shutdown {
                    reason: "world is going offline".to_string(),
                });
                break;
            }
        };
        let reply = match frame {
            Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                Ok(request) => {
                    let handled = AssertUnwindSafe(dispatch(&server, &mut connection, request))
                        .catch_unwind()
                        .await;
                    let Ok(reply) = handled else {
                        error!(%peer, "Request handler panicked, closing connection");
                        let _ = connection.outbound.send(ServerMessage::Error {
                            reason: RejectReason::InternalError,
                            message: "internal error".to_string(),
                        });
                        break;
                    };
                    connections.write().await.insert(peer, connection.player);
                    reply
                }
                Err(e) => {
                    debug!(%peer, error = %e, "Unparseable frame");
                    ServerMessage::Error {
                        reason: RejectReason::InvalidMessage,
                        message: format!("invalid message: {}", e),
                    }
                }
            },
            Some(Ok(Message::Binary(_))) => ServerMessage::Error {
                reason: RejectReason::InvalidMessage,
                message: "binary frames are not supported".to_string(),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(%peer, error = %e, "Socket error");
                break;
            }
            Some(Ok(_)) => continue,
        };
        let _ = connection.outbound.send(reply);
    }

    if let Some(player) = connection.player.take() {
        server.disconnect(player).await;
    }
    drop(connection);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!(%peer, "Outbound queue not drained before close");
    }
    debug!(%peer, "Connection closed");
}

/// Drain one connection's queue onto its socket, in order.
async fn write_frames(
    mut sink: futures_util::stream::SplitSink<Socket, Message>,
    mut queue: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(message) = queue.recv().await {
        match message.to_json() {
            Ok(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            Err(e) => error!(error = %e, "Dropping unserializable message"),
        }
    }
    let _ = sink.close().await;
}

/// Handle one request and build its response.
async fn dispatch(server: &GameServer, connection: &mut Connection, request: ClientMessage) -> ServerMessage {
    match request {
        ClientMessage::Join { request_id, info } => {
            if connection.player.is_some() {
                return ServerMessage::rejected(request_id, RejectReason::InvalidMessage, "connection already joined");
            }
            let player = info.player_id;
            match server.join(info, connection.outbound.clone()).await {
                Ok(spawn) => {
                    info!(addr = %connection.addr, player = %player.short(), "Connection joined");
                    connection.player = Some(player);
                    ServerMessage::Joined { request_id, spawn }
                }
                Err(e) => ServerMessage::rejected(request_id, e.reason(), e.to_string()),
            }
        }
        ClientMessage::Leave { request_id } => match connection.player.take() {
            Some(player) => match server.leave(player).await {
                Ok(()) => ServerMessage::Left { request_id },
                Err(e) => ServerMessage::rejected(request_id, e.reason(), e.to_string()),
            },
            None => not_joined(request_id),
        },
        ClientMessage::LoadChunk { request_id, index } => match connection.player {
            Some(player) => match server.load_chunk(player, index).await {
                Ok(_) => ServerMessage::ChunkLoaded { request_id, index },
                Err(e) => ServerMessage::rejected(request_id, e.reason(), e.to_string()),
            },
            None => not_joined(request_id),
        },
        ClientMessage::UnloadChunk { request_id, index } => match connection.player {
            Some(player) => match server.unload_chunk(player, index).await {
                Ok(()) => ServerMessage::ChunkUnloaded { request_id, index },
                Err(e) => ServerMessage::rejected(request_id, e.reason(), e.to_string()),
            },
            None => not_joined(request_id),
        },
        ClientMessage::Move { request_id, source, target } => {
            let result = match connection.player {
                Some(player_id) => server.move_player(MoveRequest { player_id, source, target }).await,
                None => MoveResult::Rejected {
                    reason: RejectReason::UnknownPlayer,
                },
            };
            ServerMessage::MoveResult { request_id, result }
        }
        ClientMessage::Ping { timestamp } => ServerMessage::Pong {
            timestamp,
            server_time: chrono::Utc::now().timestamp_millis().max(0) as u64,
        },
    }
}

fn not_joined(request_id: RequestId) -> ServerMessage {
    ServerMessage::rejected(request_id, RejectReason::UnknownPlayer, "connection has not joined")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::{ChunkIndex, Point};
    use crate::game::map::Map;
    use crate::game::storage::{MapMetadata, MemoryStorage};
    use crate::network::protocol::ClientInfo;
    use crate::network::server::ServerConfig;

    fn game_server() -> Arc<GameServer> {
        let map = Arc::new(Map::new(Arc::new(MemoryStorage::new()), MapMetadata::new("test")));
        Arc::new(GameServer::new(map, ServerConfig::default()))
    }

    fn connection() -> (Connection, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection {
            addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            player: None,
            outbound: tx,
        };
        (connection, rx)
    }

    #[tokio::test]
    async fn test_dispatch_requires_join() {
        let server = game_server();
        let (mut conn, _rx) = connection();

        let response = dispatch(&server, &mut conn, ClientMessage::LoadChunk {
            request_id: 4,
            index: ChunkIndex::new(0, 0),
        })
        .await;
        assert!(matches!(
            response,
            ServerMessage::Rejected { request_id: 4, reason: RejectReason::UnknownPlayer, .. }
        ));

        let response = dispatch(&server, &mut conn, ClientMessage::Move {
            request_id: 5,
            source: Point::new(0, 0),
            target: Point::new(0, 1),
        })
        .await;
        assert_eq!(
            response,
            ServerMessage::MoveResult {
                request_id: 5,
                result: MoveResult::Rejected { reason: RejectReason::UnknownPlayer },
            }
        );
    }

    #[tokio::test]
    async fn test_dispatch_join_load_move_leave() {
        let server = game_server();
        let (mut conn, mut rx) = connection();
        let info = ClientInfo::new(PlayerId::new([1; 16]), "ana");

        let joined = dispatch(&server, &mut conn, ClientMessage::Join { request_id: 1, info: info.clone() }).await;
        assert_eq!(joined, ServerMessage::Joined { request_id: 1, spawn: Point::new(0, 0) });

        let again = dispatch(&server, &mut conn, ClientMessage::Join { request_id: 2, info }).await;
        assert!(matches!(again, ServerMessage::Rejected { reason: RejectReason::InvalidMessage, .. }));

        let loaded = dispatch(&server, &mut conn, ClientMessage::LoadChunk {
            request_id: 3,
            index: ChunkIndex::new(0, 0),
        })
        .await;
        assert_eq!(loaded, ServerMessage::ChunkLoaded { request_id: 3, index: ChunkIndex::new(0, 0) });
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Update { .. })));

        let moved = dispatch(&server, &mut conn, ClientMessage::Move {
            request_id: 4,
            source: Point::new(0, 0),
            target: Point::new(0, 1),
        })
        .await;
        assert!(matches!(moved, ServerMessage::MoveResult { request_id: 4, result } if result.is_accepted()));

        let left = dispatch(&server, &mut conn, ClientMessage::Leave { request_id: 6 }).await;
        assert_eq!(left, ServerMessage::Left { request_id: 6 });
        assert!(conn.player.is_none());
        assert!(server.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let server = game_server();
        let (mut conn, _rx) = connection();
        let pong = dispatch(&server, &mut conn, ClientMessage::Ping { timestamp: 42 }).await;
        assert!(matches!(pong, ServerMessage::Pong { timestamp: 42, .. }));
    }

    #[tokio::test]
    async fn test_server_shutdown_before_serve_is_harmless() {
        let ws = WebSocketServer::new(game_server());
        ws.shutdown();
        assert_eq!(ws.connection_count().await, 0);
    }
}
