//! Remote Server Stub
//!
//! [`ServerStub`] over a WebSocket connection. Requests are correlated by
//! `request_id`; pushed messages are forwarded to the joined client's
//! queue before the response that follows them is delivered, so a caller
//! that sees a response can drain every update sent ahead of it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::core::point::ChunkIndex;
use crate::game::entity::PlayerId;
use crate::network::client::{ClientError, JoinAccepted, ServerStub};
use crate::network::protocol::{ClientInfo, ClientMessage, MoveRequest, MoveResult, RequestId, ServerMessage};

type Pending = Mutex<BTreeMap<RequestId, oneshot::Sender<ServerMessage>>>;
type PushSlot = Mutex<Option<mpsc::UnboundedSender<ServerMessage>>>;

/// State shared with the reader task.
#[derive(Default)]
struct Shared {
    pending: Pending,
    pushes: PushSlot,
    closed: AtomicBool,
}

impl Shared {
    fn route(&self, message: ServerMessage) {
        match message.request_id() {
            Some(id) => {
                let waiter = self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(message);
                    }
                    None => debug!(request_id = id, "Response for unknown request"),
                }
            }
            None => {
                if let Some(pushes) = self.pushes.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                    let _ = pushes.send(message);
                }
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders fails every outstanding call.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.pushes.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// A connection to a remote game server. Requests act for whichever player
/// this connection joined as; the `player` arguments of [`ServerStub`] are
/// not sent.
pub struct RemoteServer {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    shared: Arc<Shared>,
    next_request: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RemoteServer {
    /// Connect to `url` (e.g. `ws://127.0.0.1:8080`).
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (ws_stream, _) = connect_async(url).await?;
        info!(url, "Connected to game server");
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let shared = Arc::new(Shared::default());

        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let text = match msg.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("Failed to serialize request: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                        Ok(message) => reader_shared.route(message),
                        Err(e) => warn!("Invalid message from server: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        debug!("Server closed connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            reader_shared.close();
        });

        Ok(Self {
            outgoing,
            shared,
            next_request: AtomicU64::new(1),
            reader,
            writer,
        })
    }

    /// Send a request and wait for its response. `Rejected` responses
    /// become errors.
    async fn request<F>(&self, build: F) -> Result<ServerMessage, ClientError>
    where
        F: FnOnce(RequestId) -> ClientMessage,
    {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap_or_else(PoisonError::into_inner).insert(id, tx);
        if self.shared.closed.load(Ordering::SeqCst) || self.outgoing.send(build(id)).is_err() {
            self.shared.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
            return Err(ClientError::ConnectionLost);
        }

        match rx.await.map_err(|_| ClientError::ConnectionLost)? {
            ServerMessage::Rejected { reason, message, .. } => Err(ClientError::Rejected { reason, message }),
            response => Ok(response),
        }
    }

    /// Round-trip time probe. Returns the server clock in milliseconds.
    pub async fn ping(&self) -> Result<u64, ClientError> {
        // Pongs carry no request id; they arrive on the push queue.
        let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.outgoing
            .send(ClientMessage::Ping { timestamp })
            .map_err(|_| ClientError::ConnectionLost)?;
        Ok(timestamp)
    }
}

impl Drop for RemoteServer {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn unexpected(response: ServerMessage) -> ClientError {
    ClientError::Protocol(format!("unexpected response: {:?}", response))
}

impl ServerStub for RemoteServer {
    fn join(&self, info: ClientInfo) -> BoxFuture<'_, Result<JoinAccepted, ClientError>> {
        Box::pin(async move {
            // Install the push queue first; updates may follow the response
            // immediately.
            let (tx, pushes) = mpsc::unbounded_channel();
            *self.shared.pushes.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

            let result = self.request(|request_id| ClientMessage::Join { request_id, info }).await;
            match result {
                Ok(ServerMessage::Joined { spawn, .. }) => Ok(JoinAccepted { spawn, pushes }),
                other => {
                    self.shared.pushes.lock().unwrap_or_else(PoisonError::into_inner).take();
                    Err(match other {
                        Ok(response) => unexpected(response),
                        Err(e) => e,
                    })
                }
            }
        })
    }

    fn leave(&self, _player: PlayerId) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            let response = self.request(|request_id| ClientMessage::Leave { request_id }).await?;
            self.shared.pushes.lock().unwrap_or_else(PoisonError::into_inner).take();
            match response {
                ServerMessage::Left { .. } => Ok(()),
                other => Err(unexpected(other)),
            }
        })
    }

    fn load_chunk(&self, _player: PlayerId, index: ChunkIndex) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            match self.request(|request_id| ClientMessage::LoadChunk { request_id, index }).await? {
                ServerMessage::ChunkLoaded { .. } => Ok(()),
                other => Err(unexpected(other)),
            }
        })
    }

    fn unload_chunk(&self, _player: PlayerId, index: ChunkIndex) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            match self.request(|request_id| ClientMessage::UnloadChunk { request_id, index }).await? {
                ServerMessage::ChunkUnloaded { .. } => Ok(()),
                other => Err(unexpected(other)),
            }
        })
    }

    fn move_player(&self, request: MoveRequest) -> BoxFuture<'_, Result<MoveResult, ClientError>> {
        Box::pin(async move {
            let response = self
                .request(|request_id| ClientMessage::Move {
                    request_id,
                    source: request.source,
                    target: request.target,
                })
                .await?;
            match response {
                ServerMessage::MoveResult { result, .. } => Ok(result),
                other => Err(unexpected(other)),
            }
        })
    }
}
