//! WebSocket session server.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /ws/<project>/<file>
//!            ├── RoomRegistry ── Room (project, file) ── broadcast channel
//! Client B ──┘        │                                       │
//!                     │                              ┌────────┼────────┐
//!                     ▼                              ▼        ▼        ▼
//!              EditPersister ── ProjectStore      Client A Client B Client C
//!              (debounced)      (Memory / RocksDB)
//! ```
//!
//! Every text frame is the sender's full copy of the file. It is fanned out
//! to the other members of the room and recorded for persistence; the
//! socket write for each recipient happens on that recipient's own task.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{RoomRegistry, Subscription};
use crate::persist::{EditPersister, PersistConfig, PersisterHandle};
use crate::protocol::{PeerInfo, ProtocolError, RoomKey};
use crate::storage::{MemoryProjectStore, ProjectStore};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Optional cap on peers per room; `None` admits everyone
    pub max_peers_per_room: Option<usize>,
    /// Snapshots buffered per peer before it starts lagging
    pub broadcast_capacity: usize,
    /// Upper bound on a single socket write
    pub send_timeout: Duration,
    pub persist: PersistConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: None,
            broadcast_capacity: 256,
            send_timeout: Duration::from_secs(5),
            persist: PersistConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Session-level failures. None of these affect other connections.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("websocket handshake failed: {0}")]
    Handshake(tungstenite::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Room(#[from] ProtocolError),
    #[error("socket send timed out after {0:?}")]
    SendTimeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a connection task needs, cloned per connection.
#[derive(Clone)]
struct ConnectionContext {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    persister: PersisterHandle,
    stats: Arc<AtomicServerStats>,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    store: Arc<dyn ProjectStore>,
    persister: EditPersister,
    stats: Arc<AtomicServerStats>,
}

impl CollabServer {
    /// Create a server over an in-memory store. Must be called inside a
    /// tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryProjectStore::new()))
    }

    /// Create a server persisting edits into `store`.
    pub fn with_store(config: ServerConfig, store: Arc<dyn ProjectStore>) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.broadcast_capacity));
        let persister = EditPersister::spawn(store.clone(), config.persist.clone());
        Self {
            config,
            registry,
            store,
            persister,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener, SessionError> {
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Bind the configured address and serve until the process ends.
    pub async fn run(&self) -> Result<(), SessionError> {
        let listener = self.bind().await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections on `listener` forever.
    pub async fn serve(&self, listener: TcpListener) {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Accept connections on `listener` until `signal` resolves.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn serve_with_shutdown(&self, listener: TcpListener, signal: impl Future<Output = ()>) {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Collab server listening on {addr}");
        }
        tokio::pin!(signal);

        loop {
            let (stream, addr) = tokio::select! {
                _ = &mut signal => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("Accept failed: {e}");
                        continue;
                    }
                },
            };
            log::debug!("New TCP connection from {addr}");

            let ctx = self.context();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::warn!("Connection from {addr} ended with error: {e}");
                }
            });
        }

        log::info!("Collab server stopped accepting connections");
    }

    /// Flush pending edits and stop the persister.
    pub async fn shutdown(self) {
        self.persister.shutdown().await;
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.registry.clone()
    }

    pub fn store(&self) -> Arc<dyn ProjectStore> {
        self.store.clone()
    }

    pub fn persister(&self) -> PersisterHandle {
        self.persister.handle()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count().await,
        }
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            config: self.config.clone(),
            registry: self.registry.clone(),
            persister: self.persister.handle(),
            stats: self.stats.clone(),
        }
    }

    /// Handle a single WebSocket connection from handshake to leave.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ConnectionContext,
    ) -> Result<(), SessionError> {
        let mut path = String::new();
        let capture_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_owned();
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, capture_path)
            .await
            .map_err(SessionError::Handshake)?;

        let key = match RoomKey::from_path(&path) {
            Ok(key) => key,
            Err(e) => {
                log::warn!("Rejecting {addr}: {e}");
                return Self::reject(&mut ws, &ctx, e).await;
            }
        };

        let info = PeerInfo::new(addr.to_string());
        let peer_id = info.peer_id;
        let joined = match ctx.config.max_peers_per_room {
            Some(max_peers) => ctx.registry.try_join(key.clone(), info, max_peers).await,
            None => Ok(ctx.registry.join(key.clone(), info).await),
        };
        let mut sub = match joined {
            Ok(sub) => sub,
            Err(e) => {
                log::warn!("Rejecting {addr} from room {key}: {e}");
                return Self::reject(&mut ws, &ctx, e).await;
            }
        };

        ctx.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        ctx.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Peer {peer_id} ({addr}) joined room {key}");

        let (ws_sender, ws_receiver) = ws.split();
        let result = Self::run_session(ws_sender, ws_receiver, &mut sub, &ctx).await;

        // Every exit path of the session ends up here
        ctx.registry.leave(&key, peer_id).await;
        ctx.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Peer {peer_id} ({addr}) left room {key}");
        result
    }

    async fn reject(
        ws: &mut WebSocketStream<TcpStream>,
        ctx: &ConnectionContext,
        error: ProtocolError,
    ) -> Result<(), SessionError> {
        ctx.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: error.to_string().into(),
        };
        let _ = tokio::time::timeout(ctx.config.send_timeout, ws.close(Some(frame))).await;
        Err(SessionError::Room(error))
    }

    async fn run_session(
        mut ws_sender: WsSink,
        mut ws_receiver: WsSource,
        sub: &mut Subscription,
        ctx: &ConnectionContext,
    ) -> Result<(), SessionError> {
        let key = sub.key().clone();
        let peer_id = sub.peer_id();
        let send_timeout = ctx.config.send_timeout;

        loop {
            tokio::select! {
                frame = ws_receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        ctx.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        ctx.stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);

                        let content: Arc<str> = Arc::from(text.as_str());
                        let delivered = ctx.registry.dispatch(&key, content.clone(), peer_id).await;
                        log::trace!("Snapshot from {peer_id} in {key} delivered to {delivered} peer(s)");
                        ctx.persister.record(key.clone(), content);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        log::debug!("Ignoring {} byte binary frame from {peer_id}", data.len());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Pings are answered by tungstenite on the next read
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                outbound = sub.recv() => match outbound {
                    Ok(content) => {
                        send_bounded(&mut ws_sender, Message::text(content.to_string()), send_timeout)
                            .await?;
                    }
                    Err(ProtocolError::RoomClosed) => break,
                    Err(e) => return Err(e.into()),
                },
            }
        }

        Ok(())
    }
}

async fn send_bounded(
    sink: &mut WsSink,
    message: Message,
    limit: Duration,
) -> Result<(), SessionError> {
    tokio::time::timeout(limit, sink.send(message))
        .await
        .map_err(|_| SessionError::SendTimeout(limit))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.send_timeout, Duration::from_secs(5));
        assert_eq!(config.max_peers_per_room, None);
    }

    #[tokio::test]
    async fn test_fresh_server_stats() {
        let server = CollabServer::new(ServerConfig::default());
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_rooms, 0);
        server.shutdown().await;
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::SendTimeout(Duration::from_secs(5));
        assert_eq!(err.to_string(), "socket send timed out after 5s");
        let err: SessionError = ProtocolError::RoomFull(3).into();
        assert_eq!(err.to_string(), "room is full (3 peers)");
    }
}
