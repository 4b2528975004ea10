//! WebSocket front end for the sync engine.
//!
//! ```text
//! Client A ──┐                       ┌── DocumentStore
//!             ├── SyncServer ── SyncEngine ──┤
//! Client B ──┘    (one task per       └── BroadcastGroup per document
//!                  connection)
//! ```
//!
//! Every connection runs one `select!` loop over its socket and its
//! outbound event queue. Requests are handled in arrival order and each gets
//! exactly one reply frame carrying its `request_id`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{remote_session, Authenticator, Credentials, TokenAuthenticator};
use crate::connection::{Connection, ServerEvent};
use crate::document::OpKind;
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::query::Query;

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;
type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// How often idle documents are evicted from memory.
    pub eviction_interval_secs: u64,
    /// Resolves handshake credentials. The default rejects every client.
    pub authenticator: Arc<dyn Authenticator>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            eviction_interval_secs: 60,
            authenticator: Arc::new(TokenAuthenticator::new()),
        }
    }
}

impl ServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>, authenticator: impl Authenticator + 'static) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            eviction_interval_secs: 1,
            authenticator: Arc::new(authenticator),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("eviction_interval_secs", &self.eviction_interval_secs)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub errors_sent: u64,
}

pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, engine: Arc<SyncEngine>) -> Self {
        Self {
            config,
            engine,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Serve until the process exits.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then drain in-flight commits.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        let eviction = {
            let engine = self.engine.clone();
            let period = Duration::from_secs(self.config.eviction_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    engine.evict_idle().await;
                }
            })
        };

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let engine = self.engine.clone();
                    let stats = self.stats.clone();
                    let authenticator = self.config.authenticator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, engine, authenticator, stats).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        eviction.abort();
        self.engine.shutdown().await;
        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<SyncEngine>,
        authenticator: Arc<dyn Authenticator>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> ConnectionResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::debug!("WebSocket connection established from {addr}");

        let handshake = match tokio::time::timeout(HANDSHAKE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => SyncMessage::decode(&data)?,
            Ok(_) => return Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => return Err(ProtocolError::Timeout.into()),
        };
        let authenticated = match handshake.payload_of::<Credentials>(MessageType::Connect) {
            Ok(credentials) => authenticator.authenticate(&credentials).await,
            Err(e) => Err(e.into()),
        };
        let session = match authenticated {
            Ok(session) => remote_session(session),
            Err(e) => {
                log::warn!("Handshake from {addr} rejected: {e}");
                let reply = SyncMessage::error(handshake.request_id, &e);
                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                return Err(e.into());
            }
        };

        let (conn, mut events) = engine.connect(session).await;
        ws_sender
            .send(Message::Binary(SyncMessage::ack(handshake.request_id, 0).encode()?.into()))
            .await?;
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::pump(&engine, &conn, &mut ws_sender, &mut ws_receiver, &mut events, &stats).await;

        engine.disconnect(&conn).await;
        stats.write().await.active_connections -= 1;
        log::info!("Connection {} from {addr} finished", conn.id());
        result
    }

    async fn pump(
        engine: &Arc<SyncEngine>,
        conn: &Arc<Connection>,
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        events: &mut mpsc::UnboundedReceiver<ServerEvent>,
        stats: &RwLock<ServerStats>,
    ) -> ConnectionResult {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let reply = match SyncMessage::decode(&data) {
                                Ok(request) => Self::dispatch(engine, conn, request).await,
                                Err(e) => {
                                    log::warn!("Undecodable frame from connection {}: {e}", conn.id());
                                    SyncMessage::error(0, &e.into())
                                }
                            };
                            if reply.msg_type == MessageType::Error {
                                stats.write().await.errors_sent += 1;
                            }
                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => {
                            log::error!("WebSocket error on connection {}: {e}", conn.id());
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        return Ok(());
                    };
                    let frame = match event {
                        ServerEvent::Op(op) => SyncMessage::op(&op),
                        ServerEvent::QueryDelta { query_id, deltas } => SyncMessage::query_delta(query_id, &deltas),
                    };
                    ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                }
            }
        }
    }

    /// Handle one request; failures become `Error` frames.
    async fn dispatch(engine: &Arc<SyncEngine>, conn: &Arc<Connection>, request: SyncMessage) -> SyncMessage {
        let request_id = request.request_id;
        let msg_type = request.msg_type;
        match Self::handle_request(engine, conn, request).await {
            Ok(reply) => reply,
            Err(e) => {
                log::debug!("{msg_type:?} request {request_id} from {} failed: {e}", conn.id());
                SyncMessage::error(request_id, &e)
            }
        }
    }

    async fn handle_request(
        engine: &Arc<SyncEngine>,
        conn: &Arc<Connection>,
        request: SyncMessage,
    ) -> Result<SyncMessage, SyncError> {
        let id = request.request_id;
        let (collection, doc_id) = (request.collection.as_str(), request.doc_id.as_str());
        match request.msg_type {
            MessageType::Subscribe => {
                let snapshot = engine.subscribe(conn, collection, doc_id).await?;
                Ok(SyncMessage::snapshot(id, &snapshot))
            }
            MessageType::Unsubscribe => {
                engine.unsubscribe(conn, collection, doc_id).await;
                Ok(SyncMessage::ack(id, 0))
            }
            MessageType::Fetch => {
                let snapshot = engine.fetch(conn.session(), collection, doc_id).await?;
                Ok(SyncMessage::snapshot(id, &snapshot))
            }
            MessageType::FetchSnapshot => {
                let snapshot = engine
                    .fetch_snapshot(conn.session(), collection, doc_id, request.version)
                    .await?;
                Ok(SyncMessage::snapshot(id, &snapshot))
            }
            MessageType::Submit => {
                let kind: OpKind = request.payload()?;
                let version = engine
                    .submit_op(conn, collection, doc_id, request.version, kind)
                    .await?;
                Ok(SyncMessage::ack(id, version))
            }
            MessageType::QuerySubscribe => {
                let query: Query = request.payload()?;
                let (query_id, results) = engine.subscribe_query(conn, query).await?;
                Ok(SyncMessage::query_result(id, query_id, results))
            }
            MessageType::QueryUnsubscribe => {
                let query_id = request.version;
                if !conn.query_ids().await.contains(&query_id) {
                    return Err(SyncError::NotFound(format!("query {query_id}")));
                }
                engine.unsubscribe_query(query_id).await;
                Ok(SyncMessage::ack(id, query_id))
            }
            MessageType::Ping => Ok(SyncMessage::pong(id)),
            other => Err(SyncError::Protocol(format!("unexpected {other:?} from client"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.eviction_interval_secs, 60);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let engine = SyncEngine::builder().build().unwrap();
        let server = SyncServer::new(ServerConfig::for_testing("127.0.0.1:0", TokenAuthenticator::new()), engine);
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
    }
}
