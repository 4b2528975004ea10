//! WebSocket client for the sync server.
//!
//! One writer task drains the outgoing queue into the socket and one reader
//! task routes incoming frames: replies go to the request waiting on their
//! `request_id`, pushed ops and query deltas become [`SyncEvent`]s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::auth::Credentials;
use crate::document::{CommittedOp, OpKind, Snapshot};
use crate::error::SyncError;
use crate::protocol::{MessageType, ProtocolError, QueryResultBody, SyncMessage};
use crate::query::{Query, QueryDelta};
use crate::service::DocumentService;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<SyncMessage>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events pushed by the server.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// An op committed by another connection on a subscribed document
    RemoteOp(CommittedOp),
    QueryDelta { query_id: u64, deltas: Vec<QueryDelta> },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a request waits for its reply.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub struct SyncClient {
    server_url: String,
    credentials: Credentials,
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    /// Request id 0 is reserved for server pushes.
    next_request: AtomicU64,
    pending: Pending,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, credentials: Credentials) -> Self {
        Self::with_config(server_url, credentials, ClientConfig::default())
    }

    pub fn with_config(server_url: impl Into<String>, credentials: Credentials, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            server_url: server_url.into(),
            credentials,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            next_request: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open the socket and authenticate.
    pub async fn connect(&mut self) -> Result<(), SyncError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if ws_writer.send(frame).await.is_err() || closing {
                    break;
                }
            }
        });

        let pending = self.pending.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(msg) => route(msg, &pending, &event_tx).await,
                        Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            // Dropping the senders fails every outstanding request.
            pending.lock().await.clear();
            let _ = event_tx.send(SyncEvent::Disconnected);
        });

        let credentials = self.credentials.clone();
        let handshake = self
            .request(|id| SyncMessage::connect(id, &credentials))
            .await
            .and_then(|reply| expect_ack(&reply));
        if let Err(e) = handshake {
            *self.state.write().await = ConnectionState::Disconnected;
            self.outgoing_tx = None;
            return Err(e);
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected);
        log::info!("Connected to {}", self.server_url);
        Ok(())
    }

    /// Send a close frame. Outstanding requests fail once the socket closes.
    pub async fn close(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
    }

    async fn request(&self, build: impl FnOnce(u64) -> SyncMessage) -> Result<SyncMessage, SyncError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let encoded = build(request_id).encode()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, reply_tx);
        if tx.send(Message::Binary(encoded.into())).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(ProtocolError::ConnectionClosed.into());
        }

        match tokio::time::timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(reply)) if reply.msg_type == MessageType::Error => Err(reply.to_error()),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(ProtocolError::Timeout.into())
            }
        }
    }

    // ─── Requests ───────────────────────────────────────────────────

    /// Subscribe to a document; remote ops arrive as [`SyncEvent::RemoteOp`].
    pub async fn subscribe(&self, collection: &str, id: &str) -> Result<Snapshot, SyncError> {
        let reply = self.request(|rid| SyncMessage::subscribe(rid, collection, id)).await?;
        Ok(reply.payload_of(MessageType::Snapshot)?)
    }

    pub async fn unsubscribe(&self, collection: &str, id: &str) -> Result<(), SyncError> {
        let reply = self.request(|rid| SyncMessage::unsubscribe(rid, collection, id)).await?;
        expect_ack(&reply).map(|_| ())
    }

    pub async fn subscribe_query(&self, query: &Query) -> Result<(u64, Vec<Snapshot>), SyncError> {
        let reply = self.request(|rid| SyncMessage::query_subscribe(rid, query)).await?;
        let body: QueryResultBody = reply.payload_of(MessageType::QueryResult)?;
        Ok((body.query_id, body.results))
    }

    pub async fn unsubscribe_query(&self, query_id: u64) -> Result<(), SyncError> {
        let reply = self.request(|rid| SyncMessage::query_unsubscribe(rid, query_id)).await?;
        expect_ack(&reply).map(|_| ())
    }

    pub async fn ping(&self) -> Result<(), SyncError> {
        let reply = self.request(SyncMessage::ping).await?;
        if reply.msg_type != MessageType::Pong {
            return Err(unexpected(MessageType::Pong, &reply));
        }
        Ok(())
    }

    // ─── Accessors ──────────────────────────────────────────────────

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

#[async_trait]
impl DocumentService for SyncClient {
    async fn fetch(&self, collection: &str, id: &str) -> Result<Snapshot, SyncError> {
        let reply = self.request(|rid| SyncMessage::fetch(rid, collection, id)).await?;
        Ok(reply.payload_of(MessageType::Snapshot)?)
    }

    async fn fetch_snapshot(&self, collection: &str, id: &str, version: u64) -> Result<Snapshot, SyncError> {
        let reply = self
            .request(|rid| SyncMessage::fetch_snapshot(rid, collection, id, version))
            .await?;
        Ok(reply.payload_of(MessageType::Snapshot)?)
    }

    async fn submit(&self, collection: &str, id: &str, base_version: u64, kind: OpKind) -> Result<u64, SyncError> {
        let reply = self
            .request(|rid| SyncMessage::submit(rid, collection, id, base_version, &kind))
            .await?;
        expect_ack(&reply)
    }
}

fn unexpected(expected: MessageType, reply: &SyncMessage) -> SyncError {
    ProtocolError::UnexpectedMessage {
        expected,
        found: reply.msg_type,
    }
    .into()
}

fn expect_ack(reply: &SyncMessage) -> Result<u64, SyncError> {
    if reply.msg_type != MessageType::Ack {
        return Err(unexpected(MessageType::Ack, reply));
    }
    Ok(reply.version)
}

async fn route(msg: SyncMessage, pending: &Pending, event_tx: &mpsc::UnboundedSender<SyncEvent>) {
    let event = match msg.msg_type {
        MessageType::Op => match msg.payload::<CommittedOp>() {
            Ok(op) => SyncEvent::RemoteOp(op),
            Err(e) => {
                log::warn!("Dropping malformed op frame: {e}");
                return;
            }
        },
        MessageType::QueryDelta => match msg.payload::<Vec<QueryDelta>>() {
            Ok(deltas) => SyncEvent::QueryDelta {
                query_id: msg.version,
                deltas,
            },
            Err(e) => {
                log::warn!("Dropping malformed query delta: {e}");
                return;
            }
        },
        _ => {
            match pending.lock().await.remove(&msg.request_id) {
                Some(waiter) => {
                    let _ = waiter.send(msg);
                }
                None => log::debug!("Reply to unknown request {}", msg.request_id),
            }
            return;
        }
    };
    let _ = event_tx.send(event);
}
