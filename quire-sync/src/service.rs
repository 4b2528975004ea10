//! Document operations as seen by tools: the in-process engine and the
//! WebSocket client both implement [`DocumentService`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::access::Session;
use crate::connection::{Connection, ServerEvent};
use crate::document::{OpKind, Snapshot};
use crate::engine::SyncEngine;
use crate::error::SyncError;

#[async_trait]
pub trait DocumentService: Send + Sync {
    async fn fetch(&self, collection: &str, id: &str) -> Result<Snapshot, SyncError>;

    async fn fetch_snapshot(&self, collection: &str, id: &str, version: u64) -> Result<Snapshot, SyncError>;

    /// Submit through the ordinary path; returns the committed version.
    async fn submit(&self, collection: &str, id: &str, base_version: u64, kind: OpKind) -> Result<u64, SyncError>;
}

/// Engine handle bound to one connection.
pub struct LocalService {
    engine: Arc<SyncEngine>,
    conn: Arc<Connection>,
    // Held so the connection stays open; pushed events are discarded.
    _events: std::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<ServerEvent>>,
}

impl LocalService {
    pub async fn connect(engine: Arc<SyncEngine>, session: Session) -> Self {
        let (conn, events) = engine.connect(session).await;
        Self {
            engine,
            conn,
            _events: std::sync::Mutex::new(events),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub async fn close(self) {
        self.engine.disconnect(&self.conn).await;
    }
}

#[async_trait]
impl DocumentService for LocalService {
    async fn fetch(&self, collection: &str, id: &str) -> Result<Snapshot, SyncError> {
        self.engine.fetch(self.conn.session(), collection, id).await
    }

    async fn fetch_snapshot(&self, collection: &str, id: &str, version: u64) -> Result<Snapshot, SyncError> {
        self.engine
            .fetch_snapshot(self.conn.session(), collection, id, version)
            .await
    }

    async fn submit(&self, collection: &str, id: &str, base_version: u64, kind: OpKind) -> Result<u64, SyncError> {
        self.engine
            .submit_op(&self.conn, collection, id, base_version, kind)
            .await
    }
}
