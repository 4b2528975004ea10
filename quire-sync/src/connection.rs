//! A live client connection and its outbound event queue.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::access::Session;
use crate::document::CommittedOp;
use crate::query::QueryDelta;

/// Event pushed from the engine to one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    Op(CommittedOp),
    QueryDelta { query_id: u64, deltas: Vec<QueryDelta> },
}

pub struct Connection {
    id: Uuid,
    session: Session,
    connected_at: Instant,
    connected_since: DateTime<Utc>,
    /// collection -> subscribed document ids
    subscriptions: RwLock<HashMap<String, HashSet<String>>>,
    queries: RwLock<HashSet<u64>>,
    closed: AtomicBool,
    outbox: mpsc::UnboundedSender<ServerEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub fn new(session: Session) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            session,
            connected_at: Instant::now(),
            connected_since: Utc::now(),
            subscriptions: RwLock::new(HashMap::new()),
            queries: RwLock::new(HashSet::new()),
            closed: AtomicBool::new(false),
            outbox,
        });
        (conn, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn connected_since(&self) -> DateTime<Utc> {
        self.connected_since
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Queue an event. Returns false once the connection is closed; a
    /// dropped receiver closes the connection.
    pub fn send(&self, event: ServerEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.outbox.send(event).is_err() {
            self.close();
            return false;
        }
        true
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("Connection {} closed", self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.outbox.is_closed()
    }

    // ─── Subscriptions ──────────────────────────────────────────────

    pub(crate) async fn add_subscription(&self, collection: &str, id: &str) -> bool {
        self.subscriptions
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string())
    }

    pub(crate) async fn remove_subscription(&self, collection: &str, id: &str) -> bool {
        let mut subs = self.subscriptions.write().await;
        let Some(ids) = subs.get_mut(collection) else {
            return false;
        };
        let removed = ids.remove(id);
        if ids.is_empty() {
            subs.remove(collection);
        }
        removed
    }

    pub async fn is_subscribed(&self, collection: &str, id: &str) -> bool {
        self.subscriptions
            .read()
            .await
            .get(collection)
            .is_some_and(|ids| ids.contains(id))
    }

    /// Every `(collection, id)` this connection is subscribed to.
    pub async fn subscriptions(&self) -> Vec<(String, String)> {
        self.subscriptions
            .read()
            .await
            .iter()
            .flat_map(|(c, ids)| ids.iter().map(move |id| (c.clone(), id.clone())))
            .collect()
    }

    pub async fn subscribed_document_count(&self) -> usize {
        self.subscriptions.read().await.values().map(HashSet::len).sum()
    }

    pub(crate) async fn add_query(&self, query_id: u64) {
        self.queries.write().await.insert(query_id);
    }

    pub(crate) async fn remove_query(&self, query_id: u64) -> bool {
        self.queries.write().await.remove(&query_id)
    }

    pub async fn query_ids(&self) -> Vec<u64> {
        self.queries.read().await.iter().copied().collect()
    }

    pub async fn subscribed_query_count(&self) -> usize {
        self.queries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_after_close_is_dropped() {
        let (conn, mut rx) = Connection::new(Session::user("u1", "user"));
        let event = ServerEvent::QueryDelta {
            query_id: 1,
            deltas: vec![],
        };
        assert!(conn.send(event.clone()));
        assert_eq!(rx.recv().await, Some(event.clone()));

        conn.close();
        assert!(!conn.send(event));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes() {
        let (conn, rx) = Connection::new(Session::server());
        drop(rx);
        assert!(conn.is_closed());
        assert!(!conn.send(ServerEvent::QueryDelta {
            query_id: 1,
            deltas: vec![]
        }));
    }

    #[tokio::test]
    async fn test_subscription_bookkeeping() {
        let (conn, _rx) = Connection::new(Session::server());
        assert!(conn.add_subscription("projects", "p1").await);
        assert!(!conn.add_subscription("projects", "p1").await);
        conn.add_subscription("texts", "p1:GEN:1").await;
        assert_eq!(conn.subscribed_document_count().await, 2);
        assert!(conn.is_subscribed("projects", "p1").await);

        assert!(conn.remove_subscription("projects", "p1").await);
        assert!(!conn.remove_subscription("projects", "p1").await);
        assert_eq!(conn.subscriptions().await, vec![("texts".to_string(), "p1:GEN:1".to_string())]);

        conn.add_query(7).await;
        assert_eq!(conn.subscribed_query_count().await, 1);
        assert!(conn.remove_query(7).await);
    }
}
