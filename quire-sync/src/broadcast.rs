//! Per-document fan-out of committed operations.
//!
//! Every loaded document owns one `BroadcastGroup`. The engine publishes
//! while still holding the document's commit lock, so members see committed
//! operations in version order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::{Connection, ServerEvent};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

#[derive(Default)]
pub struct BroadcastGroup {
    members: RwLock<HashMap<Uuid, Arc<Connection>>>,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, conn: Arc<Connection>) {
        self.members.write().await.insert(conn.id(), conn);
    }

    pub async fn leave(&self, conn_id: &Uuid) -> bool {
        self.members.write().await.remove(conn_id).is_some()
    }

    /// Deliver `event` to every open member except `except`. Closed members
    /// are pruned and never receive anything. Returns the delivered count.
    pub async fn broadcast(&self, event: &ServerEvent, except: Option<Uuid>) -> usize {
        let mut delivered = 0;
        let mut stale = Vec::new();
        {
            let members = self.members.read().await;
            for (id, conn) in members.iter() {
                if Some(*id) == except {
                    continue;
                }
                if conn.send(event.clone()) {
                    delivered += 1;
                } else {
                    stale.push(*id);
                }
            }
        }
        self.stats.messages_sent.fetch_add(delivered as u64, Ordering::Relaxed);
        if !stale.is_empty() {
            self.stats
                .messages_dropped
                .fetch_add(stale.len() as u64, Ordering::Relaxed);
            let mut members = self.members.write().await;
            for id in &stale {
                members.remove(id);
            }
            log::trace!("Pruned {} closed member(s)", stale.len());
        }
        delivered
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, conn_id: &Uuid) -> bool {
        self.members.read().await.contains_key(conn_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.member_count().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Session;

    fn event() -> ServerEvent {
        ServerEvent::QueryDelta {
            query_id: 0,
            deltas: vec![],
        }
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let group = BroadcastGroup::new();
        let (a, mut rx_a) = Connection::new(Session::server());
        let (b, mut rx_b) = Connection::new(Session::server());
        group.join(a.clone()).await;
        group.join(b.clone()).await;

        assert_eq!(group.broadcast(&event(), Some(a.id())).await, 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), event());
    }

    #[tokio::test]
    async fn test_closed_member_is_pruned() {
        let group = BroadcastGroup::new();
        let (a, mut rx_a) = Connection::new(Session::server());
        let (b, _rx_b) = Connection::new(Session::server());
        group.join(a.clone()).await;
        group.join(b.clone()).await;
        a.close();

        assert_eq!(group.broadcast(&event(), None).await, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(!group.has_member(&a.id()).await);

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.active_members, 1);
    }
}
