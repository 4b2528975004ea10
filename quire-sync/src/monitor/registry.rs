//! Registry of live connections, shared by the engine and the monitor.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::Connection;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conn: Arc<Connection>) {
        log::debug!("Registered connection {}", conn.id());
        self.connections.write().await.insert(conn.id(), conn);
    }

    pub async fn unregister(&self, conn_id: &Uuid) -> Option<Arc<Connection>> {
        self.connections.write().await.remove(conn_id)
    }

    pub async fn get(&self, conn_id: &Uuid) -> Option<Arc<Connection>> {
        self.connections.read().await.get(conn_id).cloned()
    }

    /// Drop closed connections. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut connections = self.connections.write().await;
        let before = connections.len();
        connections.retain(|_, conn| !conn.is_closed());
        let removed = before - connections.len();
        if removed > 0 {
            log::debug!("Swept {removed} closed connection(s)");
        }
        removed
    }

    /// Open connections at this instant.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| !c.is_closed())
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Session;

    #[tokio::test]
    async fn test_sweep_drops_closed() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = Connection::new(Session::server());
        let (b, _rx_b) = Connection::new(Session::server());
        registry.register(a.clone()).await;
        registry.register(b.clone()).await;

        b.close();
        assert_eq!(registry.snapshot().await.len(), 1);
        assert_eq!(registry.sweep().await, 1);
        assert_eq!(registry.len().await, 1);
        assert!(registry.get(&b.id()).await.is_none());
        assert!(registry.unregister(&a.id()).await.is_some());
        assert!(registry.is_empty().await);
    }
}
