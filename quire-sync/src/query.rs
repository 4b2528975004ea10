//! Live queries over a collection.
//!
//! A subscription keeps its ordered result ids. Every commit re-evaluates
//! only the committed document against each query of its collection and
//! pushes `Added` / `Removed` / `Moved` deltas when membership or position
//! changes. Lock order is document lock, then collection query lock.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::access::{AccessControl, AccessRequest, DocReader, OperationKind};
use crate::connection::{Connection, ServerEvent};
use crate::document::Snapshot;
use crate::error::SyncError;
use crate::ot::json::{lookup, PathSeg};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "lowercase")]
pub enum Test {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Exists,
}

impl Test {
    fn eval(&self, found: Option<&Value>) -> bool {
        match self {
            Test::Eq(v) => found == Some(v),
            Test::Ne(v) => found != Some(v),
            Test::In(vs) => found.is_some_and(|f| vs.contains(f)),
            Test::Exists => found.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub path: Vec<PathSeg>,
    pub test: Test,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub path: Vec<PathSeg>,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    #[serde(default)]
    pub filter: Vec<Condition>,
    #[serde(default)]
    pub sort: Option<SortKey>,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filter: Vec::new(),
            sort: None,
        }
    }

    pub fn filter(mut self, path: Vec<PathSeg>, test: Test) -> Self {
        self.filter.push(Condition { path, test });
        self
    }

    pub fn sort_by(mut self, path: Vec<PathSeg>, descending: bool) -> Self {
        self.sort = Some(SortKey { path, descending });
        self
    }

    /// Deleted and never-created documents match nothing.
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        let Some(data) = &snapshot.data else {
            return false;
        };
        if snapshot.collection != self.collection {
            return false;
        }
        let value = data.to_value();
        self.filter
            .iter()
            .all(|c| c.test.eval(lookup(&value, &c.path)))
    }

    fn entry(&self, snapshot: &Snapshot) -> ResultEntry {
        let sort_value = match (&self.sort, &snapshot.data) {
            (Some(key), Some(data)) => lookup(&data.to_value(), &key.path).cloned(),
            _ => None,
        };
        ResultEntry {
            id: snapshot.id.clone(),
            sort_value,
        }
    }

    fn compare(&self, a: &ResultEntry, b: &ResultEntry) -> Ordering {
        let by_key = match &self.sort {
            Some(key) => {
                let ord = compare_values(a.sort_value.as_ref(), b.sort_value.as_ref());
                if key.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
            None => Ordering::Equal,
        };
        by_key.then_with(|| a.id.cmp(&b.id))
    }
}

/// Missing < null < bool < number < string < array < object.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(Value::Array(_)) => 5,
            Some(Value::Object(_)) => 6,
        }
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Change to a query's ordered result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum QueryDelta {
    Added { id: String, index: usize, snapshot: Snapshot },
    Removed { id: String, index: usize },
    Moved { id: String, from: usize, to: usize },
}

#[derive(Debug, Clone)]
struct ResultEntry {
    id: String,
    sort_value: Option<Value>,
}

struct Subscription {
    query: Query,
    conn: Arc<Connection>,
    results: Vec<ResultEntry>,
}

impl Subscription {
    /// Re-place `snapshot` in the result set and return the resulting delta.
    fn update(&mut self, snapshot: &Snapshot, visible: bool) -> Option<QueryDelta> {
        let old_index = self.results.iter().position(|e| e.id == snapshot.id);
        if !visible {
            let index = old_index?;
            self.results.remove(index);
            return Some(QueryDelta::Removed {
                id: snapshot.id.clone(),
                index,
            });
        }
        if let Some(index) = old_index {
            self.results.remove(index);
        }
        let entry = self.query.entry(snapshot);
        let query = &self.query;
        let to = self
            .results
            .partition_point(|e| query.compare(e, &entry) == Ordering::Less);
        self.results.insert(to, entry);
        match old_index {
            None => Some(QueryDelta::Added {
                id: snapshot.id.clone(),
                index: to,
                snapshot: snapshot.clone(),
            }),
            Some(from) if from != to => Some(QueryDelta::Moved {
                id: snapshot.id.clone(),
                from,
                to,
            }),
            Some(_) => None,
        }
    }
}

#[derive(Default)]
struct CollectionQueries {
    subscriptions: HashMap<u64, Subscription>,
}

async fn readable(
    access: &AccessControl,
    reader: &dyn DocReader,
    conn: &Connection,
    snapshot: &Snapshot,
) -> bool {
    let request = AccessRequest {
        collection: &snapshot.collection,
        kind: OperationKind::Read,
        id: &snapshot.id,
        old: snapshot.data.as_ref(),
        new: None,
        session: conn.session(),
    };
    match access.authorize(&request, reader).await {
        Ok(allowed) => allowed,
        Err(e) => {
            log::warn!(
                "Read check for {}/{} failed, hiding from query: {}",
                snapshot.collection,
                snapshot.id,
                e
            );
            false
        }
    }
}

#[derive(Default)]
pub struct QueryManager {
    collections: RwLock<HashMap<String, Arc<Mutex<CollectionQueries>>>>,
    /// query id -> collection
    owners: RwLock<HashMap<u64, String>>,
    next_id: AtomicU64,
}

impl QueryManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn collection(&self, name: &str) -> Arc<Mutex<CollectionQueries>> {
        if let Some(c) = self.collections.read().await.get(name) {
            return c.clone();
        }
        self.collections
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Register `query` for `conn` and return its id with the initial
    /// ordered results. `scan` yields every candidate snapshot and runs while
    /// the collection's queries are locked, so no commit slips between the
    /// scan and the registration.
    pub async fn subscribe<F>(
        &self,
        conn: &Arc<Connection>,
        query: Query,
        scan: F,
        access: &AccessControl,
        reader: &dyn DocReader,
    ) -> Result<(u64, Vec<Snapshot>), SyncError>
    where
        F: Future<Output = Result<Vec<Snapshot>, SyncError>> + Send,
    {
        let collection = self.collection(&query.collection).await;
        let mut queries = collection.lock().await;

        let mut found = Vec::new();
        for snapshot in scan.await? {
            if query.matches(&snapshot) && readable(access, reader, conn, &snapshot).await {
                found.push(snapshot);
            }
        }
        let mut entries: Vec<(ResultEntry, Snapshot)> =
            found.into_iter().map(|s| (query.entry(&s), s)).collect();
        entries.sort_by(|(a, _), (b, _)| query.compare(a, b));

        let query_id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        let (results, snapshots): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        log::debug!(
            "Query {} on '{}' for connection {}: {} initial result(s)",
            query_id,
            query.collection,
            conn.id(),
            results.len()
        );
        self.owners
            .write()
            .await
            .insert(query_id, query.collection.clone());
        queries.subscriptions.insert(
            query_id,
            Subscription {
                query,
                conn: conn.clone(),
                results,
            },
        );
        conn.add_query(query_id).await;
        Ok((query_id, snapshots))
    }

    pub async fn unsubscribe(&self, query_id: u64) -> bool {
        let Some(name) = self.owners.write().await.remove(&query_id) else {
            return false;
        };
        let collection = self.collection(&name).await;
        let removed = collection.lock().await.subscriptions.remove(&query_id);
        match removed {
            Some(sub) => {
                sub.conn.remove_query(query_id).await;
                true
            }
            None => false,
        }
    }

    /// Drop every query owned by `conn_id`.
    pub async fn remove_connection(&self, conn_id: Uuid) -> usize {
        let collections: Vec<_> = self.collections.read().await.values().cloned().collect();
        let mut removed = Vec::new();
        for collection in collections {
            let mut queries = collection.lock().await;
            queries.subscriptions.retain(|id, sub| {
                if sub.conn.id() == conn_id {
                    removed.push(*id);
                    false
                } else {
                    true
                }
            });
        }
        let mut owners = self.owners.write().await;
        for id in &removed {
            owners.remove(id);
        }
        removed.len()
    }

    /// Re-evaluate the committed `snapshot` against every query of its collection.
    pub async fn on_commit(&self, snapshot: &Snapshot, access: &AccessControl, reader: &dyn DocReader) {
        let Some(collection) = self.collections.read().await.get(&snapshot.collection).cloned() else {
            return;
        };
        let mut queries = collection.lock().await;
        let mut closed = Vec::new();
        for (query_id, sub) in queries.subscriptions.iter_mut() {
            if sub.conn.is_closed() {
                closed.push(*query_id);
                continue;
            }
            let visible =
                sub.query.matches(snapshot) && readable(access, reader, &sub.conn, snapshot).await;
            let Some(delta) = sub.update(snapshot, visible) else {
                continue;
            };
            let event = ServerEvent::QueryDelta {
                query_id: *query_id,
                deltas: vec![delta],
            };
            if !sub.conn.send(event) {
                closed.push(*query_id);
            }
        }
        for id in &closed {
            queries.subscriptions.remove(id);
        }
        drop(queries);
        if !closed.is_empty() {
            let mut owners = self.owners.write().await;
            for id in &closed {
                owners.remove(id);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.owners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{rule, Session};
    use crate::document::DocKey;
    use crate::ot::json::path;
    use crate::ot::DocData;
    use async_trait::async_trait;
    use serde_json::json;

    struct NoDocs;

    #[async_trait]
    impl DocReader for NoDocs {
        async fn read(&self, collection: &str, id: &str) -> Result<Snapshot, SyncError> {
            Ok(Snapshot::empty(&DocKey::new(collection, id)))
        }
    }

    fn task(id: &str, version: u64, data: Value) -> Snapshot {
        Snapshot {
            collection: "tasks".into(),
            id: id.into(),
            version,
            data: Some(DocData::Json(data)),
            schema_version: 0,
        }
    }

    fn open_access() -> AccessControl {
        AccessControl::new().allow("tasks", OperationKind::Read, rule(|_| true))
    }

    #[test]
    fn test_filter_tests() {
        let doc = task("t1", 1, json!({"status": "open", "rank": 2}));
        let q = |test| Query::new("tasks").filter(path(&["status"]), test);
        assert!(q(Test::Eq(json!("open"))).matches(&doc));
        assert!(!q(Test::Ne(json!("open"))).matches(&doc));
        assert!(q(Test::In(vec![json!("done"), json!("open")])).matches(&doc));
        assert!(q(Test::Exists).matches(&doc));
        assert!(!Query::new("tasks").filter(path(&["owner"]), Test::Exists).matches(&doc));
        assert!(!Query::new("other").matches(&doc));
    }

    #[test]
    fn test_query_wire_shape() {
        let q: Query = serde_json::from_value(json!({
            "collection": "tasks",
            "filter": [{"path": ["status"], "test": {"op": "eq", "value": "open"}},
                       {"path": ["owner"], "test": {"op": "exists"}}],
            "sort": {"path": ["rank"]}
        }))
        .unwrap();
        assert_eq!(q.filter.len(), 2);
        assert_eq!(q.filter[1].test, Test::Exists);
        assert!(!q.sort.unwrap().descending);
    }

    #[tokio::test]
    async fn test_incremental_deltas() {
        let manager = QueryManager::new();
        let access = open_access();
        let (conn, mut rx) = Connection::new(Session::user("u1", "user"));
        let query = Query::new("tasks")
            .filter(path(&["status"]), Test::Eq(json!("open")))
            .sort_by(path(&["rank"]), false);

        let initial = vec![
            task("a", 1, json!({"status": "open", "rank": 2})),
            task("b", 1, json!({"status": "open", "rank": 1})),
            task("c", 1, json!({"status": "done", "rank": 0})),
        ];
        let (query_id, results) = manager
            .subscribe(&conn, query, async { Ok::<_, SyncError>(initial) }, &access, &NoDocs)
            .await
            .unwrap();
        let ids: Vec<_> = results.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        // c opens with the lowest rank: added at the front.
        manager
            .on_commit(&task("c", 2, json!({"status": "open", "rank": 0})), &access, &NoDocs)
            .await;
        let ServerEvent::QueryDelta { query_id: qid, deltas } = rx.recv().await.unwrap() else {
            panic!("expected query delta");
        };
        assert_eq!(qid, query_id);
        assert!(matches!(&deltas[0], QueryDelta::Added { id, index: 0, .. } if id == "c"));

        // c moves behind a.
        manager
            .on_commit(&task("c", 3, json!({"status": "open", "rank": 5})), &access, &NoDocs)
            .await;
        let ServerEvent::QueryDelta { deltas, .. } = rx.recv().await.unwrap() else {
            panic!("expected query delta");
        };
        assert_eq!(deltas, vec![QueryDelta::Moved { id: "c".into(), from: 0, to: 2 }]);

        // Content change without reordering emits nothing.
        manager
            .on_commit(&task("a", 2, json!({"status": "open", "rank": 2, "note": "x"})), &access, &NoDocs)
            .await;
        assert!(rx.try_recv().is_err());

        // b closes: removed.
        manager
            .on_commit(&task("b", 2, json!({"status": "done", "rank": 1})), &access, &NoDocs)
            .await;
        let ServerEvent::QueryDelta { deltas, .. } = rx.recv().await.unwrap() else {
            panic!("expected query delta");
        };
        assert_eq!(deltas, vec![QueryDelta::Removed { id: "b".into(), index: 0 }]);

        // Unrelated change to a non-member emits nothing.
        manager
            .on_commit(&task("z", 1, json!({"status": "done"})), &access, &NoDocs)
            .await;
        assert!(rx.try_recv().is_err());

        assert!(manager.unsubscribe(query_id).await);
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_unreadable_documents_are_hidden() {
        let manager = QueryManager::new();
        let access = AccessControl::new().allow(
            "tasks",
            OperationKind::Read,
            rule(|req| req.old.and_then(|d| d.as_json()).is_some_and(|v| v["public"] == json!(true))),
        );
        let (conn, _rx) = Connection::new(Session::user("u1", "user"));
        let initial = vec![
            task("a", 1, json!({"public": true})),
            task("b", 1, json!({"public": false})),
        ];
        let (_, results) = manager
            .subscribe(&conn, Query::new("tasks"), async { Ok::<_, SyncError>(initial) }, &access, &NoDocs)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "a");
    }

    #[tokio::test]
    async fn test_remove_connection() {
        let manager = QueryManager::new();
        let access = open_access();
        let (conn, _rx) = Connection::new(Session::server());
        for _ in 0..2 {
            manager
                .subscribe(&conn, Query::new("tasks"), async { Ok::<_, SyncError>(vec![]) }, &access, &NoDocs)
                .await
                .unwrap();
        }
        assert_eq!(manager.len().await, 2);
        assert_eq!(manager.remove_connection(conn.id()).await, 2);
        assert!(manager.is_empty().await);
    }
}
