//! In-process store for tests, benches and ephemeral servers.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_append, milestone_floor, rebuild, DocumentStore};
use crate::document::{DocKey, OpRecord, Snapshot};
use crate::error::StoreError;

const DEFAULT_MILESTONE_INTERVAL: u64 = 100;

#[derive(Debug)]
struct History {
    latest: Snapshot,
    ops: BTreeMap<u64, OpRecord>,
    milestones: BTreeMap<u64, Snapshot>,
    /// Versions below this were compacted away.
    retained_from: u64,
}

impl History {
    fn new(key: &DocKey) -> Self {
        Self {
            latest: Snapshot::empty(key),
            ops: BTreeMap::new(),
            milestones: BTreeMap::new(),
            retained_from: 0,
        }
    }

    fn ops_between(&self, key: &DocKey, from: u64, to: u64) -> Result<Vec<OpRecord>, StoreError> {
        if from < self.retained_from || to > self.latest.version {
            return Err(StoreError::NotFound(format!("{key} ops {from}..{to}")));
        }
        let ops: Vec<OpRecord> = self.ops.range(from..to).map(|(_, r)| r.clone()).collect();
        if ops.len() as u64 != to.saturating_sub(from) {
            return Err(StoreError::NotFound(format!("{key} ops {from}..{to}")));
        }
        Ok(ops)
    }

    fn snapshot_at(&self, key: &DocKey, version: u64) -> Result<Snapshot, StoreError> {
        if version > self.latest.version || version < self.retained_from {
            return Err(StoreError::NotFound(format!("{key}@{version}")));
        }
        if version == self.latest.version {
            return Ok(self.latest.clone());
        }
        let base = match self.milestones.range(..=version).next_back() {
            Some((_, snapshot)) => snapshot.clone(),
            None if self.retained_from == 0 => Snapshot::empty(key),
            None => return Err(StoreError::NotFound(format!("{key}@{version}"))),
        };
        let records = self.ops_between(key, base.version, version)?;
        rebuild(key, base, &records, version)
    }
}

/// Store keeping every document in memory, with the same history semantics
/// as [`RocksStore`](super::RocksStore).
pub struct MemoryStore {
    docs: RwLock<HashMap<DocKey, History>>,
    schema: RwLock<HashMap<String, u32>>,
    milestone_interval: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_milestone_interval(DEFAULT_MILESTONE_INTERVAL)
    }

    pub fn with_milestone_interval(milestone_interval: u64) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            schema: RwLock::new(HashMap::new()),
            milestone_interval,
        }
    }

    /// Number of documents held.
    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load_latest(&self, key: &DocKey) -> Result<Snapshot, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs
            .get(key)
            .map(|h| h.latest.clone())
            .unwrap_or_else(|| Snapshot::empty(key)))
    }

    async fn append_op(
        &self,
        key: &DocKey,
        expected_version: u64,
        record: &OpRecord,
        snapshot: &Snapshot,
    ) -> Result<u64, StoreError> {
        let mut docs = self.docs.write().await;
        let stored_version = docs.get(key).map_or(0, |h| h.latest.version);
        check_append(key, stored_version, expected_version, record, snapshot)?;
        let history = docs.entry(key.clone()).or_insert_with(|| History::new(key));

        history.ops.insert(record.version, record.clone());
        history.latest = snapshot.clone();
        if self.milestone_interval > 0 && snapshot.version % self.milestone_interval == 0 {
            history.milestones.insert(snapshot.version, snapshot.clone());
        }
        log::trace!("memory store: {key} -> v{}", snapshot.version);
        Ok(snapshot.version)
    }

    async fn load_at_version(&self, key: &DocKey, version: u64) -> Result<Snapshot, StoreError> {
        let docs = self.docs.read().await;
        match docs.get(key) {
            Some(history) => history.snapshot_at(key, version),
            None if version == 0 => Ok(Snapshot::empty(key)),
            None => Err(StoreError::NotFound(format!("{key}@{version}"))),
        }
    }

    async fn load_ops(&self, key: &DocKey, from: u64, to: u64) -> Result<Vec<OpRecord>, StoreError> {
        if from >= to {
            return Ok(Vec::new());
        }
        let docs = self.docs.read().await;
        match docs.get(key) {
            Some(history) => history.ops_between(key, from, to),
            None => Err(StoreError::NotFound(format!("{key} ops {from}..{to}"))),
        }
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        let docs = self.docs.read().await;
        let mut ids: Vec<String> = docs
            .keys()
            .filter(|k| k.collection == collection)
            .map(|k| k.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn compact_history(&self, key: &DocKey, before_version: u64) -> Result<u64, StoreError> {
        let mut docs = self.docs.write().await;
        let Some(history) = docs.get_mut(key) else {
            return Ok(0);
        };
        let before = before_version.min(history.latest.version);
        if before <= history.retained_from {
            return Ok(0);
        }
        let floor = history.snapshot_at(key, before)?;

        let kept_ops = history.ops.split_off(&before);
        let removed = history.ops.len() as u64;
        history.ops = kept_ops;
        history.milestones = history.milestones.split_off(&before);
        history.milestones.insert(before, floor);
        history.retained_from = before;

        log::debug!(
            "memory store: compacted {removed} records of {key} below v{before} (milestone floor {})",
            milestone_floor(before, self.milestone_interval)
        );
        Ok(removed)
    }

    async fn collection_schema_version(&self, collection: &str) -> Result<Option<u32>, StoreError> {
        Ok(self.schema.read().await.get(collection).copied())
    }

    async fn set_collection_schema_version(
        &self,
        collection: &str,
        version: u32,
    ) -> Result<(), StoreError> {
        self.schema.write().await.insert(collection.to_string(), version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::OpKind;
    use crate::ot::{json::path, DocData, JsonOp, Operation};
    use serde_json::json;

    /// Write a create followed by `edits` counter edits; returns the final snapshot.
    async fn seed(store: &MemoryStore, key: &DocKey, edits: u64) -> Snapshot {
        let mut snapshot = Snapshot::empty(key);
        let create = OpRecord::new(0, OpKind::Create { data: DocData::Json(json!({"n": 0})) }, None, 0);
        let next = snapshot.apply(&create).unwrap();
        store.append_op(key, 0, &create, &next).await.unwrap();
        snapshot = next;
        for n in 1..=edits {
            let op = Operation::Json(JsonOp::new().set(path(&["n"]), json!(n)));
            let record = OpRecord::new(snapshot.version, OpKind::edit(op), None, 0);
            let next = snapshot.apply(&record).unwrap();
            store.append_op(key, snapshot.version, &record, &next).await.unwrap();
            snapshot = next;
        }
        snapshot
    }

    #[tokio::test]
    async fn test_missing_document_is_version_zero() {
        let store = MemoryStore::new();
        let key = DocKey::new("projects", "none");
        let latest = store.load_latest(&key).await.unwrap();
        assert_eq!(latest.version, 0);
        assert!(!latest.exists());
        assert!(store.load_at_version(&key, 0).await.is_ok());
        assert!(store.load_at_version(&key, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_append_rejected() {
        let store = MemoryStore::new();
        let key = DocKey::new("projects", "p1");
        let latest = seed(&store, &key, 2).await;
        assert_eq!(latest.version, 3);

        let record = OpRecord::new(1, OpKind::Delete, None, 0);
        let result = store.append_op(&key, 1, &record, &latest).await;
        assert_eq!(result, Err(StoreError::VersionConflict { expected: 1, actual: 3 }));
        assert_eq!(store.load_latest(&key).await.unwrap(), latest);
    }

    #[tokio::test]
    async fn test_rejected_append_creates_nothing() {
        let store = MemoryStore::new();
        let key = DocKey::new("projects", "ghost");
        let mut snapshot = Snapshot::empty(&key);
        snapshot.version = 4;
        let record = OpRecord::new(3, OpKind::Delete, None, 0);

        let result = store.append_op(&key, 3, &record, &snapshot).await;
        assert_eq!(result, Err(StoreError::VersionConflict { expected: 3, actual: 0 }));
        assert!(store.is_empty().await);
        assert!(store.list_documents("projects").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_at_version_uses_milestones() {
        let store = MemoryStore::with_milestone_interval(4);
        let key = DocKey::new("projects", "p1");
        seed(&store, &key, 10).await;

        for v in 1..=11u64 {
            let snapshot = store.load_at_version(&key, v).await.unwrap();
            assert_eq!(snapshot.version, v);
            assert_eq!(snapshot.data, Some(DocData::Json(json!({"n": v - 1}))));
        }
        assert!(store.load_at_version(&key, 12).await.is_err());
    }

    #[tokio::test]
    async fn test_compaction_hides_old_versions() {
        let store = MemoryStore::with_milestone_interval(4);
        let key = DocKey::new("projects", "p1");
        seed(&store, &key, 10).await;

        let removed = store.compact_history(&key, 6).await.unwrap();
        assert_eq!(removed, 6);
        assert!(matches!(
            store.load_at_version(&key, 5).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.load_ops(&key, 3, 8).await.is_err());

        let v6 = store.load_at_version(&key, 6).await.unwrap();
        assert_eq!(v6.data, Some(DocData::Json(json!({"n": 5}))));
        assert_eq!(store.load_ops(&key, 6, 11).await.unwrap().len(), 5);

        // Compacting again below the floor is a no-op.
        assert_eq!(store.compact_history(&key, 3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_and_schema_tags() {
        let store = MemoryStore::new();
        seed(&store, &DocKey::new("projects", "b"), 0).await;
        seed(&store, &DocKey::new("projects", "a"), 0).await;
        seed(&store, &DocKey::new("users", "u1"), 0).await;

        assert_eq!(store.list_documents("projects").await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.collection_schema_version("projects").await.unwrap(), None);
        store.set_collection_schema_version("projects", 3).await.unwrap();
        assert_eq!(store.collection_schema_version("projects").await.unwrap(), Some(3));
    }
}
