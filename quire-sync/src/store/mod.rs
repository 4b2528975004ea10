//! Document store adapters.
//!
//! ```text
//! ┌─────────────┐  append_op(expected_version)  ┌──────────────────────────┐
//! │ SyncEngine  │ ────────────────────────────► │ DocumentStore            │
//! │ (per-doc    │                               │  latest snapshot         │
//! │  writer)    │ ◄──── load_latest / ops ───── │  op records (history)    │
//! └─────────────┘                               │  milestone snapshots     │
//!                                               │  collection schema tags  │
//!                                               └──────────────────────────┘
//! ```
//!
//! History is kept as op records plus a milestone snapshot every
//! `milestone_interval` versions, so `load_at_version` replays at most that
//! many records. `compact_history` drops everything below a version; older
//! versions then report `NotFound`.

pub mod memory;
pub mod rocks;

use std::sync::Arc;

use async_trait::async_trait;

use crate::document::{DocKey, OpRecord, Snapshot};
use crate::error::StoreError;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Durable document state. All calls may suspend; errors are values.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Latest snapshot, or the empty version-0 snapshot if the document was never written.
    async fn load_latest(&self, key: &DocKey) -> Result<Snapshot, StoreError>;

    /// Commit `record` (applied to `expected_version`) and the snapshot it produced.
    /// Fails with `VersionConflict` if the stored version is not `expected_version`.
    async fn append_op(
        &self,
        key: &DocKey,
        expected_version: u64,
        record: &OpRecord,
        snapshot: &Snapshot,
    ) -> Result<u64, StoreError>;

    /// Snapshot as of `version`. `NotFound` if beyond the latest version or
    /// compacted away.
    async fn load_at_version(&self, key: &DocKey, version: u64) -> Result<Snapshot, StoreError>;

    /// Records with `from <= version < to`, in order. `NotFound` if any were compacted.
    async fn load_ops(&self, key: &DocKey, from: u64, to: u64) -> Result<Vec<OpRecord>, StoreError>;

    /// Ids of every document ever written in `collection`.
    async fn list_documents(&self, collection: &str) -> Result<Vec<String>, StoreError>;

    /// Drop history below `before_version`. Returns the number of records removed.
    async fn compact_history(&self, key: &DocKey, before_version: u64) -> Result<u64, StoreError>;

    /// Migration version every document of `collection` is known to have reached.
    async fn collection_schema_version(&self, collection: &str) -> Result<Option<u32>, StoreError>;

    async fn set_collection_schema_version(
        &self,
        collection: &str,
        version: u32,
    ) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: DocumentStore + ?Sized> DocumentStore for Arc<S> {
    async fn load_latest(&self, key: &DocKey) -> Result<Snapshot, StoreError> {
        (**self).load_latest(key).await
    }

    async fn append_op(
        &self,
        key: &DocKey,
        expected_version: u64,
        record: &OpRecord,
        snapshot: &Snapshot,
    ) -> Result<u64, StoreError> {
        (**self).append_op(key, expected_version, record, snapshot).await
    }

    async fn load_at_version(&self, key: &DocKey, version: u64) -> Result<Snapshot, StoreError> {
        (**self).load_at_version(key, version).await
    }

    async fn load_ops(&self, key: &DocKey, from: u64, to: u64) -> Result<Vec<OpRecord>, StoreError> {
        (**self).load_ops(key, from, to).await
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        (**self).list_documents(collection).await
    }

    async fn compact_history(&self, key: &DocKey, before_version: u64) -> Result<u64, StoreError> {
        (**self).compact_history(key, before_version).await
    }

    async fn collection_schema_version(&self, collection: &str) -> Result<Option<u32>, StoreError> {
        (**self).collection_schema_version(collection).await
    }

    async fn set_collection_schema_version(
        &self,
        collection: &str,
        version: u32,
    ) -> Result<(), StoreError> {
        (**self).set_collection_schema_version(collection, version).await
    }
}

/// Check a commit against the stored version and the snapshot it claims to produce.
pub(crate) fn check_append(
    key: &DocKey,
    stored_version: u64,
    expected_version: u64,
    record: &OpRecord,
    snapshot: &Snapshot,
) -> Result<(), StoreError> {
    if stored_version != expected_version {
        return Err(StoreError::VersionConflict {
            expected: expected_version,
            actual: stored_version,
        });
    }
    if record.version != expected_version || snapshot.version != expected_version + 1 {
        return Err(StoreError::Serialization(format!(
            "{key}: record {} / snapshot {} do not follow version {expected_version}",
            record.version, snapshot.version
        )));
    }
    Ok(())
}

/// Rebuild the snapshot at `version` from a base snapshot and the records after it.
pub(crate) fn rebuild(
    key: &DocKey,
    base: Snapshot,
    records: &[OpRecord],
    version: u64,
) -> Result<Snapshot, StoreError> {
    let snapshot = base
        .replay(records)
        .map_err(|e| StoreError::Serialization(format!("{key}: corrupt history: {e}")))?;
    if snapshot.version != version {
        return Err(StoreError::NotFound(format!("{key}@{version}")));
    }
    Ok(snapshot)
}

/// Milestone at or below `version`.
pub(crate) fn milestone_floor(version: u64, interval: u64) -> u64 {
    if interval == 0 {
        0
    } else {
        version - version % interval
    }
}
