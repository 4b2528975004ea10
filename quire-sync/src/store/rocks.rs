//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `snapshots`  — latest snapshot per document (LZ4 compressed JSON)
//! - `ops`        — committed op records, keyed by document + version (LZ4 compressed JSON)
//! - `milestones` — snapshot every `milestone_interval` versions (LZ4 compressed JSON)
//! - `metadata`   — per-document bookkeeping (bincode)
//! - `schema`     — migration version reached by each collection
//!
//! Keys are `<len:u32 BE><collection><len:u32 BE><id>`, followed by the
//! big-endian version for `ops` and `milestones`, so one document's history
//! is a contiguous, version-ordered range.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{check_append, rebuild, DocumentStore};
use crate::document::{DocKey, OpRecord, Snapshot};
use crate::error::StoreError;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_OPS: &str = "ops";
const CF_MILESTONES: &str = "milestones";
const CF_METADATA: &str = "metadata";
const CF_SCHEMA: &str = "schema";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_OPS, CF_MILESTONES, CF_METADATA, CF_SCHEMA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
    /// A milestone snapshot is written every this many versions (default: 1000)
    pub milestone_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
            milestone_interval: 1000,
        }
    }
}

impl StoreConfig {
    /// Small caches and frequent milestones.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            milestone_interval: 10,
        }
    }
}

/// Per-document bookkeeping stored alongside the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Latest committed version
    pub version: u64,
    /// Op records currently retained
    pub op_count: u64,
    /// Versions below this were compacted away
    pub retained_from: u64,
    /// Uncompressed latest snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed latest snapshot size in bytes
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: i64,
    pub updated_at: i64,
}

impl DocumentMetadata {
    fn new() -> Self {
        let now = Utc::now().timestamp();
        Self {
            version: 0,
            op_count: 0,
            retained_from: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// RocksDB-backed document store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes the version check with the batch write.
    commit_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            commit_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed by us.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SNAPSHOTS | CF_METADATA | CF_SCHEMA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPS => {
                // Many small appends, range-scanned per document
                opts.set_max_write_buffer_number(4);
            }
            CF_MILESTONES => {
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn load_metadata(&self, key: &DocKey) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_prefix(key))? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────

    fn latest(&self, key: &DocKey) -> Result<Snapshot, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, doc_prefix(key))? {
            Some(bytes) => decode_value(&bytes),
            None => Ok(Snapshot::empty(key)),
        }
    }

    fn ops_between(&self, key: &DocKey, from: u64, to: u64) -> Result<Vec<OpRecord>, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let prefix = doc_prefix(key);
        let start = versioned_key(key, from);

        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (k, value) = item?;
            let Some(version) = split_version(&k, &prefix) else {
                break;
            };
            if version >= to {
                break;
            }
            records.push(decode_value::<OpRecord>(&value)?);
        }

        let contiguous = records
            .iter()
            .enumerate()
            .all(|(i, r)| r.version == from + i as u64);
        if records.len() as u64 != to - from || !contiguous {
            return Err(StoreError::NotFound(format!("{key} ops {from}..{to}")));
        }
        Ok(records)
    }

    /// Nearest milestone at or below `version`.
    fn milestone_at_or_below(&self, key: &DocKey, version: u64) -> Result<Option<Snapshot>, StoreError> {
        let cf = self.cf(CF_MILESTONES)?;
        let prefix = doc_prefix(key);
        let start = versioned_key(key, version);
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (k, value) = item?;
                if split_version(&k, &prefix).is_some() {
                    Ok(Some(decode_value(&value)?))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    fn snapshot_at(
        &self,
        key: &DocKey,
        meta: &DocumentMetadata,
        version: u64,
    ) -> Result<Snapshot, StoreError> {
        if version > meta.version || version < meta.retained_from {
            return Err(StoreError::NotFound(format!("{key}@{version}")));
        }
        if version == meta.version {
            return self.latest(key);
        }
        let base = match self.milestone_at_or_below(key, version)? {
            Some(snapshot) => snapshot,
            None if meta.retained_from == 0 => Snapshot::empty(key),
            None => return Err(StoreError::NotFound(format!("{key}@{version}"))),
        };
        let records = self.ops_between(key, base.version, version)?;
        rebuild(key, base, &records, version)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Unavailable(format!("column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock_commits(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.commit_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("commit lock poisoned".into()))
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn load_latest(&self, key: &DocKey) -> Result<Snapshot, StoreError> {
        self.latest(key)
    }

    async fn append_op(
        &self,
        key: &DocKey,
        expected_version: u64,
        record: &OpRecord,
        snapshot: &Snapshot,
    ) -> Result<u64, StoreError> {
        let _guard = self.lock_commits()?;
        let mut meta = self.load_metadata(key)?.unwrap_or_else(DocumentMetadata::new);
        check_append(key, meta.version, expected_version, record, snapshot)?;

        let snapshot_json = serde_json::to_vec(snapshot)?;
        let compressed = lz4_flex::compress_prepend_size(&snapshot_json);

        meta.version = snapshot.version;
        meta.op_count += 1;
        meta.snapshot_size = snapshot_json.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = Utc::now().timestamp();

        let prefix = doc_prefix(key);
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_OPS)?,
            versioned_key(key, record.version),
            encode_value(record)?,
        );
        if self.config.milestone_interval > 0
            && snapshot.version % self.config.milestone_interval == 0
        {
            batch.put_cf(
                self.cf(CF_MILESTONES)?,
                versioned_key(key, snapshot.version),
                &compressed,
            );
        }
        batch.put_cf(self.cf(CF_SNAPSHOTS)?, &prefix, &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, &prefix, meta.encode()?);
        self.write(batch)?;

        Ok(snapshot.version)
    }

    async fn load_at_version(&self, key: &DocKey, version: u64) -> Result<Snapshot, StoreError> {
        match self.load_metadata(key)? {
            Some(meta) => self.snapshot_at(key, &meta, version),
            None if version == 0 => Ok(Snapshot::empty(key)),
            None => Err(StoreError::NotFound(format!("{key}@{version}"))),
        }
    }

    async fn load_ops(&self, key: &DocKey, from: u64, to: u64) -> Result<Vec<OpRecord>, StoreError> {
        if from >= to {
            return Ok(Vec::new());
        }
        let meta = self
            .load_metadata(key)?
            .ok_or_else(|| StoreError::NotFound(format!("{key} ops {from}..{to}")))?;
        if from < meta.retained_from || to > meta.version {
            return Err(StoreError::NotFound(format!("{key} ops {from}..{to}")));
        }
        self.ops_between(key, from, to)
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let prefix = collection_prefix(collection);
        let mut ids = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (k, _) = item?;
            if !k.starts_with(&prefix) {
                break;
            }
            let id = read_segment(&k[prefix.len()..])
                .ok_or_else(|| StoreError::Serialization("malformed metadata key".into()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn compact_history(&self, key: &DocKey, before_version: u64) -> Result<u64, StoreError> {
        let _guard = self.lock_commits()?;
        let Some(mut meta) = self.load_metadata(key)? else {
            return Ok(0);
        };
        let before = before_version.min(meta.version);
        if before <= meta.retained_from {
            return Ok(0);
        }
        let floor = self.snapshot_at(key, &meta, before)?;

        let prefix = doc_prefix(key);
        let start = versioned_key(key, 0);
        let mut batch = WriteBatch::default();
        let mut removed = 0u64;

        for name in [CF_OPS, CF_MILESTONES] {
            let cf = self.cf(name)?;
            let iter = self
                .db
                .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
            for item in iter {
                let (k, _) = item?;
                match split_version(&k, &prefix) {
                    Some(version) if version < before => {
                        batch.delete_cf(cf, &k);
                        if name == CF_OPS {
                            removed += 1;
                        }
                    }
                    _ => break,
                }
            }
        }

        batch.put_cf(
            self.cf(CF_MILESTONES)?,
            versioned_key(key, before),
            encode_value(&floor)?,
        );
        meta.retained_from = before;
        meta.op_count = meta.op_count.saturating_sub(removed);
        meta.updated_at = Utc::now().timestamp();
        batch.put_cf(self.cf(CF_METADATA)?, &prefix, meta.encode()?);
        self.write(batch)?;

        log::info!("Compacted {removed} records of {key} below v{before}");
        Ok(removed)
    }

    async fn collection_schema_version(&self, collection: &str) -> Result<Option<u32>, StoreError> {
        let cf = self.cf(CF_SCHEMA)?;
        match self.db.get_cf(cf, collection.as_bytes())? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Serialization("malformed schema tag".into()))?;
                Ok(Some(u32::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    async fn set_collection_schema_version(
        &self,
        collection: &str,
        version: u32,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_SCHEMA)?;
        self.db.put_cf(cf, collection.as_bytes(), version.to_be_bytes())?;
        Ok(())
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(lz4_flex::compress_prepend_size(&serde_json::to_vec(value)?))
}

fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    Ok(serde_json::from_slice(&raw)?)
}

fn push_segment(out: &mut Vec<u8>, segment: &str) {
    out.extend_from_slice(&(segment.len() as u32).to_be_bytes());
    out.extend_from_slice(segment.as_bytes());
}

fn read_segment(bytes: &[u8]) -> Option<String> {
    let len = u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?) as usize;
    let raw = bytes.get(4..4 + len)?;
    String::from_utf8(raw.to_vec()).ok()
}

fn collection_prefix(collection: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + collection.len());
    push_segment(&mut key, collection);
    key
}

fn doc_prefix(key: &DocKey) -> Vec<u8> {
    let mut out = collection_prefix(&key.collection);
    push_segment(&mut out, &key.id);
    out
}

fn versioned_key(key: &DocKey, version: u64) -> Vec<u8> {
    let mut out = doc_prefix(key);
    out.extend_from_slice(&version.to_be_bytes());
    out
}

/// Version suffix of `key` if it belongs to the document `prefix`.
fn split_version(key: &[u8], prefix: &[u8]) -> Option<u64> {
    if key.len() != prefix.len() + 8 || !key.starts_with(prefix) {
        return None;
    }
    Some(u64::from_be_bytes(key[prefix.len()..].try_into().ok()?))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
