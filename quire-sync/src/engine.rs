//! The synchronization core.
//!
//! ```text
//!  submit_op ──► spawn ──► lock doc ──► transform ──► apply ──► authorize
//!                                                                  │
//!        subscribers ◄── broadcast ◄── memory ◄── persist (retry) ◄┘
//!        queries     ◄── on_commit ◄──┘
//! ```
//!
//! Each open document has one FIFO mutex; every read-modify-write of that
//! document runs under it, so commits are serialized per document and
//! parallel across documents. Broadcasts and query deltas are sent before
//! the lock is released, which gives every connection version order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard, RwLock};

use crate::access::{AccessControl, AccessRequest, DocReader, OperationKind, Session};
use crate::broadcast::BroadcastGroup;
use crate::collections::CollectionConfig;
use crate::connection::{Connection, ServerEvent};
use crate::document::{CommittedOp, DocKey, OpKind, OpRecord, Snapshot};
use crate::error::{MigrationConfigError, StoreError, SyncError};
use crate::migration::MigrationRegistry;
use crate::monitor::ConnectionRegistry;
use crate::ot::Operation;
use crate::query::{Query, QueryManager};
use crate::store::{DocumentStore, MemoryStore};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retries of a failed persist before the submit fails with `PersistenceUnavailable`.
    pub persist_retries: u32,
    /// First retry delay, doubled on every further retry.
    pub persist_backoff: Duration,
    /// Unsubscribed documents are evicted after this long without activity.
    pub idle_timeout: Duration,
    /// Skip the startup sweep of [`SyncEngine::migrate_if_necessary`].
    /// Documents are still migrated lazily when loaded.
    pub migrations_disabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            persist_retries: 3,
            persist_backoff: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(300),
            migrations_disabled: false,
        }
    }
}

impl EngineConfig {
    pub fn for_testing() -> Self {
        Self {
            persist_retries: 3,
            persist_backoff: Duration::from_millis(1),
            idle_timeout: Duration::from_millis(20),
            migrations_disabled: false,
        }
    }
}

/// Lifecycle of a loaded document. Unloaded documents have no state at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocPhase {
    Loading,
    Migrating,
    Ready,
    Mutating,
}

struct DocState {
    phase: DocPhase,
    snapshot: Snapshot,
    last_active: Instant,
}

impl DocState {
    fn enter(&mut self, phase: DocPhase) {
        log::trace!(
            "{}/{}: {:?} -> {:?}",
            self.snapshot.collection,
            self.snapshot.id,
            self.phase,
            phase
        );
        self.phase = phase;
    }
}

struct DocEntry {
    state: Arc<Mutex<Option<DocState>>>,
    room: BroadcastGroup,
    /// Set under the state lock when the entry leaves the table.
    evicted: AtomicBool,
}

impl DocEntry {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
            room: BroadcastGroup::new(),
            evicted: AtomicBool::new(false),
        }
    }
}

type DocGuard = OwnedMutexGuard<Option<DocState>>;

fn loaded(guard: &mut DocGuard) -> Result<&mut DocState, SyncError> {
    guard
        .as_mut()
        .ok_or_else(|| SyncError::Internal("document state missing after load".into()))
}

/// Shutdown coordination: new submissions are refused once `closing` is set,
/// and `shutdown` waits for `in_flight` to reach zero.
#[derive(Default)]
struct Drain {
    closing: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

struct InFlight(Arc<Drain>);

impl Drain {
    fn begin(self: &Arc<Self>) -> Result<InFlight, SyncError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(self.clone());
        if self.closing.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }
        Ok(guard)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Rule-facing reads: latest stored state, migrated in memory, no document locks.
struct StoreReader<'a> {
    engine: &'a SyncEngine,
}

#[async_trait]
impl DocReader for StoreReader<'_> {
    async fn read(&self, collection: &str, id: &str) -> Result<Snapshot, SyncError> {
        self.engine.read_migrated(&DocKey::new(collection, id)).await
    }
}

pub struct SyncEngine {
    store: Arc<dyn DocumentStore>,
    collections: HashMap<String, CollectionConfig>,
    registry: MigrationRegistry,
    access: AccessControl,
    config: EngineConfig,
    documents: RwLock<HashMap<DocKey, Arc<DocEntry>>>,
    connections: Arc<ConnectionRegistry>,
    queries: QueryManager,
    drain: Arc<Drain>,
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::default()
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn collection(&self, name: &str) -> Result<&CollectionConfig, SyncError> {
        self.collections
            .get(name)
            .ok_or_else(|| SyncError::NotFound(format!("unknown collection '{name}'")))
    }

    pub async fn loaded_documents(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn query_count(&self) -> usize {
        self.queries.len().await
    }

    fn reader(&self) -> StoreReader<'_> {
        StoreReader { engine: self }
    }

    // ─── Connections ────────────────────────────────────────────────

    pub async fn connect(&self, session: Session) -> (Arc<Connection>, tokio::sync::mpsc::UnboundedReceiver<ServerEvent>) {
        let (conn, rx) = Connection::new(session);
        self.connections.register(conn.clone()).await;
        log::info!(
            "Connection {} opened (user: {:?}, server: {})",
            conn.id(),
            conn.session().user_id,
            conn.session().is_server
        );
        (conn, rx)
    }

    /// Close `conn` and drop every subscription it holds. In-flight submits
    /// from it still commit.
    pub async fn disconnect(&self, conn: &Arc<Connection>) {
        conn.close();
        for (collection, id) in conn.subscriptions().await {
            self.leave_room(conn, &DocKey::new(collection, id)).await;
        }
        let queries = self.queries.remove_connection(conn.id()).await;
        self.connections.unregister(&conn.id()).await;
        log::info!("Connection {} closed ({} queries dropped)", conn.id(), queries);
    }

    async fn leave_room(&self, conn: &Connection, key: &DocKey) -> bool {
        conn.remove_subscription(&key.collection, &key.id).await;
        let entry = self.documents.read().await.get(key).cloned();
        match entry {
            Some(entry) => entry.room.leave(&conn.id()).await,
            None => false,
        }
    }

    // ─── Loading ────────────────────────────────────────────────────

    async fn entry(&self, key: &DocKey) -> Arc<DocEntry> {
        if let Some(entry) = self.documents.read().await.get(key) {
            return entry.clone();
        }
        self.documents
            .write()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(DocEntry::new()))
            .clone()
    }

    /// Lock a document, loading (and migrating) it first if needed.
    async fn lock_doc(&self, key: &DocKey) -> Result<(Arc<DocEntry>, DocGuard), SyncError> {
        loop {
            let entry = self.entry(key).await;
            let mut guard = entry.state.clone().lock_owned().await;
            if entry.evicted.load(Ordering::Acquire) {
                continue;
            }
            if guard.is_none() {
                let (state, migration) = self.load_state(key).await?;
                *guard = Some(state);
                if let Some(record) = migration {
                    let snapshot = loaded(&mut guard)?.snapshot.clone();
                    self.publish(&entry, key, &record, &snapshot, None).await;
                }
            }
            return Ok((entry, guard));
        }
    }

    async fn load_state(&self, key: &DocKey) -> Result<(DocState, Option<OpRecord>), SyncError> {
        let mut state = DocState {
            phase: DocPhase::Loading,
            snapshot: self.store.load_latest(key).await?,
            last_active: Instant::now(),
        };
        let latest = self.registry.latest_version(&key.collection);
        let mut migration = None;
        if state.snapshot.exists() && state.snapshot.schema_version < latest {
            state.enter(DocPhase::Migrating);
            let record = self.migration_record(&state.snapshot, latest)?;
            let next = state.snapshot.apply(&record)?;
            self.persist(key, &record, &next).await?;
            log::info!(
                "Migrated {key} from schema v{} to v{} at version {}",
                state.snapshot.schema_version,
                next.schema_version,
                next.version
            );
            state.snapshot = next;
            migration = Some(record);
        }
        state.enter(DocPhase::Ready);
        Ok((state, migration))
    }

    /// One record covering the whole gap to `latest`, written even if the
    /// migrated data is unchanged so the schema tag advances.
    fn migration_record(&self, snapshot: &Snapshot, latest: u32) -> Result<OpRecord, SyncError> {
        let Some(data) = &snapshot.data else {
            return Err(SyncError::Internal(format!("cannot migrate deleted {}", snapshot.key())));
        };
        let (migrated, reached) =
            self.registry
                .migrate_doc(&snapshot.collection, data, snapshot.schema_version, latest)?;
        let op = Operation::diff(data, &migrated)?;
        Ok(OpRecord::migration(snapshot.version, op, snapshot.schema_version, reached))
    }

    /// Latest stored snapshot with its data migrated in memory only.
    async fn read_migrated(&self, key: &DocKey) -> Result<Snapshot, SyncError> {
        let mut snapshot = self.store.load_latest(key).await?;
        let latest = self.registry.latest_version(&key.collection);
        if let Some(data) = &snapshot.data {
            if snapshot.schema_version < latest {
                let (migrated, reached) =
                    self.registry
                        .migrate_doc(&key.collection, data, snapshot.schema_version, latest)?;
                snapshot.data = Some(migrated);
                snapshot.schema_version = reached;
            }
        }
        Ok(snapshot)
    }

    // ─── Reads ──────────────────────────────────────────────────────

    async fn authorize_read(&self, session: &Session, snapshot: &Snapshot) -> Result<(), SyncError> {
        let request = AccessRequest {
            collection: &snapshot.collection,
            kind: OperationKind::Read,
            id: &snapshot.id,
            old: snapshot.data.as_ref(),
            new: None,
            session,
        };
        self.access.require(&request, &self.reader()).await
    }

    /// Never-created documents are `NotFound` unless the collection creates
    /// implicitly. Deleted documents keep their history and are returned.
    fn check_exists(&self, config: &CollectionConfig, snapshot: &Snapshot) -> Result<(), SyncError> {
        if snapshot.version > 0 || config.implicit_create {
            Ok(())
        } else {
            Err(SyncError::NotFound(snapshot.key().to_string()))
        }
    }

    /// Subscribe `conn` to a document and return the snapshot every later
    /// op it receives builds on.
    pub async fn subscribe(&self, conn: &Arc<Connection>, collection: &str, id: &str) -> Result<Snapshot, SyncError> {
        let config = self.collection(collection)?;
        let key = DocKey::new(collection, id);
        let (entry, mut guard) = self.lock_doc(&key).await?;
        let state = loaded(&mut guard)?;
        self.check_exists(config, &state.snapshot)?;
        self.authorize_read(conn.session(), &state.snapshot).await?;

        entry.room.join(conn.clone()).await;
        conn.add_subscription(collection, id).await;
        state.last_active = Instant::now();
        log::debug!("Connection {} subscribed to {key}@{}", conn.id(), state.snapshot.version);
        Ok(state.snapshot.clone())
    }

    pub async fn unsubscribe(&self, conn: &Arc<Connection>, collection: &str, id: &str) -> bool {
        self.leave_room(conn, &DocKey::new(collection, id)).await
    }

    /// Latest snapshot without subscribing.
    pub async fn fetch(&self, session: &Session, collection: &str, id: &str) -> Result<Snapshot, SyncError> {
        let config = self.collection(collection)?;
        let key = DocKey::new(collection, id);
        let (_entry, mut guard) = self.lock_doc(&key).await?;
        let state = loaded(&mut guard)?;
        self.check_exists(config, &state.snapshot)?;
        self.authorize_read(session, &state.snapshot).await?;
        state.last_active = Instant::now();
        Ok(state.snapshot.clone())
    }

    /// Historical snapshot, exactly as stored at `version`.
    pub async fn fetch_snapshot(
        &self,
        session: &Session,
        collection: &str,
        id: &str,
        version: u64,
    ) -> Result<Snapshot, SyncError> {
        self.collection(collection)?;
        let snapshot = self
            .store
            .load_at_version(&DocKey::new(collection, id), version)
            .await?;
        self.authorize_read(session, &snapshot).await?;
        Ok(snapshot)
    }

    // ─── Writes ─────────────────────────────────────────────────────

    /// Commit `kind`, written against `base_version`, and return the version
    /// it produced. The commit runs in its own task and completes even if
    /// the caller goes away.
    pub async fn submit_op(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        collection: &str,
        id: &str,
        base_version: u64,
        kind: OpKind,
    ) -> Result<u64, SyncError> {
        let in_flight = self.drain.begin()?;
        let config = self.collection(collection)?;
        let doc_type = match &kind {
            OpKind::Create { data } => Some(data.doc_type()),
            OpKind::Edit { op } => Some(op.doc_type()),
            OpKind::Delete => None,
        };
        if let Some(doc_type) = doc_type {
            if doc_type != config.doc_type {
                return Err(SyncError::InvalidOp(format!(
                    "{doc_type} operation on {} collection '{collection}'",
                    config.doc_type
                )));
            }
        }

        let engine = self.clone();
        let conn = conn.clone();
        let key = DocKey::new(collection, id);
        let task = tokio::spawn(async move {
            let _in_flight = in_flight;
            engine.commit(&conn, &key, base_version, kind).await
        });
        task.await
            .map_err(|e| SyncError::Internal(format!("commit task failed: {e}")))?
    }

    async fn commit(&self, conn: &Arc<Connection>, key: &DocKey, base_version: u64, kind: OpKind) -> Result<u64, SyncError> {
        let (entry, mut guard) = self.lock_doc(key).await?;
        let state = loaded(&mut guard)?;
        state.enter(DocPhase::Mutating);
        let result = self.commit_locked(&entry, state, conn, key, base_version, kind).await;
        state.enter(DocPhase::Ready);
        state.last_active = Instant::now();
        result
    }

    async fn commit_locked(
        &self,
        entry: &DocEntry,
        state: &mut DocState,
        conn: &Arc<Connection>,
        key: &DocKey,
        base_version: u64,
        kind: OpKind,
    ) -> Result<u64, SyncError> {
        let current = state.snapshot.version;
        if base_version > current {
            return Err(SyncError::InvalidOp(format!(
                "base version {base_version} is ahead of {key}@{current}"
            )));
        }

        let mut kind = kind;
        if base_version < current {
            let concurrent = self
                .store
                .load_ops(key, base_version, current)
                .await
                .map_err(|e| match e {
                    StoreError::NotFound(_) => SyncError::VersionConflict(format!(
                        "history of {key} before v{current} is no longer available"
                    )),
                    other => other.into(),
                })?;
            for record in &concurrent {
                kind = self.rebase(&key.collection, kind, record)?;
            }
            log::trace!(
                "Transformed {} on {key} across {} record(s)",
                kind.label(),
                concurrent.len()
            );
        }

        let schema_version = match &kind {
            OpKind::Create { .. } => self.registry.latest_version(&key.collection),
            _ => state.snapshot.schema_version,
        };
        let record = OpRecord::new(current, kind, Some(conn.id()), schema_version);
        let next = state.snapshot.apply(&record)?;

        let (access_kind, old, new) = match &record.kind {
            OpKind::Create { .. } => (OperationKind::Create, None, next.data.as_ref()),
            OpKind::Edit { .. } => (OperationKind::Update, state.snapshot.data.as_ref(), next.data.as_ref()),
            OpKind::Delete => (OperationKind::Delete, state.snapshot.data.as_ref(), None),
        };
        let request = AccessRequest {
            collection: &key.collection,
            kind: access_kind,
            id: &key.id,
            old,
            new,
            session: conn.session(),
        };
        self.access.require(&request, &self.reader()).await?;

        self.persist(key, &record, &next).await?;
        state.snapshot = next;
        log::debug!(
            "Committed {} on {key}: v{} -> v{} (connection {})",
            record.kind.label(),
            current,
            state.snapshot.version,
            conn.id()
        );
        self.publish(entry, key, &record, &state.snapshot, Some(conn.id())).await;
        Ok(state.snapshot.version)
    }

    /// Move `kind` past one record. Edits crossing a migration record are
    /// rewritten by the migrations instead of transformed over its diff.
    fn rebase(&self, collection: &str, kind: OpKind, record: &OpRecord) -> Result<OpKind, SyncError> {
        match kind {
            OpKind::Edit { op } if record.migration => {
                let doc_type = op.doc_type();
                let migrated = self
                    .registry
                    .migrate_op(collection, op, record.migrated_from, record.schema_version)?;
                Ok(OpKind::edit(migrated.unwrap_or_else(|| Operation::noop(doc_type))))
            }
            other => other.transform(record),
        }
    }

    async fn persist(&self, key: &DocKey, record: &OpRecord, snapshot: &Snapshot) -> Result<(), SyncError> {
        let mut backoff = self.config.persist_backoff;
        let mut attempt = 0;
        loop {
            match self.store.append_op(key, record.version, record, snapshot).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Unavailable(msg)) if attempt < self.config.persist_retries => {
                    attempt += 1;
                    log::warn!(
                        "Persisting {key}@{} failed (attempt {attempt}): {msg}; retrying in {backoff:?}",
                        snapshot.version
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    log::error!("Persisting {key}@{} failed: {e}", snapshot.version);
                    return Err(e.into());
                }
            }
        }
    }

    /// Fan a committed record out to subscribers and queries. Called with
    /// the document lock held.
    async fn publish(
        &self,
        entry: &DocEntry,
        key: &DocKey,
        record: &OpRecord,
        snapshot: &Snapshot,
        except: Option<uuid::Uuid>,
    ) {
        let event = ServerEvent::Op(CommittedOp::from_record(key, record));
        let delivered = entry.room.broadcast(&event, except).await;
        log::trace!("{key}@{}: delivered to {delivered} subscriber(s)", snapshot.version);
        self.queries
            .on_commit(snapshot, &self.access, &self.reader())
            .await;
    }

    // ─── Queries ────────────────────────────────────────────────────

    pub async fn subscribe_query(&self, conn: &Arc<Connection>, query: Query) -> Result<(u64, Vec<Snapshot>), SyncError> {
        self.collection(&query.collection)?;
        let collection = query.collection.clone();
        let scan = async {
            let mut snapshots = Vec::new();
            for id in self.store.list_documents(&collection).await? {
                let snapshot = self.read_migrated(&DocKey::new(collection.as_str(), id)).await?;
                if snapshot.exists() {
                    snapshots.push(snapshot);
                }
            }
            Ok::<_, SyncError>(snapshots)
        };
        self.queries
            .subscribe(conn, query, scan, &self.access, &self.reader())
            .await
    }

    pub async fn unsubscribe_query(&self, query_id: u64) -> bool {
        self.queries.unsubscribe(query_id).await
    }

    // ─── Maintenance ────────────────────────────────────────────────

    /// Load every document of each collection whose recorded schema
    /// version lags, migrating it, then record the collection as current.
    /// Returns the number of documents migrated.
    pub async fn migrate_if_necessary(&self) -> Result<usize, SyncError> {
        if self.config.migrations_disabled {
            log::info!("Startup migrations disabled");
            return Ok(0);
        }
        let collections: Vec<String> = self.registry.collections().map(str::to_string).collect();
        let mut migrated = 0;
        for collection in collections {
            let latest = self.registry.latest_version(&collection);
            let recorded = self
                .store
                .collection_schema_version(&collection)
                .await?
                .unwrap_or(0);
            if recorded >= latest {
                continue;
            }
            log::info!("Migrating '{collection}' from schema v{recorded} to v{latest}");
            for id in self.store.list_documents(&collection).await? {
                let key = DocKey::new(collection.as_str(), id);
                let stored = self.store.load_latest(&key).await?;
                if stored.exists() && stored.schema_version < latest {
                    self.lock_doc(&key).await?;
                    migrated += 1;
                }
            }
            self.store
                .set_collection_schema_version(&collection, latest)
                .await?;
        }
        Ok(migrated)
    }

    /// Unload documents with no subscribers that sat idle past
    /// `idle_timeout`. Busy documents are skipped.
    pub async fn evict_idle(&self) -> usize {
        let entries: Vec<(DocKey, Arc<DocEntry>)> = self
            .documents
            .read()
            .await
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        let mut evicted = 0;
        for (key, entry) in entries {
            let Ok(guard) = entry.state.try_lock() else {
                continue;
            };
            let idle = guard
                .as_ref()
                .map_or(true, |s| s.last_active.elapsed() >= self.config.idle_timeout);
            if !idle || entry.room.member_count().await > 0 {
                continue;
            }
            entry.evicted.store(true, Ordering::Release);
            let mut documents = self.documents.write().await;
            if documents.get(&key).is_some_and(|e| Arc::ptr_eq(e, &entry)) {
                documents.remove(&key);
            }
            drop(guard);
            evicted += 1;
        }
        if evicted > 0 {
            log::debug!("Evicted {evicted} idle document(s)");
        }
        evicted
    }

    /// Refuse new submissions and wait for in-flight commits to finish.
    pub async fn shutdown(&self) {
        self.drain.closing.store(true, Ordering::SeqCst);
        loop {
            let notified = self.drain.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let pending = self.drain.in_flight.load(Ordering::SeqCst);
            if pending == 0 {
                break;
            }
            log::info!("Waiting for {pending} in-flight commit(s)");
            notified.await;
        }
        log::info!("Sync engine drained");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.drain.closing.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct SyncEngineBuilder {
    store: Option<Arc<dyn DocumentStore>>,
    collections: Vec<CollectionConfig>,
    registry: MigrationRegistry,
    access: AccessControl,
    config: EngineConfig,
    connections: Option<Arc<ConnectionRegistry>>,
}

impl SyncEngineBuilder {
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn collection(mut self, config: CollectionConfig) -> Self {
        self.collections.push(config);
        self
    }

    pub fn collections(mut self, configs: impl IntoIterator<Item = CollectionConfig>) -> Self {
        self.collections.extend(configs);
        self
    }

    pub fn migrations(mut self, registry: MigrationRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn access(mut self, access: AccessControl) -> Self {
        self.access = access;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing registry, e.g. with a resource monitor.
    pub fn connections(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.connections = Some(registry);
        self
    }

    pub fn build(self) -> Result<Arc<SyncEngine>, SyncError> {
        let mut collections = HashMap::new();
        for config in self.collections {
            let name = config.name.clone();
            if collections.insert(name.clone(), config).is_some() {
                return Err(MigrationConfigError::DuplicateCollection(name).into());
            }
        }
        if let Some(unknown) = self
            .registry
            .collections()
            .find(|name| !collections.contains_key(*name))
        {
            return Err(MigrationConfigError::UnknownCollection(unknown.to_string()).into());
        }
        let store = self.store.unwrap_or_else(|| {
            log::warn!("No document store configured, keeping documents in memory");
            Arc::new(MemoryStore::new())
        });
        log::info!(
            "Sync engine ready: {} collection(s), migrations {:?}",
            collections.len(),
            self.registry
        );
        Ok(Arc::new(SyncEngine {
            store,
            collections,
            registry: self.registry,
            access: self.access,
            config: self.config,
            documents: RwLock::new(HashMap::new()),
            connections: self.connections.unwrap_or_default(),
            queries: QueryManager::new(),
            drain: Arc::new(Drain::default()),
        }))
    }
}
