//! # quire-sync: Realtime document synchronization for Quire
//!
//! Keeps shared project, user and translation-text documents consistent
//! across many connected clients using operational transformation, with
//! durable versioned history, per-collection schema migrations and
//! rule-based access control.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer  │
//! │ (per user)  │   bincode frames   │ (central)   │
//! └─────────────┘                    └──────┬──────┘
//!                                           │
//!                                    ┌──────┴──────┐
//!              AccessControl ◄────── │ SyncEngine  │ ──────► QueryManager
//!              MigrationRegistry ◄── │ (per-doc    │ ──────► BroadcastGroup
//!                                    │  writer)    │
//!                                    └──────┬──────┘
//!                                           │
//!                                    ┌──────┴──────┐
//!                                    │DocumentStore│  RocksStore / MemoryStore
//!                                    └─────────────┘
//!
//! ConnectionRegistry ──► ResourceMonitor ──► ReportSink (CSV)
//! ```
//!
//! ## Modules
//!
//! - [`ot`]: JSON and rich-text operations: apply, transform, diff
//! - [`document`]: snapshots, op records, committed ops
//! - [`store`]: versioned document persistence (RocksDB, in-memory)
//! - [`migration`]: per-collection schema migrations and fixture audit
//! - [`access`]: per-collection, per-operation authorization rules
//! - [`auth`]: handshake credentials resolved to sessions
//! - [`engine`]: the commit path, subscriptions and queries
//! - [`monitor`]: connection registry and periodic resource reports
//! - [`revert`]: restore documents to a historical version
//! - [`protocol`], [`server`], [`client`]: the WebSocket transport

pub mod access;
pub mod auth;
pub mod broadcast;
pub mod client;
pub mod collections;
pub mod connection;
pub mod document;
pub mod engine;
pub mod error;
pub mod migration;
pub mod models;
pub mod monitor;
pub mod ot;
pub mod protocol;
pub mod query;
pub mod revert;
pub mod server;
pub mod service;
pub mod store;

// Re-exports for convenience
pub use access::{rule, AccessControl, AccessRequest, AccessRule, DocReader, OperationKind, Session};
pub use auth::{Authenticator, Credentials, TokenAuthenticator};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use collections::{default_access, default_collections, default_fixtures, default_migrations, CollectionConfig};
pub use connection::{Connection, ServerEvent};
pub use document::{CommittedOp, DocKey, OpKind, OpRecord, Snapshot};
pub use engine::{EngineConfig, SyncEngine, SyncEngineBuilder};
pub use error::{ErrorCode, MigrationConfigError, StoreError, SyncError};
pub use migration::audit::{audit, AuditReport, MigrationFixture};
pub use migration::{fn_migration, migration, FnMigration, Migration, MigrationRegistry};
pub use models::{CollectionDocument, Project, ProjectRole, TextId, User};
pub use monitor::{
    ConnectionRegistry, CsvReportSink, MemorySink, MonitorConfig, MonitorHandle, ReportSink, ResourceMonitor,
    ResourceReport,
};
pub use ot::{DocData, DocType, Operation};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use query::{Query, QueryDelta};
pub use revert::{RevertManifest, RevertSummary, RevertTarget, SnapshotReverter};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use service::{DocumentService, LocalService};
pub use store::{DocumentStore, MemoryStore, RocksStore, StoreConfig};
