//! Error taxonomy shared by the engine, the store adapters and the wire protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by synchronization operations.
///
/// `NotFound`, `Forbidden`, `VersionConflict` and `InvalidOp` are recovered at
/// the request boundary and reported to the calling connection. They never
/// leave a document partially mutated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("version conflict: {0}")]
    VersionConflict(String),
    #[error(transparent)]
    MigrationConfig(#[from] MigrationConfigError),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
    #[error("invalid operation: {0}")]
    InvalidOp(String),
    #[error("engine is shutting down")]
    ShuttingDown,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable error code carried in `Error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    NotFound,
    Forbidden,
    VersionConflict,
    MigrationConfig,
    Migration,
    PersistenceUnavailable,
    InvalidOp,
    ShuttingDown,
    Protocol,
    Internal,
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::VersionConflict(_) => ErrorCode::VersionConflict,
            Self::MigrationConfig(_) => ErrorCode::MigrationConfig,
            Self::Migration(_) => ErrorCode::Migration,
            Self::PersistenceUnavailable(_) => ErrorCode::PersistenceUnavailable,
            Self::InvalidOp(_) => ErrorCode::InvalidOp,
            Self::ShuttingDown => ErrorCode::ShuttingDown,
            Self::Protocol(_) => ErrorCode::Protocol,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Rebuild an error received from a remote server.
    pub fn from_remote(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::NotFound => Self::NotFound(message),
            ErrorCode::Forbidden => Self::Forbidden(message),
            ErrorCode::VersionConflict => Self::VersionConflict(message),
            ErrorCode::MigrationConfig => {
                Self::MigrationConfig(MigrationConfigError::Remote(message))
            }
            ErrorCode::Migration => Self::Migration(message),
            ErrorCode::PersistenceUnavailable => Self::PersistenceUnavailable(message),
            ErrorCode::InvalidOp => Self::InvalidOp(message),
            ErrorCode::ShuttingDown => Self::ShuttingDown,
            ErrorCode::Protocol => Self::Protocol(message),
            ErrorCode::Internal => Self::Internal(message),
        }
    }

    /// Whether a submit may be retried after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PersistenceUnavailable(_))
    }
}

/// Invalid migration registration. Fatal: the engine refuses to build.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationConfigError {
    #[error("collection '{collection}': first migration must be version 1, found {found}")]
    DoesNotStartAtOne { collection: String, found: u32 },
    #[error("collection '{collection}': migration {found} follows {previous}, expected {}", .previous + 1)]
    OutOfSequence {
        collection: String,
        previous: u32,
        found: u32,
    },
    #[error("collection '{0}' registered more than once")]
    DuplicateCollection(String),
    #[error("migrations registered for unknown collection '{0}'")]
    UnknownCollection(String),
    #[error("{0}")]
    Remote(String),
}

/// Errors raised by [`DocumentStore`](crate::store::DocumentStore) adapters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Backing store unreachable or failing.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("expected version {expected}, store is at {actual}")]
    VersionConflict { expected: u64, actual: u64 },
    /// Version missing, beyond latest, or removed by compaction.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => SyncError::PersistenceUnavailable(msg),
            StoreError::VersionConflict { .. } => SyncError::VersionConflict(e.to_string()),
            StoreError::NotFound(msg) => SyncError::NotFound(msg),
            StoreError::Serialization(msg) | StoreError::Compression(msg) => {
                SyncError::Internal(msg)
            }
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
