//! Snapshots and committed operation records.
//!
//! Version convention: a document that was never created sits at version 0.
//! Every committed record (create, edit, delete, migration) moves the
//! document forward by exactly one. A record stored with `version = v` was
//! applied to snapshot `v` and produced snapshot `v + 1`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;
use crate::ot::{DocData, DocType, Operation};

/// Collection-qualified document address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub collection: String,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A document's materialized state at one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub collection: String,
    pub id: String,
    pub version: u64,
    /// `None` until created, and again after deletion.
    pub data: Option<DocData>,
    /// Highest migration applied to `data`.
    pub schema_version: u32,
}

impl Snapshot {
    /// The version-0 snapshot of a document that does not exist yet.
    pub fn empty(key: &DocKey) -> Self {
        Self {
            collection: key.collection.clone(),
            id: key.id.clone(),
            version: 0,
            data: None,
            schema_version: 0,
        }
    }

    pub fn key(&self) -> DocKey {
        DocKey::new(&self.collection, &self.id)
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn doc_type(&self) -> Option<DocType> {
        self.data.as_ref().map(DocData::doc_type)
    }

    /// Produce the snapshot that results from committing `record` on top of this one.
    pub fn apply(&self, record: &OpRecord) -> Result<Snapshot, SyncError> {
        if record.version != self.version {
            return Err(SyncError::InvalidOp(format!(
                "record for version {} applied to {}@{}",
                record.version,
                self.key(),
                self.version
            )));
        }
        let data = match (&record.kind, &self.data) {
            (OpKind::Create { data }, None) => Some(data.clone()),
            (OpKind::Create { .. }, Some(_)) => {
                return Err(SyncError::InvalidOp(format!("{} already exists", self.key())))
            }
            (OpKind::Edit { op }, Some(current)) => Some(op.apply(current)?),
            (OpKind::Delete, Some(_)) => None,
            (OpKind::Edit { .. } | OpKind::Delete, None) => {
                return Err(SyncError::InvalidOp(format!("{} does not exist", self.key())))
            }
        };
        Ok(Snapshot {
            collection: self.collection.clone(),
            id: self.id.clone(),
            version: self.version + 1,
            data,
            schema_version: record.schema_version,
        })
    }

    /// Replay `records` in order starting from this snapshot.
    pub fn replay<'a>(
        &self,
        records: impl IntoIterator<Item = &'a OpRecord>,
    ) -> Result<Snapshot, SyncError> {
        records
            .into_iter()
            .try_fold(self.clone(), |snapshot, record| snapshot.apply(record))
    }
}

/// What a committed record did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OpKind {
    Create { data: DocData },
    Edit { op: Operation },
    Delete,
}

impl OpKind {
    pub fn edit(op: Operation) -> Self {
        OpKind::Edit { op }
    }

    /// Rebase `self` over a record that committed after the submitter's base.
    pub fn transform(self, applied: &OpRecord) -> Result<OpKind, SyncError> {
        match (&applied.kind, self) {
            (OpKind::Create { .. }, OpKind::Create { .. }) => Err(SyncError::VersionConflict(
                "document was created concurrently".into(),
            )),
            (OpKind::Create { .. }, _) => Err(SyncError::VersionConflict(
                "operation predates document creation".into(),
            )),
            (OpKind::Delete, OpKind::Create { data }) => Ok(OpKind::Create { data }),
            (OpKind::Delete, _) => Err(SyncError::VersionConflict(
                "document was deleted concurrently".into(),
            )),
            (OpKind::Edit { .. }, OpKind::Create { .. }) => Err(SyncError::VersionConflict(
                "document already exists".into(),
            )),
            (OpKind::Edit { .. }, OpKind::Delete) => Ok(OpKind::Delete),
            (OpKind::Edit { op: prior }, OpKind::Edit { op }) => Ok(OpKind::Edit {
                op: op.transform(prior)?,
            }),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OpKind::Create { .. } => "create",
            OpKind::Edit { .. } => "edit",
            OpKind::Delete => "delete",
        }
    }
}

/// One committed entry of a document's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpRecord {
    /// Version this record was applied to.
    pub version: u64,
    pub kind: OpKind,
    /// Submitting connection; `None` for server-originated records.
    pub source: Option<Uuid>,
    /// Schema version of the snapshot this record produces.
    pub schema_version: u32,
    /// Set on records written by the migration engine.
    #[serde(default)]
    pub migration: bool,
    /// Schema version a migration record started from.
    #[serde(default)]
    pub migrated_from: u32,
    pub timestamp: DateTime<Utc>,
}

impl OpRecord {
    pub fn new(version: u64, kind: OpKind, source: Option<Uuid>, schema_version: u32) -> Self {
        Self {
            version,
            kind,
            source,
            schema_version,
            migration: false,
            migrated_from: 0,
            timestamp: Utc::now(),
        }
    }

    /// Record of migrations `from_schema + 1 ..= schema_version`.
    pub fn migration(version: u64, op: Operation, from_schema: u32, schema_version: u32) -> Self {
        Self {
            migration: true,
            migrated_from: from_schema,
            ..Self::new(version, OpKind::edit(op), None, schema_version)
        }
    }
}

/// A committed record as pushed to subscribers, tagged with the version it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedOp {
    pub collection: String,
    pub id: String,
    pub version: u64,
    pub kind: OpKind,
    pub source: Option<Uuid>,
    #[serde(default)]
    pub migration: bool,
}

impl CommittedOp {
    pub fn from_record(key: &DocKey, record: &OpRecord) -> Self {
        Self {
            collection: key.collection.clone(),
            id: key.id.clone(),
            version: record.version + 1,
            kind: record.kind.clone(),
            source: record.source,
            migration: record.migration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::{json::path, JsonOp};
    use serde_json::json;

    fn edit(field: &str, value: serde_json::Value) -> OpKind {
        OpKind::edit(Operation::Json(JsonOp::new().set(path(&[field]), value)))
    }

    #[test]
    fn test_lifecycle_versions() {
        let key = DocKey::new("projects", "p1");
        let s0 = Snapshot::empty(&key);
        let create = OpRecord::new(
            0,
            OpKind::Create { data: DocData::Json(json!({"name": "A"})) },
            None,
            3,
        );
        let s1 = s0.apply(&create).unwrap();
        assert_eq!(s1.version, 1);
        assert_eq!(s1.schema_version, 3);

        let s2 = s1.apply(&OpRecord::new(1, edit("name", json!("B")), None, 3)).unwrap();
        assert_eq!(s2.data, Some(DocData::Json(json!({"name": "B"}))));

        let s3 = s2.apply(&OpRecord::new(2, OpKind::Delete, None, 3)).unwrap();
        assert_eq!(s3.version, 3);
        assert!(!s3.exists());
    }

    #[test]
    fn test_apply_rejects_wrong_version() {
        let key = DocKey::new("projects", "p1");
        let record = OpRecord::new(4, OpKind::Delete, None, 0);
        assert!(Snapshot::empty(&key).apply(&record).is_err());
    }

    #[test]
    fn test_replay_matches_stepwise() {
        let key = DocKey::new("projects", "p1");
        let records = vec![
            OpRecord::new(0, OpKind::Create { data: DocData::Json(json!({})) }, None, 0),
            OpRecord::new(1, edit("name", json!("A")), None, 0),
            OpRecord::new(2, edit("status", json!("draft")), None, 0),
        ];
        let out = Snapshot::empty(&key).replay(&records).unwrap();
        assert_eq!(out.version, 3);
        assert_eq!(out.data, Some(DocData::Json(json!({"name": "A", "status": "draft"}))));
    }

    #[test]
    fn test_kind_transform_rules() {
        let created = OpRecord::new(0, OpKind::Create { data: DocData::Json(json!({})) }, None, 0);
        let deleted = OpRecord::new(3, OpKind::Delete, None, 0);
        let edited = OpRecord::new(3, edit("name", json!("A")), None, 0);

        let create = OpKind::Create { data: DocData::Json(json!({})) };
        assert!(matches!(create.clone().transform(&created), Err(SyncError::VersionConflict(_))));
        assert!(create.clone().transform(&deleted).is_ok());
        assert!(matches!(edit("x", json!(1)).transform(&deleted), Err(SyncError::VersionConflict(_))));
        assert_eq!(OpKind::Delete.transform(&edited).unwrap(), OpKind::Delete);
        assert_eq!(
            edit("status", json!("x")).transform(&edited).unwrap(),
            edit("status", json!("x"))
        );
    }
}
