//! Operation codec: the two content models a collection can hold and the
//! apply / transform / diff primitives over them.
//!
//! ```text
//!            base version v
//!           /              \
//!     applied (v → v+1)    incoming (based on v)
//!           \              /
//!   incoming.transform(applied)  applies to v+1
//! ```

pub mod json;
pub mod text;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

pub use json::{JsonComponent, JsonOp, PathSeg};
pub use text::{Attributes, Delta, TextComponent};

/// Content model of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocType {
    Json,
    RichText,
}

impl std::fmt::Display for DocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocType::Json => write!(f, "json"),
            DocType::RichText => write!(f, "rich-text"),
        }
    }
}

/// Materialized document content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "kebab-case")]
pub enum DocData {
    Json(Value),
    RichText(Delta),
}

impl DocData {
    pub fn doc_type(&self) -> DocType {
        match self {
            DocData::Json(_) => DocType::Json,
            DocData::RichText(_) => DocType::RichText,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            DocData::Json(v) => Some(v),
            DocData::RichText(_) => None,
        }
    }

    /// Untyped view, used by migrations and queries.
    pub fn to_value(&self) -> Value {
        match self {
            DocData::Json(v) => v.clone(),
            DocData::RichText(delta) => serde_json::to_value(delta).unwrap_or(Value::Null),
        }
    }

    pub fn from_value(doc_type: DocType, value: Value) -> Result<Self, SyncError> {
        match doc_type {
            DocType::Json => Ok(DocData::Json(value)),
            DocType::RichText => {
                let delta: Delta = serde_json::from_value(value)
                    .map_err(|e| SyncError::InvalidOp(format!("not a text document: {e}")))?;
                if !delta.is_document() {
                    return Err(SyncError::InvalidOp(
                        "text document may only contain inserts".into(),
                    ));
                }
                Ok(DocData::RichText(delta))
            }
        }
    }

    /// Empty document of the given type.
    pub fn empty(doc_type: DocType) -> Self {
        match doc_type {
            DocType::Json => DocData::Json(Value::Object(Default::default())),
            DocType::RichText => DocData::RichText(Delta::new()),
        }
    }
}

/// An edit in one of the content models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "op", rename_all = "kebab-case")]
pub enum Operation {
    Json(JsonOp),
    RichText(Delta),
}

impl Operation {
    pub fn doc_type(&self) -> DocType {
        match self {
            Operation::Json(_) => DocType::Json,
            Operation::RichText(_) => DocType::RichText,
        }
    }

    /// Edit that changes nothing.
    pub fn noop(doc_type: DocType) -> Self {
        match doc_type {
            DocType::Json => Operation::Json(JsonOp::new()),
            DocType::RichText => Operation::RichText(Delta::new()),
        }
    }

    pub fn is_noop(&self) -> bool {
        match self {
            Operation::Json(op) => op.is_noop(),
            Operation::RichText(delta) => delta.is_noop(),
        }
    }

    pub fn apply(&self, data: &DocData) -> Result<DocData, SyncError> {
        match (self, data) {
            (Operation::Json(op), DocData::Json(doc)) => Ok(DocData::Json(op.apply(doc)?)),
            (Operation::RichText(delta), DocData::RichText(doc)) => {
                Ok(DocData::RichText(delta.apply(doc)?))
            }
            _ => Err(type_mismatch(self.doc_type(), data.doc_type())),
        }
    }

    /// Rebase `self` over `applied`, which committed first.
    pub fn transform(&self, applied: &Operation) -> Result<Operation, SyncError> {
        match (self, applied) {
            (Operation::Json(op), Operation::Json(prior)) => Ok(Operation::Json(op.transform(prior)?)),
            (Operation::RichText(delta), Operation::RichText(prior)) => {
                Ok(Operation::RichText(delta.transform(prior)))
            }
            _ => Err(type_mismatch(self.doc_type(), applied.doc_type())),
        }
    }

    /// Operation turning `old` into `new`.
    pub fn diff(old: &DocData, new: &DocData) -> Result<Operation, SyncError> {
        match (old, new) {
            (DocData::Json(a), DocData::Json(b)) => Ok(Operation::Json(JsonOp::diff(a, b))),
            (DocData::RichText(a), DocData::RichText(b)) => {
                Ok(Operation::RichText(Delta::diff(a, b)))
            }
            _ => Err(type_mismatch(old.doc_type(), new.doc_type())),
        }
    }
}

fn type_mismatch(expected: DocType, found: DocType) -> SyncError {
    SyncError::InvalidOp(format!("{expected} operation against {found} document"))
}
