//! Typed views of the built-in collections.
//!
//! Stored documents are JSON (or rich text) whose shape is only changed by
//! migrations. These types describe the current shape and are what rules and
//! tools read; unknown fields are ignored so older readers keep working.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::collections::{PROJECTS, TEXTS, USERS};
use crate::error::SyncError;
use crate::ot::{DocData, Delta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectRole {
    #[serde(rename = "pt_administrator")]
    Administrator,
    #[serde(rename = "pt_translator")]
    Translator,
    #[serde(rename = "pt_consultant")]
    Consultant,
    #[serde(rename = "pt_observer")]
    Observer,
}

impl ProjectRole {
    pub fn can_edit_texts(self) -> bool {
        matches!(self, ProjectRole::Administrator | ProjectRole::Translator)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateConfig {
    #[serde(default)]
    pub share_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub user_roles: BTreeMap<String, ProjectRole>,
    #[serde(default = "default_true")]
    pub editable: bool,
    #[serde(default)]
    pub translate_config: TranslateConfig,
}

fn default_true() -> bool {
    true
}

impl Project {
    pub fn role_of(&self, user_id: &str) -> Option<ProjectRole> {
        self.user_roles.get(user_id).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// System role, mirrors the session role.
    #[serde(default)]
    pub role: Option<String>,
}

/// `<projectId>:<book>:<chapter>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextId {
    pub project_id: String,
    pub book: String,
    pub chapter: u32,
}

impl TextId {
    pub fn parse(id: &str) -> Result<Self, SyncError> {
        let mut parts = id.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(project), Some(book), Some(chapter), None) if !project.is_empty() && !book.is_empty() => {
                let chapter = chapter
                    .parse()
                    .map_err(|_| SyncError::InvalidOp(format!("bad chapter in text id '{id}'")))?;
                Ok(Self {
                    project_id: project.to_string(),
                    book: book.to_string(),
                    chapter,
                })
            }
            _ => Err(SyncError::InvalidOp(format!(
                "text id '{id}' is not <project>:<book>:<chapter>"
            ))),
        }
    }
}

impl std::fmt::Display for TextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.project_id, self.book, self.chapter)
    }
}

/// A document of one of the built-in collections, tagged by collection.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionDocument {
    Project(Project),
    User(User),
    Text { id: TextId, content: Delta },
}

impl CollectionDocument {
    pub fn parse(collection: &str, id: &str, data: &DocData) -> Result<Self, SyncError> {
        let invalid = |e: serde_json::Error| SyncError::InvalidOp(format!("{collection}/{id}: {e}"));
        match (collection, data) {
            (PROJECTS, DocData::Json(v)) => {
                Ok(Self::Project(serde_json::from_value(v.clone()).map_err(invalid)?))
            }
            (USERS, DocData::Json(v)) => Ok(Self::User(serde_json::from_value(v.clone()).map_err(invalid)?)),
            (TEXTS, DocData::RichText(delta)) => Ok(Self::Text {
                id: TextId::parse(id)?,
                content: delta.clone(),
            }),
            _ => Err(SyncError::InvalidOp(format!(
                "{} document is not a {collection} document",
                data.doc_type()
            ))),
        }
    }

    pub fn as_project(&self) -> Option<&Project> {
        match self {
            Self::Project(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&User> {
        match self {
            Self::User(u) => Some(u),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_project() {
        let data = DocData::Json(json!({
            "name": "Genesis",
            "userRoles": {"u1": "pt_administrator", "u2": "pt_observer"},
            "translateConfig": {"shareEnabled": true},
            "someLegacyField": 1
        }));
        let doc = CollectionDocument::parse(PROJECTS, "p1", &data).unwrap();
        let project = doc.as_project().unwrap();
        assert_eq!(project.role_of("u1"), Some(ProjectRole::Administrator));
        assert_eq!(project.role_of("u3"), None);
        assert!(project.editable);
        assert!(project.translate_config.share_enabled);
    }

    #[test]
    fn test_text_id() {
        let id = TextId::parse("p1:GEN:3").unwrap();
        assert_eq!(id.project_id, "p1");
        assert_eq!(id.chapter, 3);
        assert_eq!(id.to_string(), "p1:GEN:3");
        assert!(TextId::parse("p1:GEN").is_err());
        assert!(TextId::parse("p1:GEN:x").is_err());
        assert!(TextId::parse(":GEN:1").is_err());
    }

    #[test]
    fn test_wrong_content_model() {
        let data = DocData::RichText(Delta::from_text("x"));
        assert!(CollectionDocument::parse(PROJECTS, "p1", &data).is_err());
    }
}
