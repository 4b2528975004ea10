//! Built-in collections: `projects`, `users` and `texts`.
//!
//! Hosting applications may register their own collections on the engine
//! builder; these defaults are what the `quire` binary serves.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::access::{rule, AccessControl, AccessRequest, AccessRule, DocReader, OperationKind, Session};
use crate::error::{MigrationConfigError, SyncError};
use crate::migration::audit::MigrationFixture;
use crate::migration::{fn_migration, MigrationRegistry};
use crate::models::{CollectionDocument, ProjectRole, TextId};
use crate::ot::{DocData, DocType, JsonComponent, JsonOp, Operation, PathSeg};

pub const PROJECTS: &str = "projects";
pub const USERS: &str = "users";
pub const TEXTS: &str = "texts";

/// Session role with full access to every document.
pub const SYSTEM_ADMIN: &str = "system_admin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionConfig {
    pub name: String,
    pub doc_type: DocType,
    /// Subscribing to a missing document succeeds with an empty v0 snapshot
    /// instead of `NotFound`.
    pub implicit_create: bool,
}

impl CollectionConfig {
    pub fn json(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            doc_type: DocType::Json,
            implicit_create: false,
        }
    }

    pub fn rich_text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            doc_type: DocType::RichText,
            implicit_create: false,
        }
    }

    pub fn implicit_create(mut self, enabled: bool) -> Self {
        self.implicit_create = enabled;
        self
    }
}

pub fn default_collections() -> Vec<CollectionConfig> {
    vec![
        CollectionConfig::json(PROJECTS),
        CollectionConfig::json(USERS),
        CollectionConfig::rich_text(TEXTS).implicit_create(true),
    ]
}

// ─── Access ─────────────────────────────────────────────────────────

fn privileged(session: &Session) -> bool {
    session.is_server || session.has_role(SYSTEM_ADMIN)
}

fn project_role(data: Option<&DocData>, session: &Session) -> Option<ProjectRole> {
    let user_id = session.user_id.as_deref()?;
    let doc = CollectionDocument::parse(PROJECTS, "", data?).ok()?;
    doc.as_project()?.role_of(user_id)
}

fn user_role(data: Option<&DocData>) -> Option<String> {
    data.and_then(|d| CollectionDocument::parse(USERS, "", d).ok())
        .and_then(|doc| doc.as_user().and_then(|u| u.role.clone()))
}

/// Texts inherit permissions from the owning project's `userRoles`.
struct TextRule {
    kind: OperationKind,
}

#[async_trait]
impl AccessRule for TextRule {
    async fn check(&self, request: &AccessRequest<'_>, reader: &dyn DocReader) -> Result<bool, SyncError> {
        if privileged(request.session) {
            return Ok(true);
        }
        let Ok(text_id) = TextId::parse(request.id) else {
            return Ok(false);
        };
        let project = reader.read(PROJECTS, &text_id.project_id).await?;
        let Some(role) = project_role(project.data.as_ref(), request.session) else {
            return Ok(false);
        };
        Ok(match self.kind {
            OperationKind::Read => true,
            OperationKind::Create | OperationKind::Update => role.can_edit_texts(),
            OperationKind::Delete => role == ProjectRole::Administrator,
        })
    }
}

pub fn default_access() -> AccessControl {
    let mut access = AccessControl::new()
        .allow(
            PROJECTS,
            OperationKind::Read,
            rule(|req| privileged(req.session) || project_role(req.old, req.session).is_some()),
        )
        .allow(PROJECTS, OperationKind::Create, rule(|req| privileged(req.session)))
        .allow(
            PROJECTS,
            OperationKind::Update,
            rule(|req| {
                privileged(req.session) || project_role(req.old, req.session) == Some(ProjectRole::Administrator)
            }),
        )
        .allow(PROJECTS, OperationKind::Delete, rule(|req| privileged(req.session)))
        .allow(
            USERS,
            OperationKind::Read,
            rule(|req| privileged(req.session) || req.session.user_id.as_deref() == Some(req.id)),
        )
        .allow(USERS, OperationKind::Create, rule(|req| privileged(req.session)))
        .allow(
            USERS,
            OperationKind::Update,
            rule(|req| {
                // Users edit their own profile but cannot promote themselves.
                privileged(req.session)
                    || (req.session.user_id.as_deref() == Some(req.id) && user_role(req.old) == user_role(req.new))
            }),
        )
        .allow(USERS, OperationKind::Delete, rule(|req| privileged(req.session)));

    for kind in [
        OperationKind::Create,
        OperationKind::Read,
        OperationKind::Update,
        OperationKind::Delete,
    ] {
        let text_rule: Arc<dyn AccessRule> = Arc::new(TextRule { kind });
        access = access.allow(TEXTS, kind, text_rule);
    }
    access
}

// ─── Migrations ─────────────────────────────────────────────────────

fn project_add_editable(mut data: Value) -> Result<Value, SyncError> {
    if let Some(obj) = data.as_object_mut() {
        obj.entry("editable").or_insert(json!(true));
    }
    Ok(data)
}

fn project_add_share_enabled(mut data: Value) -> Result<Value, SyncError> {
    let Some(obj) = data.as_object_mut() else {
        return Ok(data);
    };
    let config = obj.entry("translateConfig").or_insert_with(|| json!({}));
    match config.as_object_mut() {
        Some(config) => {
            config.entry("shareEnabled").or_insert(json!(false));
        }
        None => *config = json!({"shareEnabled": false}),
    }
    Ok(data)
}

fn project_remove_tag_icon(mut data: Value) -> Result<Value, SyncError> {
    if let Some(obj) = data.as_object_mut() {
        obj.remove("tagIcon");
    }
    Ok(data)
}

fn user_add_display_name(mut data: Value) -> Result<Value, SyncError> {
    if let Some(obj) = data.as_object_mut() {
        if !obj.contains_key("displayName") {
            let name = obj.get("name").cloned().unwrap_or(Value::Null);
            obj.insert("displayName".into(), name);
        }
    }
    Ok(data)
}

// Ops submitted against the old shape. Whole-document sets go through the
// data migration; other components pass unless the migration dropped their field.

fn rewrite_json_op(
    op: &Operation,
    migrate: fn(Value) -> Result<Value, SyncError>,
    dropped: Option<&str>,
) -> Result<Option<Operation>, SyncError> {
    let Operation::Json(json_op) = op else {
        return Ok(Some(op.clone()));
    };
    let mut kept = Vec::with_capacity(json_op.components().len());
    for component in json_op.components() {
        match component {
            JsonComponent::Set { path, value } if path.is_empty() => kept.push(JsonComponent::Set {
                path: Vec::new(),
                value: migrate(value.clone())?,
            }),
            c if dropped.is_some_and(|key| c.path().first() == Some(&PathSeg::from(key))) => {}
            c => kept.push(c.clone()),
        }
    }
    Ok((!kept.is_empty()).then(|| Operation::Json(JsonOp(kept))))
}

fn project_add_editable_op(op: &Operation) -> Result<Option<Operation>, SyncError> {
    rewrite_json_op(op, project_add_editable, None)
}

fn project_add_share_enabled_op(op: &Operation) -> Result<Option<Operation>, SyncError> {
    rewrite_json_op(op, project_add_share_enabled, None)
}

fn project_remove_tag_icon_op(op: &Operation) -> Result<Option<Operation>, SyncError> {
    rewrite_json_op(op, project_remove_tag_icon, Some("tagIcon"))
}

fn user_add_display_name_op(op: &Operation) -> Result<Option<Operation>, SyncError> {
    rewrite_json_op(op, user_add_display_name, None)
}

pub fn default_migrations() -> Result<MigrationRegistry, MigrationConfigError> {
    MigrationRegistry::builder()
        .collection(
            PROJECTS,
            vec![
                fn_migration(1, "add editable flag", project_add_editable)
                    .with_op(project_add_editable_op)
                    .into_arc(),
                fn_migration(2, "add translateConfig.shareEnabled", project_add_share_enabled)
                    .with_op(project_add_share_enabled_op)
                    .into_arc(),
                fn_migration(3, "drop tagIcon", project_remove_tag_icon)
                    .with_op(project_remove_tag_icon_op)
                    .into_arc(),
            ],
        )
        .collection(
            USERS,
            vec![fn_migration(1, "default displayName to name", user_add_display_name)
                .with_op(user_add_display_name_op)
                .into_arc()],
        )
        .build()
}

/// Before/after pairs covering every default migration.
pub fn default_fixtures() -> Vec<MigrationFixture> {
    vec![
        MigrationFixture::new(
            PROJECTS,
            1,
            json!({"name": "Genesis"}),
            json!({"name": "Genesis", "editable": true}),
        ),
        MigrationFixture::new(
            PROJECTS,
            2,
            json!({"name": "Genesis", "editable": true}),
            json!({"name": "Genesis", "editable": true, "translateConfig": {"shareEnabled": false}}),
        ),
        MigrationFixture::new(
            PROJECTS,
            3,
            json!({"name": "Genesis", "tagIcon": "flag"}),
            json!({"name": "Genesis"}),
        ),
        MigrationFixture::new(
            USERS,
            1,
            json!({"name": "Ada"}),
            json!({"name": "Ada", "displayName": "Ada"}),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocKey, Snapshot};
    use crate::migration::audit::audit;

    struct OneProject(Snapshot);

    #[async_trait]
    impl DocReader for OneProject {
        async fn read(&self, collection: &str, id: &str) -> Result<Snapshot, SyncError> {
            if collection == PROJECTS && id == self.0.id {
                Ok(self.0.clone())
            } else {
                Ok(Snapshot::empty(&DocKey::new(collection, id)))
            }
        }
    }

    fn project_p1() -> OneProject {
        let mut snapshot = Snapshot::empty(&DocKey::new(PROJECTS, "p1"));
        snapshot.version = 1;
        snapshot.data = Some(DocData::Json(json!({
            "name": "Genesis",
            "userRoles": {"admin": "pt_administrator", "obs": "pt_observer", "tr": "pt_translator"}
        })));
        OneProject(snapshot)
    }

    fn text_request<'a>(kind: OperationKind, session: &'a Session) -> AccessRequest<'a> {
        AccessRequest {
            collection: TEXTS,
            kind,
            id: "p1:GEN:1",
            old: None,
            new: None,
            session,
        }
    }

    #[test]
    fn test_default_fixtures_cover_every_migration() {
        let report = audit(&default_migrations().unwrap(), &default_fixtures());
        assert!(report.is_success(), "{report}");
        assert_eq!(report.passed, 4);
    }

    #[tokio::test]
    async fn test_text_rules_follow_project_roles() {
        let access = default_access();
        let reader = project_p1();
        let observer = Session::user("obs", "user");
        let translator = Session::user("tr", "user");
        let stranger = Session::user("nobody", "user");

        assert!(access.authorize(&text_request(OperationKind::Read, &observer), &reader).await.unwrap());
        assert!(!access.authorize(&text_request(OperationKind::Update, &observer), &reader).await.unwrap());
        assert!(access.authorize(&text_request(OperationKind::Update, &translator), &reader).await.unwrap());
        assert!(!access.authorize(&text_request(OperationKind::Delete, &translator), &reader).await.unwrap());
        assert!(!access.authorize(&text_request(OperationKind::Read, &stranger), &reader).await.unwrap());
    }

    #[tokio::test]
    async fn test_users_cannot_promote_themselves() {
        let access = default_access();
        let session = Session::user("u1", "user");
        let old = DocData::Json(json!({"name": "Ada", "role": "user"}));
        let renamed = DocData::Json(json!({"name": "Ada L", "role": "user"}));
        let promoted = DocData::Json(json!({"name": "Ada", "role": SYSTEM_ADMIN}));
        let mut req = AccessRequest {
            collection: USERS,
            kind: OperationKind::Update,
            id: "u1",
            old: Some(&old),
            new: Some(&renamed),
            session: &session,
        };
        let reader = project_p1();
        assert!(access.authorize(&req, &reader).await.unwrap());
        req.new = Some(&promoted);
        assert!(!access.authorize(&req, &reader).await.unwrap());
    }
}
