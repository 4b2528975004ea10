//! Access control evaluation.
//!
//! Rules are registered per `(collection, OperationKind)`. A pair without a
//! rule denies every request, including requests from server sessions.
//! Rules may read other documents through a [`DocReader`] but never write.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::document::Snapshot;
use crate::error::SyncError;
use crate::ot::DocData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Read,
    Update,
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Read => "read",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// An already-authenticated session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: Option<String>,
    /// System-wide role, e.g. `system_admin` or `user`.
    pub role: Option<String>,
    /// Set for backend processes acting on their own behalf.
    #[serde(default)]
    pub is_server: bool,
}

impl Session {
    pub fn user(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            role: Some(role.into()),
            is_server: false,
        }
    }

    pub fn server() -> Self {
        Self {
            user_id: None,
            role: None,
            is_server: true,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.role.as_deref() == Some(role)
    }
}

/// Read-only view of documents for rules that depend on related data.
#[async_trait]
pub trait DocReader: Send + Sync {
    async fn read(&self, collection: &str, id: &str) -> Result<Snapshot, SyncError>;
}

/// Everything a rule may inspect.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub collection: &'a str,
    pub kind: OperationKind,
    pub id: &'a str,
    /// Data before the operation, `None` for creates.
    pub old: Option<&'a DocData>,
    /// Proposed data after the operation, `None` for reads and deletes.
    pub new: Option<&'a DocData>,
    pub session: &'a Session,
}

#[async_trait]
pub trait AccessRule: Send + Sync {
    async fn check(&self, request: &AccessRequest<'_>, reader: &dyn DocReader) -> Result<bool, SyncError>;
}

/// Rule from a synchronous predicate.
pub struct FnRule<F>(pub F);

#[async_trait]
impl<F> AccessRule for FnRule<F>
where
    F: Fn(&AccessRequest<'_>) -> bool + Send + Sync + 'static,
{
    async fn check(&self, request: &AccessRequest<'_>, _reader: &dyn DocReader) -> Result<bool, SyncError> {
        Ok((self.0)(request))
    }
}

pub fn rule<F>(predicate: F) -> Arc<dyn AccessRule>
where
    F: Fn(&AccessRequest<'_>) -> bool + Send + Sync + 'static,
{
    Arc::new(FnRule(predicate))
}

/// Rule set keyed by collection and operation kind.
#[derive(Clone, Default)]
pub struct AccessControl {
    rules: HashMap<(String, OperationKind), Arc<dyn AccessRule>>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the rule for `(collection, kind)`.
    pub fn allow(mut self, collection: impl Into<String>, kind: OperationKind, rule: Arc<dyn AccessRule>) -> Self {
        self.rules.insert((collection.into(), kind), rule);
        self
    }

    pub fn has_rule(&self, collection: &str, kind: OperationKind) -> bool {
        self.rules.contains_key(&(collection.to_string(), kind))
    }

    pub async fn authorize(&self, request: &AccessRequest<'_>, reader: &dyn DocReader) -> Result<bool, SyncError> {
        let Some(rule) = self.rules.get(&(request.collection.to_string(), request.kind)) else {
            log::debug!(
                "No {} rule for collection '{}': denied",
                request.kind,
                request.collection
            );
            return Ok(false);
        };
        rule.check(request, reader).await
    }

    /// `authorize`, mapping a denial to `Forbidden`.
    pub async fn require(&self, request: &AccessRequest<'_>, reader: &dyn DocReader) -> Result<(), SyncError> {
        if self.authorize(request, reader).await? {
            Ok(())
        } else {
            Err(SyncError::Forbidden(format!(
                "{} on {}/{}",
                request.kind, request.collection, request.id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocKey;
    use serde_json::json;

    struct NoDocs;

    #[async_trait]
    impl DocReader for NoDocs {
        async fn read(&self, collection: &str, id: &str) -> Result<Snapshot, SyncError> {
            Ok(Snapshot::empty(&DocKey::new(collection, id)))
        }
    }

    fn request<'a>(collection: &'a str, kind: OperationKind, session: &'a Session) -> AccessRequest<'a> {
        AccessRequest {
            collection,
            kind,
            id: "w1",
            old: None,
            new: None,
            session,
        }
    }

    #[tokio::test]
    async fn test_default_deny_for_every_session() {
        let access = AccessControl::new().allow("widgets", OperationKind::Read, rule(|_| true));
        for session in [Session::server(), Session::user("u1", "system_admin"), Session::default()] {
            for kind in [OperationKind::Create, OperationKind::Update, OperationKind::Delete] {
                let allowed = access.authorize(&request("widgets", kind, &session), &NoDocs).await.unwrap();
                assert!(!allowed, "{kind} must be denied without a rule");
            }
            let denied = access.require(&request("gadgets", OperationKind::Read, &session), &NoDocs).await;
            assert!(matches!(denied, Err(SyncError::Forbidden(_))));
        }
    }

    #[tokio::test]
    async fn test_rule_sees_old_and_new() {
        let access = AccessControl::new().allow(
            "projects",
            OperationKind::Update,
            rule(|req| {
                let old = req.old.and_then(|d| d.as_json()).map(|v| v["locked"] == json!(true));
                let new = req.new.and_then(|d| d.as_json()).map(|v| v["locked"] == json!(true));
                old == Some(false) && new == Some(false)
            }),
        );
        let session = Session::user("u1", "user");
        let unlocked = DocData::Json(json!({"locked": false}));
        let locked = DocData::Json(json!({"locked": true}));

        let mut req = request("projects", OperationKind::Update, &session);
        req.old = Some(&unlocked);
        req.new = Some(&unlocked);
        assert!(access.authorize(&req, &NoDocs).await.unwrap());

        req.new = Some(&locked);
        assert!(!access.authorize(&req, &NoDocs).await.unwrap());
    }

    #[test]
    fn test_session_wire_shape() {
        let s: Session = serde_json::from_str(r#"{"user_id":"u1","role":"user"}"#).unwrap();
        assert_eq!(s, Session::user("u1", "user"));
        assert!(!s.is_server);
    }
}
