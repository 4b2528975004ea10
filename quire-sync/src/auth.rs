//! Handshake authentication for socket connections.
//!
//! A remote client presents [`Credentials`] in its `Connect` frame and the
//! server's [`Authenticator`] turns them into a [`Session`]. Sessions that
//! arrive over a socket never carry `is_server`; only in-process callers
//! (see [`crate::service::LocalService`]) act as the server.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::access::Session;
use crate::error::SyncError;

/// Credentials sent by the client in the `Connect` frame.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
}

impl Credentials {
    pub fn token(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("token", &"<redacted>").finish()
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve credentials to a session, or fail with `Forbidden`.
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, SyncError>;
}

/// Session for a socket connection: whatever the authenticator returned,
/// minus the server flag.
pub(crate) fn remote_session(mut session: Session) -> Session {
    if session.is_server {
        log::warn!("Dropping server privilege from remote session {:?}", session.user_id);
        session.is_server = false;
    }
    session
}

/// Fixed table of tokens. Unknown tokens are rejected.
#[derive(Clone, Default)]
pub struct TokenAuthenticator {
    sessions: HashMap<String, Session>,
}

impl TokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, session: Session) -> Self {
        self.sessions.insert(token.into(), session);
        self
    }

    /// Parse a JSON object mapping tokens to sessions.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            sessions: serde_json::from_str(text)?,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, SyncError> {
        self.sessions
            .get(&credentials.token)
            .cloned()
            .ok_or_else(|| SyncError::Forbidden("invalid credentials".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let auth = TokenAuthenticator::new().with_token("t-alice", Session::user("alice", "user"));
        let alice = auth.authenticate(&Credentials::token("t-alice")).await.unwrap();
        assert_eq!(alice.user_id.as_deref(), Some("alice"));

        let err = auth.authenticate(&Credentials::token("guess")).await.unwrap_err();
        assert!(matches!(err, SyncError::Forbidden(_)));
    }

    #[test]
    fn test_remote_session_never_server() {
        let table = TokenAuthenticator::from_json(
            r#"{"t1": {"user_id": "svc", "role": null, "is_server": true}}"#,
        )
        .unwrap();
        assert_eq!(table.len(), 1);
        let session = remote_session(table.sessions["t1"].clone());
        assert!(!session.is_server);
        assert_eq!(session.user_id.as_deref(), Some("svc"));
    }

    #[test]
    fn test_debug_hides_token() {
        let shown = format!("{:?}", Credentials::token("secret"));
        assert!(!shown.contains("secret"));
    }
}
