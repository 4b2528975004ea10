//! WebSocket wire protocol.
//!
//! Each binary frame holds one bincode-encoded [`SyncMessage`]:
//! ```text
//! ┌──────────┬────────────┬────────────┬────────┬─────────┬──────────┐
//! │ msg_type │ request_id │ collection │ doc_id │ version │ payload  │
//! │ varint   │ varint     │ str        │ str    │ varint  │ JSON     │
//! └──────────┴────────────┴────────────┴────────┴─────────┴──────────┘
//! ```
//!
//! Requests carry a client-chosen `request_id`; the reply (`Snapshot`,
//! `Ack`, `QueryResult` or `Error`) echoes it. Pushed `Op` and `QueryDelta`
//! frames use request id 0. `version` is the base version on `Submit`, the
//! committed version on `Ack` and `Op`, and the query id on
//! `QueryUnsubscribe` and `QueryDelta`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::Credentials;
use crate::document::{CommittedOp, OpKind, Snapshot};
use crate::error::{ErrorCode, SyncError};
use crate::query::{Query, QueryDelta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Credential handshake, first frame from the client
    Connect = 1,
    Subscribe = 2,
    Unsubscribe = 3,
    Fetch = 4,
    FetchSnapshot = 5,
    Submit = 6,
    QuerySubscribe = 7,
    QueryUnsubscribe = 8,
    /// Reply to Subscribe / Fetch / FetchSnapshot
    Snapshot = 9,
    Ack = 10,
    /// Committed op pushed to subscribers
    Op = 11,
    QueryResult = 12,
    QueryDelta = 13,
    Error = 14,
    Ping = 15,
    Pong = 16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResultBody {
    pub query_id: u64,
    pub results: Vec<Snapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub request_id: u64,
    pub collection: String,
    pub doc_id: String,
    pub version: u64,
    pub payload: Vec<u8>,
}

fn json_payload<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_else(|e| {
        log::error!("Failed to encode payload: {e}");
        Vec::new()
    })
}

impl SyncMessage {
    pub fn new(msg_type: MessageType, request_id: u64) -> Self {
        Self {
            msg_type,
            request_id,
            collection: String::new(),
            doc_id: String::new(),
            version: 0,
            payload: Vec::new(),
        }
    }

    fn doc(mut self, collection: &str, doc_id: &str) -> Self {
        self.collection = collection.to_string();
        self.doc_id = doc_id.to_string();
        self
    }

    fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    fn with_payload<T: Serialize>(mut self, value: &T) -> Self {
        self.payload = json_payload(value);
        self
    }

    // ─── Requests ───────────────────────────────────────────────────

    pub fn connect(request_id: u64, credentials: &Credentials) -> Self {
        Self::new(MessageType::Connect, request_id).with_payload(credentials)
    }

    pub fn subscribe(request_id: u64, collection: &str, doc_id: &str) -> Self {
        Self::new(MessageType::Subscribe, request_id).doc(collection, doc_id)
    }

    pub fn unsubscribe(request_id: u64, collection: &str, doc_id: &str) -> Self {
        Self::new(MessageType::Unsubscribe, request_id).doc(collection, doc_id)
    }

    pub fn fetch(request_id: u64, collection: &str, doc_id: &str) -> Self {
        Self::new(MessageType::Fetch, request_id).doc(collection, doc_id)
    }

    pub fn fetch_snapshot(request_id: u64, collection: &str, doc_id: &str, version: u64) -> Self {
        Self::new(MessageType::FetchSnapshot, request_id)
            .doc(collection, doc_id)
            .with_version(version)
    }

    pub fn submit(request_id: u64, collection: &str, doc_id: &str, base_version: u64, kind: &OpKind) -> Self {
        Self::new(MessageType::Submit, request_id)
            .doc(collection, doc_id)
            .with_version(base_version)
            .with_payload(kind)
    }

    pub fn query_subscribe(request_id: u64, query: &Query) -> Self {
        let mut msg = Self::new(MessageType::QuerySubscribe, request_id).with_payload(query);
        msg.collection = query.collection.clone();
        msg
    }

    pub fn query_unsubscribe(request_id: u64, query_id: u64) -> Self {
        Self::new(MessageType::QueryUnsubscribe, request_id).with_version(query_id)
    }

    pub fn ping(request_id: u64) -> Self {
        Self::new(MessageType::Ping, request_id)
    }

    // ─── Replies and pushes ─────────────────────────────────────────

    pub fn snapshot(request_id: u64, snapshot: &Snapshot) -> Self {
        Self::new(MessageType::Snapshot, request_id)
            .doc(&snapshot.collection, &snapshot.id)
            .with_version(snapshot.version)
            .with_payload(snapshot)
    }

    pub fn ack(request_id: u64, version: u64) -> Self {
        Self::new(MessageType::Ack, request_id).with_version(version)
    }

    pub fn op(op: &CommittedOp) -> Self {
        Self::new(MessageType::Op, 0)
            .doc(&op.collection, &op.id)
            .with_version(op.version)
            .with_payload(op)
    }

    pub fn query_result(request_id: u64, query_id: u64, results: Vec<Snapshot>) -> Self {
        Self::new(MessageType::QueryResult, request_id)
            .with_version(query_id)
            .with_payload(&QueryResultBody { query_id, results })
    }

    pub fn query_delta(query_id: u64, deltas: &[QueryDelta]) -> Self {
        Self::new(MessageType::QueryDelta, 0)
            .with_version(query_id)
            .with_payload(&deltas)
    }

    pub fn error(request_id: u64, error: &SyncError) -> Self {
        Self::new(MessageType::Error, request_id).with_payload(&ErrorBody {
            code: error.code(),
            message: error.to_string(),
        })
    }

    pub fn pong(request_id: u64) -> Self {
        Self::new(MessageType::Pong, request_id)
    }

    // ─── Codec ──────────────────────────────────────────────────────

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Decode the JSON payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Payload of a message that must be of type `expected`.
    pub fn payload_of<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::UnexpectedMessage {
                expected,
                found: self.msg_type,
            });
        }
        self.payload()
    }

    /// The error carried by an `Error` frame.
    pub fn to_error(&self) -> SyncError {
        match self.payload_of::<ErrorBody>(MessageType::Error) {
            Ok(body) => SyncError::from_remote(body.code, body.message),
            Err(e) => SyncError::Protocol(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("expected {expected:?} message, got {found:?}")]
    UnexpectedMessage { expected: MessageType, found: MessageType },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request timed out")]
    Timeout,
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::json::path;
    use crate::ot::{JsonOp, Operation};
    use serde_json::json;

    #[test]
    fn test_submit_frame() {
        let kind = OpKind::edit(Operation::Json(JsonOp::new().set(path(&["name"]), json!("B"))));
        let msg = SyncMessage::submit(7, "projects", "p1", 5, &kind);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Submit);
        assert_eq!(decoded.request_id, 7);
        assert_eq!((decoded.collection.as_str(), decoded.doc_id.as_str()), ("projects", "p1"));
        assert_eq!(decoded.version, 5);
        assert_eq!(decoded.payload::<OpKind>().unwrap(), kind);
    }

    #[test]
    fn test_error_frame_keeps_code() {
        let msg = SyncMessage::error(3, &SyncError::Forbidden("delete on widgets/w1".into()));
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.request_id, 3);
        assert!(matches!(decoded.to_error(), SyncError::Forbidden(m) if m.contains("widgets/w1")));
    }

    #[test]
    fn test_wrong_payload_type() {
        let ack = SyncMessage::ack(1, 6);
        assert!(matches!(
            ack.payload_of::<ErrorBody>(MessageType::Error),
            Err(ProtocolError::UnexpectedMessage { .. })
        ));
        assert!(matches!(ack.to_error(), SyncError::Protocol(_)));
        assert!(SyncMessage::decode(&[0xff, 0xff]).is_err());
    }
}
