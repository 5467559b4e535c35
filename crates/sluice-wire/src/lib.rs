// Channel wire protocol: JSON frames exchanged over the WebSocket, the join
// configuration payload, and the row-change types carried by CDC events.
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod filter;

pub use filter::ChangeFilter;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("unknown change operation: {0}")]
    UnknownOperation(String),
}

// Application close codes, in the 4xxx range reserved for applications.
pub mod close {
    pub const GOING_AWAY: u16 = 4000;
    pub const SLOW_CONSUMER: u16 = 4001;
    pub const HEARTBEAT_TIMEOUT: u16 = 4002;
    pub const TOKEN_EXPIRED: u16 = 4003;
    pub const TENANT_SUSPENDED: u16 = 4004;
    pub const RATE_LIMITED: u16 = 4005;
}

/// Reserved event names. Anything else on an inbound frame is treated as a
/// custom broadcast event.
pub mod event {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const ERROR: &str = "phx_error";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const BROADCAST: &str = "broadcast";
    pub const PRESENCE: &str = "presence";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PRESENCE_DIFF: &str = "presence_diff";
    pub const POSTGRES_CHANGES: &str = "postgres_changes";
    pub const SYSTEM: &str = "system";
}

/// One inbound frame from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl ClientFrame {
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| Error::MalformedFrame(err.to_string()))
    }
}

/// One outbound frame to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl ServerFrame {
    pub fn encode(&self) -> String {
        // Serialization of Value-backed frames cannot fail.
        serde_json::to_string(self).expect("serialize frame")
    }

    pub fn reply_ok(topic: &str, reference: Option<String>, response: Value) -> Self {
        Self::reply(topic, reference, "ok", response)
    }

    pub fn reply_error(topic: &str, reference: Option<String>, response: Value) -> Self {
        Self::reply(topic, reference, "error", response)
    }

    fn reply(topic: &str, reference: Option<String>, status: &str, response: Value) -> Self {
        Self {
            topic: topic.to_string(),
            event: event::REPLY.to_string(),
            payload: serde_json::json!({"status": status, "response": response}),
            reference,
        }
    }

    pub fn system(topic: &str, status: &str, message: impl Into<String>) -> Self {
        Self {
            topic: topic.to_string(),
            event: event::SYSTEM.to_string(),
            payload: serde_json::json!({
                "status": status,
                "extension": "system",
                "message": message.into(),
            }),
            reference: None,
        }
    }
}

/// Options recognized inside a `phx_join` payload's `config` object. Unknown
/// fields are ignored so older servers tolerate newer clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinConfig {
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceConfig>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub postgres_changes: Vec<PostgresChangeParams>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Whether the sender receives its own broadcasts.
    #[serde(rename = "self", default)]
    pub self_send: bool,
    /// Whether broadcasts are acknowledged with a reply.
    #[serde(default)]
    pub ack: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    pub key: String,
}

/// One `postgres_changes` subscription entry from a join payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresChangeParams {
    /// `INSERT`, `UPDATE`, `DELETE`, or `*`.
    pub event: String,
    pub schema: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    #[serde(default)]
    pub config: JoinConfig,
    #[serde(default)]
    pub access_token: Option<String>,
}

/// A row-change operation decoded from the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "INSERT",
            ChangeOp::Update => "UPDATE",
            ChangeOp::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "INSERT" => Ok(ChangeOp::Insert),
            "UPDATE" => Ok(ChangeOp::Update),
            "DELETE" => Ok(ChangeOp::Delete),
            other => Err(Error::UnknownOperation(other.to_string())),
        }
    }
}

/// A decoded row change ready for fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcChange {
    pub schema: String,
    pub table: String,
    #[serde(rename = "eventType")]
    pub operation: ChangeOp,
    /// New row values; empty for DELETE.
    #[serde(rename = "new")]
    pub record: serde_json::Map<String, Value>,
    /// Replica-identity values of the previous row; empty for INSERT.
    #[serde(rename = "old")]
    pub old_record: serde_json::Map<String, Value>,
    /// Column names and types present in the change, in table order.
    pub columns: Vec<ChangeColumn>,
    pub commit_timestamp: String,
    #[serde(skip)]
    pub lsn: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frame_decodes_with_defaults() {
        let frame = ClientFrame::decode(r#"{"topic":"room:1","event":"heartbeat"}"#).expect("ok");
        assert_eq!(frame.topic, "room:1");
        assert_eq!(frame.event, event::HEARTBEAT);
        assert!(frame.payload.is_null());
        assert!(frame.reference.is_none());
    }

    #[test]
    fn malformed_frame_is_an_error() {
        assert!(matches!(
            ClientFrame::decode("{nope"),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn reply_ok_shape() {
        let frame = ServerFrame::reply_ok("room:1", Some("3".into()), json!({"x": 1}));
        let value: Value = serde_json::from_str(&frame.encode()).expect("round trip");
        assert_eq!(value["event"], "phx_reply");
        assert_eq!(value["payload"]["status"], "ok");
        assert_eq!(value["payload"]["response"]["x"], 1);
        assert_eq!(value["ref"], "3");
    }

    #[test]
    fn reply_without_ref_omits_field() {
        let frame = ServerFrame::reply_error("room:1", None, json!({}));
        assert!(!frame.encode().contains("\"ref\""));
    }

    #[test]
    fn join_payload_parses_full_config() {
        let payload: JoinPayload = serde_json::from_value(json!({
            "config": {
                "broadcast": {"self": true, "ack": true},
                "presence": {"key": "user-1"},
                "private": true,
                "postgres_changes": [
                    {"event": "INSERT", "schema": "public", "table": "todos", "filter": "id=eq.1"}
                ]
            },
            "access_token": "jwt"
        }))
        .expect("parse");
        assert!(payload.config.broadcast.self_send);
        assert!(payload.config.broadcast.ack);
        assert!(payload.config.private);
        assert_eq!(payload.config.presence.as_ref().unwrap().key, "user-1");
        assert_eq!(payload.config.postgres_changes.len(), 1);
        assert_eq!(payload.access_token.as_deref(), Some("jwt"));
    }

    #[test]
    fn join_payload_defaults_when_empty() {
        let payload: JoinPayload = serde_json::from_value(json!({})).expect("parse");
        assert!(!payload.config.private);
        assert!(!payload.config.broadcast.self_send);
        assert!(payload.config.postgres_changes.is_empty());
    }

    #[test]
    fn change_op_round_trip() {
        for (text, op) in [
            ("INSERT", ChangeOp::Insert),
            ("UPDATE", ChangeOp::Update),
            ("DELETE", ChangeOp::Delete),
        ] {
            assert_eq!(ChangeOp::parse(text).expect("parse"), op);
            assert_eq!(op.as_str(), text);
        }
        assert!(ChangeOp::parse("TRUNCATE").is_err());
    }
}
