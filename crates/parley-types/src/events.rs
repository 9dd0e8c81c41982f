use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::api::MessageResponse;
use crate::models::{ConversationId, MessageId, UserId};

/// Text of the client heartbeat frame.
pub const PING_FRAME: &str = r#"{"type":"ping"}"#;

// -- Inbound (client -> server) --

/// A message the client wants delivered. With no `conversation_id` the
/// server resolves (or creates) the conversation for the sender/recipient pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEnvelope {
    pub to: UserId,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    pub content: String,
}

/// Everything a client may send over the gateway, parsed once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEnvelope {
    Send(SendEnvelope),
    Heartbeat,
    Logout,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("envelope must be a JSON object")]
    NotObject,

    #[error("envelope type must be a string")]
    BadDiscriminator,

    #[error("unknown envelope type '{0}'")]
    UnknownType(String),

    #[error("invalid send envelope: {0}")]
    InvalidSend(#[source] serde_json::Error),
}

impl InboundEnvelope {
    /// Parse a text frame. The `type` field selects the variant; a missing
    /// `type` is a send, matching the bare `{to, conversation_id, content}` form.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text).map_err(EnvelopeError::Json)?;
        let Value::Object(ref fields) = value else {
            return Err(EnvelopeError::NotObject);
        };

        let kind = match fields.get("type") {
            None | Some(Value::Null) => "send".to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(EnvelopeError::BadDiscriminator),
        };

        match kind.as_str() {
            "ping" => Ok(Self::Heartbeat),
            "logout" => Ok(Self::Logout),
            "send" => serde_json::from_value::<SendEnvelope>(value)
                .map(Self::Send)
                .map_err(EnvelopeError::InvalidSend),
            other => Err(EnvelopeError::UnknownType(other.to_string())),
        }
    }
}

// -- Outbound (server -> client) --

/// A persisted message pushed to every live connection of both participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePush {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl MessagePush {
    pub fn into_record(self) -> MessageResponse {
        MessageResponse {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            content: self.content,
            timestamp: self.timestamp,
        }
    }
}

/// Per-envelope failures, reported only to the connection that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthFailure,
    MalformedEnvelope,
    UnauthorizedParticipant,
    PersistenceFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub error: ErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Control {
    Pong,
}

/// Frames the server writes. Shapes are disjoint, so the untagged form
/// decodes unambiguously on the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerEnvelope {
    Message(MessagePush),
    Error(ErrorNotice),
    Control(Control),
}

impl ServerEnvelope {
    pub fn error(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::Error(ErrorNotice {
            error: kind,
            detail: detail.into(),
        })
    }
}
