//! Database row types. These map directly to SQLite rows and stay distinct
//! from the parley-types API models.
use chrono::{DateTime, Utc};

use parley_types::api::{ConversationResponse, MessageResponse, UserSummary};
use parley_types::models::{ConversationId, MessageId, ParticipantPair, UserId};

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: UserId,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub user_a: UserId,
    pub user_b: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl UserRow {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            username: self.username.clone(),
        }
    }
}

impl ConversationRow {
    pub fn participants(&self) -> Option<ParticipantPair> {
        ParticipantPair::new(self.user_a, self.user_b)
    }

    pub fn has_participant(&self, user: UserId) -> bool {
        self.user_a == user || self.user_b == user
    }
}

impl From<ConversationRow> for ConversationResponse {
    fn from(row: ConversationRow) -> Self {
        Self {
            id: row.id,
            user_a: row.user_a,
            user_b: row.user_b,
            created_at: row.created_at,
        }
    }
}

impl From<MessageRow> for MessageResponse {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            content: row.content,
            timestamp: row.timestamp,
        }
    }
}
