use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info};

use parley_db::models::MessageRow;
use parley_db::{ChatStore, StoreError};
use parley_types::events::{ErrorKind, MessagePush, SendEnvelope, ServerEnvelope};
use parley_types::models::{ConversationId, UserId};

use crate::registry::ConnectionRegistry;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("message content is empty")]
    EmptyContent,

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("sender {0} no longer exists")]
    UnknownSender(UserId),

    #[error("not a participant of conversation {0}")]
    UnauthorizedParticipant(ConversationId),

    #[error("failed to persist message: {0}")]
    Persistence(String),
}

impl RouteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyContent | Self::InvalidRecipient(_) => ErrorKind::MalformedEnvelope,
            Self::UnknownSender(_) => ErrorKind::AuthFailure,
            Self::UnauthorizedParticipant(_) => ErrorKind::UnauthorizedParticipant,
            Self::Persistence(_) => ErrorKind::PersistenceFailure,
        }
    }

    pub fn to_envelope(&self) -> ServerEnvelope {
        ServerEnvelope::error(self.kind(), self.to_string())
    }
}

/// Result of routing one send.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub push: MessagePush,
    pub created_conversation: bool,
    pub sender_connections: usize,
    pub recipient_connections: usize,
}

impl Delivery {
    /// The recipient had no live connection; they recover the message by pulling.
    pub fn delivery_gap(&self) -> bool {
        self.recipient_connections == 0
    }
}

/// Validates sends, persists them and pushes them to both participants.
#[derive(Clone)]
pub struct MessageRouter {
    store: Arc<dyn ChatStore>,
    registry: ConnectionRegistry,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn ChatStore>, registry: ConnectionRegistry) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub async fn route(&self, sender: UserId, envelope: SendEnvelope) -> Result<Delivery, RouteError> {
        if envelope.content.trim().is_empty() {
            return Err(RouteError::EmptyContent);
        }

        // Run blocking DB work off the async runtime
        let store = self.store.clone();
        let (row, recipient, created_conversation) =
            tokio::task::spawn_blocking(move || persist(store.as_ref(), sender, envelope))
                .await
                .map_err(|e| {
                    error!("spawn_blocking join error: {}", e);
                    RouteError::Persistence("internal error".into())
                })??;

        if created_conversation {
            info!(
                "Conversation {} created between {} and {}",
                row.conversation_id, sender, recipient
            );
        }

        let push = MessagePush {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: sender,
            recipient_id: recipient,
            content: row.content,
            timestamp: row.timestamp,
        };
        let outbound = ServerEnvelope::Message(push.clone());

        // Sender included so the user's other sessions stay in sync.
        let sender_connections = self.registry.send_to_user(sender, &outbound).await;
        let recipient_connections = self.registry.send_to_user(recipient, &outbound).await;

        let delivery = Delivery {
            push,
            created_conversation,
            sender_connections,
            recipient_connections,
        };
        if delivery.delivery_gap() {
            debug!(
                "Message {} to {} not pushed: recipient offline, left for pull",
                delivery.push.id, recipient
            );
        }
        Ok(delivery)
    }
}

/// Resolve the conversation and append the message. Returns the stored row,
/// the other participant and whether the conversation was created here.
fn persist(
    store: &dyn ChatStore,
    sender: UserId,
    envelope: SendEnvelope,
) -> Result<(MessageRow, UserId, bool), RouteError> {
    let (conversation, created) = match envelope.conversation_id {
        Some(id) => {
            let conversation = store
                .get_conversation(id)
                .map_err(persistence)?
                .filter(|c| c.has_participant(sender))
                .ok_or(RouteError::UnauthorizedParticipant(id))?;
            (conversation, false)
        }
        None => store
            .resolve_conversation(sender, envelope.to)
            .map_err(|e| match e {
                StoreError::SelfConversation => RouteError::InvalidRecipient("cannot message yourself".into()),
                StoreError::UnknownUser(id) if id == sender => RouteError::UnknownSender(id),
                StoreError::UnknownUser(id) => RouteError::InvalidRecipient(format!("no user with id {}", id)),
                other => persistence(other),
            })?,
    };

    // The conversation's own pair decides the recipient, not the `to` field.
    let recipient = conversation
        .participants()
        .and_then(|pair| pair.other(sender))
        .ok_or(RouteError::UnauthorizedParticipant(conversation.id))?;

    let row = store
        .append_message(conversation.id, sender, &envelope.content)
        .map_err(|e| match e {
            // Deleted or changed between the lookup and the insert
            StoreError::ConversationNotFound(id) | StoreError::NotParticipant { conversation: id, .. } => {
                RouteError::UnauthorizedParticipant(id)
            }
            other => persistence(other),
        })?;

    Ok((row, recipient, created))
}

fn persistence(err: StoreError) -> RouteError {
    error!("Store error while routing message: {}", err);
    RouteError::Persistence(err.to_string())
}
