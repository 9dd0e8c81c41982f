//! Merges optimistic local sends with authoritative server data.
//!
//! Pull responses fully replace a transcript. Pushes are upserted by
//! message id, so a message seen through both paths is displayed once.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use parley_types::api::{ConversationResponse, MessageResponse};
use parley_types::events::MessagePush;
use parley_types::models::{ConversationId, MessageId, UserId};

/// Where a transcript lives: an existing conversation, or a draft with a
/// peer we have not exchanged a message with yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Conversation(ConversationId),
    Draft(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryId {
    /// Locally generated; never leaves the client.
    Pending(u64),
    Persisted(MessageId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayedMessage {
    pub id: EntryId,
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl DisplayedMessage {
    pub fn is_pending(&self) -> bool {
        matches!(self.id, EntryId::Pending(_))
    }

    fn persisted(record: MessageResponse) -> Self {
        Self {
            id: EntryId::Persisted(record.id),
            sender_id: record.sender_id,
            content: record.content,
            timestamp: record.timestamp,
        }
    }
}

/// What a push changed, so the caller knows which views to refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    pub slot: Slot,
    /// The push introduced a conversation we did not list yet.
    pub new_conversation: bool,
    /// A draft with the peer was folded into the conversation.
    pub promoted_draft: Option<UserId>,
    /// Pending entries are still shown next to the pushed message; only a
    /// pull of the conversation can settle them.
    pub needs_pull: bool,
}

#[derive(Debug)]
pub struct OptimisticReconciler {
    me: UserId,
    conversations: Vec<ConversationResponse>,
    transcripts: HashMap<Slot, Vec<DisplayedMessage>>,
    next_local_id: u64,
}

impl OptimisticReconciler {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            conversations: Vec::new(),
            transcripts: HashMap::new(),
            next_local_id: 1,
        }
    }

    pub fn me(&self) -> UserId {
        self.me
    }

    pub fn conversations(&self) -> &[ConversationResponse] {
        &self.conversations
    }

    pub fn transcript(&self, slot: Slot) -> &[DisplayedMessage] {
        self.transcripts.get(&slot).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The slot a new message to `peer` belongs in.
    pub fn slot_for_peer(&self, peer: UserId) -> Slot {
        self.conversations
            .iter()
            .find(|c| c.other_participant(self.me) == peer)
            .map_or(Slot::Draft(peer), |c| Slot::Conversation(c.id))
    }

    fn peer_of(&self, conversation: ConversationId) -> Option<UserId> {
        self.conversations
            .iter()
            .find(|c| c.id == conversation)
            .map(|c| c.other_participant(self.me))
    }

    /// Show a message before the server has confirmed it.
    pub fn add_pending(&mut self, slot: Slot, content: impl Into<String>) -> u64 {
        let local_id = self.next_local_id;
        self.next_local_id += 1;
        self.transcripts.entry(slot).or_default().push(DisplayedMessage {
            id: EntryId::Pending(local_id),
            sender_id: self.me,
            content: content.into(),
            timestamp: Utc::now(),
        });
        local_id
    }

    /// Authoritative transcript from the pull endpoint. Replaces everything
    /// shown for the conversation, pending entries included. Pushed messages
    /// newer than the snapshot's last id are kept, since a pull may have
    /// been answered before they were persisted.
    pub fn replace_transcript(&mut self, conversation: ConversationId, messages: Vec<MessageResponse>) {
        let slot = Slot::Conversation(conversation);
        let mut entries: Vec<DisplayedMessage> = messages
            .into_iter()
            .filter(|m| m.conversation_id == conversation)
            .map(DisplayedMessage::persisted)
            .collect();

        let newest = entries
            .iter()
            .filter_map(|m| match m.id {
                EntryId::Persisted(id) => Some(id),
                EntryId::Pending(_) => None,
            })
            .max();
        if let Some(previous) = self.transcripts.remove(&slot) {
            entries.extend(previous.into_iter().filter(|m| match (m.id, newest) {
                (EntryId::Persisted(id), Some(newest)) => id > newest,
                (EntryId::Persisted(_), None) => true,
                (EntryId::Pending(_), _) => false,
            }));
        }
        order(&mut entries);
        self.transcripts.insert(slot, entries);
        if let Some(peer) = self.peer_of(conversation) {
            self.transcripts.remove(&Slot::Draft(peer));
        }
    }

    /// Authoritative conversation list. Transcripts of conversations that
    /// no longer exist are dropped.
    pub fn replace_conversations(&mut self, conversations: Vec<ConversationResponse>) {
        self.conversations = conversations;
        let known: Vec<ConversationId> = self.conversations.iter().map(|c| c.id).collect();
        self.transcripts.retain(|slot, _| match slot {
            Slot::Conversation(id) => known.contains(id),
            Slot::Draft(_) => true,
        });
    }

    pub fn remove_conversation(&mut self, conversation: ConversationId) -> bool {
        let before = self.conversations.len();
        self.conversations.retain(|c| c.id != conversation);
        self.transcripts.remove(&Slot::Conversation(conversation));
        self.conversations.len() != before
    }

    /// Merge a live push. Idempotent per message id; an own push replaces
    /// the oldest pending entry with the same content.
    pub fn apply_push(&mut self, push: MessagePush) -> PushOutcome {
        let slot = Slot::Conversation(push.conversation_id);
        let peer = if push.sender_id == self.me {
            push.recipient_id
        } else {
            push.sender_id
        };

        let new_conversation = !self.conversations.iter().any(|c| c.id == push.conversation_id);
        if new_conversation {
            self.conversations.push(ConversationResponse {
                id: push.conversation_id,
                user_a: self.me.min(peer),
                user_b: self.me.max(peer),
                created_at: push.timestamp,
            });
        }

        let draft = self.transcripts.remove(&Slot::Draft(peer));
        let promoted_draft = draft.as_ref().map(|_| peer);
        let transcript = self.transcripts.entry(slot).or_default();
        if let Some(draft) = draft {
            transcript.extend(draft);
        }

        let id = EntryId::Persisted(push.id);
        if !transcript.iter().any(|m| m.id == id) {
            if push.sender_id == self.me {
                if let Some(pos) = transcript
                    .iter()
                    .position(|m| m.is_pending() && m.content == push.content)
                {
                    transcript.remove(pos);
                }
            }
            transcript.push(DisplayedMessage::persisted(push.into_record()));
            order(transcript);
        }
        let needs_pull = transcript.iter().any(DisplayedMessage::is_pending);

        PushOutcome {
            slot,
            new_conversation,
            promoted_draft,
            needs_pull,
        }
    }
}

/// Persisted entries by (timestamp, id), pending entries after them in the
/// order they were sent.
fn order(transcript: &mut [DisplayedMessage]) {
    transcript.sort_by(|a, b| match (a.id, b.id) {
        (EntryId::Persisted(x), EntryId::Persisted(y)) => (a.timestamp, x).cmp(&(b.timestamp, y)),
        (EntryId::Persisted(_), EntryId::Pending(_)) => std::cmp::Ordering::Less,
        (EntryId::Pending(_), EntryId::Persisted(_)) => std::cmp::Ordering::Greater,
        (EntryId::Pending(x), EntryId::Pending(y)) => x.cmp(&y),
    });
}
