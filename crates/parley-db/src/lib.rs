pub mod migrations;
pub mod models;
pub mod queries;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use thiserror::Error;
use tracing::info;

use parley_types::models::{ConversationId, UserId};

use crate::models::{ConversationRow, MessageRow, UserRow};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("username already exists")]
    UsernameTaken,

    #[error("user {0} not found")]
    UnknownUser(UserId),

    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),

    #[error("user {user} is not a participant of conversation {conversation}")]
    NotParticipant {
        user: UserId,
        conversation: ConversationId,
    },

    #[error("a conversation needs two distinct users")]
    SelfConversation,

    #[error("DB lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Durable record store for users, conversations and messages.
///
/// Calls are blocking; async callers run them under `spawn_blocking`.
pub trait ChatStore: Send + Sync + 'static {
    fn create_user(&self, username: &str, password_hash: &str) -> Result<UserRow, StoreError>;

    fn get_user(&self, id: UserId) -> Result<Option<UserRow>, StoreError>;

    fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>, StoreError>;

    /// Case-insensitive substring match on username, never returning `exclude`.
    fn search_users(&self, query: &str, exclude: UserId, limit: u32) -> Result<Vec<UserRow>, StoreError>;

    /// Atomic create-or-get for the unordered pair `(a, b)`. The flag is true
    /// when this call created the row.
    fn resolve_conversation(&self, a: UserId, b: UserId) -> Result<(ConversationRow, bool), StoreError>;

    fn get_conversation(&self, id: ConversationId) -> Result<Option<ConversationRow>, StoreError>;

    fn list_conversations(&self, user: UserId) -> Result<Vec<ConversationRow>, StoreError>;

    /// Append a message after checking `sender` participates in the
    /// conversation. The store assigns the timestamp; it never goes backwards
    /// within a conversation.
    fn append_message(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        content: &str,
    ) -> Result<MessageRow, StoreError>;

    /// Messages ordered by `(timestamp, id)`.
    fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessageRow>, StoreError>;

    /// Delete the conversation and its messages. Returns false if it was absent.
    fn delete_conversation(&self, id: ConversationId) -> Result<bool, StoreError>;
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let db = Self::init(conn)?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut conn)
    }
}
