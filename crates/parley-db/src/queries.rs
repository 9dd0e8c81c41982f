use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};

use parley_types::models::{ConversationId, MessageId, ParticipantPair, UserId};

use crate::models::{ConversationRow, MessageRow, UserRow};
use crate::{ChatStore, Database, StoreError};

const USER_COLUMNS: &str = "id, username, password, created_at";
const CONVERSATION_COLUMNS: &str = "id, user_a, user_b, created_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, content, timestamp";

impl ChatStore for Database {
    // -- Users --

    fn create_user(&self, username: &str, password_hash: &str) -> Result<UserRow, StoreError> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (username, password) VALUES (?1, ?2)",
                (username, password_hash),
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                    return Err(StoreError::UsernameTaken);
                }
                Err(e) => return Err(e.into()),
            }

            let id = UserId(conn.last_insert_rowid());
            query_user(conn, "id = ?1", params![id.0])?.ok_or(StoreError::UnknownUser(id))
        })
    }

    fn get_user(&self, id: UserId) -> Result<Option<UserRow>, StoreError> {
        self.with_conn(|conn| query_user(conn, "id = ?1", params![id.0]))
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>, StoreError> {
        self.with_conn(|conn| query_user(conn, "username = ?1", params![username]))
    }

    fn search_users(&self, query: &str, exclude: UserId, limit: u32) -> Result<Vec<UserRow>, StoreError> {
        let pattern = format!("%{}%", escape_like(query));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users
                 WHERE username LIKE ?1 ESCAPE '\\' AND id != ?2
                 ORDER BY username
                 LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(params![pattern, exclude.0, limit], user_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Conversations --

    fn resolve_conversation(&self, a: UserId, b: UserId) -> Result<(ConversationRow, bool), StoreError> {
        let pair = ParticipantPair::new(a, b).ok_or(StoreError::SelfConversation)?;

        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            for user in [pair.low(), pair.high()] {
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
                    [user.0],
                    |row| row.get(0),
                )?;
                if !exists {
                    return Err(StoreError::UnknownUser(user));
                }
            }

            // The UNIQUE(user_a, user_b) constraint decides the winner; the
            // loser falls through to the read below and gets the winner's row.
            let created = tx.execute(
                "INSERT INTO conversations (user_a, user_b, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_a, user_b) DO NOTHING",
                params![pair.low().0, pair.high().0, format_timestamp(Utc::now())],
            )? == 1;

            let row = tx.query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE user_a = ?1 AND user_b = ?2"),
                params![pair.low().0, pair.high().0],
                conversation_from_row,
            )?;

            tx.commit()?;
            Ok((row, created))
        })
    }

    fn get_conversation(&self, id: ConversationId) -> Result<Option<ConversationRow>, StoreError> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    fn list_conversations(&self, user: UserId) -> Result<Vec<ConversationRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE user_a = ?1 OR user_b = ?1
                 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map([user.0], conversation_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn delete_conversation(&self, id: ConversationId) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [id.0])?;
            let removed = tx.execute("DELETE FROM conversations WHERE id = ?1", [id.0])?;
            tx.commit()?;
            Ok(removed == 1)
        })
    }

    // -- Messages --

    fn append_message(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        content: &str,
    ) -> Result<MessageRow, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let conversation = query_conversation(&tx, conversation_id)?
                .ok_or(StoreError::ConversationNotFound(conversation_id))?;
            if !conversation.has_participant(sender) {
                return Err(StoreError::NotParticipant {
                    user: sender,
                    conversation: conversation_id,
                });
            }

            // Clamp to the newest stored timestamp so a clock step backwards
            // cannot reorder the transcript.
            let latest: Option<String> = tx.query_row(
                "SELECT MAX(timestamp) FROM messages WHERE conversation_id = ?1",
                [conversation_id.0],
                |row| row.get(0),
            )?;
            let now = Utc::now();
            let timestamp = match latest.as_deref().map(parse_timestamp) {
                Some(Ok(last)) if last > now => last,
                _ => now,
            };

            tx.execute(
                "INSERT INTO messages (conversation_id, sender_id, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![conversation_id.0, sender.0, content, format_timestamp(timestamp)],
            )?;
            let id = MessageId(tx.last_insert_rowid());
            tx.commit()?;

            Ok(MessageRow {
                id,
                conversation_id,
                sender_id: sender,
                content: content.to_string(),
                timestamp: truncate_to_micros(timestamp),
            })
        })
    }

    fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<MessageRow>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY timestamp, id"
            ))?;
            let rows = stmt
                .query_map([conversation_id.0], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_user(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Option<UserRow>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE {filter}"))?;
    Ok(stmt.query_row(params, user_from_row).optional()?)
}

fn query_conversation(conn: &Connection, id: ConversationId) -> Result<Option<ConversationRow>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"))?;
    Ok(stmt.query_row([id.0], conversation_from_row).optional()?)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: UserId(row.get(0)?),
        username: row.get(1)?,
        password: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: ConversationId(row.get(0)?),
        user_a: UserId(row.get(1)?),
        user_b: UserId(row.get(2)?),
        created_at: timestamp_column(row, 3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: MessageId(row.get(0)?),
        conversation_id: ConversationId(row.get(1)?),
        sender_id: UserId(row.get(2)?),
        content: row.get(3)?,
        timestamp: timestamp_column(row, 4)?,
    })
}

/// Fixed-width RFC 3339 with microseconds, so string order in SQLite matches
/// chronological order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    // Round-trip through the stored form so the returned row equals what a read yields.
    parse_timestamp(&format_timestamp(ts)).unwrap_or(ts)
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
