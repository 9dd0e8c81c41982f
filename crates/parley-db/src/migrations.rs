use rusqlite::Connection;
use tracing::info;

use crate::StoreError;

pub fn run(conn: &Connection) -> Result<(), StoreError> {
    // AUTOINCREMENT keeps ids of deleted conversations from being reused, so a
    // message still in flight to a deleted conversation cannot land in a new one.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        -- user_a < user_b always; the unique pair is what makes first contact idempotent
        CREATE TABLE IF NOT EXISTS conversations (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_a      INTEGER NOT NULL REFERENCES users(id),
            user_b      INTEGER NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL,
            CHECK (user_a < user_b),
            UNIQUE (user_a, user_b)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user_b
            ON conversations(user_b);

        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            sender_id       INTEGER NOT NULL REFERENCES users(id),
            content         TEXT NOT NULL,
            timestamp       TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, timestamp, id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
