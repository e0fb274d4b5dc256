//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Conversation memory, one row per message
        CREATE TABLE IF NOT EXISTS memory_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('user', 'assistant')),
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_memory_conversation
            ON memory_records(conversation_id, created_at, id);
        CREATE INDEX IF NOT EXISTS idx_memory_expires
            ON memory_records(expires_at) WHERE expires_at IS NOT NULL;

        -- Per-conversation profile
        CREATE TABLE IF NOT EXISTS user_profiles (
            conversation_id TEXT PRIMARY KEY,
            nickname TEXT NOT NULL DEFAULT '',
            relationship TEXT NOT NULL DEFAULT '',
            personality TEXT NOT NULL DEFAULT '',
            facts TEXT NOT NULL DEFAULT '[]',
            last_emotion TEXT,
            message_count INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        );

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}
