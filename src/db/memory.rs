//! Conversation memory records

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{DbPool, conn};
use crate::context::Role;
use crate::{Error, Result};

/// One persisted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: i64,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Raw column values, role and timestamps not yet parsed
type RecordRow = (i64, String, String, String, i64, Option<i64>);

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

/// Memory record repository
#[derive(Clone)]
pub struct MemoryRepo {
    pool: DbPool,
}

impl MemoryRepo {
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Append a record stamped now
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn append(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        ttl: Option<Duration>,
    ) -> Result<MemoryRecord> {
        self.append_at(conversation_id, role, content, Utc::now(), ttl)
    }

    /// Append a record with an explicit timestamp
    ///
    /// # Errors
    ///
    /// Returns error if the role is `system` or the database operation fails
    pub fn append_at(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        ts: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> Result<MemoryRecord> {
        if role == Role::System {
            return Err(Error::Database("system messages are not stored".to_string()));
        }

        let expires_at = ttl
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| ts + t);

        let conn = conn(&self.pool)?;
        conn.execute(
            "INSERT INTO memory_records (conversation_id, role, content, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                conversation_id,
                role.as_str(),
                content,
                to_millis(ts),
                expires_at.map(to_millis),
            ],
        )?;

        Ok(MemoryRecord {
            id: conn.last_insert_rowid(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            created_at: ts,
            expires_at,
        })
    }

    /// The newest `limit` unexpired records, oldest first
    ///
    /// `max_age` additionally drops records older than now minus `max_age`.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn recent(
        &self,
        conversation_id: &str,
        limit: usize,
        max_age: Option<Duration>,
    ) -> Result<Vec<MemoryRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let min_created = max_age
            .and_then(|a| chrono::Duration::from_std(a).ok())
            .map_or(i64::MIN, |a| to_millis(now - a));

        let conn = conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at, expires_at
             FROM memory_records
             WHERE conversation_id = ?1
               AND created_at >= ?2
               AND (expires_at IS NULL OR expires_at > ?3)
             ORDER BY created_at DESC, id DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![
                conversation_id,
                min_created,
                to_millis(now),
                i64::try_from(limit).unwrap_or(i64::MAX),
            ],
            row_to_record,
        )?;

        let mut records = Vec::new();
        for row in rows {
            let (id, conversation_id, role, content, created_at, expires_at) = row?;
            let Some(role) = Role::parse(&role) else {
                tracing::warn!(id, role = %role, "skipping memory record with unknown role");
                continue;
            };
            records.push(MemoryRecord {
                id,
                conversation_id,
                role,
                content,
                created_at: from_millis(created_at),
                expires_at: expires_at.map(from_millis),
            });
        }
        records.reverse();
        Ok(records)
    }

    /// Delete expired records, returning how many were removed
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn purge_expired(&self) -> Result<usize> {
        let conn = conn(&self.pool)?;
        let deleted = conn.execute(
            "DELETE FROM memory_records WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            [to_millis(Utc::now())],
        )?;
        if deleted > 0 {
            tracing::debug!(deleted, "purged expired memory records");
        }
        Ok(deleted)
    }

    /// Delete every record for a conversation
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn clear(&self, conversation_id: &str) -> Result<usize> {
        let conn = conn(&self.pool)?;
        Ok(conn.execute(
            "DELETE FROM memory_records WHERE conversation_id = ?1",
            [conversation_id],
        )?)
    }

    /// Record count for a conversation, expired rows included
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn count(&self, conversation_id: &str) -> Result<usize> {
        let conn = conn(&self.pool)?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory_records WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}
