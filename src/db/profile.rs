//! Per-conversation user profiles
//!
//! Read-modify-write operations run inside an immediate transaction so
//! concurrent updates to one conversation never lose writes.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use super::{DbPool, conn};
use crate::{Error, Result};

/// One remembered fact about the other party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFact {
    pub text: String,
    /// When the fact was observed
    pub source_ts: DateTime<Utc>,
}

/// What the gateway knows about a conversation partner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub conversation_id: String,
    pub nickname: String,
    pub relationship: String,
    pub personality: String,
    /// Oldest first
    pub facts: Vec<ProfileFact>,
    pub last_emotion: Option<String>,
    pub message_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    /// Empty profile for a conversation
    #[must_use]
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            nickname: String::new(),
            relationship: String::new(),
            personality: String::new(),
            facts: Vec::new(),
            last_emotion: None,
            message_count: 0,
            updated_at: Utc::now(),
        }
    }
}

const PROFILE_COLUMNS: &str =
    "conversation_id, nickname, relationship, personality, facts, last_emotion, message_count, updated_at";

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    let facts: String = row.get(4)?;
    let message_count: i64 = row.get(6)?;
    let updated_at: i64 = row.get(7)?;
    Ok(UserProfile {
        conversation_id: row.get(0)?,
        nickname: row.get(1)?,
        relationship: row.get(2)?,
        personality: row.get(3)?,
        facts: serde_json::from_str(&facts).unwrap_or_default(),
        last_emotion: row.get(5)?,
        message_count: u64::try_from(message_count).unwrap_or(0),
        updated_at: Utc
            .timestamp_millis_opt(updated_at)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

fn load(conn: &rusqlite::Connection, conversation_id: &str) -> Result<Option<UserProfile>> {
    let sql = format!("SELECT {PROFILE_COLUMNS} FROM user_profiles WHERE conversation_id = ?1");
    Ok(conn
        .query_row(&sql, [conversation_id], row_to_profile)
        .optional()?)
}

fn store(conn: &rusqlite::Connection, profile: &UserProfile) -> Result<()> {
    let facts = serde_json::to_string(&profile.facts)?;
    conn.execute(
        "INSERT INTO user_profiles (conversation_id, nickname, relationship, personality, facts, last_emotion, message_count, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(conversation_id) DO UPDATE SET
            nickname = ?2, relationship = ?3, personality = ?4, facts = ?5,
            last_emotion = ?6, message_count = ?7, updated_at = ?8",
        rusqlite::params![
            profile.conversation_id,
            profile.nickname,
            profile.relationship,
            profile.personality,
            facts,
            profile.last_emotion,
            i64::try_from(profile.message_count).unwrap_or(i64::MAX),
            profile.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

/// Profile repository
#[derive(Clone)]
pub struct ProfileRepo {
    pool: DbPool,
}

impl ProfileRepo {
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Fetch a profile
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, conversation_id: &str) -> Result<Option<UserProfile>> {
        let conn = conn(&self.pool)?;
        load(&conn, conversation_id)
    }

    /// Insert or replace a profile
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set(&self, profile: &UserProfile) -> Result<()> {
        let conn = conn(&self.pool)?;
        store(&conn, profile)
    }

    /// Load, modify, and store a profile in one transaction
    ///
    /// A missing profile starts out empty.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn update<F>(&self, conversation_id: &str, f: F) -> Result<UserProfile>
    where
        F: FnOnce(&mut UserProfile),
    {
        let mut conn = conn(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut profile =
            load(&tx, conversation_id)?.unwrap_or_else(|| UserProfile::new(conversation_id));
        f(&mut profile);
        profile.updated_at = Utc::now();
        store(&tx, &profile)?;

        tx.commit()?;
        Ok(profile)
    }

    /// Count one more message, returning the new total
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn increment_message_count(&self, conversation_id: &str) -> Result<u64> {
        self.update(conversation_id, |p| p.message_count += 1)
            .map(|p| p.message_count)
    }

    /// Record the last detected emotion label
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn update_emotion(&self, conversation_id: &str, label: &str) -> Result<()> {
        self.update(conversation_id, |p| p.last_emotion = Some(label.to_string()))
            .map(|_| ())
    }

    /// Add a fact, skipping duplicates and keeping at most `max_facts`
    ///
    /// The oldest facts are dropped first. Returns whether the fact was new.
    ///
    /// # Errors
    ///
    /// Returns error if `text` is blank or the database operation fails
    pub fn add_fact(&self, conversation_id: &str, text: &str, max_facts: usize) -> Result<bool> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Database("empty profile fact".to_string()));
        }

        let mut added = false;
        self.update(conversation_id, |p| {
            if p.facts.iter().any(|f| f.text == text) {
                return;
            }
            p.facts.push(ProfileFact {
                text: text.to_string(),
                source_ts: Utc::now(),
            });
            let excess = p.facts.len().saturating_sub(max_facts.max(1));
            p.facts = p.facts.split_off(excess);
            added = true;
        })?;
        Ok(added)
    }
}
