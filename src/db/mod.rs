//! Persistent memory store
//!
//! Conversation memory records and per-conversation profiles in SQLite.

pub mod memory;
pub mod profile;
mod schema;

use std::path::Path;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::context::Role;
use crate::{Error, Result};

pub use memory::{MemoryRecord, MemoryRepo};
pub use profile::{ProfileFact, ProfileRepo, UserProfile};
pub use schema::SCHEMA_VERSION;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled database connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

pub(crate) fn conn(pool: &DbPool) -> Result<DbConn> {
    pool.get().map_err(|e| Error::Database(e.to_string()))
}

/// Initialize the database
///
/// # Errors
///
/// Returns error if database cannot be opened or initialized
pub fn init<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(path)
        .with_init(|c| c.busy_timeout(std::time::Duration::from_secs(5)));
    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    let conn = conn(&pool)?;
    schema::init(&conn)?;

    tracing::info!(version = SCHEMA_VERSION, path = %path.display(), "database initialized");
    Ok(pool)
}

/// Initialize an in-memory database (for testing)
///
/// # Errors
///
/// Returns error if database cannot be initialized
pub fn init_memory() -> Result<DbPool> {
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;

    let conn = conn(&pool)?;
    schema::init(&conn)?;

    Ok(pool)
}

/// Memory records and profiles behind one handle
#[derive(Clone)]
pub struct MemoryStore {
    pool: DbPool,
    memory: MemoryRepo,
    profiles: ProfileRepo,
}

impl MemoryStore {
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self {
            memory: MemoryRepo::new(pool.clone()),
            profiles: ProfileRepo::new(pool.clone()),
            pool,
        }
    }

    /// Open an in-memory store
    ///
    /// # Errors
    ///
    /// Returns error if the schema cannot be created
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(init_memory()?))
    }

    #[must_use]
    pub const fn memory(&self) -> &MemoryRepo {
        &self.memory
    }

    #[must_use]
    pub const fn profiles(&self) -> &ProfileRepo {
        &self.profiles
    }

    /// Check that a connection can be checked out and queried
    ///
    /// # Errors
    ///
    /// Returns error if the pool or the query fails
    pub fn ping(&self) -> Result<()> {
        let conn = conn(&self.pool)?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// Persist one completed exchange
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn record_exchange(
        &self,
        conversation_id: &str,
        user: &str,
        assistant: &str,
        ttl: Option<std::time::Duration>,
    ) -> Result<()> {
        self.memory.append(conversation_id, Role::User, user, ttl)?;
        self.memory.append(conversation_id, Role::Assistant, assistant, ttl)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_memory_runs_migrations() {
        let pool = init_memory().unwrap();
        let conn = pool.get().unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn init_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("parley.db");

        let pool = init(&path).unwrap();
        drop(pool);

        assert!(path.exists());
        // second open sees the current version and skips migrations
        init(&path).unwrap();
    }

    #[test]
    fn record_exchange_appends_both_roles() {
        let store = MemoryStore::in_memory().unwrap();
        store.record_exchange("A", "hi", "hello", None).unwrap();

        let records = store.memory().recent("A", 10, None).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].role, Role::User);
        assert_eq!(records[1].role, Role::Assistant);
    }
}
