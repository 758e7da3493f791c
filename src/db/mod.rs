//! SQLite metastore: users, projects, mappings, corrections, patterns,
//! watch subscriptions, and the durable queues.
//!
//! One connection per handle, WAL mode for concurrent readers. Workers hold
//! the store behind a `Mutex` and keep their critical sections short: gather
//! state under the lock, do slow I/O (provider, extractor) without it, write
//! results under the lock again.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use thiserror::Error;

pub mod attachments;
pub mod corrections;
pub mod mappings;
pub mod projects;
pub mod queue;
pub mod users;
pub mod watches;

pub use attachments::*;
pub use corrections::*;
pub use mappings::*;
pub use projects::*;
pub use queue::*;
pub use users::*;
pub use watches::*;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Shared handle used across workers and the HTTP surface.
pub type SharedStore = Arc<Mutex<Metastore>>;

pub struct Metastore {
    conn: Connection,
}

impl Metastore {
    /// Open (or create) the database at `path` and apply pending migrations.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Metastore { conn })
    }

    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a transaction. Commits on Ok, rolls back on Err.
    ///
    /// Resolution side effects (mapping write + counter update + reflection
    /// enqueue) and correction replays go through here so they land atomically.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Self) -> Result<T, DbError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

}

/// Current moment, RFC 3339, the format every timestamp column stores.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Wrap a store in the shared handle.
pub fn shared(store: Metastore) -> SharedStore {
    Arc::new(Mutex::new(store))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_applies_schema() {
        let store = Metastore::open_in_memory().expect("open");
        let count: i64 = store
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))
            .expect("projects table");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_transaction_commits_on_ok() {
        let store = Metastore::open_in_memory().unwrap();
        store
            .with_transaction(|s| {
                s.conn_ref()
                    .execute(
                        "INSERT INTO users (id, email, created_at, updated_at)
                         VALUES ('u1', 'a@b.test', '2026-01-01', '2026-01-01')",
                        [],
                    )
                    .map_err(DbError::from)?;
                Ok(())
            })
            .unwrap();
        let count: i64 = store
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_err() {
        let store = Metastore::open_in_memory().unwrap();
        let result: Result<(), DbError> = store.with_transaction(|s| {
            s.conn_ref()
                .execute(
                    "INSERT INTO users (id, email, created_at, updated_at)
                     VALUES ('u1', 'a@b.test', '2026-01-01', '2026-01-01')",
                    [],
                )
                .map_err(DbError::from)?;
            Err(DbError::Conflict("forced".into()))
        });
        assert!(result.is_err());
        let count: i64 = store
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
