//! SQLite persistence for all kronk entities.
//!
//! One [`Store`] owns the connection; every component reads and writes
//! through it. Writes are serialized behind a mutex; SQLite is the only
//! durable state and the single point of concurrency control.

mod journal;
mod memories;
mod schema;
mod sessions;
mod tasks;
mod tools;
pub mod vector;
mod watchers;

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;

use kronk_domain::{Error, Result};

pub use schema::SCHEMA_VERSION;

/// Options controlling schema shape at open time.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// When set, `memory.embedding` and `journal.embedding` exist with
    /// this dimension; when `None` the columns are absent and callers
    /// must fall back to content search.
    pub vector_dim: Option<usize>,
}

/// Handle to the kronk database.
pub struct Store {
    conn: Mutex<Connection>,
    vector_dim: Option<usize>,
}

impl Store {
    /// Open (creating if necessary) the database at `path`.
    ///
    /// Fails if the file holds a different schema version or was created
    /// with a different vector-search setting; both are fatal to the
    /// daemon and are not recovered here.
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::Store(format!("opening {}: {e}", path.display())))?;
        Self::init(conn, options)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(options: StoreOptions) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, options)
    }

    fn init(conn: Connection, options: StoreOptions) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::init_schema(&conn, options.vector_dim)?;
        Ok(Self {
            conn: Mutex::new(conn),
            vector_dim: options.vector_dim,
        })
    }

    /// Whether embedding columns exist.
    pub fn vector_enabled(&self) -> bool {
        self.vector_dim.is_some()
    }

    /// Configured embedding dimension, when vector search is enabled.
    pub fn vector_dim(&self) -> Option<usize> {
        self.vector_dim
    }

    /// Run `f` with the locked connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a transaction; commit on `Ok`, roll back on `Err`.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(Error::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(Error::from)?;
        Ok(value)
    }

    /// Validate an embedding against the configured dimension.
    pub(crate) fn check_dim(&self, embedding: &[f32]) -> Result<()> {
        match self.vector_dim {
            Some(dim) if embedding.len() == dim => Ok(()),
            Some(dim) => Err(Error::invalid(format!(
                "embedding dimension {} does not match configured {dim}",
                embedding.len()
            ))),
            None => Err(Error::invalid("vector search is disabled")),
        }
    }
}

// ── Timestamp helpers (second resolution, ISO-8601, UTC) ───────────

pub(crate) fn ts(dt: chrono::DateTime<chrono::Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub(crate) fn parse_ts(s: &str) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) fn json_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_without_vectors() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        assert!(!store.vector_enabled());
    }

    #[test]
    fn open_in_memory_with_vectors() {
        let store = Store::open_in_memory(StoreOptions { vector_dim: Some(1536) }).unwrap();
        assert!(store.vector_enabled());
        assert_eq!(store.vector_dim(), Some(1536));
    }

    #[test]
    fn reopen_with_mismatched_vector_setting_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kronk.db");
        drop(Store::open(&path, StoreOptions { vector_dim: Some(8) }).unwrap());
        let err = Store::open(&path, StoreOptions::default());
        assert!(err.is_err());
    }

    #[test]
    fn timestamps_round_trip_at_second_resolution() {
        let now = chrono::Utc::now();
        let parsed = parse_ts(&ts(now)).unwrap();
        assert_eq!(parsed.timestamp(), now.timestamp());
    }
}
