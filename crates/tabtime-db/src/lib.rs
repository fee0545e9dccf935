//! Storage layer for the tab time tracker.
//!
//! Provides a durable [`KeyValueStore`] backed by `rusqlite`.
//!
//! # Thread Safety
//!
//! `rusqlite::Connection` is `Send` but not `Sync`, so [`SqliteStore`] keeps
//! it behind a shared `Mutex`. The synchronous methods block the calling
//! thread; the [`KeyValueStore`] impl runs each statement on tokio's blocking
//! pool so a slow disk never stalls the async workers.
//!
//! # Schema
//!
//! One table, `kv`, with a `TEXT` primary key and the value as JSON text.
//! `updated_at` is an ISO 8601 UTC timestamp (e.g. `2024-01-15T10:30:00Z`),
//! kept for inspection only.
//!
//! The store offers no multi-key transactions to its callers: like the
//! browser store it stands in for, read-modify-write sequences must be
//! serialized by the caller.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use thiserror::Error;

use tabtime_core::{KeyValueStore, StoreError};

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored value is not valid JSON.
    #[error("invalid JSON stored under {key}: {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::InvalidValue { key, source } => Self::Serialization { key, source },
            DbError::Sqlite(e) => Self::Backend(e.to_string()),
        }
    }
}

/// SQLite-backed key-value store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens a store at the given path, creating it if necessary.
    ///
    /// The schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory store.
    ///
    /// Useful for testing. The data is destroyed when the store is dropped.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initializes the schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn().execute_batch(
            "
            -- value: JSON text
            -- updated_at: ISO 8601 format (e.g., '2024-01-15T10:30:00Z')
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Reads and decodes the value under `key`.
    pub fn get_value(&self, key: &str) -> Result<Option<Value>, DbError> {
        read(&self.conn(), key)
    }

    /// Inserts or replaces the value under `key`.
    pub fn set_value(&self, key: &str, value: &Value) -> Result<(), DbError> {
        write(&self.conn(), key, value)
    }

    /// Deletes `key`. Returns whether a row was removed.
    pub fn remove_value(&self, key: &str) -> Result<bool, DbError> {
        delete(&self.conn(), key)
    }

    /// Lists all stored keys in order.
    pub fn keys(&self) -> Result<Vec<String>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        lock(&self.conn)
    }

    /// Runs `op` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DbError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || op(&lock(&conn)))
            .await
            .map_err(|e| StoreError::Backend(format!("storage task failed: {e}")))?
            .map_err(StoreError::from)
    }
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    // Statements are atomic in SQLite, so a poisoned lock holds a usable connection.
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read(conn: &Connection, key: &str) -> Result<Option<Value>, DbError> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM kv WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .optional()?;
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|source| DbError::InvalidValue {
            key: key.to_string(),
            source,
        })
    })
    .transpose()
}

fn write(conn: &Connection, key: &str, value: &Value) -> Result<(), DbError> {
    let updated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    conn.execute(
        "
        INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        ",
        params![key, value.to_string(), updated_at],
    )?;
    Ok(())
}

fn delete(conn: &Connection, key: &str) -> Result<bool, DbError> {
    let removed = conn.execute("DELETE FROM kv WHERE key = ?", [key])?;
    Ok(removed > 0)
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let owned = key.to_string();
        let value = self.blocking(move |conn| read(conn, &owned)).await?;
        tracing::trace!(key, found = value.is_some(), "kv get");
        Ok(value)
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let owned = key.to_string();
        self.blocking(move |conn| write(conn, &owned, &value)).await?;
        tracing::trace!(key, "kv set");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let owned = key.to_string();
        let removed = self.blocking(move |conn| delete(conn, &owned)).await?;
        tracing::trace!(key, removed, "kv remove");
        Ok(())
    }
}
