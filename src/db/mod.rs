//! SQLite mirror of the host's settings storage.
//!
//! Uses `rusqlite` with bundled SQLite. A single `kv` table holds JSON values by key. The
//! bridge writes every storage change the host reports here; the host stays authoritative.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

/// Manages the SQLite key-value database.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        // Enable WAL mode for better concurrent read performance.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// Private database with no backing file.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Read and decode the value stored under `key`.
    pub fn get_value(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let raw: Option<String> = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;

        raw.map(|text| {
            serde_json::from_str(&text).with_context(|| format!("corrupt JSON stored under {key}"))
        })
        .transpose()
    }

    /// Replace the value under `key`. Returns the value it replaced.
    pub fn set_value(&self, key: &str, value: &Value) -> Result<Option<Value>> {
        let encoded = serde_json::to_string(value)?;
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;

        let old: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        tx.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, encoded],
        )?;
        tx.commit()?;

        // An unreadable previous value is reported as absent rather than failing the write.
        Ok(old.and_then(|text| serde_json::from_str(&text).ok()))
    }

    /// Delete the value under `key`, if any.
    pub fn remove_value(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Number of stored keys.
    pub fn key_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
