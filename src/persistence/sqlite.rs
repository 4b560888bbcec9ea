//! SQLite backend: an append-only `kv_log` table.
//!
//! Every `put` inserts a new row; `get` returns the newest row for a key.
//! Old revisions stay until [`SqliteStore::compact`] removes them.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use super::KeyValueStore;
use crate::error::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    key           TEXT    NOT NULL,
    value         TEXT    NOT NULL,
    written_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_kv_log_key ON kv_log (key, id);
";

pub struct SqliteStore {
    conn: Connection,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Number of rows stored for `key`, including superseded ones.
    pub fn revisions(&self, key: &str) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM kv_log WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as usize)
    }

    /// Delete every row that is not the latest for its key. Returns the
    /// number of rows removed.
    pub fn compact(&mut self) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM kv_log WHERE id NOT IN (SELECT MAX(id) FROM kv_log GROUP BY key)",
            [],
        )?;
        tracing::debug!(target: "learning::persistence", removed, "kv_log compacted");
        Ok(removed)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kv_log WHERE key = ?1 ORDER BY id DESC LIMIT 1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv_log (key, value, written_at_ms) VALUES (?1, ?2, ?3)",
            params![key, value, now_ms()],
        )?;
        Ok(())
    }
}
