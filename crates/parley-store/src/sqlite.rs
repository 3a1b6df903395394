//! SQLite-backed `KvStore` shared by every process pointing at the same file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parley_core::{current_unix_timestamp_ms, duration_to_ms};
use rusqlite::{params, Connection};

use crate::{KvStore, StoreResult};

/// Persistent marker store. Expiry uses wall-clock milliseconds so that
/// several processes sharing the file agree on deadlines.
#[derive(Debug)]
pub struct SqliteKvStore {
    db_path: PathBuf,
}

impl SqliteKvStore {
    /// Opens (or creates) the store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_markers (
                key TEXT PRIMARY KEY,
                expires_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_kv_markers_expiry ON kv_markers (expires_at_ms);
            "#,
        )?;
        Ok(())
    }

    fn try_insert_at(&self, key: &str, ttl: Duration, now_ms: u64) -> StoreResult<bool> {
        let connection = self.open_connection()?;
        let expires_at_ms = now_ms.saturating_add(duration_to_ms(ttl));
        // The upsert only fires for an expired row, so a live marker yields zero changes.
        let changed = connection.execute(
            r#"
            INSERT INTO kv_markers (key, expires_at_ms) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET expires_at_ms = excluded.expires_at_ms
            WHERE kv_markers.expires_at_ms <= ?3
            "#,
            params![key, ms_to_db(expires_at_ms), ms_to_db(now_ms)],
        )?;
        Ok(changed == 1)
    }

    fn sweep_expired_at(&self, now_ms: u64) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        let evicted = connection.execute(
            "DELETE FROM kv_markers WHERE expires_at_ms <= ?1",
            params![ms_to_db(now_ms)],
        )?;
        Ok(evicted)
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn try_insert(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.try_insert_at(key, ttl, current_unix_timestamp_ms())
    }

    async fn sweep_expired(&self) -> StoreResult<usize> {
        self.sweep_expired_at(current_unix_timestamp_ms())
    }

    async fn ping(&self) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

fn ms_to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
