use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;

use crate::sqlite::configure_connection;

const STORE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS engine_kv (\n\
     key TEXT PRIMARY KEY,\n\
     value TEXT NOT NULL,\n\
     updated_at TEXT NOT NULL DEFAULT (datetime('now'))\n\
 );";

pub const KEY_RESTART_COUNT: &str = "capture.restart_count";
pub const KEY_STOP_FLAG: &str = "capture.stop";
pub const KEY_TASK_HANDLE: &str = "capture.task_handle";
pub const KEY_STATUS_SNAPSHOT: &str = "stats.snapshot";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open engine store {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on engine store: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("store path not configured")]
    MissingStore,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Shared counter/flag store: restart counter, ingestion stop flag, the
/// active capture task handle and the published status snapshot. Stands
/// in for the external key-value collaborator; its consistency
/// guarantees are whatever SQLite provides.
#[derive(Debug, Clone)]
pub struct EngineStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl EngineStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        }
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn =
            Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
                StoreError::Open {
                    source,
                    path: self.path.clone(),
                }
            })?;
        configure_connection(&conn).map_err(|source| StoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(STORE_SCHEMA)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.open()?;
        let value = conn
            .query_row(
                "SELECT value FROM engine_kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO engine_kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))\n\
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute("DELETE FROM engine_kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Atomic increment, creating the counter at 1 if absent. Returns the
    /// new value.
    pub fn incr(&self, key: &str) -> StoreResult<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO engine_kv (key, value, updated_at) VALUES (?1, '1', datetime('now'))\n\
             ON CONFLICT(key) DO UPDATE SET\n\
                 value = CAST(CAST(value AS INTEGER) + 1 AS TEXT),\n\
                 updated_at = excluded.updated_at",
            params![key],
        )?;
        let value: String = conn.query_row(
            "SELECT value FROM engine_kv WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(value.parse().unwrap_or(0))
    }

    pub fn restart_count(&self) -> StoreResult<i64> {
        Ok(self
            .get(KEY_RESTART_COUNT)?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    pub fn incr_restart_count(&self) -> StoreResult<i64> {
        self.incr(KEY_RESTART_COUNT)
    }

    pub fn stop_flag(&self) -> StoreResult<bool> {
        Ok(self.get(KEY_STOP_FLAG)?.is_some())
    }

    pub fn set_stop_flag(&self) -> StoreResult<()> {
        self.set(KEY_STOP_FLAG, "1")
    }

    pub fn clear_stop_flag(&self) -> StoreResult<()> {
        self.delete(KEY_STOP_FLAG)
    }

    pub fn task_handle(&self) -> StoreResult<Option<String>> {
        self.get(KEY_TASK_HANDLE)
    }

    pub fn set_task_handle(&self, handle: &str) -> StoreResult<()> {
        self.set(KEY_TASK_HANDLE, handle)
    }

    pub fn publish_snapshot(&self, snapshot: &serde_json::Value) -> StoreResult<()> {
        self.set(KEY_STATUS_SNAPSHOT, &snapshot.to_string())
    }

    pub fn load_snapshot(&self) -> StoreResult<Option<serde_json::Value>> {
        Ok(self
            .get(KEY_STATUS_SNAPSHOT)?
            .and_then(|raw| serde_json::from_str(&raw).ok()))
    }
}
