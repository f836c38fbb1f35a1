//! Blocking SQLite engine with bounded lock-retry and reopen-after-closed.
//!
//! All methods here run on `spawn_blocking` threads; the async facade lives
//! in `store.rs`. The connection slot is `Option<Connection>` under a mutex:
//! `None` + `shut_down` means deliberately closed (callers get
//! `StoreError::Closed`), `None` without the flag means the connection was
//! dropped by a concurrent path and the next operation reopens it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use rusqlite::Connection;

use crate::StoreError;

/// Lock contention is retried this many times with jittered backoff.
const LOCK_RETRY_ATTEMPTS: usize = 20;
const RETRY_BASE_DELAY_MS: u64 = 10;
const RETRY_JITTER_MS: u64 = 10;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS api_keys (
    provider TEXT PRIMARY KEY,
    encrypted_key TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tool_calls TEXT,
    reasoning TEXT,
    timestamp TEXT NOT NULL,
    FOREIGN KEY(conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
";

pub(crate) struct Database {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
    shut_down: AtomicBool,
}

impl Database {
    pub(crate) fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = open_connection(path)?;
        let db = Self {
            path: path.to_path_buf(),
            conn: Mutex::new(Some(conn)),
            shut_down: AtomicBool::new(false),
        };
        db.with_conn(|conn| conn.execute_batch(SCHEMA))?;
        db.try_enable_wal();
        Ok(db)
    }

    /// WAL improves concurrent readers; on persistent contention we keep the
    /// default journal mode and move on.
    fn try_enable_wal(&self) {
        let result = self.with_conn(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")
        });
        if let Err(err) = result {
            tracing::debug!(error = %err, "WAL activation failed, using default journal mode");
        }
    }

    pub(crate) fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.conn.lock() {
            *slot = None;
        }
    }

    /// Run `op` against the live connection, retrying lock contention with
    /// jittered backoff and reopening a dropped (not shut-down) connection.
    pub(crate) fn with_conn<T>(
        &self,
        op: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        for attempt in 0..LOCK_RETRY_ATTEMPTS {
            if self.shut_down.load(Ordering::SeqCst) {
                return Err(StoreError::Closed);
            }

            let mut slot = self.conn.lock().map_err(|_| {
                StoreError::Task("database mutex poisoned".to_string())
            })?;
            if slot.is_none() {
                *slot = Some(open_connection(&self.path)?);
            }
            let conn = slot.as_ref().ok_or(StoreError::Closed)?;

            match op(conn) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let text = err.to_string().to_lowercase();
                    if text.contains("locked") || text.contains("busy") {
                        drop(slot);
                        backoff(attempt);
                        continue;
                    }
                    if text.contains("closed") {
                        // Dropped out from under us; reopen on the next pass.
                        *slot = None;
                        continue;
                    }
                    return Err(StoreError::Sqlite(err));
                }
            }
        }
        Err(StoreError::Busy(LOCK_RETRY_ATTEMPTS))
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_millis(100))?;
    Ok(conn)
}

fn backoff(attempt: usize) {
    let jitter = rand::thread_rng().gen_range(0..=RETRY_JITTER_MS);
    let delay = RETRY_BASE_DELAY_MS * (attempt as u64 + 1) + jitter;
    std::thread::sleep(Duration::from_millis(delay));
}
