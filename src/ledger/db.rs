//! SQLite database shared by the ledger and the manifest validator.
//!
//! One writer connection behind a mutex (single-writer discipline) and one
//! read-only connection, with WAL so readers see either the pre- or the
//! post-commit state of a write and never a partial row.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use tracing::info;

use crate::error::{ProvenanceError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ledger_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp REAL,
    sprint_id TEXT,
    manifest_hash TEXT,
    manifest_data TEXT,
    signature TEXT,
    public_key_fingerprint TEXT,
    version TEXT DEFAULT 'v1',
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_ledger_entries_sprint_id ON ledger_entries(sprint_id);
CREATE INDEX IF NOT EXISTS idx_ledger_entries_timestamp ON ledger_entries(timestamp);
CREATE INDEX IF NOT EXISTS idx_ledger_entries_manifest_hash ON ledger_entries(manifest_hash);

CREATE TRIGGER IF NOT EXISTS ledger_entries_no_update
BEFORE UPDATE ON ledger_entries
BEGIN
    SELECT RAISE(ABORT, 'ledger_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS ledger_entries_no_delete
BEFORE DELETE ON ledger_entries
BEGIN
    SELECT RAISE(ABORT, 'ledger_entries is append-only');
END;

CREATE TABLE IF NOT EXISTS manifest_hashes (
    sprint_id TEXT PRIMARY KEY,
    expected_sha256 TEXT,
    actual_sha256 TEXT,
    match_status BOOLEAN,
    validated_at REAL
);
";

pub struct Database {
    path: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Database {
    /// Opens (creating if needed) the database at `path`.
    ///
    /// `busy_timeout` bounds how long a statement waits for a lock held by
    /// another connection or process before failing.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ProvenanceError::Storage(format!("create {}: {e}", parent.display()))
                })?;
            }
        }

        let writer = Connection::open(path)?;
        writer.busy_timeout(busy_timeout)?;
        writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        writer.pragma_update(None, "synchronous", "NORMAL")?;
        writer.execute_batch(SCHEMA)?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(busy_timeout)?;

        info!("Ledger database opened at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` inside an IMMEDIATE transaction on the writer connection.
    /// Commits if `f` succeeds, rolls back otherwise.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| ProvenanceError::Storage("writer lock poisoned".into()))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .reader
            .lock()
            .map_err(|_| ProvenanceError::Storage("reader lock poisoned".into()))?;
        f(&conn)
    }
}
