use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::{Result, StoreError};
use crate::model::{NewChange, Snapshot};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS change_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type     TEXT NOT NULL,
    op              TEXT NOT NULL,
    entity_id       TEXT NOT NULL,
    prior_snapshot  TEXT,
    new_snapshot    TEXT,
    captured_at     INTEGER NOT NULL,
    source_tag      TEXT NOT NULL DEFAULT 'EXTERNAL_DB',
    status          TEXT NOT NULL DEFAULT 'PENDING',
    processed_at    INTEGER,
    error_detail    TEXT,
    attempt_count   INTEGER NOT NULL DEFAULT 0,
    claimed_at      INTEGER
);

CREATE INDEX IF NOT EXISTS idx_change_log_status_captured
    ON change_log(status, captured_at, id);

CREATE INDEX IF NOT EXISTS idx_change_log_entity_status
    ON change_log(entity_id, status);

CREATE TABLE IF NOT EXISTS sync_conflicts (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    conflict_key       TEXT NOT NULL,
    entity_id          TEXT NOT NULL,
    source_a           TEXT NOT NULL,
    source_b           TEXT NOT NULL,
    source_a_snapshot  TEXT,
    source_b_snapshot  TEXT,
    differing_fields   TEXT NOT NULL DEFAULT '[]',
    detected_at        INTEGER NOT NULL,
    status             TEXT NOT NULL DEFAULT 'OPEN',
    resolution_choice  TEXT,
    resolved_at        INTEGER,
    merged_snapshot    TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_conflicts_open_key
    ON sync_conflicts(conflict_key) WHERE status = 'OPEN';

CREATE TABLE IF NOT EXISTS subscriptions (
    entity_id       TEXT PRIMARY KEY,
    data            TEXT NOT NULL,
    updated_at      INTEGER NOT NULL
);
"#;

/// SQLite-backed implementation of every store contract.
///
/// Several `SqliteStore` handles (in one or more processes) may point at the
/// same file; the claim statement is the only coordination they need.
pub struct SqliteStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
                #[cfg(unix)]
                set_owner_perms(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "synchronous", "normal").ok();
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Appends a PENDING record. This is the capture producer's write path;
    /// the sync engine never calls it.
    pub fn record_change(&self, change: &NewChange) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO change_log(entity_type, op, entity_id, prior_snapshot, new_snapshot, captured_at, source_tag)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                change.entity_type,
                change.operation.as_str(),
                change.entity_id,
                encode_snapshot(change.prior_snapshot.as_ref())?,
                encode_snapshot(change.new_snapshot.as_ref())?,
                to_millis(change.captured_at),
                change.source_tag,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::InvalidData(format!("timestamp out of range: {millis}")))
}

pub(crate) fn opt_from_millis(millis: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

pub(crate) fn encode_snapshot(snapshot: Option<&Snapshot>) -> Result<Option<String>> {
    snapshot
        .map(serde_json::to_string)
        .transpose()
        .map_err(Into::into)
}

pub(crate) fn decode_snapshot(raw: Option<String>) -> Result<Option<Snapshot>> {
    raw.map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(Into::into)
}

#[cfg(unix)]
fn set_owner_perms(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = fs::metadata(path)?;
    let mut perms = metadata.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(path, perms)?;
    Ok(())
}
