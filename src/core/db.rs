use crate::core::error::SyncError;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment switch used by tests to make storage fail at a given stage
/// (`open` or `write`).
pub const FAULT_STAGE_ENV: &str = "OFFSYNC_SQLITE_FAULT_STAGE";

const BUSY_TIMEOUT_SECS: u64 = 5;

pub fn db_connect(db_path: &str) -> Result<Connection, SyncError> {
    check_fault("open")?;
    if let Some(parent) = Path::new(db_path).parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(conn)
}

/// Fails with a synthetic SQLite I/O error when the fault env var names `stage`.
pub fn check_fault(stage: &str) -> Result<(), SyncError> {
    match std::env::var(FAULT_STAGE_ENV) {
        Ok(configured) if configured == stage => Err(SyncError::StorageUnavailable(
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
                Some(format!("injected fault at stage '{}'", stage)),
            ),
        )),
        _ => Ok(()),
    }
}

pub fn mutation_log_path(root: &Path) -> PathBuf {
    root.join(schemas::MUTATION_LOG_DB_NAME)
}

pub fn replica_db_path(root: &Path) -> PathBuf {
    root.join(schemas::REPLICA_DB_NAME)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(schemas::CONFIG_FILE_NAME)
}
