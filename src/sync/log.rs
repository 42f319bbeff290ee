//! Durable mutation log.
//!
//! Pending mutations live in one SQLite table keyed by an ascending
//! `AUTOINCREMENT` id; iteration order is insertion order. Every operation runs
//! in its own transaction on a single connection that is opened on first use
//! and then reused for the lifetime of the handle. Use
//! [`crate::core::pool::shared_log`] to get the one handle per file for the
//! whole process.

use crate::core::db;
use crate::core::error::SyncError;
use crate::core::pool::{self, FlushGuard};
use crate::core::schemas;
use crate::core::time;
use crate::sync::mutation::{QueuedMutation, StoredMutation};
use rusqlite::{Connection, TransactionBehavior, params};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::{debug, warn};

/// A stored row that could not be turned back into a [`QueuedMutation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    pub id: i64,
    pub reason: String,
}

/// Everything pending at one point in time, read in a single transaction.
#[derive(Debug, Default)]
pub struct LogSnapshot {
    /// Decodable records in insertion order.
    pub entries: Vec<QueuedMutation>,
    /// Rows that failed decoding.
    pub rejected: Vec<RejectedRecord>,
    /// Largest id covered by this snapshot, decodable or not.
    pub high_water: Option<i64>,
}

impl LogSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.rejected.is_empty()
    }
}

pub struct MutationLog {
    db_path: PathBuf,
    conn: OnceLock<Mutex<Connection>>,
    init_lock: Mutex<()>,
}

impl MutationLog {
    /// Create a handle. Nothing touches the disk until the first operation.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            conn: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    pub fn in_dir(root: &Path) -> Self {
        Self::new(db::mutation_log_path(root))
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connection(&self) -> Result<&Mutex<Connection>, SyncError> {
        if let Some(conn) = self.conn.get() {
            return Ok(conn);
        }
        let _init = self
            .init_lock
            .lock()
            .map_err(|_| SyncError::LockPoisoned("mutation log init lock".to_string()))?;
        if let Some(conn) = self.conn.get() {
            return Ok(conn);
        }
        // A failed open leaves the cell empty so the next call tries again.
        let conn = db::db_connect(&self.db_path.to_string_lossy())?;
        conn.execute(schemas::MUTATION_LOG_SCHEMA, [])?;
        debug!(path = %self.db_path.display(), "opened mutation log");
        Ok(self.conn.get_or_init(|| Mutex::new(conn)))
    }

    fn with_conn<F, R>(&self, op: &str, f: F) -> Result<R, SyncError>
    where
        F: FnOnce(&mut Connection) -> Result<R, SyncError>,
    {
        let result = self.connection().and_then(|conn| {
            let mut guard = conn
                .lock()
                .map_err(|_| SyncError::LockPoisoned("mutation log connection".to_string()))?;
            f(&mut guard)
        });
        result.inspect_err(|e| warn!(op, error = %e, "mutation log operation failed"))
    }

    /// Persist a mutation and return its id. The record is durable once this
    /// returns `Ok`; on `Err` it was not queued.
    pub fn enqueue(&self, mut mutation: QueuedMutation) -> Result<i64, SyncError> {
        mutation.resolve_identity();
        mutation.validate()?;
        let encoded = mutation.encode()?;
        let queued_at = time::now_rfc3339();

        let id = self.with_conn("enqueue", |conn| {
            db::check_fault("write")?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO mutations(action, collection_path, doc_id, payload, target_user_id, content_hash, queued_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    encoded.action,
                    encoded.collection_path,
                    encoded.doc_id,
                    encoded.payload,
                    encoded.target_user_id,
                    encoded.content_hash,
                    queued_at
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(id)
        })?;

        debug!(
            id,
            action = %mutation.action(),
            collection = %mutation.collection_path,
            doc_id = mutation.doc_id().unwrap_or(""),
            "queued mutation"
        );
        Ok(id)
    }

    /// Read every pending row in insertion order.
    pub fn snapshot(&self) -> Result<LogSnapshot, SyncError> {
        let rows = self.with_conn("snapshot", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let rows = {
                let mut stmt = tx.prepare(
                    "SELECT id, action, collection_path, doc_id, payload, target_user_id, content_hash
                     FROM mutations ORDER BY id ASC",
                )?;
                stmt.query_map([], |row| {
                    Ok(StoredMutation {
                        id: row.get(0)?,
                        action: row.get(1)?,
                        collection_path: row.get(2)?,
                        doc_id: row.get(3)?,
                        payload: row.get(4)?,
                        target_user_id: row.get(5)?,
                        content_hash: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?
            };
            tx.commit()?;
            Ok(rows)
        })?;

        let mut snapshot = LogSnapshot::default();
        for row in rows {
            let id = row.id;
            snapshot.high_water = Some(id);
            match QueuedMutation::decode(row) {
                Ok(record) => snapshot.entries.push(record),
                Err(e) => {
                    warn!(id, error = %e, "unreadable queued mutation");
                    snapshot.rejected.push(RejectedRecord {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        debug!(
            entries = snapshot.entries.len(),
            rejected = snapshot.rejected.len(),
            "read mutation log snapshot"
        );
        Ok(snapshot)
    }

    /// Every pending record, in insertion order. Rows that fail decoding are
    /// left out; see [`MutationLog::snapshot`] for them.
    pub fn list_all(&self) -> Result<Vec<QueuedMutation>, SyncError> {
        Ok(self.snapshot()?.entries)
    }

    pub fn pending_count(&self) -> Result<usize, SyncError> {
        self.with_conn("count", |conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM mutations", [], |row| {
                row.get(0)
            })?;
            Ok(count as usize)
        })
    }

    /// Remove every pending record. Returns how many were removed.
    pub fn clear(&self) -> Result<usize, SyncError> {
        let removed = self.with_conn("clear", |conn| {
            Ok(conn.execute("DELETE FROM mutations", [])?)
        })?;
        debug!(removed, "cleared mutation log");
        Ok(removed)
    }

    /// Remove records with `id <= high_water`, leaving anything queued later.
    pub fn clear_through(&self, high_water: i64) -> Result<usize, SyncError> {
        let removed = self.with_conn("clear_through", |conn| {
            Ok(conn.execute("DELETE FROM mutations WHERE id <= ?1", params![high_water])?)
        })?;
        debug!(removed, high_water, "retired flushed mutations");
        Ok(removed)
    }

    /// Claim the process-wide flush slot for this log file. Other handles on
    /// the same file, including ones not obtained through
    /// [`crate::core::pool::shared_log`], see it as taken until the guard drops.
    pub fn begin_flush(&self) -> Result<FlushGuard<'static>, SyncError> {
        pool::global_registry().claim_flush(&self.db_path)
    }

    pub fn is_flushing(&self) -> bool {
        pool::global_registry().is_flushing(&self.db_path)
    }
}
