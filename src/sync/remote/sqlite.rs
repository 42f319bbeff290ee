//! Local SQLite replica of the remote document store.
//!
//! Documents are stored as JSON keyed by their full path. Each batch runs in one
//! SQLite transaction and appends a row to `commits`, so the replica doubles as
//! an audit trail of what a flush sent.

use crate::core::db;
use crate::core::error::{RemoteError, SyncError};
use crate::core::schemas;
use crate::core::time;
use crate::sync::remote::{DocumentPath, RemoteStore, WriteBatch, apply_write};
use crate::sync::value::WireMap;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

pub struct SqliteStore {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let db_path = db_path.into();
        let conn = db::db_connect(&db_path.to_string_lossy())?;
        conn.execute(schemas::REPLICA_DOCUMENTS_SCHEMA, [])?;
        conn.execute(schemas::REPLICA_DOCUMENTS_INDEX, [])?;
        conn.execute(schemas::REPLICA_COMMITS_SCHEMA, [])?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn in_dir(root: &Path) -> Result<Self, SyncError> {
        Self::open(db::replica_db_path(root))
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RemoteError> {
        self.conn.lock().map_err(|_| RemoteError::LockPoisoned)
    }

    pub fn get(&self, path: &DocumentPath) -> Result<Option<WireMap>, RemoteError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM documents WHERE path = ?1",
                params![path.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|text| serde_json::from_str(&text)).transpose()?)
    }

    /// Documents in `collection`, ordered by document id.
    pub fn documents_in(&self, collection: &str) -> Result<Vec<(String, WireMap)>, RemoteError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT doc_id, data FROM documents WHERE collection = ?1 ORDER BY doc_id ASC",
        )?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, text)| -> Result<(String, WireMap), RemoteError> {
                Ok((id, serde_json::from_str(&text)?))
            })
            .collect()
    }

    /// Operation counts of every committed batch, oldest first.
    pub fn commit_sizes(&self) -> Result<Vec<usize>, RemoteError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT op_count FROM commits ORDER BY id ASC")?;
        let sizes = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|size| size.map(|s| s as usize))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sizes)
    }
}

impl RemoteStore for SqliteStore {
    fn commit(&self, batch: WriteBatch) -> Result<(), RemoteError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = time::now_rfc3339();

        for op in batch.ops() {
            let path = op.path();
            let key = path.to_string();
            let current: Option<String> = tx
                .query_row(
                    "SELECT data FROM documents WHERE path = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            let current = current
                .map(|text| serde_json::from_str::<WireMap>(&text))
                .transpose()?;

            match apply_write(current, op) {
                Some(data) => tx.execute(
                    "INSERT INTO documents(path, collection, doc_id, data, updated_at)
                     VALUES(?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(path) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
                    params![
                        key,
                        path.collection(),
                        path.doc_id(),
                        serde_json::to_string(&data)?,
                        now
                    ],
                )?,
                None => tx.execute("DELETE FROM documents WHERE path = ?1", params![key])?,
            };
        }

        tx.execute(
            "INSERT INTO commits(op_count, committed_at) VALUES(?1, ?2)",
            params![batch.len() as i64, now],
        )?;
        tx.commit()?;
        debug!(ops = batch.len(), replica = %self.db_path.display(), "replica batch committed");
        Ok(())
    }
}
