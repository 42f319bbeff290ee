//! Sync engine: drains the mutation log into a remote store.
//!
//! A flush reads one snapshot of the log, turns it into a [`SyncPlan`] of
//! ordered [`ChunkTask`]s (each at most `chunk_size` operations), commits the
//! chunks one after another and, only when every chunk committed, retires the
//! snapshot from the log. Any commit failure stops the flush and leaves the whole
//! snapshot queued; the next flush replays it. Every queued write targets a
//! fixed document path and applies to any current state of that document, so
//! re-applying chunks that already committed converges on the same result.

use crate::core::config::SyncConfig;
use crate::core::error::SyncError;
use crate::sync::log::{LogSnapshot, MutationLog, RejectedRecord};
use crate::sync::mutation::{Mutation, QueuedMutation, validate_segment};
use crate::sync::normalize::normalize_document;
use crate::sync::remote::{DocumentPath, RemoteStore, WriteBatch, WriteOp};
use crate::sync::value::{Value, WireMap};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// One atomic commit: a contiguous run of log records.
#[derive(Debug)]
pub struct ChunkTask {
    pub index: usize,
    pub first_id: i64,
    pub last_id: i64,
    pub batch: WriteBatch,
}

impl ChunkTask {
    fn new(index: usize, first_id: i64, chunk_size: usize) -> Self {
        Self {
            index,
            first_id,
            last_id: first_id,
            batch: WriteBatch::with_limit(chunk_size),
        }
    }

    fn push(&mut self, id: i64, op: WriteOp) -> Result<(), SyncError> {
        self.batch
            .push(op)
            .map_err(|e| SyncError::InvalidMutation(e.to_string()))?;
        self.last_id = id;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// The ordered commit tasks for one snapshot.
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub owner: String,
    pub chunks: Vec<ChunkTask>,
    /// Records that will be retired without being sent.
    pub skipped: Vec<RejectedRecord>,
    /// Largest log id covered by the snapshot.
    pub high_water: Option<i64>,
}

impl SyncPlan {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn operation_count(&self) -> usize {
        self.chunks.iter().map(ChunkTask::len).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Mutations committed to the remote store.
    pub applied: usize,
    pub chunks_committed: usize,
    /// Records dropped from the log because they could not be applied.
    pub skipped: Vec<RejectedRecord>,
}

pub struct SyncEngine<'a, R: RemoteStore + ?Sized> {
    log: &'a MutationLog,
    remote: &'a R,
    config: SyncConfig,
}

impl<'a, R: RemoteStore + ?Sized> SyncEngine<'a, R> {
    pub fn new(log: &'a MutationLog, remote: &'a R) -> Self {
        Self {
            log,
            remote,
            config: SyncConfig::default(),
        }
    }

    pub fn with_config(
        log: &'a MutationLog,
        remote: &'a R,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self {
            log,
            remote,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Destination write for one record. The namespace is the record's
    /// `target_user_id` when set, otherwise `owner`.
    pub fn write_op(&self, owner: &str, record: &QueuedMutation) -> Result<WriteOp, SyncError> {
        let namespace = record.target_user_id.as_deref().unwrap_or(owner);
        let collection = format!(
            "{}/{}/{}",
            self.config.root_collection, namespace, record.collection_path
        );
        let doc_path = |doc_id: &str| {
            DocumentPath::new(collection.as_str(), doc_id)
                .map_err(|e| SyncError::InvalidPath(e.to_string()))
        };

        match &record.mutation {
            Mutation::Add { doc_id, payload } => {
                let doc_id = doc_id.as_deref().ok_or_else(|| {
                    SyncError::InvalidMutation(format!(
                        "add record {:?} has no document identity",
                        record.id
                    ))
                })?;
                Ok(WriteOp::Set {
                    path: doc_path(doc_id)?,
                    data: document(record, payload)?,
                })
            }
            Mutation::Update { doc_id, payload } => Ok(WriteOp::Update {
                path: doc_path(doc_id)?,
                data: document(record, payload)?,
            }),
            Mutation::Delete { doc_id } => Ok(WriteOp::Delete {
                path: doc_path(doc_id)?,
            }),
        }
    }

    /// Split a snapshot into commit tasks, preserving log order. Records that
    /// cannot be addressed are skipped without affecting their neighbours.
    pub fn plan(&self, owner: &str, snapshot: LogSnapshot) -> Result<SyncPlan, SyncError> {
        validate_segment("owner", owner).map_err(|e| SyncError::InvalidPath(e.to_string()))?;
        let chunk_size = self.config.chunk_size;
        let mut skipped = snapshot.rejected;
        let mut chunks: Vec<ChunkTask> = Vec::new();

        for record in &snapshot.entries {
            let id = record.id.unwrap_or_default();
            let op = match self.write_op(owner, record) {
                Ok(op) => op,
                Err(e) => {
                    warn!(id, error = %e, "skipping mutation");
                    skipped.push(RejectedRecord {
                        id,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if chunks.last().is_none_or(|chunk| chunk.len() >= chunk_size) {
                chunks.push(ChunkTask::new(chunks.len(), id, chunk_size));
            }
            if let Some(chunk) = chunks.last_mut() {
                chunk.push(id, op)?;
            }
        }

        skipped.sort_by_key(|r| r.id);
        Ok(SyncPlan {
            owner: owner.to_string(),
            chunks,
            skipped,
            high_water: snapshot.high_water,
        })
    }

    /// What [`SyncEngine::flush`] would commit for `owner` right now. Without
    /// an owner the plan is empty, matching the no-op flush.
    pub fn preview(&self, owner: Option<&str>) -> Result<SyncPlan, SyncError> {
        let Some(owner) = effective_owner(owner) else {
            return Ok(SyncPlan::default());
        };
        let snapshot = self.log.snapshot()?;
        self.plan(owner, snapshot)
    }

    /// Drain the log into the remote store on behalf of `owner`.
    ///
    /// Without an owner this is a no-op. Otherwise the snapshot is committed
    /// chunk by chunk and retired from the log once every chunk is confirmed.
    /// On failure nothing is removed from the log and the error says which
    /// chunk failed and how many were committed before it.
    pub fn flush(&self, owner: Option<&str>) -> Result<FlushReport, SyncError> {
        let Some(owner) = effective_owner(owner) else {
            debug!("no owner for flush; nothing to do");
            return Ok(FlushReport::default());
        };

        let _guard = self.log.begin_flush()?;
        let snapshot = self.log.snapshot()?;
        if snapshot.is_empty() {
            return Ok(FlushReport::default());
        }

        let plan = self.plan(owner, snapshot)?;
        self.run(plan)
    }

    fn run(&self, plan: SyncPlan) -> Result<FlushReport, SyncError> {
        let chunk_count = plan.chunks.len();
        let mut applied = 0;

        for (committed_chunks, chunk) in plan.chunks.into_iter().enumerate() {
            let ChunkTask {
                index,
                first_id,
                last_id,
                batch,
            } = chunk;
            let ops = batch.len();
            if let Err(source) = self.remote.commit(batch) {
                error!(
                    chunk = index + 1,
                    chunk_count,
                    first_id,
                    last_id,
                    error = %source,
                    "chunk commit failed; mutation log left intact"
                );
                return Err(SyncError::CommitFailed {
                    chunk_index: index,
                    chunk_count,
                    committed_chunks,
                    first_id,
                    last_id,
                    source,
                });
            }
            applied += ops;
            info!(chunk = index + 1, chunk_count, ops, first_id, last_id, "chunk committed");
        }

        if let Some(high_water) = plan.high_water {
            self.log.clear_through(high_water)?;
        }
        info!(
            owner = %plan.owner,
            applied,
            skipped = plan.skipped.len(),
            "flush complete"
        );
        Ok(FlushReport {
            applied,
            chunks_committed: chunk_count,
            skipped: plan.skipped,
        })
    }
}

fn effective_owner(owner: Option<&str>) -> Option<&str> {
    owner.filter(|o| !o.is_empty())
}

fn document(record: &QueuedMutation, payload: &Value) -> Result<WireMap, SyncError> {
    normalize_document(payload).ok_or_else(|| {
        SyncError::InvalidMutation(format!(
            "{} record {:?} payload is a {}, not a map",
            record.action(),
            record.id,
            payload.kind()
        ))
    })
}
