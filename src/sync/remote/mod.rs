//! Remote document store contract.
//!
//! A store accepts [`WriteBatch`]es of set / merge-update / delete operations and
//! applies each batch atomically. Batches are moved into [`RemoteStore::commit`],
//! so a batch belongs to exactly one commit attempt.

pub mod memory;
pub mod sqlite;

pub use memory::{InjectedFailure, MemoryStore};
pub use sqlite::SqliteStore;

use crate::core::error::RemoteError;
use crate::sync::mutation::{validate_collection_path, validate_segment};
use crate::sync::value::WireMap;
use serde::Serialize;
use std::fmt;

/// Hard ceiling on operations per atomic batch.
pub const MAX_BATCH_OPERATIONS: usize = 500;

/// Fully-qualified document location: `<collection path>/<doc id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DocumentPath {
    collection: String,
    doc_id: String,
}

impl DocumentPath {
    pub fn new(
        collection: impl Into<String>,
        doc_id: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        let collection = collection.into();
        let doc_id = doc_id.into();
        validate_collection_path(&collection)
            .and_then(|_| validate_segment("doc_id", &doc_id))
            .map_err(|e| RemoteError::InvalidPath(e.to_string()))?;
        Ok(Self { collection, doc_id })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.doc_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or fully replace the document.
    Set { path: DocumentPath, data: WireMap },
    /// Overwrite the given top-level fields, creating the document when it
    /// does not exist.
    Update { path: DocumentPath, data: WireMap },
    Delete { path: DocumentPath },
}

impl WriteOp {
    pub fn path(&self) -> &DocumentPath {
        match self {
            WriteOp::Set { path, .. } | WriteOp::Update { path, .. } | WriteOp::Delete { path } => {
                path
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::Set { .. } => "set",
            WriteOp::Update { .. } => "update",
            WriteOp::Delete { .. } => "delete",
        }
    }
}

/// An ordered group of writes that commit together or not at all.
#[derive(Debug)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
    limit: usize,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::with_limit(MAX_BATCH_OPERATIONS)
    }

    /// A batch holding at most `limit` operations (never more than the store ceiling).
    pub fn with_limit(limit: usize) -> Self {
        let limit = limit.min(MAX_BATCH_OPERATIONS);
        Self {
            ops: Vec::with_capacity(limit),
            limit,
        }
    }

    pub fn push(&mut self, op: WriteOp) -> Result<(), RemoteError> {
        if self.ops.len() >= self.limit {
            return Err(RemoteError::BatchTooLarge { limit: self.limit });
        }
        self.ops.push(op);
        Ok(())
    }

    pub fn set(&mut self, path: DocumentPath, data: WireMap) -> Result<(), RemoteError> {
        self.push(WriteOp::Set { path, data })
    }

    pub fn update(&mut self, path: DocumentPath, data: WireMap) -> Result<(), RemoteError> {
        self.push(WriteOp::Update { path, data })
    }

    pub fn delete(&mut self, path: DocumentPath) -> Result<(), RemoteError> {
        self.push(WriteOp::Delete { path })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

pub trait RemoteStore {
    /// Apply every operation in `batch` atomically, in order.
    fn commit(&self, batch: WriteBatch) -> Result<(), RemoteError>;
}

impl<S: RemoteStore + ?Sized> RemoteStore for &S {
    fn commit(&self, batch: WriteBatch) -> Result<(), RemoteError> {
        (**self).commit(batch)
    }
}

/// Next state of a document after `op`, given its current state.
/// `None` means the document does not exist.
///
/// Every operation applies to any current state, so replaying a prefix of
/// the log that already committed always succeeds and converges on the same
/// documents.
pub fn apply_write(current: Option<WireMap>, op: &WriteOp) -> Option<WireMap> {
    match op {
        WriteOp::Set { data, .. } => Some(data.clone()),
        WriteOp::Update { data, .. } => {
            let mut doc = current.unwrap_or_default();
            doc.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
            Some(doc)
        }
        WriteOp::Delete { .. } => None,
    }
}
