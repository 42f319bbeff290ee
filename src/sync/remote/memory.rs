//! In-process document store.
//!
//! A batch is applied while holding the store lock, so readers see all of it
//! or none of it. Commit attempts can be told to fail, which is how tests
//! exercise the engine's failure handling.

use crate::core::error::RemoteError;
use crate::sync::remote::{DocumentPath, RemoteStore, WriteBatch, apply_write};
use crate::sync::value::WireMap;
use rustc_hash::FxHashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Reject the batch without applying anything.
    BeforeApply,
    /// Apply the batch, then report an error as if the response was lost.
    AfterApply,
}

#[derive(Default)]
struct MemoryState {
    documents: FxHashMap<DocumentPath, WireMap>,
    commit_sizes: Vec<usize>,
    attempts: usize,
    failures: FxHashMap<usize, InjectedFailure>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make commit attempt number `attempt` (0-based, counted over the
    /// store's lifetime) fail.
    pub fn fail_attempt(&self, attempt: usize, failure: InjectedFailure) {
        self.state().failures.insert(attempt, failure);
    }

    pub fn get(&self, path: &DocumentPath) -> Option<WireMap> {
        self.state().documents.get(path).cloned()
    }

    /// Documents in `collection`, ordered by document id.
    pub fn documents_in(&self, collection: &str) -> Vec<(String, WireMap)> {
        let state = self.state();
        let mut docs: Vec<(String, WireMap)> = state
            .documents
            .iter()
            .filter(|(path, _)| path.collection() == collection)
            .map(|(path, data)| (path.doc_id().to_string(), data.clone()))
            .collect();
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        docs
    }

    pub fn document_count(&self) -> usize {
        self.state().documents.len()
    }

    /// Operation counts of every batch that was applied.
    pub fn commit_sizes(&self) -> Vec<usize> {
        self.state().commit_sizes.clone()
    }

    /// Number of `commit` calls, successful or not.
    pub fn commit_attempts(&self) -> usize {
        self.state().attempts
    }
}

impl RemoteStore for MemoryStore {
    fn commit(&self, batch: WriteBatch) -> Result<(), RemoteError> {
        let mut state = self.state.lock().map_err(|_| RemoteError::LockPoisoned)?;
        let attempt = state.attempts;
        state.attempts += 1;
        let failure = state.failures.remove(&attempt);

        if failure == Some(InjectedFailure::BeforeApply) {
            return Err(RemoteError::Unavailable(format!(
                "commit attempt {} rejected",
                attempt
            )));
        }

        for op in batch.ops() {
            let path = op.path().clone();
            let current = state.documents.remove(&path);
            if let Some(next) = apply_write(current, op) {
                state.documents.insert(path, next);
            }
        }
        state.commit_sizes.push(batch.len());

        if failure == Some(InjectedFailure::AfterApply) {
            return Err(RemoteError::Unavailable(format!(
                "commit attempt {} applied but the response was lost",
                attempt
            )));
        }
        Ok(())
    }
}
