//! Process-wide registry of mutation log handles and flush slots.
//!
//! Every producer in the process must append to the same ordered sequence, so
//! all callers asking for the same log file get the same [`MutationLog`], and
//! with it the same lazily-opened connection. Flush slots are keyed by the
//! canonical file path rather than by handle: at most one flush per log file
//! runs in the process, however many handles point at it.

use crate::core::error::SyncError;
use crate::sync::log::MutationLog;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

pub struct LogRegistry {
    entries: Mutex<FxHashMap<PathBuf, Arc<MutationLog>>>,
    flushing: Mutex<FxHashSet<PathBuf>>,
}

impl LogRegistry {
    fn new() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            flushing: Mutex::new(FxHashSet::default()),
        }
    }

    /// The shared handle for `db_path`, created on first request.
    pub fn shared(&self, db_path: &Path) -> Result<Arc<MutationLog>, SyncError> {
        let key = canonical_key(db_path)?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SyncError::LockPoisoned("log registry".to_string()))?;
        let log = entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(MutationLog::new(key)));
        Ok(Arc::clone(log))
    }

    /// Claim the flush slot for `db_path`. Fails with `FlushInProgress` while
    /// another guard for the same file is alive.
    pub fn claim_flush(&self, db_path: &Path) -> Result<FlushGuard<'_>, SyncError> {
        let key = canonical_key(db_path)?;
        let mut flushing = self
            .flushing
            .lock()
            .map_err(|_| SyncError::LockPoisoned("flush slots".to_string()))?;
        if !flushing.insert(key.clone()) {
            return Err(SyncError::FlushInProgress(key.display().to_string()));
        }
        Ok(FlushGuard {
            slots: &self.flushing,
            key,
        })
    }

    pub fn is_flushing(&self, db_path: &Path) -> bool {
        let Ok(key) = canonical_key(db_path) else {
            return false;
        };
        self.flushing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
    }
}

/// Releases a flush slot on drop.
pub struct FlushGuard<'a> {
    slots: &'a Mutex<FxHashSet<PathBuf>>,
    key: PathBuf,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Two spellings of the same file must map to one handle; the file itself may
/// not exist yet, so only its directory is canonicalized.
fn canonical_key(db_path: &Path) -> Result<PathBuf, SyncError> {
    let file_name = db_path
        .file_name()
        .ok_or_else(|| SyncError::InvalidPath(format!("{} has no file name", db_path.display())))?;
    let parent = match db_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    Ok(fs::canonicalize(&parent)?.join(file_name))
}

/// Global registry instance (same lifetime as the process).
pub fn global_registry() -> &'static LogRegistry {
    static REGISTRY: OnceLock<LogRegistry> = OnceLock::new();
    REGISTRY.get_or_init(LogRegistry::new)
}

pub fn shared_log(db_path: &Path) -> Result<Arc<MutationLog>, SyncError> {
    global_registry().shared(db_path)
}
