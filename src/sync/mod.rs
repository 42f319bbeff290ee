//! Offline mutation queue and sync reconciliation.
//!
//! - [`value`] / [`normalize`]: payload trees and their wire-safe form.
//! - [`mutation`]: the queued record and its validation.
//! - [`log`]: the durable, ordered queue.
//! - [`remote`]: the document-store contract plus in-memory and SQLite backends.
//! - [`engine`]: chunked, ordered, all-or-retry flushing.

pub mod engine;
pub mod log;
pub mod mutation;
pub mod normalize;
pub mod remote;
pub mod value;

pub use engine::{ChunkTask, FlushReport, SyncEngine, SyncPlan};
pub use log::{LogSnapshot, MutationLog, RejectedRecord};
pub use mutation::{Action, Mutation, QueuedMutation};
pub use remote::{DocumentPath, RemoteStore, WriteBatch, WriteOp};
pub use value::{Timestamp, Value, WireMap, WireValue};
