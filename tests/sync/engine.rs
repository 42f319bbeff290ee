use chrono::{TimeZone, Utc};
use offsync::core::config::SyncConfig;
use offsync::core::error::{RemoteError, SyncError};
use offsync::sync::remote::{InjectedFailure, MemoryStore, SqliteStore};
use offsync::sync::{
    DocumentPath, MutationLog, QueuedMutation, RemoteStore, SyncEngine, Timestamp, Value,
    WireValue, WriteBatch,
};
use rusqlite::Connection;
use std::sync::Mutex;
use tempfile::{TempDir, tempdir};

fn fresh_log() -> (TempDir, MutationLog) {
    let tmp = tempdir().expect("tempdir");
    let log = MutationLog::in_dir(tmp.path());
    (tmp, log)
}

fn enqueue_customers(log: &MutationLog, count: usize) {
    for i in 0..count {
        log.enqueue(QueuedMutation::add(
            "customers",
            Value::map([
                ("id", Value::from(format!("c{i:04}"))),
                ("seq", Value::from(i as i64)),
            ]),
        ))
        .expect("enqueue");
    }
}

fn small_chunks(chunk_size: usize) -> SyncConfig {
    SyncConfig {
        chunk_size,
        ..SyncConfig::default()
    }
}

fn doc(collection: &str, id: &str) -> DocumentPath {
    DocumentPath::new(collection, id).expect("document path")
}

#[test]
fn chunks_are_bounded_at_490() {
    let (_tmp, log) = fresh_log();
    let remote = MemoryStore::new();
    enqueue_customers(&log, 1000);

    let report = SyncEngine::new(&log, &remote)
        .flush(Some("u1"))
        .expect("flush");

    assert_eq!(remote.commit_sizes(), vec![490, 490, 20]);
    assert_eq!(report.applied, 1000);
    assert_eq!(report.chunks_committed, 3);
    assert!(report.skipped.is_empty());
    assert_eq!(remote.documents_in("users/u1/customers").len(), 1000);
    assert_eq!(log.pending_count().expect("count"), 0);
}

#[test]
fn one_record_past_a_full_chunk_opens_a_second_batch() {
    let (_tmp, log) = fresh_log();
    let remote = MemoryStore::new();
    enqueue_customers(&log, 491);

    SyncEngine::new(&log, &remote)
        .flush(Some("u1"))
        .expect("flush");
    assert_eq!(remote.commit_sizes(), vec![490, 1]);
}

#[test]
fn failed_chunk_keeps_the_whole_log() {
    let (_tmp, log) = fresh_log();
    let remote = MemoryStore::new();
    enqueue_customers(&log, 1000);
    let before = log.list_all().expect("list");
    remote.fail_attempt(1, InjectedFailure::BeforeApply);

    let err = SyncEngine::new(&log, &remote)
        .flush(Some("u1"))
        .expect_err("second chunk must fail");
    match &err {
        SyncError::CommitFailed {
            chunk_index,
            chunk_count,
            committed_chunks,
            first_id,
            last_id,
            source,
        } => {
            assert_eq!(*chunk_index, 1);
            assert_eq!(*chunk_count, 3);
            assert_eq!(*committed_chunks, 1);
            assert_eq!((*first_id, *last_id), (491, 980));
            assert!(matches!(source, RemoteError::Unavailable(_)));
        }
        other => panic!("expected CommitFailed, got {other:?}"),
    }
    assert!(err.is_retryable());
    assert!(err.to_string().contains("chunk 2 of 3"), "{err}");

    // the first chunk is visible remotely, but nothing left the log
    assert_eq!(remote.document_count(), 490);
    assert_eq!(log.list_all().expect("list"), before);
    assert!(!log.is_flushing());
}

#[test]
fn replaying_after_a_partial_flush_creates_no_duplicates() {
    for failure in [InjectedFailure::BeforeApply, InjectedFailure::AfterApply] {
        let (_tmp, log) = fresh_log();
        let remote = MemoryStore::new();
        let engine = SyncEngine::with_config(&log, &remote, small_chunks(1)).expect("engine");

        log.enqueue(QueuedMutation::add(
            "customers",
            Value::map([("id", Value::from("c1")), ("name", Value::from("Ana"))]),
        ))
        .expect("enqueue");
        // no id anywhere: identity is minted when queued
        log.enqueue(QueuedMutation::add(
            "customers",
            Value::map([("name", Value::from("Bia"))]),
        ))
        .expect("enqueue");
        log.enqueue(QueuedMutation::update(
            "customers",
            "c1",
            Value::map([("vip", Value::from(true))]),
        ))
        .expect("enqueue");

        remote.fail_attempt(1, failure);
        assert!(engine.flush(Some("u1")).is_err());
        assert_eq!(log.pending_count().expect("count"), 3);

        let report = engine.flush(Some("u1")).expect("retry");
        assert_eq!(report.applied, 3);
        assert_eq!(log.pending_count().expect("count"), 0);

        let docs = remote.documents_in("users/u1/customers");
        assert_eq!(docs.len(), 2, "{failure:?} left {docs:?}");
        let c1 = remote
            .get(&doc("users/u1/customers", "c1"))
            .expect("c1 present");
        assert_eq!(c1.get("name"), Some(&WireValue::String("Ana".into())));
        assert_eq!(c1.get("vip"), Some(&WireValue::Bool(true)));
    }
}

#[test]
fn writes_to_one_document_apply_in_queue_order_across_chunks() {
    let (_tmp, log) = fresh_log();
    let remote = MemoryStore::new();
    let engine = SyncEngine::with_config(&log, &remote, small_chunks(2)).expect("engine");

    log.enqueue(QueuedMutation::add_with_id(
        "customers",
        "c1",
        Value::map([("name", Value::from("Ana"))]),
    ))
    .expect("enqueue");
    log.enqueue(QueuedMutation::update(
        "customers",
        "c1",
        Value::map([("name", Value::from("Ana Maria"))]),
    ))
    .expect("enqueue");
    log.enqueue(QueuedMutation::delete("customers", "c1"))
        .expect("enqueue");
    log.enqueue(QueuedMutation::delete("customers", "c2"))
        .expect("enqueue");
    log.enqueue(QueuedMutation::add_with_id(
        "customers",
        "c2",
        Value::map([("name", Value::from("Caio"))]),
    ))
    .expect("enqueue");

    engine.flush(Some("u1")).expect("flush");
    assert_eq!(remote.commit_sizes(), vec![2, 2, 1]);
    assert!(remote.get(&doc("users/u1/customers", "c1")).is_none());
    let c2 = remote
        .get(&doc("users/u1/customers", "c2"))
        .expect("c2 re-created after its delete");
    assert_eq!(c2.get("name"), Some(&WireValue::String("Caio".into())));
}

#[test]
fn empty_log_makes_no_remote_calls() {
    let (_tmp, log) = fresh_log();
    let remote = MemoryStore::new();

    let report = SyncEngine::new(&log, &remote)
        .flush(Some("u1"))
        .expect("flush");
    assert_eq!(report.applied, 0);
    assert_eq!(report.chunks_committed, 0);
    assert_eq!(remote.commit_attempts(), 0);
}

#[test]
fn missing_owner_is_a_no_op() {
    let (_tmp, log) = fresh_log();
    let remote = MemoryStore::new();
    enqueue_customers(&log, 3);
    let engine = SyncEngine::new(&log, &remote);

    for owner in [None, Some("")] {
        let report = engine.flush(owner).expect("flush");
        assert_eq!(report.applied, 0);
    }
    assert_eq!(remote.commit_attempts(), 0);
    assert_eq!(log.pending_count().expect("count"), 3);
}

#[test]
fn target_user_overrides_the_flushing_owner() {
    let (_tmp, log) = fresh_log();
    let remote = MemoryStore::new();
    log.enqueue(QueuedMutation::add_with_id("billing", "b1", Value::map([("amount", Value::from(40))])))
        .expect("enqueue");
    log.enqueue(
        QueuedMutation::add_with_id("billing", "b2", Value::map([("amount", Value::from(75))]))
            .for_user("u9"),
    )
    .expect("enqueue");

    SyncEngine::new(&log, &remote)
        .flush(Some("u1"))
        .expect("flush");
    assert!(remote.get(&doc("users/u1/billing", "b1")).is_some());
    assert!(remote.get(&doc("users/u9/billing", "b2")).is_some());
    assert!(remote.get(&doc("users/u1/billing", "b2")).is_none());
}

#[test]
fn payloads_reach_the_store_normalized() {
    let (_tmp, log) = fresh_log();
    let remote = MemoryStore::new();
    let when = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
    log.enqueue(QueuedMutation::add_with_id(
        "customers",
        "c1",
        Value::map([
            ("since", Value::Date(when)),
            ("nickname", Value::Absent),
            (
                "visits",
                Value::Array(vec![Value::Date(when), Value::Absent]),
            ),
            ("address", Value::map([("zip", Value::Absent), ("city", Value::from("Porto"))])),
        ]),
    ))
    .expect("enqueue");

    SyncEngine::new(&log, &remote)
        .flush(Some("u1"))
        .expect("flush");
    let stored = remote
        .get(&doc("users/u1/customers", "c1"))
        .expect("document");

    let stamp = WireValue::Timestamp(Timestamp::from_datetime(&when));
    assert_eq!(stored.get("since"), Some(&stamp));
    assert!(!stored.contains_key("nickname"));
    assert_eq!(
        stored.get("visits"),
        Some(&WireValue::Array(vec![stamp.clone(), WireValue::Null]))
    );
    match stored.get("address") {
        Some(WireValue::Map(address)) => {
            assert!(!address.contains_key("zip"));
            assert_eq!(address.get("city"), Some(&WireValue::String("Porto".into())));
        }
        other => panic!("expected nested map, got {other:?}"),
    }
}

/// Flushes the same log from inside its own commit.
struct ReentrantStore<'a> {
    log: &'a MutationLog,
    inner: MemoryStore,
    nested: Mutex<Option<SyncError>>,
}

impl RemoteStore for ReentrantStore<'_> {
    fn commit(&self, batch: WriteBatch) -> Result<(), RemoteError> {
        let nested = SyncEngine::new(self.log, &self.inner).flush(Some("u1"));
        if let Err(e) = nested {
            *self.nested.lock().unwrap() = Some(e);
        }
        self.inner.commit(batch)
    }
}

#[test]
fn only_one_flush_runs_at_a_time() {
    let (_tmp, log) = fresh_log();
    enqueue_customers(&log, 2);
    let remote = ReentrantStore {
        log: &log,
        inner: MemoryStore::new(),
        nested: Mutex::new(None),
    };

    let report = SyncEngine::new(&log, &remote)
        .flush(Some("u1"))
        .expect("outer flush");
    assert_eq!(report.applied, 2);
    let nested = remote.nested.lock().unwrap().take();
    assert!(
        matches!(nested, Some(SyncError::FlushInProgress(_))),
        "{nested:?}"
    );
    assert_eq!(remote.inner.commit_attempts(), 1);
    assert!(!log.is_flushing());
}

/// Queues a new mutation while a chunk is being committed.
struct EnqueueingStore<'a> {
    log: &'a MutationLog,
    inner: MemoryStore,
}

impl RemoteStore for EnqueueingStore<'_> {
    fn commit(&self, batch: WriteBatch) -> Result<(), RemoteError> {
        self.log
            .enqueue(QueuedMutation::delete("customers", "late"))
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        self.inner.commit(batch)
    }
}

#[test]
fn records_queued_during_a_flush_survive_it() {
    let (_tmp, log) = fresh_log();
    enqueue_customers(&log, 3);
    let remote = EnqueueingStore {
        log: &log,
        inner: MemoryStore::new(),
    };

    let report = SyncEngine::new(&log, &remote)
        .flush(Some("u1"))
        .expect("flush");
    assert_eq!(report.applied, 3);

    let remaining = log.list_all().expect("list");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].doc_id(), Some("late"));
}

#[test]
fn unreadable_rows_are_skipped_and_retired() {
    let (_tmp, log) = fresh_log();
    let remote = MemoryStore::new();
    enqueue_customers(&log, 1);
    {
        let conn = Connection::open(log.path()).expect("open raw");
        conn.execute(
            "INSERT INTO mutations(action, collection_path, doc_id, payload, target_user_id, content_hash, queued_at)
             VALUES('delete', 'customers', 'c0000', NULL, NULL, 'tampered', '2024-01-01T00:00:00Z')",
            [],
        )
        .expect("insert tampered row");
    }
    enqueue_customers(&log, 2);

    let report = SyncEngine::new(&log, &remote)
        .flush(Some("u1"))
        .expect("flush");
    assert_eq!(report.applied, 3);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].id, 2);
    // the tampered delete never reached the store
    assert!(remote.get(&doc("users/u1/customers", "c0000")).is_some());
    assert_eq!(log.pending_count().expect("count"), 0);
}

#[test]
fn flush_into_a_sqlite_replica_persists() {
    let (tmp, log) = fresh_log();
    log.enqueue(QueuedMutation::add_with_id(
        "customers",
        "c1",
        Value::map([("name", Value::from("Ana")), ("credit", Value::from(12.5))]),
    ))
    .expect("enqueue");
    log.enqueue(QueuedMutation::update(
        "customers",
        "c1",
        Value::map([("name", Value::from("Ana Maria"))]),
    ))
    .expect("enqueue");

    {
        let replica = SqliteStore::in_dir(tmp.path()).expect("replica");
        let report = SyncEngine::new(&log, &replica)
            .flush(Some("u1"))
            .expect("flush");
        assert_eq!(report.applied, 2);
    }

    let replica = SqliteStore::in_dir(tmp.path()).expect("reopen replica");
    let docs = replica
        .documents_in("users/u1/customers")
        .expect("documents");
    assert_eq!(docs.len(), 1);
    let (id, data) = &docs[0];
    assert_eq!(id, "c1");
    assert_eq!(data.get("name"), Some(&WireValue::String("Ana Maria".into())));
    assert_eq!(data.get("credit"), Some(&WireValue::Double(12.5)));
    assert_eq!(replica.commit_sizes().expect("commits"), vec![2]);
}

#[test]
fn replay_over_an_already_deleted_document_drains_the_log() {
    let (_tmp, log) = fresh_log();
    let remote = MemoryStore::new();
    let mut seed = WriteBatch::new();
    seed.set(
        doc("users/u1/customers", "c1"),
        [("name".to_string(), WireValue::String("Ana".into()))].into(),
    )
    .expect("seed batch");
    remote.commit(seed).expect("seed commit");

    let engine = SyncEngine::with_config(&log, &remote, small_chunks(2)).expect("engine");
    log.enqueue(QueuedMutation::update(
        "customers",
        "c1",
        Value::map([("vip", Value::from(true))]),
    ))
    .expect("enqueue");
    log.enqueue(QueuedMutation::delete("customers", "c1"))
        .expect("enqueue");
    log.enqueue(QueuedMutation::delete("customers", "x"))
        .expect("enqueue");

    // first chunk commits (c1 is gone), second chunk fails
    remote.fail_attempt(2, InjectedFailure::BeforeApply);
    let err = engine.flush(Some("u1")).expect_err("second chunk must fail");
    assert!(matches!(
        err,
        SyncError::CommitFailed {
            chunk_index: 1,
            committed_chunks: 1,
            ..
        }
    ));
    assert_eq!(log.pending_count().expect("count"), 3);

    // the replayed update lands on a deleted document and must not block the log
    let report = engine.flush(Some("u1")).expect("retry drains the log");
    assert_eq!(report.applied, 3);
    assert_eq!(log.pending_count().expect("count"), 0);
    assert!(remote.get(&doc("users/u1/customers", "c1")).is_none());
}

#[test]
fn update_of_a_missing_document_creates_it() {
    let (_tmp, log) = fresh_log();
    let remote = MemoryStore::new();
    log.enqueue(QueuedMutation::update(
        "customers",
        "c7",
        Value::map([("name", Value::from("Duda"))]),
    ))
    .expect("enqueue");

    let report = SyncEngine::new(&log, &remote)
        .flush(Some("u1"))
        .expect("flush");
    assert_eq!(report.applied, 1);
    let c7 = remote
        .get(&doc("users/u1/customers", "c7"))
        .expect("created by the update");
    assert_eq!(c7.get("name"), Some(&WireValue::String("Duda".into())));
}
