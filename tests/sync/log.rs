use chrono::{TimeZone, Utc};
use offsync::core::error::SyncError;
use offsync::core::pool;
use offsync::sync::mutation::content_hash;
use offsync::sync::remote::MemoryStore;
use offsync::sync::{MutationLog, QueuedMutation, SyncEngine, Value};
use rusqlite::{Connection, params};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

fn customer(id: &str, name: &str) -> Value {
    Value::map([("id", Value::from(id)), ("name", Value::from(name))])
}

#[test]
fn records_survive_a_new_handle_in_original_order() {
    let tmp = tempdir().expect("tempdir");
    let when = Utc.with_ymd_and_hms(2024, 2, 29, 10, 30, 0).unwrap();
    let queued = vec![
        QueuedMutation::add("customers", customer("c1", "Ana")),
        QueuedMutation::update(
            "customers",
            "c1",
            Value::map([("last_visit", Value::Date(when)), ("note", Value::Absent)]),
        ),
        QueuedMutation::add("billing", Value::map([("amount", Value::from(120.5))])).for_user("u7"),
        QueuedMutation::delete("customers/c1/equipment", "e3"),
    ];

    let ids: Vec<i64> = {
        let log = MutationLog::in_dir(tmp.path());
        queued
            .iter()
            .cloned()
            .map(|m| log.enqueue(m).expect("enqueue"))
            .collect()
    };
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids must ascend: {ids:?}");

    let reopened = MutationLog::in_dir(tmp.path());
    let restored = reopened.list_all().expect("list after restart");
    assert_eq!(restored.len(), queued.len());
    for ((record, original), id) in restored.iter().zip(&queued).zip(&ids) {
        assert_eq!(record.id, Some(*id));
        assert_eq!(record.collection_path, original.collection_path);
        assert_eq!(record.target_user_id, original.target_user_id);
        assert_eq!(record.action(), original.action());
    }
    // payload-carried id became the add's identity; dates and absent markers round-trip
    assert_eq!(restored[0].doc_id(), Some("c1"));
    assert_eq!(restored[1].mutation, queued[1].mutation);
    assert!(restored[2].doc_id().is_some());
}

#[test]
fn ids_are_not_reused_after_clear() {
    let tmp = tempdir().expect("tempdir");
    let log = MutationLog::in_dir(tmp.path());
    let first = log
        .enqueue(QueuedMutation::delete("customers", "a"))
        .expect("enqueue");
    assert_eq!(log.clear().expect("clear"), 1);
    assert_eq!(log.pending_count().expect("count"), 0);

    let second = log
        .enqueue(QueuedMutation::delete("customers", "b"))
        .expect("enqueue");
    assert!(second > first);
}

#[test]
fn invalid_mutations_are_rejected_and_not_queued() {
    let tmp = tempdir().expect("tempdir");
    let log = MutationLog::in_dir(tmp.path());

    let cases = vec![
        QueuedMutation::update("customers", "", customer("c1", "Ana")),
        QueuedMutation::delete("customers/c1", "x"),
        QueuedMutation::add("customers", Value::from("not a map")),
        QueuedMutation::delete("customers", "c1").for_user("a/b"),
    ];
    for case in cases {
        let err = log.enqueue(case).expect_err("must be rejected");
        assert!(matches!(err, SyncError::InvalidMutation(_)), "{err}");
        assert!(!err.is_retryable());
    }
    assert_eq!(log.pending_count().expect("count"), 0);
}

#[test]
fn payloads_that_cannot_be_read_back_are_refused_at_enqueue() {
    let tmp = tempdir().expect("tempdir");
    let log = MutationLog::in_dir(tmp.path());

    for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let err = log
            .enqueue(QueuedMutation::add_with_id(
                "billing",
                "b1",
                Value::map([("ratio", Value::from(bad)), ("amount", Value::from(10))]),
            ))
            .expect_err("non-finite double must be rejected");
        assert!(matches!(err, SyncError::InvalidMutation(_)), "{err}");
    }
    let err = log
        .enqueue(QueuedMutation::update(
            "billing",
            "b1",
            Value::map([("history", Value::Array(vec![Value::from(1.0), Value::from(f64::NAN)]))]),
        ))
        .expect_err("nested non-finite double must be rejected");
    assert!(err.to_string().contains("history[1]"), "{err}");

    let snapshot = log.snapshot().expect("snapshot");
    assert!(snapshot.is_empty());
    assert_eq!(snapshot.high_water, None);
}

#[test]
fn unreadable_rows_are_reported_not_returned() {
    let tmp = tempdir().expect("tempdir");
    let log = MutationLog::in_dir(tmp.path());
    log.enqueue(QueuedMutation::delete("customers", "a"))
        .expect("enqueue");

    {
        let conn = Connection::open(log.path()).expect("open raw");
        // update without a doc_id, with a hash that matches its contents
        let payload = serde_json::to_string(&customer("c1", "Ana")).unwrap();
        let hash = content_hash("update", "customers", None, Some(&payload), None);
        conn.execute(
            "INSERT INTO mutations(action, collection_path, doc_id, payload, target_user_id, content_hash, queued_at)
             VALUES('update', 'customers', NULL, ?1, NULL, ?2, '2024-01-01T00:00:00Z')",
            params![payload, hash],
        )
        .expect("insert raw row");
        // tampered row
        conn.execute(
            "INSERT INTO mutations(action, collection_path, doc_id, payload, target_user_id, content_hash, queued_at)
             VALUES('delete', 'customers', 'z', NULL, NULL, 'bogus', '2024-01-01T00:00:00Z')",
            [],
        )
        .expect("insert tampered row");
    }

    log.enqueue(QueuedMutation::delete("customers", "b"))
        .expect("enqueue");

    let snapshot = log.snapshot().expect("snapshot");
    let doc_ids: Vec<&str> = snapshot.entries.iter().filter_map(|r| r.doc_id()).collect();
    assert_eq!(doc_ids, vec!["a", "b"]);
    assert_eq!(snapshot.rejected.len(), 2);
    assert_eq!(snapshot.rejected[0].id, 2);
    assert!(snapshot.rejected[0].reason.contains("doc_id"));
    assert!(snapshot.rejected[1].reason.contains("hash"));
    assert_eq!(snapshot.high_water, Some(4));
    assert_eq!(log.list_all().expect("list").len(), 2);
}

#[test]
fn snapshots_taken_during_concurrent_enqueues_stay_ordered() {
    let tmp = tempdir().expect("tempdir");
    let log = Arc::new(MutationLog::in_dir(tmp.path()));
    let writers = 4;
    let per_writer = 25;
    let barrier = Arc::new(Barrier::new(writers + 1));

    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let log = Arc::clone(&log);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_writer {
                    log.enqueue(QueuedMutation::delete("customers", format!("w{w}-{i}")))
                        .expect("enqueue");
                }
            })
        })
        .collect();

    barrier.wait();
    for _ in 0..10 {
        let snapshot = log.list_all().expect("list");
        let ids: Vec<i64> = snapshot.iter().map(|r| r.id.unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "out of order: {ids:?}");
    }
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let all = log.list_all().expect("list");
    assert_eq!(all.len(), writers * per_writer);
    let unique: HashSet<i64> = all.iter().map(|r| r.id.unwrap()).collect();
    assert_eq!(unique.len(), all.len());
}

#[test]
fn concurrent_first_use_converges_on_one_store() {
    let tmp = tempdir().expect("tempdir");
    let log = Arc::new(MutationLog::in_dir(tmp.path()));
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let log = Arc::clone(&log);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                log.enqueue(QueuedMutation::delete("customers", format!("c{i}")))
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread").expect("enqueue");
    }
    assert_eq!(log.pending_count().expect("count"), threads);
}

#[test]
fn registry_hands_out_one_handle_per_file() {
    let tmp = tempdir().expect("tempdir");
    let direct = tmp.path().join("mutations.db");
    let dotted = tmp.path().join(".").join("mutations.db");

    let a = pool::shared_log(&direct).expect("shared");
    let b = pool::shared_log(&dotted).expect("shared");
    assert!(Arc::ptr_eq(&a, &b));

    a.enqueue(QueuedMutation::delete("customers", "c1"))
        .expect("enqueue");
    assert_eq!(b.pending_count().expect("count"), 1);

    let other = pool::shared_log(&tmp.path().join("other.db")).expect("shared");
    assert!(!Arc::ptr_eq(&a, &other));
}

#[test]
fn flush_slot_is_shared_by_every_handle_on_a_file() {
    let tmp = tempdir().expect("tempdir");
    let first = MutationLog::in_dir(tmp.path());
    let second = MutationLog::new(tmp.path().join(".").join("mutations.db"));
    second
        .enqueue(QueuedMutation::delete("customers", "c1"))
        .expect("enqueue");

    {
        let _guard = first.begin_flush().expect("first claim");
        assert!(second.is_flushing());
        let err = second.begin_flush().err().expect("slot is taken");
        assert!(matches!(err, SyncError::FlushInProgress(_)), "{err}");

        let remote = MemoryStore::new();
        let err = SyncEngine::new(&second, &remote)
            .flush(Some("u1"))
            .expect_err("concurrent flush through another handle");
        assert!(matches!(err, SyncError::FlushInProgress(_)), "{err}");
        assert_eq!(remote.commit_attempts(), 0);
    }

    assert!(!first.is_flushing());
    assert!(!second.is_flushing());
    assert!(second.begin_flush().is_ok());

    let other = tempdir().expect("tempdir");
    let _held = first.begin_flush().expect("claim");
    assert!(MutationLog::in_dir(other.path()).begin_flush().is_ok());
}
