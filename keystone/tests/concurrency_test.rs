mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use keystone::db::IndexKind;
use keystone::KeystoneError;
use tempfile::tempdir;
use uuid::Uuid;

/// Two transactions lock crossed keys for write; exactly one is chosen as
/// the deadlock victim, rolls back, and the survivor's values win.
#[test]
fn test_deadlock_aborts_exactly_one_writer() {
    let dir = tempdir().unwrap();
    let engine = common::boot(&dir.path().join("data"));
    engine.rm.handle_create_table(IndexKind::BTree, "t").unwrap();
    engine.committed(|rm, client| {
        rm.handle_insert(client, "t", 1, 0)?;
        rm.handle_insert(client, "t", 2, 0)
    });

    let barrier = Arc::new(Barrier::new(2));
    let engine = Arc::new(engine);

    let contender = |first: i64, second: i64, value: i64| {
        let engine = engine.clone();
        let barrier = barrier.clone();
        thread::spawn(move || -> Result<(), KeystoneError> {
            let client = Uuid::new_v4();
            engine.tm.begin(client).unwrap();
            engine.rm.log_start(client).unwrap();
            engine.rm.handle_update(client, "t", first, value).unwrap();
            barrier.wait();
            match engine.rm.handle_update(client, "t", second, value) {
                Ok(()) => {
                    engine.rm.log_commit(client).unwrap();
                    engine.tm.commit(client).unwrap();
                    Ok(())
                }
                Err(e) => {
                    engine.rm.rollback(client).unwrap();
                    Err(e)
                }
            }
        })
    };

    let a = contender(1, 2, 111);
    let b = contender(2, 1, 222);
    let results = [a.join().unwrap(), b.join().unwrap()];

    let aborted: Vec<_> = results.iter().filter(|r| r.is_err()).collect();
    assert_eq!(aborted.len(), 1, "exactly one writer must abort");
    assert!(matches!(aborted[0], Err(KeystoneError::Deadlock)));

    // Both keys carry the surviving writer's value.
    let winner = if results[0].is_ok() { 111 } else { 222 };
    let table = engine.db.get_table("t").unwrap();
    assert_eq!(table.find(1).unwrap().unwrap().value, winner);
    assert_eq!(table.find(2).unwrap().unwrap().value, winner);
}

/// A reader blocked behind an uncommitted writer never observes the
/// intermediate value.
#[test]
fn test_reader_waits_out_uncommitted_writer() {
    let dir = tempdir().unwrap();
    let engine = common::boot(&dir.path().join("data"));
    engine.rm.handle_create_table(IndexKind::BTree, "t").unwrap();
    engine.committed(|rm, client| rm.handle_insert(client, "t", 1, 10));

    let writer = Uuid::new_v4();
    engine.tm.begin(writer).unwrap();
    engine.rm.log_start(writer).unwrap();
    engine.rm.handle_update(writer, "t", 1, 99).unwrap();

    let engine = Arc::new(engine);
    let reader_engine = engine.clone();
    let reader = thread::spawn(move || {
        let client = Uuid::new_v4();
        reader_engine.tm.begin(client).unwrap();
        reader_engine.rm.log_start(client).unwrap();
        let entry = reader_engine.rm.handle_find(client, "t", 1).unwrap();
        reader_engine.rm.log_commit(client).unwrap();
        reader_engine.tm.commit(client).unwrap();
        entry.value
    });

    // The reader is parked on the writer's lock; committing releases it.
    thread::sleep(Duration::from_millis(100));
    engine.rm.log_commit(writer).unwrap();
    engine.tm.commit(writer).unwrap();

    assert_eq!(reader.join().unwrap(), 99);
}

/// Rolling back leaves no trace of the aborted transaction.
#[test]
fn test_rollback_is_atomic() {
    let dir = tempdir().unwrap();
    let engine = common::boot(&dir.path().join("data"));
    engine.rm.handle_create_table(IndexKind::Hash, "h").unwrap();
    engine.committed(|rm, client| rm.handle_insert(client, "h", 1, 10));

    let client = Uuid::new_v4();
    engine.tm.begin(client).unwrap();
    engine.rm.log_start(client).unwrap();
    engine.rm.handle_update(client, "h", 1, 11).unwrap();
    engine.rm.handle_insert(client, "h", 2, 20).unwrap();
    engine.rm.handle_delete(client, "h", 1).unwrap();
    engine.rm.rollback(client).unwrap();

    let table = engine.db.get_table("h").unwrap();
    assert_eq!(table.find(1).unwrap().unwrap().value, 10);
    assert!(table.find(2).unwrap().is_none());
}
