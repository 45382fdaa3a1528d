use keystone::db::{Database, IndexKind};
use keystone::hash::BUCKET_SIZE;
use keystone::Entry;
use tempfile::tempdir;

#[test]
fn test_insert_persist_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open(dir.path()).unwrap();
        let table = db.create_table(IndexKind::BTree, "t").unwrap();
        table.insert(1, 10).unwrap();
        table.insert(2, 20).unwrap();
        table.insert(3, 30).unwrap();
        db.close().unwrap();
    }

    let db = Database::open(dir.path()).unwrap();
    let table = db.get_table("t").unwrap();
    assert_eq!(table.find(2).unwrap().unwrap().value, 20);
    assert_eq!(
        table.select().unwrap(),
        vec![
            Entry { key: 1, value: 10 },
            Entry { key: 2, value: 20 },
            Entry { key: 3, value: 30 },
        ]
    );
}

#[test]
fn test_range_scan_across_splits() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    let table = db.create_table(IndexKind::BTree, "t").unwrap();
    let keystone::db::Table::BTree(tree) = &*table else {
        panic!("expected a b+tree");
    };

    for key in 1..=1000 {
        tree.insert(key, key * 3).unwrap();
    }

    let hits = tree.scan_range(250, 750).unwrap();
    assert_eq!(hits.len(), 500);
    for (i, entry) in hits.iter().enumerate() {
        assert_eq!(entry.key, 250 + i as i64);
        assert_eq!(entry.value, entry.key * 3);
    }
}

#[test]
fn test_hash_split_cascade() {
    let dir = tempdir().unwrap();
    let db = Database::open(dir.path()).unwrap();
    let table = db.create_table(IndexKind::Hash, "h").unwrap();
    let keystone::db::Table::Hash(index) = &*table else {
        panic!("expected a hash table");
    };

    let initial_depth = index.global_depth();
    let n = 8 * BUCKET_SIZE as i64;
    for key in 1..=n {
        table.insert(key, key * 10).unwrap();
    }

    assert!(index.global_depth() > initial_depth);
    for key in 1..=n {
        assert_eq!(table.find(key).unwrap().unwrap().value, key * 10);
    }
    assert_eq!(table.select().unwrap().len(), n as usize);
}
