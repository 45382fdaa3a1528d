//! The grace hash join operator.
//!
//! Both inputs are partitioned into temporary hash indexes rekeyed by the
//! chosen join side, the directories are doubled until their global depths
//! match, and each aligned pair of bucket pages is probed on its own
//! thread. Probes screen with a bloom filter, confirm quadratically, and
//! stream matches through a bounded channel; the first failing probe
//! cancels the rest.

mod bloom;

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::thread;

use uuid::Uuid;

pub use bloom::{BloomFilter, DEFAULT_FILTER_SIZE};

use crate::db::Table;
use crate::error::Result;
use crate::hash::HashIndex;
use crate::Entry;

const RESULT_CHANNEL_CAPACITY: usize = 1024;

/// One joined row: the left and right entries, each oriented so its key is
/// the join value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPair {
    pub left: Entry,
    pub right: Entry,
}

/// A scratch hash index whose files are removed on drop.
struct TempIndex {
    index: HashIndex,
    data_path: PathBuf,
    meta_path: PathBuf,
}

impl Drop for TempIndex {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.data_path);
        let _ = fs::remove_file(&self.meta_path);
    }
}

/// Re-partition every entry of `source` into a fresh hash index, keyed by
/// the entry's key or value. Duplicate join values are expected and kept.
fn build_hash_index(source: &Table, use_key: bool) -> Result<TempIndex> {
    let data_path = std::env::temp_dir().join(format!("keystone-join-{}", Uuid::new_v4()));
    let meta_path = data_path.with_extension("meta");
    let index = HashIndex::create("join-scratch", &data_path, &meta_path)?;
    let temp = TempIndex {
        index,
        data_path,
        meta_path,
    };
    for entry in source.select()? {
        if use_key {
            temp.index.insert(entry.key, entry.value)?;
        } else {
            temp.index.insert(entry.value, entry.key)?;
        }
    }
    Ok(temp)
}

fn orient(entry: Entry, on_key: bool) -> Entry {
    if on_key {
        entry
    } else {
        Entry {
            key: entry.value,
            value: entry.key,
        }
    }
}

/// Send one match unless the join has been cancelled. Returns `false` when
/// the probe should stop emitting.
fn send_result(cancelled: &AtomicBool, results: &SyncSender<EntryPair>, pair: EntryPair) -> bool {
    if cancelled.load(Ordering::SeqCst) {
        return false;
    }
    results.send(pair).is_ok()
}

/// Probe one aligned bucket pair: bloom-screen each left entry against the
/// right bucket, then confirm matches pairwise.
fn probe_buckets(
    cancelled: &AtomicBool,
    results: &SyncSender<EntryPair>,
    left: &[Entry],
    right: &[Entry],
    join_on_left_key: bool,
    join_on_right_key: bool,
) {
    let mut filter = BloomFilter::new(DEFAULT_FILTER_SIZE);
    for entry in right {
        filter.insert(if join_on_right_key {
            entry.key
        } else {
            entry.value
        });
    }
    for l in left {
        let left_join = if join_on_left_key { l.key } else { l.value };
        if !filter.contains(left_join) {
            continue;
        }
        for r in right {
            let right_join = if join_on_right_key { r.key } else { r.value };
            if left_join == right_join {
                let pair = EntryPair {
                    left: orient(*l, join_on_left_key),
                    right: orient(*r, join_on_right_key),
                };
                if !send_result(cancelled, results, pair) {
                    return;
                }
            }
        }
    }
}

/// Join `left` against `right` with a grace hash join. The key or value of
/// each side is chosen as its join value by the two flags.
pub fn grace_hash_join(
    left: &Table,
    right: &Table,
    join_on_left_key: bool,
    join_on_right_key: bool,
) -> Result<Vec<EntryPair>> {
    let left_temp = build_hash_index(left, join_on_left_key)?;
    let right_temp = build_hash_index(right, join_on_right_key)?;

    // Align directory sizes so slot i of both tables covers the same hash
    // prefix.
    while left_temp.index.global_depth() != right_temp.index.global_depth() {
        if left_temp.index.global_depth() < right_temp.index.global_depth() {
            left_temp.index.table().extend_directory();
        } else {
            right_temp.index.table().extend_directory();
        }
    }

    let left_buckets = left_temp.index.table().buckets_snapshot();
    let right_buckets = right_temp.index.table().buckets_snapshot();

    // Aliased directory slots repeat bucket pairs; probe each pair once.
    let mut seen = HashSet::new();
    let jobs: Vec<(i64, i64)> = left_buckets
        .iter()
        .zip(right_buckets.iter())
        .filter(|&(&l, &r)| seen.insert((l, r)))
        .map(|(&l, &r)| (l, r))
        .collect();

    let cancelled = AtomicBool::new(false);
    let (sender, receiver) = sync_channel::<EntryPair>(RESULT_CHANNEL_CAPACITY);
    let mut results = Vec::new();
    let mut first_error = None;

    thread::scope(|scope| {
        let mut handles = Vec::new();
        for (left_pn, right_pn) in jobs {
            let sender = sender.clone();
            let cancelled = &cancelled;
            let left_table = left_temp.index.table();
            let right_table = right_temp.index.table();
            handles.push(scope.spawn(move || -> Result<()> {
                let outcome = (|| {
                    let left_entries = left_table.bucket_entries(left_pn)?;
                    let right_entries = right_table.bucket_entries(right_pn)?;
                    probe_buckets(
                        cancelled,
                        &sender,
                        &left_entries,
                        &right_entries,
                        join_on_left_key,
                        join_on_right_key,
                    );
                    Ok(())
                })();
                if outcome.is_err() {
                    cancelled.store(true, Ordering::SeqCst);
                }
                outcome
            }));
        }
        drop(sender);

        for pair in receiver.iter() {
            results.push(pair);
        }
        for handle in handles {
            let outcome = handle.join().expect("join probe panicked");
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
    });

    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, IndexKind};
    use tempfile::tempdir;

    #[test]
    fn test_join_on_both_keys() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let left = db.create_table(IndexKind::Hash, "l").unwrap();
        let right = db.create_table(IndexKind::BTree, "r").unwrap();

        for key in 0..100 {
            left.insert(key, key * 2).unwrap();
        }
        for key in (0..200).step_by(2) {
            right.insert(key, key * 10).unwrap();
        }

        let mut pairs = grace_hash_join(&left, &right, true, true).unwrap();
        pairs.sort_by_key(|p| p.left.key);

        // Keys 0,2,...,98 appear on both sides.
        assert_eq!(pairs.len(), 50);
        for (i, pair) in pairs.iter().enumerate() {
            let key = 2 * i as i64;
            assert_eq!(pair.left, Entry { key, value: key * 2 });
            assert_eq!(pair.right, Entry { key, value: key * 10 });
        }
    }

    #[test]
    fn test_join_value_to_key_orients_entries() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let left = db.create_table(IndexKind::BTree, "l").unwrap();
        let right = db.create_table(IndexKind::BTree, "r").unwrap();

        // left values join against right keys.
        left.insert(1, 500).unwrap();
        left.insert(2, 600).unwrap();
        left.insert(3, 500).unwrap();
        right.insert(500, 7).unwrap();

        let mut pairs = grace_hash_join(&left, &right, false, true).unwrap();
        pairs.sort_by_key(|p| p.left.value);

        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].left, Entry { key: 500, value: 1 });
        assert_eq!(pairs[1].left, Entry { key: 500, value: 3 });
        for pair in &pairs {
            assert_eq!(pair.right, Entry { key: 500, value: 7 });
        }
    }

    #[test]
    fn test_join_empty_side_yields_nothing() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let left = db.create_table(IndexKind::Hash, "l").unwrap();
        let right = db.create_table(IndexKind::Hash, "r").unwrap();
        left.insert(1, 1).unwrap();
        assert!(grace_hash_join(&left, &right, true, true)
            .unwrap()
            .is_empty());
    }
}
