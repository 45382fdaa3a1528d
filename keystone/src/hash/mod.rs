//! The extendible hash index: an unordered `i64 -> i64` map with a
//! doubling directory and per-bucket local depths.

mod bucket;
mod table;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use bucket::BUCKET_SIZE;
pub use table::HashTable;

use crate::error::{KeystoneError, Result};
use crate::meta::{read_meta, write_meta, TableMeta};
use crate::pager::Pager;
use crate::Entry;

/// The 64-bit Murmur3 finalizer. Spreads sequential keys across the
/// directory before masking.
fn murmur_mix(key: i64) -> u64 {
    let mut h = key as u64;
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Directory slot for `key` at the given depth: the hash masked to its low
/// `depth` bits.
pub(crate) fn slot_for(key: i64, depth: u64) -> usize {
    (murmur_mix(key) & ((1u64 << depth) - 1)) as usize
}

pub struct HashIndex {
    name: String,
    pager: Arc<Pager>,
    table: HashTable,
    meta_path: PathBuf,
}

impl HashIndex {
    pub fn create(name: &str, data_path: &Path, meta_path: &Path) -> Result<Self> {
        let pager = Arc::new(Pager::open(data_path)?);
        let table = HashTable::create(pager.clone())?;
        let index = Self {
            name: name.to_string(),
            pager,
            table,
            meta_path: meta_path.to_path_buf(),
        };
        index.write_meta()?;
        Ok(index)
    }

    pub fn open(name: &str, data_path: &Path, meta_path: &Path) -> Result<Self> {
        let pager = Arc::new(Pager::open(data_path)?);
        let (global_depth, buckets) = match read_meta(meta_path)? {
            TableMeta::Hash {
                global_depth,
                buckets,
            } => (global_depth, buckets),
            TableMeta::BTree { .. } => {
                return Err(KeystoneError::CorruptDb(format!(
                    "{name} has a b+tree meta file but was opened as a hash table"
                )))
            }
        };
        if buckets.len() != 1usize << global_depth {
            return Err(KeystoneError::CorruptDb(format!(
                "hash directory has {} slots for global depth {global_depth}",
                buckets.len()
            )));
        }
        let n_pages = pager.num_pages();
        if buckets.iter().any(|&pn| pn < 0 || pn >= n_pages) {
            return Err(KeystoneError::CorruptDb(
                "hash directory points outside the data file".to_string(),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            pager: pager.clone(),
            table: HashTable::from_meta(pager, global_depth, buckets),
            meta_path: meta_path.to_path_buf(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    pub(crate) fn table(&self) -> &HashTable {
        &self.table
    }

    pub fn global_depth(&self) -> u64 {
        self.table.global_depth()
    }

    pub fn find(&self, key: i64) -> Result<Option<Entry>> {
        self.table.find(key)
    }

    /// Raw insert: appends without checking for an existing key. Key
    /// uniqueness for user tables is enforced by the catalog; the join
    /// operator's temp indexes rely on duplicates being allowed here.
    pub fn insert(&self, key: i64, value: i64) -> Result<()> {
        self.table.insert(key, value)
    }

    pub fn update(&self, key: i64, value: i64) -> Result<()> {
        if self.table.update(key, value)? {
            Ok(())
        } else {
            Err(KeystoneError::MissingForUpdate(key))
        }
    }

    /// Delete is a silent no-op when the key is absent.
    pub fn delete(&self, key: i64) -> Result<()> {
        self.table.delete(key)?;
        Ok(())
    }

    pub fn select(&self) -> Result<Vec<Entry>> {
        self.table.select()
    }

    fn write_meta(&self) -> Result<()> {
        let (global_depth, buckets) = self.table.snapshot();
        write_meta(
            &self.meta_path,
            &TableMeta::Hash {
                global_depth,
                buckets,
            },
        )
    }

    /// Persist the meta sidecar and flush every dirty page.
    pub fn close(&self) -> Result<()> {
        self.write_meta()?;
        self.pager.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh(dir: &tempfile::TempDir) -> HashIndex {
        HashIndex::create("h", &dir.path().join("h"), &dir.path().join("h.meta")).unwrap()
    }

    #[test]
    fn test_insert_find_update_delete() {
        let dir = tempdir().unwrap();
        let index = fresh(&dir);

        for key in 0..100 {
            index.insert(key, key * 10).unwrap();
        }
        assert_eq!(index.find(42).unwrap().unwrap().value, 420);
        assert!(index.find(100).unwrap().is_none());

        index.update(42, 421).unwrap();
        assert_eq!(index.find(42).unwrap().unwrap().value, 421);
        assert!(matches!(
            index.update(100, 0),
            Err(KeystoneError::MissingForUpdate(100))
        ));

        index.delete(42).unwrap();
        assert!(index.find(42).unwrap().is_none());
        index.delete(42).unwrap();
        assert_eq!(index.select().unwrap().len(), 99);
    }

    #[test]
    fn test_splits_grow_the_directory() {
        let dir = tempdir().unwrap();
        let index = fresh(&dir);
        assert_eq!(index.global_depth(), 2);

        // Far more entries than four buckets can hold, forcing splits and
        // at least one directory doubling.
        let n = 6 * BUCKET_SIZE as i64;
        for key in 0..n {
            index.insert(key, key).unwrap();
        }
        assert!(index.global_depth() >= 3);
        for key in (0..n).step_by(97) {
            assert_eq!(index.find(key).unwrap().unwrap().value, key);
        }
        assert_eq!(index.select().unwrap().len(), n as usize);
    }

    #[test]
    fn test_bucket_locality_invariant() {
        let dir = tempdir().unwrap();
        let index = fresh(&dir);
        for key in 0..(4 * BUCKET_SIZE as i64) {
            index.insert(key, key).unwrap();
        }
        // Every entry's hash, masked to the bucket's local depth, matches
        // the tag shared by all directory slots pointing at that bucket.
        let (_depth, buckets) = index.table.snapshot();
        let mut seen = std::collections::HashSet::new();
        for (slot, &pn) in buckets.iter().enumerate() {
            if !seen.insert(pn) {
                continue;
            }
            let b = super::bucket::HashBucket::open(&index.pager, pn).unwrap();
            let local = b.local_depth() as u64;
            let tag = slot & ((1usize << local) - 1);
            for e in b.select() {
                assert_eq!(slot_for(e.key, local), tag);
            }
        }
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("h");
        let meta = dir.path().join("h.meta");
        {
            let index = HashIndex::create("h", &data, &meta).unwrap();
            for key in 0..1000 {
                index.insert(key, key + 3).unwrap();
            }
            index.close().unwrap();
        }
        let index = HashIndex::open("h", &data, &meta).unwrap();
        assert_eq!(index.find(999).unwrap().unwrap().value, 1002);
        assert_eq!(index.select().unwrap().len(), 1000);
    }
}
