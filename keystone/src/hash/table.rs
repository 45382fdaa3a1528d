//! The extendible hash directory: `2^global_depth` slots mapping hash
//! prefixes to bucket pages. Several slots may alias one bucket until that
//! bucket splits its way up to the global depth.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::pager::Pager;
use crate::{Entry, PageId};

use super::bucket::{HashBucket, BUCKET_SIZE};
use super::slot_for;

const INITIAL_GLOBAL_DEPTH: u64 = 2;

pub(crate) struct Directory {
    pub global_depth: u64,
    pub buckets: Vec<PageId>,
}

pub struct HashTable {
    pager: Arc<Pager>,
    dir: parking_lot::RwLock<Directory>,
}

impl HashTable {
    /// A fresh table: directory of depth 2 over four empty buckets.
    pub(crate) fn create(pager: Arc<Pager>) -> Result<Self> {
        let mut buckets = Vec::with_capacity(1 << INITIAL_GLOBAL_DEPTH);
        for _ in 0..(1 << INITIAL_GLOBAL_DEPTH) {
            let bucket = HashBucket::create(&pager, INITIAL_GLOBAL_DEPTH as i64)?;
            buckets.push(bucket.page_num());
        }
        Ok(Self {
            pager,
            dir: parking_lot::RwLock::new(Directory {
                global_depth: INITIAL_GLOBAL_DEPTH,
                buckets,
            }),
        })
    }

    pub(crate) fn from_meta(pager: Arc<Pager>, global_depth: u64, buckets: Vec<PageId>) -> Self {
        Self {
            pager,
            dir: parking_lot::RwLock::new(Directory {
                global_depth,
                buckets,
            }),
        }
    }

    pub fn global_depth(&self) -> u64 {
        self.dir.read().global_depth
    }

    pub(crate) fn buckets_snapshot(&self) -> Vec<PageId> {
        self.dir.read().buckets.clone()
    }

    pub fn find(&self, key: i64) -> Result<Option<Entry>> {
        let dir = self.dir.read();
        let pn = dir.buckets[slot_for(key, dir.global_depth)];
        let bucket = HashBucket::open(&self.pager, pn)?;
        Ok(bucket.find(key))
    }

    /// Append an entry, splitting the target bucket for as long as it is
    /// full; splits cascade through repeated re-hashing of the same slot.
    /// Duplicate keys are permitted at this level.
    pub fn insert(&self, key: i64, value: i64) -> Result<()> {
        let _permit = self.pager.update_permit();
        let mut dir = self.dir.write();
        loop {
            let slot = slot_for(key, dir.global_depth);
            let bucket = HashBucket::open(&self.pager, dir.buckets[slot])?;
            if bucket.num_keys() < BUCKET_SIZE as i64 {
                bucket.append(key, value);
                return Ok(());
            }
            self.split_bucket(&mut dir, slot)?;
        }
    }

    /// Split the bucket behind `slot`: raise its local depth, double the
    /// directory if the new depth exceeds the global one, point the newly
    /// distinguished slots at a fresh bucket and re-hash the old entries
    /// between the two.
    fn split_bucket(&self, dir: &mut Directory, slot: usize) -> Result<()> {
        let old = HashBucket::open(&self.pager, dir.buckets[slot])?;
        let old_depth = old.local_depth() as u64;
        let new_depth = old_depth + 1;

        if new_depth > dir.global_depth {
            dir.global_depth += 1;
            let aliases = dir.buckets.clone();
            dir.buckets.extend(aliases);
        }

        let tag = slot & ((1usize << old_depth) - 1);
        let new_tag = tag | (1usize << old_depth);

        old.set_local_depth(new_depth as i64);
        let new = HashBucket::create(&self.pager, new_depth as i64)?;
        let new_pn = new.page_num();

        let mask = (1usize << new_depth) - 1;
        for i in 0..dir.buckets.len() {
            if i & mask == new_tag {
                dir.buckets[i] = new_pn;
            }
        }

        let entries = old.select();
        old.clear();
        for e in entries {
            if slot_for(e.key, new_depth) == new_tag {
                new.append(e.key, e.value);
            } else {
                old.append(e.key, e.value);
            }
        }
        Ok(())
    }

    /// Overwrite the value stored under `key`. Returns whether any entry
    /// matched.
    pub fn update(&self, key: i64, value: i64) -> Result<bool> {
        let _permit = self.pager.update_permit();
        let dir = self.dir.read();
        let pn = dir.buckets[slot_for(key, dir.global_depth)];
        let bucket = HashBucket::open(&self.pager, pn)?;
        Ok(bucket.update(key, value))
    }

    /// Remove the entry under `key` if present; no coalescing. Returns
    /// whether an entry was removed.
    pub fn delete(&self, key: i64) -> Result<bool> {
        let _permit = self.pager.update_permit();
        let dir = self.dir.read();
        let pn = dir.buckets[slot_for(key, dir.global_depth)];
        let bucket = HashBucket::open(&self.pager, pn)?;
        Ok(bucket.delete(key))
    }

    /// Every entry, visiting each distinct bucket page once.
    pub fn select(&self) -> Result<Vec<Entry>> {
        let dir = self.dir.read();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for &pn in &dir.buckets {
            if !seen.insert(pn) {
                continue;
            }
            let bucket = HashBucket::open(&self.pager, pn)?;
            out.extend(bucket.select());
        }
        Ok(out)
    }

    /// All entries of the bucket page `pn`. Used by the join operator's
    /// probes.
    pub(crate) fn bucket_entries(&self, pn: PageId) -> Result<Vec<Entry>> {
        let bucket = HashBucket::open(&self.pager, pn)?;
        Ok(bucket.select())
    }

    /// Double the directory without splitting any bucket. The join
    /// operator uses this to align two tables' global depths.
    pub(crate) fn extend_directory(&self) {
        let mut dir = self.dir.write();
        dir.global_depth += 1;
        let aliases = dir.buckets.clone();
        dir.buckets.extend(aliases);
    }

    pub(crate) fn snapshot(&self) -> (u64, Vec<PageId>) {
        let dir = self.dir.read();
        (dir.global_depth, dir.buckets.clone())
    }
}
