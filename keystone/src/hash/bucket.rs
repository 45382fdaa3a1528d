//! On-page layout and operations of a single hash bucket.

use std::sync::Arc;

use crate::error::Result;
use crate::pager::{PageBuf, PageGuard, Pager};
use crate::{Entry, PageId, PAGE_SIZE};

const DEPTH_OFFSET: usize = 0;
const NUM_KEYS_OFFSET: usize = 8;
const BUCKET_HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = 16;

/// Entries one bucket page can hold.
pub const BUCKET_SIZE: usize = (PAGE_SIZE - BUCKET_HEADER_SIZE) / ENTRY_SIZE;

fn i64_at(data: &PageBuf, off: usize) -> i64 {
    i64::from_le_bytes(data[off..off + 8].try_into().unwrap())
}

fn put_i64(data: &mut PageBuf, off: usize, v: i64) {
    data[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// A pinned bucket page. Every accessor takes the page latch for the
/// duration of the call.
pub(crate) struct HashBucket {
    page: PageGuard,
}

impl HashBucket {
    /// Allocate and initialize a fresh bucket with the given local depth.
    pub(crate) fn create(pager: &Arc<Pager>, depth: i64) -> Result<Self> {
        let pn = pager.new_page();
        let page = pager.get_page(pn)?;
        {
            let mut data = page.write();
            data.fill(0);
            put_i64(&mut data, DEPTH_OFFSET, depth);
        }
        Ok(Self { page })
    }

    pub(crate) fn open(pager: &Arc<Pager>, pn: PageId) -> Result<Self> {
        Ok(Self {
            page: pager.get_page(pn)?,
        })
    }

    pub(crate) fn page_num(&self) -> PageId {
        self.page.pagenum()
    }

    pub(crate) fn local_depth(&self) -> i64 {
        i64_at(&self.page.read(), DEPTH_OFFSET)
    }

    pub(crate) fn set_local_depth(&self, depth: i64) {
        put_i64(&mut self.page.write(), DEPTH_OFFSET, depth);
    }

    pub(crate) fn num_keys(&self) -> i64 {
        i64_at(&self.page.read(), NUM_KEYS_OFFSET)
    }

    /// Linear scan for the first entry with this key.
    pub(crate) fn find(&self, key: i64) -> Option<Entry> {
        let data = self.page.read();
        let n = i64_at(&data, NUM_KEYS_OFFSET) as usize;
        for i in 0..n {
            if entry_key(&data, i) == key {
                return Some(Entry {
                    key,
                    value: entry_value(&data, i),
                });
            }
        }
        None
    }

    /// Append an entry. The caller splits full buckets first.
    pub(crate) fn append(&self, key: i64, value: i64) {
        let mut data = self.page.write();
        let n = i64_at(&data, NUM_KEYS_OFFSET) as usize;
        assert!(n < BUCKET_SIZE, "append to a full bucket");
        set_entry(&mut data, n, key, value);
        put_i64(&mut data, NUM_KEYS_OFFSET, (n + 1) as i64);
    }

    /// Overwrite the value of every entry with this key. Returns whether
    /// any entry matched.
    pub(crate) fn update(&self, key: i64, value: i64) -> bool {
        let mut data = self.page.write();
        let n = i64_at(&data, NUM_KEYS_OFFSET) as usize;
        let mut found = false;
        for i in 0..n {
            if entry_key(&data, i) == key {
                set_entry(&mut data, i, key, value);
                found = true;
            }
        }
        found
    }

    /// Remove the first entry with this key, shifting the rest left.
    /// Returns whether an entry was removed.
    pub(crate) fn delete(&self, key: i64) -> bool {
        let mut data = self.page.write();
        let n = i64_at(&data, NUM_KEYS_OFFSET) as usize;
        let Some(idx) = (0..n).find(|&i| entry_key(&data, i) == key) else {
            return false;
        };
        for i in idx..n - 1 {
            let (k, v) = (entry_key(&data, i + 1), entry_value(&data, i + 1));
            set_entry(&mut data, i, k, v);
        }
        put_i64(&mut data, NUM_KEYS_OFFSET, (n - 1) as i64);
        true
    }

    pub(crate) fn select(&self) -> Vec<Entry> {
        let data = self.page.read();
        let n = i64_at(&data, NUM_KEYS_OFFSET) as usize;
        (0..n)
            .map(|i| Entry {
                key: entry_key(&data, i),
                value: entry_value(&data, i),
            })
            .collect()
    }

    /// Drop every entry, keeping the local depth.
    pub(crate) fn clear(&self) {
        put_i64(&mut self.page.write(), NUM_KEYS_OFFSET, 0);
    }
}

fn entry_key(data: &PageBuf, idx: usize) -> i64 {
    i64_at(data, BUCKET_HEADER_SIZE + idx * ENTRY_SIZE)
}

fn entry_value(data: &PageBuf, idx: usize) -> i64 {
    i64_at(data, BUCKET_HEADER_SIZE + idx * ENTRY_SIZE + 8)
}

fn set_entry(data: &mut PageBuf, idx: usize, key: i64, value: i64) {
    put_i64(data, BUCKET_HEADER_SIZE + idx * ENTRY_SIZE, key);
    put_i64(data, BUCKET_HEADER_SIZE + idx * ENTRY_SIZE + 8, value);
}
