//! The B+-tree index: an ordered `i64 -> i64` map stored one node per page,
//! with latch-crabbing descent and right-sibling chained leaves.

mod cursor;
mod node;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

pub use cursor::BTreeCursor;
pub use node::{ENTRIES_PER_LEAF_NODE, KEYS_PER_INTERNAL_NODE};

use crate::error::{KeystoneError, Result};
use crate::meta::{read_meta, write_meta, TableMeta};
use crate::pager::{PageGuard, PageWriteGuard, Pager};
use crate::{Entry, PageId};

use node::NodeType;

/// A key promoted out of a split, with the pages on either side of it.
struct Split {
    key: i64,
    left: PageId,
    right: PageId,
}

pub struct BTreeIndex {
    name: String,
    pager: Arc<Pager>,
    root_pn: Mutex<PageId>,
    // Serializes root-pointer reads against root splits. Readers hold the
    // shared side only until the root page latch is taken; writers hold the
    // exclusive side for the whole operation since the root may move.
    root_latch: RwLock<()>,
    meta_path: PathBuf,
}

impl BTreeIndex {
    /// Create a fresh tree whose root is a single empty leaf.
    pub fn create(name: &str, data_path: &Path, meta_path: &Path) -> Result<Self> {
        let pager = Arc::new(Pager::open(data_path)?);
        let root_pn = pager.new_page();
        {
            let page = pager.get_page(root_pn)?;
            let mut data = page.write();
            node::init_leaf(&mut data);
            node::set_is_root(&mut data, true);
        }
        let index = Self {
            name: name.to_string(),
            pager,
            root_pn: Mutex::new(root_pn),
            root_latch: RwLock::new(()),
            meta_path: meta_path.to_path_buf(),
        };
        index.write_meta()?;
        Ok(index)
    }

    /// Reopen a tree from its data file and meta sidecar.
    pub fn open(name: &str, data_path: &Path, meta_path: &Path) -> Result<Self> {
        let pager = Arc::new(Pager::open(data_path)?);
        let root_pn = match read_meta(meta_path)? {
            TableMeta::BTree { root_pn } => root_pn,
            TableMeta::Hash { .. } => {
                return Err(KeystoneError::CorruptDb(format!(
                    "{name} has a hash meta file but was opened as a b+tree"
                )))
            }
        };
        if root_pn < 0 || root_pn >= pager.num_pages() {
            return Err(KeystoneError::CorruptDb(format!(
                "root page {root_pn} is outside the data file"
            )));
        }
        {
            let page = pager.get_page(root_pn)?;
            let data = page.read();
            node::node_type(&data)?;
            if !node::is_root(&data) {
                return Err(KeystoneError::CorruptDb(format!(
                    "page {root_pn} is not marked as a root"
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            pager,
            root_pn: Mutex::new(root_pn),
            root_latch: RwLock::new(()),
            meta_path: meta_path.to_path_buf(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    fn write_meta(&self) -> Result<()> {
        write_meta(
            &self.meta_path,
            &TableMeta::BTree {
                root_pn: *self.root_pn.lock(),
            },
        )
    }

    /// Persist the meta sidecar and flush every dirty page.
    pub fn close(&self) -> Result<()> {
        self.write_meta()?;
        self.pager.close()
    }

    fn child_page(&self, pn: PageId) -> Result<PageGuard> {
        match self.pager.get_page(pn) {
            Ok(guard) => Ok(guard),
            Err(KeystoneError::InvalidPageNumber(_)) => Err(KeystoneError::ChildUnreachable(pn)),
            Err(e) => Err(e),
        }
    }

    /// Point lookup. Descends with read latches, releasing each parent as
    /// soon as the child latch is held.
    pub fn find(&self, key: i64) -> Result<Option<Entry>> {
        let root_guard = self.root_latch.read();
        let mut page = self.pager.get_page(*self.root_pn.lock())?;
        let mut data = page.read();
        drop(root_guard);
        loop {
            match node::node_type(&data)? {
                NodeType::Internal => {
                    let idx = node::internal_search(&data, key);
                    let child = self.child_page(node::child_at(&data, idx))?;
                    let child_data = child.read();
                    data = child_data;
                    page = child;
                }
                NodeType::Leaf => {
                    let n = node::num_keys(&data) as usize;
                    let idx = node::leaf_search(&data, key);
                    if idx < n && node::leaf_key_at(&data, idx) == key {
                        return Ok(Some(Entry {
                            key,
                            value: node::leaf_value_at(&data, idx),
                        }));
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Insert a new entry; fails with `Duplicate` if the key exists.
    pub fn insert(&self, key: i64, value: i64) -> Result<()> {
        self.insert_inner(key, value, false)
    }

    /// Overwrite an existing entry; fails with `MissingForUpdate` if absent.
    pub fn update(&self, key: i64, value: i64) -> Result<()> {
        self.insert_inner(key, value, true)
    }

    fn insert_inner(&self, key: i64, value: i64, update: bool) -> Result<()> {
        let _permit = self.pager.update_permit();
        let _root = self.root_latch.write();
        let root_pn = *self.root_pn.lock();
        let page = self.pager.get_page(root_pn)?;
        let data = page.write();
        if let Some(split) = self.insert_node(page, data, key, value, update)? {
            self.grow_root(split)?;
        }
        Ok(())
    }

    /// Recursive descent for insert/update. Takes ownership of the current
    /// node's pin and write latch; when the child cannot split, both are
    /// released before recursing, otherwise they are held so a promoted key
    /// can be incorporated on the way back up.
    fn insert_node(
        &self,
        page: PageGuard,
        mut data: PageWriteGuard,
        key: i64,
        value: i64,
        update: bool,
    ) -> Result<Option<Split>> {
        match node::node_type(&data)? {
            NodeType::Leaf => {
                let n = node::num_keys(&data) as usize;
                let idx = node::leaf_search(&data, key);
                if idx < n && node::leaf_key_at(&data, idx) == key {
                    if !update {
                        return Err(KeystoneError::Duplicate(key));
                    }
                    node::set_leaf_value_at(&mut data, idx, value);
                    return Ok(None);
                }
                if update {
                    return Err(KeystoneError::MissingForUpdate(key));
                }
                node::leaf_insert_at(&mut data, idx, key, value);
                if node::num_keys(&data) > ENTRIES_PER_LEAF_NODE as i64 {
                    return Ok(Some(self.split_leaf(&page, &mut data)?));
                }
                Ok(None)
            }
            NodeType::Internal => {
                let idx = node::internal_search(&data, key);
                let child = self.child_page(node::child_at(&data, idx))?;
                let child_data = child.write();
                let child_safe = match node::node_type(&child_data)? {
                    NodeType::Leaf => {
                        node::num_keys(&child_data) < ENTRIES_PER_LEAF_NODE as i64
                    }
                    NodeType::Internal => {
                        node::num_keys(&child_data) < KEYS_PER_INTERNAL_NODE as i64
                    }
                };
                if child_safe {
                    drop(data);
                    drop(page);
                    return self.insert_node(child, child_data, key, value, update);
                }
                if let Some(split) = self.insert_node(child, child_data, key, value, update)? {
                    self.incorporate_split(&mut data, &split);
                    if node::num_keys(&data) > KEYS_PER_INTERNAL_NODE as i64 {
                        return Ok(Some(self.split_internal(&page, &mut data)?));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Move the upper half of an overflowing leaf into a new right sibling
    /// and promote the first key of the new leaf.
    fn split_leaf(&self, page: &PageGuard, data: &mut PageWriteGuard) -> Result<Split> {
        let new_pn = self.pager.new_page();
        let new_page = self.pager.get_page(new_pn)?;
        let mut new_data = new_page.write();
        node::init_leaf(&mut new_data);

        let n = node::num_keys(data) as usize;
        let mid = n / 2;
        for i in mid..n {
            node::set_leaf_entry(
                &mut new_data,
                i - mid,
                node::leaf_key_at(data, i),
                node::leaf_value_at(data, i),
            );
        }
        node::set_num_keys(&mut new_data, (n - mid) as i64);
        node::set_right_sibling(&mut new_data, node::right_sibling(data));
        node::set_num_keys(data, mid as i64);
        node::set_right_sibling(data, new_pn);

        Ok(Split {
            key: node::leaf_key_at(&new_data, 0),
            left: page.pagenum(),
            right: new_pn,
        })
    }

    /// Split an overflowing internal node. The promoted median key is
    /// retained by neither side.
    fn split_internal(&self, page: &PageGuard, data: &mut PageWriteGuard) -> Result<Split> {
        let new_pn = self.pager.new_page();
        let new_page = self.pager.get_page(new_pn)?;
        let mut new_data = new_page.write();
        node::init_internal(&mut new_data);

        let n = node::num_keys(data) as usize;
        let mid = n / 2;
        let promoted = node::internal_key_at(data, mid);
        for i in mid + 1..n {
            node::set_internal_key_at(&mut new_data, i - mid - 1, node::internal_key_at(data, i));
            node::set_child_at(&mut new_data, i - mid - 1, node::child_at(data, i));
        }
        node::set_child_at(&mut new_data, n - mid - 1, node::child_at(data, n));
        node::set_num_keys(&mut new_data, (n - mid - 1) as i64);
        node::set_num_keys(data, mid as i64);

        Ok(Split {
            key: promoted,
            left: page.pagenum(),
            right: new_pn,
        })
    }

    /// Place a child split's promoted key and page pointers into this
    /// internal node.
    fn incorporate_split(&self, data: &mut PageWriteGuard, split: &Split) {
        let n = node::num_keys(data) as usize;
        let pos = node::internal_search(data, split.key);
        let last_child = node::child_at(data, n);
        node::set_child_at(data, n + 1, last_child);
        for i in (pos..n).rev() {
            let (k, c) = (node::internal_key_at(data, i), node::child_at(data, i));
            node::set_internal_key_at(data, i + 1, k);
            node::set_child_at(data, i + 1, c);
        }
        node::set_internal_key_at(data, pos, split.key);
        node::set_child_at(data, pos, split.left);
        node::set_child_at(data, pos + 1, split.right);
        node::set_num_keys(data, (n + 1) as i64);
    }

    /// A split reached the root: hang both halves under a new internal root.
    fn grow_root(&self, split: Split) -> Result<()> {
        let new_root_pn = self.pager.new_page();
        {
            let root_page = self.pager.get_page(new_root_pn)?;
            let mut root_data = root_page.write();
            node::init_internal(&mut root_data);
            node::set_is_root(&mut root_data, true);
            node::set_child_at(&mut root_data, 0, split.left);
            node::set_internal_key_at(&mut root_data, 0, split.key);
            node::set_child_at(&mut root_data, 1, split.right);
            node::set_num_keys(&mut root_data, 1);
        }
        {
            let old_root = self.pager.get_page(split.left)?;
            let mut old_data = old_root.write();
            node::set_is_root(&mut old_data, false);
        }
        *self.root_pn.lock() = new_root_pn;
        self.write_meta()
    }

    /// Remove a key if present. Deleting an absent key is a silent no-op
    /// and no rebalancing is performed; underfull nodes are tolerated.
    pub fn delete(&self, key: i64) -> Result<()> {
        let _permit = self.pager.update_permit();
        let _root = self.root_latch.write();
        let mut page = self.pager.get_page(*self.root_pn.lock())?;
        let mut data = page.write();
        loop {
            match node::node_type(&data)? {
                NodeType::Internal => {
                    let idx = node::internal_search(&data, key);
                    let child = self.child_page(node::child_at(&data, idx))?;
                    let child_data = child.write();
                    // Deletes never restructure, so the parent is always safe
                    // to release once the child latch is held.
                    data = child_data;
                    page = child;
                }
                NodeType::Leaf => {
                    let n = node::num_keys(&data) as usize;
                    let idx = node::leaf_search(&data, key);
                    if idx < n && node::leaf_key_at(&data, idx) == key {
                        node::leaf_remove_at(&mut data, idx);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// All entries in ascending key order.
    pub fn select(&self) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        let mut cur = self.table_start()?;
        loop {
            if let Some(entry) = cur.get_entry() {
                out.push(entry);
            }
            if !cur.step_forward()? {
                break;
            }
        }
        Ok(out)
    }

    /// Entries with `start <= key < end`, ascending.
    pub fn scan_range(&self, start: i64, end: i64) -> Result<Vec<Entry>> {
        let end_pos = self.table_find(end)?.position();
        let mut cur = self.table_find(start)?;
        let mut out = Vec::new();
        while cur.position() != end_pos {
            if let Some(entry) = cur.get_entry() {
                out.push(entry);
            }
            if !cur.step_forward()? {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh(dir: &tempfile::TempDir) -> BTreeIndex {
        BTreeIndex::create("t", &dir.path().join("t"), &dir.path().join("t.meta")).unwrap()
    }

    #[test]
    fn test_insert_find_delete() {
        let dir = tempdir().unwrap();
        let tree = fresh(&dir);

        tree.insert(2, 20).unwrap();
        tree.insert(1, 10).unwrap();
        tree.insert(3, 30).unwrap();

        assert_eq!(tree.find(2).unwrap().unwrap().value, 20);
        assert!(tree.find(4).unwrap().is_none());
        assert!(matches!(
            tree.insert(2, 99),
            Err(KeystoneError::Duplicate(2))
        ));

        tree.update(2, 22).unwrap();
        assert_eq!(tree.find(2).unwrap().unwrap().value, 22);
        assert!(matches!(
            tree.update(9, 90),
            Err(KeystoneError::MissingForUpdate(9))
        ));

        tree.delete(2).unwrap();
        assert!(tree.find(2).unwrap().is_none());
        // Deleting a missing key is a no-op.
        tree.delete(2).unwrap();
    }

    #[test]
    fn test_select_is_sorted_across_splits() {
        let dir = tempdir().unwrap();
        let tree = fresh(&dir);
        // Enough keys to split leaves and the root a few times over.
        let n = 4 * ENTRIES_PER_LEAF_NODE as i64;
        for key in (0..n).rev() {
            tree.insert(key, key * 10).unwrap();
        }
        let all = tree.select().unwrap();
        assert_eq!(all.len(), n as usize);
        for (i, e) in all.iter().enumerate() {
            assert_eq!(e.key, i as i64);
            assert_eq!(e.value, e.key * 10);
        }
    }

    #[test]
    fn test_scan_range_bounds() {
        let dir = tempdir().unwrap();
        let tree = fresh(&dir);
        for key in 1..=1000 {
            tree.insert(key, key).unwrap();
        }
        let hits = tree.scan_range(250, 750).unwrap();
        assert_eq!(hits.len(), 500);
        assert_eq!(hits.first().unwrap().key, 250);
        assert_eq!(hits.last().unwrap().key, 749);
        assert!(hits.windows(2).all(|w| w[0].key < w[1].key));
    }

    #[test]
    fn test_shuffled_inserts_come_back_sorted() {
        use rand::seq::SliceRandom;

        let dir = tempdir().unwrap();
        let tree = fresh(&dir);
        let mut keys: Vec<i64> = (0..2000).collect();
        keys.shuffle(&mut rand::thread_rng());
        for &key in &keys {
            tree.insert(key, -key).unwrap();
        }
        let all = tree.select().unwrap();
        assert_eq!(all.len(), 2000);
        for (i, e) in all.iter().enumerate() {
            assert_eq!(e.key, i as i64);
            assert_eq!(e.value, -e.key);
        }
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("t");
        let meta = dir.path().join("t.meta");
        {
            let tree = BTreeIndex::create("t", &data, &meta).unwrap();
            for key in 0..2000 {
                tree.insert(key, key + 7).unwrap();
            }
            tree.close().unwrap();
        }
        let tree = BTreeIndex::open("t", &data, &meta).unwrap();
        assert_eq!(tree.find(1234).unwrap().unwrap().value, 1241);
        assert_eq!(tree.select().unwrap().len(), 2000);
    }
}
