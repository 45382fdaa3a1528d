//! Cursors represent positions inside a B+-tree and drive every scan.

use crate::error::Result;
use crate::{Entry, PageId, NO_PAGE};

use super::node::{self, NodeType};
use super::BTreeIndex;
use crate::pager::PageGuard;

/// A position within one leaf. `is_end` marks the slot one past the last
/// entry of the current leaf; stepping from there follows the right
/// sibling chain.
pub struct BTreeCursor<'a> {
    index: &'a BTreeIndex,
    page: PageGuard,
    cellnum: i64,
    is_end: bool,
}

impl BTreeIndex {
    /// A cursor on the first entry of the table.
    pub fn table_start(&self) -> Result<BTreeCursor<'_>> {
        let root_guard = self.root_latch.read();
        let mut page = self.pager().get_page(*self.root_pn.lock())?;
        let mut data = page.read();
        drop(root_guard);
        while node::node_type(&data)? == NodeType::Internal {
            let child = self.child_page(node::child_at(&data, 0))?;
            let child_data = child.read();
            data = child_data;
            page = child;
        }
        let is_end = node::num_keys(&data) == 0;
        drop(data);
        Ok(BTreeCursor {
            index: self,
            page,
            cellnum: 0,
            is_end,
        })
    }

    /// A cursor one past the last entry of the table.
    pub fn table_end(&self) -> Result<BTreeCursor<'_>> {
        let root_guard = self.root_latch.read();
        let mut page = self.pager().get_page(*self.root_pn.lock())?;
        let mut data = page.read();
        drop(root_guard);
        while node::node_type(&data)? == NodeType::Internal {
            let n = node::num_keys(&data) as usize;
            let child = self.child_page(node::child_at(&data, n))?;
            let child_data = child.read();
            data = child_data;
            page = child;
        }
        let cellnum = node::num_keys(&data);
        drop(data);
        Ok(BTreeCursor {
            index: self,
            page,
            cellnum,
            is_end: true,
        })
    }

    /// A cursor on `key`, or on its insertion position if absent.
    pub fn table_find(&self, key: i64) -> Result<BTreeCursor<'_>> {
        let root_guard = self.root_latch.read();
        let mut page = self.pager().get_page(*self.root_pn.lock())?;
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
                    let cellnum = node::leaf_search(&data, key) as i64;
                    let is_end = cellnum == node::num_keys(&data);
                    drop(data);
                    return Ok(BTreeCursor {
                        index: self,
                        page,
                        cellnum,
                        is_end,
                    });
                }
            }
        }
    }
}

impl BTreeCursor<'_> {
    /// The entry under the cursor, if it points at one.
    pub fn get_entry(&self) -> Option<Entry> {
        if self.is_end {
            return None;
        }
        let data = self.page.read();
        Some(Entry {
            key: node::leaf_key_at(&data, self.cellnum as usize),
            value: node::leaf_value_at(&data, self.cellnum as usize),
        })
    }

    /// The cursor's position as `(leaf page, cell)`, comparable between two
    /// cursors over the same table.
    pub fn position(&self) -> (PageId, i64) {
        (self.page.pagenum(), self.cellnum)
    }

    pub fn is_end(&self) -> bool {
        self.is_end
    }

    /// Advance one step. From the end-of-leaf position this follows the
    /// right sibling chain, skipping leaves emptied by deletes. Returns
    /// `false` once the table is exhausted.
    pub fn step_forward(&mut self) -> Result<bool> {
        if !self.is_end {
            self.cellnum += 1;
            let n = {
                let data = self.page.read();
                node::num_keys(&data)
            };
            if self.cellnum >= n {
                self.is_end = true;
            }
            return Ok(true);
        }
        loop {
            let next = {
                let data = self.page.read();
                node::right_sibling(&data)
            };
            if next == NO_PAGE {
                return Ok(false);
            }
            self.page = self.index.pager().get_page(next)?;
            self.cellnum = 0;
            let n = {
                let data = self.page.read();
                node::num_keys(&data)
            };
            if n > 0 {
                self.is_end = false;
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cursor_walks_the_leaf_chain() {
        let dir = tempdir().unwrap();
        let tree = BTreeIndex::create("t", &dir.path().join("t"), &dir.path().join("t.meta"))
            .unwrap();
        let n = 3 * super::super::ENTRIES_PER_LEAF_NODE as i64;
        for key in 0..n {
            tree.insert(key, key).unwrap();
        }

        let mut cur = tree.table_start().unwrap();
        let mut expected = 0;
        loop {
            if let Some(e) = cur.get_entry() {
                assert_eq!(e.key, expected);
                expected += 1;
            }
            if !cur.step_forward().unwrap() {
                break;
            }
        }
        assert_eq!(expected, n);
    }

    #[test]
    fn test_find_lands_on_insertion_position() {
        let dir = tempdir().unwrap();
        let tree = BTreeIndex::create("t", &dir.path().join("t"), &dir.path().join("t.meta"))
            .unwrap();
        for key in [10, 20, 30] {
            tree.insert(key, key).unwrap();
        }
        let cur = tree.table_find(20).unwrap();
        assert_eq!(cur.get_entry().unwrap().key, 20);
        let cur = tree.table_find(25).unwrap();
        assert_eq!(cur.get_entry().unwrap().key, 30);
        let cur = tree.table_find(99).unwrap();
        assert!(cur.is_end());
        assert_eq!(cur.position(), tree.table_end().unwrap().position());
    }
}
