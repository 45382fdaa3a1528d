//! The buffer pool: a fixed set of in-memory frames caching disk pages.
//!
//! Frames move between three lists (Free, Unpinned in FIFO victim order,
//! and Pinned) and are handed to borrowers through RAII [`PageGuard`]s so
//! a pin can never leak on an early return.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use log::warn;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{KeystoneError, Result};
use crate::{PageId, NO_PAGE, NUM_PAGES, PAGE_SIZE};

/// The raw byte buffer of one page.
pub type PageBuf = [u8; PAGE_SIZE];

/// Owned read latch on a page's data.
pub type PageReadGuard =
    parking_lot::lock_api::ArcRwLockReadGuard<parking_lot::RawRwLock, Box<PageBuf>>;
/// Owned write latch on a page's data.
pub type PageWriteGuard =
    parking_lot::lock_api::ArcRwLockWriteGuard<parking_lot::RawRwLock, Box<PageBuf>>;

#[derive(Debug)]
struct PageState {
    pagenum: PageId,
    pin_count: u64,
    dirty: bool,
}

/// One frame of the buffer pool. The data buffer doubles as the per-page
/// reader/writer latch; owned guards let callers crab latches down a tree
/// without tying the guard's lifetime to a stack frame.
#[derive(Debug)]
struct Frame {
    state: Mutex<PageState>,
    data: Arc<RwLock<Box<PageBuf>>>,
}

#[derive(Debug)]
struct PagerInner {
    file: File,
    n_pages: i64,
    free: VecDeque<usize>,
    unpinned: VecDeque<usize>,
    pinned: HashSet<usize>,
    page_table: HashMap<PageId, usize>,
}

/// Pagers manage the pages of a single table's data file.
#[derive(Debug)]
pub struct Pager {
    frames: Vec<Arc<Frame>>,
    inner: Mutex<PagerInner>,
    update_latch: RwLock<()>,
}

/// A pinned page. Dropping the guard unpins it; a frame with pin count
/// zero becomes eligible for FIFO eviction.
#[derive(Debug)]
pub struct PageGuard {
    pager: Arc<Pager>,
    frame: Arc<Frame>,
    frame_idx: usize,
    pagenum: PageId,
}

impl PageGuard {
    pub fn pagenum(&self) -> PageId {
        self.pagenum
    }

    /// Acquire the page's read latch.
    pub fn read(&self) -> PageReadGuard {
        self.frame.data.read_arc()
    }

    /// Acquire the page's write latch, marking the frame dirty.
    pub fn write(&self) -> PageWriteGuard {
        self.frame.state.lock().dirty = true;
        self.frame.data.write_arc()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.pager.put_page(self.frame_idx);
    }
}

impl Pager {
    /// Open (or create) the data file at `path`. The file length must be a
    /// multiple of the page size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(KeystoneError::CorruptDb(format!(
                "data file {} has length {len}, not a multiple of the page size",
                path.display()
            )));
        }

        let mut frames = Vec::with_capacity(NUM_PAGES);
        let mut free = VecDeque::with_capacity(NUM_PAGES);
        for i in 0..NUM_PAGES {
            frames.push(Arc::new(Frame {
                state: Mutex::new(PageState {
                    pagenum: NO_PAGE,
                    pin_count: 0,
                    dirty: false,
                }),
                data: Arc::new(RwLock::new(Box::new([0u8; PAGE_SIZE]))),
            }));
            free.push_back(i);
        }

        Ok(Self {
            frames,
            inner: Mutex::new(PagerInner {
                file,
                n_pages: (len / PAGE_SIZE as u64) as i64,
                free,
                unpinned: VecDeque::new(),
                pinned: HashSet::new(),
                page_table: HashMap::new(),
            }),
            update_latch: RwLock::new(()),
        })
    }

    /// The number of pages this table has allocated (flushed or not).
    pub fn num_pages(&self) -> i64 {
        self.inner.lock().n_pages
    }

    /// Vend the next unused page number.
    pub fn new_page(&self) -> PageId {
        let mut inner = self.inner.lock();
        let pn = inner.n_pages;
        inner.n_pages += 1;
        pn
    }

    /// Return the page `pagenum`, pinned. Allocates a frame from the free
    /// list, or evicts the oldest unpinned frame, when the page is not
    /// already resident.
    pub fn get_page(self: &Arc<Self>, pagenum: PageId) -> Result<PageGuard> {
        let mut inner = self.inner.lock();
        if pagenum < 0 || pagenum >= inner.n_pages {
            return Err(KeystoneError::InvalidPageNumber(pagenum));
        }

        if let Some(&idx) = inner.page_table.get(&pagenum) {
            let frame = self.frames[idx].clone();
            let mut state = frame.state.lock();
            if state.pin_count == 0 {
                inner.unpinned.retain(|&i| i != idx);
                inner.pinned.insert(idx);
            }
            state.pin_count += 1;
            drop(state);
            return Ok(PageGuard {
                pager: self.clone(),
                frame,
                frame_idx: idx,
                pagenum,
            });
        }

        let idx = match inner.free.pop_front() {
            Some(idx) => idx,
            None => {
                let idx = inner.unpinned.pop_front().ok_or(KeystoneError::NoFrame)?;
                self.evict(&mut inner, idx)?;
                idx
            }
        };
        let frame = self.frames[idx].clone();

        {
            let mut data = frame.data.write();
            read_page_from_disk(&mut inner.file, pagenum, &mut data)?;
        }
        {
            let mut state = frame.state.lock();
            state.pagenum = pagenum;
            state.pin_count = 1;
            state.dirty = false;
        }
        inner.page_table.insert(pagenum, idx);
        inner.pinned.insert(idx);

        Ok(PageGuard {
            pager: self.clone(),
            frame,
            frame_idx: idx,
            pagenum,
        })
    }

    /// Flush an evicted frame if dirty and drop its page-table mapping.
    fn evict(&self, inner: &mut PagerInner, idx: usize) -> Result<()> {
        let frame = &self.frames[idx];
        let (old_pn, dirty) = {
            let state = frame.state.lock();
            assert_eq!(state.pin_count, 0, "evicting a pinned frame");
            (state.pagenum, state.dirty)
        };
        if dirty {
            let data = frame.data.read();
            write_page_to_disk(&mut inner.file, old_pn, &data)?;
            frame.state.lock().dirty = false;
        }
        inner.page_table.remove(&old_pn);
        Ok(())
    }

    fn put_page(&self, frame_idx: usize) {
        let mut inner = self.inner.lock();
        let frame = &self.frames[frame_idx];
        let mut state = frame.state.lock();
        assert!(
            state.pin_count > 0,
            "pin count underflow on page {}",
            state.pagenum
        );
        state.pin_count -= 1;
        if state.pin_count == 0 {
            inner.pinned.remove(&frame_idx);
            inner.unpinned.push_back(frame_idx);
        }
    }

    /// Flush the page `pagenum` to disk if it is resident and dirty.
    pub fn flush_page(&self, pagenum: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.page_table.get(&pagenum) {
            let frame = self.frames[idx].clone();
            let mut state = frame.state.lock();
            if state.dirty {
                let data = frame.data.read();
                write_page_to_disk(&mut inner.file, pagenum, &data)?;
                state.dirty = false;
            }
        }
        Ok(())
    }

    /// Flush every dirty resident page and sync the file.
    pub fn flush_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for idx in 0..self.frames.len() {
            let frame = &self.frames[idx];
            let mut state = frame.state.lock();
            if state.pagenum != NO_PAGE && state.dirty {
                let data = frame.data.read();
                write_page_to_disk(&mut inner.file, state.pagenum, &data)?;
                state.dirty = false;
            }
        }
        inner.file.sync_all()?;
        Ok(())
    }

    /// Flush everything ahead of shutdown. Pages should be unpinned by now;
    /// if any are not we complain but flush regardless.
    pub fn close(&self) -> Result<()> {
        {
            let inner = self.inner.lock();
            if !inner.pinned.is_empty() {
                warn!("{} pages are still pinned on close", inner.pinned.len());
            }
        }
        self.flush_all()
    }

    /// Block every index mutation while the returned guard is held. Used by
    /// the checkpoint to get a quiescent view of the pages.
    pub fn lock_all_updates(&self) -> RwLockWriteGuard<'_, ()> {
        self.update_latch.write()
    }

    /// The shared side of the checkpoint latch; every mutating index
    /// operation holds one of these for its duration.
    pub fn update_permit(&self) -> RwLockReadGuard<'_, ()> {
        self.update_latch.read()
    }
}

fn read_page_from_disk(file: &mut File, pagenum: PageId, buf: &mut PageBuf) -> io::Result<()> {
    buf.fill(0);
    file.seek(SeekFrom::Start(pagenum as u64 * PAGE_SIZE as u64))?;
    let mut off = 0;
    while off < PAGE_SIZE {
        match file.read(&mut buf[off..]) {
            // Pages past the flushed end of the file read as zeroes.
            Ok(0) => break,
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn write_page_to_disk(file: &mut File, pagenum: PageId, buf: &PageBuf) -> io::Result<()> {
    file.seek(SeekFrom::Start(pagenum as u64 * PAGE_SIZE as u64))?;
    file.write_all(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pager_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let pager = Arc::new(Pager::open(&path).unwrap());
        let pn = pager.new_page();
        assert_eq!(pn, 0);
        {
            let page = pager.get_page(pn).unwrap();
            let mut data = page.write();
            data[0] = 0xAB;
            data[PAGE_SIZE - 1] = 0xCD;
        }
        pager.close().unwrap();
        drop(pager);

        let pager = Arc::new(Pager::open(&path).unwrap());
        assert_eq!(pager.num_pages(), 1);
        let page = pager.get_page(0).unwrap();
        let data = page.read();
        assert_eq!(data[0], 0xAB);
        assert_eq!(data[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn test_no_frame_when_everything_is_pinned() {
        let dir = tempdir().unwrap();
        let pager = Arc::new(Pager::open(dir.path().join("full.db")).unwrap());

        let mut guards = Vec::new();
        for _ in 0..NUM_PAGES {
            let pn = pager.new_page();
            guards.push(pager.get_page(pn).unwrap());
        }
        let extra = pager.new_page();
        match pager.get_page(extra) {
            Err(KeystoneError::NoFrame) => {}
            other => panic!("expected NoFrame, got {other:?}"),
        }

        // Releasing one pin makes the frame reusable again.
        guards.pop();
        assert!(pager.get_page(extra).is_ok());
    }

    #[test]
    fn test_fifo_eviction_persists_dirty_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("evict.db");
        let pager = Arc::new(Pager::open(&path).unwrap());

        // Dirty twice as many pages as there are frames.
        for _ in 0..(2 * NUM_PAGES as i64) {
            let pn = pager.new_page();
            let page = pager.get_page(pn).unwrap();
            let mut data = page.write();
            data[..8].copy_from_slice(&pn.to_le_bytes());
        }
        pager.close().unwrap();
        drop(pager);

        let pager = Arc::new(Pager::open(&path).unwrap());
        assert_eq!(pager.num_pages(), 2 * NUM_PAGES as i64);
        for pn in 0..(2 * NUM_PAGES as i64) {
            let page = pager.get_page(pn).unwrap();
            let data = page.read();
            assert_eq!(i64::from_le_bytes(data[..8].try_into().unwrap()), pn);
        }
    }

    #[test]
    fn test_invalid_page_number() {
        let dir = tempdir().unwrap();
        let pager = Arc::new(Pager::open(dir.path().join("inv.db")).unwrap());
        assert!(matches!(
            pager.get_page(-1),
            Err(KeystoneError::InvalidPageNumber(-1))
        ));
        assert!(matches!(
            pager.get_page(7),
            Err(KeystoneError::InvalidPageNumber(7))
        ));
    }

    #[test]
    fn test_frame_conservation() {
        let dir = tempdir().unwrap();
        let pager = Arc::new(Pager::open(dir.path().join("cons.db")).unwrap());

        let count = |inner: &PagerInner| {
            inner.free.len() + inner.unpinned.len() + inner.pinned.len()
        };
        assert_eq!(count(&pager.inner.lock()), NUM_PAGES);

        let pn = pager.new_page();
        let guard = pager.get_page(pn).unwrap();
        {
            let inner = pager.inner.lock();
            assert_eq!(count(&inner), NUM_PAGES);
            assert_eq!(inner.pinned.len(), 1);
        }
        drop(guard);
        {
            let inner = pager.inner.lock();
            assert_eq!(count(&inner), NUM_PAGES);
            assert_eq!(inner.pinned.len(), 0);
            assert_eq!(inner.unpinned.len(), 1);
        }
    }

    #[test]
    fn test_open_rejects_torn_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.db");
        std::fs::write(&path, vec![0u8; PAGE_SIZE + 17]).unwrap();
        assert!(matches!(
            Pager::open(&path),
            Err(KeystoneError::CorruptDb(_))
        ));
    }
}
