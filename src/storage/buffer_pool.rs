//! Buffer pool manager for RookDB
//!
//! A fixed-capacity cache of page frames in front of the disk manager.
//! Frames are pinned while in use and evicted by a clock (second-chance)
//! replacer restricted to unpinned frames. Before a dirty page is written
//! back, the write-ahead log is forced up to that page's LSN.

use std::collections::HashMap;
use std::sync::Arc;

use super::disk::DiskManager;
use super::page::{Page, PageId, PageType, PAGE_SIZE};
use super::wal::LogManager;
use crate::error::{Error, Result};
use crate::storage::replacer::ClockReplacer;

/// A global page identifier (file_id, page_id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalPageId {
    pub file_id: u32,
    pub page_id: PageId,
}

impl GlobalPageId {
    pub fn new(file_id: u32, page_id: PageId) -> Self {
        Self { file_id, page_id }
    }
}

/// One buffer frame: a resident page plus replacement state.
#[derive(Debug)]
pub struct Frame {
    pub page: Page,
    pub gid: Option<GlobalPageId>,
    pub ref_bit: bool,
}

/// Buffer pool manager
#[derive(Debug)]
pub struct BufferPoolManager {
    frames: Vec<Frame>,
    /// Page table: GlobalPageId -> frame index
    page_table: HashMap<GlobalPageId, usize>,
    /// Indices of never-used frames
    free_list: Vec<usize>,
    replacer: ClockReplacer,
    disk: Arc<DiskManager>,
    /// Forced before any dirty page write (write-ahead rule).
    wal: Option<Arc<LogManager>>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk: Arc<DiskManager>) -> Self {
        let frames = (0..pool_size)
            .map(|_| Frame {
                page: Page::new(0, PageType::Heap),
                gid: None,
                ref_bit: false,
            })
            .collect();
        Self {
            frames,
            page_table: HashMap::new(),
            free_list: (0..pool_size).rev().collect(),
            replacer: ClockReplacer::new(pool_size),
            disk,
            wal: None,
        }
    }

    /// Couple the pool to the log manager so flushes respect invariant
    /// "log first, page second".
    pub fn attach_wal(&mut self, wal: Arc<LogManager>) {
        self.wal = Some(wal);
    }

    pub fn disk_manager(&self) -> Arc<DiskManager> {
        self.disk.clone()
    }

    /// Fetch a page, pinning its frame. Reads from disk on a miss.
    pub fn fetch_page(&mut self, gid: GlobalPageId) -> Result<usize> {
        if let Some(&idx) = self.page_table.get(&gid) {
            self.frames[idx].page.pin();
            self.frames[idx].ref_bit = true;
            return Ok(idx);
        }

        let idx = self.take_victim()?;

        let mut buf = vec![0u8; PAGE_SIZE];
        let fresh = self.disk.read_page(gid.file_id, gid.page_id, &mut buf)?;
        let page = if fresh {
            // Allocated but never written: materialize as an empty heap page
            // rather than failing header validation on zeroes.
            Page::new(gid.page_id, PageType::Heap)
        } else {
            Page::from_bytes(gid.page_id, &buf)?
        };

        let frame = &mut self.frames[idx];
        frame.page = page;
        frame.gid = Some(gid);
        frame.ref_bit = true;
        frame.page.pin();
        self.page_table.insert(gid, idx);
        Ok(idx)
    }

    /// Allocate a fresh page on disk and pin it, zero-initialized with the
    /// given page type.
    pub fn new_page(&mut self, file_id: u32, page_type: PageType) -> Result<(GlobalPageId, usize)> {
        let page_id = self.disk.allocate_page(file_id)?;
        let gid = GlobalPageId::new(file_id, page_id);

        let idx = self.take_victim()?;
        let frame = &mut self.frames[idx];
        frame.page = Page::new(page_id, page_type);
        frame.page.mark_dirty();
        frame.page.pin();
        frame.gid = Some(gid);
        frame.ref_bit = true;
        self.page_table.insert(gid, idx);
        Ok((gid, idx))
    }

    /// Drop a page from the pool and return it to the disk free list.
    /// The page must be unpinned.
    pub fn delete_page(&mut self, gid: GlobalPageId) -> Result<()> {
        if let Some(idx) = self.page_table.remove(&gid) {
            if self.frames[idx].page.pin_count() > 0 {
                self.page_table.insert(gid, idx);
                return Err(Error::Internal(format!(
                    "cannot delete pinned page {}",
                    gid.page_id
                )));
            }
            self.frames[idx].gid = None;
            self.frames[idx].page.clear_dirty();
            self.free_list.push(idx);
        }
        self.disk.free_page(gid.file_id, gid.page_id)
    }

    /// Decrement the pin count; set the dirty bit if requested.
    pub fn unpin_page(&mut self, gid: GlobalPageId, dirty: bool) -> Result<()> {
        let idx = *self
            .page_table
            .get(&gid)
            .ok_or_else(|| Error::Internal("unpin of non-resident page".to_string()))?;
        if dirty {
            self.frames[idx].page.mark_dirty();
        }
        self.frames[idx].page.unpin();
        Ok(())
    }

    pub fn page(&self, idx: usize) -> &Page {
        &self.frames[idx].page
    }

    pub fn page_mut(&mut self, idx: usize) -> &mut Page {
        &mut self.frames[idx].page
    }

    /// Force-write one page through the disk manager.
    pub fn flush_page(&mut self, gid: GlobalPageId) -> Result<()> {
        if let Some(&idx) = self.page_table.get(&gid) {
            self.flush_frame(idx)?;
        }
        Ok(())
    }

    /// Flush every resident dirty page (checkpoint / shutdown path).
    pub fn flush_all(&mut self) -> Result<()> {
        for idx in 0..self.frames.len() {
            self.flush_frame(idx)?;
        }
        Ok(())
    }

    fn flush_frame(&mut self, idx: usize) -> Result<()> {
        let (gid, lsn) = match (&self.frames[idx].gid, &self.frames[idx].page) {
            (Some(gid), page) if page.is_dirty() => (*gid, page.lsn()),
            _ => return Ok(()),
        };
        if let Some(wal) = &self.wal {
            wal.flush_up_to(lsn)?;
        }
        self.frames[idx].page.update_checksum();
        self.disk
            .write_page(gid.file_id, gid.page_id, self.frames[idx].page.to_bytes())?;
        self.frames[idx].page.clear_dirty();
        Ok(())
    }

    fn take_victim(&mut self) -> Result<usize> {
        if let Some(idx) = self.free_list.pop() {
            return Ok(idx);
        }
        let idx = self
            .replacer
            .victim(&mut self.frames)
            .ok_or(Error::BufferExhausted)?;
        self.flush_frame(idx)?;
        if let Some(old) = self.frames[idx].gid.take() {
            self.page_table.remove(&old);
        }
        Ok(idx)
    }

    /// Sum of pin counts over all frames. After a top-level statement this
    /// must be zero; tests rely on it to detect pin leaks.
    pub fn total_pins(&self) -> u32 {
        self.frames.iter().map(|f| f.page.pin_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn setup(pool_size: usize) -> (tempfile::TempDir, BufferPoolManager) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().to_path_buf()));
        disk.register_file(1, "t.tbl");
        (dir, BufferPoolManager::new(pool_size, disk))
    }

    #[test]
    fn test_new_page_and_fetch() {
        let (_dir, mut pool) = setup(4);
        let (gid, idx) = pool.new_page(1, PageType::Heap).unwrap();
        pool.page_mut(idx).insert_record(b"payload").unwrap();
        pool.unpin_page(gid, true).unwrap();

        let idx = pool.fetch_page(gid).unwrap();
        assert_eq!(pool.page(idx).get_record(0), Some(&b"payload"[..]));
        pool.unpin_page(gid, false).unwrap();
        assert_eq!(pool.total_pins(), 0);
    }

    #[test]
    fn test_eviction_roundtrip() {
        let (_dir, mut pool) = setup(2);
        let mut gids = Vec::new();
        for i in 0..4u8 {
            let (gid, idx) = pool.new_page(1, PageType::Heap).unwrap();
            pool.page_mut(idx).insert_record(&[i; 16]).unwrap();
            pool.unpin_page(gid, true).unwrap();
            gids.push(gid);
        }
        // All four pages went through a two-frame pool; the first two were
        // evicted and must come back from disk intact.
        for (i, gid) in gids.iter().enumerate() {
            let idx = pool.fetch_page(*gid).unwrap();
            assert_eq!(pool.page(idx).get_record(0), Some(&[i as u8; 16][..]));
            pool.unpin_page(*gid, false).unwrap();
        }
    }

    #[test]
    fn test_buffer_exhausted_when_all_pinned() {
        let (_dir, mut pool) = setup(2);
        let (_g1, _) = pool.new_page(1, PageType::Heap).unwrap();
        let (_g2, _) = pool.new_page(1, PageType::Heap).unwrap();
        // Both frames pinned: no victim.
        let err = pool.new_page(1, PageType::Heap);
        assert!(matches!(err, Err(Error::BufferExhausted)));
    }

    #[test]
    fn test_delete_page_recycles_id() {
        let (_dir, mut pool) = setup(4);
        let (gid, _) = pool.new_page(1, PageType::Heap).unwrap();
        pool.unpin_page(gid, false).unwrap();
        pool.delete_page(gid).unwrap();
        let (gid2, _) = pool.new_page(1, PageType::Heap).unwrap();
        assert_eq!(gid2.page_id, gid.page_id);
        pool.unpin_page(gid2, false).unwrap();
    }

    #[test]
    fn test_delete_pinned_page_fails() {
        let (_dir, mut pool) = setup(4);
        let (gid, _) = pool.new_page(1, PageType::Heap).unwrap();
        assert!(pool.delete_page(gid).is_err());
        pool.unpin_page(gid, false).unwrap();
    }

    #[test]
    fn test_shared_via_mutex() {
        // The pool is shared as Arc<Mutex<..>> across heap and index handles.
        let (_dir, pool) = setup(4);
        let pool = Arc::new(Mutex::new(pool));
        let clone = pool.clone();
        let (gid, _) = clone.lock().unwrap().new_page(1, PageType::Heap).unwrap();
        pool.lock().unwrap().unpin_page(gid, false).unwrap();
    }
}
