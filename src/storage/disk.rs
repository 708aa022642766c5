//! Disk manager for RookDB
//!
//! Owns the backing files of one database directory: heap files, index files
//! and the catalog live side by side, each addressed by a file id. Page 0 of
//! every file is a meta page holding the free-list head and one user slot
//! (heap files: unused; index files: the B+ tree root page id). Freed pages
//! chain through their first four bytes.

use crate::error::{Error, Result};
use crate::storage::page::{page_checksum, PageId, PAGE_CHECKSUM_OFFSET, PAGE_SIZE};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const META_FREE_HEAD: u64 = 0;
const META_USER_SLOT: u64 = 4;

/// Disk manager
#[derive(Debug)]
pub struct DiskManager {
    /// Mapping from file id to its path
    paths: Mutex<HashMap<u32, PathBuf>>,
    /// Open file handles
    files: Mutex<HashMap<u32, File>>,
    /// Directory where data files are stored
    data_dir: PathBuf,
}

impl DiskManager {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            paths: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            data_dir,
        }
    }

    /// Bind a file id to a file name under the data directory.
    pub fn register_file(&self, file_id: u32, name: impl AsRef<Path>) {
        let mut paths = self.paths.lock().unwrap();
        paths.insert(file_id, self.data_dir.join(name.as_ref()));
    }

    /// Close the handle and delete the backing file (DROP TABLE / DROP INDEX).
    pub fn remove_file(&self, file_id: u32) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        files.remove(&file_id);
        let paths = self.paths.lock().unwrap();
        if let Some(path) = paths.get(&file_id) {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Read one page into `buf`. A short read (the page was allocated but
    /// never written) zero-pads the buffer and returns `true` so callers can
    /// distinguish fresh pages from corruption; a full read whose stored
    /// header checksum does not match the image fails.
    pub fn read_page(&self, file_id: u32, page_id: PageId, buf: &mut [u8]) -> Result<bool> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let mut files = self.files.lock().unwrap();
        let file = self.file_mut(&mut files, file_id)?;
        let offset = page_id as u64 * PAGE_SIZE as u64;
        let len = file.metadata()?.len();
        if offset >= len {
            buf.fill(0);
            return Ok(true);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < PAGE_SIZE {
            match file.read(&mut buf[read..])? {
                0 => break,
                n => read += n,
            }
        }
        if read < PAGE_SIZE {
            buf[read..].fill(0);
            return Ok(true);
        }
        // A stored checksum of 0 means the page was never stamped
        // (zero-initialized at allocation); anything else must match.
        let stored = u32::from_le_bytes(
            buf[PAGE_CHECKSUM_OFFSET..PAGE_CHECKSUM_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        if stored != 0 && page_checksum(buf) != stored {
            return Err(Error::ChecksumMismatch(page_id));
        }
        Ok(false)
    }

    /// Write one page. Short writes surface as I/O errors.
    pub fn write_page(&self, file_id: u32, page_id: PageId, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let mut files = self.files.lock().unwrap();
        let file = self.file_mut(&mut files, file_id)?;
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        file.write_all(buf)?;
        Ok(())
    }

    /// Allocate a page: pop the persistent free list, otherwise extend the
    /// file. Page ids are dense per file; page 0 is never handed out.
    pub fn allocate_page(&self, file_id: u32) -> Result<PageId> {
        let mut files = self.files.lock().unwrap();
        let file = self.file_mut(&mut files, file_id)?;

        let head = read_u32_at(file, META_FREE_HEAD)?;
        if head != 0 {
            let next = read_u32_at(file, head as u64 * PAGE_SIZE as u64)?;
            write_u32_at(file, META_FREE_HEAD, next)?;
            // Hand the page back zeroed.
            file.seek(SeekFrom::Start(head as u64 * PAGE_SIZE as u64))?;
            file.write_all(&[0u8; PAGE_SIZE])?;
            return Ok(head);
        }

        let len = file.metadata()?.len();
        let page_id = (len / PAGE_SIZE as u64) as PageId;
        file.seek(SeekFrom::End(0))?;
        file.write_all(&[0u8; PAGE_SIZE])?;
        Ok(page_id)
    }

    /// Return a page to the file's free list.
    pub fn free_page(&self, file_id: u32, page_id: PageId) -> Result<()> {
        if page_id == 0 {
            return Err(Error::Internal("cannot free the meta page".to_string()));
        }
        let mut files = self.files.lock().unwrap();
        let file = self.file_mut(&mut files, file_id)?;
        let head = read_u32_at(file, META_FREE_HEAD)?;
        write_u32_at(file, page_id as u64 * PAGE_SIZE as u64, head)?;
        write_u32_at(file, META_FREE_HEAD, page_id)?;
        Ok(())
    }

    /// Number of pages in the file, the meta page included.
    pub fn page_count(&self, file_id: u32) -> Result<u64> {
        let mut files = self.files.lock().unwrap();
        let file = self.file_mut(&mut files, file_id)?;
        Ok(file.metadata()?.len() / PAGE_SIZE as u64)
    }

    /// Read the per-file user meta slot (e.g. a B+ tree root page id).
    pub fn user_meta(&self, file_id: u32) -> Result<u32> {
        let mut files = self.files.lock().unwrap();
        let file = self.file_mut(&mut files, file_id)?;
        read_u32_at(file, META_USER_SLOT)
    }

    /// Write the per-file user meta slot.
    pub fn set_user_meta(&self, file_id: u32, value: u32) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let file = self.file_mut(&mut files, file_id)?;
        write_u32_at(file, META_USER_SLOT, value)
    }

    /// Force file contents to stable storage.
    pub fn sync(&self, file_id: u32) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let file = self.file_mut(&mut files, file_id)?;
        file.sync_all()?;
        Ok(())
    }

    fn file_mut<'a>(
        &self,
        files: &'a mut HashMap<u32, File>,
        file_id: u32,
    ) -> Result<&'a mut File> {
        if !files.contains_key(&file_id) {
            let path = {
                let paths = self.paths.lock().unwrap();
                paths
                    .get(&file_id)
                    .cloned()
                    .unwrap_or_else(|| self.data_dir.join(format!("file_{}.dat", file_id)))
            };
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?;
            // A brand-new file gets its meta page immediately.
            if file.metadata()?.len() < PAGE_SIZE as u64 {
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&[0u8; PAGE_SIZE])?;
            }
            files.insert(file_id, file);
        }
        Ok(files.get_mut(&file_id).unwrap())
    }
}

fn read_u32_at(file: &mut File, offset: u64) -> Result<u32> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_u32_at(file: &mut File, offset: u64, value: u32) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&value.to_le_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, DiskManager) {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskManager::new(dir.path().to_path_buf());
        disk.register_file(1, "test.tbl");
        (dir, disk)
    }

    #[test]
    fn test_allocate_dense() {
        let (_dir, disk) = setup();
        assert_eq!(disk.allocate_page(1).unwrap(), 1);
        assert_eq!(disk.allocate_page(1).unwrap(), 2);
        assert_eq!(disk.page_count(1).unwrap(), 3);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (_dir, disk) = setup();
        let pid = disk.allocate_page(1).unwrap();
        let mut page = vec![0u8; PAGE_SIZE];
        page[100] = 0xAB;
        disk.write_page(1, pid, &page).unwrap();

        let mut buf = vec![0u8; PAGE_SIZE];
        let fresh = disk.read_page(1, pid, &mut buf).unwrap();
        assert!(!fresh);
        assert_eq!(buf[100], 0xAB);
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        use crate::storage::page::{Page, PageType};
        use std::io::{Seek, SeekFrom, Write};

        let dir = tempfile::tempdir().unwrap();
        let disk = DiskManager::new(dir.path().to_path_buf());
        disk.register_file(1, "t.tbl");

        let pid = disk.allocate_page(1).unwrap();
        let mut page = Page::new(pid, PageType::Heap);
        page.insert_record(b"important bytes").unwrap();
        page.update_checksum();
        disk.write_page(1, pid, page.to_bytes()).unwrap();

        // A stamped page reads back clean.
        let mut buf = vec![0u8; PAGE_SIZE];
        assert!(!disk.read_page(1, pid, &mut buf).unwrap());

        // Flip one payload byte behind the disk manager's back.
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("t.tbl"))
            .unwrap();
        file.seek(SeekFrom::Start(pid as u64 * PAGE_SIZE as u64 + 2000))
            .unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        let err = disk.read_page(1, pid, &mut buf);
        assert!(matches!(err, Err(Error::ChecksumMismatch(p)) if p == pid));
    }

    #[test]
    fn test_short_read_is_fresh() {
        let (_dir, disk) = setup();
        let mut buf = vec![0xFFu8; PAGE_SIZE];
        // Page 9 was never allocated.
        let fresh = disk.read_page(1, 9, &mut buf).unwrap();
        assert!(fresh);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_free_list_recycles() {
        let (_dir, disk) = setup();
        let a = disk.allocate_page(1).unwrap();
        let b = disk.allocate_page(1).unwrap();
        disk.free_page(1, a).unwrap();
        disk.free_page(1, b).unwrap();
        // LIFO: last freed comes back first.
        assert_eq!(disk.allocate_page(1).unwrap(), b);
        assert_eq!(disk.allocate_page(1).unwrap(), a);
        // List drained: extends the file again.
        assert_eq!(disk.allocate_page(1).unwrap(), 3);
    }

    #[test]
    fn test_free_list_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let disk = DiskManager::new(dir.path().to_path_buf());
            disk.register_file(1, "t.tbl");
            let a = disk.allocate_page(1).unwrap();
            let _b = disk.allocate_page(1).unwrap();
            disk.free_page(1, a).unwrap();
            disk.sync(1).unwrap();
        }
        let disk = DiskManager::new(dir.path().to_path_buf());
        disk.register_file(1, "t.tbl");
        assert_eq!(disk.allocate_page(1).unwrap(), 1);
    }

    #[test]
    fn test_user_meta() {
        let (_dir, disk) = setup();
        assert_eq!(disk.user_meta(1).unwrap(), 0);
        disk.set_user_meta(1, 77).unwrap();
        assert_eq!(disk.user_meta(1).unwrap(), 77);
    }

    #[test]
    fn test_cannot_free_meta_page() {
        let (_dir, disk) = setup();
        assert!(disk.free_page(1, 0).is_err());
    }
}
