//! Heap file storage for RookDB
//!
//! A heap file stores one table's tuples in slotted pages, addressed by RID
//! (page id, slot number). Inserts pick a page through a per-table free-space
//! map. An update that outgrows its page leaves a forwarding stub at the
//! original RID so index entries stay valid; the moved body is tagged so
//! scans do not yield it twice.

use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::buffer_pool::{BufferPoolManager, GlobalPageId};
use super::page::{Lsn, PageId, PageType};
use super::tuple::Tuple;
use crate::error::{Error, Result};

/// A row identifier (page_id, slot number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u16,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u16) -> Self {
        Self { page_id, slot }
    }
}

// Record flags: first byte of every stored record.
const FLAG_NORMAL: u8 = 0;
const FLAG_FORWARD: u8 = 1;
const FLAG_MOVED: u8 = 2;

fn encode_record(flag: u8, payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(1 + payload.len());
    record.push(flag);
    record.extend_from_slice(payload);
    record
}

fn encode_forward(target: Rid) -> Vec<u8> {
    let mut record = Vec::with_capacity(7);
    record.push(FLAG_FORWARD);
    record.extend_from_slice(&target.page_id.to_le_bytes());
    record.extend_from_slice(&target.slot.to_le_bytes());
    record
}

fn decode_forward(record: &[u8]) -> Result<Rid> {
    if record.len() < 7 {
        return Err(Error::Corrupted("forwarding stub truncated".to_string()));
    }
    Ok(Rid::new(
        u32::from_le_bytes(record[1..5].try_into().unwrap()),
        u16::from_le_bytes(record[5..7].try_into().unwrap()),
    ))
}

#[derive(Debug, Default)]
struct HeapState {
    /// Free bytes per data page, maintained on every mutation.
    free_space: BTreeMap<PageId, usize>,
    fsm_built: bool,
}

/// Heap file handle. Cheap to clone; clones share state through the buffer
/// pool and the free-space map.
#[derive(Debug, Clone)]
pub struct HeapFile {
    file_id: u32,
    pool: Arc<Mutex<BufferPoolManager>>,
    state: Arc<Mutex<HeapState>>,
}

impl HeapFile {
    pub fn new(file_id: u32, pool: Arc<Mutex<BufferPoolManager>>) -> Self {
        Self {
            file_id,
            pool,
            state: Arc::new(Mutex::new(HeapState::default())),
        }
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// The buffer pool this heap operates on.
    pub fn pool_handle(&self) -> Arc<Mutex<BufferPoolManager>> {
        self.pool.clone()
    }

    fn page_count(&self, pool: &MutexGuard<'_, BufferPoolManager>) -> Result<PageId> {
        Ok(pool.disk_manager().page_count(self.file_id)? as PageId)
    }

    /// Populate the free-space map by reading page headers once.
    fn ensure_fsm(
        &self,
        pool: &mut MutexGuard<'_, BufferPoolManager>,
        state: &mut HeapState,
    ) -> Result<()> {
        if state.fsm_built {
            return Ok(());
        }
        let count = self.page_count(pool)?;
        for pid in 1..count {
            let gid = GlobalPageId::new(self.file_id, pid);
            let idx = pool.fetch_page(gid)?;
            let free = pool.page(idx).free_space() + pool.page(idx).dead_space();
            pool.unpin_page(gid, false)?;
            state.free_space.insert(pid, free);
        }
        state.fsm_built = true;
        Ok(())
    }

    /// Insert a tuple, returning its RID.
    pub fn insert(&self, tuple: &Tuple) -> Result<Rid> {
        let record = encode_record(FLAG_NORMAL, &tuple.to_bytes());
        self.insert_record(&record)
    }

    fn insert_record(&self, record: &[u8]) -> Result<Rid> {
        let mut pool = self.pool.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        self.ensure_fsm(&mut pool, &mut state)?;

        let need = record.len() + 4;
        let candidate = state
            .free_space
            .iter()
            .find(|(_, &free)| free >= need)
            .map(|(&pid, _)| pid);

        if let Some(pid) = candidate {
            let gid = GlobalPageId::new(self.file_id, pid);
            let idx = pool.fetch_page(gid)?;
            let slot = pool.page_mut(idx).insert_record(record);
            let free = pool.page(idx).free_space() + pool.page(idx).dead_space();
            pool.unpin_page(gid, slot.is_some())?;
            state.free_space.insert(pid, free);
            if let Some(slot) = slot {
                return Ok(Rid::new(pid, slot));
            }
            // Stale map entry; fall through to a fresh page.
        }

        let (gid, idx) = pool.new_page(self.file_id, PageType::Heap)?;
        let slot = pool.page_mut(idx).insert_record(record).ok_or_else(|| {
            Error::ExecutionError("tuple larger than a page".to_string())
        });
        let free = pool.page(idx).free_space() + pool.page(idx).dead_space();
        pool.unpin_page(gid, true)?;
        state.free_space.insert(gid.page_id, free);
        Ok(Rid::new(gid.page_id, slot?))
    }

    /// Fetch the live tuple at `rid`, chasing one forwarding hop.
    pub fn get(&self, rid: Rid) -> Result<Option<Tuple>> {
        let mut pool = self.pool.lock().unwrap();
        let record = match self.read_record(&mut pool, rid)? {
            Some(r) => r,
            None => return Ok(None),
        };
        match record[0] {
            FLAG_NORMAL | FLAG_MOVED => Ok(Some(Tuple::from_bytes(&record[1..])?)),
            FLAG_FORWARD => {
                let target = decode_forward(&record)?;
                match self.read_record(&mut pool, target)? {
                    Some(r) if r[0] == FLAG_MOVED => Ok(Some(Tuple::from_bytes(&r[1..])?)),
                    _ => Err(Error::Corrupted(format!(
                        "dangling forwarding stub at page {} slot {}",
                        rid.page_id, rid.slot
                    ))),
                }
            }
            other => Err(Error::Corrupted(format!("unknown record flag {}", other))),
        }
    }

    fn read_record(
        &self,
        pool: &mut MutexGuard<'_, BufferPoolManager>,
        rid: Rid,
    ) -> Result<Option<Vec<u8>>> {
        let gid = GlobalPageId::new(self.file_id, rid.page_id);
        let idx = pool.fetch_page(gid)?;
        let record = pool.page(idx).get_record(rid.slot).map(|r| r.to_vec());
        pool.unpin_page(gid, false)?;
        Ok(record)
    }

    /// Update the tuple at `rid` in place, or move it and leave a forwarding
    /// stub at the original RID.
    pub fn update(&self, rid: Rid, tuple: &Tuple) -> Result<()> {
        let payload = tuple.to_bytes();
        let mut pool = self.pool.lock().unwrap();

        let stub = self.read_record(&mut pool, rid)?.ok_or_else(|| {
            Error::ExecutionError(format!(
                "update of missing tuple at page {} slot {}",
                rid.page_id, rid.slot
            ))
        })?;
        let (physical, flag) = match stub[0] {
            FLAG_NORMAL => (rid, FLAG_NORMAL),
            FLAG_FORWARD => (decode_forward(&stub)?, FLAG_MOVED),
            other => {
                return Err(Error::Corrupted(format!("unknown record flag {}", other)))
            }
        };

        // Try in place at the physical location first.
        let record = encode_record(flag, &payload);
        let gid = GlobalPageId::new(self.file_id, physical.page_id);
        let idx = pool.fetch_page(gid)?;
        let updated = pool.page_mut(idx).update_record(physical.slot, &record);
        let free = pool.page(idx).free_space() + pool.page(idx).dead_space();
        pool.unpin_page(gid, updated)?;
        self.state
            .lock()
            .unwrap()
            .free_space
            .insert(physical.page_id, free);
        if updated {
            return Ok(());
        }

        // Relocate: drop the old body, place the new one, point the original
        // slot at it.
        let idx = pool.fetch_page(gid)?;
        pool.page_mut(idx).delete_record(physical.slot);
        let free = pool.page(idx).free_space() + pool.page(idx).dead_space();
        pool.unpin_page(gid, true)?;
        self.state
            .lock()
            .unwrap()
            .free_space
            .insert(physical.page_id, free);
        drop(pool);

        let target = self.insert_record(&encode_record(FLAG_MOVED, &payload))?;

        let mut pool = self.pool.lock().unwrap();
        let origin = GlobalPageId::new(self.file_id, rid.page_id);
        let idx = pool.fetch_page(origin)?;
        let ok = pool
            .page_mut(idx)
            .update_record(rid.slot, &encode_forward(target));
        pool.unpin_page(origin, ok)?;
        if !ok {
            return Err(Error::ExecutionError(
                "failed to write forwarding stub".to_string(),
            ));
        }
        Ok(())
    }

    /// Delete the tuple at `rid` (and its moved body, if forwarded).
    pub fn delete(&self, rid: Rid) -> Result<()> {
        let mut pool = self.pool.lock().unwrap();
        let record = self.read_record(&mut pool, rid)?.ok_or_else(|| {
            Error::ExecutionError(format!(
                "delete of missing tuple at page {} slot {}",
                rid.page_id, rid.slot
            ))
        })?;

        let mut targets = vec![rid];
        if record[0] == FLAG_FORWARD {
            targets.push(decode_forward(&record)?);
        }
        for t in targets {
            let gid = GlobalPageId::new(self.file_id, t.page_id);
            let idx = pool.fetch_page(gid)?;
            pool.page_mut(idx).delete_record(t.slot);
            let free = pool.page(idx).free_space() + pool.page(idx).dead_space();
            pool.unpin_page(gid, true)?;
            self.state.lock().unwrap().free_space.insert(t.page_id, free);
        }
        Ok(())
    }

    /// Re-insert a tuple at its original RID (rollback of a delete). The
    /// slot is re-occupied in place when possible; otherwise the body goes
    /// elsewhere behind a forwarding stub, keeping the RID valid.
    pub fn restore_at(&self, rid: Rid, tuple: &Tuple) -> Result<()> {
        let record = encode_record(FLAG_NORMAL, &tuple.to_bytes());
        let mut pool = self.pool.lock().unwrap();
        let gid = GlobalPageId::new(self.file_id, rid.page_id);
        let idx = pool.fetch_page(gid)?;
        let ok = pool.page_mut(idx).restore_record(rid.slot, &record);
        let free = pool.page(idx).free_space() + pool.page(idx).dead_space();
        pool.unpin_page(gid, ok)?;
        self.state
            .lock()
            .unwrap()
            .free_space
            .insert(rid.page_id, free);
        if ok {
            return Ok(());
        }
        drop(pool);

        let payload = tuple.to_bytes();
        let target = self.insert_record(&encode_record(FLAG_MOVED, &payload))?;
        let mut pool = self.pool.lock().unwrap();
        let idx = pool.fetch_page(gid)?;
        let ok = pool
            .page_mut(idx)
            .restore_record(rid.slot, &encode_forward(target));
        pool.unpin_page(gid, ok)?;
        if !ok {
            return Err(Error::ExecutionError(
                "failed to restore tuple at its original location".to_string(),
            ));
        }
        Ok(())
    }

    /// Lazy full-table scan. One page is pinned at a time.
    pub fn scan(&self) -> HeapScan {
        HeapScan {
            heap: self.clone(),
            next_page: 1,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    pub fn page_lsn(&self, page_id: PageId) -> Result<Lsn> {
        let mut pool = self.pool.lock().unwrap();
        let gid = GlobalPageId::new(self.file_id, page_id);
        let idx = pool.fetch_page(gid)?;
        let lsn = pool.page(idx).lsn();
        pool.unpin_page(gid, false)?;
        Ok(lsn)
    }

    pub fn set_page_lsn(&self, page_id: PageId, lsn: Lsn) -> Result<()> {
        let mut pool = self.pool.lock().unwrap();
        let gid = GlobalPageId::new(self.file_id, page_id);
        let idx = pool.fetch_page(gid)?;
        pool.page_mut(idx).set_lsn(lsn);
        pool.unpin_page(gid, true)?;
        Ok(())
    }
}

/// Iterator over (RID, tuple) pairs of a heap file.
pub struct HeapScan {
    heap: HeapFile,
    next_page: PageId,
    buffer: VecDeque<(Rid, Tuple)>,
    done: bool,
}

impl HeapScan {
    fn fill_from_next_page(&mut self) -> Result<bool> {
        let mut pool = self.heap.pool.lock().unwrap();
        let count = self.heap.page_count(&pool)?;
        if self.next_page >= count {
            return Ok(false);
        }
        let pid = self.next_page;
        self.next_page += 1;

        let gid = GlobalPageId::new(self.heap.file_id, pid);
        let idx = pool.fetch_page(gid)?;
        let mut records = Vec::new();
        for slot in 0..pool.page(idx).slot_count() as u16 {
            if let Some(record) = pool.page(idx).get_record(slot) {
                records.push((slot, record.to_vec()));
            }
        }
        pool.unpin_page(gid, false)?;

        for (slot, record) in records {
            let rid = Rid::new(pid, slot);
            match record[0] {
                FLAG_NORMAL => {
                    self.buffer.push_back((rid, Tuple::from_bytes(&record[1..])?));
                }
                FLAG_FORWARD => {
                    let target = decode_forward(&record)?;
                    if let Some(body) = self.heap.read_record(&mut pool, target)? {
                        if body[0] == FLAG_MOVED {
                            self.buffer.push_back((rid, Tuple::from_bytes(&body[1..])?));
                        }
                    }
                }
                // Moved bodies are reported under their original RID.
                FLAG_MOVED => {}
                other => {
                    return Err(Error::Corrupted(format!("unknown record flag {}", other)))
                }
            }
        }
        Ok(true)
    }
}

impl Iterator for HeapScan {
    type Item = Result<(Rid, Tuple)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }
            if self.done {
                return None;
            }
            match self.fill_from_next_page() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::DiskManager;
    use crate::storage::Value;

    fn setup() -> (tempfile::TempDir, HeapFile) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().to_path_buf()));
        disk.register_file(1, "t.tbl");
        let pool = Arc::new(Mutex::new(BufferPoolManager::new(16, disk)));
        (dir, HeapFile::new(1, pool))
    }

    fn row(id: i32, name: &str) -> Tuple {
        Tuple::new(vec![Value::Int(id), Value::Str(name.to_string())])
    }

    #[test]
    fn test_insert_get() {
        let (_dir, heap) = setup();
        let rid = heap.insert(&row(1, "Ada")).unwrap();
        assert_eq!(heap.get(rid).unwrap(), Some(row(1, "Ada")));
    }

    #[test]
    fn test_delete() {
        let (_dir, heap) = setup();
        let rid = heap.insert(&row(1, "Ada")).unwrap();
        heap.delete(rid).unwrap();
        assert_eq!(heap.get(rid).unwrap(), None);
        assert!(heap.delete(rid).is_err());
    }

    #[test]
    fn test_update_in_place() {
        let (_dir, heap) = setup();
        let rid = heap.insert(&row(1, "Ada")).unwrap();
        heap.update(rid, &row(1, "Bob")).unwrap();
        assert_eq!(heap.get(rid).unwrap(), Some(row(1, "Bob")));
    }

    #[test]
    fn test_update_moves_with_forwarding() {
        let (_dir, heap) = setup();
        // Fill the first page almost completely so a grown tuple must move.
        let filler = "x".repeat(500);
        let mut rids = Vec::new();
        for i in 0..7 {
            rids.push(heap.insert(&row(i, &filler)).unwrap());
        }
        let victim = rids[0];
        let grown = row(0, &"y".repeat(1200));
        heap.update(victim, &grown).unwrap();

        // Still addressable under the original RID.
        assert_eq!(heap.get(victim).unwrap(), Some(grown.clone()));

        // The scan reports it once, under the original RID.
        let seen: Vec<(Rid, Tuple)> = heap.scan().map(|r| r.unwrap()).collect();
        assert_eq!(seen.len(), 7);
        let hit = seen.iter().filter(|(r, _)| *r == victim).count();
        assert_eq!(hit, 1);
        assert!(seen.iter().any(|(_, t)| *t == grown));

        // Deleting through the stub removes both pieces.
        heap.delete(victim).unwrap();
        assert_eq!(heap.get(victim).unwrap(), None);
        assert_eq!(heap.scan().count(), 6);
    }

    #[test]
    fn test_scan_spans_pages() {
        let (_dir, heap) = setup();
        for i in 0..200 {
            heap.insert(&row(i, "somewhat-long-name-padding")).unwrap();
        }
        let rows: Vec<_> = heap.scan().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 200);
        // Pins all returned.
        assert_eq!(heap.pool.lock().unwrap().total_pins(), 0);
    }

    #[test]
    fn test_deleted_space_reused() {
        let (_dir, heap) = setup();
        let rid = heap.insert(&row(1, &"z".repeat(1000))).unwrap();
        heap.delete(rid).unwrap();
        // The freed space is found again by the free-space map.
        let rid2 = heap.insert(&row(2, &"w".repeat(1000))).unwrap();
        assert_eq!(rid.page_id, rid2.page_id);
    }
}
