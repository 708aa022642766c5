//! B+ Tree index for RookDB
//!
//! A paged B+ tree over the buffer pool. Entries are ordered by (key, RID)
//! so duplicate keys in non-unique indexes stay totally ordered. Leaves form
//! a doubly-linked list for ordered range scans. Inserts split at the median
//! and propagate upward; deletes borrow from a sibling before merging, and
//! the root contracts when it reaches a single child.
//!
//! The root page id is persisted in the index file's meta page, so an index
//! survives restarts without a rebuild.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::buffer_pool::{BufferPoolManager, GlobalPageId};
use super::btree_node::{BTreeNode, Entry, IndexKey, MAX_KEY_BYTES};
use super::heap::Rid;
use super::page::{PageId, PageType, INVALID_PAGE_ID, PAGE_SIZE};
use crate::catalog::types::DataType;
use crate::error::{Error, Result};

/// Derive the node order (max entries per node) from the key column types.
pub fn order_for(key_types: &[DataType]) -> usize {
    let key_width = 1 + key_types
        .iter()
        .map(|t| t.key_width_bound())
        .sum::<usize>();
    // len prefix + key + rid + child pointer (internal worst case)
    let entry_width = 2 + key_width + 6 + 4;
    ((PAGE_SIZE - 80) / entry_width).clamp(4, 200)
}

/// B+ tree index handle. Cheap to clone; clones share the root through an
/// `Arc` so structural changes are visible to every holder.
#[derive(Debug, Clone)]
pub struct BTreeIndex {
    name: String,
    file_id: u32,
    unique: bool,
    order: usize,
    root: Arc<Mutex<PageId>>,
    pool: Arc<Mutex<BufferPoolManager>>,
}

impl BTreeIndex {
    /// Create a fresh index: an empty leaf root, recorded in the file meta.
    pub fn create(
        name: impl Into<String>,
        file_id: u32,
        unique: bool,
        order: usize,
        pool: Arc<Mutex<BufferPoolManager>>,
    ) -> Result<Self> {
        let root_pid = {
            let mut guard = pool.lock().unwrap();
            let pid = alloc_node(&mut guard, file_id, &BTreeNode::empty_leaf())?;
            guard.disk_manager().set_user_meta(file_id, pid)?;
            pid
        };
        Ok(Self {
            name: name.into(),
            file_id,
            unique,
            order,
            root: Arc::new(Mutex::new(root_pid)),
            pool,
        })
    }

    /// Open an existing index, reading the root from the file meta page.
    /// Creates the empty root if the file is brand new.
    pub fn open(
        name: impl Into<String>,
        file_id: u32,
        unique: bool,
        order: usize,
        pool: Arc<Mutex<BufferPoolManager>>,
    ) -> Result<Self> {
        let root_pid = {
            let guard = pool.lock().unwrap();
            guard.disk_manager().user_meta(file_id)?
        };
        if root_pid == 0 {
            return Self::create(name, file_id, unique, order, pool);
        }
        Ok(Self {
            name: name.into(),
            file_id,
            unique,
            order,
            root: Arc::new(Mutex::new(root_pid)),
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root.lock().unwrap()
    }

    fn min_entries(&self) -> usize {
        (self.order + 1) / 2
    }

    /// Point lookup: the RID of the first (leftmost) entry matching `key`.
    pub fn search(&self, key: &IndexKey) -> Result<Option<Rid>> {
        let mut iter = self.range(Some((key.clone(), true)), Some((key.clone(), true)))?;
        match iter.next() {
            Some(Ok((_, rid))) => Ok(Some(rid)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// True if any entry carries `key`.
    pub fn contains_key(&self, key: &IndexKey) -> Result<bool> {
        Ok(self.search(key)?.is_some())
    }

    /// Ordered range scan over [low, high]; each bound carries its own
    /// inclusiveness flag. RIDs are yielded lazily, one leaf at a time.
    pub fn range(
        &self,
        low: Option<(IndexKey, bool)>,
        high: Option<(IndexKey, bool)>,
    ) -> Result<BTreeRangeIter> {
        let start_leaf = {
            let mut pool = self.pool.lock().unwrap();
            match &low {
                Some((key, _)) => {
                    let target = Entry::new(key.clone(), Rid::new(0, 0));
                    self.descend(&mut pool, &target)?.0
                }
                None => self.leftmost_leaf(&mut pool)?,
            }
        };
        Ok(BTreeRangeIter {
            index: self.clone(),
            next_leaf: start_leaf,
            pending: VecDeque::new(),
            low,
            high,
            done: false,
        })
    }

    /// Full ordered scan.
    pub fn scan_all(&self) -> Result<BTreeRangeIter> {
        self.range(None, None)
    }

    /// Insert an entry. Unique indexes reject an already-present key.
    pub fn insert(&self, key: IndexKey, rid: Rid) -> Result<()> {
        if key.to_bytes().len() > MAX_KEY_BYTES {
            return Err(Error::ValueTooLarge(format!("index key in '{}'", self.name)));
        }
        if self.unique && self.contains_key(&key)? {
            return Err(Error::UniqueViolation(self.name.clone()));
        }

        let target = Entry::new(key, rid);
        let mut pool = self.pool.lock().unwrap();
        let (leaf_pid, mut node, path) = self.descend(&mut pool, &target)?;

        let entries = match &mut node {
            BTreeNode::Leaf { entries, .. } => entries,
            _ => unreachable!("descend ends at a leaf"),
        };
        let pos = entries.partition_point(|e| e.compare(&target) == std::cmp::Ordering::Less);
        if entries.get(pos).map(|e| e == &target).unwrap_or(false) {
            return Err(Error::Internal(format!(
                "duplicate (key, rid) entry in index '{}'",
                self.name
            )));
        }
        entries.insert(pos, target);

        if node.entry_count() > self.order {
            self.split_leaf(&mut pool, leaf_pid, node, path)
        } else {
            write_node(&mut pool, self.file_id, leaf_pid, &node)
        }
    }

    /// Delete the exact (key, RID) pair. Returns false if it was not present.
    pub fn delete(&self, key: &IndexKey, rid: Rid) -> Result<bool> {
        let target = Entry::new(key.clone(), rid);
        let mut pool = self.pool.lock().unwrap();
        let (leaf_pid, mut node, path) = self.descend(&mut pool, &target)?;

        {
            let entries = match &mut node {
                BTreeNode::Leaf { entries, .. } => entries,
                _ => unreachable!(),
            };
            let pos = entries.partition_point(|e| e.compare(&target) == std::cmp::Ordering::Less);
            if entries.get(pos).map(|e| e != &target).unwrap_or(true) {
                return Ok(false);
            }
            entries.remove(pos);
        }
        write_node(&mut pool, self.file_id, leaf_pid, &node)?;

        if node.entry_count() < self.min_entries() {
            self.rebalance(&mut pool, path, leaf_pid)?;
        }
        Ok(true)
    }

    // ---- descent ----

    /// Walk from the root to the leaf owning `target`. Returns the leaf page
    /// id, its decoded node, and the internal page ids along the path
    /// (root first).
    fn descend(
        &self,
        pool: &mut MutexGuard<'_, BufferPoolManager>,
        target: &Entry,
    ) -> Result<(PageId, BTreeNode, Vec<PageId>)> {
        let mut pid = *self.root.lock().unwrap();
        let mut path = Vec::new();
        loop {
            let node = read_node(pool, self.file_id, pid)?;
            match node {
                BTreeNode::Internal {
                    ref entries,
                    ref children,
                    ..
                } => {
                    // Separators are inclusive lower bounds of their right
                    // subtree: equal goes right.
                    let idx = entries
                        .partition_point(|e| e.compare(target) != std::cmp::Ordering::Greater);
                    path.push(pid);
                    pid = children[idx];
                }
                BTreeNode::Leaf { .. } => return Ok((pid, node, path)),
            }
        }
    }

    fn leftmost_leaf(&self, pool: &mut MutexGuard<'_, BufferPoolManager>) -> Result<PageId> {
        let mut pid = *self.root.lock().unwrap();
        loop {
            match read_node(pool, self.file_id, pid)? {
                BTreeNode::Internal { children, .. } => pid = children[0],
                BTreeNode::Leaf { .. } => return Ok(pid),
            }
        }
    }

    // ---- split ----

    fn split_leaf(
        &self,
        pool: &mut MutexGuard<'_, BufferPoolManager>,
        leaf_pid: PageId,
        mut node: BTreeNode,
        path: Vec<PageId>,
    ) -> Result<()> {
        let (parent, next, right_entries) = match &mut node {
            BTreeNode::Leaf {
                parent,
                next,
                entries,
                ..
            } => {
                // Odd counts keep the extra entry on the left; the promoted
                // key is the right sibling's lower bound.
                let mid = (entries.len() + 1) / 2;
                (*parent, *next, entries.split_off(mid))
            }
            _ => unreachable!(),
        };
        let separator = right_entries[0].clone();
        let right = BTreeNode::Leaf {
            parent,
            prev: leaf_pid,
            next,
            entries: right_entries,
        };
        let right_pid = alloc_node(pool, self.file_id, &right)?;

        if next != INVALID_PAGE_ID {
            let mut successor = read_node(pool, self.file_id, next)?;
            if let BTreeNode::Leaf { prev, .. } = &mut successor {
                *prev = right_pid;
            }
            write_node(pool, self.file_id, next, &successor)?;
        }
        if let BTreeNode::Leaf { next, .. } = &mut node {
            *next = right_pid;
        }
        write_node(pool, self.file_id, leaf_pid, &node)?;

        self.insert_into_parent(pool, path, leaf_pid, separator, right_pid)
    }

    fn insert_into_parent(
        &self,
        pool: &mut MutexGuard<'_, BufferPoolManager>,
        mut path: Vec<PageId>,
        left_pid: PageId,
        separator: Entry,
        right_pid: PageId,
    ) -> Result<()> {
        let parent_pid = match path.pop() {
            None => {
                // The split node was the root: grow a new one.
                let new_root = BTreeNode::Internal {
                    parent: INVALID_PAGE_ID,
                    entries: vec![separator],
                    children: vec![left_pid, right_pid],
                };
                let root_pid = alloc_node(pool, self.file_id, &new_root)?;
                self.set_parent(pool, left_pid, root_pid)?;
                self.set_parent(pool, right_pid, root_pid)?;
                return self.set_root(pool, root_pid);
            }
            Some(pid) => pid,
        };

        self.set_parent(pool, right_pid, parent_pid)?;
        let mut parent = read_node(pool, self.file_id, parent_pid)?;
        let (grand, promoted_split) = match &mut parent {
            BTreeNode::Internal {
                parent: grand,
                entries,
                children,
            } => {
                let idx = entries
                    .partition_point(|e| e.compare(&separator) == std::cmp::Ordering::Less);
                entries.insert(idx, separator);
                children.insert(idx + 1, right_pid);

                if entries.len() <= self.order {
                    (*grand, None)
                } else {
                    // The middle entry moves up rather than being copied.
                    let mid = entries.len() / 2;
                    let right_entries = entries.split_off(mid + 1);
                    let promoted = entries.pop().expect("mid entry");
                    let right_children = children.split_off(mid + 1);
                    (*grand, Some((promoted, right_entries, right_children)))
                }
            }
            _ => unreachable!("path holds internal nodes"),
        };

        match promoted_split {
            None => write_node(pool, self.file_id, parent_pid, &parent),
            Some((promoted, right_entries, right_children)) => {
                let moved = right_children.clone();
                let new_right = BTreeNode::Internal {
                    parent: grand,
                    entries: right_entries,
                    children: right_children,
                };
                let new_right_pid = alloc_node(pool, self.file_id, &new_right)?;
                for child in moved {
                    self.set_parent(pool, child, new_right_pid)?;
                }
                write_node(pool, self.file_id, parent_pid, &parent)?;
                self.insert_into_parent(pool, path, parent_pid, promoted, new_right_pid)
            }
        }
    }

    // ---- rebalance ----

    fn rebalance(
        &self,
        pool: &mut MutexGuard<'_, BufferPoolManager>,
        mut path: Vec<PageId>,
        node_pid: PageId,
    ) -> Result<()> {
        let node = read_node(pool, self.file_id, node_pid)?;

        let parent_pid = match path.last() {
            None => {
                // The root: contract when an internal root runs out of
                // separators; an empty leaf root is the empty tree.
                if let BTreeNode::Internal { entries, children, .. } = &node {
                    if entries.is_empty() {
                        let child = children[0];
                        self.set_parent(pool, child, INVALID_PAGE_ID)?;
                        self.set_root(pool, child)?;
                        pool.delete_page(GlobalPageId::new(self.file_id, node_pid))?;
                    }
                }
                return Ok(());
            }
            Some(&pid) => pid,
        };

        if node.entry_count() >= self.min_entries() {
            return Ok(());
        }

        let parent = read_node(pool, self.file_id, parent_pid)?;
        let children = match &parent {
            BTreeNode::Internal { children, .. } => children.clone(),
            _ => unreachable!(),
        };
        let idx = children
            .iter()
            .position(|&c| c == node_pid)
            .ok_or_else(|| Error::Internal("b+ tree parent link broken".to_string()))?;

        // Borrow from a sibling that can spare an entry.
        if idx > 0 {
            let left_pid = children[idx - 1];
            let left = read_node(pool, self.file_id, left_pid)?;
            if left.entry_count() > self.min_entries() {
                return self.borrow(pool, parent_pid, idx, left_pid, node_pid, true);
            }
        }
        if idx + 1 < children.len() {
            let right_pid = children[idx + 1];
            let right = read_node(pool, self.file_id, right_pid)?;
            if right.entry_count() > self.min_entries() {
                return self.borrow(pool, parent_pid, idx, node_pid, right_pid, false);
            }
        }

        // Both siblings minimal: merge with one of them.
        let (sep_idx, left_pid, right_pid) = if idx > 0 {
            (idx - 1, children[idx - 1], node_pid)
        } else {
            (idx, node_pid, children[idx + 1])
        };
        self.merge(pool, parent_pid, sep_idx, left_pid, right_pid)?;

        let parent = read_node(pool, self.file_id, parent_pid)?;
        let parent_is_root = path.len() == 1;
        if parent_is_root {
            if parent.entry_count() == 0 {
                path.pop();
                return self.rebalance(pool, path, parent_pid);
            }
        } else if parent.entry_count() < self.min_entries() {
            path.pop();
            return self.rebalance(pool, path, parent_pid);
        }
        Ok(())
    }

    /// Move one entry from the richer sibling into the poor node, rotating
    /// through the parent separator for internal nodes.
    fn borrow(
        &self,
        pool: &mut MutexGuard<'_, BufferPoolManager>,
        parent_pid: PageId,
        node_idx: usize,
        left_pid: PageId,
        right_pid: PageId,
        from_left: bool,
    ) -> Result<()> {
        let mut parent = read_node(pool, self.file_id, parent_pid)?;
        let mut left = read_node(pool, self.file_id, left_pid)?;
        let mut right = read_node(pool, self.file_id, right_pid)?;
        // Separator between left and right.
        let sep_idx = if from_left { node_idx - 1 } else { node_idx };

        match (&mut left, &mut right, &mut parent) {
            (
                BTreeNode::Leaf { entries: le, .. },
                BTreeNode::Leaf { entries: re, .. },
                BTreeNode::Internal { entries: pe, .. },
            ) => {
                if from_left {
                    let moved = le.pop().expect("left sibling has spare entries");
                    re.insert(0, moved);
                } else {
                    let moved = re.remove(0);
                    le.push(moved);
                }
                // The separator tracks the right sibling's new lower bound.
                pe[sep_idx] = re[0].clone();
            }
            (
                BTreeNode::Internal {
                    entries: le,
                    children: lc,
                    ..
                },
                BTreeNode::Internal {
                    entries: re,
                    children: rc,
                    ..
                },
                BTreeNode::Internal { entries: pe, .. },
            ) => {
                if from_left {
                    let moved_child = lc.pop().expect("left sibling has spare children");
                    re.insert(0, pe[sep_idx].clone());
                    rc.insert(0, moved_child);
                    pe[sep_idx] = le.pop().expect("left sibling has spare entries");
                    self.set_parent(pool, moved_child, right_pid)?;
                } else {
                    let moved_child = rc.remove(0);
                    le.push(pe[sep_idx].clone());
                    lc.push(moved_child);
                    pe[sep_idx] = re.remove(0);
                    self.set_parent(pool, moved_child, left_pid)?;
                }
            }
            _ => return Err(Error::Internal("b+ tree sibling kind mismatch".to_string())),
        }

        write_node(pool, self.file_id, left_pid, &left)?;
        write_node(pool, self.file_id, right_pid, &right)?;
        write_node(pool, self.file_id, parent_pid, &parent)
    }

    /// Merge `right_pid` into `left_pid`, dropping the separator from the
    /// parent and freeing the right page.
    fn merge(
        &self,
        pool: &mut MutexGuard<'_, BufferPoolManager>,
        parent_pid: PageId,
        sep_idx: usize,
        left_pid: PageId,
        right_pid: PageId,
    ) -> Result<()> {
        let mut parent = read_node(pool, self.file_id, parent_pid)?;
        let mut left = read_node(pool, self.file_id, left_pid)?;
        let right = read_node(pool, self.file_id, right_pid)?;

        let separator = match &mut parent {
            BTreeNode::Internal { entries, children, .. } => {
                let separator = entries.remove(sep_idx);
                children.remove(sep_idx + 1);
                separator
            }
            _ => unreachable!(),
        };

        match (&mut left, right) {
            (
                BTreeNode::Leaf {
                    entries: le, next, ..
                },
                BTreeNode::Leaf {
                    entries: re,
                    next: rnext,
                    ..
                },
            ) => {
                le.extend(re);
                *next = rnext;
                if rnext != INVALID_PAGE_ID {
                    let mut successor = read_node(pool, self.file_id, rnext)?;
                    if let BTreeNode::Leaf { prev, .. } = &mut successor {
                        *prev = left_pid;
                    }
                    write_node(pool, self.file_id, rnext, &successor)?;
                }
            }
            (
                BTreeNode::Internal {
                    entries: le,
                    children: lc,
                    ..
                },
                BTreeNode::Internal {
                    entries: re,
                    children: rc,
                    ..
                },
            ) => {
                // The separator comes down between the two entry runs.
                le.push(separator);
                le.extend(re);
                for &child in &rc {
                    self.set_parent(pool, child, left_pid)?;
                }
                lc.extend(rc);
            }
            _ => return Err(Error::Internal("b+ tree sibling kind mismatch".to_string())),
        }

        write_node(pool, self.file_id, left_pid, &left)?;
        write_node(pool, self.file_id, parent_pid, &parent)?;
        pool.delete_page(GlobalPageId::new(self.file_id, right_pid))
    }

    // ---- plumbing ----

    fn set_parent(
        &self,
        pool: &mut MutexGuard<'_, BufferPoolManager>,
        pid: PageId,
        parent: PageId,
    ) -> Result<()> {
        let mut node = read_node(pool, self.file_id, pid)?;
        node.set_parent(parent);
        write_node(pool, self.file_id, pid, &node)
    }

    fn set_root(
        &self,
        pool: &mut MutexGuard<'_, BufferPoolManager>,
        pid: PageId,
    ) -> Result<()> {
        *self.root.lock().unwrap() = pid;
        pool.disk_manager().set_user_meta(self.file_id, pid)
    }

    /// Height of the tree (1 = a lone leaf root). Test and EXPLAIN aid.
    pub fn height(&self) -> Result<usize> {
        let mut pool = self.pool.lock().unwrap();
        let mut pid = *self.root.lock().unwrap();
        let mut height = 1;
        loop {
            match read_node(&mut pool, self.file_id, pid)? {
                BTreeNode::Internal { children, .. } => {
                    pid = children[0];
                    height += 1;
                }
                BTreeNode::Leaf { .. } => return Ok(height),
            }
        }
    }
}

fn read_node(
    pool: &mut MutexGuard<'_, BufferPoolManager>,
    file_id: u32,
    pid: PageId,
) -> Result<BTreeNode> {
    let gid = GlobalPageId::new(file_id, pid);
    let idx = pool.fetch_page(gid)?;
    let node = BTreeNode::decode(pool.page(idx));
    pool.unpin_page(gid, false)?;
    node
}

fn write_node(
    pool: &mut MutexGuard<'_, BufferPoolManager>,
    file_id: u32,
    pid: PageId,
    node: &BTreeNode,
) -> Result<()> {
    let gid = GlobalPageId::new(file_id, pid);
    let idx = pool.fetch_page(gid)?;
    let encoded = node.encode(pool.page_mut(idx));
    pool.unpin_page(gid, encoded.is_ok())?;
    encoded
}

fn alloc_node(
    pool: &mut MutexGuard<'_, BufferPoolManager>,
    file_id: u32,
    node: &BTreeNode,
) -> Result<PageId> {
    let page_type = if node.is_leaf() {
        PageType::BTreeLeaf
    } else {
        PageType::BTreeInternal
    };
    let (gid, idx) = pool.new_page(file_id, page_type)?;
    let encoded = node.encode(pool.page_mut(idx));
    pool.unpin_page(gid, encoded.is_ok())?;
    encoded?;
    Ok(gid.page_id)
}

/// Lazy ordered iterator over (key, RID) pairs in a range.
pub struct BTreeRangeIter {
    index: BTreeIndex,
    next_leaf: PageId,
    pending: VecDeque<(IndexKey, Rid)>,
    low: Option<(IndexKey, bool)>,
    high: Option<(IndexKey, bool)>,
    done: bool,
}

impl BTreeRangeIter {
    fn fill(&mut self) -> Result<bool> {
        if self.next_leaf == INVALID_PAGE_ID {
            return Ok(false);
        }
        let mut pool = self.index.pool.lock().unwrap();
        let node = read_node(&mut pool, self.index.file_id, self.next_leaf)?;
        let (entries, next) = match node {
            BTreeNode::Leaf { entries, next, .. } => (entries, next),
            _ => return Err(Error::Corrupted("leaf chain reached an internal page".into())),
        };
        self.next_leaf = next;

        for entry in entries {
            if let Some((low, inclusive)) = &self.low {
                let ord = entry.key.compare(low);
                if ord == std::cmp::Ordering::Less
                    || (!inclusive && ord == std::cmp::Ordering::Equal)
                {
                    continue;
                }
            }
            if let Some((high, inclusive)) = &self.high {
                // Prefix comparison: a bound on the leading columns admits
                // every extension of that prefix.
                let ord = entry.key.compare_prefix(high);
                if ord == std::cmp::Ordering::Greater
                    || (!inclusive && ord == std::cmp::Ordering::Equal)
                {
                    self.next_leaf = INVALID_PAGE_ID;
                    break;
                }
            }
            self.pending.push_back((entry.key, entry.rid));
        }
        Ok(true)
    }
}

impl Iterator for BTreeRangeIter {
    type Item = Result<(IndexKey, Rid)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(Ok(item));
            }
            if self.done {
                return None;
            }
            match self.fill() {
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

    fn setup(order: usize, unique: bool) -> (tempfile::TempDir, BTreeIndex) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().to_path_buf()));
        disk.register_file(2, "i.idx");
        let pool = Arc::new(Mutex::new(BufferPoolManager::new(64, disk)));
        let index = BTreeIndex::create("idx_test", 2, unique, order, pool).unwrap();
        (dir, index)
    }

    fn key(i: i32) -> IndexKey {
        IndexKey::new(Value::Int(i))
    }

    fn rid(i: i32) -> Rid {
        Rid::new(1, i as u16)
    }

    #[test]
    fn test_insert_and_search() {
        let (_dir, index) = setup(4, true);
        for i in [5, 3, 7, 1] {
            index.insert(key(i), rid(i)).unwrap();
        }
        assert_eq!(index.search(&key(5)).unwrap(), Some(rid(5)));
        assert_eq!(index.search(&key(1)).unwrap(), Some(rid(1)));
        assert_eq!(index.search(&key(99)).unwrap(), None);
    }

    #[test]
    fn test_split_grows_height() {
        let (_dir, index) = setup(4, true);
        assert_eq!(index.height().unwrap(), 1);
        for i in 0..5 {
            index.insert(key(i), rid(i)).unwrap();
        }
        assert_eq!(index.height().unwrap(), 2);
    }

    #[test]
    fn test_exact_fill_then_one_more() {
        let (_dir, index) = setup(4, true);
        // Exactly at maximum fill: no split yet.
        for i in 0..4 {
            index.insert(key(i), rid(i)).unwrap();
        }
        assert_eq!(index.height().unwrap(), 1);
        // One more entry triggers the split.
        index.insert(key(4), rid(4)).unwrap();
        assert_eq!(index.height().unwrap(), 2);
        for i in 0..5 {
            assert_eq!(index.search(&key(i)).unwrap(), Some(rid(i)));
        }
    }

    #[test]
    fn test_split_cascade_sequential() {
        let (_dir, index) = setup(4, true);
        for i in 0..200 {
            index.insert(key(i), rid(i)).unwrap();
        }
        assert!(index.height().unwrap() >= 3);
        let keys: Vec<i32> = index
            .scan_all()
            .unwrap()
            .map(|r| match r.unwrap().0 .0[0] {
                Value::Int(i) => i,
                _ => panic!("int key"),
            })
            .collect();
        assert_eq!(keys, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_random_order_inserts() {
        let (_dir, index) = setup(4, true);
        // A fixed pseudo-random permutation of 0..100.
        let mut keys: Vec<i32> = (0..100).collect();
        let mut state = 42u64;
        for i in (1..keys.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let j = (state >> 33) as usize % (i + 1);
            keys.swap(i, j);
        }
        for &k in &keys {
            index.insert(key(k), rid(k)).unwrap();
        }
        for k in 0..100 {
            assert_eq!(index.search(&key(k)).unwrap(), Some(rid(k)));
        }
    }

    #[test]
    fn test_unique_violation() {
        let (_dir, index) = setup(4, true);
        index.insert(key(1), rid(1)).unwrap();
        let err = index.insert(key(1), rid(2));
        assert!(matches!(err, Err(Error::UniqueViolation(_))));
    }

    #[test]
    fn test_duplicates_in_non_unique_index() {
        let (_dir, index) = setup(4, false);
        for i in 0..10 {
            index.insert(key(7), rid(i)).unwrap();
        }
        index.insert(key(3), rid(100)).unwrap();
        let hits: Vec<Rid> = index
            .range(Some((key(7), true)), Some((key(7), true)))
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(hits.len(), 10);
        // Clustered in RID order.
        assert_eq!(hits, (0..10).map(rid).collect::<Vec<_>>());

        // Deleting one exact pair leaves the other nine.
        assert!(index.delete(&key(7), rid(4)).unwrap());
        let hits: Vec<Rid> = index
            .range(Some((key(7), true)), Some((key(7), true)))
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(hits.len(), 9);
        assert!(!hits.contains(&rid(4)));
    }

    #[test]
    fn test_range_scan_bounds() {
        let (_dir, index) = setup(4, true);
        for i in [1, 3, 5, 7, 9, 11, 13, 15] {
            index.insert(key(i), rid(i)).unwrap();
        }
        let collect = |low: Option<(IndexKey, bool)>, high: Option<(IndexKey, bool)>| {
            index
                .range(low, high)
                .unwrap()
                .map(|r| match r.unwrap().0 .0[0] {
                    Value::Int(i) => i,
                    _ => panic!(),
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(
            collect(Some((key(5), true)), Some((key(11), true))),
            vec![5, 7, 9, 11]
        );
        assert_eq!(
            collect(Some((key(5), false)), Some((key(11), false))),
            vec![7, 9]
        );
        assert_eq!(collect(None, Some((key(3), true))), vec![1, 3]);
        assert_eq!(collect(Some((key(14), true)), None), vec![15]);
        assert_eq!(collect(Some((key(99), true)), None), Vec::<i32>::new());
    }

    #[test]
    fn test_delete_borrow_and_merge() {
        let (_dir, index) = setup(4, true);
        for i in 0..50 {
            index.insert(key(i), rid(i)).unwrap();
        }
        // Delete everything in an order that exercises both borrow and merge.
        for i in (0..50).step_by(2) {
            assert!(index.delete(&key(i), rid(i)).unwrap());
        }
        for i in (1..50).step_by(2) {
            assert!(index.delete(&key(i), rid(i)).unwrap());
        }
        // Tree collapsed back to an empty root.
        assert_eq!(index.height().unwrap(), 1);
        assert_eq!(index.scan_all().unwrap().count(), 0);
    }

    #[test]
    fn test_insert_delete_leaves_structure_unchanged() {
        let (_dir, index) = setup(4, true);
        for i in 0..20 {
            index.insert(key(i), rid(i)).unwrap();
        }
        let before: Vec<i32> = index
            .scan_all()
            .unwrap()
            .map(|r| match r.unwrap().0 .0[0] {
                Value::Int(i) => i,
                _ => panic!(),
            })
            .collect();

        index.insert(key(500), rid(500)).unwrap();
        assert!(index.delete(&key(500), rid(500)).unwrap());

        let after: Vec<i32> = index
            .scan_all()
            .unwrap()
            .map(|r| match r.unwrap().0 .0[0] {
                Value::Int(i) => i,
                _ => panic!(),
            })
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_delete_missing_returns_false() {
        let (_dir, index) = setup(4, true);
        index.insert(key(1), rid(1)).unwrap();
        assert!(!index.delete(&key(2), rid(2)).unwrap());
        // Same key, different rid: not the stored pair.
        assert!(!index.delete(&key(1), rid(9)).unwrap());
    }

    #[test]
    fn test_root_persisted_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().to_path_buf()));
        disk.register_file(2, "i.idx");
        let pool = Arc::new(Mutex::new(BufferPoolManager::new(64, disk)));
        {
            let index = BTreeIndex::create("idx_test", 2, true, 4, pool.clone()).unwrap();
            for i in 0..30 {
                index.insert(key(i), rid(i)).unwrap();
            }
            pool.lock().unwrap().flush_all().unwrap();
        }
        let disk = Arc::new(DiskManager::new(dir.path().to_path_buf()));
        disk.register_file(2, "i.idx");
        let pool = Arc::new(Mutex::new(BufferPoolManager::new(64, disk)));
        let index = BTreeIndex::open("idx_test", 2, true, 4, pool).unwrap();
        for i in 0..30 {
            assert_eq!(index.search(&key(i)).unwrap(), Some(rid(i)));
        }
    }

    #[test]
    fn test_no_pins_leak() {
        let (_dir, index) = setup(4, false);
        for i in 0..100 {
            index.insert(key(i % 10), rid(i)).unwrap();
        }
        for i in 0..50 {
            index.delete(&key(i % 10), rid(i)).unwrap();
        }
        let _ = index.scan_all().unwrap().count();
        assert_eq!(index.pool.lock().unwrap().total_pins(), 0);
    }

    #[test]
    fn test_order_for_is_bounded() {
        let order = order_for(&[DataType::Int]);
        assert!(order >= 4);
        let text_order = order_for(&[DataType::Text]);
        assert!(text_order >= 4 && text_order < order);
    }
}
