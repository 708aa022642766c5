//! B+ tree node page codec
//!
//! Nodes are serialized into fixed-size pages. Both node kinds store entries
//! of (key, RID): leaves because the RID is the lookup result, internal nodes
//! because the RID participates in the separator ordering, which keeps
//! duplicate keys totally ordered and cluster-stable.
//!
//! Layout after the 24-byte common page header:
//! ```text
//! internal: [24..28] parent  [28..30] entry_count
//!           [30..34] child[0]
//!           then per entry: [klen u16][key][rid: page u32 + slot u16][child u32]
//! leaf:     [24..28] parent  [28..32] prev  [32..36] next  [36..38] entry_count
//!           then per entry: [klen u16][key][rid: page u32 + slot u16]
//! ```

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::heap::Rid;
use super::page::{Page, PageId, PageType, INVALID_PAGE_ID, PAGE_HEADER_SIZE, PAGE_SIZE};
use super::tuple::{read_value, write_value, Value};
use crate::error::{Error, Result};

/// Longest accepted encoded key. Bounds node fan-out from below.
pub const MAX_KEY_BYTES: usize = 255;

/// A key in a B+ tree index: one value per indexed column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexKey(pub Vec<Value>);

impl IndexKey {
    pub fn new(value: Value) -> Self {
        Self(vec![value])
    }

    pub fn composite(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Column-wise comparison; shorter keys compare before their extensions,
    /// which makes prefix probes position at the leftmost match.
    pub fn compare(&self, other: &IndexKey) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.compare(b) {
                Some(Ordering::Equal) | None => continue,
                Some(ord) => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }

    /// Compare only the columns both keys have. A probe key that is a strict
    /// prefix of an entry's key compares Equal, which lets range bounds match
    /// every extension of the prefix.
    pub fn compare_prefix(&self, other: &IndexKey) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.compare(b) {
                Some(Ordering::Equal) | None => continue,
                Some(ord) => return ord,
            }
        }
        Ordering::Equal
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![self.0.len() as u8];
        for value in &self.0 {
            write_value(&mut bytes, value);
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let count = *bytes
            .first()
            .ok_or_else(|| Error::Corrupted("empty index key".to_string()))?
            as usize;
        let mut offset = 1;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let (value, used) = read_value(&bytes[offset..])?;
            values.push(value);
            offset += used;
        }
        Ok(Self(values))
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl Eq for IndexKey {}

/// One (key, RID) pair. RID breaks ties between duplicate keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: IndexKey,
    pub rid: Rid,
}

impl Entry {
    pub fn new(key: IndexKey, rid: Rid) -> Self {
        Self { key, rid }
    }

    pub fn compare(&self, other: &Entry) -> Ordering {
        self.key
            .compare(&other.key)
            .then_with(|| (self.rid.page_id, self.rid.slot).cmp(&(other.rid.page_id, other.rid.slot)))
    }
}

/// Decoded B+ tree node
#[derive(Debug, Clone, PartialEq)]
pub enum BTreeNode {
    Internal {
        parent: PageId,
        entries: Vec<Entry>,
        /// entries.len() + 1 children; child[i] holds entries below entry[i].
        children: Vec<PageId>,
    },
    Leaf {
        parent: PageId,
        prev: PageId,
        next: PageId,
        entries: Vec<Entry>,
    },
}

impl BTreeNode {
    pub fn empty_leaf() -> Self {
        BTreeNode::Leaf {
            parent: INVALID_PAGE_ID,
            prev: INVALID_PAGE_ID,
            next: INVALID_PAGE_ID,
            entries: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, BTreeNode::Leaf { .. })
    }

    pub fn parent(&self) -> PageId {
        match self {
            BTreeNode::Internal { parent, .. } | BTreeNode::Leaf { parent, .. } => *parent,
        }
    }

    pub fn set_parent(&mut self, new_parent: PageId) {
        match self {
            BTreeNode::Internal { parent, .. } | BTreeNode::Leaf { parent, .. } => {
                *parent = new_parent
            }
        }
    }

    pub fn entries(&self) -> &[Entry] {
        match self {
            BTreeNode::Internal { entries, .. } | BTreeNode::Leaf { entries, .. } => entries,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries().len()
    }

    /// Serialize into the page, replacing its body.
    pub fn encode(&self, page: &mut Page) -> Result<()> {
        let mut body = Vec::with_capacity(PAGE_SIZE - PAGE_HEADER_SIZE);
        match self {
            BTreeNode::Internal {
                parent,
                entries,
                children,
            } => {
                debug_assert_eq!(children.len(), entries.len() + 1);
                body.extend_from_slice(&parent.to_le_bytes());
                body.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                body.extend_from_slice(&children[0].to_le_bytes());
                for (entry, child) in entries.iter().zip(&children[1..]) {
                    write_entry(&mut body, entry)?;
                    body.extend_from_slice(&child.to_le_bytes());
                }
            }
            BTreeNode::Leaf {
                parent,
                prev,
                next,
                entries,
            } => {
                body.extend_from_slice(&parent.to_le_bytes());
                body.extend_from_slice(&prev.to_le_bytes());
                body.extend_from_slice(&next.to_le_bytes());
                body.extend_from_slice(&(entries.len() as u16).to_le_bytes());
                for entry in entries {
                    write_entry(&mut body, entry)?;
                }
            }
        }
        if PAGE_HEADER_SIZE + body.len() > PAGE_SIZE {
            return Err(Error::Internal(format!(
                "b+ tree node overflows page ({} bytes)",
                body.len()
            )));
        }
        let data = page.data_mut();
        data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + body.len()].copy_from_slice(&body);
        data[PAGE_HEADER_SIZE + body.len()..].fill(0);
        // Retag: a recycled page can change role between leaf and internal.
        page.set_page_type(if self.is_leaf() {
            PageType::BTreeLeaf
        } else {
            PageType::BTreeInternal
        });
        Ok(())
    }

    /// Deserialize a node from a page.
    pub fn decode(page: &Page) -> Result<BTreeNode> {
        let data = page.data();
        let body = &data[PAGE_HEADER_SIZE..];
        match page.page_type() {
            PageType::BTreeInternal => {
                let parent = read_u32(body, 0)?;
                let count = u16::from_le_bytes([body[4], body[5]]) as usize;
                let mut children = vec![read_u32(body, 6)?];
                let mut entries = Vec::with_capacity(count);
                let mut offset = 10;
                for _ in 0..count {
                    let (entry, used) = read_entry(&body[offset..])?;
                    offset += used;
                    children.push(read_u32(body, offset)?);
                    offset += 4;
                    entries.push(entry);
                }
                Ok(BTreeNode::Internal {
                    parent,
                    entries,
                    children,
                })
            }
            PageType::BTreeLeaf => {
                let parent = read_u32(body, 0)?;
                let prev = read_u32(body, 4)?;
                let next = read_u32(body, 8)?;
                let count = u16::from_le_bytes([body[12], body[13]]) as usize;
                let mut entries = Vec::with_capacity(count);
                let mut offset = 14;
                for _ in 0..count {
                    let (entry, used) = read_entry(&body[offset..])?;
                    offset += used;
                    entries.push(entry);
                }
                Ok(BTreeNode::Leaf {
                    parent,
                    prev,
                    next,
                    entries,
                })
            }
            _ => Err(Error::CorruptedPage(page.page_id())),
        }
    }
}

fn write_entry(out: &mut Vec<u8>, entry: &Entry) -> Result<()> {
    let key_bytes = entry.key.to_bytes();
    if key_bytes.len() > MAX_KEY_BYTES {
        return Err(Error::ValueTooLarge("index key".to_string()));
    }
    out.extend_from_slice(&(key_bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(&key_bytes);
    out.extend_from_slice(&entry.rid.page_id.to_le_bytes());
    out.extend_from_slice(&entry.rid.slot.to_le_bytes());
    Ok(())
}

fn read_entry(bytes: &[u8]) -> Result<(Entry, usize)> {
    let short = || Error::Corrupted("b+ tree entry truncated".to_string());
    if bytes.len() < 2 {
        return Err(short());
    }
    let klen = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    let key_bytes = bytes.get(2..2 + klen).ok_or_else(short)?;
    let key = IndexKey::from_bytes(key_bytes)?;
    let rid_at = 2 + klen;
    let rid_bytes = bytes.get(rid_at..rid_at + 6).ok_or_else(short)?;
    let rid = Rid::new(
        u32::from_le_bytes(rid_bytes[..4].try_into().unwrap()),
        u16::from_le_bytes(rid_bytes[4..6].try_into().unwrap()),
    );
    Ok((Entry::new(key, rid), rid_at + 6))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .ok_or_else(|| Error::Corrupted("b+ tree node truncated".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: i32) -> Entry {
        Entry::new(IndexKey::new(Value::Int(i)), Rid::new(10, i as u16))
    }

    #[test]
    fn test_key_ordering() {
        let a = IndexKey::new(Value::Int(1));
        let b = IndexKey::new(Value::Int(2));
        assert!(a < b);

        let prefix = IndexKey::composite(vec![Value::Int(1)]);
        let full = IndexKey::composite(vec![Value::Int(1), Value::Str("x".into())]);
        assert!(prefix < full);
    }

    #[test]
    fn test_entry_tie_break_by_rid() {
        let a = Entry::new(IndexKey::new(Value::Int(5)), Rid::new(1, 0));
        let b = Entry::new(IndexKey::new(Value::Int(5)), Rid::new(1, 3));
        assert_eq!(a.compare(&b), Ordering::Less);
    }

    #[test]
    fn test_leaf_roundtrip() {
        let node = BTreeNode::Leaf {
            parent: 3,
            prev: 8,
            next: 9,
            entries: (0..50).map(entry).collect(),
        };
        let mut page = Page::new(5, PageType::BTreeLeaf);
        node.encode(&mut page).unwrap();
        let decoded = BTreeNode::decode(&page).unwrap();
        assert_eq!(node, decoded);
    }

    #[test]
    fn test_internal_roundtrip() {
        let node = BTreeNode::Internal {
            parent: INVALID_PAGE_ID,
            entries: (0..30).map(entry).collect(),
            children: (100..131).collect(),
        };
        let mut page = Page::new(5, PageType::BTreeInternal);
        node.encode(&mut page).unwrap();
        let decoded = BTreeNode::decode(&page).unwrap();
        assert_eq!(node, decoded);
    }

    #[test]
    fn test_page_roundtrip_through_bytes() {
        let node = BTreeNode::Leaf {
            parent: INVALID_PAGE_ID,
            prev: INVALID_PAGE_ID,
            next: INVALID_PAGE_ID,
            entries: vec![Entry::new(
                IndexKey::composite(vec![Value::Str("ada".into()), Value::Int(3)]),
                Rid::new(2, 7),
            )],
        };
        let mut page = Page::new(1, PageType::BTreeLeaf);
        node.encode(&mut page).unwrap();
        let reread = Page::from_bytes(1, page.to_bytes()).unwrap();
        assert_eq!(BTreeNode::decode(&reread).unwrap(), node);
    }

    #[test]
    fn test_oversized_key_rejected() {
        let node = BTreeNode::Leaf {
            parent: INVALID_PAGE_ID,
            prev: INVALID_PAGE_ID,
            next: INVALID_PAGE_ID,
            entries: vec![Entry::new(
                IndexKey::new(Value::Str("k".repeat(MAX_KEY_BYTES + 1))),
                Rid::new(0, 0),
            )],
        };
        let mut page = Page::new(1, PageType::BTreeLeaf);
        assert!(node.encode(&mut page).is_err());
    }
}
