//! Directory tree
//!
//! A flat, index-addressed array of 128-byte directory records. Entry 0 is
//! the root folder; every other entry hangs off its parent's `child` link
//! and its siblings' `prev`/`next` links. Entries refer to each other by
//! index only, so the backing vector may reallocate freely.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{PoleError, Result};

use super::alloc::{BlockEntry, BlockIndex};

/// Index of a directory record
pub(crate) type EntryIndex = u32;

/// Size of one on-disk directory record
pub(crate) const ENTRY_SIZE: usize = 128;

/// Names are at most 31 UTF-16 code units plus the terminator
const MAX_NAME_UNITS: usize = 31;

/// Wire value for "no entry"
const NO_ENTRY: u32 = 0xffff_ffff;

const TYPE_EMPTY: u8 = 0;
const TYPE_STORAGE: u8 = 1;
const TYPE_STREAM: u8 = 2;
const TYPE_ROOT: u8 = 5;
const COLOR_BLACK: u8 = 1;

/// One stream or folder record
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirEntry {
    /// False for unused or unrecognised records (skipped everywhere)
    pub valid: bool,
    pub name: String,
    /// On-disk code units, kept only when they are not valid UTF-16
    pub raw_name: Option<Vec<u16>>,
    pub is_dir: bool,
    /// Payload size in bytes (streams and root only)
    pub size: u64,
    pub start: BlockIndex,
    pub prev: Option<EntryIndex>,
    pub next: Option<EntryIndex>,
    pub child: Option<EntryIndex>,
    pub clsid: [u8; 16],
}

impl DirEntry {
    fn new(name: &str, is_dir: bool) -> Self {
        Self {
            valid: true,
            name: name.to_string(),
            raw_name: None,
            is_dir,
            size: 0,
            start: BlockEntry::Eof.to_raw(),
            prev: None,
            next: None,
            child: None,
            clsid: [0; 16],
        }
    }

    fn unused() -> Self {
        Self {
            valid: false,
            name: String::new(),
            raw_name: None,
            is_dir: false,
            size: 0,
            start: 0,
            prev: None,
            next: None,
            child: None,
            clsid: [0; 16],
        }
    }

    fn links(&self) -> [Option<EntryIndex>; 3] {
        [self.prev, self.next, self.child]
    }

    /// Parse one 128-byte record
    fn load(record: &[u8], wide_sizes: bool) -> Self {
        let mut buf = record;

        let mut name_bytes = [0u8; 64];
        buf.copy_to_slice(&mut name_bytes);
        let name_len = buf.get_u16_le() as usize;
        let kind = buf.get_u8();
        let _color = buf.get_u8();
        let prev = link(buf.get_u32_le());
        let next = link(buf.get_u32_le());
        let child = link(buf.get_u32_le());
        let mut clsid = [0u8; 16];
        buf.copy_to_slice(&mut clsid);
        buf.advance(4 + 8 + 8); // state bits, creation and modification times
        let start = buf.get_u32_le();
        let size_low = buf.get_u32_le() as u64;
        let size_high = buf.get_u32_le() as u64;

        let units: Vec<u16> = name_bytes[..name_len.min(64)]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0)
            .collect();
        let (name, raw_name) = match String::from_utf16(&units) {
            Ok(name) => (name, None),
            Err(_) => (String::from_utf16_lossy(&units), Some(units)),
        };

        let valid = matches!(kind, TYPE_STORAGE | TYPE_STREAM | TYPE_ROOT) && name_len >= 1;

        Self {
            valid,
            name,
            raw_name,
            is_dir: kind != TYPE_STREAM,
            size: if wide_sizes { size_low | (size_high << 32) } else { size_low },
            start,
            prev,
            next,
            child,
            clsid,
        }
    }

    /// Serialize one 128-byte record
    fn save(&self, is_root: bool, buf: &mut BytesMut) {
        if !self.valid {
            buf.put_bytes(0, 0x44);
            buf.put_u32_le(NO_ENTRY);
            buf.put_u32_le(NO_ENTRY);
            buf.put_u32_le(NO_ENTRY);
            buf.put_bytes(0, ENTRY_SIZE - 0x50);
            return;
        }

        let units: Vec<u16> = match &self.raw_name {
            Some(raw) => raw.iter().copied().take(MAX_NAME_UNITS).collect(),
            None => self.name.encode_utf16().take(MAX_NAME_UNITS).collect(),
        };
        for &unit in &units {
            buf.put_u16_le(unit);
        }
        buf.put_bytes(0, 64 - units.len() * 2);
        buf.put_u16_le(((units.len() + 1) * 2) as u16);

        let kind = if is_root {
            TYPE_ROOT
        } else if self.is_dir {
            TYPE_STORAGE
        } else {
            TYPE_STREAM
        };
        buf.put_u8(kind);
        buf.put_u8(COLOR_BLACK);
        buf.put_u32_le(self.prev.unwrap_or(NO_ENTRY));
        buf.put_u32_le(self.next.unwrap_or(NO_ENTRY));
        buf.put_u32_le(self.child.unwrap_or(NO_ENTRY));
        buf.put_slice(&self.clsid);
        buf.put_bytes(0, 4 + 8 + 8);

        // folders carry neither data nor size
        let (start, size) = if self.is_dir && !is_root { (0, 0) } else { (self.start, self.size) };
        buf.put_u32_le(start);
        buf.put_u32_le(size as u32);
        buf.put_u32_le((size >> 32) as u32);
    }
}

fn link(raw: u32) -> Option<EntryIndex> {
    (raw != NO_ENTRY).then_some(raw)
}

/// Check a single path segment against the format's naming rules
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PoleError::InvalidName("empty name".to_string()));
    }
    if name.encode_utf16().count() > MAX_NAME_UNITS {
        return Err(PoleError::InvalidName(format!(
            "{} is longer than {} characters",
            name, MAX_NAME_UNITS
        )));
    }
    if name.contains(['/', '\\', ':', '!']) {
        return Err(PoleError::InvalidName(format!("{} contains a reserved character", name)));
    }
    Ok(())
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// Flat array of directory entries
#[derive(Debug, Clone)]
pub(crate) struct DirTree {
    entries: Vec<DirEntry>,
}

impl Default for DirTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DirTree {
    /// A tree holding only the root entry
    pub fn new() -> Self {
        let mut tree = Self { entries: Vec::new() };
        tree.clear();
        tree
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.entries.push(DirEntry::new("Root Entry", true));
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Bytes needed to serialize the tree
    pub fn size(&self) -> usize {
        self.entry_count() * ENTRY_SIZE
    }

    pub fn entry(&self, index: EntryIndex) -> Result<&DirEntry> {
        let count = self.entry_count() as u64;
        self.entries.get(index as usize).ok_or(PoleError::OutOfRange {
            index: index as u64,
            count,
        })
    }

    pub fn entry_mut(&mut self, index: EntryIndex) -> Result<&mut DirEntry> {
        let count = self.entry_count() as u64;
        self.entries.get_mut(index as usize).ok_or(PoleError::OutOfRange {
            index: index as u64,
            count,
        })
    }

    /// Look up an entry by "/"-separated path
    pub fn lookup(&self, path: &str) -> Option<&DirEntry> {
        self.find(path).map(|index| &self.entries[index as usize])
    }

    /// Reverse lookup of an entry reference obtained from this tree
    pub fn index_of(&self, entry: &DirEntry) -> Option<EntryIndex> {
        self.entries
            .iter()
            .position(|e| std::ptr::eq(e, entry))
            .map(|i| i as EntryIndex)
    }

    /// Index of the entry at `path`, if it exists
    pub fn find(&self, path: &str) -> Option<EntryIndex> {
        if path.is_empty() {
            return None;
        }

        let mut index = 0;
        for segment in split_path(path) {
            index = self.child_named(index, segment)?;
        }
        Some(index)
    }

    /// Index of the entry at `path`, creating missing segments
    ///
    /// Missing intermediate segments become folders; a missing leaf becomes
    /// a folder when `leaf_is_dir`, else an empty stream. New entries are
    /// appended to the end of their parent's sibling chain.
    pub fn find_or_create(&mut self, path: &str, leaf_is_dir: bool) -> Result<EntryIndex> {
        let segments: Vec<&str> = split_path(path).collect();
        let mut index = 0;

        for (i, segment) in segments.iter().enumerate() {
            let is_leaf = i + 1 == segments.len();
            if !self.entries[index as usize].is_dir {
                return Err(PoleError::NotAStream(format!(
                    "{} is a stream and cannot hold {}",
                    self.full_name(index),
                    segment
                )));
            }

            index = match self.child_named(index, segment) {
                Some(child) => child,
                None => {
                    validate_name(segment)?;
                    let is_dir = if is_leaf { leaf_is_dir } else { true };
                    self.append_child(index, DirEntry::new(segment, is_dir))?
                }
            };
        }
        Ok(index)
    }

    fn child_named(&self, parent: EntryIndex, name: &str) -> Option<EntryIndex> {
        self.children(parent)
            .into_iter()
            .find(|&child| self.entries[child as usize].name == name)
    }

    /// Store `entry` in a free slot and link it as the last child of `parent`
    fn append_child(&mut self, parent: EntryIndex, entry: DirEntry) -> Result<EntryIndex> {
        let slot = self
            .entries
            .iter()
            .skip(1)
            .position(|e| !e.valid)
            .map(|i| (i + 1) as EntryIndex);
        let index = match slot {
            Some(index) => {
                self.entries[index as usize] = entry;
                index
            }
            None => {
                self.entries.push(entry);
                (self.entries.len() - 1) as EntryIndex
            }
        };

        match self.entry(parent)?.child {
            None => self.entry_mut(parent)?.child = Some(index),
            Some(first) => {
                let mut last = first;
                let mut steps = 0;
                while let Some(next) = self.entry(last)?.next {
                    steps += 1;
                    if steps > self.entry_count() {
                        return Err(PoleError::bad("cyclic sibling chain"));
                    }
                    last = next;
                }
                self.entry_mut(last)?.next = Some(index);
            }
        }
        Ok(index)
    }

    /// Entry whose child set contains `index`
    pub fn parent(&self, index: EntryIndex) -> Option<EntryIndex> {
        (0..self.entry_count() as EntryIndex).find(|&candidate| {
            self.entries[candidate as usize].is_dir && self.children(candidate).contains(&index)
        })
    }

    /// Absolute "/"-joined path of an entry
    pub fn full_name(&self, index: EntryIndex) -> String {
        if index == 0 {
            return "/".to_string();
        }

        let mut names = Vec::new();
        let mut current = index;
        while current != 0 && names.len() <= self.entry_count() {
            match self.entries.get(current as usize) {
                Some(entry) => names.push(entry.name.as_str()),
                None => break,
            }
            match self.parent(current) {
                Some(parent) => current = parent,
                None => break,
            }
        }

        names.reverse();
        format!("/{}", names.join("/"))
    }

    /// Direct children of `index`, in sibling-tree order
    ///
    /// Walks both `prev` and `next` links (in-order), so trees balanced by
    /// other writers list the same way as the flat chains written here.
    pub fn children(&self, index: EntryIndex) -> Vec<EntryIndex> {
        let mut result = Vec::new();
        let first = match self.entries.get(index as usize) {
            Some(entry) if entry.valid => entry.child,
            _ => return result,
        };

        let mut visited = vec![false; self.entry_count()];
        let mut stack = Vec::new();
        let mut current = first;
        loop {
            while let Some(i) = current {
                let usable = self
                    .entries
                    .get(i as usize)
                    .is_some_and(|e| e.valid && !visited[i as usize]);
                if !usable {
                    break;
                }
                visited[i as usize] = true;
                stack.push(i);
                current = self.entries[i as usize].prev;
            }
            match stack.pop() {
                Some(i) => {
                    result.push(i);
                    current = self.entries[i as usize].next;
                }
                None => break,
            }
        }
        result
    }

    /// Unlink `index` (and everything below it) from the tree
    ///
    /// Returns the removed entries so their chains can be released. The slots
    /// stay in place, marked invalid, and are reused by later creations.
    pub fn remove(&mut self, index: EntryIndex) -> Result<Vec<DirEntry>> {
        if index == 0 {
            return Err(PoleError::InvalidName("cannot remove the root entry".to_string()));
        }
        let target = self.entry(index)?.clone();
        if !target.valid {
            return Err(PoleError::NotFound(format!("entry {}", index)));
        }

        // splice the sibling subtree: prev takes the node's place, next hangs
        // off prev's right-most descendant
        let replacement = match (target.prev, target.next) {
            (None, next) => next,
            (prev, None) => prev,
            (Some(prev), Some(next)) => {
                let mut last = prev;
                let mut steps = 0;
                while let Some(right) = self.entry(last)?.next {
                    steps += 1;
                    if steps > self.entry_count() {
                        return Err(PoleError::bad("cyclic sibling chain"));
                    }
                    last = right;
                }
                self.entry_mut(last)?.next = Some(next);
                Some(prev)
            }
        };

        for entry in self.entries.iter_mut() {
            if entry.child == Some(index) {
                entry.child = replacement;
            }
            if entry.prev == Some(index) {
                entry.prev = replacement;
            }
            if entry.next == Some(index) {
                entry.next = replacement;
            }
        }

        let mut removed = Vec::new();
        let mut pending = vec![index];
        while let Some(i) = pending.pop() {
            if self.entries[i as usize].is_dir {
                pending.extend(self.children(i));
            }
            let slot = &mut self.entries[i as usize];
            removed.push(std::mem::replace(slot, DirEntry::unused()));
        }
        Ok(removed)
    }

    /// Parse a directory stream
    ///
    /// Fails `BadOle` when the length is not a whole number of records, the
    /// root is missing, a link leaves the table, or an entry is reachable
    /// twice. Valid entries unreachable from the root are dropped.
    pub fn load(data: &[u8], wide_sizes: bool) -> Result<Self> {
        if data.len() % ENTRY_SIZE != 0 {
            return Err(PoleError::bad(format!(
                "directory length {} is not a multiple of {}",
                data.len(),
                ENTRY_SIZE
            )));
        }

        let mut entries: Vec<DirEntry> = data
            .chunks_exact(ENTRY_SIZE)
            .map(|record| DirEntry::load(record, wide_sizes))
            .collect();

        match entries.first() {
            Some(root) if root.valid && root.is_dir => {}
            _ => return Err(PoleError::bad("directory has no root entry")),
        }

        let count = entries.len();
        for (i, entry) in entries.iter().enumerate().filter(|(_, e)| e.valid) {
            if let Some(bad) = entry.links().into_iter().flatten().find(|&l| l as usize >= count) {
                return Err(PoleError::bad(format!(
                    "directory entry {} links to {} (only {} entries)",
                    i, bad, count
                )));
            }
        }

        // links into unused records lead nowhere
        let valid: Vec<bool> = entries.iter().map(|e| e.valid).collect();
        for entry in entries.iter_mut() {
            for slot in [&mut entry.prev, &mut entry.next, &mut entry.child] {
                if slot.is_some_and(|l| !valid[l as usize]) {
                    *slot = None;
                }
            }
        }
        entries[0].prev = None;
        entries[0].next = None;

        let mut reached = vec![false; count];
        reached[0] = true;
        let mut pending: Vec<EntryIndex> = entries[0].child.into_iter().collect();
        while let Some(i) = pending.pop() {
            if std::mem::replace(&mut reached[i as usize], true) {
                return Err(PoleError::bad(format!("directory entry {} is linked twice", i)));
            }
            let entry = &entries[i as usize];
            pending.extend(entry.prev);
            pending.extend(entry.next);
            if entry.is_dir {
                pending.extend(entry.child);
            }
        }

        for (i, entry) in entries.iter_mut().enumerate() {
            if entry.valid && !reached[i] {
                tracing::warn!(index = i, name = %entry.name, "dropping orphaned directory entry");
                *entry = DirEntry::unused();
            }
        }

        Ok(Self { entries })
    }

    /// Serialize the tree, padded with unused records up to `total` entries
    pub fn save(&self, total: usize) -> BytesMut {
        let total = total.max(self.entry_count());
        let mut buf = BytesMut::with_capacity(total * ENTRY_SIZE);
        for (i, entry) in self.entries.iter().enumerate() {
            entry.save(i == 0, &mut buf);
        }
        for _ in self.entry_count()..total {
            DirEntry::unused().save(false, &mut buf);
        }
        buf
    }
}

// =============================================================================
// Tests
// =============================================================================
