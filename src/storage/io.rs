//! StorageIO
//!
//! Owns the file handle, the header, both allocation tables and the
//! directory tree of one container, and resolves block chains to bytes.
//!
//! ## Ownership
//! - The file handle is exclusively owned by one `StorageIO` and is not safe
//!   for concurrent mutation; callers serialize access through the façade's
//!   mutex.
//! - Live `StreamIO` instances are kept in a slab owned here. `close()`
//!   clears the slab and bumps `generation`, so handles held by callers fail
//!   cleanly afterwards.
//! - Writes are staged as whole big blocks in `pending` and reach the file
//!   only on `flush()` ("last flush wins").

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};

use crate::config::{AccessMode, Config};
use crate::error::{PoleError, Result, StorageResult};

use super::alloc::{AllocTable, BlockEntry, BlockIndex};
use super::dirtree::{DirEntry, DirTree, EntryIndex, ENTRY_SIZE};
use super::header::{Header, HEADER_BAT_SLOTS, HEADER_SIZE};
use super::stream_io::StreamIO;

/// Read-only summary of a container's layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub big_block_size: usize,
    pub small_block_size: usize,
    pub threshold: u32,
    pub num_bat: u32,
    pub num_sbat: u32,
    pub num_mbat: u32,
    pub dir_entries: usize,
    pub big_blocks: usize,
    pub small_blocks: usize,
}

/// One live StreamIO plus the number of façade handles sharing it
struct StreamSlot {
    full_name: String,
    /// Emptied for good when the entry is deleted
    stream: Option<StreamIO>,
    handles: usize,
}

pub(crate) struct StorageIO {
    path: PathBuf,
    config: Config,
    file: Option<File>,
    file_size: u64,
    opened: bool,
    writable: bool,
    dirty: bool,
    result: StorageResult,

    /// Bumped on every open/create/close; stale stream handles compare against it
    generation: u64,
    /// Bumped whenever a stream's size, chain or directory slot may have moved
    layout_epoch: u64,

    header: Header,
    bbat: AllocTable,
    sbat: AllocTable,
    dirtree: DirTree,

    /// Big-block chain of the short-stream container
    sb_blocks: Vec<BlockIndex>,
    /// BAT and MBAT blocks as of the last load/flush
    bat_blocks: Vec<BlockIndex>,
    mbat_blocks: Vec<BlockIndex>,
    /// Staged big blocks, written on flush
    pending: BTreeMap<BlockIndex, Vec<u8>>,

    streams: Vec<Option<StreamSlot>>,
}

impl StorageIO {
    pub fn new(path: &Path, config: Config) -> Self {
        let header = Header::new(config.big_block_shift, config.small_block_shift);
        let bbat = AllocTable::new(header.big_block_size());
        let sbat = AllocTable::new(header.small_block_size());
        Self {
            path: path.to_path_buf(),
            config,
            file: None,
            file_size: 0,
            opened: false,
            writable: false,
            dirty: false,
            result: StorageResult::Ok,
            generation: 0,
            layout_epoch: 0,
            header,
            bbat,
            sbat,
            dirtree: DirTree::new(),
            sb_blocks: Vec::new(),
            bat_blocks: Vec::new(),
            mbat_blocks: Vec::new(),
            pending: BTreeMap::new(),
            streams: Vec::new(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn result(&self) -> StorageResult {
        self.result
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn layout_epoch(&self) -> u64 {
        self.layout_epoch
    }

    pub fn threshold(&self) -> u64 {
        self.header.threshold as u64
    }

    pub fn big_block_size(&self) -> usize {
        self.bbat.block_size()
    }

    pub fn small_block_size(&self) -> usize {
        self.sbat.block_size()
    }

    pub fn dirtree(&self) -> &DirTree {
        &self.dirtree
    }

    pub fn info(&self) -> ContainerInfo {
        ContainerInfo {
            big_block_size: self.big_block_size(),
            small_block_size: self.small_block_size(),
            threshold: self.header.threshold,
            num_bat: self.header.num_bat,
            num_sbat: self.header.num_sbat,
            num_mbat: self.header.num_mbat,
            dir_entries: self.dirtree.entry_count(),
            big_blocks: self.bbat.count(),
            small_blocks: self.sbat.count(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened {
            Ok(())
        } else {
            Err(PoleError::Closed)
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.writable {
            Ok(())
        } else {
            Err(PoleError::ReadOnly)
        }
    }

    /// Forget all in-memory structure, keeping path and config
    fn reset(&mut self, b_shift: u16, s_shift: u16) {
        self.header = Header::new(b_shift, s_shift);
        self.bbat = AllocTable::new(self.header.big_block_size());
        self.sbat = AllocTable::new(self.header.small_block_size());
        self.dirtree = DirTree::new();
        self.sb_blocks.clear();
        self.bat_blocks.clear();
        self.mbat_blocks.clear();
        self.pending.clear();
        self.streams.clear();
        self.file = None;
        self.file_size = 0;
        self.generation += 1;
        self.layout_epoch += 1;
    }

    // =========================================================================
    // Open / Create / Close
    // =========================================================================

    /// Open the container at `path` and load its structure
    pub fn open(&mut self) -> Result<()> {
        if self.opened {
            self.close()?;
        }

        let outcome = self.load();
        self.result = match &outcome {
            Ok(()) => StorageResult::Ok,
            Err(e) => e.code(),
        };
        if outcome.is_err() {
            let (b_shift, s_shift) = (self.config.big_block_shift, self.config.small_block_shift);
            self.reset(b_shift, s_shift);
        }
        outcome
    }

    fn load(&mut self) -> Result<()> {
        let writable = self.config.access == AccessMode::ReadWrite;
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&self.path)
            .map_err(PoleError::OpenFailed)?;
        let file_size = file.metadata()?.len();

        let mut raw = vec![0u8; HEADER_SIZE];
        let got = read_up_to(&file, 0, &mut raw)?;
        let header = Header::load(&raw[..got])?;
        header.validate()?;

        self.reset(header.b_shift, header.s_shift);
        self.header = header;
        self.file = Some(file);
        self.file_size = file_size;

        let bbs = self.big_block_size();
        let num_bat = self.header.num_bat as usize;
        if num_bat as u64 > self.file_blocks() {
            return Err(PoleError::bad(format!(
                "{} BAT blocks claimed but file holds only {} blocks",
                num_bat,
                self.file_blocks()
            )));
        }

        // first 109 BAT pointers live in the header, the rest in the MBAT chain
        let mut bat_blocks: Vec<BlockIndex> = self
            .header
            .bb_blocks
            .iter()
            .take(num_bat.min(HEADER_BAT_SLOTS))
            .copied()
            .collect();
        let mut mbat_blocks = Vec::new();
        let per_mbat = bbs / 4 - 1;
        let mut mblock = self.header.mbat_start;
        let mut buf = vec![0u8; bbs];
        while bat_blocks.len() < num_bat {
            if mbat_blocks.len() >= self.header.num_mbat as usize {
                return Err(PoleError::bad(format!(
                    "MBAT chain ends after {} of {} BAT pointers",
                    bat_blocks.len(),
                    num_bat
                )));
            }
            if !self.block_in_file(mblock) || self.load_big_block(mblock, &mut buf)? < bbs {
                return Err(PoleError::bad(format!("MBAT block {} is outside the file", mblock)));
            }
            mbat_blocks.push(mblock);

            let mut cursor = &buf[..];
            for _ in 0..per_mbat {
                if bat_blocks.len() == num_bat {
                    break;
                }
                bat_blocks.push(cursor.get_u32_le());
            }
            mblock = u32::from_le_bytes([buf[bbs - 4], buf[bbs - 3], buf[bbs - 2], buf[bbs - 1]]);
        }

        let table = self.read_chain_strict(&bat_blocks, "BAT")?;
        self.bbat.load(&table);

        let sbat_chain = self.bbat.follow(self.header.sbat_start)?;
        let table = self.read_chain_strict(&sbat_chain, "SBAT")?;
        self.sbat.load(&table);

        let dir_chain = self.bbat.follow(self.header.dirent_start)?;
        let dir = self.read_chain_strict(&dir_chain, "directory")?;
        self.dirtree = DirTree::load(&dir, self.header.b_shift >= 12)?;

        let root = self.dirtree.entry(0)?;
        self.sb_blocks = if root.size == 0 {
            Vec::new()
        } else {
            self.bbat.follow(root.start)?
        };

        self.bat_blocks = bat_blocks;
        self.mbat_blocks = mbat_blocks;
        self.opened = true;
        self.writable = writable;
        self.dirty = false;

        tracing::debug!(
            path = %self.path.display(),
            block_size = bbs,
            num_bat = self.header.num_bat,
            num_mbat = self.header.num_mbat,
            big_blocks = self.bbat.count(),
            small_blocks = self.sbat.count(),
            entries = self.dirtree.entry_count(),
            "loaded compound file"
        );
        Ok(())
    }

    /// Start an empty in-memory container; the file is written on flush
    pub fn create(&mut self) -> Result<()> {
        if self.opened {
            self.close()?;
        }

        let (b_shift, s_shift) = (self.config.big_block_shift, self.config.small_block_shift);
        if !(7..=16).contains(&b_shift) || s_shift == 0 || s_shift > b_shift {
            self.result = StorageResult::UnknownError;
            return Err(PoleError::Unknown(format!(
                "unsupported block shifts {}/{}",
                b_shift, s_shift
            )));
        }

        self.reset(b_shift, s_shift);
        self.opened = true;
        self.writable = true;
        self.dirty = true;
        self.result = StorageResult::Ok;

        tracing::debug!(path = %self.path.display(), block_size = 1usize << b_shift, "created compound file");
        Ok(())
    }

    /// Flush if dirty, release the file and invalidate every live stream
    pub fn close(&mut self) -> Result<()> {
        if !self.opened {
            return Ok(());
        }

        let flushed = if self.dirty && self.writable { self.flush() } else { Ok(()) };

        self.streams.clear();
        self.file = None;
        self.opened = false;
        self.writable = false;
        self.pending.clear();
        self.generation += 1;

        tracing::debug!(path = %self.path.display(), "closed compound file");
        flushed
    }

    // =========================================================================
    // Block I/O
    // =========================================================================

    /// Number of (possibly partial) big blocks after the header
    fn file_blocks(&self) -> u64 {
        let bbs = self.big_block_size() as u64;
        self.file_size.saturating_sub(bbs).div_ceil(bbs)
    }

    fn block_in_file(&self, block: BlockIndex) -> bool {
        (block as u64) < self.file_blocks()
    }

    /// Read up to `min(buf.len(), block size)` bytes of a big block
    ///
    /// Blocks past the end of the file read as zero bytes rather than failing;
    /// callers treat that as truncation.
    pub fn load_big_block(&self, block: BlockIndex, buf: &mut [u8]) -> Result<usize> {
        self.load_big_block_at(block, 0, buf)
    }

    /// Read bytes of a big block starting `offset` bytes into it
    fn load_big_block_at(&self, block: BlockIndex, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let bbs = self.big_block_size();
        let want = buf.len().min(bbs.saturating_sub(offset));
        if want == 0 {
            return Ok(0);
        }

        if let Some(data) = self.pending.get(&block) {
            buf[..want].copy_from_slice(&data[offset..offset + want]);
            return Ok(want);
        }

        let Some(file) = self.file.as_ref() else {
            return Ok(0);
        };
        let pos = (block as u64 + 1) * bbs as u64 + offset as u64;
        if pos >= self.file_size {
            tracing::warn!(block, file_size = self.file_size, "read of block past end of file");
            return Ok(0);
        }
        let available = (self.file_size - pos).min(want as u64) as usize;
        read_exact_at(file, pos, &mut buf[..available])?;
        tracing::trace!(block, offset, bytes = available, "loaded big block");
        Ok(available)
    }

    /// Read up to `min(buf.len(), small block size)` bytes of a small block
    pub fn load_small_block(&self, block: BlockIndex, buf: &mut [u8]) -> Result<usize> {
        let bbs = self.big_block_size();
        let sbs = self.small_block_size();
        let want = buf.len().min(sbs);

        let pos = block as usize * sbs;
        let Some(&big) = self.sb_blocks.get(pos / bbs) else {
            return Ok(0);
        };
        self.load_big_block_at(big, pos % bbs, &mut buf[..want])
    }

    /// Read a metadata chain, failing `BadOle` if any block lies outside the file
    fn read_chain_strict(&self, chain: &[BlockIndex], what: &str) -> Result<Vec<u8>> {
        let bbs = self.big_block_size();
        let mut data = Vec::new();
        for &block in chain {
            if !self.block_in_file(block) {
                return Err(PoleError::bad(format!(
                    "{} block {} is outside the file ({} blocks)",
                    what,
                    block,
                    self.file_blocks()
                )));
            }
            let start = data.len();
            data.resize(start + bbs, 0);
            self.load_big_block(block, &mut data[start..])?;
        }
        Ok(data)
    }

    /// Copy bytes `[pos, pos + buf.len())` of a stream laid out on `chain`
    ///
    /// Returns fewer bytes than requested only when the chain or the file
    /// runs out.
    pub fn read_chain(&self, chain: &[BlockIndex], big: bool, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let bs = if big { self.big_block_size() } else { self.small_block_size() };
        let mut index = (pos / bs as u64) as usize;
        let mut offset = (pos % bs as u64) as usize;
        let mut scratch = vec![0u8; bs];
        let mut total = 0;

        while total < buf.len() {
            let Some(&block) = chain.get(index) else {
                break;
            };
            let got = if big {
                self.load_big_block(block, &mut scratch)?
            } else {
                self.load_small_block(block, &mut scratch)?
            };
            if got <= offset {
                break;
            }

            let count = (got - offset).min(buf.len() - total);
            buf[total..total + count].copy_from_slice(&scratch[offset..offset + count]);
            total += count;
            offset = 0;
            index += 1;
            if got < bs {
                break;
            }
        }
        Ok(total)
    }

    /// Stage bytes into a big block, starting from its current content
    fn write_big_block(&mut self, block: BlockIndex, offset: usize, data: &[u8]) -> Result<()> {
        let bbs = self.big_block_size();
        if !self.pending.contains_key(&block) {
            let mut current = vec![0u8; bbs];
            self.load_big_block(block, &mut current)?;
            self.pending.insert(block, current);
        }
        if let Some(staged) = self.pending.get_mut(&block) {
            staged[offset..offset + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    fn write_small_block(&mut self, block: BlockIndex, offset: usize, data: &[u8]) -> Result<()> {
        let bbs = self.big_block_size();
        let pos = block as usize * self.small_block_size() + offset;
        self.ensure_container(block as usize + 1);
        let big = self.sb_blocks[pos / bbs];
        self.write_big_block(big, pos % bbs, data)
    }

    /// Grow the short-stream container to hold `small_blocks` small blocks
    fn ensure_container(&mut self, small_blocks: usize) {
        let needed = (small_blocks * self.small_block_size()).div_ceil(self.big_block_size());
        if self.sb_blocks.len() >= needed {
            return;
        }
        let extra = self.bbat.claim(needed - self.sb_blocks.len(), BlockEntry::Eof);
        self.sb_blocks.extend(extra);
        self.bbat.set_chain(&self.sb_blocks);
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Chain and table choice for a stream entry
    pub fn chain_for(&self, entry: &DirEntry) -> Result<(Vec<BlockIndex>, bool)> {
        let big = entry.size >= self.threshold();
        if entry.size == 0 {
            return Ok((Vec::new(), big));
        }
        let chain = if big {
            self.bbat.follow(entry.start)?
        } else {
            self.sbat.follow(entry.start)?
        };
        Ok((chain, big))
    }

    /// Resolve a stream path to its entry index
    pub fn stream_entry(&self, path: &str) -> Result<EntryIndex> {
        let index = self
            .dirtree
            .find(path)
            .ok_or_else(|| PoleError::NotFound(path.to_string()))?;
        if self.dirtree.entry(index)?.is_dir {
            return Err(PoleError::NotAStream(path.to_string()));
        }
        Ok(index)
    }

    /// Largest stream size the directory record can describe
    ///
    /// Files with 512-byte blocks only keep the low 32 bits of a size.
    fn max_stream_size(&self) -> u64 {
        if self.header.b_shift >= 12 {
            BlockEntry::MAX_INDEX as u64 * self.big_block_size() as u64
        } else {
            u32::MAX as u64
        }
    }

    /// Write `data` at `pos` of a stream, growing it as needed
    ///
    /// Small streams that grow to the threshold migrate to big blocks.
    pub fn write_stream(&mut self, index: EntryIndex, pos: u64, data: &[u8]) -> Result<usize> {
        self.ensure_writable()?;
        let entry = self.dirtree.entry(index)?.clone();
        if !entry.valid || entry.is_dir {
            return Err(PoleError::NotAStream(self.dirtree.full_name(index)));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let max = self.max_stream_size();
        match pos.checked_add(data.len() as u64) {
            Some(end) if end <= max => {}
            end => {
                return Err(PoleError::TooLarge {
                    size: end.unwrap_or(u64::MAX),
                    max,
                })
            }
        }

        // a write past the end first fills the gap with zeros
        let (pos, payload) = if pos > entry.size {
            let mut padded = vec![0u8; (pos - entry.size) as usize];
            padded.extend_from_slice(data);
            (entry.size, padded)
        } else {
            (pos, data.to_vec())
        };

        let old_size = entry.size;
        let new_size = old_size.max(pos + payload.len() as u64);
        let threshold = self.threshold();
        let (mut chain, old_big) = self.chain_for(&entry)?;
        let new_big = new_size >= threshold;

        let (pos, payload) = if old_big != new_big {
            let mut content = vec![0u8; old_size as usize];
            let got = self.read_chain(&chain, old_big, 0, &mut content)?;
            content.truncate(got);
            content.resize(new_size as usize, 0);
            content[pos as usize..pos as usize + payload.len()].copy_from_slice(&payload);

            if old_big {
                self.bbat.release(&chain);
            } else {
                self.sbat.release(&chain);
            }
            chain.clear();
            tracing::debug!(stream = %entry.name, old_size, new_size, "migrating stream to big blocks");
            (0, content)
        } else {
            (pos, payload)
        };

        let bs = if new_big { self.big_block_size() } else { self.small_block_size() };
        let needed = (new_size as usize).div_ceil(bs);
        if chain.len() < needed {
            let table = if new_big { &mut self.bbat } else { &mut self.sbat };
            let extra = table.claim(needed - chain.len(), BlockEntry::Eof);
            chain.extend(extra);
            table.set_chain(&chain);
        }
        if !new_big {
            if let Some(&highest) = chain.iter().max() {
                self.ensure_container(highest as usize + 1);
            }
        }

        let mut done = 0;
        let mut at = pos as usize;
        while done < payload.len() {
            let block = chain[at / bs];
            let offset = at % bs;
            let count = (bs - offset).min(payload.len() - done);
            let part = &payload[done..done + count];
            if new_big {
                self.write_big_block(block, offset, part)?;
            } else {
                self.write_small_block(block, offset, part)?;
            }
            done += count;
            at += count;
        }

        let stored = self.dirtree.entry_mut(index)?;
        stored.size = new_size;
        stored.start = chain.first().copied().unwrap_or(BlockEntry::Eof.to_raw());
        self.dirty = true;
        self.layout_epoch += 1;
        Ok(data.len())
    }

    /// Create a stream (or folder) entry, including missing parent folders
    pub fn create_entry(&mut self, path: &str, is_dir: bool) -> Result<EntryIndex> {
        self.ensure_writable()?;
        if path.split('/').all(str::is_empty) {
            return Err(PoleError::InvalidName(format!("{:?} names the root", path)));
        }
        let existed = self.dirtree.find(path).is_some();
        let created = self.dirtree.find_or_create(path, is_dir);
        // parent folders may exist even if the leaf failed validation
        if !existed {
            self.dirty = true;
            self.layout_epoch += 1;
        }

        let index = created?;
        if self.dirtree.entry(index)?.is_dir != is_dir {
            let kind = if is_dir { "folder" } else { "stream" };
            return Err(PoleError::InvalidName(format!("{} exists and is not a {}", path, kind)));
        }
        Ok(index)
    }

    /// Remove an entry (folders recursively) and release its blocks
    pub fn delete_entry(&mut self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        let index = self
            .dirtree
            .find(path)
            .ok_or_else(|| PoleError::NotFound(path.to_string()))?;

        let doomed = self.dirtree.full_name(index);
        let nested = format!("{}/", doomed);
        for slot in self.streams.iter_mut().flatten() {
            if slot.full_name == doomed || slot.full_name.starts_with(&nested) {
                slot.stream = None;
            }
        }

        let removed = self.dirtree.remove(index)?;
        for entry in removed.iter().filter(|e| !e.is_dir) {
            match self.chain_for(entry) {
                Ok((chain, true)) => self.bbat.release(&chain),
                Ok((chain, false)) => self.sbat.release(&chain),
                Err(e) => tracing::warn!(stream = %entry.name, error = %e, "leaking blocks of broken chain"),
            }
        }

        tracing::debug!(path, removed = removed.len(), "deleted entry");
        self.dirty = true;
        self.layout_epoch += 1;
        Ok(())
    }

    // =========================================================================
    // Stream Slab
    // =========================================================================

    /// Construct (or, with `reuse`, share) the StreamIO for `path`
    ///
    /// Returns the slot id and the stream's absolute name.
    pub fn stream_io(&mut self, path: &str, reuse: bool) -> Result<(usize, String)> {
        self.ensure_open()?;
        let index = self.stream_entry(path)?;
        let full_name = self.dirtree.full_name(index);

        if reuse {
            let shared = self.streams.iter_mut().enumerate().find_map(|(slot, s)| match s {
                Some(s) if s.stream.is_some() && s.full_name == full_name => Some((slot, s)),
                _ => None,
            });
            if let Some((slot, s)) = shared {
                s.handles += 1;
                return Ok((slot, full_name));
            }
        }

        let stream = StreamIO::new(self, index, full_name.clone())?;
        let slot = StreamSlot {
            full_name: full_name.clone(),
            stream: Some(stream),
            handles: 1,
        };
        let id = match self.streams.iter().position(Option::is_none) {
            Some(free) => {
                self.streams[free] = Some(slot);
                free
            }
            None => {
                self.streams.push(Some(slot));
                self.streams.len() - 1
            }
        };
        Ok((id, full_name))
    }

    /// Run `f` against a live StreamIO
    ///
    /// `None` if the handle is stale or its entry was deleted.
    pub fn with_stream<R>(
        &mut self,
        generation: u64,
        slot: usize,
        f: impl FnOnce(&mut StreamIO, &mut StorageIO) -> R,
    ) -> Option<R> {
        if generation != self.generation {
            return None;
        }
        let mut stream = self.streams.get_mut(slot)?.as_mut()?.stream.take()?;
        let result = f(&mut stream, self);
        if let Some(Some(s)) = self.streams.get_mut(slot) {
            s.stream = Some(stream);
        }
        Some(result)
    }

    /// Drop one handle; the StreamIO goes away with its last handle
    pub fn release_stream(&mut self, generation: u64, slot: usize) {
        if generation != self.generation {
            return;
        }
        if let Some(entry) = self.streams.get_mut(slot) {
            if let Some(s) = entry {
                s.handles = s.handles.saturating_sub(1);
                if s.handles == 0 {
                    *entry = None;
                }
            }
        }
    }

    pub fn live_streams(&self) -> usize {
        self.streams.iter().flatten().count()
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Write staged blocks and rebuild directory, SBAT, BAT and MBAT
    ///
    /// Old metadata blocks are released and reallocated lowest-first, so a
    /// second flush without intervening writes lands on the same blocks and
    /// produces identical bytes.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.writable {
            return Ok(());
        }

        let bbs = self.big_block_size();
        let sbs = self.small_block_size();
        let per_block = bbs / 4;

        // 1. release the previous metadata
        let old_dir = self.bbat.follow(self.header.dirent_start)?;
        let old_sbat = self.bbat.follow(self.header.sbat_start)?;
        self.bbat.release(&old_dir);
        self.bbat.release(&old_sbat);
        for (blocks, mark) in [(&self.bat_blocks, BlockEntry::Bat), (&self.mbat_blocks, BlockEntry::MetaBat)] {
            let owned: Vec<BlockIndex> = blocks
                .iter()
                .copied()
                .filter(|&b| self.bbat.get(b).ok() == Some(mark))
                .collect();
            self.bbat.release(&owned);
        }

        // 2. the root entry describes the short-stream container
        let used_small = self.sbat.highest_used().map_or(0, |b| b as usize + 1);
        if used_small == 0 && !self.sb_blocks.is_empty() {
            self.bbat.release(&self.sb_blocks);
            self.sb_blocks.clear();
        }
        let root = self.dirtree.entry_mut(0)?;
        root.start = self.sb_blocks.first().copied().unwrap_or(BlockEntry::Eof.to_raw());
        root.size = (used_small * sbs) as u64;

        // 3. directory, then SBAT
        let dir_blocks = self.dirtree.size().div_ceil(bbs).max(1);
        let dir_chain = self.bbat.allocate(dir_blocks);
        let dir_data = self.dirtree.save(dir_blocks * bbs / ENTRY_SIZE);

        let sbat_blocks = self.sbat.size().div_ceil(bbs);
        let sbat_chain = self.bbat.allocate(sbat_blocks);
        let sbat_data = self.sbat.save(sbat_blocks * per_block);

        // 4. BAT and MBAT must also describe their own blocks
        let per_mbat = per_block - 1;
        let (mut num_bat, mut num_mbat) = (0usize, 0usize);
        loop {
            let claim = num_bat + num_mbat;
            let free = self.bbat.free_within(self.bbat.count());
            let total = self.bbat.count() + claim.saturating_sub(free);
            let need_bat = total.div_ceil(per_block);
            let need_mbat = need_bat.saturating_sub(HEADER_BAT_SLOTS).div_ceil(per_mbat);
            if (need_bat, need_mbat) == (num_bat, num_mbat) {
                break;
            }
            (num_bat, num_mbat) = (need_bat, need_mbat);
        }
        let bat_blocks = self.bbat.claim(num_bat, BlockEntry::Bat);
        let mbat_blocks = self.bbat.claim(num_mbat, BlockEntry::MetaBat);
        let bat_data = self.bbat.save(num_bat * per_block);

        let mut mbat_data = BytesMut::with_capacity(num_mbat * bbs);
        for (i, overflow) in bat_blocks
            .get(HEADER_BAT_SLOTS..)
            .unwrap_or(&[])
            .chunks(per_mbat)
            .enumerate()
        {
            for &block in overflow {
                mbat_data.put_u32_le(block);
            }
            for _ in overflow.len()..per_mbat {
                mbat_data.put_u32_le(BlockEntry::Avail.to_raw());
            }
            let next = mbat_blocks.get(i + 1).copied().unwrap_or(BlockEntry::Eof.to_raw());
            mbat_data.put_u32_le(next);
        }

        // 5. header
        let eof = BlockEntry::Eof.to_raw();
        self.header.num_bat = num_bat as u32;
        self.header.dirent_start = dir_chain[0];
        self.header.sbat_start = sbat_chain.first().copied().unwrap_or(eof);
        self.header.num_sbat = sbat_blocks as u32;
        self.header.mbat_start = mbat_blocks.first().copied().unwrap_or(eof);
        self.header.num_mbat = num_mbat as u32;
        for (i, slot) in self.header.bb_blocks.iter_mut().enumerate() {
            *slot = bat_blocks.get(i).copied().unwrap_or(BlockEntry::Avail.to_raw());
        }

        // 6. write everything out
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)
                .map_err(PoleError::OpenFailed)?;
            self.file = Some(file);
        }
        let file = self.file.as_ref().ok_or(PoleError::Closed)?;

        write_all_at(file, 0, &self.header.save())?;
        for (&block, data) in &self.pending {
            write_block(file, bbs, block, data)?;
        }
        write_chain(file, bbs, &dir_chain, &dir_data)?;
        write_chain(file, bbs, &sbat_chain, &sbat_data)?;
        write_chain(file, bbs, &bat_blocks, &bat_data)?;
        write_chain(file, bbs, &mbat_blocks, &mbat_data)?;

        // a reloaded table is padded to whole BAT blocks; only used blocks count
        let used_blocks = self.bbat.highest_used().map_or(0, |b| b as u64 + 1);
        let file_size = (used_blocks + 1) * bbs as u64;
        file.set_len(file_size)?;
        file.sync_all()?;

        tracing::debug!(
            path = %self.path.display(),
            staged = self.pending.len(),
            dir_blocks,
            sbat_blocks,
            num_bat,
            num_mbat,
            file_size,
            "flushed compound file"
        );

        self.file_size = file_size;
        self.pending.clear();
        self.bat_blocks = bat_blocks;
        self.mbat_blocks = mbat_blocks;
        self.dirty = false;
        Ok(())
    }
}

// =============================================================================
// Positioned File Helpers
// =============================================================================

fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

/// Read as much as the file holds, up to `buf.len()`
fn read_up_to(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

fn write_all_at(file: &File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

fn write_block(file: &File, bbs: usize, block: BlockIndex, data: &[u8]) -> std::io::Result<()> {
    write_all_at(file, (block as u64 + 1) * bbs as u64, data)
}

fn write_chain(file: &File, bbs: usize, chain: &[BlockIndex], data: &[u8]) -> std::io::Result<()> {
    for (&block, part) in chain.iter().zip(data.chunks(bbs)) {
        write_block(file, bbs, block, part)?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
