//! Block allocation tables
//!
//! One `AllocTable` type serves both the big-block table (BAT) and the
//! small-block table (SBAT). Each entry names the next block of a chain or
//! one of the reserved states; the raw 32-bit wire values are only seen by
//! `load`/`save`.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{PoleError, Result};

/// Index of a fixed-size block (big or small, depending on the table)
pub type BlockIndex = u32;

/// State of one allocation-table slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEntry {
    /// Free block
    Avail,
    /// Last block of a chain
    Eof,
    /// Block holds part of the BAT itself
    Bat,
    /// Block holds MBAT (BAT pointer overflow) data
    MetaBat,
    /// Chain continues at the given block
    Next(BlockIndex),
}

impl BlockEntry {
    const RAW_AVAIL: u32 = 0xffff_ffff;
    const RAW_EOF: u32 = 0xffff_fffe;
    const RAW_BAT: u32 = 0xffff_fffd;
    const RAW_META_BAT: u32 = 0xffff_fffc;

    /// Highest index a regular block may have
    pub const MAX_INDEX: BlockIndex = 0xffff_fffa;

    pub fn from_raw(raw: u32) -> Self {
        match raw {
            Self::RAW_AVAIL => BlockEntry::Avail,
            Self::RAW_EOF => BlockEntry::Eof,
            Self::RAW_BAT => BlockEntry::Bat,
            Self::RAW_META_BAT => BlockEntry::MetaBat,
            next => BlockEntry::Next(next),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            BlockEntry::Avail => Self::RAW_AVAIL,
            BlockEntry::Eof => Self::RAW_EOF,
            BlockEntry::Bat => Self::RAW_BAT,
            BlockEntry::MetaBat => Self::RAW_META_BAT,
            BlockEntry::Next(next) => next,
        }
    }
}

/// Block → next-block mapping for one block size
#[derive(Debug, Clone)]
pub(crate) struct AllocTable {
    block_size: usize,
    entries: Vec<BlockEntry>,
}

impl AllocTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            entries: Vec::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of slots in the table
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Bytes needed to serialize the table
    pub fn size(&self) -> usize {
        self.count() * 4
    }

    /// Grow (or shrink) the table; new slots are `Avail`
    pub fn resize(&mut self, new_size: usize) {
        self.entries.resize(new_size, BlockEntry::Avail);
    }

    pub fn get(&self, index: BlockIndex) -> Result<BlockEntry> {
        self.entries
            .get(index as usize)
            .copied()
            .ok_or(PoleError::OutOfRange {
                index: index as u64,
                count: self.count() as u64,
            })
    }

    /// Set one slot, growing the table when `index` is past the end
    pub fn set(&mut self, index: BlockIndex, entry: BlockEntry) {
        let index = index as usize;
        if index >= self.count() {
            self.resize(index + 1);
        }
        self.entries[index] = entry;
    }

    /// Link `chain` in order, terminating it with `Eof`
    pub fn set_chain(&mut self, chain: &[BlockIndex]) {
        for pair in chain.windows(2) {
            self.set(pair[0], BlockEntry::Next(pair[1]));
        }
        if let Some(&last) = chain.last() {
            self.set(last, BlockEntry::Eof);
        }
    }

    /// Make sure at least `n` slots are free, growing the table if needed
    pub fn preserve(&mut self, n: usize) {
        let free = self.free_within(self.count());
        if free < n {
            self.resize(self.count() + (n - free));
        }
    }

    /// Index of the lowest free slot, or `count()` when the table is full
    pub fn unused(&self) -> BlockIndex {
        match self.entries.iter().position(|e| *e == BlockEntry::Avail) {
            Some(index) => index as BlockIndex,
            None => self.count() as BlockIndex,
        }
    }

    /// Claim `n` free blocks (lowest first) and mark each with `mark`
    ///
    /// Once the free slots run out the table grows at the end.
    pub fn claim(&mut self, n: usize, mark: BlockEntry) -> Vec<BlockIndex> {
        if n == 0 {
            return Vec::new();
        }
        self.preserve(n);

        let mut blocks = Vec::with_capacity(n);
        let mut cursor = self.unused() as usize;
        while blocks.len() < n {
            let block = match self.entries[cursor..].iter().position(|e| *e == BlockEntry::Avail) {
                Some(offset) => cursor + offset,
                None => self.count(),
            };
            self.set(block as BlockIndex, mark);
            blocks.push(block as BlockIndex);
            cursor = block + 1;
        }
        blocks
    }

    /// Claim `n` free blocks and link them into a new chain
    pub fn allocate(&mut self, n: usize) -> Vec<BlockIndex> {
        let chain = self.claim(n, BlockEntry::Eof);
        self.set_chain(&chain);
        chain
    }

    /// Mark every block of `chain` free
    pub fn release(&mut self, chain: &[BlockIndex]) {
        for &block in chain {
            if (block as usize) < self.count() {
                self.entries[block as usize] = BlockEntry::Avail;
            }
        }
    }

    /// Number of free slots if the table were grown to `total` slots
    pub fn free_within(&self, total: usize) -> usize {
        let free = self.entries.iter().filter(|e| **e == BlockEntry::Avail).count();
        free + total.saturating_sub(self.count())
    }

    /// Highest slot that is not `Avail`
    pub fn highest_used(&self) -> Option<BlockIndex> {
        self.entries
            .iter()
            .rposition(|e| *e != BlockEntry::Avail)
            .map(|i| i as BlockIndex)
    }

    /// Walk a chain from `start` until `Eof`
    ///
    /// A start of `Eof`/`Avail` is the empty chain. The walk is bounded by
    /// `count()`: a longer walk can only be a cycle and fails `BadOle`, as does
    /// any link that leaves the table or lands on a non-chain slot.
    pub fn follow(&self, start: BlockIndex) -> Result<Vec<BlockIndex>> {
        let mut chain = Vec::new();
        let mut block = match BlockEntry::from_raw(start) {
            BlockEntry::Eof | BlockEntry::Avail => return Ok(chain),
            BlockEntry::Bat | BlockEntry::MetaBat => {
                return Err(PoleError::bad(format!("chain starts at reserved value {:#x}", start)));
            }
            BlockEntry::Next(block) => block,
        };

        loop {
            if chain.len() >= self.count() {
                return Err(PoleError::bad(format!("cyclic chain from block {}", start)));
            }
            let entry = self.entries.get(block as usize).copied().ok_or_else(|| {
                PoleError::bad(format!(
                    "block {} out of range (table has {} entries)",
                    block,
                    self.count()
                ))
            })?;
            chain.push(block);

            match entry {
                BlockEntry::Eof => return Ok(chain),
                BlockEntry::Next(next) => block = next,
                other => {
                    return Err(PoleError::bad(format!(
                        "chain from block {} runs into {:?} at block {}",
                        start, other, block
                    )));
                }
            }
        }
    }

    /// Replace the table with 4-byte little-endian entries from `data`
    pub fn load(&mut self, data: &[u8]) {
        self.entries.clear();
        self.entries.reserve(data.len() / 4);

        let mut buf = data;
        while buf.remaining() >= 4 {
            self.entries.push(BlockEntry::from_raw(buf.get_u32_le()));
        }
    }

    /// Serialize the table, padded with `Avail` up to `total` entries
    pub fn save(&self, total: usize) -> BytesMut {
        let total = total.max(self.count());
        let mut buf = BytesMut::with_capacity(total * 4);
        for entry in &self.entries {
            buf.put_u32_le(entry.to_raw());
        }
        for _ in self.count()..total {
            buf.put_u32_le(BlockEntry::Avail.to_raw());
        }
        buf
    }
}

// =============================================================================
// Tests
// =============================================================================
