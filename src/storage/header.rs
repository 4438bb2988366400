//! Compound-file header
//!
//! Parses and serializes the fixed 512-byte header at the start of the file.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{PoleError, Result};

use super::alloc::{BlockEntry, BlockIndex};

/// Magic signature identifying an OLE2 compound file
pub(crate) const MAGIC: [u8; 8] = [0xd0, 0xcf, 0x11, 0xe0, 0xa1, 0xb1, 0x1a, 0xe1];

/// On-disk header size; for 4096-byte blocks the rest of block -1 is zero padding
pub(crate) const HEADER_SIZE: usize = 512;

/// BAT block pointers stored inline in the header
pub(crate) const HEADER_BAT_SLOTS: usize = 109;

/// Streams of at least this many bytes live in big blocks
pub(crate) const THRESHOLD: u32 = 4096;

const MINOR_VERSION: u16 = 0x003e;
const BYTE_ORDER: u16 = 0xfffe;

/// In-memory header
///
/// Field layout (little-endian):
/// ```text
/// 0x00 magic (8) | 0x08 clsid (16) | 0x18 minor (2) | 0x1A major (2)
/// 0x1C byte order (2) | 0x1E b_shift (2) | 0x20 s_shift (2) | reserved (6)
/// 0x28 dir blocks (4) | 0x2C num_bat (4) | 0x30 dirent_start (4)
/// 0x34 txn signature (4) | 0x38 threshold (4) | 0x3C sbat_start (4)
/// 0x40 num_sbat (4) | 0x44 mbat_start (4) | 0x48 num_mbat (4)
/// 0x4C bb_blocks[109] (436)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Header {
    pub b_shift: u16,
    pub s_shift: u16,
    pub num_bat: u32,
    pub dirent_start: BlockIndex,
    pub threshold: u32,
    pub sbat_start: BlockIndex,
    pub num_sbat: u32,
    pub mbat_start: BlockIndex,
    pub num_mbat: u32,
    pub bb_blocks: [BlockIndex; HEADER_BAT_SLOTS],
}

impl Header {
    /// Header for a fresh container with the given block shifts
    pub fn new(b_shift: u16, s_shift: u16) -> Self {
        let eof = BlockEntry::Eof.to_raw();
        Self {
            b_shift,
            s_shift,
            num_bat: 0,
            dirent_start: eof,
            threshold: THRESHOLD,
            sbat_start: eof,
            num_sbat: 0,
            mbat_start: eof,
            num_mbat: 0,
            bb_blocks: [BlockEntry::Avail.to_raw(); HEADER_BAT_SLOTS],
        }
    }

    pub fn big_block_size(&self) -> usize {
        1 << self.b_shift
    }

    pub fn small_block_size(&self) -> usize {
        1 << self.s_shift
    }

    /// Parse a header, failing `NotOle` on a magic mismatch
    pub fn load(data: &[u8]) -> Result<Self> {
        if data.len() < MAGIC.len() || data[..MAGIC.len()] != MAGIC {
            return Err(PoleError::NotOle);
        }
        if data.len() < HEADER_SIZE {
            return Err(PoleError::bad(format!(
                "header truncated: {} of {} bytes",
                data.len(),
                HEADER_SIZE
            )));
        }

        let mut buf = &data[MAGIC.len()..HEADER_SIZE];
        buf.advance(16 + 2 + 2 + 2); // clsid, minor, major, byte order
        let b_shift = buf.get_u16_le();
        let s_shift = buf.get_u16_le();
        buf.advance(6 + 4); // reserved, dir block count
        let num_bat = buf.get_u32_le();
        let dirent_start = buf.get_u32_le();
        buf.advance(4); // transaction signature
        let threshold = buf.get_u32_le();
        let sbat_start = buf.get_u32_le();
        let num_sbat = buf.get_u32_le();
        let mbat_start = buf.get_u32_le();
        let num_mbat = buf.get_u32_le();

        let mut bb_blocks = [0; HEADER_BAT_SLOTS];
        for slot in bb_blocks.iter_mut() {
            *slot = buf.get_u32_le();
        }

        Ok(Self {
            b_shift,
            s_shift,
            num_bat,
            dirent_start,
            threshold,
            sbat_start,
            num_sbat,
            mbat_start,
            num_mbat,
            bb_blocks,
        })
    }

    /// Sanity checks on a loaded header
    pub fn validate(&self) -> Result<()> {
        if self.threshold != THRESHOLD {
            return Err(PoleError::bad(format!("unsupported threshold {}", self.threshold)));
        }
        if !(7..=16).contains(&self.b_shift) {
            return Err(PoleError::bad(format!("invalid big block shift {}", self.b_shift)));
        }
        if self.s_shift == 0 || self.s_shift > self.b_shift {
            return Err(PoleError::bad(format!("invalid small block shift {}", self.s_shift)));
        }
        if self.num_bat == 0 {
            return Err(PoleError::bad("no BAT blocks"));
        }

        let per_mbat = (self.big_block_size() / 4 - 1) as u64;
        let inline = HEADER_BAT_SLOTS as u64;
        let num_bat = self.num_bat as u64;
        if num_bat > inline && num_bat > inline + self.num_mbat as u64 * per_mbat {
            return Err(PoleError::bad(format!(
                "{} BAT blocks cannot be addressed by {} MBAT blocks",
                self.num_bat, self.num_mbat
            )));
        }
        if num_bat <= inline && self.num_mbat != 0 {
            return Err(PoleError::bad("MBAT present without BAT overflow"));
        }
        Ok(())
    }

    /// Serialize into a full big block (header followed by zero padding)
    pub fn save(&self) -> BytesMut {
        let block_size = self.big_block_size().max(HEADER_SIZE);
        let mut buf = BytesMut::with_capacity(block_size);

        buf.put_slice(&MAGIC);
        buf.put_bytes(0, 16); // clsid
        buf.put_u16_le(MINOR_VERSION);
        buf.put_u16_le(if self.b_shift >= 12 { 4 } else { 3 });
        buf.put_u16_le(BYTE_ORDER);
        buf.put_u16_le(self.b_shift);
        buf.put_u16_le(self.s_shift);
        buf.put_bytes(0, 6);
        buf.put_u32_le(0); // directory block count, must be 0 for version 3
        buf.put_u32_le(self.num_bat);
        buf.put_u32_le(self.dirent_start);
        buf.put_u32_le(0);
        buf.put_u32_le(self.threshold);
        buf.put_u32_le(self.sbat_start);
        buf.put_u32_le(self.num_sbat);
        buf.put_u32_le(self.mbat_start);
        buf.put_u32_le(self.num_mbat);
        for &block in &self.bb_blocks {
            buf.put_u32_le(block);
        }

        buf.put_bytes(0, block_size - HEADER_SIZE);
        buf
    }
}

// =============================================================================
// Tests
// =============================================================================
