//! StreamIO
//!
//! Cursor over one stream's block chain. Holds a resolved copy of the chain
//! plus a small read window for `getch()`; both are re-derived whenever the
//! owning `StorageIO` reports a layout change.
//!
//! Errors never escape a StreamIO: the first one latches `fail()` and every
//! later call returns zero bytes.

use crate::error::{PoleError, Result};

use super::alloc::BlockIndex;
use super::dirtree::EntryIndex;
use super::io::StorageIO;

pub(crate) struct StreamIO {
    entry: EntryIndex,
    full_name: String,

    size: u64,
    big: bool,
    blocks: Vec<BlockIndex>,
    epoch: u64,

    pos: u64,
    eof: bool,
    fail: bool,

    cache: Vec<u8>,
    cache_pos: u64,
    cache_len: usize,
}

impl StreamIO {
    pub fn new(io: &StorageIO, entry: EntryIndex, full_name: String) -> Result<Self> {
        let mut stream = Self {
            entry,
            full_name,
            size: 0,
            big: false,
            blocks: Vec::new(),
            epoch: io.layout_epoch(),
            pos: 0,
            eof: false,
            fail: false,
            cache: vec![0; io.config().stream_cache_size.max(1)],
            cache_pos: 0,
            cache_len: 0,
        };
        stream.resolve(io)?;
        Ok(stream)
    }

    /// Current size, picking up growth made through other handles
    pub fn size(&mut self, io: &StorageIO) -> u64 {
        self.refresh(io);
        self.size
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    pub fn fail(&self) -> bool {
        self.fail
    }

    /// Move the cursor, clamped to `[0, size]`
    pub fn seek(&mut self, io: &StorageIO, pos: u64) {
        self.refresh(io);
        self.pos = pos.min(self.size);
        self.eof = false;
        self.cache_len = 0;
    }

    /// Next byte at the cursor, `None` at end of stream or after a failure
    pub fn getch(&mut self, io: &StorageIO) -> Option<u8> {
        if !self.refresh(io) {
            return None;
        }
        if self.pos >= self.size {
            self.eof = true;
            return None;
        }

        let cached = self.pos >= self.cache_pos && self.pos < self.cache_pos + self.cache_len as u64;
        if !cached {
            let window = self.cache.len() as u64;
            self.cache_pos = self.pos - self.pos % window;
            let want = window.min(self.size - self.cache_pos) as usize;
            let loaded = io.read_chain(&self.blocks, self.big, self.cache_pos, &mut self.cache[..want]);
            self.cache_len = self.latch(loaded).unwrap_or(0);
            if self.pos >= self.cache_pos + self.cache_len as u64 {
                self.cache_len = 0;
                self.eof = true;
                return None;
            }
        }

        let byte = self.cache[(self.pos - self.cache_pos) as usize];
        self.pos += 1;
        Some(byte)
    }

    /// Read at the cursor and advance it by the bytes returned
    pub fn read(&mut self, io: &StorageIO, buf: &mut [u8]) -> usize {
        let n = self.read_at(io, self.pos, buf);
        self.pos += n as u64;
        n
    }

    /// Read at `pos` without touching the cursor
    ///
    /// A short count means the stream (or the file under it) ended; `eof()`
    /// is set in that case.
    pub fn read_at(&mut self, io: &StorageIO, pos: u64, buf: &mut [u8]) -> usize {
        if !self.refresh(io) || buf.is_empty() {
            return 0;
        }
        if pos >= self.size {
            self.eof = true;
            return 0;
        }

        let want = (buf.len() as u64).min(self.size - pos) as usize;
        let loaded = io.read_chain(&self.blocks, self.big, pos, &mut buf[..want]);
        let n = self.latch(loaded).unwrap_or(0);
        if n < buf.len() {
            self.eof = true;
        }
        n
    }

    /// Write at the cursor and advance it
    pub fn write(&mut self, io: &mut StorageIO, data: &[u8]) -> usize {
        let n = self.write_at(io, self.pos, data);
        self.pos += n as u64;
        n
    }

    /// Write at `pos`, growing the stream when writing past its end
    pub fn write_at(&mut self, io: &mut StorageIO, pos: u64, data: &[u8]) -> usize {
        if !self.refresh(io) {
            return 0;
        }
        let written = io.write_stream(self.entry, pos, data);
        let n = self.latch(written).unwrap_or(0);
        self.refresh(io);
        self.cache_len = 0;
        n
    }

    /// Re-derive size and chain if the container layout moved
    ///
    /// Returns false once the stream has failed.
    fn refresh(&mut self, io: &StorageIO) -> bool {
        if self.fail {
            return false;
        }
        if self.epoch != io.layout_epoch() {
            let resolved = self.resolve(io);
            self.latch(resolved);
        }
        !self.fail
    }

    fn resolve(&mut self, io: &StorageIO) -> Result<()> {
        let tree = io.dirtree();
        let record = tree
            .lookup(&self.full_name)
            .ok_or_else(|| PoleError::NotFound(self.full_name.clone()))?;
        let entry = tree
            .index_of(record)
            .ok_or_else(|| PoleError::NotFound(self.full_name.clone()))?;
        if record.is_dir {
            return Err(PoleError::NotAStream(self.full_name.clone()));
        }

        let (blocks, big) = io.chain_for(record)?;
        self.entry = entry;
        self.size = record.size;
        self.big = big;
        self.blocks = blocks;
        self.epoch = io.layout_epoch();
        self.cache_len = 0;
        self.pos = self.pos.min(self.size);
        Ok(())
    }

    /// Turn an error into the sticky fail state
    fn latch<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(stream = %self.full_name, error = %e, "stream failed");
                self.fail = true;
                None
            }
        }
    }
}
