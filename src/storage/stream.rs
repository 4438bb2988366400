//! Stream
//!
//! Caller-facing handle on one stream of a `Storage`.

use std::sync::Weak;

use parking_lot::Mutex;

use super::io::StorageIO;
use super::stream_io::StreamIO;

/// Byte cursor over one stream
///
/// Reads and writes never return errors. A problem (corrupt chain, write to
/// a read-only container, closed storage) latches `fail()` and the calls
/// return zero bytes from then on.
pub struct Stream {
    io: Weak<Mutex<StorageIO>>,
    slot: usize,
    generation: u64,
    full_name: String,
}

impl Stream {
    pub(crate) fn new(io: Weak<Mutex<StorageIO>>, slot: usize, generation: u64, full_name: String) -> Self {
        Self {
            io,
            slot,
            generation,
            full_name,
        }
    }

    /// Run `f` on the live StreamIO, or return `default` if the storage is gone
    fn with<R>(&self, default: R, f: impl FnOnce(&mut StreamIO, &mut StorageIO) -> R) -> R {
        let Some(io) = self.io.upgrade() else {
            return default;
        };
        let mut io = io.lock();
        io.with_stream(self.generation, self.slot, f).unwrap_or(default)
    }

    /// Absolute path of the stream, e.g. `/ObjectPool/_1234/Ole`
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.with(0, |s, io| s.size(io))
    }

    /// Cursor position
    pub fn tell(&self) -> u64 {
        self.with(0, |s, _| s.tell())
    }

    /// Move the cursor; positions past the end clamp to `size()`
    pub fn seek(&mut self, pos: u64) {
        self.with((), |s, io| s.seek(io, pos))
    }

    /// Next byte, or `None` at end of stream
    pub fn getch(&mut self) -> Option<u8> {
        self.with(None, |s, io| s.getch(io))
    }

    /// Read into `buf` at the cursor; returns the number of bytes copied
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.with(0, |s, io| s.read(io, buf))
    }

    /// Read into `buf` at `pos`, leaving the cursor alone
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> usize {
        self.with(0, |s, io| s.read_at(io, pos, buf))
    }

    /// Whole payload, independent of the cursor
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let mut data = vec![0u8; self.size() as usize];
        let n = self.read_at(0, &mut data);
        data.truncate(n);
        data
    }

    /// Write `data` at the cursor and advance it
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.with(0, |s, io| s.write(io, data))
    }

    /// Write `data` at `pos`; gaps past the current end read back as zeros
    pub fn write_at(&mut self, pos: u64, data: &[u8]) -> usize {
        self.with(0, |s, io| s.write_at(io, pos, data))
    }

    /// True once a read ran into the end of the stream (cleared by `seek`)
    pub fn eof(&self) -> bool {
        self.with(false, |s, _| s.eof())
    }

    /// True once the stream hit an error, or if its storage was closed
    pub fn fail(&self) -> bool {
        self.with(true, |s, _| s.fail())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Some(io) = self.io.upgrade() {
            io.lock().release_stream(self.generation, self.slot);
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("full_name", &self.full_name)
            .field("slot", &self.slot)
            .finish()
    }
}
