//! Configuration for POLE
//!
//! Centralized configuration with sensible defaults.

/// How a container file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Reads only; any write attempt fails with `ReadOnly`
    #[default]
    ReadOnly,

    /// Reads and in-place updates, persisted on `flush()`/`close()`
    ReadWrite,
}

/// Main configuration for a Storage instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Layout Configuration (used by create only; open reads the header)
    // -------------------------------------------------------------------------
    /// Big block size = 1 << big_block_shift (9 = 512 bytes, 12 = 4096 bytes)
    pub big_block_shift: u16,

    /// Small block size = 1 << small_block_shift
    pub small_block_shift: u16,

    // -------------------------------------------------------------------------
    // Stream Configuration
    // -------------------------------------------------------------------------
    /// Size of the per-stream read window used by `getch()` (in bytes)
    pub stream_cache_size: usize,

    // -------------------------------------------------------------------------
    // Access Configuration
    // -------------------------------------------------------------------------
    /// Access mode for `open()`; `create()` is always read-write
    pub access: AccessMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            big_block_shift: 9,
            small_block_shift: 6,
            stream_cache_size: 4096,
            access: AccessMode::ReadOnly,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Big block size in bytes
    pub fn big_block_size(&self) -> usize {
        1 << self.big_block_shift
    }

    /// Small block size in bytes
    pub fn small_block_size(&self) -> usize {
        1 << self.small_block_shift
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the big block shift (only 9 and 12 are valid compound-file layouts)
    pub fn big_block_shift(mut self, shift: u16) -> Self {
        self.config.big_block_shift = shift;
        self
    }

    /// Set the small block shift
    pub fn small_block_shift(mut self, shift: u16) -> Self {
        self.config.small_block_shift = shift;
        self
    }

    /// Set the stream read-cache window (in bytes, minimum 1)
    pub fn stream_cache_size(mut self, size: usize) -> Self {
        self.config.stream_cache_size = size.max(1);
        self
    }

    /// Set the access mode used by `open()`
    pub fn access(mut self, access: AccessMode) -> Self {
        self.config.access = access;
        self
    }

    /// Shorthand for `access(AccessMode::ReadWrite)`
    pub fn writable(self) -> Self {
        self.access(AccessMode::ReadWrite)
    }

    pub fn build(self) -> Config {
        self.config
    }
}
