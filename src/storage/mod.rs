//! Storage Module
//!
//! Compound-file (OLE2 structured storage) container: a small filesystem of
//! folders and streams packed into one file of fixed-size blocks.
//!
//! ## Responsibilities
//! - Parse the header and both allocation tables
//! - Resolve block chains to stream bytes
//! - Navigate and edit the directory tree
//! - Stage writes and rebuild the metadata on flush
//!
//! ## File Format
//! ```text
//! ┌────────────────────────────────────────┐
//! │ Header (block -1, 512 bytes used)      │
//! │ ┌──────────┬──────────┬──────────────┐ │
//! │ │Magic (8) │ Shifts   │ BAT pointers │ │
//! │ └──────────┴──────────┴──────────────┘ │
//! ├────────────────────────────────────────┤
//! │ Big blocks 0..n (1 << b_shift each)    │
//! │ ┌────────┬────────┬─────┬───────────┐  │
//! │ │  BAT   │  Dir   │SBAT │  Data ... │  │
//! │ └────────┴────────┴─────┴───────────┘  │
//! │ (any order; each role is a BAT chain)  │
//! ├────────────────────────────────────────┤
//! │ Short-stream container                 │
//! │ (root entry's chain, cut into 64-byte  │
//! │  small blocks indexed by the SBAT)     │
//! └────────────────────────────────────────┘
//! ```
//!
//! Streams below 4096 bytes live in small blocks; everything else, the
//! metadata included, lives in big blocks.

mod alloc;
mod container;
mod dirtree;
mod header;
mod io;
mod stream;
mod stream_io;

pub use alloc::{BlockEntry, BlockIndex};
pub use container::Storage;
pub use io::ContainerInfo;
pub use stream::Stream;
