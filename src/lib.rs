//! # POLE
//!
//! Portable access to OLE2 structured storage (compound documents), the
//! container format behind legacy Office files, MSI packages and friends:
//! - Header, BAT/SBAT/MBAT and directory parsing with corruption checks
//! - Stream reads with byte-level cursor and small-block routing
//! - Folder/stream creation, in-place writes and deletion
//! - Deterministic metadata rebuild on flush
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Storage  /  Stream  (public API)              │
//! │            Arc<Mutex<StorageIO>>  /  Weak + slot id          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                       StorageIO                              │
//! │     header · block I/O · staged writes · flush · streams     │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┼─────────────┐
//!          │            │             │
//!          ▼            ▼             ▼
//!   ┌─────────────┐ ┌─────────┐ ┌─────────────┐
//!   │ AllocTable  │ │ DirTree │ │  StreamIO   │
//!   │ (BAT, SBAT) │ │         │ │  (cursor)   │
//!   └─────────────┘ └─────────┘ └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod storage;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{PoleError, Result, StorageResult};
pub use config::{AccessMode, Config};
pub use storage::{ContainerInfo, Storage, Stream};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of POLE
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
