//! Error types for POLE
//!
//! Provides a unified error type for all operations, plus the sticky
//! result code reported by [`Storage::result`](crate::Storage::result).

use thiserror::Error;

/// Result type alias using PoleError
pub type Result<T> = std::result::Result<T, PoleError>;

/// Unified error type for compound-file operations
#[derive(Debug, Error)]
pub enum PoleError {
    // -------------------------------------------------------------------------
    // Open / Format Errors
    // -------------------------------------------------------------------------
    #[error("Failed to open file: {0}")]
    OpenFailed(#[source] std::io::Error),

    #[error("Not an OLE compound file (bad magic signature)")]
    NotOle,

    #[error("Corrupt OLE compound file: {0}")]
    BadOle(String),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Directory Errors
    // -------------------------------------------------------------------------
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Not a stream: {0}")]
    NotAStream(String),

    #[error("Invalid entry name: {0}")]
    InvalidName(String),

    #[error("Index {index} out of range (count {count})")]
    OutOfRange { index: u64, count: u64 },

    #[error("Stream size {size} exceeds the format limit of {max}")]
    TooLarge { size: u64, max: u64 },

    // -------------------------------------------------------------------------
    // State Errors
    // -------------------------------------------------------------------------
    #[error("Storage is opened read-only")]
    ReadOnly,

    #[error("Storage is closed")]
    Closed,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl PoleError {
    /// Shorthand for a structural-inconsistency error
    pub(crate) fn bad(msg: impl Into<String>) -> Self {
        PoleError::BadOle(msg.into())
    }

    /// Map this error onto the four-way result taxonomy
    pub fn code(&self) -> StorageResult {
        match self {
            PoleError::OpenFailed(_) => StorageResult::OpenFailed,
            PoleError::NotOle => StorageResult::NotOle,
            PoleError::BadOle(_) | PoleError::OutOfRange { .. } => StorageResult::BadOle,
            _ => StorageResult::UnknownError,
        }
    }
}

/// Sticky outcome of the last open/create on a [`Storage`](crate::Storage)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageResult {
    #[default]
    Ok,
    OpenFailed,
    NotOle,
    BadOle,
    UnknownError,
}

impl StorageResult {
    pub fn is_ok(self) -> bool {
        self == StorageResult::Ok
    }
}
