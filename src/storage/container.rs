//! Storage
//!
//! Public handle on one compound file.
//!
//! ## Concurrency Model
//!
//! - All state lives in one `StorageIO` behind a `parking_lot::Mutex`.
//! - `Stream` handles keep only a `Weak` reference plus a slot id, so a
//!   stream never keeps its container alive and never outlives it: after
//!   `close()` or drop, stream calls return zero bytes and `fail()` is true.
//! - Every public call takes the lock once; there is no lock nesting.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Result, StorageResult};

use super::io::{ContainerInfo, StorageIO};
use super::stream::Stream;

/// A compound document on disk
///
/// ```no_run
/// use pole::Storage;
///
/// let mut storage = Storage::new("report.doc");
/// storage.open()?;
/// for name in storage.entries("/") {
///     println!("{}", name);
/// }
/// let mut stream = storage.stream("/WordDocument", false)?;
/// let payload = stream.read_to_end();
/// # Ok::<(), pole::PoleError>(())
/// ```
pub struct Storage {
    io: Arc<Mutex<StorageIO>>,
}

impl Storage {
    /// Storage for `path` with the default (read-only) config; nothing is read yet
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_config(path, Config::default())
    }

    pub fn with_config(path: impl AsRef<Path>, config: Config) -> Self {
        Self {
            io: Arc::new(Mutex::new(StorageIO::new(path.as_ref(), config))),
        }
    }

    /// Shorthand for `with_config(path, config)` followed by `open()`
    pub fn open_path(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let mut storage = Self::with_config(path, config);
        storage.open()?;
        Ok(storage)
    }

    /// Shorthand for `with_config(path, config)` followed by `create()`
    pub fn create_path(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let mut storage = Self::with_config(path, config);
        storage.create()?;
        Ok(storage)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the file and load its header, tables and directory
    ///
    /// The outcome is also kept as the sticky `result()` code.
    pub fn open(&mut self) -> Result<()> {
        self.io.lock().open()
    }

    /// Start a new, empty container (written on flush/close)
    pub fn create(&mut self) -> Result<()> {
        self.io.lock().create()
    }

    /// Persist staged changes and rebuild the on-disk metadata
    pub fn flush(&mut self) -> Result<()> {
        self.io.lock().flush()
    }

    /// Flush if dirty and release the file; open streams become invalid
    pub fn close(&mut self) -> Result<()> {
        self.io.lock().close()
    }

    /// Outcome of the last `open()`/`create()`
    pub fn result(&self) -> StorageResult {
        self.io.lock().result()
    }

    pub fn is_open(&self) -> bool {
        self.io.lock().is_open()
    }

    pub fn path(&self) -> PathBuf {
        self.io.lock().path().to_path_buf()
    }

    pub fn info(&self) -> ContainerInfo {
        self.io.lock().info()
    }

    // =========================================================================
    // Directory Queries
    // =========================================================================

    /// Names of the children of the folder at `path`, in sibling order
    ///
    /// Empty when `path` does not exist or is a stream.
    pub fn entries(&self, path: &str) -> Vec<String> {
        let io = self.io.lock();
        let tree = io.dirtree();
        match tree.find(path) {
            Some(index) if tree.entry(index).is_ok_and(|e| e.is_dir) => tree
                .children(index)
                .into_iter()
                .filter_map(|child| tree.entry(child).ok().map(|e| e.name.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// True iff `path` names a folder (the root included)
    pub fn is_directory(&self, path: &str) -> bool {
        self.io.lock().dirtree().lookup(path).is_some_and(|e| e.is_dir)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.io.lock().dirtree().find(path).is_some()
    }

    // =========================================================================
    // Streams
    // =========================================================================

    /// Open the stream at `path`
    ///
    /// With `reuse`, handles to the same path share one cursor and read
    /// window; otherwise every handle gets its own.
    pub fn stream(&self, path: &str, reuse: bool) -> Result<Stream> {
        let mut io = self.io.lock();
        let (slot, full_name) = io.stream_io(path, reuse)?;
        Ok(Stream::new(Arc::downgrade(&self.io), slot, io.generation(), full_name))
    }

    /// Create an empty stream (and any missing parent folders)
    ///
    /// An existing stream at `path` is opened as is.
    pub fn create_stream(&mut self, path: &str) -> Result<Stream> {
        self.io.lock().create_entry(path, false)?;
        self.stream(path, false)
    }

    /// Create a folder (and any missing parent folders)
    pub fn create_dir(&mut self, path: &str) -> Result<()> {
        self.io.lock().create_entry(path, true).map(|_| ())
    }

    /// Remove a stream, or a folder with everything below it
    pub fn delete(&mut self, path: &str) -> Result<()> {
        self.io.lock().delete_entry(path)
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(e) = self.io.lock().close() {
            tracing::warn!(error = %e, "failed to close compound file on drop");
        }
    }
}
