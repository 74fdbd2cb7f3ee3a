//! File-based backend for persistent storage.

use crate::backend::{KvBackend, KvTransaction};
use crate::error::{StorageError, StorageResult};
use crate::log::CommitLog;
use crate::memory::{Engine, DEFAULT_LOCK_TIMEOUT};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// File names within the backend directory.
const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "data.log";

/// Options for opening a [`FileBackend`].
#[derive(Debug, Clone)]
pub struct FileBackendOptions {
    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,
    /// Whether to fsync the commit log on every commit.
    pub sync_on_commit: bool,
    /// How long a writer waits for the write lock.
    pub lock_timeout: Duration,
}

impl Default for FileBackendOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// A file-based ordered key/value backend.
///
/// The key space lives in memory and every commit is appended to a commit
/// log inside the backend directory. Opening the backend replays the log.
///
/// ```text
/// <dir>/
/// ├─ LOCK        # Advisory lock for single-process access
/// └─ data.log    # Commit log
/// ```
///
/// # Durability
///
/// With `sync_on_commit` (the default) a commit returns only after its batch
/// is on disk.
///
/// # Example
///
/// ```no_run
/// use quilldb_storage::{FileBackend, FileBackendOptions, KvBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("my_db"), FileBackendOptions::default()).unwrap();
/// let mut tx = backend.begin(false).unwrap();
/// tx.set(b"key", b"persistent data").unwrap();
/// tx.commit().unwrap();
/// ```
pub struct FileBackend {
    path: PathBuf,
    engine: Arc<Engine>,
    /// Lock file handle (held for exclusive access).
    _lock_file: File,
}

impl FileBackend {
    /// Opens or creates a backend in the directory `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (`Locked`)
    /// - The commit log is corrupted before its tail (`Corrupted`)
    /// - I/O errors occur
    pub fn open(path: &Path, options: FileBackendOptions) -> StorageResult<Self> {
        if !path.exists() {
            if options.create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("backend directory does not exist: {}", path.display()),
                )));
            }
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        let (log, data) = CommitLog::open(&path.join(LOG_FILE), options.sync_on_commit)?;
        tracing::debug!(path = %path.display(), keys = data.len(), "file backend opened");

        Ok(Self {
            path: path.to_path_buf(),
            engine: Arc::new(Engine::new(data, Some(log), options.lock_timeout)),
            _lock_file: lock_file,
        })
    }

    /// Returns the backend directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the commit log so it holds only the live key space.
    ///
    /// # Errors
    ///
    /// Returns an error if the new log cannot be written.
    pub fn compact(&self) -> StorageResult<()> {
        self.engine.compact()
    }

    /// Returns the number of committed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.engine.len()
    }

    /// Returns true if no key is committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("path", &self.path)
            .field("keys", &self.len())
            .finish()
    }
}

impl KvBackend for FileBackend {
    fn begin(&self, read_only: bool) -> StorageResult<Box<dyn KvTransaction>> {
        self.engine.begin(read_only)
    }

    fn close(&self) -> StorageResult<()> {
        self.engine.close()
    }
}
