//! Database configuration.

use quilldb_storage::{FileBackendOptions, DEFAULT_LOCK_TIMEOUT};
use std::time::Duration;

/// Current on-disk schema version, stored in the schema record.
pub const FORMAT_VERSION: u16 = 1;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database directory if it doesn't exist.
    pub create_if_missing: bool,

    /// How often the background sweeper removes expired documents
    /// (`Duration::ZERO` disables the sweeper thread).
    pub sweep_interval: Duration,

    /// Whether queries may use secondary indexes. When false every query
    /// runs as a full collection scan.
    pub use_indexes: bool,

    /// How long a write transaction waits for the backend write lock.
    pub lock_timeout: Duration,

    /// Whether to sync the commit log on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Schema version written to new databases and required on open.
    pub format_version: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sweep_interval: Duration::from_secs(1),
            use_indexes: true,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            sync_on_commit: true,
            format_version: FORMAT_VERSION,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the sweeper period.
    #[must_use]
    pub const fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets whether queries may use indexes.
    #[must_use]
    pub const fn use_indexes(mut self, value: bool) -> Self {
        self.use_indexes = value;
        self
    }

    /// Sets the write lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets whether to sync the commit log on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Backend options derived from this configuration.
    #[must_use]
    pub fn file_backend_options(&self) -> FileBackendOptions {
        FileBackendOptions {
            create_if_missing: self.create_if_missing,
            sync_on_commit: self.sync_on_commit,
            lock_timeout: self.lock_timeout,
        }
    }
}
