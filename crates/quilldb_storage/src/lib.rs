//! # QuillDB Storage
//!
//! Ordered transactional key/value backends for QuillDB.
//!
//! This crate provides the lowest-level storage abstraction for QuillDB.
//! Backends are **opaque ordered byte stores** - they do not interpret
//! the keys and values they store.
//!
//! ## Design Principles
//!
//! - Keys are ordered bytewise; scans run forward or in reverse
//! - Every transaction reads from a consistent snapshot
//! - Commits are atomic across all keys of a transaction
//! - Must be `Send + Sync` for concurrent access
//! - QuillDB owns the key layout and value encoding
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - For persistent storage backed by a commit log
//!
//! ## Example
//!
//! ```rust
//! use quilldb_storage::{InMemoryBackend, KvBackend, ScanControl};
//!
//! let backend = InMemoryBackend::new();
//! let mut tx = backend.begin(false).unwrap();
//! tx.set(b"user/1", b"alice").unwrap();
//! tx.set(b"user/2", b"bob").unwrap();
//! tx.commit().unwrap();
//!
//! let tx = backend.begin(true).unwrap();
//! let mut names = Vec::new();
//! tx.iterate(b"user/", false, &mut |_, v| {
//!     names.push(v.to_vec());
//!     ScanControl::Continue
//! })
//! .unwrap();
//! assert_eq!(names.len(), 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod log;
mod memory;

pub use backend::{prefix_upper_bound, KvBackend, KvTransaction, ScanControl, ScanVisitor};
pub use error::{StorageError, StorageResult};
pub use file::{FileBackend, FileBackendOptions};
pub use log::{compute_crc32, BATCH_MAGIC};
pub use memory::{InMemoryBackend, DEFAULT_LOCK_TIMEOUT};
