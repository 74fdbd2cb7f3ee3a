//! # QuillDB Core
//!
//! Embedded document database engine for QuillDB.
//!
//! This crate provides:
//! - Collections of schemaless documents stored as canonical CBOR
//! - Secondary range indexes maintained atomically with every write
//! - A query engine with criteria, sorting, skip/limit and an index planner
//! - Document expiration with a background sweeper
//!
//! All data lives in one ordered key/value backend from `quilldb_storage`.
//!
//! ## Example
//!
//! ```rust
//! use quilldb_core::query::{field, Direction, Query};
//! use quilldb_core::{Database, Document};
//!
//! let db = Database::open_in_memory().unwrap();
//! db.create_collection("users").unwrap();
//! db.create_index("users", "age").unwrap();
//!
//! for (name, age) in [("alice", 31), ("bob", 27), ("carol", 45)] {
//!     let mut user = Document::new();
//!     user.set("name", name);
//!     user.set("age", age);
//!     db.insert_one("users", user).unwrap();
//! }
//!
//! let query = Query::new("users")
//!     .filter(field("age").gte(30))
//!     .sort("age", Direction::Ascending);
//! assert!(db.explain(&query).unwrap().uses_index());
//! assert_eq!(db.count(&query).unwrap(), 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod catalog;
mod config;
mod database;
mod document;
mod error;
pub mod index;
mod keys;
pub mod query;
mod store;
mod sweeper;

pub use catalog::CollectionMeta;
pub use config::{Config, FORMAT_VERSION};
pub use database::Database;
pub use document::{Document, CREATED_AT_FIELD, EXPIRES_AT_FIELD, ID_FIELD};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use index::{open_index, Index, IndexInfo, IndexKind, IterMode, RangeIndex};
pub use query::{field, Criterion, Direction, Plan, Query};

pub use quilldb_codec::{Value, ValueKind, ValueMap};
pub use quilldb_storage::{FileBackend, InMemoryBackend, KvBackend};
