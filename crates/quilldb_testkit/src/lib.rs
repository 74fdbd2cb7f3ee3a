//! # QuillDB Testkit
//!
//! Test utilities for QuillDB.
//!
//! This crate provides:
//! - Test fixtures and database helpers
//! - Property-based test generators using proptest
//!
//! The integration tests under `tests/` exercise the whole stack through
//! the public API: the reference scenarios and the database-wide
//! properties (index faithfulness, plan equivalence, expiration).
//!
//! ## Usage
//!
//! ```rust
//! use quilldb_testkit::prelude::*;
//!
//! with_temp_db(|db| {
//!     db.create_collection("test").unwrap();
//!     db.insert_one("test", doc(serde_json::json!({ "n": 1 }))).unwrap();
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
