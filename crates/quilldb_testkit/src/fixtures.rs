//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases
//! and common test scenarios.

use quilldb_core::{Config, Database, Document};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Configuration used by fixtures: defaults with the background sweeper
/// disabled, so tests decide when expired documents are reclaimed.
#[must_use]
pub fn test_config() -> Config {
    Config::default().sweep_interval(Duration::ZERO)
}

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    config: Config,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    pub fn memory() -> Self {
        Self::memory_with_config(test_config())
    }

    /// Creates a new in-memory test database with custom configuration.
    pub fn memory_with_config(config: Config) -> Self {
        Self {
            db: Database::open_in_memory_with_config(config.clone())
                .expect("Failed to open in-memory database"),
            config,
            temp_dir: None,
        }
    }

    /// Creates a new file-based test database in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = test_config();
        let db = Database::open_with_config(&temp_dir.path().join("db"), config.clone())
            .expect("Failed to open file database");
        Self {
            db,
            config,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the database path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join("db"))
    }

    /// Closes and reopens a file-based database.
    ///
    /// # Panics
    ///
    /// Panics for in-memory databases, whose contents do not survive a
    /// close.
    #[must_use]
    pub fn reopen(self) -> Self {
        let path = self.path().expect("Only file databases can be reopened");
        let Self {
            db,
            config,
            temp_dir,
        } = self;
        db.close().expect("Failed to close database");
        drop(db);
        Self {
            db: Database::open_with_config(&path, config.clone())
                .expect("Failed to reopen database"),
            config,
            temp_dir,
        }
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust
/// use quilldb_testkit::with_temp_db;
///
/// with_temp_db(|db| {
///     db.create_collection("test").unwrap();
///     assert!(db.has_collection("test").unwrap());
/// });
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::memory();
    f(&test_db.db)
}

/// Runs a test with a temporary file-based database.
pub fn with_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database, &Path) -> R,
{
    let test_db = TestDatabase::file();
    let path = test_db.path().expect("File database should have a path");
    f(&test_db.db, &path)
}

/// Builds a document from a JSON object literal.
///
/// # Example
///
/// ```rust
/// use quilldb_testkit::doc;
///
/// let user = doc(serde_json::json!({ "_id": "A", "age": 30 }));
/// assert_eq!(user.object_id(), Some("A"));
/// ```
pub fn doc(json: serde_json::Value) -> Document {
    Document::from_serialize(&json).expect("Failed to build document")
}

/// Collects the ids of `docs` in order.
pub fn ids(docs: &[Document]) -> Vec<String> {
    docs.iter()
        .map(|d| d.object_id().unwrap_or_default().to_string())
        .collect()
}

/// Collects the ids of `docs` in ascending order.
pub fn sorted_ids(docs: &[Document]) -> Vec<String> {
    let mut ids = ids(docs);
    ids.sort();
    ids
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use serde_json::json;

    /// Creates the `people` collection with documents `A` (30), `B` (25)
    /// and `C` (30) and an index on `age`.
    pub fn people_database() -> TestDatabase {
        let test_db = TestDatabase::memory();
        test_db
            .create_collection("people")
            .expect("Failed to create collection");
        test_db
            .create_index("people", "age")
            .expect("Failed to create index");
        test_db
            .insert(
                "people",
                [
                    doc(json!({ "_id": "A", "age": 30 })),
                    doc(json!({ "_id": "B", "age": 25 })),
                    doc(json!({ "_id": "C", "age": 30 })),
                ],
            )
            .expect("Failed to insert people");
        test_db
    }

    /// Creates the `items` collection holding `count` documents with ids
    /// `item-0000`... and fields `n` (the position), `group` (`n % 7`) and
    /// `name`.
    pub fn populated_database(count: usize) -> TestDatabase {
        let test_db = TestDatabase::memory();
        test_db
            .create_collection("items")
            .expect("Failed to create collection");
        let docs = (0..count).map(|n| {
            doc(json!({
                "_id": format!("item-{n:04}"),
                "n": n,
                "group": n % 7,
                "name": format!("item {n}"),
            }))
        });
        test_db.insert("items", docs).expect("Failed to insert items");
        test_db
    }
}
