//! Secondary indexes.
//!
//! Indexes live in the same key space as documents and are maintained in the
//! same transaction as the documents they cover. An index over `field`
//! holds one entry per document whose `field` is present, non-null and
//! orderable, keyed so that a bytewise scan visits entries in value order
//! (ties by document id).
//!
//! # Index Types
//!
//! - [`RangeIndex`]: single-field index supporting equality and range scans
//!
//! Entries may carry the owning document's expiry instant. Expired entries
//! are skipped by iteration until the sweeper removes them.

mod range;

pub use range::RangeIndex;

use crate::error::CoreResult;
use quilldb_codec::Value;
use quilldb_storage::KvTransaction;
use serde::{Deserialize, Serialize};
use std::ops::Bound;

/// Kind of an index.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Single-field ordered index.
    Range,
}

/// Description of a declared index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Collection the index belongs to.
    pub collection: String,
    /// Indexed field path.
    pub field: String,
    /// Index kind.
    pub kind: IndexKind,
}

/// Which entries an index iteration visits.
#[derive(Debug, Clone, PartialEq)]
pub enum IterMode {
    /// Every entry.
    FullRange,
    /// Entries whose value equals the given value.
    Equality(Value),
    /// Entries whose value lies between the bounds.
    Range {
        /// Lower bound.
        low: Bound<Value>,
        /// Upper bound.
        high: Bound<Value>,
    },
}

/// Visitor receiving document ids; returns `false` to stop iteration.
pub type IdVisitor<'a> = dyn FnMut(&str) -> CoreResult<bool> + 'a;

/// Operations every index kind provides.
pub trait Index: Send + Sync {
    /// Returns the index kind.
    fn kind(&self) -> IndexKind;

    /// Returns the collection name.
    fn collection(&self) -> &str;

    /// Returns the indexed field path.
    fn field(&self) -> &str;

    /// Adds an entry for document `id` holding `value`.
    ///
    /// Adding the same `(id, value)` twice leaves one entry. `expiry` is the
    /// owning document's expiry stamp, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not orderable or the backend fails.
    fn add(
        &self,
        tx: &mut dyn KvTransaction,
        id: &str,
        value: &Value,
        expiry: Option<u64>,
    ) -> CoreResult<()>;

    /// Removes the entry for document `id` holding `value`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn remove(&self, tx: &mut dyn KvTransaction, id: &str, value: &Value) -> CoreResult<()>;

    /// Visits the ids of matching entries in value order.
    ///
    /// Returns `true` if the visitor stopped iteration early.
    ///
    /// # Errors
    ///
    /// Propagates visitor and backend errors.
    fn iterate(
        &self,
        tx: &dyn KvTransaction,
        mode: &IterMode,
        reverse: bool,
        on_value: &mut IdVisitor<'_>,
    ) -> CoreResult<bool>;

    /// Deletes every entry of the index and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn drop_entries(&self, tx: &mut dyn KvTransaction) -> CoreResult<usize>;
}

/// Instantiates the index described by `info`.
#[must_use]
pub fn open_index(info: &IndexInfo) -> Box<dyn Index> {
    match info.kind {
        IndexKind::Range => Box::new(RangeIndex::new(&info.collection, &info.field)),
    }
}
