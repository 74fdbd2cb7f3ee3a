//! Ordered key/value backend contract.

use crate::error::StorageResult;
use std::ops::Bound;

/// Value returned by a scan visitor to continue or stop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    /// Keep visiting pairs.
    Continue,
    /// Stop the scan; the transaction stays usable.
    Stop,
}

/// Visitor invoked for each key/value pair during a scan.
pub type ScanVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> ScanControl + 'a;

/// An ordered byte-key/byte-value store with transactions.
///
/// Backends are **opaque byte stores**: they do not interpret keys or values.
/// QuillDB owns the key layout and value encoding.
///
/// # Invariants
///
/// - Keys are ordered bytewise (`memcmp`)
/// - A transaction sees a consistent snapshot taken at `begin`
/// - A write transaction observes its own writes in program order
/// - `commit` applies all writes of a transaction atomically
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing and ephemeral databases
/// - [`super::FileBackend`] - For persistent storage
pub trait KvBackend: Send + Sync {
    /// Begins a new transaction.
    ///
    /// Read-only transactions never block. Write transactions are
    /// serialized by the backend.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Conflict`] if a write transaction
    /// cannot be started, or [`crate::StorageError::Closed`] after `close`.
    fn begin(&self, read_only: bool) -> StorageResult<Box<dyn KvTransaction>>;

    /// Flushes and releases backend resources.
    ///
    /// # Errors
    ///
    /// Returns an error if pending data cannot be made durable.
    fn close(&self) -> StorageResult<()>;
}

/// A transaction over a [`KvBackend`].
///
/// Dropping a transaction without committing rolls it back.
pub trait KvTransaction {
    /// Returns true if this transaction cannot write.
    fn is_read_only(&self) -> bool;

    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to read.
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadOnly`] on a read-only transaction.
    fn set(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Removes `key`. Removing an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadOnly`] on a read-only transaction.
    fn delete(&mut self, key: &[u8]) -> StorageResult<()>;

    /// Visits all pairs whose key lies within `(lower, upper)` in ascending
    /// or descending key order.
    ///
    /// Returns `true` if the visitor stopped the scan early.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to read.
    fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        reverse: bool,
        visit: &mut ScanVisitor<'_>,
    ) -> StorageResult<bool>;

    /// Visits all pairs whose key starts with `prefix`.
    ///
    /// Returns `true` if the visitor stopped the scan early.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to read.
    fn iterate(
        &self,
        prefix: &[u8],
        reverse: bool,
        visit: &mut ScanVisitor<'_>,
    ) -> StorageResult<bool> {
        match prefix_upper_bound(prefix) {
            Some(upper) => self.scan(
                Bound::Included(prefix),
                Bound::Excluded(&upper),
                reverse,
                visit,
            ),
            None => self.scan(Bound::Included(prefix), Bound::Unbounded, reverse, visit),
        }
    }

    /// Atomically applies all writes of this transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the writes cannot be made durable. Nothing
    /// becomes visible in that case.
    fn commit(self: Box<Self>) -> StorageResult<()>;

    /// Discards all writes of this transaction.
    ///
    /// # Errors
    ///
    /// Backends may report errors releasing resources.
    fn rollback(self: Box<Self>) -> StorageResult<()>;
}

/// Returns the smallest key greater than every key starting with `prefix`,
/// or `None` if no such key exists (empty prefix or all `0xFF`).
#[must_use]
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < 0xFF {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}
