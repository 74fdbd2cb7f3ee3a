//! Ordered single-field index.

use super::{IdVisitor, Index, IndexKind, IterMode};
use crate::error::{CoreError, CoreResult};
use crate::keys;
use quilldb_codec::{write_key, Value};
use quilldb_storage::{prefix_upper_bound, KvTransaction, ScanControl};
use std::ops::Bound;

/// An ordered index over one field of a collection.
///
/// Entries are stored as `I + collection + field + keycode(value) + id`, so
/// a bytewise range scan over the backend yields ids in value order. The
/// entry value carries the owning document's expiry stamp (or nothing).
///
/// # Use Cases
///
/// - Equality lookups (`age = 30`)
/// - Range queries (`age > 20 AND age < 40`)
/// - Streaming results sorted by the indexed field
///
/// # Example
///
/// ```rust
/// use quilldb_core::{Index, IterMode, RangeIndex, Value};
/// use quilldb_storage::{InMemoryBackend, KvBackend};
///
/// let backend = InMemoryBackend::new();
/// let index = RangeIndex::new("users", "age");
///
/// let mut tx = backend.begin(false).unwrap();
/// index.add(tx.as_mut(), "A", &Value::from(30), None).unwrap();
/// index.add(tx.as_mut(), "B", &Value::from(25), None).unwrap();
///
/// let mut ids = Vec::new();
/// index
///     .iterate(tx.as_ref(), &IterMode::FullRange, false, &mut |id| {
///         ids.push(id.to_string());
///         Ok(true)
///     })
///     .unwrap();
/// assert_eq!(ids, ["B", "A"]);
/// ```
#[derive(Debug, Clone)]
pub struct RangeIndex {
    collection: String,
    field: String,
    prefix: Vec<u8>,
}

impl RangeIndex {
    /// Creates a handle to the index on `collection.field`.
    #[must_use]
    pub fn new(collection: &str, field: &str) -> Self {
        Self {
            collection: collection.to_string(),
            field: field.to_string(),
            prefix: keys::index_prefix(collection, field),
        }
    }

    fn entry_key(&self, value: &Value, id: &str) -> CoreResult<Vec<u8>> {
        keys::index_key(&self.collection, &self.field, value, id)
    }

    fn value_prefix(&self, value: &Value) -> CoreResult<Vec<u8>> {
        let mut key = self.prefix.clone();
        write_key(value, &mut key)?;
        Ok(key)
    }

    /// Key range covering `mode`, or `None` if it is empty.
    fn key_range(&self, mode: &IterMode) -> CoreResult<Option<(Bound<Vec<u8>>, Bound<Vec<u8>>)>> {
        let range = match mode {
            IterMode::FullRange => (
                Bound::Included(self.prefix.clone()),
                past_prefix(&self.prefix),
            ),
            IterMode::Equality(value) => {
                let start = self.value_prefix(value)?;
                let end = past_prefix(&start);
                (Bound::Included(start), end)
            }
            IterMode::Range { low, high } => {
                let low = match low {
                    Bound::Unbounded => Bound::Included(self.prefix.clone()),
                    Bound::Included(v) => Bound::Included(self.value_prefix(v)?),
                    Bound::Excluded(v) => match prefix_upper_bound(&self.value_prefix(v)?) {
                        Some(next) => Bound::Included(next),
                        None => return Ok(None),
                    },
                };
                let high = match high {
                    Bound::Unbounded => past_prefix(&self.prefix),
                    Bound::Included(v) => past_prefix(&self.value_prefix(v)?),
                    Bound::Excluded(v) => Bound::Excluded(self.value_prefix(v)?),
                };
                (low, high)
            }
        };
        Ok(Some(range))
    }
}

/// Exclusive bound just past every key starting with `prefix`.
fn past_prefix(prefix: &[u8]) -> Bound<Vec<u8>> {
    prefix_upper_bound(prefix).map_or(Bound::Unbounded, Bound::Excluded)
}

impl Index for RangeIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Range
    }

    fn collection(&self) -> &str {
        &self.collection
    }

    fn field(&self) -> &str {
        &self.field
    }

    fn add(
        &self,
        tx: &mut dyn KvTransaction,
        id: &str,
        value: &Value,
        expiry: Option<u64>,
    ) -> CoreResult<()> {
        let key = self.entry_key(value, id)?;
        tx.set(&key, &keys::index_entry_value(expiry))?;
        Ok(())
    }

    fn remove(&self, tx: &mut dyn KvTransaction, id: &str, value: &Value) -> CoreResult<()> {
        let key = self.entry_key(value, id)?;
        tx.delete(&key)?;
        Ok(())
    }

    fn iterate(
        &self,
        tx: &dyn KvTransaction,
        mode: &IterMode,
        reverse: bool,
        on_value: &mut IdVisitor<'_>,
    ) -> CoreResult<bool> {
        let Some((low, high)) = self.key_range(mode)? else {
            return Ok(false);
        };
        let now = keys::now_stamp();
        let prefix_len = self.prefix.len();
        let mut failure: Option<CoreError> = None;

        let stopped = tx.scan(
            low.as_ref().map(Vec::as_slice),
            high.as_ref().map(Vec::as_slice),
            reverse,
            &mut |key, value| {
                if keys::parse_index_entry_value(value).is_some_and(|stamp| stamp <= now) {
                    return ScanControl::Continue;
                }
                let step = keys::parse_index_id(key, prefix_len).and_then(|id| on_value(&id));
                match step {
                    Ok(true) => ScanControl::Continue,
                    Ok(false) => ScanControl::Stop,
                    Err(err) => {
                        failure = Some(err);
                        ScanControl::Stop
                    }
                }
            },
        )?;

        match failure {
            Some(err) => Err(err),
            None => Ok(stopped),
        }
    }

    fn drop_entries(&self, tx: &mut dyn KvTransaction) -> CoreResult<usize> {
        let mut doomed = Vec::new();
        tx.iterate(&self.prefix, false, &mut |key, _| {
            doomed.push(key.to_vec());
            ScanControl::Continue
        })?;
        for key in &doomed {
            tx.delete(key)?;
        }
        Ok(doomed.len())
    }
}
