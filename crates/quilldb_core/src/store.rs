//! Document storage and index maintenance.
//!
//! Every function here works inside a caller-provided transaction. Document
//! writes and the matching index and TTL entries always go through the same
//! transaction, so a commit publishes them together.

use crate::catalog::CollectionMeta;
use crate::document::{Document, ID_FIELD};
use crate::error::{CoreError, CoreResult};
use crate::index::{open_index, Index};
use crate::keys;
use chrono::{DateTime, Utc};
use quilldb_codec::{decode_document, encode_document, is_indexable, values_equal, Value};
use quilldb_storage::{KvTransaction, ScanControl};
use uuid::Uuid;

fn decode(collection: &str, bytes: &[u8]) -> CoreResult<Document> {
    decode_document(bytes)
        .map(Document::from_map)
        .map_err(|err| CoreError::invalid_format(format!("document in {collection}: {err}")))
}

/// Reads a document, expired or not.
pub(crate) fn load(
    tx: &dyn KvTransaction,
    collection: &str,
    id: &str,
) -> CoreResult<Option<Document>> {
    tx.get(&keys::doc_key(collection, id))?
        .map(|bytes| decode(collection, &bytes))
        .transpose()
}

/// Visits every document of a collection in id order.
///
/// Returns `true` if the visitor stopped early.
pub(crate) fn scan(
    tx: &dyn KvTransaction,
    collection: &str,
    reverse: bool,
    visit: &mut dyn FnMut(Document) -> CoreResult<bool>,
) -> CoreResult<bool> {
    let mut failure = None;
    let stopped = tx.iterate(&keys::doc_prefix(collection), reverse, &mut |_, bytes| {
        match decode(collection, bytes).and_then(&mut *visit) {
            Ok(true) => ScanControl::Continue,
            Ok(false) => ScanControl::Stop,
            Err(err) => {
                failure = Some(err);
                ScanControl::Stop
            }
        }
    })?;
    match failure {
        Some(err) => Err(err),
        None => Ok(stopped),
    }
}

/// The value an index on `field` holds for `doc`, if any.
///
/// Missing fields, nulls and values without a key encoding are not indexed.
pub(crate) fn indexed_value<'a>(doc: &'a Document, field: &str) -> Option<&'a Value> {
    doc.get(field).filter(|v| !v.is_null() && is_indexable(v))
}

/// Expiry stamp of a document, if it expires.
pub(crate) fn expiry_of(doc: &Document) -> Option<u64> {
    doc.expires_at().map(|at| keys::expiry_stamp(&at))
}

fn document_id(doc: &Document) -> CoreResult<&str> {
    doc.object_id()
        .ok_or_else(|| CoreError::invalid_input("document has no _id"))
}

/// Assigns `_id` (when absent) and `_created_at` to a document about to be
/// inserted and returns its id.
pub(crate) fn prepare_insert(doc: &mut Document, now: DateTime<Utc>) -> CoreResult<String> {
    let id = match doc.get(ID_FIELD) {
        None => Uuid::new_v4().to_string(),
        Some(Value::Text(id)) if !id.is_empty() => id.clone(),
        Some(Value::Text(_)) => return Err(CoreError::invalid_input("_id must not be empty")),
        Some(other) => {
            return Err(CoreError::invalid_input(format!(
                "_id must be a string, found {}",
                other.kind()
            )))
        }
    };
    doc.set_object_id(id.clone());
    doc.set_created_at(now);
    Ok(id)
}

/// Inserts a prepared document.
///
/// An expired document holding the same id is reclaimed first; a live one
/// makes the insert fail with [`CoreError::DuplicateId`].
pub(crate) fn insert(
    tx: &mut dyn KvTransaction,
    meta: &CollectionMeta,
    doc: &Document,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let id = document_id(doc)?;
    if let Some(existing) = load(&*tx, &meta.name, id)? {
        if !existing.is_expired_at(now) {
            return Err(CoreError::DuplicateId {
                collection: meta.name.clone(),
                id: id.to_string(),
            });
        }
        remove(tx, meta, &existing)?;
    }
    write(tx, meta, None, doc)
}

/// Writes `new`, replacing `old` (the stored version of the same id).
///
/// Only index entries whose value or expiry changed are rewritten.
pub(crate) fn write(
    tx: &mut dyn KvTransaction,
    meta: &CollectionMeta,
    old: Option<&Document>,
    new: &Document,
) -> CoreResult<()> {
    let id = document_id(new)?;
    let bytes = encode_document(new.as_map())?;
    tx.set(&keys::doc_key(&meta.name, id), &bytes)?;

    let old_expiry = old.and_then(expiry_of);
    let new_expiry = expiry_of(new);
    for info in &meta.indexes {
        let index = open_index(info);
        let before = old.and_then(|doc| indexed_value(doc, &info.field));
        let after = indexed_value(new, &info.field);
        let unchanged = match (before, after) {
            (Some(a), Some(b)) => values_equal(a, b) && old_expiry == new_expiry,
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            continue;
        }
        if let Some(value) = before {
            index.remove(tx, id, value)?;
        }
        if let Some(value) = after {
            index.add(tx, id, value, new_expiry)?;
        }
    }

    if old_expiry != new_expiry {
        if let Some(stamp) = old_expiry {
            tx.delete(&keys::ttl_key(stamp, &meta.name, id))?;
        }
        if let Some(stamp) = new_expiry {
            tx.set(&keys::ttl_key(stamp, &meta.name, id), &[])?;
        }
    }
    Ok(())
}

/// Deletes a stored document with its index and TTL entries.
pub(crate) fn remove(
    tx: &mut dyn KvTransaction,
    meta: &CollectionMeta,
    doc: &Document,
) -> CoreResult<()> {
    let id = document_id(doc)?;
    for info in &meta.indexes {
        if let Some(value) = indexed_value(doc, &info.field) {
            open_index(info).remove(tx, id, value)?;
        }
    }
    if let Some(stamp) = expiry_of(doc) {
        tx.delete(&keys::ttl_key(stamp, &meta.name, id))?;
    }
    tx.delete(&keys::doc_key(&meta.name, id))?;
    Ok(())
}

/// Adds an entry to `index` for every document of the collection that
/// holds an indexable value. Returns the number of entries written.
pub(crate) fn backfill(
    tx: &mut dyn KvTransaction,
    collection: &str,
    index: &dyn Index,
) -> CoreResult<usize> {
    let mut entries = Vec::new();
    scan(&*tx, collection, false, &mut |doc| {
        if let (Some(id), Some(value)) = (doc.object_id(), indexed_value(&doc, index.field())) {
            entries.push((id.to_string(), value.clone(), expiry_of(&doc)));
        }
        Ok(true)
    })?;
    for (id, value, expiry) in &entries {
        index.add(tx, id, value, *expiry)?;
    }
    Ok(entries.len())
}

/// Deletes every key starting with `prefix` and returns how many there were.
pub(crate) fn delete_prefix(tx: &mut dyn KvTransaction, prefix: &[u8]) -> CoreResult<usize> {
    let mut doomed = Vec::new();
    tx.iterate(prefix, false, &mut |key, _| {
        doomed.push(key.to_vec());
        ScanControl::Continue
    })?;
    for key in &doomed {
        tx.delete(key)?;
    }
    Ok(doomed.len())
}

/// Deletes every document of a collection with its index and TTL entries.
/// Returns the number of documents removed.
pub(crate) fn purge(tx: &mut dyn KvTransaction, collection: &str) -> CoreResult<usize> {
    let mut ttl_keys = Vec::new();
    scan(&*tx, collection, false, &mut |doc| {
        if let (Some(id), Some(stamp)) = (doc.object_id(), expiry_of(&doc)) {
            ttl_keys.push(keys::ttl_key(stamp, collection, id));
        }
        Ok(true)
    })?;
    for key in &ttl_keys {
        tx.delete(key)?;
    }
    delete_prefix(tx, &keys::collection_index_prefix(collection))?;
    delete_prefix(tx, &keys::doc_prefix(collection))
}
