//! Collection catalog.
//!
//! Each collection has a metadata record under `M + name` holding its
//! creation instant and declared indexes. The catalog caches all records in
//! memory; the cache is changed only after the transaction that wrote the
//! record has committed.

use crate::error::{CoreError, CoreResult};
use crate::index::{IndexInfo, IndexKind};
use crate::keys;
use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use quilldb_codec::{decode_document, encode_document, from_document, to_document};
use quilldb_storage::{KvTransaction, ScanControl};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMeta {
    /// Collection name.
    pub name: String,
    /// When the collection was created.
    #[serde(with = "quilldb_codec::datetime")]
    pub created_at: DateTime<Utc>,
    /// Declared indexes.
    #[serde(default)]
    pub indexes: Vec<IndexInfo>,
}

impl CollectionMeta {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created_at: Utc::now(),
            indexes: Vec::new(),
        }
    }

    /// Returns the index declared on `field`, if any.
    #[must_use]
    pub fn index(&self, field: &str) -> Option<&IndexInfo> {
        self.indexes.iter().find(|info| info.field == field)
    }

    /// Returns true if `field` is indexed.
    #[must_use]
    pub fn has_index(&self, field: &str) -> bool {
        self.index(field).is_some()
    }

    pub(crate) fn with_index(&self, field: &str) -> Self {
        let mut next = self.clone();
        next.indexes.push(IndexInfo {
            collection: self.name.clone(),
            field: field.to_string(),
            kind: IndexKind::Range,
        });
        next
    }

    pub(crate) fn without_index(&self, field: &str) -> Self {
        let mut next = self.clone();
        next.indexes.retain(|info| info.field != field);
        next
    }
}

/// Cached metadata of all collections, keyed by name.
pub(crate) type Collections = BTreeMap<String, CollectionMeta>;

/// In-memory view of all collection metadata.
#[derive(Debug, Default)]
pub(crate) struct Catalog {
    collections: RwLock<Collections>,
}

impl Catalog {
    /// Loads every metadata record visible to `tx`.
    pub(crate) fn load(tx: &dyn KvTransaction) -> CoreResult<Self> {
        let mut collections = Collections::new();
        let mut failure = None;
        tx.iterate(&keys::meta_prefix(), false, &mut |key, value| {
            if key == keys::SCHEMA_KEY {
                return ScanControl::Continue;
            }
            match decode_meta(key, value) {
                Ok(meta) => {
                    collections.insert(meta.name.clone(), meta);
                    ScanControl::Continue
                }
                Err(err) => {
                    failure = Some(err);
                    ScanControl::Stop
                }
            }
        })?;
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(Self {
            collections: RwLock::new(collections),
        })
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Collections> {
        self.collections.read_recursive()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Collections> {
        self.collections.write()
    }
}

fn decode_meta(key: &[u8], value: &[u8]) -> CoreResult<CollectionMeta> {
    let name = keys::parse_meta_key(key)?;
    let meta: CollectionMeta = from_document(decode_document(value)?)
        .map_err(|err| CoreError::invalid_format(format!("metadata of {name}: {err}")))?;
    if meta.name != name {
        return Err(CoreError::invalid_format(format!(
            "metadata under {name} names collection {}",
            meta.name
        )));
    }
    Ok(meta)
}

/// Writes the metadata record of `meta.name`.
pub(crate) fn put_meta(tx: &mut dyn KvTransaction, meta: &CollectionMeta) -> CoreResult<()> {
    let bytes = encode_document(&to_document(meta)?)?;
    tx.set(&keys::meta_key(&meta.name), &bytes)?;
    Ok(())
}

/// Deletes the metadata record of `name`.
pub(crate) fn delete_meta(tx: &mut dyn KvTransaction, name: &str) -> CoreResult<()> {
    tx.delete(&keys::meta_key(name))?;
    Ok(())
}

/// Looks up a collection in a locked catalog view.
pub(crate) fn lookup<'a>(collections: &'a Collections, name: &str) -> CoreResult<&'a CollectionMeta> {
    collections
        .get(name)
        .ok_or_else(|| CoreError::collection_not_found(name))
}
