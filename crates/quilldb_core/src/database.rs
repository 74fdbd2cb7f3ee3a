//! Database facade and open-time recovery.

use crate::catalog::{self, Catalog, CollectionMeta, Collections};
use crate::config::Config;
use crate::document::{Document, ID_FIELD};
use crate::error::{CoreError, CoreResult};
use crate::index::{open_index, IndexInfo, RangeIndex};
use crate::keys;
use crate::query::exec::{self, DocVisitor};
use crate::query::{self, Plan, Query};
use crate::store;
use crate::sweeper::{self, Sweeper};
use chrono::Utc;
use parking_lot::Mutex;
use quilldb_codec::{values_equal, ValueMap};
use quilldb_storage::{
    prefix_upper_bound, FileBackend, InMemoryBackend, KvBackend, KvTransaction, ScanControl,
};
use std::convert::Infallible;
use std::fmt;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Catalog change applied after a schema transaction commits.
enum CatalogUpdate {
    Keep,
    Put(CollectionMeta),
    Remove(String),
}

/// State shared between the database handle and the sweeper thread.
pub(crate) struct Inner {
    backend: Arc<dyn KvBackend>,
    catalog: Catalog,
    config: Config,
    closed: AtomicBool,
}

impl Inner {
    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CoreError::DatabaseClosed)
        } else {
            Ok(())
        }
    }

    /// Runs `f` in a read transaction.
    pub(crate) fn read<T>(
        &self,
        f: impl FnOnce(&dyn KvTransaction, &Collections) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.ensure_open()?;
        let collections = self.catalog.read();
        let tx = self.backend.begin(true)?;
        f(tx.as_ref(), &collections)
    }

    /// Runs `f` in a write transaction, committing on success.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&mut dyn KvTransaction, &Collections) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.ensure_open()?;
        let collections = self.catalog.read();
        let mut tx = self.backend.begin(false)?;
        match f(tx.as_mut(), &collections) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                abort(tx);
                Err(err)
            }
        }
    }

    /// Runs a schema change with exclusive access to the catalog.
    fn alter<T>(
        &self,
        f: impl FnOnce(&mut dyn KvTransaction, &Collections) -> CoreResult<(T, CatalogUpdate)>,
    ) -> CoreResult<T> {
        self.ensure_open()?;
        let mut collections = self.catalog.write();
        let mut tx = self.backend.begin(false)?;
        let (value, update) = match f(tx.as_mut(), &collections) {
            Ok(done) => done,
            Err(err) => {
                abort(tx);
                return Err(err);
            }
        };
        tx.commit()?;
        match update {
            CatalogUpdate::Keep => {}
            CatalogUpdate::Put(meta) => {
                collections.insert(meta.name.clone(), meta);
            }
            CatalogUpdate::Remove(name) => {
                collections.remove(&name);
            }
        }
        Ok(value)
    }

    fn plan(&self, meta: &CollectionMeta, query: &Query) -> Plan {
        let plan = if self.config.use_indexes {
            query::plan(query.criterion(), meta)
        } else {
            Plan::FullScan
        };
        tracing::debug!(collection = %meta.name, %plan, "query planned");
        plan
    }

    /// Runs a query, falling back to a scan if a planned index vanished.
    fn execute(
        &self,
        tx: &dyn KvTransaction,
        meta: &CollectionMeta,
        query: &Query,
        visit: &mut DocVisitor<'_>,
    ) -> CoreResult<()> {
        let plan = self.plan(meta, query);
        match exec::execute(tx, meta, query, &plan, visit) {
            Err(CoreError::IndexUnavailable { field, .. }) => {
                tracing::debug!(collection = %meta.name, %field, "planned index unavailable, scanning");
                exec::execute(tx, meta, query, &Plan::FullScan, visit)
            }
            result => result,
        }
    }

    fn matching(
        &self,
        tx: &dyn KvTransaction,
        meta: &CollectionMeta,
        query: &Query,
    ) -> CoreResult<Vec<Document>> {
        let mut docs = Vec::new();
        self.execute(tx, meta, query, &mut |doc| {
            docs.push(doc);
            Ok(true)
        })?;
        Ok(docs)
    }
}

fn abort(tx: Box<dyn KvTransaction>) {
    if let Err(err) = tx.rollback() {
        tracing::warn!(error = %err, "rollback failed");
    }
}

/// The main database handle.
///
/// `Database` is the entry point for QuillDB. It provides:
/// - Collection management
/// - Document insert, query, update and delete
/// - Secondary index management
/// - Background removal of expired documents
///
/// Every operation runs in its own backend transaction; a failed operation
/// leaves no partial writes behind.
///
/// # Example
///
/// ```rust
/// use quilldb_core::query::{field, Query};
/// use quilldb_core::{Database, Document};
///
/// let db = Database::open_in_memory().unwrap();
/// db.create_collection("todos").unwrap();
///
/// let mut todo = Document::new();
/// todo.set("title", "write docs");
/// todo.set("completed", false);
/// let id = db.insert_one("todos", todo).unwrap();
///
/// let open = db
///     .find_all(&Query::new("todos").filter(field("completed").eq(false)))
///     .unwrap();
/// assert_eq!(open[0].object_id(), Some(id.as_str()));
/// ```
pub struct Database {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Database {
    /// Opens or creates a database in the directory `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process has the database locked
    /// - The directory holds a database of another format (`InvalidFormat`)
    /// - I/O errors occur
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens or creates a database in `path` with custom configuration.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use quilldb_core::{Config, Database};
    /// use std::path::Path;
    ///
    /// let config = Config::default().sync_on_commit(false);
    /// let db = Database::open_with_config(Path::new("my_database"), config).unwrap();
    /// ```
    ///
    /// # Errors
    ///
    /// See [`Database::open`].
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        let backend = FileBackend::open(path, config.file_backend_options())?;
        tracing::info!(path = %path.display(), "opening database");
        Self::open_with_backend(config, Arc::new(backend))
    }

    /// Opens a fresh in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweeper thread cannot be started.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_in_memory_with_config(Config::default())
    }

    /// Opens a fresh in-memory database with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweeper thread cannot be started.
    pub fn open_in_memory_with_config(config: Config) -> CoreResult<Self> {
        let backend = InMemoryBackend::with_lock_timeout(config.lock_timeout);
        Self::open_with_backend(config, Arc::new(backend))
    }

    /// Opens a database over any ordered key/value backend.
    ///
    /// Checks the schema record (writing it into an empty store), loads the
    /// catalog and removes keys left behind by undeclared collections or
    /// indexes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] if the store holds foreign data
    /// or another format version.
    pub fn open_with_backend(config: Config, backend: Arc<dyn KvBackend>) -> CoreResult<Self> {
        let mut tx = backend.begin(false)?;
        let catalog = match bootstrap(tx.as_mut(), &config) {
            Ok(catalog) => catalog,
            Err(err) => {
                abort(tx);
                return Err(err);
            }
        };
        tx.commit()?;

        let collections = catalog.read().len();
        let interval = config.sweep_interval;
        let inner = Arc::new(Inner {
            backend,
            catalog,
            config,
            closed: AtomicBool::new(false),
        });
        let sweeper = if interval.is_zero() {
            None
        } else {
            Some(Sweeper::spawn(Arc::clone(&inner), interval)?)
        };
        tracing::info!(collections, "database opened");
        Ok(Self {
            inner,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Closes the database. Stops the sweeper and closes the backend.
    ///
    /// Closing twice is a no-op; other operations fail with
    /// [`CoreError::DatabaseClosed`] afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot flush its data.
    pub fn close(&self) -> CoreResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        self.inner.backend.close()?;
        tracing::info!("database closed");
        Ok(())
    }

    /// Checks if the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Returns database configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // ========================================================================
    // Collections
    // ========================================================================

    /// Creates an empty collection.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionExists`] if it already exists, or
    /// [`CoreError::InvalidInput`] for an empty name.
    pub fn create_collection(&self, name: &str) -> CoreResult<()> {
        if name.is_empty() {
            return Err(CoreError::invalid_input("collection name must not be empty"));
        }
        self.inner.alter(|tx, collections| {
            if collections.contains_key(name) {
                return Err(CoreError::CollectionExists {
                    name: name.to_string(),
                });
            }
            let meta = CollectionMeta::new(name);
            catalog::put_meta(tx, &meta)?;
            Ok(((), CatalogUpdate::Put(meta)))
        })?;
        tracing::info!(collection = name, "collection created");
        Ok(())
    }

    /// Drops a collection with all its documents and indexes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] if it does not exist.
    pub fn drop_collection(&self, name: &str) -> CoreResult<()> {
        let removed = self.inner.alter(|tx, collections| {
            catalog::lookup(collections, name)?;
            let removed = store::purge(tx, name)?;
            catalog::delete_meta(tx, name)?;
            Ok((removed, CatalogUpdate::Remove(name.to_string())))
        })?;
        tracing::info!(collection = name, documents = removed, "collection dropped");
        Ok(())
    }

    /// Returns true if the collection exists.
    ///
    /// # Errors
    ///
    /// Fails only if the database is closed.
    pub fn has_collection(&self, name: &str) -> CoreResult<bool> {
        self.inner.ensure_open()?;
        Ok(self.inner.catalog.read().contains_key(name))
    }

    /// Lists collection names in ascending order.
    ///
    /// # Errors
    ///
    /// Fails only if the database is closed.
    pub fn list_collections(&self) -> CoreResult<Vec<String>> {
        self.inner.ensure_open()?;
        Ok(self.inner.catalog.read().keys().cloned().collect())
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Inserts documents and returns their ids.
    ///
    /// Documents without `_id` get a random UUID; every document gets
    /// `_created_at`. Either all documents are inserted or none.
    ///
    /// # Errors
    ///
    /// - [`CoreError::DuplicateId`] if an id is already taken
    /// - [`CoreError::InvalidInput`] if an `_id` is not a non-empty string
    /// - [`CoreError::CollectionNotFound`] if the collection does not exist
    pub fn insert(
        &self,
        collection: &str,
        docs: impl IntoIterator<Item = Document>,
    ) -> CoreResult<Vec<String>> {
        let now = Utc::now();
        let mut docs: Vec<Document> = docs.into_iter().collect();
        let ids = docs
            .iter_mut()
            .map(|doc| store::prepare_insert(doc, now))
            .collect::<CoreResult<Vec<_>>>()?;
        self.inner.write(|tx, collections| {
            let meta = catalog::lookup(collections, collection)?;
            for doc in &docs {
                store::insert(tx, meta, doc, now)?;
            }
            Ok(())
        })?;
        tracing::debug!(collection, count = ids.len(), "documents inserted");
        Ok(ids)
    }

    /// Inserts one document and returns its id.
    ///
    /// # Errors
    ///
    /// See [`Database::insert`].
    pub fn insert_one(&self, collection: &str, doc: Document) -> CoreResult<String> {
        let mut ids = self.insert(collection, [doc])?;
        ids.pop()
            .ok_or_else(|| CoreError::invalid_input("no document inserted"))
    }

    /// Returns the document with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DocumentNotFound`] if it is absent or expired.
    pub fn find_by_id(&self, collection: &str, id: &str) -> CoreResult<Document> {
        self.inner.read(|tx, collections| {
            catalog::lookup(collections, collection)?;
            live_document(tx, collection, id)
        })
    }

    /// Returns every document matching the query.
    ///
    /// # Errors
    ///
    /// - [`CoreError::CollectionNotFound`] if the collection does not exist
    /// - [`CoreError::InvalidInput`] for an invalid criterion
    /// - [`CoreError::Canceled`] if the query deadline passes
    pub fn find_all(&self, query: &Query) -> CoreResult<Vec<Document>> {
        self.inner.read(|tx, collections| {
            let meta = catalog::lookup(collections, query.collection())?;
            self.inner.matching(tx, meta, query)
        })
    }

    /// Returns the first document matching the query.
    ///
    /// # Errors
    ///
    /// See [`Database::find_all`].
    pub fn find_first(&self, query: &Query) -> CoreResult<Option<Document>> {
        let query = query.clone().limit(1);
        Ok(self.find_all(&query)?.into_iter().next())
    }

    /// Calls `f` for each matching document until it returns `Ok(false)`.
    ///
    /// The callback runs inside the query's read transaction and must not
    /// create or drop collections or indexes.
    ///
    /// # Errors
    ///
    /// Errors from `f` abort iteration and are returned as
    /// [`CoreError::Callback`]. See also [`Database::find_all`].
    pub fn for_each<F, E>(&self, query: &Query, mut f: F) -> CoreResult<()>
    where
        F: FnMut(Document) -> Result<bool, E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.inner.read(|tx, collections| {
            let meta = catalog::lookup(collections, query.collection())?;
            self.inner.execute(tx, meta, query, &mut |doc| {
                f(doc).map_err(CoreError::callback)
            })
        })
    }

    /// Counts the matching documents (after skip and limit).
    ///
    /// # Errors
    ///
    /// See [`Database::find_all`].
    pub fn count(&self, query: &Query) -> CoreResult<usize> {
        self.inner.read(|tx, collections| {
            let meta = catalog::lookup(collections, query.collection())?;
            let mut count = 0;
            self.inner.execute(tx, meta, query, &mut |_| {
                count += 1;
                Ok(true)
            })?;
            Ok(count)
        })
    }

    /// Returns true if at least one document matches.
    ///
    /// # Errors
    ///
    /// See [`Database::find_all`].
    pub fn exists(&self, query: &Query) -> CoreResult<bool> {
        self.find_first(query).map(|doc| doc.is_some())
    }

    /// Sets the fields of `patch` (keys are field paths) on every matching
    /// document and returns how many were updated.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] if the patch changes `_id`. See
    /// also [`Database::find_all`].
    pub fn update(&self, query: &Query, patch: &ValueMap) -> CoreResult<usize> {
        self.update_with(query, |doc| {
            apply_patch(doc, patch);
            Ok::<_, Infallible>(())
        })
    }

    /// Sets the fields of `patch` on one document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DocumentNotFound`] if it is absent or expired.
    pub fn update_by_id(&self, collection: &str, id: &str, patch: &ValueMap) -> CoreResult<()> {
        self.inner.write(|tx, collections| {
            let meta = catalog::lookup(collections, collection)?;
            let old = live_document(&*tx, collection, id)?;
            let mut new = old.clone();
            apply_patch(&mut new, patch);
            check_id_kept(&old, &new)?;
            store::write(tx, meta, Some(&old), &new)
        })
    }

    /// Calls `f` on every matching document and stores the result.
    ///
    /// # Errors
    ///
    /// Errors from `f` abort the whole update and are returned as
    /// [`CoreError::Callback`]. Changing `_id` is [`CoreError::InvalidInput`].
    pub fn update_with<F, E>(&self, query: &Query, mut f: F) -> CoreResult<usize>
    where
        F: FnMut(&mut Document) -> Result<(), E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let updated = self.inner.write(|tx, collections| {
            let meta = catalog::lookup(collections, query.collection())?;
            let docs = self.inner.matching(&*tx, meta, query)?;
            for old in &docs {
                let mut new = old.clone();
                f(&mut new).map_err(CoreError::callback)?;
                check_id_kept(old, &new)?;
                store::write(tx, meta, Some(old), &new)?;
            }
            Ok(docs.len())
        })?;
        tracing::debug!(collection = query.collection(), updated, "documents updated");
        Ok(updated)
    }

    /// Replaces a document wholesale, keeping its id.
    ///
    /// `_created_at` is carried over unless `doc` sets it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DocumentNotFound`] if it is absent or expired,
    /// or [`CoreError::InvalidInput`] if `doc` carries a different `_id`.
    pub fn replace_by_id(&self, collection: &str, id: &str, mut doc: Document) -> CoreResult<()> {
        match doc.object_id() {
            Some(existing) if existing != id => {
                return Err(CoreError::invalid_input(format!(
                    "replacement _id {existing:?} differs from {id:?}"
                )))
            }
            _ => doc.set_object_id(id),
        }
        self.inner.write(|tx, collections| {
            let meta = catalog::lookup(collections, collection)?;
            let old = live_document(&*tx, collection, id)?;
            if doc.created_at().is_none() {
                if let Some(created) = old.created_at() {
                    doc.set_created_at(created);
                }
            }
            store::write(tx, meta, Some(&old), &doc)
        })
    }

    /// Deletes every matching document and returns how many were deleted.
    ///
    /// # Errors
    ///
    /// See [`Database::find_all`].
    pub fn delete(&self, query: &Query) -> CoreResult<usize> {
        let deleted = self.inner.write(|tx, collections| {
            let meta = catalog::lookup(collections, query.collection())?;
            let docs = self.inner.matching(&*tx, meta, query)?;
            for doc in &docs {
                store::remove(tx, meta, doc)?;
            }
            Ok(docs.len())
        })?;
        tracing::debug!(collection = query.collection(), deleted, "documents deleted");
        Ok(deleted)
    }

    /// Deletes one document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DocumentNotFound`] if it is absent or expired.
    pub fn delete_by_id(&self, collection: &str, id: &str) -> CoreResult<()> {
        self.inner.write(|tx, collections| {
            let meta = catalog::lookup(collections, collection)?;
            let doc = live_document(&*tx, collection, id)?;
            store::remove(tx, meta, &doc)
        })
    }

    /// Returns the plan the query would run with.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] or, for an invalid
    /// criterion, [`CoreError::InvalidInput`].
    pub fn explain(&self, query: &Query) -> CoreResult<Plan> {
        if let Some(criterion) = query.criterion() {
            criterion.validate()?;
        }
        self.inner.ensure_open()?;
        let collections = self.inner.catalog.read();
        let meta = catalog::lookup(&collections, query.collection())?;
        Ok(self.inner.plan(meta, query))
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    /// Creates a range index on `field` and fills it from existing documents.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexExists`] if the field is already indexed.
    /// If filling fails nothing is written.
    pub fn create_index(&self, collection: &str, field: &str) -> CoreResult<()> {
        if field.is_empty() {
            return Err(CoreError::invalid_input("index field must not be empty"));
        }
        let entries = self.inner.alter(|tx, collections| {
            let meta = catalog::lookup(collections, collection)?;
            if meta.has_index(field) {
                return Err(CoreError::IndexExists {
                    collection: collection.to_string(),
                    field: field.to_string(),
                });
            }
            let next = meta.with_index(field);
            catalog::put_meta(tx, &next)?;
            let entries = store::backfill(tx, collection, &RangeIndex::new(collection, field))?;
            Ok((entries, CatalogUpdate::Put(next)))
        })?;
        tracing::info!(collection, field, entries, "index created");
        Ok(())
    }

    /// Drops the index on `field`. Dropping an absent index is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] if the collection does not
    /// exist.
    pub fn drop_index(&self, collection: &str, field: &str) -> CoreResult<()> {
        let removed = self.inner.alter(|tx, collections| {
            let meta = catalog::lookup(collections, collection)?;
            let Some(info) = meta.index(field) else {
                return Ok((None, CatalogUpdate::Keep));
            };
            let removed = open_index(info).drop_entries(tx)?;
            let next = meta.without_index(field);
            catalog::put_meta(tx, &next)?;
            Ok((Some(removed), CatalogUpdate::Put(next)))
        })?;
        if let Some(entries) = removed {
            tracing::info!(collection, field, entries, "index dropped");
        }
        Ok(())
    }

    /// Returns true if `field` is indexed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] if the collection does not
    /// exist.
    pub fn has_index(&self, collection: &str, field: &str) -> CoreResult<bool> {
        self.inner.ensure_open()?;
        let collections = self.inner.catalog.read();
        Ok(catalog::lookup(&collections, collection)?.has_index(field))
    }

    /// Lists the indexes of a collection.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CollectionNotFound`] if the collection does not
    /// exist.
    pub fn list_indexes(&self, collection: &str) -> CoreResult<Vec<IndexInfo>> {
        self.inner.ensure_open()?;
        let collections = self.inner.catalog.read();
        Ok(catalog::lookup(&collections, collection)?.indexes.clone())
    }

    // ========================================================================
    // Expiration
    // ========================================================================

    /// Removes expired documents now and returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn sweep_expired(&self) -> CoreResult<usize> {
        sweeper::sweep(&self.inner, Utc::now())
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("is_open", &self.is_open())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "failed to close database");
        }
    }
}

fn live_document(tx: &dyn KvTransaction, collection: &str, id: &str) -> CoreResult<Document> {
    match store::load(tx, collection, id)? {
        Some(doc) if !doc.is_expired() => Ok(doc),
        _ => Err(CoreError::document_not_found(collection, id)),
    }
}

fn apply_patch(doc: &mut Document, patch: &ValueMap) {
    for (path, value) in patch {
        doc.set(path, value.clone());
    }
}

fn check_id_kept(old: &Document, new: &Document) -> CoreResult<()> {
    match (old.as_map().get(ID_FIELD), new.as_map().get(ID_FIELD)) {
        (Some(a), Some(b)) if values_equal(a, b) => Ok(()),
        _ => Err(CoreError::invalid_input("_id cannot be changed")),
    }
}

// ============================================================================
// Open-time recovery
// ============================================================================

fn bootstrap(tx: &mut dyn KvTransaction, config: &Config) -> CoreResult<Catalog> {
    check_schema(tx, config.format_version)?;
    let catalog = Catalog::load(&*tx)?;
    let purged = reconcile(tx, &catalog.read())?;
    if purged > 0 {
        tracing::info!(purged, "removed orphaned keys");
    }
    Ok(catalog)
}

fn schema_record(version: u16) -> Vec<u8> {
    let mut record = keys::SCHEMA_MAGIC.to_vec();
    record.extend_from_slice(&version.to_be_bytes());
    record
}

fn check_schema(tx: &mut dyn KvTransaction, version: u16) -> CoreResult<()> {
    let Some(record) = tx.get(keys::SCHEMA_KEY)? else {
        if first_key(&*tx, Bound::Unbounded, Bound::Unbounded)?.is_some() {
            return Err(CoreError::invalid_format(
                "store holds data but no schema record",
            ));
        }
        tx.set(keys::SCHEMA_KEY, &schema_record(version))?;
        return Ok(());
    };
    let Some(rest) = record.strip_prefix(keys::SCHEMA_MAGIC.as_slice()) else {
        return Err(CoreError::invalid_format("not a QuillDB database"));
    };
    let found = <[u8; 2]>::try_from(rest)
        .map(u16::from_be_bytes)
        .map_err(|_| CoreError::invalid_format("malformed schema record"))?;
    if found != version {
        return Err(CoreError::invalid_format(format!(
            "incompatible format version: database is v{found}, expected v{version}"
        )));
    }
    Ok(())
}

fn first_key(
    tx: &dyn KvTransaction,
    lower: Bound<&[u8]>,
    upper: Bound<&[u8]>,
) -> CoreResult<Option<Vec<u8>>> {
    let mut found = None;
    tx.scan(lower, upper, false, &mut |key, _| {
        found = Some(key.to_vec());
        ScanControl::Stop
    })?;
    Ok(found)
}

/// Lists the distinct key groups under `space`, seeking past each group
/// instead of visiting its keys. `group_of` maps a key to its group label
/// and the prefix shared by the group.
fn key_groups<T>(
    tx: &dyn KvTransaction,
    space: &[u8],
    group_of: impl Fn(&[u8]) -> CoreResult<(T, Vec<u8>)>,
) -> CoreResult<Vec<(T, Vec<u8>)>> {
    let end = prefix_upper_bound(space);
    let mut cursor = space.to_vec();
    let mut groups = Vec::new();
    loop {
        let upper = end.as_deref().map_or(Bound::Unbounded, Bound::Excluded);
        let Some(key) = first_key(tx, Bound::Included(cursor.as_slice()), upper)? else {
            break;
        };
        let (label, prefix) = group_of(&key)?;
        let next = prefix_upper_bound(&prefix);
        groups.push((label, prefix));
        match next {
            Some(next) => cursor = next,
            None => break,
        }
    }
    Ok(groups)
}

/// Deletes documents of undeclared collections, entries of undeclared
/// indexes and TTL entries whose document is gone. Returns the number of
/// keys removed.
fn reconcile(tx: &mut dyn KvTransaction, collections: &Collections) -> CoreResult<usize> {
    let mut orphans = Vec::new();

    let docs = key_groups(&*tx, &keys::doc_space(), |key| {
        let collection = keys::parse_collection(key)?;
        let prefix = keys::doc_prefix(&collection);
        Ok((collection, prefix))
    })?;
    for (collection, prefix) in docs {
        if !collections.contains_key(&collection) {
            tracing::warn!(%collection, "removing documents of undeclared collection");
            orphans.push(prefix);
        }
    }

    let indexes = key_groups(&*tx, &keys::index_space(), |key| {
        let collection = keys::parse_collection(key)?;
        let field =
            keys::parse_index_field(key, keys::collection_index_prefix(&collection).len())?;
        let prefix = keys::index_prefix(&collection, &field);
        Ok(((collection, field), prefix))
    })?;
    for ((collection, field), prefix) in indexes {
        let declared = collections
            .get(&collection)
            .is_some_and(|meta| meta.has_index(&field));
        if !declared {
            tracing::warn!(%collection, %field, "removing entries of undeclared index");
            orphans.push(prefix);
        }
    }

    let mut removed = 0;
    for prefix in &orphans {
        removed += store::delete_prefix(tx, prefix)?;
    }

    let view: &dyn KvTransaction = &*tx;
    let mut stale = Vec::new();
    let mut failure = None;
    view.iterate(&keys::ttl_prefix(), false, &mut |key, _| {
        let live = keys::parse_ttl_key(key).and_then(|entry| {
            if !collections.contains_key(&entry.collection) {
                return Ok(false);
            }
            Ok(view.get(&keys::doc_key(&entry.collection, &entry.id))?.is_some())
        });
        match live {
            Ok(true) => {}
            Ok(false) => stale.push(key.to_vec()),
            Err(err) => {
                failure = Some(err);
                return ScanControl::Stop;
            }
        }
        ScanControl::Continue
    })?;
    if let Some(err) = failure {
        return Err(err);
    }
    for key in &stale {
        tx.delete(key)?;
    }
    Ok(removed + stale.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::index::Index;
    use crate::query::{field, Direction};
    use quilldb_codec::Value;
    use serde_json::json;
    use std::time::Duration;

    fn quiet() -> Config {
        Config::default().sweep_interval(Duration::ZERO)
    }

    fn open() -> Database {
        let db = Database::open_in_memory_with_config(quiet()).unwrap();
        db.create_collection("people").unwrap();
        db
    }

    fn person(id: &str, name: &str, age: i64) -> Document {
        Document::from_serialize(&json!({ "_id": id, "name": name, "age": age })).unwrap()
    }

    fn seed(db: &Database) {
        db.insert(
            "people",
            [
                person("a", "Ann", 30),
                person("b", "Bob", 25),
                person("c", "Cid", 41),
            ],
        )
        .unwrap();
    }

    fn names(docs: &[Document]) -> Vec<String> {
        docs.iter()
            .filter_map(|doc| match doc.get("name") {
                Some(Value::Text(name)) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    fn patch(pairs: &[(&str, Value)]) -> ValueMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn open_in_memory_and_close() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.is_open());
        db.close().unwrap();
        db.close().unwrap();
        assert!(!db.is_open());
        assert_eq!(
            db.create_collection("x").unwrap_err().kind(),
            ErrorKind::Closed
        );
        assert_eq!(db.list_collections().unwrap_err().kind(), ErrorKind::Closed);
    }

    #[test]
    fn collection_lifecycle() {
        let db = open();
        db.create_collection("logs").unwrap();
        assert!(matches!(
            db.create_collection("logs"),
            Err(CoreError::CollectionExists { .. })
        ));
        assert_eq!(db.list_collections().unwrap(), ["logs", "people"]);

        db.drop_collection("logs").unwrap();
        assert!(!db.has_collection("logs").unwrap());
        assert!(db.drop_collection("logs").unwrap_err().is_not_found());
        assert_eq!(
            db.create_collection("").unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn insert_assigns_ids_and_timestamps() {
        let db = open();
        let mut doc = Document::new();
        doc.set("name", "Dee");
        let id = db.insert_one("people", doc).unwrap();
        assert_eq!(id.len(), 36);

        let stored = db.find_by_id("people", &id).unwrap();
        assert_eq!(stored.object_id(), Some(id.as_str()));
        assert!(stored.created_at().is_some());
        assert!(db.insert_one("missing", Document::new()).unwrap_err().is_not_found());
    }

    #[test]
    fn duplicate_id_rejects_whole_batch() {
        let db = open();
        seed(&db);
        let err = db
            .insert("people", [person("z", "Zed", 1), person("a", "Again", 2)])
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateId { ref id, .. } if id == "a"));
        assert!(db.find_by_id("people", "z").unwrap_err().is_not_found());
    }

    #[test]
    fn find_count_exists() {
        let db = open();
        seed(&db);
        let adults = Query::new("people")
            .filter(field("age").gte(30))
            .sort("age", Direction::Descending);
        assert_eq!(names(&db.find_all(&adults).unwrap()), ["Cid", "Ann"]);
        assert_eq!(db.count(&adults).unwrap(), 2);
        assert!(db.exists(&adults).unwrap());
        assert_eq!(names(&db.find_first(&adults).unwrap().into_iter().collect::<Vec<_>>()), ["Cid"]);

        let nobody = Query::new("people").filter(field("age").gt(100));
        assert!(!db.exists(&nobody).unwrap());
        assert!(db.find_first(&nobody).unwrap().is_none());
    }

    #[test]
    fn indexed_and_unindexed_queries_agree() {
        let db = open();
        seed(&db);
        let query = Query::new("people")
            .filter(field("age").lt(35))
            .sort("name", Direction::Ascending);
        let before = db.find_all(&query).unwrap();

        db.create_index("people", "age").unwrap();
        assert!(db.explain(&query).unwrap().uses_index());
        assert_eq!(db.find_all(&query).unwrap(), before);
        assert_eq!(names(&before), ["Ann", "Bob"]);
    }

    #[test]
    fn indexes_can_be_disabled() {
        let db = Database::open_in_memory_with_config(quiet().use_indexes(false)).unwrap();
        db.create_collection("people").unwrap();
        db.create_index("people", "age").unwrap();
        let query = Query::new("people").filter(field("age").eq(30));
        assert_eq!(db.explain(&query).unwrap(), Plan::FullScan);
    }

    #[test]
    fn index_management() {
        let db = open();
        seed(&db);
        db.create_index("people", "age").unwrap();
        assert!(matches!(
            db.create_index("people", "age"),
            Err(CoreError::IndexExists { .. })
        ));
        assert!(db.has_index("people", "age").unwrap());
        let listed = db.list_indexes("people").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].field, "age");

        db.drop_index("people", "age").unwrap();
        db.drop_index("people", "age").unwrap();
        assert!(!db.has_index("people", "age").unwrap());
        assert!(db.drop_index("nope", "age").unwrap_err().is_not_found());

        let query = Query::new("people").filter(field("age").eq(25));
        assert_eq!(db.explain(&query).unwrap(), Plan::FullScan);
        assert_eq!(names(&db.find_all(&query).unwrap()), ["Bob"]);
    }

    #[test]
    fn update_with_patch() {
        let db = open();
        seed(&db);
        db.create_index("people", "age").unwrap();
        let query = Query::new("people").filter(field("age").lt(35));
        let changed = db
            .update(&query, &patch(&[("age", Value::Integer(50)), ("tags.vip", Value::Bool(true))]))
            .unwrap();
        assert_eq!(changed, 2);

        let fifty = Query::new("people")
            .filter(field("age").eq(50))
            .sort("name", Direction::Ascending);
        assert_eq!(names(&db.find_all(&fifty).unwrap()), ["Ann", "Bob"]);
        let bob = db.find_by_id("people", "b").unwrap();
        assert_eq!(bob.get("tags.vip"), Some(&Value::Bool(true)));
        assert_eq!(db.count(&query).unwrap(), 0);
    }

    #[test]
    fn changing_id_is_rejected() {
        let db = open();
        seed(&db);
        let err = db
            .update_by_id("people", "a", &patch(&[("_id", Value::from("zz"))]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(db.find_by_id("people", "a").is_ok());

        let err = db
            .replace_by_id("people", "a", person("b", "Other", 1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn update_with_callback_error_rolls_back() {
        let db = open();
        seed(&db);
        let mut seen = 0;
        let err = db
            .update_with(&Query::new("people"), |doc| {
                seen += 1;
                if seen == 2 {
                    return Err("second document refused");
                }
                doc.set("age", 0);
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Callback);
        let zero = Query::new("people").filter(field("age").eq(0));
        assert_eq!(db.count(&zero).unwrap(), 0);
    }

    #[test]
    fn replace_keeps_created_at() {
        let db = open();
        seed(&db);
        let created = db.find_by_id("people", "a").unwrap().created_at();

        let mut doc = Document::new();
        doc.set("name", "Anna");
        db.replace_by_id("people", "a", doc).unwrap();

        let stored = db.find_by_id("people", "a").unwrap();
        assert_eq!(stored.created_at(), created);
        assert_eq!(stored.get("name"), Some(&Value::from("Anna")));
        assert!(stored.get("age").is_none());
        assert!(db
            .replace_by_id("people", "nope", Document::new())
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn delete_by_query_and_id() {
        let db = open();
        seed(&db);
        db.create_index("people", "age").unwrap();
        assert_eq!(db.delete(&Query::new("people").filter(field("age").gt(26))).unwrap(), 2);
        assert_eq!(names(&db.find_all(&Query::new("people")).unwrap()), ["Bob"]);

        db.delete_by_id("people", "b").unwrap();
        assert!(db.delete_by_id("people", "b").unwrap_err().is_not_found());
        assert_eq!(db.count(&Query::new("people")).unwrap(), 0);
    }

    #[test]
    fn for_each_stops_and_wraps_errors() {
        let db = open();
        seed(&db);
        let query = Query::new("people").sort("_id", Direction::Ascending);
        let mut ids = Vec::new();
        db.for_each(&query, |doc| {
            ids.push(doc.object_id().unwrap_or_default().to_string());
            Ok::<_, Infallible>(ids.len() < 2)
        })
        .unwrap();
        assert_eq!(ids, ["a", "b"]);

        let err = db
            .for_each(&query, |_| Err::<bool, _>("stop here"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Callback);
        assert_eq!(err.to_string(), "callback failed: stop here");
    }

    #[test]
    fn expired_documents_are_hidden_and_swept() {
        let db = open();
        seed(&db);
        db.create_index("people", "age").unwrap();
        let mut doc = person("old", "Old", 30);
        doc.set_expires_at(Utc::now() - chrono::Duration::seconds(5));
        db.insert_one("people", doc).unwrap();

        assert!(db.find_by_id("people", "old").unwrap_err().is_not_found());
        let thirty = Query::new("people").filter(field("age").eq(30));
        assert_eq!(names(&db.find_all(&thirty).unwrap()), ["Ann"]);

        assert_eq!(db.sweep_expired().unwrap(), 1);
        assert_eq!(db.sweep_expired().unwrap(), 0);
        db.insert_one("people", person("old", "New", 30)).unwrap();
        assert_eq!(db.count(&thirty).unwrap(), 2);
    }

    #[test]
    fn expired_id_can_be_reused_before_sweep() {
        let db = open();
        let mut doc = person("x", "Gone", 1);
        doc.set_expires_at(Utc::now() - chrono::Duration::seconds(1));
        db.insert_one("people", doc).unwrap();
        db.insert_one("people", person("x", "Back", 2)).unwrap();
        assert_eq!(
            db.find_by_id("people", "x").unwrap().get("name"),
            Some(&Value::from("Back"))
        );
        assert_eq!(db.sweep_expired().unwrap(), 0);
    }

    #[test]
    fn background_sweeper_reclaims() {
        let config = Config::default().sweep_interval(Duration::from_millis(20));
        let db = Database::open_in_memory_with_config(config).unwrap();
        db.create_collection("people").unwrap();
        let mut doc = person("t", "Temp", 1);
        doc.set_ttl(Duration::from_millis(10));
        db.insert_one("people", doc).unwrap();

        let tx = db.inner.backend.begin(true).unwrap();
        assert!(tx.get(&keys::doc_key("people", "t")).unwrap().is_some());
        drop(tx);

        let mut gone = false;
        for _ in 0..100 {
            std::thread::sleep(Duration::from_millis(20));
            let tx = db.inner.backend.begin(true).unwrap();
            if tx.get(&keys::doc_key("people", "t")).unwrap().is_none() {
                gone = true;
                break;
            }
        }
        assert!(gone);
        db.close().unwrap();
    }

    #[test]
    fn query_errors() {
        let db = open();
        assert!(db.find_all(&Query::new("nope")).unwrap_err().is_not_found());
        let bad = Query::new("people").filter(field("name").like("(unclosed"));
        assert_eq!(db.find_all(&bad).unwrap_err().kind(), ErrorKind::InvalidInput);
        assert_eq!(db.explain(&bad).unwrap_err().kind(), ErrorKind::InvalidInput);

        let late = Query::new("people").deadline(std::time::Instant::now());
        assert!(matches!(db.find_all(&late), Err(CoreError::Canceled)));
    }

    #[test]
    fn reopen_file_database() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open_with_config(dir.path(), quiet()).unwrap();
            db.create_collection("people").unwrap();
            db.create_index("people", "age").unwrap();
            seed(&db);
            db.close().unwrap();
        }
        let db = Database::open_with_config(dir.path(), quiet()).unwrap();
        assert_eq!(db.list_collections().unwrap(), ["people"]);
        assert!(db.has_index("people", "age").unwrap());
        let query = Query::new("people").filter(field("age").eq(41));
        assert!(db.explain(&query).unwrap().uses_index());
        assert_eq!(names(&db.find_all(&query).unwrap()), ["Cid"]);
    }

    #[test]
    fn incompatible_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        Database::open_with_config(dir.path(), quiet())
            .unwrap()
            .close()
            .unwrap();

        let mut newer = quiet();
        newer.format_version = FORMAT_VERSION_NEXT;
        let err = Database::open_with_config(dir.path(), newer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }

    const FORMAT_VERSION_NEXT: u16 = crate::config::FORMAT_VERSION + 1;

    #[test]
    fn foreign_data_is_rejected() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut tx = backend.begin(false).unwrap();
        tx.set(b"someone else", b"data").unwrap();
        tx.commit().unwrap();
        let err = Database::open_with_backend(quiet(), backend.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);

        let backend = Arc::new(InMemoryBackend::new());
        let mut tx = backend.begin(false).unwrap();
        tx.set(keys::SCHEMA_KEY, b"XYZ\x00\x01").unwrap();
        tx.commit().unwrap();
        let err = Database::open_with_backend(quiet(), backend).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn open_removes_orphaned_keys() {
        let backend = Arc::new(InMemoryBackend::new());
        let people = CollectionMeta::new("people").with_index("age");
        let mut tx = backend.begin(false).unwrap();
        tx.set(keys::SCHEMA_KEY, &schema_record(crate::config::FORMAT_VERSION))
            .unwrap();
        catalog::put_meta(tx.as_mut(), &people).unwrap();
        store::insert(tx.as_mut(), &people, &person("a", "Ann", 30), Utc::now()).unwrap();
        // Leftovers of a dropped collection and a dropped index.
        let ghost = CollectionMeta::new("ghost").with_index("age");
        store::insert(tx.as_mut(), &ghost, &person("g", "Ghost", 9), Utc::now()).unwrap();
        RangeIndex::new("people", "name")
            .add(tx.as_mut(), "a", &Value::from("Ann"), None)
            .unwrap();
        tx.set(&keys::ttl_key(1, "people", "vanished"), &[]).unwrap();
        tx.commit().unwrap();

        let db = Database::open_with_backend(quiet(), backend.clone()).unwrap();
        let tx = backend.begin(true).unwrap();
        let mut left = Vec::new();
        tx.scan(Bound::Unbounded, Bound::Unbounded, false, &mut |key, _| {
            left.push(key.to_vec());
            ScanControl::Continue
        })
        .unwrap();
        let expected = vec![
            keys::doc_key("people", "a"),
            keys::index_key("people", "age", &Value::Integer(30), "a").unwrap(),
            keys::SCHEMA_KEY.to_vec(),
            keys::meta_key("people"),
        ];
        let mut expected = expected;
        expected.sort();
        assert_eq!(left, expected);
        assert_eq!(names(&db.find_all(&Query::new("people")).unwrap()), ["Ann"]);
    }

    #[test]
    fn debug_output() {
        let db = open();
        let text = format!("{db:?}");
        assert!(text.starts_with("Database { is_open: true"));
    }
}
