//! In-memory ordered backend.
//!
//! The store is a copy-on-write `BTreeMap` behind an `Arc`. Beginning a
//! transaction clones the `Arc`, which gives every transaction a stable
//! snapshot for its whole lifetime. Write transactions buffer their changes
//! in an overlay map and publish them in one step on commit.

use crate::backend::{KvBackend, KvTransaction, ScanControl, ScanVisitor};
use crate::error::{StorageError, StorageResult};
use crate::log::CommitLog;
use parking_lot::{Condvar, Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

/// Committed key space shared by snapshots.
pub(crate) type Snapshot = Arc<BTreeMap<Vec<u8>, Vec<u8>>>;

/// Pending writes of a transaction. `None` marks a deletion.
pub(crate) type WriteSet = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Default time a writer waits for the write lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared engine used by both the in-memory and the file backend.
pub(crate) struct Engine {
    state: RwLock<Snapshot>,
    writer_busy: Mutex<bool>,
    writer_released: Condvar,
    lock_timeout: Duration,
    log: Option<Mutex<CommitLog>>,
    closed: AtomicBool,
}

impl Engine {
    pub(crate) fn new(
        data: BTreeMap<Vec<u8>, Vec<u8>>,
        log: Option<CommitLog>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            state: RwLock::new(Arc::new(data)),
            writer_busy: Mutex::new(false),
            writer_released: Condvar::new(),
            lock_timeout,
            log: log.map(Mutex::new),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.state.read())
    }

    pub(crate) fn begin(self: &Arc<Self>, read_only: bool) -> StorageResult<Box<dyn KvTransaction>> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(StorageError::Closed);
        }
        if read_only {
            return Ok(Box::new(MemoryTransaction {
                engine: Arc::clone(self),
                snapshot: self.snapshot(),
                writes: None,
            }));
        }

        self.acquire_writer()?;
        // Snapshot after the writer lock so no committed write is missed.
        Ok(Box::new(MemoryTransaction {
            engine: Arc::clone(self),
            snapshot: self.snapshot(),
            writes: Some(WriteSet::new()),
        }))
    }

    fn acquire_writer(&self) -> StorageResult<()> {
        let mut busy = self.writer_busy.lock();
        if *busy {
            let result = self
                .writer_released
                .wait_while_for(&mut busy, |busy| *busy, self.lock_timeout);
            if result.timed_out() && *busy {
                return Err(StorageError::conflict(format!(
                    "write lock not acquired within {:?}",
                    self.lock_timeout
                )));
            }
        }
        *busy = true;
        Ok(())
    }

    fn release_writer(&self) {
        let mut busy = self.writer_busy.lock();
        *busy = false;
        self.writer_released.notify_one();
    }

    fn apply(&self, writes: WriteSet) -> StorageResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        if let Some(log) = &self.log {
            log.lock().append(&writes)?;
        }
        let mut state = self.state.write();
        let map = Arc::make_mut(&mut state);
        for (key, value) in writes {
            match value {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn compact(&self) -> StorageResult<()> {
        let snapshot = self.snapshot();
        if let Some(log) = &self.log {
            log.lock().rewrite(&snapshot)?;
        }
        Ok(())
    }

    pub(crate) fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, AtomicOrdering::SeqCst) {
            return Ok(());
        }
        if let Some(log) = &self.log {
            log.lock().sync()?;
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.state.read().len()
    }
}

/// An in-memory ordered key/value backend.
///
/// This backend stores all data in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral databases that don't need persistence
///
/// # Thread Safety
///
/// Readers never block. Writers are serialized: a second write transaction
/// waits up to the lock timeout and then fails with
/// [`StorageError::Conflict`].
///
/// # Example
///
/// ```rust
/// use quilldb_storage::{InMemoryBackend, KvBackend};
///
/// let backend = InMemoryBackend::new();
/// let mut tx = backend.begin(false).unwrap();
/// tx.set(b"k", b"v").unwrap();
/// tx.commit().unwrap();
///
/// let tx = backend.begin(true).unwrap();
/// assert_eq!(tx.get(b"k").unwrap(), Some(b"v".to_vec()));
/// ```
#[derive(Clone)]
pub struct InMemoryBackend {
    engine: Arc<Engine>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Creates a new backend whose writers wait at most `timeout` for the
    /// write lock.
    #[must_use]
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            engine: Arc::new(Engine::new(BTreeMap::new(), None, timeout)),
        }
    }

    /// Returns the number of committed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.engine.len()
    }

    /// Returns true if no key is committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("keys", &self.len())
            .finish()
    }
}

impl KvBackend for InMemoryBackend {
    fn begin(&self, read_only: bool) -> StorageResult<Box<dyn KvTransaction>> {
        self.engine.begin(read_only)
    }

    fn close(&self) -> StorageResult<()> {
        self.engine.close()
    }
}

/// Transaction over an [`Engine`] snapshot.
struct MemoryTransaction {
    engine: Arc<Engine>,
    snapshot: Snapshot,
    /// `None` for read-only transactions.
    writes: Option<WriteSet>,
}

impl MemoryTransaction {
    fn writes_mut(&mut self) -> StorageResult<&mut WriteSet> {
        self.writes.as_mut().ok_or(StorageError::ReadOnly)
    }
}

impl KvTransaction for MemoryTransaction {
    fn is_read_only(&self) -> bool {
        self.writes.is_none()
    }

    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        if let Some(pending) = self.writes.as_ref().and_then(|w| w.get(key)) {
            return Ok(pending.clone());
        }
        Ok(self.snapshot.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.writes_mut()?.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> StorageResult<()> {
        self.writes_mut()?.insert(key.to_vec(), None);
        Ok(())
    }

    fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        reverse: bool,
        visit: &mut ScanVisitor<'_>,
    ) -> StorageResult<bool> {
        if is_empty_range(lower, upper) {
            return Ok(false);
        }
        let empty = WriteSet::new();
        let overlay = self.writes.as_ref().unwrap_or(&empty);
        Ok(merged_scan(&self.snapshot, overlay, (lower, upper), reverse, visit))
    }

    fn commit(mut self: Box<Self>) -> StorageResult<()> {
        let Some(writes) = self.writes.take() else {
            return Ok(());
        };
        let result = self.engine.apply(writes);
        self.engine.release_writer();
        result
    }

    fn rollback(mut self: Box<Self>) -> StorageResult<()> {
        if self.writes.take().is_some() {
            self.engine.release_writer();
        }
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        // Still holding a write set means neither commit nor rollback ran.
        if self.writes.take().is_some() {
            self.engine.release_writer();
        }
    }
}

fn is_empty_range(lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}

enum Side {
    Base,
    Overlay,
}

/// Visits the union of committed pairs and pending writes in key order.
///
/// Pending writes shadow committed values; pending deletions hide them.
fn merged_scan(
    base: &BTreeMap<Vec<u8>, Vec<u8>>,
    overlay: &WriteSet,
    range: (Bound<&[u8]>, Bound<&[u8]>),
    reverse: bool,
    visit: &mut ScanVisitor<'_>,
) -> bool {
    let base_iter = base.range::<[u8], _>(range);
    let overlay_iter = overlay.range::<[u8], _>(range);

    let mut base_iter: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<u8>)>> = if reverse {
        Box::new(base_iter.rev())
    } else {
        Box::new(base_iter)
    };
    let mut overlay_iter: Box<dyn Iterator<Item = (&Vec<u8>, &Option<Vec<u8>>)>> = if reverse {
        Box::new(overlay_iter.rev())
    } else {
        Box::new(overlay_iter)
    };

    let mut base_next = base_iter.next();
    let mut overlay_next = overlay_iter.next();

    loop {
        let side = match (&base_next, &overlay_next) {
            (None, None) => return false,
            (Some(_), None) => Side::Base,
            (None, Some(_)) => Side::Overlay,
            (Some((base_key, _)), Some((overlay_key, _))) => {
                let ord = base_key.cmp(overlay_key);
                let ord = if reverse { ord.reverse() } else { ord };
                match ord {
                    Ordering::Less => Side::Base,
                    Ordering::Greater => Side::Overlay,
                    Ordering::Equal => {
                        base_next = base_iter.next();
                        Side::Overlay
                    }
                }
            }
        };

        match side {
            Side::Base => {
                if let Some((key, value)) = base_next {
                    if visit(key.as_slice(), value.as_slice()) == ScanControl::Stop {
                        return true;
                    }
                }
                base_next = base_iter.next();
            }
            Side::Overlay => {
                if let Some((key, Some(value))) = overlay_next {
                    if visit(key.as_slice(), value.as_slice()) == ScanControl::Stop {
                        return true;
                    }
                }
                overlay_next = overlay_iter.next();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn collect(tx: &dyn KvTransaction, prefix: &[u8], reverse: bool) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        tx.iterate(prefix, reverse, &mut |k, _| {
            keys.push(k.to_vec());
            ScanControl::Continue
        })
        .unwrap();
        keys
    }

    fn seed(backend: &InMemoryBackend, keys: &[&[u8]]) {
        let mut tx = backend.begin(false).unwrap();
        for key in keys {
            tx.set(key, b"v").unwrap();
        }
        tx.commit().unwrap();
    }

    #[test]
    fn memory_new_is_empty() {
        let backend = InMemoryBackend::new();
        assert!(backend.is_empty());
    }

    #[test]
    fn commit_makes_writes_visible() {
        let backend = InMemoryBackend::new();
        let mut tx = backend.begin(false).unwrap();
        tx.set(b"a", b"1").unwrap();
        assert_eq!(tx.get(b"a").unwrap(), Some(b"1".to_vec()));
        tx.commit().unwrap();

        let tx = backend.begin(true).unwrap();
        assert_eq!(tx.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn rollback_discards_writes() {
        let backend = InMemoryBackend::new();
        let mut tx = backend.begin(false).unwrap();
        tx.set(b"a", b"1").unwrap();
        tx.rollback().unwrap();

        let tx = backend.begin(true).unwrap();
        assert_eq!(tx.get(b"a").unwrap(), None);
    }

    #[test]
    fn read_only_rejects_writes() {
        let backend = InMemoryBackend::new();
        let mut tx = backend.begin(true).unwrap();
        assert!(matches!(tx.set(b"a", b"1"), Err(StorageError::ReadOnly)));
        assert!(matches!(tx.delete(b"a"), Err(StorageError::ReadOnly)));
    }

    #[test]
    fn snapshot_isolation_for_readers() {
        let backend = InMemoryBackend::new();
        seed(&backend, &[b"a"]);

        let reader = backend.begin(true).unwrap();

        let mut writer = backend.begin(false).unwrap();
        writer.set(b"b", b"v").unwrap();
        writer.delete(b"a").unwrap();
        writer.commit().unwrap();

        assert_eq!(collect(reader.as_ref(), b"", false), vec![b"a".to_vec()]);
        let fresh = backend.begin(true).unwrap();
        assert_eq!(collect(fresh.as_ref(), b"", false), vec![b"b".to_vec()]);
    }

    #[test]
    fn iteration_merges_pending_writes() {
        let backend = InMemoryBackend::new();
        seed(&backend, &[b"p1", b"p3", b"p5", b"q1"]);

        let mut tx = backend.begin(false).unwrap();
        tx.set(b"p2", b"v").unwrap();
        tx.delete(b"p3").unwrap();
        tx.set(b"p5", b"new").unwrap();

        assert_eq!(
            collect(tx.as_ref(), b"p", false),
            vec![b"p1".to_vec(), b"p2".to_vec(), b"p5".to_vec()]
        );
        assert_eq!(
            collect(tx.as_ref(), b"p", true),
            vec![b"p5".to_vec(), b"p2".to_vec(), b"p1".to_vec()]
        );
        assert_eq!(tx.get(b"p5").unwrap(), Some(b"new".to_vec()));
        assert_eq!(tx.get(b"p3").unwrap(), None);
    }

    #[test]
    fn visitor_can_stop_early() {
        let backend = InMemoryBackend::new();
        seed(&backend, &[b"a", b"b", b"c"]);

        let tx = backend.begin(true).unwrap();
        let mut seen = 0;
        let stopped = tx
            .iterate(b"", false, &mut |_, _| {
                seen += 1;
                if seen == 2 {
                    ScanControl::Stop
                } else {
                    ScanControl::Continue
                }
            })
            .unwrap();
        assert!(stopped);
        assert_eq!(seen, 2);
    }

    #[test]
    fn bounded_scan_respects_bounds() {
        let backend = InMemoryBackend::new();
        seed(&backend, &[b"a", b"b", b"c", b"d"]);

        let tx = backend.begin(true).unwrap();
        let mut keys = Vec::new();
        tx.scan(
            Bound::Excluded(b"a".as_slice()),
            Bound::Included(b"c".as_slice()),
            false,
            &mut |k, _| {
                keys.push(k.to_vec());
                ScanControl::Continue
            },
        )
        .unwrap();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

        let stopped = tx
            .scan(
                Bound::Included(b"d".as_slice()),
                Bound::Excluded(b"a".as_slice()),
                false,
                &mut |_, _| ScanControl::Continue,
            )
            .unwrap();
        assert!(!stopped);
    }

    #[test]
    fn second_writer_times_out() {
        let backend = InMemoryBackend::with_lock_timeout(Duration::from_millis(20));
        let _first = backend.begin(false).unwrap();
        let second = backend.begin(false);
        assert!(matches!(second, Err(StorageError::Conflict(_))));
    }

    #[test]
    fn dropped_writer_releases_lock() {
        let backend = InMemoryBackend::with_lock_timeout(Duration::from_millis(20));
        {
            let mut tx = backend.begin(false).unwrap();
            tx.set(b"a", b"1").unwrap();
        }
        let tx = backend.begin(false).unwrap();
        assert_eq!(tx.get(b"a").unwrap(), None);
    }

    #[test]
    fn writers_are_serialized_across_threads() {
        let backend = InMemoryBackend::new();
        seed(&backend, &[b"counter"]);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let backend = backend.clone();
                thread::spawn(move || {
                    let mut tx = backend.begin(false).unwrap();
                    tx.set(format!("k{i}").as_bytes(), b"v").unwrap();
                    tx.commit().unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(backend.len(), 5);
    }

    #[test]
    fn closed_backend_rejects_begin() {
        let backend = InMemoryBackend::new();
        backend.close().unwrap();
        assert!(matches!(backend.begin(true), Err(StorageError::Closed)));
    }
}
