//! Expiration sweeper.
//!
//! A document with `_expires_at` in the past is invisible to reads at once
//! and reclaimed by the sweeper later. Each tick reads the TTL entries due
//! at `now` in expiry order and deletes every referenced document in its own
//! write transaction, after checking again that it is still expired there.

use crate::catalog::Collections;
use crate::database::Inner;
use crate::error::{CoreError, CoreResult};
use crate::keys::{self, TtlEntry};
use crate::store;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use quilldb_storage::{KvTransaction, ScanControl, StorageError};
use std::ops::Bound;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Runs one sweep and returns the number of documents reclaimed.
///
/// Failures on single documents are logged and skipped. A backend failure
/// ends the sweep.
pub(crate) fn sweep(inner: &Inner, now: DateTime<Utc>) -> CoreResult<usize> {
    let due = inner.read(|tx, _| due_entries(tx, keys::expiry_stamp(&now)))?;
    let mut reclaimed = 0;
    for entry in &due {
        match inner.write(|tx, collections| reclaim(tx, collections, entry, now)) {
            Ok(true) => reclaimed += 1,
            Ok(false) => {}
            Err(err @ (CoreError::Backend(_) | CoreError::DatabaseClosed)) => return Err(err),
            Err(err) => {
                tracing::warn!(
                    collection = %entry.collection,
                    id = %entry.id,
                    error = %err,
                    "failed to reclaim expired document"
                );
            }
        }
    }
    if reclaimed > 0 {
        tracing::debug!(reclaimed, due = due.len(), "sweep finished");
    }
    Ok(reclaimed)
}

fn due_entries(tx: &dyn KvTransaction, now: u64) -> CoreResult<Vec<TtlEntry>> {
    let lower = keys::ttl_prefix();
    let upper = keys::ttl_upper_bound(now);
    let mut entries = Vec::new();
    tx.scan(
        Bound::Included(lower.as_slice()),
        Bound::Excluded(upper.as_slice()),
        false,
        &mut |key, _| {
            match keys::parse_ttl_key(key) {
                Ok(entry) => entries.push(entry),
                Err(err) => tracing::warn!(error = %err, "skipping malformed TTL entry"),
            }
            ScanControl::Continue
        },
    )?;
    Ok(entries)
}

/// Deletes the document behind a due TTL entry if it is still expired.
/// Stale entries are removed. Returns true if a document was deleted.
fn reclaim(
    tx: &mut dyn KvTransaction,
    collections: &Collections,
    entry: &TtlEntry,
    now: DateTime<Utc>,
) -> CoreResult<bool> {
    let key = keys::ttl_key(entry.expiry, &entry.collection, &entry.id);
    if tx.get(&key)?.is_none() {
        return Ok(false);
    }
    let Some(meta) = collections.get(&entry.collection) else {
        tx.delete(&key)?;
        return Ok(false);
    };
    match store::load(&*tx, &meta.name, &entry.id)? {
        Some(doc) if doc.is_expired_at(now) => {
            store::remove(tx, meta, &doc)?;
            Ok(true)
        }
        // The document was deleted or its expiry moved; its current TTL
        // entry, if any, has a different key.
        _ => {
            tx.delete(&key)?;
            Ok(false)
        }
    }
}

#[derive(Default)]
struct Signal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Handle to the background sweeper thread.
pub(crate) struct Sweeper {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Starts a thread sweeping `inner` every `interval`.
    pub(crate) fn spawn(inner: Arc<Inner>, interval: Duration) -> CoreResult<Self> {
        let signal = Arc::new(Signal::default());
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name("quilldb-sweeper".into())
            .spawn(move || run(&inner, interval, &thread_signal))
            .map_err(|err| CoreError::Backend(StorageError::Io(err)))?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for it to finish its current tick.
    pub(crate) fn stop(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("sweeper thread panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(inner: &Inner, interval: Duration, signal: &Signal) {
    tracing::debug!(?interval, "sweeper started");
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if !*stopped {
                signal.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                break;
            }
        }
        match sweep(inner, Utc::now()) {
            Ok(_) => {}
            Err(CoreError::DatabaseClosed) => break,
            Err(err) => tracing::warn!(error = %err, "sweep failed"),
        }
    }
    tracing::debug!("sweeper stopped");
}
