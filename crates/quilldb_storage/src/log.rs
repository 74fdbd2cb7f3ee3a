//! Append-only commit log used by the file backend.
//!
//! Every committed write set is appended as one batch record:
//!
//! ```text
//! | magic (4) | payload_len (u32 LE) | payload | crc32 (u32 LE) |
//!
//! payload = | op_count (u32 LE) | op* |
//! op      = | kind (1) | key_len (u32 LE) | key | [value_len (u32 LE) | value] |
//! ```
//!
//! Replay applies batches in order. A batch is only applied if it is
//! complete and its checksum matches, so a crash mid-append loses at most
//! the transaction being committed. The torn tail is truncated on open.

use crate::error::{StorageError, StorageResult};
use crate::memory::WriteSet;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a batch record.
pub const BATCH_MAGIC: [u8; 4] = *b"QLOG";

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;

/// Header bytes preceding a batch payload.
const HEADER_SIZE: usize = 8;

/// Trailing checksum bytes.
const CRC_SIZE: usize = 4;

/// Append-only log of committed write sets.
#[derive(Debug)]
pub(crate) struct CommitLog {
    path: PathBuf,
    file: File,
    sync_on_commit: bool,
}

impl CommitLog {
    /// Opens the log at `path`, replays it, and returns the log together with
    /// the recovered key space.
    pub(crate) fn open(
        path: &Path,
        sync_on_commit: bool,
    ) -> StorageResult<(Self, BTreeMap<Vec<u8>, Vec<u8>>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        let (data, valid_len) = replay(&buffer)?;
        if valid_len < buffer.len() {
            tracing::warn!(
                path = %path.display(),
                discarded = buffer.len() - valid_len,
                "truncating torn commit log tail"
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                sync_on_commit,
            },
            data,
        ))
    }

    /// Appends one committed write set.
    ///
    /// A failed append is cut back off the log, so batches appended after it
    /// stay reachable on replay.
    pub(crate) fn append(&mut self, writes: &WriteSet) -> StorageResult<()> {
        let record = encode_batch(writes.iter().map(|(k, v)| (k.as_slice(), v.as_deref())));
        let start = self.file.stream_position()?;
        if let Err(err) = self.write_record(&record) {
            if let Err(cleanup) = self.truncate_to(start) {
                tracing::error!(
                    path = %self.path.display(),
                    offset = start,
                    error = %cleanup,
                    "failed to discard partial commit log record"
                );
            }
            return Err(err);
        }
        Ok(())
    }

    fn write_record(&mut self, record: &[u8]) -> StorageResult<()> {
        self.file.write_all(record)?;
        self.file.flush()?;
        if self.sync_on_commit {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Drops everything past `offset` and positions the log there.
    fn truncate_to(&mut self, offset: u64) -> StorageResult<()> {
        self.file.set_len(offset)?;
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Replaces the whole log with a single batch holding `snapshot`.
    ///
    /// The new log is written to a temporary file and renamed over the old
    /// one, so a crash leaves either the old or the new log intact.
    pub(crate) fn rewrite(&mut self, snapshot: &BTreeMap<Vec<u8>, Vec<u8>>) -> StorageResult<()> {
        let temp_path = self.path.with_extension("compact");
        {
            let mut temp = File::create(&temp_path)?;
            if !snapshot.is_empty() {
                let record =
                    encode_batch(snapshot.iter().map(|(k, v)| (k.as_slice(), Some(v.as_slice()))));
                temp.write_all(&record)?;
            }
            temp.sync_all()?;
        }
        std::fs::rename(&temp_path, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        self.file = file;
        Ok(())
    }

    /// Forces all appended batches to disk.
    pub(crate) fn sync(&mut self) -> StorageResult<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

fn encode_batch<'a, I>(ops: I) -> Vec<u8>
where
    I: Iterator<Item = (&'a [u8], Option<&'a [u8]>)>,
{
    let mut payload = Vec::new();
    let mut count: u32 = 0;
    payload.extend_from_slice(&count.to_le_bytes());

    for (key, value) in ops {
        count += 1;
        match value {
            Some(value) => {
                payload.push(OP_PUT);
                write_chunk(&mut payload, key);
                write_chunk(&mut payload, value);
            }
            None => {
                payload.push(OP_DELETE);
                write_chunk(&mut payload, key);
            }
        }
    }
    payload[..4].copy_from_slice(&count.to_le_bytes());

    let mut record = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    record.extend_from_slice(&BATCH_MAGIC);
    record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    record.extend_from_slice(&payload);
    record.extend_from_slice(&compute_crc32(&payload).to_le_bytes());
    record
}

fn write_chunk(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Replays all complete batches. Returns the key space and the length of
/// the valid prefix of `buffer`.
fn replay(buffer: &[u8]) -> StorageResult<(BTreeMap<Vec<u8>, Vec<u8>>, usize)> {
    let mut data = BTreeMap::new();
    let mut pos = 0;

    while pos + HEADER_SIZE <= buffer.len() {
        if buffer[pos..pos + 4] != BATCH_MAGIC {
            return Err(StorageError::corrupted(format!(
                "bad batch magic at offset {pos}"
            )));
        }
        let len = u32::from_le_bytes([
            buffer[pos + 4],
            buffer[pos + 5],
            buffer[pos + 6],
            buffer[pos + 7],
        ]) as usize;
        let payload_start = pos + HEADER_SIZE;
        let Some(payload_end) = payload_start.checked_add(len) else {
            break;
        };
        if payload_end
            .checked_add(CRC_SIZE)
            .map_or(true, |end| end > buffer.len())
        {
            break;
        }
        let payload = &buffer[payload_start..payload_end];
        let stored = u32::from_le_bytes([
            buffer[payload_end],
            buffer[payload_end + 1],
            buffer[payload_end + 2],
            buffer[payload_end + 3],
        ]);
        if stored != compute_crc32(payload) {
            break;
        }
        apply_payload(payload, &mut data)?;
        pos = payload_end + CRC_SIZE;
    }

    Ok((data, pos))
}

fn apply_payload(payload: &[u8], data: &mut BTreeMap<Vec<u8>, Vec<u8>>) -> StorageResult<()> {
    let mut reader = ChunkReader { bytes: payload, pos: 0 };
    let count = reader.read_u32()?;
    for _ in 0..count {
        match reader.read_u8()? {
            OP_PUT => {
                let key = reader.read_chunk()?.to_vec();
                let value = reader.read_chunk()?.to_vec();
                data.insert(key, value);
            }
            OP_DELETE => {
                let key = reader.read_chunk()?;
                data.remove(key);
            }
            other => {
                return Err(StorageError::corrupted(format!("unknown op kind {other}")));
            }
        }
    }
    Ok(())
}

struct ChunkReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ChunkReader<'a> {
    fn take(&mut self, len: usize) -> StorageResult<&'a [u8]> {
        if self.pos + len > self.bytes.len() {
            return Err(StorageError::corrupted("batch payload truncated"));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> StorageResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> StorageResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_chunk(&mut self) -> StorageResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }
}

/// Computes the CRC32 (IEEE polynomial) of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn writes(ops: &[(&[u8], Option<&[u8]>)]) -> WriteSet {
        ops.iter()
            .map(|(k, v)| (k.to_vec(), v.map(<[u8]>::to_vec)))
            .collect()
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn replay_applies_batches_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.log");

        {
            let (mut log, data) = CommitLog::open(&path, true).unwrap();
            assert!(data.is_empty());
            log.append(&writes(&[(b"a", Some(b"1")), (b"b", Some(b"2"))]))
                .unwrap();
            log.append(&writes(&[(b"a", None), (b"c", Some(b"3"))]))
                .unwrap();
        }

        let (_, data) = CommitLog::open(&path, true).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.get(b"b".as_slice()), Some(&b"2".to_vec()));
        assert_eq!(data.get(b"c".as_slice()), Some(&b"3".to_vec()));
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.log");

        {
            let (mut log, _) = CommitLog::open(&path, true).unwrap();
            log.append(&writes(&[(b"a", Some(b"1"))])).unwrap();
            log.append(&writes(&[(b"b", Some(b"2"))])).unwrap();
        }
        let full_len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 3).unwrap();
        drop(file);

        let (_, data) = CommitLog::open(&path, true).unwrap();
        assert_eq!(data.len(), 1);
        assert!(data.contains_key(b"a".as_slice()));
        assert!(std::fs::metadata(&path).unwrap().len() < full_len - 3);
    }

    #[test]
    fn corrupted_checksum_stops_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.log");
        {
            let (mut log, _) = CommitLog::open(&path, true).unwrap();
            log.append(&writes(&[(b"a", Some(b"1"))])).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let (_, data) = CommitLog::open(&path, true).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn rewrite_compacts_to_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.log");
        let (mut log, _) = CommitLog::open(&path, false).unwrap();
        for i in 0..10u8 {
            log.append(&writes(&[(b"k", Some(&[i]))])).unwrap();
        }
        let before = std::fs::metadata(&path).unwrap().len();

        let mut snapshot = BTreeMap::new();
        snapshot.insert(b"k".to_vec(), vec![9]);
        log.rewrite(&snapshot).unwrap();
        log.append(&writes(&[(b"z", Some(b"1"))])).unwrap();
        drop(log);

        assert!(std::fs::metadata(&path).unwrap().len() < before);
        let (_, data) = CommitLog::open(&path, false).unwrap();
        assert_eq!(data.get(b"k".as_slice()), Some(&vec![9]));
        assert!(data.contains_key(b"z".as_slice()));
    }

    #[test]
    fn discarded_partial_record_keeps_later_commits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.log");

        {
            let (mut log, _) = CommitLog::open(&path, true).unwrap();
            log.append(&writes(&[(b"a", Some(b"1"))])).unwrap();

            // A write that stopped partway through its record.
            let start = log.file.stream_position().unwrap();
            let record = encode_batch([(b"b".as_slice(), Some(b"2".as_slice()))].into_iter());
            log.file.write_all(&record[..5]).unwrap();
            log.truncate_to(start).unwrap();

            log.append(&writes(&[(b"c", Some(b"3"))])).unwrap();
        }

        let (_, data) = CommitLog::open(&path, true).unwrap();
        assert_eq!(data.get(b"a".as_slice()), Some(&b"1".to_vec()));
        assert_eq!(data.get(b"c".as_slice()), Some(&b"3".to_vec()));
        assert!(!data.contains_key(b"b".as_slice()));
    }

    #[test]
    fn oversized_length_is_a_torn_tail() {
        let mut buffer = BATCH_MAGIC.to_vec();
        buffer.extend_from_slice(&u32::MAX.to_le_bytes());
        buffer.extend_from_slice(b"junk");

        let (data, valid_len) = replay(&buffer).unwrap();
        assert!(data.is_empty());
        assert_eq!(valid_len, 0);
    }

    fn write_set_strategy() -> impl Strategy<Value = WriteSet> {
        prop::collection::btree_map(
            prop::collection::vec(0u8..4, 1..3),
            prop::option::of(prop::collection::vec(any::<u8>(), 0..4)),
            0..6,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn replay_matches_appended_write_sets(
            batches in prop::collection::vec(write_set_strategy(), 0..8),
        ) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("data.log");
            let mut expected = BTreeMap::new();
            {
                let (mut log, _) = CommitLog::open(&path, false).unwrap();
                for batch in &batches {
                    log.append(batch).unwrap();
                    for (key, value) in batch {
                        match value {
                            Some(value) => {
                                expected.insert(key.clone(), value.clone());
                            }
                            None => {
                                expected.remove(key);
                            }
                        }
                    }
                }
            }

            let (_, data) = CommitLog::open(&path, false).unwrap();
            prop_assert_eq!(data, expected);
        }
    }
}
