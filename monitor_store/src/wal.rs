// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! File-backed descriptor persistor.
//!
//! Each committed [`PersistenceTx`] becomes one length-prefixed bincode frame
//! appended to `descriptors.wal` and fsynced before the commit returns. On
//! open, the latest checkpoint (`descriptors.snap`) is loaded and the log is
//! replayed over it. A torn or undecodable tail frame ends the replay and is
//! cut off, so a crash mid-commit loses exactly that commit.
//!
//! Frame layout: `[u32 LE length][bincode WalFrame]`.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{File, OpenOptions},
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    atomic_io::{atomic_write, read_if_exists},
    error::{Result, StoreError},
    persistor::{apply_ops, TransactionPersistor},
    record::{DescriptorRecord, StoreOp},
    transaction::{Journal, PersistenceTx},
};

const WAL_FILE: &str = "descriptors.wal";
const SNAPSHOT_FILE: &str = "descriptors.snap";

#[derive(Debug, Serialize, Deserialize)]
struct WalFrame {
    tx_id: u64,
    ops: Vec<StoreOp>,
}

struct WalState {
    file: File,
    len: u64,
    records: BTreeMap<u64, DescriptorRecord>,
    frames_since_checkpoint: u64,
}

struct WalJournal {
    id: Uuid,
    dir: PathBuf,
    checkpoint_interval: Option<u64>,
    state: Mutex<WalState>,
}

impl WalJournal {
    fn append(state: &mut WalState, bytes: &[u8]) -> io::Result<()> {
        let frame_len = u32::try_from(bytes.len())
            .map_err(|_| io::Error::other("wal frame exceeds u32 length"))?;
        let mut buf = Vec::with_capacity(4 + bytes.len());
        buf.extend_from_slice(&frame_len.to_le_bytes());
        buf.extend_from_slice(bytes);

        state.file.seek(SeekFrom::Start(state.len))?;
        state.file.write_all(&buf)?;
        state.file.sync_all()?;
        state.len += buf.len() as u64;
        Ok(())
    }

    fn checkpoint_locked(&self, state: &mut WalState) -> Result<()> {
        let records: Vec<&DescriptorRecord> = state.records.values().collect();
        let bytes = bincode::serialize(&records)?;
        atomic_write(self.dir.join(SNAPSHOT_FILE), &bytes)?;

        state.file.set_len(0)?;
        state.file.sync_all()?;
        state.len = 0;
        state.frames_since_checkpoint = 0;
        tracing::debug!(records = records.len(), "descriptor checkpoint written");
        Ok(())
    }
}

impl Journal for WalJournal {
    fn journal_id(&self) -> Uuid {
        self.id
    }

    fn apply(&self, tx_id: u64, batch: &[StoreOp]) -> Result<()> {
        let frame = WalFrame {
            tx_id,
            ops: batch.to_vec(),
        };
        let bytes = bincode::serialize(&frame)?;

        let mut state = self.state.lock();
        let start = state.len;
        if let Err(err) = Self::append(&mut state, &bytes) {
            // Cut any partial frame so the next append starts clean.
            let _ = state.file.set_len(start);
            state.len = start;
            tracing::error!(tx_id, error = %err, "descriptor wal append failed");
            return Err(StoreError::CommitFailed(err.to_string()));
        }

        apply_ops(&mut state.records, batch);
        state.frames_since_checkpoint += 1;

        if let Some(interval) = self.checkpoint_interval {
            if state.frames_since_checkpoint >= interval {
                // The frame is already durable; a failed checkpoint only delays compaction.
                if let Err(err) = self.checkpoint_locked(&mut state) {
                    tracing::warn!(error = %err, "descriptor checkpoint failed");
                }
            }
        }
        Ok(())
    }
}

/// Durable persistor backed by an append-only log plus periodic checkpoints.
pub struct WalPersistor {
    journal: Arc<WalJournal>,
    next_tx_id: AtomicU64,
}

impl std::fmt::Debug for WalPersistor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalPersistor")
            .field("dir", &self.journal.dir)
            .finish_non_exhaustive()
    }
}

impl WalPersistor {
    /// Open or create the persistor in `dir`, recovering committed state.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_checkpoint_interval(dir, None)
    }

    /// Like [`WalPersistor::open`], checkpointing every `interval` commits.
    pub fn open_with_checkpoint_interval(
        dir: impl AsRef<Path>,
        interval: Option<u64>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut records = BTreeMap::new();
        if let Some(bytes) = read_if_exists(dir.join(SNAPSHOT_FILE))? {
            let snapshot: Vec<DescriptorRecord> = bincode::deserialize(&bytes)
                .map_err(|e| StoreError::Corrupted(format!("snapshot: {e}")))?;
            for record in snapshot {
                records.insert(record.global_id, record);
            }
        }

        let wal_path = dir.join(WAL_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&wal_path)?;

        let (frames, valid_len) = replay(&mut file)?;
        let on_disk = file.metadata()?.len();
        if valid_len < on_disk {
            tracing::warn!(
                path = %wal_path.display(),
                valid_len,
                on_disk,
                "discarding torn descriptor wal tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let mut max_tx_id = 0;
        let frame_count = frames.len() as u64;
        for frame in frames {
            max_tx_id = max_tx_id.max(frame.tx_id);
            apply_ops(&mut records, &frame.ops);
        }

        tracing::info!(
            path = %dir.display(),
            records = records.len(),
            frames = frame_count,
            "descriptor store recovered"
        );

        Ok(Self {
            journal: Arc::new(WalJournal {
                id: Uuid::new_v4(),
                dir,
                checkpoint_interval: interval.filter(|n| *n > 0),
                state: Mutex::new(WalState {
                    file,
                    len: valid_len,
                    records,
                    frames_since_checkpoint: frame_count,
                }),
            }),
            next_tx_id: AtomicU64::new(max_tx_id + 1),
        })
    }

    /// Write a full snapshot and truncate the log.
    pub fn checkpoint(&self) -> Result<()> {
        let mut state = self.journal.state.lock();
        self.journal.checkpoint_locked(&mut state)
    }

    /// Bytes currently held in the log file.
    pub fn wal_len(&self) -> u64 {
        self.journal.state.lock().len
    }

    pub fn dir(&self) -> &Path {
        &self.journal.dir
    }
}

/// Read frames until EOF, a torn frame or an undecodable frame.
/// Returns the frames and the byte length of the valid prefix.
fn replay(file: &mut File) -> Result<(Vec<WalFrame>, u64)> {
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&*file);
    let mut frames = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        let mut data = vec![0u8; len];
        match reader.read_exact(&mut data) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        match bincode::deserialize::<WalFrame>(&data) {
            Ok(frame) => frames.push(frame),
            Err(_) => break,
        }
        valid_len += 4 + len as u64;
    }

    Ok((frames, valid_len))
}

impl TransactionPersistor for WalPersistor {
    fn begin(&self) -> PersistenceTx {
        let id = self.next_tx_id.fetch_add(1, Ordering::Relaxed);
        PersistenceTx::new(id, self.journal.clone())
    }

    fn save_global_transaction_descriptor(
        &self,
        tx: &mut PersistenceTx,
        record: &DescriptorRecord,
    ) -> Result<()> {
        tx.push(self.journal.id, StoreOp::Save(record.clone()))
    }

    fn delete_all_global_transaction_descriptors(
        &self,
        tx: &mut PersistenceTx,
        global_ids: &BTreeSet<u64>,
    ) -> Result<()> {
        if global_ids.is_empty() {
            return Ok(());
        }
        tx.push(
            self.journal.id,
            StoreOp::Delete(global_ids.iter().copied().collect()),
        )
    }

    fn load_all_global_transaction_descriptors(&self) -> Result<Vec<DescriptorRecord>> {
        Ok(self.journal.state.lock().records.values().cloned().collect())
    }

    fn record_count(&self) -> usize {
        self.journal.state.lock().records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn save(persistor: &WalPersistor, gids: impl IntoIterator<Item = u64>) {
        let mut tx = persistor.begin();
        for gid in gids {
            persistor
                .save_global_transaction_descriptor(&mut tx, &DescriptorRecord::new("n1", gid, gid))
                .unwrap();
        }
        tx.commit().unwrap();
    }

    #[test]
    fn test_commit_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let persistor = WalPersistor::open(dir.path()).unwrap();
            save(&persistor, 1..=5);
            let mut tx = persistor.begin();
            persistor
                .delete_all_global_transaction_descriptors(&mut tx, &[1, 2].into_iter().collect())
                .unwrap();
            tx.commit().unwrap();
        }

        let reopened = WalPersistor::open(dir.path()).unwrap();
        let ids: Vec<u64> = reopened
            .load_all_global_transaction_descriptors()
            .unwrap()
            .iter()
            .map(|r| r.global_id)
            .collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_aborted_tx_not_persisted() {
        let dir = tempdir().unwrap();
        {
            let persistor = WalPersistor::open(dir.path()).unwrap();
            let mut tx = persistor.begin();
            persistor
                .save_global_transaction_descriptor(&mut tx, &DescriptorRecord::new("n1", 1, 1))
                .unwrap();
            tx.abort();
            assert_eq!(persistor.wal_len(), 0);
        }
        let reopened = WalPersistor::open(dir.path()).unwrap();
        assert_eq!(reopened.record_count(), 0);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let good_len = {
            let persistor = WalPersistor::open(dir.path()).unwrap();
            save(&persistor, [1, 2]);
            persistor.wal_len()
        };

        // Simulate a crash mid-append: a length prefix with a short body.
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join(WAL_FILE))
                .unwrap();
            file.write_all(&64u32.to_le_bytes()).unwrap();
            file.write_all(&[0xAB; 10]).unwrap();
        }

        let reopened = WalPersistor::open(dir.path()).unwrap();
        assert_eq!(reopened.record_count(), 2);
        assert_eq!(reopened.wal_len(), good_len);

        // Appends after recovery remain readable.
        save(&reopened, [3]);
        drop(reopened);
        let again = WalPersistor::open(dir.path()).unwrap();
        assert_eq!(again.record_count(), 3);
    }

    #[test]
    fn test_checkpoint_truncates_log() {
        let dir = tempdir().unwrap();
        {
            let persistor = WalPersistor::open(dir.path()).unwrap();
            save(&persistor, 1..=10);
            assert!(persistor.wal_len() > 0);
            persistor.checkpoint().unwrap();
            assert_eq!(persistor.wal_len(), 0);
            save(&persistor, [11]);
        }

        let reopened = WalPersistor::open(dir.path()).unwrap();
        assert_eq!(reopened.record_count(), 11);
    }

    #[test]
    fn test_automatic_checkpoint_interval() {
        let dir = tempdir().unwrap();
        let persistor = WalPersistor::open_with_checkpoint_interval(dir.path(), Some(3)).unwrap();
        save(&persistor, [1]);
        save(&persistor, [2]);
        assert!(persistor.wal_len() > 0);
        save(&persistor, [3]);
        assert_eq!(persistor.wal_len(), 0);
        assert!(dir.path().join(SNAPSHOT_FILE).exists());
        drop(persistor);

        let reopened = WalPersistor::open(dir.path()).unwrap();
        assert_eq!(reopened.record_count(), 3);
    }

    #[test]
    fn test_corrupt_snapshot_is_reported() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(SNAPSHOT_FILE), b"\xff\xff\xff\xff\xff\xff\xff\xff\xff").unwrap();
        let err = WalPersistor::open(dir.path()).unwrap_err();
        assert!(matches!(err, StoreError::Corrupted(_)));
    }
}
