// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Descriptor persistence interface and the heap-backed implementation.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::{
    error::{Result, StoreError},
    record::{DescriptorRecord, StoreOp},
    transaction::{Journal, PersistenceTx},
};

/// Persistence collaborator consumed by the transaction store.
///
/// Mutations are only ever buffered into a caller-supplied
/// [`PersistenceTx`]; the caller decides when the batch commits.
pub trait TransactionPersistor: Send + Sync {
    /// Open a new transactional scope on this persistor.
    fn begin(&self) -> PersistenceTx;

    fn save_global_transaction_descriptor(
        &self,
        tx: &mut PersistenceTx,
        record: &DescriptorRecord,
    ) -> Result<()>;

    fn delete_all_global_transaction_descriptors(
        &self,
        tx: &mut PersistenceTx,
        global_ids: &BTreeSet<u64>,
    ) -> Result<()>;

    /// Every committed record, ordered by global id.
    fn load_all_global_transaction_descriptors(&self) -> Result<Vec<DescriptorRecord>>;

    /// Number of committed records.
    fn record_count(&self) -> usize;
}

/// Apply a batch to an ordered record map.
pub(crate) fn apply_ops(records: &mut BTreeMap<u64, DescriptorRecord>, batch: &[StoreOp]) {
    for op in batch {
        match op {
            StoreOp::Save(record) => {
                records.insert(record.global_id, record.clone());
            },
            StoreOp::Delete(ids) => {
                for id in ids {
                    records.remove(id);
                }
            },
        }
    }
}

struct MemoryJournal {
    id: Uuid,
    records: RwLock<BTreeMap<u64, DescriptorRecord>>,
    applied: RwLock<Vec<StoreOp>>,
    fail_commits: AtomicU64,
}

impl Journal for MemoryJournal {
    fn journal_id(&self) -> Uuid {
        self.id
    }

    fn apply(&self, tx_id: u64, batch: &[StoreOp]) -> Result<()> {
        let injected = self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::CommitFailed(format!(
                "injected failure for transaction {tx_id}"
            )));
        }

        let mut records = self.records.write();
        apply_ops(&mut records, batch);
        self.applied.write().extend(batch.iter().cloned());
        Ok(())
    }
}

/// Heap-backed persistor.
///
/// Durable only for the lifetime of the process; used by tests and by
/// passive servers that rebuild from the active on start.
pub struct MemoryPersistor {
    journal: Arc<MemoryJournal>,
    next_tx_id: AtomicU64,
}

impl Default for MemoryPersistor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistor {
    pub fn new() -> Self {
        Self {
            journal: Arc::new(MemoryJournal {
                id: Uuid::new_v4(),
                records: RwLock::new(BTreeMap::new()),
                applied: RwLock::new(Vec::new()),
                fail_commits: AtomicU64::new(0),
            }),
            next_tx_id: AtomicU64::new(1),
        }
    }

    /// Make the next `count` commits fail without applying anything.
    pub fn fail_next_commits(&self, count: u64) {
        self.journal.fail_commits.store(count, Ordering::SeqCst);
    }

    /// Every operation applied so far, in commit order.
    pub fn applied_ops(&self) -> Vec<StoreOp> {
        self.journal.applied.read().clone()
    }

    /// Ids removed by committed delete operations, in commit order.
    pub fn deleted_ids(&self) -> Vec<u64> {
        self.journal
            .applied
            .read()
            .iter()
            .filter_map(|op| match op {
                StoreOp::Delete(ids) => Some(ids.clone()),
                StoreOp::Save(_) => None,
            })
            .flatten()
            .collect()
    }

    pub fn get(&self, global_id: u64) -> Option<DescriptorRecord> {
        self.journal.records.read().get(&global_id).cloned()
    }
}

impl TransactionPersistor for MemoryPersistor {
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
        Ok(self.journal.records.read().values().cloned().collect())
    }

    fn record_count(&self) -> usize {
        self.journal.records.read().len()
    }
}
