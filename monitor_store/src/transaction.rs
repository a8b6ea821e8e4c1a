// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Transactional scope for descriptor persistence.
//!
//! A [`PersistenceTx`] buffers saves and deletes; nothing reaches the backing
//! journal until [`PersistenceTx::commit`]. A commit applies the whole batch
//! or none of it, so a cleanup pass that fails halfway leaves the durable
//! state exactly as it was before the pass began.

use std::sync::Arc;

use uuid::Uuid;

use crate::{
    error::{Result, StoreError},
    record::StoreOp,
};

/// Backend that applies committed batches atomically.
pub trait Journal: Send + Sync {
    /// Identity used to reject transactions opened against another journal.
    fn journal_id(&self) -> Uuid;

    /// Apply a batch. Either every op is applied or none is.
    fn apply(&self, tx_id: u64, batch: &[StoreOp]) -> Result<()>;
}

/// An open persistence transaction.
pub struct PersistenceTx {
    id: u64,
    ops: Vec<StoreOp>,
    journal: Arc<dyn Journal>,
    finished: bool,
}

impl std::fmt::Debug for PersistenceTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceTx")
            .field("id", &self.id)
            .field("ops", &self.ops.len())
            .field("journal", &self.journal.journal_id())
            .finish()
    }
}

impl PersistenceTx {
    pub(crate) fn new(id: u64, journal: Arc<dyn Journal>) -> Self {
        Self {
            id,
            ops: Vec::new(),
            journal,
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of records touched by the buffered operations.
    pub fn record_count(&self) -> usize {
        self.ops.iter().map(StoreOp::record_count).sum()
    }

    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub(crate) fn push(&mut self, journal_id: Uuid, op: StoreOp) -> Result<()> {
        if self.journal.journal_id() != journal_id {
            return Err(StoreError::ForeignTransaction {
                tx_id: self.id,
                journal: journal_id.to_string(),
            });
        }
        self.ops.push(op);
        Ok(())
    }

    /// Apply every buffered operation atomically.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let ops = std::mem::take(&mut self.ops);
        if ops.is_empty() {
            return Ok(());
        }
        self.journal.apply(self.id, &ops)
    }

    /// Discard every buffered operation.
    pub fn abort(mut self) {
        self.finished = true;
        if !self.ops.is_empty() {
            tracing::debug!(tx_id = self.id, ops = self.ops.len(), "persistence transaction aborted");
        }
        self.ops.clear();
    }
}

impl Drop for PersistenceTx {
    fn drop(&mut self) {
        if !self.finished && !self.ops.is_empty() {
            tracing::warn!(
                tx_id = self.id,
                ops = self.ops.len(),
                "persistence transaction dropped without commit, discarding"
            );
        }
    }
}
