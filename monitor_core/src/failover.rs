// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Failover hand-off to a new primary.
//!
//! The new primary creates its lock manager in the `Starting` state, asks
//! every client for its lock state and re-establishes what each client
//! reports. Transaction mappings seen by surviving replicas are reinstated
//! in the store. Once every expected client answered, or the reconnect
//! window closed, the manager starts and clients that never reconciled are
//! disconnected.

use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HandoffConfig;
use crate::error::{MonitorError, Result};
use crate::ids::{GlobalTransactionId, NodeId, ServerTransactionId, ThreadContext};
use crate::messages::{LockReport, Message};
use crate::server_lock_manager::ServerLockManager;
use crate::transaction_store::TransactionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoffPhase {
    /// Waiting for client handshakes.
    CollectingHandshakes,
    /// Starting the manager and dropping unreconciled clients.
    Finalizing,
    Completed,
}

/// What a hand-off rebuilt and who it gave up on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffStats {
    pub reconciled_nodes: usize,
    pub held: usize,
    pub waiting: usize,
    pub pending: usize,
    /// Transaction mappings reinstated from surviving replicas.
    pub transactions: usize,
    /// Descriptors dropped because their client did not come back.
    pub purged_descriptors: usize,
    pub disconnected: Vec<NodeId>,
}

#[derive(Debug)]
pub struct FailoverHandoff {
    epoch: u64,
    phase: HandoffPhase,
    expected: BTreeSet<NodeId>,
    reconciled: BTreeSet<NodeId>,
    rejected: BTreeSet<NodeId>,
    deadline: Instant,
    stats: HandoffStats,
}

impl FailoverHandoff {
    pub fn new(
        epoch: u64,
        expected: impl IntoIterator<Item = NodeId>,
        config: &HandoffConfig,
        now: Instant,
    ) -> Self {
        let expected: BTreeSet<NodeId> = expected.into_iter().collect();
        info!(epoch, clients = expected.len(), "Failover hand-off started");
        Self {
            epoch,
            phase: HandoffPhase::CollectingHandshakes,
            expected,
            reconciled: BTreeSet::new(),
            rejected: BTreeSet::new(),
            deadline: now + config.reconnect_window(),
            stats: HandoffStats::default(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn phase(&self) -> HandoffPhase {
        self.phase
    }

    pub fn stats(&self) -> &HandoffStats {
        &self.stats
    }

    pub fn start_message(&self) -> Message {
        Message::HandoffStart { epoch: self.epoch }
    }

    pub fn expected(&self) -> &BTreeSet<NodeId> {
        &self.expected
    }

    pub fn is_reconciled(&self, node: &NodeId) -> bool {
        self.reconciled.contains(node)
    }

    pub fn reconciled(&self) -> impl Iterator<Item = &NodeId> {
        self.reconciled.iter()
    }

    /// Every expected client answered, or the reconnect window closed.
    pub fn is_ready(&self, now: Instant) -> bool {
        now >= self.deadline
            || self
                .expected
                .iter()
                .all(|n| self.reconciled.contains(n) || self.rejected.contains(n))
    }

    pub fn time_left(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    /// Reinstate global ids for transactions a surviving replica saw,
    /// remapping any that this store knows under a different id.
    pub fn recover_transactions(
        &mut self,
        store: &TransactionStore,
        mappings: &[(ServerTransactionId, GlobalTransactionId)],
    ) -> Result<usize> {
        store.set_recovering(true);
        let mut tx = store.begin();
        for (txn, gid) in mappings {
            if let Err(e) = store.create_global_transaction_desc_if_needed(&mut tx, txn, *gid) {
                tx.abort();
                store.set_recovering(false);
                return Err(e);
            }
        }
        if let Err(e) = store.commit(tx) {
            store.set_recovering(false);
            return Err(e);
        }
        self.stats.transactions += mappings.len();
        Ok(mappings.len())
    }

    /// Re-establish everything `node` reported. A report that conflicts with
    /// state already rebuilt rejects the node and clears what it added.
    pub fn apply_handshake(
        &mut self,
        manager: &ServerLockManager,
        node: &NodeId,
        epoch: u64,
        reports: Vec<LockReport>,
    ) -> Result<()> {
        if self.phase != HandoffPhase::CollectingHandshakes {
            return Err(MonitorError::Handoff(format!(
                "handshake from {node} after hand-off {} finished",
                self.epoch
            )));
        }
        if epoch != self.epoch {
            return Err(MonitorError::Handoff(format!(
                "handshake from {node} for epoch {epoch}, expected {}",
                self.epoch
            )));
        }
        if self.reconciled.contains(node) {
            debug!(node = %node, "Duplicate handshake ignored");
            return Ok(());
        }
        if !self.expected.contains(node) {
            warn!(node = %node, "Handshake from a client not in the previous view");
        }

        match Self::reestablish(manager, node, reports) {
            Ok((held, waiting, pending)) => {
                self.stats.held += held;
                self.stats.waiting += waiting;
                self.stats.pending += pending;
                self.reconciled.insert(node.clone());
                debug!(node = %node, held, waiting, pending, "Client reconciled");
                Ok(())
            },
            Err(e) => {
                warn!(node = %node, error = %e, "Client could not be reconciled");
                manager.clear_all_for_node(node);
                self.rejected.insert(node.clone());
                Err(e)
            },
        }
    }

    fn reestablish(
        manager: &ServerLockManager,
        node: &NodeId,
        reports: Vec<LockReport>,
    ) -> Result<(usize, usize, usize)> {
        let (mut held, mut waiting, mut pending) = (0, 0, 0);
        for report in reports {
            let lock_id = report.lock_id;
            for hold in report.held {
                manager.reestablish_lock(&lock_id, ThreadContext::new(node.clone(), hold.thread), hold.levels)?;
                held += 1;
            }
            for wait in report.waiting {
                manager.reestablish_wait(&lock_id, ThreadContext::new(node.clone(), wait.thread), wait.timer)?;
                waiting += 1;
            }
            for req in report.pending {
                let ctx = ThreadContext::new(node.clone(), req.thread);
                match req.try_timeout_ms {
                    Some(ms) => manager.try_request_lock(&lock_id, ctx, req.level, Duration::from_millis(ms))?,
                    None => manager.request_lock(&lock_id, ctx, req.level)?,
                }
                pending += 1;
            }
        }
        Ok((held, waiting, pending))
    }

    /// Start the lock manager, drop clients that did not reconcile and
    /// their transactions. Returns the final statistics. If the store batch
    /// fails the hand-off stays open and may be finished again.
    pub fn finish(&mut self, manager: &ServerLockManager, store: &TransactionStore) -> Result<HandoffStats> {
        if self.phase == HandoffPhase::Completed {
            return Err(MonitorError::Handoff(format!("hand-off {} already finished", self.epoch)));
        }
        self.phase = HandoffPhase::Finalizing;

        let missing: Vec<NodeId> = self
            .expected
            .iter()
            .chain(self.rejected.iter())
            .filter(|n| !self.reconciled.contains(*n))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for node in &missing {
            warn!(node = %node, epoch = self.epoch, "Client did not reconnect in time");
            manager.clear_all_for_node(node);
        }

        let keep: HashSet<NodeId> = self.reconciled.iter().cloned().collect();
        let mut tx = store.begin();
        let purged = store
            .shutdown_all_clients_except(&mut tx, &keep)
            .and_then(|n| store.commit(tx).map(|()| n));
        store.set_recovering(false);
        let purged = match purged {
            Ok(n) => n,
            Err(e) => {
                // Nothing was applied; the next attempt starts over.
                self.phase = HandoffPhase::CollectingHandshakes;
                return Err(e);
            },
        };

        manager.start();
        self.stats.reconciled_nodes = self.reconciled.len();
        self.stats.purged_descriptors = purged;
        self.stats.disconnected = missing;
        self.phase = HandoffPhase::Completed;
        info!(
            epoch = self.epoch,
            reconciled = self.stats.reconciled_nodes,
            disconnected = self.stats.disconnected.len(),
            held = self.stats.held,
            waiting = self.stats.waiting,
            pending = self.stats.pending,
            "Failover hand-off completed"
        );
        Ok(self.stats.clone())
    }
}
