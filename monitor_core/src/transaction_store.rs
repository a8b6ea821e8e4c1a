// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Transaction sequencer and store.
//!
//! Assigns every client transaction its global commit id and keeps two
//! indexes over the resulting descriptors: by server transaction id for ack
//! bookkeeping, and by global id (ordered) for low-water-mark scans.
//!
//! Mutations that touch durable state go through a [`StoreTransaction`]. The
//! persistence operations are buffered into its [`PersistenceTx`]; the
//! matching index changes are applied only once [`TransactionStore::commit`]
//! succeeds, so a failed batch leaves the store as it was and the next cycle
//! retries it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use monitor_store::{MutableSequence, PersistenceTx, TransactionPersistor};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::SequencerConfig;
use crate::descriptor::GlobalTransactionDescriptor;
use crate::error::{MonitorError, Result};
use crate::ids::{GlobalTransactionId, NodeId, ServerTransactionId};
use crate::metrics::SequencerStats;

/// Index changes waiting for their persistence batch to commit.
#[derive(Debug)]
enum Effect {
    Complete {
        txn: ServerTransactionId,
        awaiting: BTreeSet<NodeId>,
    },
    /// Server-generated transactions are forgotten as soon as they commit.
    Forget(ServerTransactionId),
    Purge(Vec<GlobalTransactionId>),
    /// Install a recovered mapping, replacing whatever `txn` maps to.
    Remap {
        txn: ServerTransactionId,
        old_gid: Option<GlobalTransactionId>,
        desc: GlobalTransactionDescriptor,
    },
}

/// A persistence batch plus the index changes it carries.
#[derive(Debug)]
pub struct StoreTransaction {
    persistence: PersistenceTx,
    effects: Vec<Effect>,
}

impl StoreTransaction {
    pub fn persistence(&self) -> &PersistenceTx {
        &self.persistence
    }

    pub fn is_empty(&self) -> bool {
        self.persistence.is_empty() && self.effects.is_empty()
    }

    /// Drop the batch; nothing it carries is applied.
    pub fn abort(self) {
        self.persistence.abort();
    }

    /// Mappings this batch will install, latest per transaction.
    fn pending_remaps(&self) -> HashMap<&ServerTransactionId, &GlobalTransactionDescriptor> {
        self.effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Remap { txn, desc, .. } => Some((txn, desc)),
                _ => None,
            })
            .collect()
    }
}

/// The sequencer's indexes, owned by one [`TransactionStore`].
#[derive(Debug, Default)]
pub struct SequencerState {
    by_server_id: HashMap<ServerTransactionId, GlobalTransactionDescriptor>,
    by_global_id: BTreeMap<GlobalTransactionId, ServerTransactionId>,
    /// Highest mark handed out so far; the mark never moves backwards.
    low_water_mark: GlobalTransactionId,
}

impl SequencerState {
    fn insert(&mut self, desc: GlobalTransactionDescriptor) {
        self.by_global_id
            .insert(desc.global_id(), desc.server_txn().clone());
        self.by_server_id.insert(desc.server_txn().clone(), desc);
    }

    fn remove_global(&mut self, gid: GlobalTransactionId) -> Option<GlobalTransactionDescriptor> {
        let txn = self.by_global_id.remove(&gid)?;
        self.by_server_id.remove(&txn)
    }

    fn descriptor_by_global(&self, gid: GlobalTransactionId) -> Option<&GlobalTransactionDescriptor> {
        self.by_global_id
            .get(&gid)
            .and_then(|txn| self.by_server_id.get(txn))
    }

    /// Lowest global id not yet settled, or `next_unassigned` if all are.
    fn compute_low_water_mark(&self, next_unassigned: GlobalTransactionId) -> GlobalTransactionId {
        self.by_global_id
            .iter()
            .find(|(_, txn)| !self.by_server_id.get(*txn).is_some_and(GlobalTransactionDescriptor::is_settled))
            .map_or(next_unassigned, |(gid, _)| *gid)
    }

    fn global_ids_where(&self, pred: impl Fn(&GlobalTransactionDescriptor) -> bool) -> Vec<GlobalTransactionId> {
        self.by_server_id
            .values()
            .filter(|d| pred(d))
            .map(GlobalTransactionDescriptor::global_id)
            .collect()
    }
}

pub struct TransactionStore {
    state: Mutex<SequencerState>,
    persistor: Arc<dyn TransactionPersistor>,
    sequence: Arc<dyn MutableSequence>,
    config: SequencerConfig,
    stats: SequencerStats,
    /// Set while a failover rebuild may remap transactions.
    recovering: AtomicBool,
}

impl std::fmt::Debug for TransactionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStore")
            .field("descriptors", &self.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TransactionStore {
    /// Open the store, reloading every persisted descriptor. The sequence is
    /// moved past the highest loaded global id.
    pub fn new(
        persistor: Arc<dyn TransactionPersistor>,
        sequence: Arc<dyn MutableSequence>,
        config: SequencerConfig,
    ) -> Result<Self> {
        let mut state = SequencerState::default();
        let mut stale = BTreeSet::new();
        for record in persistor.load_all_global_transaction_descriptors()? {
            let desc = GlobalTransactionDescriptor::from_record(&record);
            // Records come ordered by global id, so a repeat is a newer mapping.
            if let Some(old) = state.by_server_id.get(desc.server_txn()) {
                warn!(txn = %desc.server_txn(), old = %old.global_id(), new = %desc.global_id(), "Transaction persisted under two global ids, keeping the newer");
                let old_gid = old.global_id();
                state.by_global_id.remove(&old_gid);
                stale.insert(old_gid.0);
            }
            state.insert(desc);
        }
        if !stale.is_empty() {
            let mut tx = persistor.begin();
            persistor.delete_all_global_transaction_descriptors(&mut tx, &stale)?;
            tx.commit()?;
        }

        if let Some(max) = state.by_global_id.keys().next_back() {
            if sequence.current() <= max.0 {
                sequence.set_next(max.0 + 1)?;
            }
        }
        info!(
            descriptors = state.by_server_id.len(),
            next_global_id = sequence.current(),
            "Transaction store loaded"
        );

        Ok(Self {
            state: Mutex::new(state),
            persistor,
            sequence,
            config,
            stats: SequencerStats::new(),
            recovering: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    pub fn stats(&self) -> &SequencerStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.state.lock().by_server_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn begin(&self) -> StoreTransaction {
        StoreTransaction {
            persistence: self.persistor.begin(),
            effects: Vec::new(),
        }
    }

    /// Commit the persistence batch, then apply its index changes.
    pub fn commit(&self, tx: StoreTransaction) -> Result<()> {
        let StoreTransaction {
            persistence,
            effects,
        } = tx;
        let ops = persistence.record_count();
        if let Err(e) = persistence.commit() {
            SequencerStats::add(&self.stats.persistence_failures, 1);
            error!(error = %e, ops, "Transaction store batch failed, nothing applied");
            return Err(e.into());
        }

        let mut state = self.state.lock();
        for effect in effects {
            match effect {
                Effect::Complete { txn, awaiting } => {
                    if let Some(desc) = state.by_server_id.get_mut(&txn) {
                        desc.complete(awaiting);
                        SequencerStats::add(&self.stats.committed, 1);
                    }
                },
                Effect::Forget(txn) => {
                    if let Some(desc) = state.by_server_id.remove(&txn) {
                        state.by_global_id.remove(&desc.global_id());
                        SequencerStats::add(&self.stats.committed, 1);
                    }
                },
                Effect::Purge(gids) => {
                    let removed = gids
                        .into_iter()
                        .filter(|gid| state.remove_global(*gid).is_some())
                        .count();
                    SequencerStats::add(&self.stats.purged, removed);
                },
                Effect::Remap { txn, old_gid, mut desc } => {
                    if let Some(old) = state.by_server_id.remove(&txn) {
                        state.by_global_id.remove(&old.global_id());
                        desc.save_state_from(&old);
                    }
                    match old_gid {
                        Some(from) => {
                            SequencerStats::add(&self.stats.remapped, 1);
                            warn!(txn = %txn, from = %from, to = %desc.global_id(), "Remapped global transaction id");
                        },
                        None => SequencerStats::add(&self.stats.created, 1),
                    }
                    state.insert(desc);
                },
            }
        }
        Ok(())
    }

    /// The descriptor for `txn`, assigning the next global id on first sight.
    pub fn get_or_create_descriptor(&self, txn: &ServerTransactionId) -> Result<GlobalTransactionDescriptor> {
        let mut state = self.state.lock();
        if let Some(desc) = state.by_server_id.get(txn) {
            return Ok(desc.clone());
        }
        let gid = GlobalTransactionId(self.sequence.next()?);
        if let Some(existing) = state.by_global_id.get(&gid) {
            error!(global_id = %gid, existing = %existing, requested = %txn, "Sequence handed out a global id twice");
            return Err(MonitorError::DuplicateGlobalTransactionId {
                global_id: gid.0,
                existing: existing.to_string(),
                requested: txn.to_string(),
            });
        }
        let desc = GlobalTransactionDescriptor::new(txn.clone(), gid);
        state.insert(desc.clone());
        SequencerStats::add(&self.stats.created, 1);
        debug!(txn = %txn, global_id = %gid, "Assigned global transaction id");
        Ok(desc)
    }

    pub fn descriptor(&self, txn: &ServerTransactionId) -> Option<GlobalTransactionDescriptor> {
        self.state.lock().by_server_id.get(txn).cloned()
    }

    pub fn descriptor_by_global_id(&self, gid: GlobalTransactionId) -> Option<GlobalTransactionDescriptor> {
        self.state.lock().descriptor_by_global(gid).cloned()
    }

    /// Mark `txns` commit-complete. Each must be acknowledged by every node
    /// in `awaiting` before it can be purged. Server-generated transactions
    /// are not persisted and are forgotten once the batch commits.
    pub fn commit_all(
        &self,
        tx: &mut StoreTransaction,
        txns: &[ServerTransactionId],
        awaiting: &BTreeSet<NodeId>,
    ) -> Result<()> {
        for txn in txns {
            let desc = self.get_or_create_descriptor(txn)?;
            if txn.is_server_generated() {
                tx.effects.push(Effect::Forget(txn.clone()));
                continue;
            }
            let record = desc.to_record().completed();
            self.persistor
                .save_global_transaction_descriptor(&mut tx.persistence, &record)?;
            tx.effects.push(Effect::Complete {
                txn: txn.clone(),
                awaiting: awaiting.clone(),
            });
        }
        Ok(())
    }

    /// Record that `node` applied `gid`. Returns whether it was expected.
    pub fn acknowledge(&self, gid: GlobalTransactionId, node: &NodeId) -> bool {
        let mut state = self.state.lock();
        let Some(txn) = state.by_global_id.get(&gid).cloned() else {
            debug!(global_id = %gid, node = %node, "Ack for unknown global transaction");
            return false;
        };
        state
            .by_server_id
            .get_mut(&txn)
            .is_some_and(|desc| desc.acknowledge(node))
    }

    /// Every global id below the mark is committed and acknowledged.
    pub fn low_water_mark(&self) -> GlobalTransactionId {
        let mut state = self.state.lock();
        let computed = state.compute_low_water_mark(GlobalTransactionId(self.sequence.current()));
        if computed > state.low_water_mark {
            state.low_water_mark = computed;
        }
        state.low_water_mark
    }

    pub fn least_global_transaction_id(&self) -> Option<GlobalTransactionId> {
        self.state.lock().by_global_id.keys().next().copied()
    }

    /// Queue removal of settled descriptors below `mark`, lowest first. The
    /// scan stops at the first descriptor that is not settled and after
    /// `delete_batch_size` entries (0 means no limit).
    pub fn clear_committed_below_low_water_mark(
        &self,
        tx: &mut StoreTransaction,
        mark: GlobalTransactionId,
    ) -> Result<usize> {
        let limit = match self.config.delete_batch_size {
            0 => usize::MAX,
            n => n,
        };
        let gids: Vec<GlobalTransactionId> = {
            let state = self.state.lock();
            state
                .by_global_id
                .range(..mark)
                .map_while(|(gid, txn)| {
                    state
                        .by_server_id
                        .get(txn)
                        .filter(|d| d.is_settled())
                        .map(|_| *gid)
                })
                .take(limit)
                .collect()
        };
        self.queue_purge(tx, gids)
    }

    /// Queue removal of `mark.node`'s committed descriptors whose client
    /// transaction id is below `mark.txn`.
    pub fn clear_committed_below_client_mark(
        &self,
        tx: &mut StoreTransaction,
        mark: &ServerTransactionId,
    ) -> Result<usize> {
        let gids = self.state.lock().global_ids_where(|d| {
            d.server_txn().node == mark.node && d.server_txn().txn < mark.txn && d.is_commit_complete()
        });
        self.queue_purge(tx, gids)
    }

    /// Queue removal of everything `node` created and stop waiting for its acks.
    pub fn shutdown_node(&self, tx: &mut StoreTransaction, node: &NodeId) -> Result<usize> {
        let gids = {
            let mut state = self.state.lock();
            for desc in state.by_server_id.values_mut() {
                desc.acknowledge(node);
            }
            state.global_ids_where(|d| d.server_txn().node == *node)
        };
        info!(node = %node, descriptors = gids.len(), "Clearing transactions of departed node");
        self.queue_purge(tx, gids)
    }

    /// [`shutdown_node`](Self::shutdown_node) for every client not in `keep`.
    pub fn shutdown_all_clients_except(&self, tx: &mut StoreTransaction, keep: &HashSet<NodeId>) -> Result<usize> {
        let gids = {
            let mut state = self.state.lock();
            for desc in state.by_server_id.values_mut() {
                let gone: Vec<NodeId> = desc
                    .awaiting()
                    .iter()
                    .filter(|n| !keep.contains(*n))
                    .cloned()
                    .collect();
                for node in &gone {
                    desc.acknowledge(node);
                }
            }
            state.global_ids_where(|d| {
                !d.server_txn().is_server_generated() && !keep.contains(&d.server_txn().node)
            })
        };
        info!(kept = keep.len(), descriptors = gids.len(), "Clearing transactions of departed clients");
        self.queue_purge(tx, gids)
    }

    fn queue_purge(&self, tx: &mut StoreTransaction, mut gids: Vec<GlobalTransactionId>) -> Result<usize> {
        if gids.is_empty() {
            return Ok(0);
        }
        gids.sort_unstable();
        let ids: BTreeSet<u64> = gids.iter().map(|g| g.0).collect();
        self.persistor
            .delete_all_global_transaction_descriptors(&mut tx.persistence, &ids)?;
        let count = gids.len();
        tx.effects.push(Effect::Purge(gids));
        Ok(count)
    }

    /// One cleanup cycle in its own batch. Returns the number purged.
    pub fn run_low_water_mark_cleanup(&self) -> Result<usize> {
        let mark = self.low_water_mark();
        let mut tx = self.begin();
        let queued = self.clear_committed_below_low_water_mark(&mut tx, mark)?;
        if queued == 0 {
            tx.abort();
            return Ok(0);
        }
        self.commit(tx)?;
        debug!(mark = %mark, purged = queued, "Low-water-mark cleanup");
        Ok(queued)
    }

    /// Allow [`create_global_transaction_desc_if_needed`] to remap.
    ///
    /// [`create_global_transaction_desc_if_needed`]: Self::create_global_transaction_desc_if_needed
    pub fn set_recovering(&self, recovering: bool) {
        self.recovering.store(recovering, Ordering::Release);
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    /// Make `txn` map to `gid`, as a surviving replica saw it.
    ///
    /// An existing mapping to a different id is replaced only while
    /// recovering; otherwise it is a [`MonitorError::DuplicateGlobalTransactionId`].
    /// Indexes change only when `tx` commits. Mappings already queued in `tx`
    /// count as applied when checking later ones.
    pub fn create_global_transaction_desc_if_needed(
        &self,
        tx: &mut StoreTransaction,
        txn: &ServerTransactionId,
        gid: GlobalTransactionId,
    ) -> Result<()> {
        let state = self.state.lock();
        let pending = tx.pending_remaps();
        let owner = pending
            .iter()
            .find(|(_, desc)| desc.global_id() == gid)
            .map(|(owner, _)| (*owner).clone())
            .or_else(|| {
                state
                    .by_global_id
                    .get(&gid)
                    .filter(|owner| !pending.contains_key(owner))
                    .cloned()
            });
        if let Some(owner) = owner {
            if &owner == txn {
                return Ok(());
            }
            error!(global_id = %gid, existing = %owner, requested = %txn, "Global id already assigned");
            return Err(MonitorError::DuplicateGlobalTransactionId {
                global_id: gid.0,
                existing: owner.to_string(),
                requested: txn.to_string(),
            });
        }

        let current = pending
            .get(txn)
            .map(|desc| (*desc).clone())
            .or_else(|| state.by_server_id.get(txn).cloned());
        drop(pending);

        let mut desc = GlobalTransactionDescriptor::new(txn.clone(), gid);
        let old_gid = match current {
            Some(old) => {
                let old_gid = old.global_id();
                if !self.is_recovering() {
                    error!(txn = %txn, existing = %old_gid, requested = %gid, "Remap outside failover");
                    return Err(MonitorError::DuplicateGlobalTransactionId {
                        global_id: gid.0,
                        existing: format!("{txn} as {old_gid}"),
                        requested: txn.to_string(),
                    });
                }
                desc.save_state_from(&old);
                self.persistor.delete_all_global_transaction_descriptors(
                    &mut tx.persistence,
                    &BTreeSet::from([old_gid.0]),
                )?;
                Some(old_gid)
            },
            None => None,
        };

        if desc.is_commit_complete() && !txn.is_server_generated() {
            self.persistor
                .save_global_transaction_descriptor(&mut tx.persistence, &desc.to_record())?;
        }
        // The sequence moves even if the batch later aborts.
        if self.sequence.current() <= gid.0 {
            self.sequence.set_next(gid.0 + 1)?;
        }
        tx.effects.push(Effect::Remap {
            txn: txn.clone(),
            old_gid,
            desc,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use monitor_store::{MemoryPersistor, MemorySequence};

    use super::*;

    fn store_with(persistor: Arc<MemoryPersistor>, config: SequencerConfig) -> TransactionStore {
        TransactionStore::new(persistor, Arc::new(MemorySequence::new()), config).unwrap()
    }

    fn txn(node: &str, id: u64) -> ServerTransactionId {
        ServerTransactionId::new(node, id)
    }

    fn nodes(names: &[&str]) -> BTreeSet<NodeId> {
        names.iter().map(|n| NodeId::new(*n)).collect()
    }

    fn commit(store: &TransactionStore, txns: &[ServerTransactionId], awaiting: &BTreeSet<NodeId>) {
        let mut tx = store.begin();
        store.commit_all(&mut tx, txns, awaiting).unwrap();
        store.commit(tx).unwrap();
    }

    #[test]
    fn test_ids_are_increasing_and_idempotent() {
        let store = store_with(Arc::new(MemoryPersistor::new()), SequencerConfig::default());
        let a = store.get_or_create_descriptor(&txn("x", 1)).unwrap().global_id();
        let b = store.get_or_create_descriptor(&txn("y", 1)).unwrap().global_id();
        assert!(b > a);
        assert_eq!(store.get_or_create_descriptor(&txn("x", 1)).unwrap().global_id(), a);
        assert_eq!(store.stats().snapshot().created, 2);
    }

    #[test]
    fn test_purge_stops_at_unacknowledged() {
        let store = store_with(Arc::new(MemoryPersistor::new()), SequencerConfig::default());
        let txns: Vec<_> = (1..=100).map(|i| txn("x", i)).collect();
        commit(&store, &txns, &nodes(&["y"]));

        for gid in 1..=50 {
            assert!(store.acknowledge(GlobalTransactionId(gid), &NodeId::new("y")));
        }
        let mark = store.low_water_mark();
        assert_eq!(mark, GlobalTransactionId(51));

        let mut tx = store.begin();
        assert_eq!(store.clear_committed_below_low_water_mark(&mut tx, mark).unwrap(), 50);
        store.commit(tx).unwrap();
        assert_eq!(store.len(), 50);
        assert_eq!(store.least_global_transaction_id(), Some(GlobalTransactionId(51)));
        assert!(store.descriptor(&txn("x", 51)).is_some());
    }

    #[test]
    fn test_purge_never_passes_incomplete() {
        let store = store_with(Arc::new(MemoryPersistor::new()), SequencerConfig::default());
        commit(&store, &[txn("x", 1)], &BTreeSet::new());
        store.get_or_create_descriptor(&txn("x", 2)).unwrap();
        commit(&store, &[txn("x", 3)], &BTreeSet::new());

        assert_eq!(store.low_water_mark(), GlobalTransactionId(2));
        let mut tx = store.begin();
        let queued = store
            .clear_committed_below_low_water_mark(&mut tx, GlobalTransactionId(100))
            .unwrap();
        assert_eq!(queued, 1);
        store.commit(tx).unwrap();
        assert!(store.descriptor(&txn("x", 3)).is_some());
    }

    #[test]
    fn test_low_water_mark_never_decreases() {
        let store = store_with(Arc::new(MemoryPersistor::new()), SequencerConfig::default());
        commit(&store, &[txn("x", 1)], &BTreeSet::new());
        let first = store.low_water_mark();
        assert_eq!(first, GlobalTransactionId(2));
        assert_eq!(store.run_low_water_mark_cleanup().unwrap(), 1);

        // A descriptor reinstated below the mark does not pull it back.
        store.set_recovering(true);
        let mut tx = store.begin();
        store
            .create_global_transaction_desc_if_needed(&mut tx, &txn("z", 1), GlobalTransactionId(1))
            .unwrap();
        store.commit(tx).unwrap();
        assert!(store.low_water_mark() >= first);
    }

    #[test]
    fn test_failed_commit_leaves_state_unchanged() {
        let persistor = Arc::new(MemoryPersistor::new());
        let store = store_with(Arc::clone(&persistor), SequencerConfig::default());
        commit(&store, &[txn("x", 1), txn("x", 2)], &BTreeSet::new());

        persistor.fail_next_commits(1);
        assert!(store.run_low_water_mark_cleanup().is_err());
        assert_eq!(store.len(), 2);
        assert_eq!(persistor.record_count(), 2);
        assert_eq!(store.stats().snapshot().persistence_failures, 1);

        assert_eq!(store.run_low_water_mark_cleanup().unwrap(), 2);
        assert!(store.is_empty());
        assert_eq!(persistor.record_count(), 0);
    }

    #[test]
    fn test_delete_batch_size_caps_a_pass() {
        let config = SequencerConfig {
            delete_batch_size: 3,
            ..SequencerConfig::default()
        };
        let store = store_with(Arc::new(MemoryPersistor::new()), config);
        let txns: Vec<_> = (1..=5).map(|i| txn("x", i)).collect();
        commit(&store, &txns, &BTreeSet::new());
        assert_eq!(store.run_low_water_mark_cleanup().unwrap(), 3);
        assert_eq!(store.run_low_water_mark_cleanup().unwrap(), 2);
        assert_eq!(store.run_low_water_mark_cleanup().unwrap(), 0);
    }

    #[test]
    fn test_server_generated_not_persisted() {
        let persistor = Arc::new(MemoryPersistor::new());
        let store = store_with(Arc::clone(&persistor), SequencerConfig::default());
        let server_txn = txn("server-1", 1);
        assert!(server_txn.is_server_generated());
        commit(&store, &[server_txn.clone()], &nodes(&["y"]));
        assert_eq!(persistor.record_count(), 0);
        assert!(store.descriptor(&server_txn).is_none());
    }

    #[test]
    fn test_restart_reloads_and_continues_sequence() {
        let persistor = Arc::new(MemoryPersistor::new());
        let store = store_with(Arc::clone(&persistor), SequencerConfig::default());
        commit(&store, &[txn("x", 1), txn("x", 2)], &nodes(&["y"]));
        let gid = store.descriptor(&txn("x", 2)).unwrap().global_id();
        drop(store);

        let restarted = store_with(Arc::clone(&persistor), SequencerConfig::default());
        assert_eq!(restarted.len(), 2);
        assert_eq!(
            restarted.get_or_create_descriptor(&txn("x", 2)).unwrap().global_id(),
            gid
        );
        let fresh = restarted.get_or_create_descriptor(&txn("x", 3)).unwrap().global_id();
        assert!(fresh > gid);
    }

    #[test]
    fn test_shutdown_node_drops_its_descriptors_and_acks() {
        let store = store_with(Arc::new(MemoryPersistor::new()), SequencerConfig::default());
        commit(&store, &[txn("x", 1)], &nodes(&["y"]));
        commit(&store, &[txn("y", 1)], &nodes(&["x"]));

        let mut tx = store.begin();
        assert_eq!(store.shutdown_node(&mut tx, &NodeId::new("y")).unwrap(), 1);
        store.commit(tx).unwrap();
        assert!(store.descriptor(&txn("y", 1)).is_none());
        assert!(store.descriptor(&txn("x", 1)).unwrap().is_settled());
    }

    #[test]
    fn test_shutdown_all_clients_except() {
        let store = store_with(Arc::new(MemoryPersistor::new()), SequencerConfig::default());
        for node in ["a", "b", "c"] {
            commit(&store, &[txn(node, 1)], &BTreeSet::new());
        }
        let keep: HashSet<NodeId> = [NodeId::new("b")].into_iter().collect();
        let mut tx = store.begin();
        assert_eq!(store.shutdown_all_clients_except(&mut tx, &keep).unwrap(), 2);
        store.commit(tx).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.descriptor(&txn("b", 1)).is_some());
    }

    #[test]
    fn test_client_mark_clears_only_that_client() {
        let store = store_with(Arc::new(MemoryPersistor::new()), SequencerConfig::default());
        commit(&store, &[txn("x", 1), txn("x", 2), txn("x", 3), txn("y", 1)], &nodes(&["z"]));
        let mut tx = store.begin();
        assert_eq!(store.clear_committed_below_client_mark(&mut tx, &txn("x", 3)).unwrap(), 2);
        store.commit(tx).unwrap();
        assert!(store.descriptor(&txn("x", 3)).is_some());
        assert!(store.descriptor(&txn("y", 1)).is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remap_only_while_recovering() {
        let persistor = Arc::new(MemoryPersistor::new());
        let store = store_with(Arc::clone(&persistor), SequencerConfig::default());
        commit(&store, &[txn("x", 1)], &nodes(&["y"]));
        let old = store.descriptor(&txn("x", 1)).unwrap().global_id();

        let mut tx = store.begin();
        let err = store
            .create_global_transaction_desc_if_needed(&mut tx, &txn("x", 1), GlobalTransactionId(10))
            .unwrap_err();
        assert!(matches!(err, MonitorError::DuplicateGlobalTransactionId { .. }));

        store.set_recovering(true);
        store
            .create_global_transaction_desc_if_needed(&mut tx, &txn("x", 1), GlobalTransactionId(10))
            .unwrap();
        store.commit(tx).unwrap();
        store.set_recovering(false);

        let desc = store.descriptor(&txn("x", 1)).unwrap();
        assert_eq!(desc.global_id(), GlobalTransactionId(10));
        assert!(desc.is_commit_complete());
        assert!(desc.awaiting().contains(&NodeId::new("y")));
        assert!(store.descriptor_by_global_id(old).is_none());
        assert!(persistor.get(old.0).is_none());
        assert!(persistor.get(10).is_some());
        assert_eq!(store.stats().snapshot().remapped, 1);

        let next = store.get_or_create_descriptor(&txn("x", 2)).unwrap().global_id();
        assert!(next > GlobalTransactionId(10));
    }

    #[test]
    fn test_global_id_taken_by_other_transaction() {
        let store = store_with(Arc::new(MemoryPersistor::new()), SequencerConfig::default());
        let gid = store.get_or_create_descriptor(&txn("x", 1)).unwrap().global_id();
        store.set_recovering(true);
        let mut tx = store.begin();
        assert!(store
            .create_global_transaction_desc_if_needed(&mut tx, &txn("y", 1), gid)
            .is_err());
        tx.abort();
    }

    #[test]
    fn test_queued_remaps_apply_only_on_commit() {
        let persistor = Arc::new(MemoryPersistor::new());
        let store = store_with(Arc::clone(&persistor), SequencerConfig::default());
        commit(&store, &[txn("x", 1), txn("y", 1)], &BTreeSet::new());
        store.set_recovering(true);

        let mut tx = store.begin();
        store
            .create_global_transaction_desc_if_needed(&mut tx, &txn("x", 1), GlobalTransactionId(10))
            .unwrap();
        assert_eq!(store.descriptor(&txn("x", 1)).unwrap().global_id(), GlobalTransactionId(1));
        assert!(store.descriptor_by_global_id(GlobalTransactionId(10)).is_none());

        // Id 1 is freed by the queued remap; id 10 is taken by it.
        store
            .create_global_transaction_desc_if_needed(&mut tx, &txn("z", 1), GlobalTransactionId(1))
            .unwrap();
        assert!(store
            .create_global_transaction_desc_if_needed(&mut tx, &txn("w", 1), GlobalTransactionId(10))
            .is_err());
        store
            .create_global_transaction_desc_if_needed(&mut tx, &txn("x", 1), GlobalTransactionId(10))
            .unwrap();
        store.commit(tx).unwrap();

        assert_eq!(store.descriptor(&txn("x", 1)).unwrap().global_id(), GlobalTransactionId(10));
        assert_eq!(store.descriptor(&txn("z", 1)).unwrap().global_id(), GlobalTransactionId(1));
        assert_eq!(store.descriptor(&txn("y", 1)).unwrap().global_id(), GlobalTransactionId(2));
        assert_eq!(store.len(), 3);
        let stats = store.stats().snapshot();
        assert_eq!(stats.remapped, 1);
        assert_eq!(stats.created, 3);
    }

    #[test]
    fn test_aborted_remap_batch_changes_nothing() {
        let persistor = Arc::new(MemoryPersistor::new());
        let store = store_with(Arc::clone(&persistor), SequencerConfig::default());
        commit(&store, &[txn("x", 1)], &BTreeSet::new());
        store.set_recovering(true);

        let mut tx = store.begin();
        store
            .create_global_transaction_desc_if_needed(&mut tx, &txn("x", 1), GlobalTransactionId(10))
            .unwrap();
        tx.abort();

        assert_eq!(store.descriptor(&txn("x", 1)).unwrap().global_id(), GlobalTransactionId(1));
        assert!(store.descriptor_by_global_id(GlobalTransactionId(10)).is_none());
        assert!(persistor.get(1).is_some());
        assert!(persistor.get(10).is_none());
        assert_eq!(store.stats().snapshot().remapped, 0);
    }
}
