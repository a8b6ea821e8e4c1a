// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Network loops that connect the managers to a [`Transport`].
//!
//! [`ServerNode`] runs on the primary: it dispatches lock traffic to the
//! [`ServerLockManager`], sequences commits through the [`TransactionStore`],
//! forwards every response the lock manager produces, and drives timers,
//! low-water-mark cleanup and failover hand-off from a periodic tick.
//!
//! [`ClientNode`] runs on every client: it carries the
//! [`ClientLockManager`]'s requests to the current server, feeds server
//! messages back in, answers hand-off requests and acknowledges transactions
//! committed elsewhere.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use monitor_store::{MutableSequence, TransactionPersistor};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::client_lock_manager::ClientLockManager;
use crate::config::{ClientLockConfig, MonitorConfig};
use crate::error::{MonitorError, Result};
use crate::failover::FailoverHandoff;
use crate::ids::{
    GlobalTransactionId, NodeId, ServerTransactionId, ThreadContext, TransactionId, SERVER_NODE_PREFIX,
};
use crate::messages::{LockReport, Message};
use crate::remote::RemoteLockManager;
use crate::server_lock_manager::ServerLockManager;
use crate::sink::ChannelSink;
use crate::transaction_store::TransactionStore;
use crate::transport::Transport;

/// How long one receive waits before the loop looks at its other sources.
const RECV_POLL: Duration = Duration::from_millis(10);

fn is_server(node: &NodeId) -> bool {
    node.as_str().starts_with(SERVER_NODE_PREFIX)
}

/// A commit whose store batch failed, retried on the next tick.
#[derive(Debug)]
struct QueuedCommit {
    from: NodeId,
    txn: ServerTransactionId,
    changes: Vec<u8>,
}

pub struct ServerNode {
    transport: Arc<dyn Transport>,
    locks: Arc<ServerLockManager>,
    store: Arc<TransactionStore>,
    config: MonitorConfig,
    outbound: AsyncMutex<mpsc::UnboundedReceiver<(NodeId, Message)>>,
    handoff: Mutex<Option<FailoverHandoff>>,
    retry_commits: Mutex<Vec<QueuedCommit>>,
    /// Departed nodes whose descriptors could not be removed yet.
    retry_departed: Mutex<Vec<NodeId>>,
}

impl ServerNode {
    /// A primary with a started lock manager.
    pub fn open(
        transport: Arc<dyn Transport>,
        persistor: Arc<dyn TransactionPersistor>,
        sequence: Arc<dyn MutableSequence>,
        config: MonitorConfig,
    ) -> Result<Self> {
        let node = Self::build(transport, persistor, sequence, config)?;
        node.locks.start();
        Ok(node)
    }

    /// A new primary taking over after failover. The lock manager stays in
    /// `Starting` until every client in `clients` reconciled or the
    /// reconnect window closed. `mappings` are the transactions a surviving
    /// replica saw committed.
    pub fn take_over(
        transport: Arc<dyn Transport>,
        persistor: Arc<dyn TransactionPersistor>,
        sequence: Arc<dyn MutableSequence>,
        config: MonitorConfig,
        epoch: u64,
        clients: impl IntoIterator<Item = NodeId>,
        mappings: &[(ServerTransactionId, GlobalTransactionId)],
    ) -> Result<Self> {
        let node = Self::build(transport, persistor, sequence, config)?;
        let mut handoff = FailoverHandoff::new(epoch, clients, &node.config.handoff, Instant::now());
        handoff.recover_transactions(&node.store, mappings)?;
        *node.handoff.lock() = Some(handoff);
        Ok(node)
    }

    fn build(
        transport: Arc<dyn Transport>,
        persistor: Arc<dyn TransactionPersistor>,
        sequence: Arc<dyn MutableSequence>,
        config: MonitorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (sink, outbound) = ChannelSink::new();
        let locks = Arc::new(ServerLockManager::new(config.lock_manager.clone(), Arc::new(sink)));
        let store = Arc::new(TransactionStore::new(persistor, sequence, config.sequencer.clone())?);
        Ok(Self {
            transport,
            locks,
            store,
            config,
            outbound: AsyncMutex::new(outbound),
            handoff: Mutex::new(None),
            retry_commits: Mutex::new(Vec::new()),
            retry_departed: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        self.transport.local_id()
    }

    pub fn lock_manager(&self) -> &Arc<ServerLockManager> {
        &self.locks
    }

    pub fn store(&self) -> &Arc<TransactionStore> {
        &self.store
    }

    pub fn is_handing_off(&self) -> bool {
        self.handoff.lock().is_some()
    }

    /// Run until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut outbound = self.outbound.lock().await;
        self.announce_handoff().await;

        let cleanup_interval = self.config.sequencer.lwm_cleanup_interval();
        let mut last_cleanup = Instant::now();
        let mut ticker = tokio::time::interval(self.config.lock_manager.timer_tick());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(node = %self.node_id(), "Server node running");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(node = %self.node_id(), "Server node shutting down");
                    break;
                }
                Some((to, msg)) = outbound.recv() => {
                    self.send(&to, msg).await;
                }
                recv_result = tokio::time::timeout(RECV_POLL, self.transport.recv()) => {
                    match recv_result {
                        Ok(Ok((from, msg))) => self.handle_message(from, msg).await,
                        Ok(Err(e)) => debug!(error = %e, "Receive failed"),
                        Err(_) => {},
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.on_tick(now).await;
                    if now.duration_since(last_cleanup) >= cleanup_interval {
                        self.run_cleanup();
                        last_cleanup = now;
                    }
                }
            }
        }
        Ok(())
    }

    async fn send(&self, to: &NodeId, msg: Message) {
        let msg_type = msg.type_name();
        if let Err(e) = self.transport.send(to, msg).await {
            debug!(to = %to, msg_type, error = %e, "Send failed");
        }
    }

    async fn announce_handoff(&self) {
        let (start, clients) = {
            let guard = self.handoff.lock();
            let Some(handoff) = guard.as_ref() else {
                return;
            };
            (handoff.start_message(), handoff.expected().clone())
        };
        for client in &clients {
            self.send(client, start.clone()).await;
        }
    }

    /// Dispatch one client message. Failures are logged, never fatal.
    pub async fn handle_message(&self, from: NodeId, msg: Message) {
        let msg_type = msg.type_name();
        let ctx = |thread| ThreadContext::new(from.clone(), thread);
        let result = match msg {
            Message::LockRequest { lock_id, thread, level } => {
                self.locks.request_lock(&lock_id, ctx(thread), level)
            },
            Message::TryLockRequest {
                lock_id,
                thread,
                level,
                timeout_ms,
            } => self
                .locks
                .try_request_lock(&lock_id, ctx(thread), level, Duration::from_millis(timeout_ms)),
            Message::Unlock { lock_id, thread } => self.locks.unlock(&lock_id, &ctx(thread)),
            Message::WaitRequest { lock_id, thread, timer } => {
                self.locks.wait(&lock_id, &ctx(thread), timer)
            },
            Message::Notify { lock_id, thread, all } => {
                self.locks.notify(&lock_id, &ctx(thread), all).map(|woken| {
                    debug!(lock_id = %lock_id, woken = woken.len(), "Notify applied");
                })
            },
            Message::Interrupt { lock_id, thread } => self.locks.interrupt(&lock_id, ctx(thread)),
            Message::RecallCommit(report) => self.locks.recall_commit(&from, report),
            Message::Handshake { epoch, reports } => self.on_handshake(&from, epoch, reports),
            Message::CommitTransaction { txn, changes } => {
                self.commit(from.clone(), txn, changes).await;
                Ok(())
            },
            Message::CommitAck { global_id, node } => {
                if !self.store.acknowledge(global_id, &node) {
                    debug!(global_id = %global_id, node = %node, "Ack not expected");
                }
                Ok(())
            },
            Message::ClientLowWaterMark { below } => self.clear_client_mark(&from, below),
            Message::Goodbye => {
                self.node_disconnected(&from);
                Ok(())
            },
            other => {
                warn!(from = %from, msg_type = other.type_name(), "Unexpected message at server");
                Ok(())
            },
        };
        if let Err(e) = result {
            warn!(from = %from, msg_type, error = %e, "Request failed");
        }
    }

    fn on_handshake(&self, from: &NodeId, epoch: u64, reports: Vec<LockReport>) -> Result<()> {
        let mut guard = self.handoff.lock();
        let Some(handoff) = guard.as_mut() else {
            return Err(MonitorError::Handoff(format!(
                "handshake from {from} with no hand-off in progress"
            )));
        };
        handoff.apply_handshake(&self.locks, from, epoch, reports)
    }

    /// Assign the global id, make it durable, then tell the committer and
    /// every other client.
    async fn commit(&self, from: NodeId, txn: ServerTransactionId, changes: Vec<u8>) {
        if let Some(desc) = self.store.descriptor(&txn) {
            if desc.is_commit_complete() {
                debug!(txn = %txn, "Commit resent, already complete");
                self.send(
                    &from,
                    Message::CommitComplete {
                        txn,
                        global_id: desc.global_id(),
                    },
                )
                .await;
                return;
            }
        }

        let awaiting: BTreeSet<NodeId> = self
            .transport
            .peers()
            .into_iter()
            .filter(|peer| *peer != from && !is_server(peer))
            .collect();
        let global_id = match self.commit_batch(&txn, &awaiting) {
            Ok(gid) => gid,
            Err(e) => {
                warn!(txn = %txn, error = %e, "Commit failed, will retry");
                self.retry_commits.lock().push(QueuedCommit { from, txn, changes });
                return;
            },
        };

        self.send(
            &from,
            Message::CommitComplete {
                txn: txn.clone(),
                global_id,
            },
        )
        .await;
        for node in &awaiting {
            self.send(
                node,
                Message::TransactionBroadcast {
                    txn: txn.clone(),
                    global_id,
                    changes: changes.clone(),
                },
            )
            .await;
        }
    }

    fn commit_batch(&self, txn: &ServerTransactionId, awaiting: &BTreeSet<NodeId>) -> Result<GlobalTransactionId> {
        let global_id = self.store.get_or_create_descriptor(txn)?.global_id();
        let mut tx = self.store.begin();
        if let Err(e) = self.store.commit_all(&mut tx, std::slice::from_ref(txn), awaiting) {
            tx.abort();
            return Err(e);
        }
        self.store.commit(tx)?;
        Ok(global_id)
    }

    fn clear_client_mark(&self, from: &NodeId, below: TransactionId) -> Result<()> {
        let mark = ServerTransactionId {
            node: from.clone(),
            txn: below,
        };
        let mut tx = self.store.begin();
        let queued = self.store.clear_committed_below_client_mark(&mut tx, &mark)?;
        if queued == 0 {
            tx.abort();
            return Ok(());
        }
        self.store.commit(tx)
    }

    /// Release everything `node` held and forget its transactions.
    pub fn node_disconnected(&self, node: &NodeId) {
        info!(node = %node, "Client node departed");
        self.locks.clear_all_for_node(node);
        if let Err(e) = self.shutdown_node(node) {
            warn!(node = %node, error = %e, "Transaction cleanup for departed node failed, will retry");
            self.retry_departed.lock().push(node.clone());
        }
    }

    fn shutdown_node(&self, node: &NodeId) -> Result<usize> {
        let mut tx = self.store.begin();
        let removed = self.store.shutdown_node(&mut tx, node)?;
        self.store.commit(tx)?;
        Ok(removed)
    }

    async fn on_tick(&self, now: Instant) {
        self.locks.expire_timers(now);
        if self.config.lock_manager.deadlock_scan {
            self.locks.scan_for_deadlocks();
        }
        self.finish_handoff_if_ready(now).await;

        let departed = std::mem::take(&mut *self.retry_departed.lock());
        for node in departed {
            if let Err(e) = self.shutdown_node(&node) {
                debug!(node = %node, error = %e, "Departed node cleanup still failing");
                self.retry_departed.lock().push(node);
            }
        }
        let commits = std::mem::take(&mut *self.retry_commits.lock());
        for QueuedCommit { from, txn, changes } in commits {
            self.commit(from, txn, changes).await;
        }
    }

    fn run_cleanup(&self) {
        match self.store.run_low_water_mark_cleanup() {
            Ok(0) => {},
            Ok(purged) => debug!(purged, "Low-water-mark cleanup purged descriptors"),
            Err(e) => warn!(error = %e, "Low-water-mark cleanup failed, will retry"),
        }
    }

    async fn finish_handoff_if_ready(&self, now: Instant) {
        let finished = {
            let mut guard = self.handoff.lock();
            let Some(handoff) = guard.as_mut() else {
                return;
            };
            if !handoff.is_ready(now) {
                return;
            }
            match handoff.finish(&self.locks, &self.store) {
                Ok(stats) => {
                    let reconciled: Vec<NodeId> = handoff.reconciled().cloned().collect();
                    let epoch = handoff.epoch();
                    *guard = None;
                    (epoch, reconciled, stats.disconnected)
                },
                Err(e) => {
                    error!(epoch = handoff.epoch(), error = %e, "Failover hand-off could not finish");
                    return;
                },
            }
        };
        let (epoch, reconciled, disconnected) = finished;
        for node in &disconnected {
            self.send(node, Message::Goodbye).await;
        }
        for node in &reconciled {
            self.send(node, Message::HandshakeAck { epoch }).await;
        }
    }
}

impl std::fmt::Debug for ServerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerNode")
            .field("node", self.node_id())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// A transaction committed by another node, delivered in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTransaction {
    pub txn: ServerTransactionId,
    pub global_id: GlobalTransactionId,
    pub changes: Vec<u8>,
}

#[derive(Debug)]
struct PendingCommit {
    changes: Vec<u8>,
    done: oneshot::Sender<GlobalTransactionId>,
}

pub struct ClientNode {
    transport: Arc<dyn Transport>,
    server: RwLock<NodeId>,
    locks: Arc<ClientLockManager>,
    config: ClientLockConfig,
    outbound: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    next_txn: AtomicU64,
    commits: DashMap<ServerTransactionId, PendingCommit>,
    applied: mpsc::UnboundedSender<AppliedTransaction>,
}

impl ClientNode {
    /// Returns the node and the stream of transactions other nodes commit.
    pub fn new(
        transport: Arc<dyn Transport>,
        server: NodeId,
        config: ClientLockConfig,
    ) -> (Self, mpsc::UnboundedReceiver<AppliedTransaction>) {
        let (remote, outbound) = RemoteLockManager::new();
        let (applied, applied_rx) = mpsc::unbounded_channel();
        let locks = Arc::new(ClientLockManager::new(
            transport.local_id().clone(),
            config.clone(),
            remote,
        ));
        let node = Self {
            transport,
            server: RwLock::new(server),
            locks,
            config,
            outbound: AsyncMutex::new(outbound),
            next_txn: AtomicU64::new(1),
            commits: DashMap::new(),
            applied,
        };
        (node, applied_rx)
    }

    pub fn node_id(&self) -> &NodeId {
        self.transport.local_id()
    }

    /// The lock manager application threads call into.
    pub fn locks(&self) -> &Arc<ClientLockManager> {
        &self.locks
    }

    pub fn server(&self) -> NodeId {
        self.server.read().clone()
    }

    async fn send_to_server(&self, msg: Message) {
        let server = self.server();
        let msg_type = msg.type_name();
        if let Err(e) = self.transport.send(&server, msg).await {
            debug!(server = %server, msg_type, error = %e, "Send to server failed");
        }
    }

    /// Commit `changes` and wait for the global id.
    pub async fn commit(&self, changes: Vec<u8>) -> Result<GlobalTransactionId> {
        let txn = ServerTransactionId {
            node: self.node_id().clone(),
            txn: TransactionId(self.next_txn.fetch_add(1, Ordering::Relaxed)),
        };
        let (done, rx) = oneshot::channel();
        self.commits.insert(
            txn.clone(),
            PendingCommit {
                changes: changes.clone(),
                done,
            },
        );
        self.send_to_server(Message::CommitTransaction {
            txn: txn.clone(),
            changes,
        })
        .await;

        match tokio::time::timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(global_id)) => Ok(global_id),
            Ok(Err(_)) => Err(MonitorError::Disconnected(format!("commit of {txn} abandoned"))),
            Err(_) => {
                self.commits.remove(&txn);
                Err(MonitorError::Timeout(format!("commit of {txn}")))
            },
        }
    }

    /// Tell the server this node no longer needs its transactions below `below`.
    pub async fn send_low_water_mark(&self, below: TransactionId) {
        self.send_to_server(Message::ClientLowWaterMark { below }).await;
    }

    pub fn pending_commits(&self) -> usize {
        self.commits.len()
    }

    /// Run until `shutdown` fires, then say goodbye to the server.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut outbound = self.outbound.lock().await;
        let mut gc = tokio::time::interval(self.config.gc_interval());
        gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.send_to_server(Message::Goodbye).await;
                    info!(node = %self.node_id(), "Client node shutting down");
                    break;
                }
                Some(msg) = outbound.recv() => {
                    self.send_to_server(msg).await;
                }
                recv_result = tokio::time::timeout(RECV_POLL, self.transport.recv()) => {
                    match recv_result {
                        Ok(Ok((from, Message::HandoffStart { epoch }))) => {
                            self.locks.pause();
                            // Everything still queued for the old server is
                            // covered by the handshake.
                            while outbound.try_recv().is_ok() {}
                            self.on_handoff_start(from, epoch).await;
                        }
                        Ok(Ok((from, msg))) => self.handle_message(from, msg).await,
                        Ok(Err(e)) => debug!(error = %e, "Receive failed"),
                        Err(_) => {},
                    }
                }
                _ = gc.tick() => {
                    self.locks.run_lock_gc(Instant::now());
                }
            }
        }
        Ok(())
    }

    async fn on_handoff_start(&self, server: NodeId, epoch: u64) {
        info!(node = %self.node_id(), server = %server, epoch, "New server, sending handshake");
        *self.server.write() = server;
        let reports = self.locks.handshake();
        self.send_to_server(Message::Handshake { epoch, reports }).await;

        let unfinished: Vec<(ServerTransactionId, Vec<u8>)> = self
            .commits
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().changes.clone()))
            .collect();
        for (txn, changes) in unfinished {
            self.send_to_server(Message::CommitTransaction { txn, changes }).await;
        }
    }

    async fn handle_message(&self, from: NodeId, msg: Message) {
        if from != self.server() {
            warn!(from = %from, msg_type = msg.type_name(), "Message from a node that is not the server");
            return;
        }
        match msg {
            Message::LockAward { .. }
            | Message::LockRefused { .. }
            | Message::LockRecall { .. }
            | Message::Notified { .. }
            | Message::WaitTimeout { .. } => self.locks.handle_message(msg),
            Message::HandshakeAck { epoch } => {
                debug!(epoch, "Hand-off acknowledged");
                self.locks.unpause();
            },
            Message::CommitComplete { txn, global_id } => match self.commits.remove(&txn) {
                Some((_, pending)) => {
                    let _ = pending.done.send(global_id);
                },
                None => debug!(txn = %txn, "Completion for unknown commit"),
            },
            Message::TransactionBroadcast {
                txn,
                global_id,
                changes,
            } => {
                let _ = self.applied.send(AppliedTransaction {
                    txn,
                    global_id,
                    changes,
                });
                self.send_to_server(Message::CommitAck {
                    global_id,
                    node: self.node_id().clone(),
                })
                .await;
            },
            Message::Goodbye => {
                warn!(node = %self.node_id(), "Evicted by server");
                self.locks.disconnect();
                self.commits.clear();
            },
            other => warn!(msg_type = other.type_name(), "Unexpected message at client"),
        }
    }
}

impl std::fmt::Debug for ClientNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientNode")
            .field("node", self.node_id())
            .field("server", &self.server())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use monitor_store::{MemoryPersistor, MemorySequence};

    use super::*;
    use crate::ids::{LockId, ThreadId};
    use crate::lock_level::LockLevel;
    use crate::transport::MemoryTransport;

    fn server() -> (ServerNode, Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let server_transport = Arc::new(MemoryTransport::new(NodeId::new("server-1")));
        let client_transport = Arc::new(MemoryTransport::new(NodeId::new("c1")));
        MemoryTransport::link(&server_transport, &client_transport);
        let node = ServerNode::open(
            server_transport.clone(),
            Arc::new(MemoryPersistor::new()),
            Arc::new(MemorySequence::new()),
            MonitorConfig::default(),
        )
        .unwrap();
        (node, server_transport, client_transport)
    }

    #[tokio::test]
    async fn test_lock_request_produces_award() {
        let (node, _st, ct) = server();
        node.handle_message(
            NodeId::new("c1"),
            Message::LockRequest {
                lock_id: LockId::new("l"),
                thread: ThreadId(1),
                level: LockLevel::Write,
            },
        )
        .await;

        let (to, msg) = node.outbound.lock().await.recv().await.unwrap();
        assert_eq!(to, NodeId::new("c1"));
        assert!(matches!(msg, Message::LockAward { greedy: true, .. }));
        drop(ct);
    }

    #[tokio::test]
    async fn test_commit_replies_and_is_idempotent() {
        let (node, _st, ct) = server();
        let txn = ServerTransactionId::new("c1", 1);
        node.handle_message(
            NodeId::new("c1"),
            Message::CommitTransaction {
                txn: txn.clone(),
                changes: vec![1, 2],
            },
        )
        .await;
        let (_, first) = ct.recv().await.unwrap();
        let Message::CommitComplete { global_id, .. } = first else {
            panic!("expected CommitComplete, got {first:?}");
        };

        node.handle_message(
            NodeId::new("c1"),
            Message::CommitTransaction {
                txn: txn.clone(),
                changes: vec![1, 2],
            },
        )
        .await;
        let (_, second) = ct.recv().await.unwrap();
        assert_eq!(second, Message::CommitComplete { txn, global_id });
        assert_eq!(node.store().len(), 1);
    }

    #[tokio::test]
    async fn test_goodbye_clears_node() {
        let (node, _st, _ct) = server();
        let from = NodeId::new("c1");
        node.handle_message(
            from.clone(),
            Message::CommitTransaction {
                txn: ServerTransactionId::new("c1", 1),
                changes: Vec::new(),
            },
        )
        .await;
        node.handle_message(
            from.clone(),
            Message::LockRequest {
                lock_id: LockId::new("l"),
                thread: ThreadId(1),
                level: LockLevel::Read,
            },
        )
        .await;
        assert_eq!(node.lock_manager().lock_count(), 1);

        node.handle_message(from, Message::Goodbye).await;
        assert_eq!(node.lock_manager().lock_count(), 0);
        assert!(node.store().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_without_handoff_is_rejected() {
        let (node, _st, _ct) = server();
        assert!(node.on_handshake(&NodeId::new("c1"), 1, Vec::new()).is_err());
        assert!(!node.is_handing_off());
    }
}
