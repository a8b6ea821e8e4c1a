// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! The primary server's global lock arbiter.
//!
//! One mutex serializes the whole lock table. Requests that cannot be granted
//! are queued and the caller returns at once; awards, refusals, recalls and
//! timeouts go out through the [`ResponseSink`] after the mutex is dropped.
//!
//! Lifecycle:
//!
//! ```text
//! Starting ──start()──► Started ──stop()──► Stopping ──► Stopped
//!    │
//!    └─ only re-establishment is applied; lock and interrupt requests are
//!       queued and replayed by start()
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{LockManagerConfig, LockPolicy};
use crate::deadlock::WaitForGraph;
use crate::error::{MonitorError, Result};
use crate::ids::{LockId, NodeId, ThreadContext};
use crate::lock_level::{LevelSet, LockLevel};
use crate::messages::{LockReport, TimerSpec};
use crate::metrics::LockStats;
use crate::server_lock::{Effects, LockInfo, Outbox, ServerLock};
use crate::sink::ResponseSink;
use crate::sync_compat::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl ManagerState {
    pub fn name(self) -> &'static str {
        match self {
            ManagerState::Starting => "STARTING",
            ManagerState::Started => "STARTED",
            ManagerState::Stopping => "STOPPING",
            ManagerState::Stopped => "STOPPED",
        }
    }

    fn error(self, operation: &'static str) -> MonitorError {
        MonitorError::LockManagerState {
            state: self.name(),
            operation,
        }
    }
}

/// Requests held back until the manager starts.
#[derive(Debug)]
enum QueuedRequest {
    Lock {
        lock_id: LockId,
        ctx: ThreadContext,
        level: LockLevel,
        try_timeout: Option<Duration>,
    },
    Interrupt {
        lock_id: LockId,
        ctx: ThreadContext,
    },
}

impl QueuedRequest {
    fn node(&self) -> &NodeId {
        match self {
            QueuedRequest::Lock { ctx, .. } | QueuedRequest::Interrupt { ctx, .. } => &ctx.node,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: ManagerState,
    policy: LockPolicy,
    locks: HashMap<LockId, ServerLock>,
    queued: Vec<QueuedRequest>,
}

impl Inner {
    fn require_started(&self, operation: &'static str) -> Result<()> {
        match self.state {
            ManagerState::Started => Ok(()),
            other => Err(other.error(operation)),
        }
    }

    fn lock_mut(&mut self, lock_id: &LockId) -> &mut ServerLock {
        self.locks
            .entry(lock_id.clone())
            .or_insert_with(|| ServerLock::new(lock_id.clone()))
    }

    /// Drop the entry once nothing refers to the lock any more.
    fn release_if_clear(&mut self, lock_id: &LockId) {
        if self.locks.get(lock_id).is_some_and(ServerLock::is_clear) {
            self.locks.remove(lock_id);
        }
    }

    fn not_held(lock_id: &LockId, ctx: &ThreadContext) -> MonitorError {
        MonitorError::IllegalMonitorState(format!("{ctx} does not hold {lock_id}"))
    }
}

pub struct ServerLockManager {
    inner: Mutex<Inner>,
    config: LockManagerConfig,
    stats: LockStats,
    sink: Arc<dyn ResponseSink>,
}

impl ServerLockManager {
    /// A manager in the `Starting` state, ready for re-establishment.
    pub fn new(config: LockManagerConfig, sink: Arc<dyn ResponseSink>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ManagerState::Starting,
                policy: LockPolicy::Altruistic,
                locks: HashMap::new(),
                queued: Vec::new(),
            }),
            config,
            stats: LockStats::new(),
            sink,
        }
    }

    /// A manager that is already started.
    pub fn started(config: LockManagerConfig, sink: Arc<dyn ResponseSink>) -> Self {
        let manager = Self::new(config, sink);
        manager.start();
        manager
    }

    fn run_at<R>(
        &self,
        now: Instant,
        f: impl FnOnce(&mut Inner, &mut Effects<'_>) -> Result<R>,
    ) -> Result<R> {
        let mut out: Outbox = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            let mut fx = Effects {
                policy: inner.policy,
                now,
                out: &mut out,
                stats: &self.stats,
            };
            f(&mut *inner, &mut fx)
        };
        for (to, msg) in out {
            self.sink.deliver(&to, msg);
        }
        result
    }

    fn run<R>(&self, f: impl FnOnce(&mut Inner, &mut Effects<'_>) -> Result<R>) -> Result<R> {
        self.run_at(Instant::now(), f)
    }

    pub fn state(&self) -> ManagerState {
        self.inner.lock().state
    }

    pub fn policy(&self) -> LockPolicy {
        self.inner.lock().policy
    }

    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    /// Start granting: applies the configured policy, starts the timers of
    /// re-established waiters and replays requests queued while starting.
    pub fn start(&self) {
        let result = self.run(|inner, fx| {
            if inner.state != ManagerState::Starting {
                return Err(inner.state.error("start"));
            }
            inner.state = ManagerState::Started;
            inner.policy = self.config.lock_policy;
            fx.policy = inner.policy;
            for lock in inner.locks.values_mut() {
                lock.start_timers(fx.now);
            }
            let queued = std::mem::take(&mut inner.queued);
            let replayed = queued.len();
            for request in queued {
                match request {
                    QueuedRequest::Lock {
                        lock_id,
                        ctx,
                        level,
                        try_timeout,
                    } => {
                        inner.lock_mut(&lock_id).request(ctx, level, try_timeout, fx);
                        inner.release_if_clear(&lock_id);
                    },
                    QueuedRequest::Interrupt { lock_id, ctx } => {
                        if let Some(lock) = inner.locks.get_mut(&lock_id) {
                            lock.interrupt(&ctx, fx);
                        }
                    },
                }
            }
            info!(locks = inner.locks.len(), replayed, policy = ?inner.policy, "Lock manager started");
            Ok(())
        });
        if let Err(e) = result {
            debug!(error = %e, "Start ignored");
        }
    }

    /// Drop all lock state. Further operations fail.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.state = ManagerState::Stopping;
        inner.locks.clear();
        inner.queued.clear();
        inner.state = ManagerState::Stopped;
        info!("Lock manager stopped");
    }

    fn enqueue_or_request(
        &self,
        lock_id: &LockId,
        ctx: ThreadContext,
        level: LockLevel,
        try_timeout: Option<Duration>,
    ) -> Result<()> {
        let warn_depth = self.config.pending_warn_depth;
        self.run(|inner, fx| match inner.state {
            ManagerState::Starting => {
                debug!(lock_id = %lock_id, ctx = %ctx, "Request queued until start");
                inner.queued.push(QueuedRequest::Lock {
                    lock_id: lock_id.clone(),
                    ctx,
                    level,
                    try_timeout,
                });
                Ok(())
            },
            ManagerState::Started => {
                let lock = inner.lock_mut(lock_id);
                lock.request(ctx, level, try_timeout, fx);
                let depth = lock.pending_len();
                if warn_depth > 0 && depth >= warn_depth && depth % warn_depth == 0 {
                    warn!(lock_id = %lock_id, depth, "Pending queue is deep");
                }
                inner.release_if_clear(lock_id);
                Ok(())
            },
            other => Err(other.error("lock")),
        })
    }

    /// Queue a lock request; the award is delivered asynchronously.
    pub fn request_lock(&self, lock_id: &LockId, ctx: ThreadContext, level: LockLevel) -> Result<()> {
        self.enqueue_or_request(lock_id, ctx, level, None)
    }

    /// Like [`Self::request_lock`] but refused if not granted within `timeout`.
    /// A zero timeout refuses at once instead of queueing.
    pub fn try_request_lock(
        &self,
        lock_id: &LockId,
        ctx: ThreadContext,
        level: LockLevel,
        timeout: Duration,
    ) -> Result<()> {
        self.enqueue_or_request(lock_id, ctx, level, Some(timeout))
    }

    pub fn unlock(&self, lock_id: &LockId, ctx: &ThreadContext) -> Result<()> {
        self.run(|inner, fx| {
            inner.require_started("unlock")?;
            let lock = inner
                .locks
                .get_mut(lock_id)
                .ok_or_else(|| Inner::not_held(lock_id, ctx))?;
            let result = lock.unlock(ctx, fx);
            inner.release_if_clear(lock_id);
            result
        })
    }

    /// Release the caller's exclusive hold and park it as a waiter.
    pub fn wait(&self, lock_id: &LockId, ctx: &ThreadContext, timer: TimerSpec) -> Result<()> {
        self.run(|inner, fx| {
            inner.require_started("wait")?;
            let lock = inner
                .locks
                .get_mut(lock_id)
                .ok_or_else(|| Inner::not_held(lock_id, ctx))?;
            lock.wait(ctx, timer, fx)
        })
    }

    /// Returns the woken contexts.
    pub fn notify(&self, lock_id: &LockId, ctx: &ThreadContext, all: bool) -> Result<Vec<ThreadContext>> {
        self.run(|inner, fx| {
            inner.require_started("notify")?;
            let lock = inner
                .locks
                .get_mut(lock_id)
                .ok_or_else(|| Inner::not_held(lock_id, ctx))?;
            lock.notify(ctx, all, fx)
        })
    }

    pub fn interrupt(&self, lock_id: &LockId, ctx: ThreadContext) -> Result<()> {
        self.run(|inner, fx| match inner.state {
            ManagerState::Starting => {
                inner.queued.push(QueuedRequest::Interrupt {
                    lock_id: lock_id.clone(),
                    ctx,
                });
                Ok(())
            },
            ManagerState::Started => {
                if let Some(lock) = inner.locks.get_mut(lock_id) {
                    lock.interrupt(&ctx, fx);
                }
                Ok(())
            },
            other => Err(other.error("interrupt")),
        })
    }

    /// Apply a node's answer to a recall (or its voluntary release of a greedy grant).
    pub fn recall_commit(&self, node: &NodeId, report: LockReport) -> Result<()> {
        self.run(|inner, fx| {
            inner.require_started("recall commit")?;
            let lock_id = report.lock_id.clone();
            let Some(lock) = inner.locks.get_mut(&lock_id) else {
                warn!(lock_id = %lock_id, node = %node, "Recall commit for unknown lock");
                return Ok(());
            };
            let result = lock.recall_commit(node, report, fx);
            inner.release_if_clear(&lock_id);
            result
        })
    }

    /// Release everything a departed node held, waited on or requested.
    pub fn clear_all_for_node(&self, node: &NodeId) {
        let result = self.run(|inner, fx| {
            inner.queued.retain(|q| q.node() != node);
            let ids: Vec<LockId> = inner.locks.keys().cloned().collect();
            for id in &ids {
                if let Some(lock) = inner.locks.get_mut(id) {
                    lock.clear_node(node, fx);
                }
                inner.release_if_clear(id);
            }
            Ok(())
        });
        if result.is_ok() {
            info!(node = %node, "Cleared lock state for node");
        }
    }

    /// Rebuild a hold reported by a reconnecting client. Only while starting.
    pub fn reestablish_lock(&self, lock_id: &LockId, ctx: ThreadContext, levels: LevelSet) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != ManagerState::Starting {
            return Err(inner.state.error("reestablish lock"));
        }
        let lock = inner.lock_mut(lock_id);
        let result = lock.reestablish_hold(ctx, levels);
        inner.release_if_clear(lock_id);
        result
    }

    /// Rebuild a parked wait. Its timer starts when the manager starts.
    pub fn reestablish_wait(&self, lock_id: &LockId, ctx: ThreadContext, timer: TimerSpec) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != ManagerState::Starting {
            return Err(inner.state.error("reestablish wait"));
        }
        inner.lock_mut(lock_id).reestablish_wait(ctx, timer);
        Ok(())
    }

    /// Switching to `Altruistic` recalls every outstanding greedy grant.
    pub fn set_lock_policy(&self, policy: LockPolicy) {
        let _ = self.run(|inner, fx| {
            inner.policy = policy;
            fx.policy = policy;
            if policy == LockPolicy::Altruistic && inner.state == ManagerState::Started {
                for lock in inner.locks.values_mut() {
                    lock.recall_greedy(fx);
                }
            }
            Ok(())
        });
        info!(policy = ?policy, "Lock policy changed");
    }

    /// Fire every wait and try-lock timer that expired by `now`.
    pub fn expire_timers(&self, now: Instant) {
        let _ = self.run_at(now, |inner, fx| {
            if inner.state != ManagerState::Started {
                return Ok(());
            }
            let timed: Vec<LockId> = inner
                .locks
                .iter()
                .filter(|(_, l)| l.has_timers())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &timed {
                if let Some(lock) = inner.locks.get_mut(id) {
                    lock.expire_timers(fx);
                }
                inner.release_if_clear(id);
            }
            Ok(())
        });
    }

    /// Cycles in the current wait-for graph. Reporting only.
    pub fn scan_for_deadlocks(&self) -> Vec<Vec<ThreadContext>> {
        let graph = {
            let inner = self.inner.lock();
            let mut graph = WaitForGraph::new();
            for lock in inner.locks.values() {
                lock.add_wait_edges(&mut graph);
            }
            graph
        };
        let cycles = graph.detect_cycles();
        for cycle in &cycles {
            let members: Vec<String> = cycle.iter().map(ToString::to_string).collect();
            warn!(cycle = %members.join(" -> "), "Distributed deadlock detected");
        }
        cycles
    }

    pub fn query_lock(&self, lock_id: &LockId) -> Option<LockInfo> {
        self.inner.lock().locks.get(lock_id).map(ServerLock::info)
    }

    pub fn lock_count(&self) -> usize {
        self.inner.lock().locks.len()
    }

    pub fn has_pending(&self, lock_id: &LockId) -> bool {
        self.inner
            .lock()
            .locks
            .get(lock_id)
            .is_some_and(ServerLock::has_pending)
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }
}

impl std::fmt::Debug for ServerLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLockManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
