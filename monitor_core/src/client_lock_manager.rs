// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Client lock manager: the application's entry point for locking.
//!
//! Application threads call [`ClientLockManager::acquire`] and friends and may
//! block. The client node's network loop feeds server messages in through
//! [`ClientLockManager::handle_message`], which never blocks on application
//! threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::client_lock::ClientLock;
use crate::config::ClientLockConfig;
use crate::error::{MonitorError, Result};
use crate::ids::{LockId, NodeId, ThreadId};
use crate::lock_level::{LevelSet, LockLevel};
use crate::messages::{LockReport, Message};
use crate::remote::RemoteLockManager;

pub struct ClientLockManager {
    node: NodeId,
    config: ClientLockConfig,
    remote: RemoteLockManager,
    locks: DashMap<LockId, Arc<ClientLock>>,
    /// Paused flag; held for reading while a lock entry is created so a
    /// concurrent pause cannot miss it.
    paused: RwLock<bool>,
    disconnected: AtomicBool,
}

impl ClientLockManager {
    pub fn new(node: NodeId, config: ClientLockConfig, remote: RemoteLockManager) -> Self {
        Self {
            node,
            config,
            remote,
            locks: DashMap::new(),
            paused: RwLock::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    pub fn config(&self) -> &ClientLockConfig {
        &self.config
    }

    pub fn remote(&self) -> &RemoteLockManager {
        &self.remote
    }

    fn check_thread(thread: ThreadId) -> Result<()> {
        if thread.is_vm() {
            return Err(MonitorError::IllegalMonitorState(
                "thread id 0 is reserved for node-wide grants".to_string(),
            ));
        }
        Ok(())
    }

    fn lock_for(&self, lock_id: &LockId) -> Result<Arc<ClientLock>> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(MonitorError::Disconnected(format!(
                "{}: client is no longer connected",
                self.node
            )));
        }
        let paused = self.paused.read();
        let entry = self
            .locks
            .entry(lock_id.clone())
            .or_insert_with(|| Arc::new(ClientLock::new(lock_id.clone(), *paused)));
        Ok(Arc::clone(entry.value()))
    }

    fn existing(&self, lock_id: &LockId) -> Option<Arc<ClientLock>> {
        self.locks.get(lock_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Block until `thread` holds `lock_id` at `level`.
    pub fn acquire(&self, lock_id: &LockId, thread: ThreadId, level: LockLevel) -> Result<()> {
        Self::check_thread(thread)?;
        let lock = self.lock_for(lock_id)?;
        lock.acquire(thread, level, None, &self.remote, self.config.request_timeout())?;
        Ok(())
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`. A zero
    /// timeout never blocks. Returns whether the lock was taken.
    pub fn try_acquire(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        level: LockLevel,
        timeout: Duration,
    ) -> Result<bool> {
        Self::check_thread(thread)?;
        let lock = self.lock_for(lock_id)?;
        lock.acquire(thread, level, Some(timeout), &self.remote, self.config.request_timeout())
    }

    /// Undo the most recent acquisition by `thread`.
    pub fn release(&self, lock_id: &LockId, thread: ThreadId) -> Result<()> {
        let Some(lock) = self.existing(lock_id) else {
            return Err(MonitorError::IllegalMonitorState(format!(
                "{thread} does not hold {lock_id}"
            )));
        };
        lock.release(thread, &self.remote)
    }

    /// Wait on the monitor of `lock_id`. The caller must hold it at WRITE.
    /// `None` waits until notified or interrupted.
    pub fn wait(&self, lock_id: &LockId, thread: ThreadId, timeout: Option<Duration>) -> Result<()> {
        Self::check_thread(thread)?;
        let Some(lock) = self.existing(lock_id) else {
            return Err(MonitorError::IllegalMonitorState(format!(
                "{thread} must hold WRITE on {lock_id} to wait"
            )));
        };
        lock.wait(thread, timeout, &self.remote, self.config.request_timeout())
    }

    pub fn notify(&self, lock_id: &LockId, thread: ThreadId, all: bool) -> Result<()> {
        let Some(lock) = self.existing(lock_id) else {
            return Err(MonitorError::IllegalMonitorState(format!(
                "{thread} must hold WRITE on {lock_id} to notify"
            )));
        };
        let woken = lock.notify(thread, all, &self.remote)?;
        if woken > 0 {
            debug!(lock_id = %lock_id, woken, "Notified local waiters");
        }
        Ok(())
    }

    /// Wake `thread` out of a wait on `lock_id`; its wait returns
    /// [`MonitorError::Interrupted`] once it has the lock back.
    pub fn interrupt(&self, lock_id: &LockId, thread: ThreadId) -> bool {
        self.existing(lock_id)
            .is_some_and(|lock| lock.interrupt(thread, &self.remote))
    }

    /// Total acquisitions `thread` currently has on `lock_id`.
    pub fn hold_count(&self, lock_id: &LockId, thread: ThreadId) -> usize {
        self.existing(lock_id).map_or(0, |lock| lock.hold_count(thread))
    }

    pub fn is_held_by(&self, lock_id: &LockId, thread: ThreadId, level: LockLevel) -> bool {
        self.existing(lock_id)
            .is_some_and(|lock| lock.is_held_by(thread, level))
    }

    /// The node-wide grant held for `lock_id`, if any.
    pub fn greedy_level(&self, lock_id: &LockId) -> Option<LevelSet> {
        self.existing(lock_id).and_then(|lock| lock.greedy_level())
    }

    pub fn waiter_count(&self, lock_id: &LockId) -> usize {
        self.existing(lock_id).map_or(0, |lock| lock.waiter_count())
    }

    pub fn pending_count(&self, lock_id: &LockId) -> usize {
        self.existing(lock_id).map_or(0, |lock| lock.pending_count())
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Apply a lock message from the server. Other messages are ignored.
    pub fn handle_message(&self, msg: Message) {
        match msg {
            Message::LockAward {
                lock_id,
                thread,
                level,
                greedy,
            } => match self.lock_for(&lock_id) {
                Ok(lock) => lock.on_award(thread, level, greedy, &self.remote),
                Err(e) => debug!(lock_id = %lock_id, error = %e, "Award ignored"),
            },
            Message::LockRefused { lock_id, thread, .. } => {
                if let Some(lock) = self.existing(&lock_id) {
                    lock.on_refused(thread);
                }
            },
            Message::LockRecall { lock_id } => match self.existing(&lock_id) {
                Some(lock) => lock.on_recall(&self.remote),
                None => debug!(lock_id = %lock_id, "Recall for unknown lock"),
            },
            Message::Notified { lock_id, thread } | Message::WaitTimeout { lock_id, thread } => {
                if let Some(lock) = self.existing(&lock_id) {
                    lock.on_wait_done(thread);
                }
            },
            other => warn!(msg_type = other.type_name(), "Not a lock message"),
        }
    }

    /// Stop sending to the server; messages are held back per lock.
    pub fn pause(&self) {
        *self.paused.write() = true;
        for entry in &self.locks {
            entry.value().pause();
        }
        info!(node = %self.node, locks = self.locks.len(), "Lock traffic paused");
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.read()
    }

    /// Everything this node holds, waits on and has pending, for a new server.
    pub fn handshake(&self) -> Vec<LockReport> {
        let mut reports: Vec<LockReport> = self
            .locks
            .iter()
            .filter_map(|entry| entry.value().handshake())
            .collect();
        reports.sort_by(|a, b| a.lock_id.cmp(&b.lock_id));
        debug!(node = %self.node, reports = reports.len(), "Built handshake");
        reports
    }

    /// Resume sending and flush whatever was held back since the handshake.
    pub fn unpause(&self) {
        *self.paused.write() = false;
        for entry in &self.locks {
            entry.value().unpause(&self.remote);
        }
        info!(node = %self.node, "Lock traffic resumed");
    }

    /// The server evicted this node: drop every hold and fail parked threads.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
        for entry in &self.locks {
            entry.value().disconnect();
        }
        self.locks.clear();
        warn!(node = %self.node, "Disconnected, all locks dropped");
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Hand back greedy grants idle longer than the configured window and
    /// forget locks with no state left. Returns the number of grants released.
    pub fn run_lock_gc(&self, now: Instant) -> usize {
        let idle = self.config.greedy_idle();
        let mut released = 0;
        for entry in &self.locks {
            if entry.value().release_if_idle(now, idle, &self.remote) {
                released += 1;
            }
        }
        // Only the map holds a reference, so no thread is about to use the entry.
        self.locks
            .retain(|_, lock| Arc::strong_count(lock) > 1 || !lock.is_unused());
        if released > 0 {
            debug!(node = %self.node, released, remaining = self.locks.len(), "Lock GC released greedy grants");
        }
        released
    }
}
