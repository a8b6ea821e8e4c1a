// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Per-lock client state.
//!
//! A [`ClientLock`] arbitrates between the threads of one node. While the node
//! holds a greedy grant, requests, waits and notifies resolve locally without a
//! round trip. Otherwise they go through the [`RemoteLockManager`] and the
//! calling thread parks on the lock's condvar until the server answers.
//!
//! Messages are pushed while the lock's mutex is held, so the server sees one
//! lock's traffic in the order the threads produced it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{MonitorError, Result};
use crate::ids::{LockId, ThreadId};
use crate::lock_level::{LevelSet, LockLevel};
use crate::messages::{HeldContext, LockReport, Message, PendingContext, TimerSpec, WaitContext};
use crate::remote::RemoteLockManager;

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Server components implied by an acquisition order. A READ taken under a
/// WRITE adds nothing; a WRITE taken under a READ is an upgrade.
fn implied_server_levels(stack: &[LockLevel]) -> LevelSet {
    let mut set = LevelSet::EMPTY;
    for level in stack {
        match level {
            LockLevel::Write => set.add(LockLevel::Write),
            LockLevel::Read if !set.is_write() => set.add(LockLevel::Read),
            _ => {},
        }
    }
    set
}

#[derive(Debug, Default)]
struct Hold {
    /// Acquisitions in order; released last-in first-out.
    stack: Vec<LockLevel>,
    /// Components granted to this thread individually by the server.
    server: LevelSet,
}

impl Hold {
    fn holds_any(&self) -> bool {
        self.stack.iter().any(|l| !l.is_concurrent())
    }

    fn holds_write(&self) -> bool {
        self.stack.contains(&LockLevel::Write)
    }

    /// Whether `level` can be taken reentrantly without asking anyone.
    fn covers(&self, level: LockLevel) -> bool {
        match level {
            LockLevel::Read => self.holds_any(),
            LockLevel::Write => self.holds_write(),
            LockLevel::Concurrent => true,
        }
    }
}

#[derive(Debug)]
enum RequestKind {
    Lock,
    TryLock { deadline: Instant },
    /// Re-entry after a wait; the saved acquisitions come back on grant.
    Reacquire { restore: Vec<LockLevel> },
}

#[derive(Debug)]
struct LocalRequest {
    thread: ThreadId,
    level: LockLevel,
    kind: RequestKind,
}

impl LocalRequest {
    fn try_remaining_ms(&self, now: Instant) -> Option<u64> {
        match self.kind {
            RequestKind::TryLock { deadline } => Some(millis(deadline.saturating_duration_since(now))),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct LocalWait {
    thread: ThreadId,
    deadline: Option<Instant>,
    /// The server owns this wait and its timer.
    on_server: bool,
    restore: Vec<LockLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Granted,
    Refused,
}

#[derive(Debug)]
struct LockState {
    holds: HashMap<ThreadId, Hold>,
    pending: VecDeque<LocalRequest>,
    waiters: VecDeque<LocalWait>,
    /// Server answers not yet picked up by the parked thread.
    outcomes: HashMap<ThreadId, Outcome>,
    interrupted: HashSet<ThreadId>,
    /// Node-wide grant, if any.
    greedy: Option<LevelSet>,
    paused: bool,
    held_back: Vec<Message>,
    disconnected: bool,
    last_used: Instant,
}

impl LockState {
    fn new(paused: bool) -> Self {
        Self {
            holds: HashMap::new(),
            pending: VecDeque::new(),
            waiters: VecDeque::new(),
            outcomes: HashMap::new(),
            interrupted: HashSet::new(),
            greedy: None,
            paused,
            held_back: Vec::new(),
            disconnected: false,
            last_used: Instant::now(),
        }
    }

    fn check_connected(&self, lock_id: &LockId) -> Result<()> {
        if self.disconnected {
            return Err(MonitorError::Disconnected(format!(
                "{lock_id}: client is no longer connected"
            )));
        }
        Ok(())
    }

    fn send(&mut self, remote: &RemoteLockManager, msg: Message) {
        if self.paused {
            self.held_back.push(msg);
        } else {
            remote.send(msg);
        }
    }

    fn is_quiet(&self) -> bool {
        self.holds.is_empty() && self.pending.is_empty() && self.waiters.is_empty()
    }

    fn pending_position(&self, thread: ThreadId) -> Option<usize> {
        self.pending.iter().position(|r| r.thread == thread)
    }

    /// Whether the greedy grant lets `thread` take `level` now. `ahead` is the
    /// number of queued requests in front of it.
    fn can_grant_locally(&self, thread: ThreadId, level: LockLevel, ahead: usize) -> bool {
        let Some(greedy) = self.greedy else {
            return false;
        };
        if !(greedy.is_write() || greedy.contains(level)) {
            return false;
        }
        let conflict = self.holds.iter().any(|(t, h)| {
            *t != thread && ((level.is_write() && h.holds_any()) || (level.is_read() && h.holds_write()))
        });
        if conflict {
            return false;
        }
        let upgrade = level.is_write() && self.holds.get(&thread).is_some_and(Hold::holds_any);
        upgrade
            || self
                .pending
                .iter()
                .take(ahead)
                .all(|r| r.level.is_read() && level.is_read())
    }

    fn grant(&mut self, req: LocalRequest, server_level: Option<LockLevel>) {
        let hold = self.holds.entry(req.thread).or_default();
        match req.kind {
            RequestKind::Reacquire { restore } => hold.stack.extend(restore),
            _ => hold.stack.push(req.level),
        }
        if let Some(level) = server_level {
            if level.is_write() || !hold.server.is_write() {
                hold.server.add(level);
            }
        }
        self.last_used = Instant::now();
    }

    fn wake_waiter(&mut self, pos: usize) -> Option<ThreadId> {
        let wait = self.waiters.remove(pos)?;
        self.pending.push_back(LocalRequest {
            thread: wait.thread,
            level: LockLevel::Write,
            kind: RequestKind::Reacquire {
                restore: wait.restore,
            },
        });
        Some(wait.thread)
    }

    /// Describe local state to the server. On a recall every hold takes the
    /// levels its acquisitions imply and every wait moves to the server.
    fn report(&mut self, lock_id: &LockId, now: Instant, recall: bool) -> LockReport {
        let mut report = LockReport::new(lock_id.clone());
        for (thread, hold) in &mut self.holds {
            if recall {
                hold.server = implied_server_levels(&hold.stack);
            }
            if !hold.server.is_empty() {
                report.held.push(HeldContext {
                    thread: *thread,
                    levels: hold.server,
                });
            }
        }
        report.held.sort_by_key(|h| h.thread);
        for wait in &mut self.waiters {
            wait.on_server = true;
            report.waiting.push(WaitContext {
                thread: wait.thread,
                timer: TimerSpec::remaining(wait.deadline, now),
            });
        }
        report.pending = self
            .pending
            .iter()
            .map(|r| PendingContext {
                thread: r.thread,
                level: r.level,
                try_timeout_ms: r.try_remaining_ms(now),
            })
            .collect();
        report
    }

    /// Hand the greedy grant back, reporting everything the node holds,
    /// waits on and still wants.
    fn commit_recall(&mut self, lock_id: &LockId, remote: &RemoteLockManager, now: Instant) {
        if self.greedy.take().is_none() {
            return;
        }
        let report = self.report(lock_id, now, true);
        debug!(
            lock_id = %lock_id,
            held = report.held.len(),
            waiting = report.waiting.len(),
            pending = report.pending.len(),
            "Committing recall"
        );
        self.send(remote, Message::RecallCommit(report));
    }
}

pub(crate) struct ClientLock {
    lock_id: LockId,
    state: Mutex<LockState>,
    cond: Condvar,
}

impl ClientLock {
    pub(crate) fn new(lock_id: LockId, paused: bool) -> Self {
        Self {
            lock_id,
            state: Mutex::new(LockState::new(paused)),
            cond: Condvar::new(),
        }
    }

    /// Returns `false` only for a try request that was refused or timed out.
    pub(crate) fn acquire(
        &self,
        thread: ThreadId,
        level: LockLevel,
        try_timeout: Option<Duration>,
        remote: &RemoteLockManager,
        request_timeout: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.check_connected(&self.lock_id)?;
        state.last_used = now;

        if level.is_concurrent() {
            state.holds.entry(thread).or_default().stack.push(level);
            return Ok(true);
        }
        if let Some(hold) = state.holds.get_mut(&thread) {
            if hold.covers(level) {
                hold.stack.push(level);
                return Ok(true);
            }
        }

        let queued = state.pending.len();
        if state.can_grant_locally(thread, level, queued) {
            state.grant(
                LocalRequest {
                    thread,
                    level,
                    kind: RequestKind::Lock,
                },
                None,
            );
            return Ok(true);
        }
        let greedy_covers = state
            .greedy
            .is_some_and(|g| g.is_write() || g.contains(level));
        if greedy_covers && try_timeout == Some(Duration::ZERO) {
            return Ok(false);
        }

        let kind = match try_timeout {
            Some(timeout) => RequestKind::TryLock {
                deadline: now + timeout,
            },
            None => RequestKind::Lock,
        };
        state.pending.push_back(LocalRequest {
            thread,
            level,
            kind,
        });
        if state.greedy.is_none() {
            let lock_id = self.lock_id.clone();
            let msg = match try_timeout {
                Some(timeout) => Message::TryLockRequest {
                    lock_id,
                    thread,
                    level,
                    timeout_ms: millis(timeout),
                },
                None => Message::LockRequest {
                    lock_id,
                    thread,
                    level,
                },
            };
            state.send(remote, msg);
        }
        self.await_grant(&mut state, thread, remote, request_timeout)
    }

    /// Park until `thread`'s queued request is granted or refused.
    fn await_grant(
        &self,
        state: &mut MutexGuard<'_, LockState>,
        thread: ThreadId,
        remote: &RemoteLockManager,
        request_timeout: Duration,
    ) -> Result<bool> {
        loop {
            if state.disconnected {
                state.pending.retain(|r| r.thread != thread);
                state.check_connected(&self.lock_id)?;
            }
            if let Some(outcome) = state.outcomes.remove(&thread) {
                return Ok(outcome == Outcome::Granted);
            }
            let Some(idx) = state.pending_position(thread) else {
                return Err(MonitorError::IllegalMonitorState(format!(
                    "{thread} has no request outstanding on {}",
                    self.lock_id
                )));
            };

            let level = state.pending[idx].level;
            if state.can_grant_locally(thread, level, idx) {
                if let Some(req) = state.pending.remove(idx) {
                    state.grant(req, None);
                }
                self.cond.notify_all();
                return Ok(true);
            }
            // A READ grant cannot cover a WRITE; hand it back with this request attached.
            if level.is_write() && state.greedy.is_some_and(|g| !g.is_write()) {
                state.commit_recall(&self.lock_id, remote, Instant::now());
                continue;
            }

            // Under a greedy grant the try deadline is enforced here; otherwise
            // the server refuses on time and the extra slack covers a lost answer.
            let wake = match state.pending[idx].kind {
                RequestKind::TryLock { deadline } if state.greedy.is_some() => Some(deadline),
                RequestKind::TryLock { deadline } => Some(deadline + request_timeout),
                _ => None,
            };
            match wake {
                Some(at) if Instant::now() >= at => {
                    state.pending.remove(idx);
                    debug!(lock_id = %self.lock_id, %thread, "Try lock gave up");
                    self.cond.notify_all();
                    return Ok(false);
                },
                Some(at) => {
                    self.cond.wait_until(state, at);
                },
                None => self.cond.wait(state),
            }
        }
    }

    pub(crate) fn release(&self, thread: ThreadId, remote: &RemoteLockManager) -> Result<()> {
        let mut state = self.state.lock();
        let Some(hold) = state.holds.get_mut(&thread) else {
            return Err(MonitorError::IllegalMonitorState(format!(
                "{thread} does not hold {}",
                self.lock_id
            )));
        };
        let Some(level) = hold.stack.pop() else {
            return Err(MonitorError::IllegalMonitorState(format!(
                "{thread} does not hold {}",
                self.lock_id
            )));
        };

        let mut unlock = false;
        if !level.is_concurrent() && !hold.server.is_empty() {
            if !hold.holds_any() {
                hold.server = LevelSet::EMPTY;
                unlock = true;
            } else if level.is_write() && !hold.holds_write() && hold.server.is_upgrade() {
                hold.server.remove(LockLevel::Write);
                unlock = true;
            }
        }
        if hold.stack.is_empty() {
            state.holds.remove(&thread);
        }
        if unlock {
            let msg = Message::Unlock {
                lock_id: self.lock_id.clone(),
                thread,
            };
            state.send(remote, msg);
        }
        state.last_used = Instant::now();
        self.cond.notify_all();
        Ok(())
    }

    /// Give up the lock, park until notified, interrupted or timed out, then
    /// take back every acquisition held before the wait.
    pub(crate) fn wait(
        &self,
        thread: ThreadId,
        timeout: Option<Duration>,
        remote: &RemoteLockManager,
        request_timeout: Duration,
    ) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.check_connected(&self.lock_id)?;
        let hold = match state.holds.remove(&thread) {
            Some(hold) if hold.holds_write() => hold,
            other => {
                if let Some(hold) = other {
                    state.holds.insert(thread, hold);
                }
                return Err(MonitorError::IllegalMonitorState(format!(
                    "{thread} must hold WRITE on {} to wait",
                    self.lock_id
                )));
            },
        };

        let timer = TimerSpec::from_duration(timeout);
        let local = state.greedy.is_some_and(|g| g.is_write());
        state.waiters.push_back(LocalWait {
            thread,
            deadline: timer.deadline_from(now),
            on_server: !local,
            restore: hold.stack,
        });
        if !local {
            let msg = Message::WaitRequest {
                lock_id: self.lock_id.clone(),
                thread,
                timer,
            };
            state.send(remote, msg);
        }
        self.cond.notify_all();

        loop {
            if state.disconnected {
                state.waiters.retain(|w| w.thread != thread);
                state.check_connected(&self.lock_id)?;
            }
            let Some(pos) = state.waiters.iter().position(|w| w.thread == thread) else {
                break;
            };
            match (state.waiters[pos].on_server, state.waiters[pos].deadline) {
                (false, Some(at)) if Instant::now() >= at => {
                    state.wake_waiter(pos);
                    break;
                },
                (false, Some(at)) => {
                    self.cond.wait_until(&mut state, at);
                },
                _ => self.cond.wait(&mut state),
            }
        }

        self.await_grant(&mut state, thread, remote, request_timeout)?;
        if state.interrupted.remove(&thread) {
            return Err(MonitorError::Interrupted(self.lock_id.to_string()));
        }
        Ok(())
    }

    /// Returns how many local waiters were woken without the server.
    pub(crate) fn notify(&self, thread: ThreadId, all: bool, remote: &RemoteLockManager) -> Result<usize> {
        let mut state = self.state.lock();
        state.check_connected(&self.lock_id)?;
        if !state.holds.get(&thread).is_some_and(Hold::holds_write) {
            return Err(MonitorError::IllegalMonitorState(format!(
                "{thread} must hold WRITE on {} to notify",
                self.lock_id
            )));
        }

        if !state.greedy.is_some_and(|g| g.is_write()) {
            let msg = Message::Notify {
                lock_id: self.lock_id.clone(),
                thread,
                all,
            };
            state.send(remote, msg);
            return Ok(0);
        }

        let mut woken = 0;
        while let Some(pos) = state.waiters.iter().position(|w| !w.on_server) {
            state.wake_waiter(pos);
            woken += 1;
            if !all {
                break;
            }
        }
        if woken > 0 {
            self.cond.notify_all();
        }
        Ok(woken)
    }

    /// Returns whether `thread` was waiting.
    pub(crate) fn interrupt(&self, thread: ThreadId, remote: &RemoteLockManager) -> bool {
        let mut state = self.state.lock();
        let Some(pos) = state.waiters.iter().position(|w| w.thread == thread) else {
            return false;
        };
        let on_server = state.waiters[pos].on_server;
        state.wake_waiter(pos);
        state.interrupted.insert(thread);
        if on_server {
            let msg = Message::Interrupt {
                lock_id: self.lock_id.clone(),
                thread,
            };
            state.send(remote, msg);
        }
        self.cond.notify_all();
        true
    }

    pub(crate) fn on_award(
        &self,
        thread: ThreadId,
        level: LockLevel,
        greedy: bool,
        remote: &RemoteLockManager,
    ) {
        let mut state = self.state.lock();
        if state.disconnected {
            return;
        }
        if greedy {
            // The server dropped this node's per-thread holds when granting.
            state.greedy = Some(LevelSet::of(level));
            for hold in state.holds.values_mut() {
                hold.server = LevelSet::EMPTY;
            }
            state.last_used = Instant::now();
            debug!(lock_id = %self.lock_id, %level, "Greedy grant received");
            self.cond.notify_all();
            return;
        }
        if level.is_concurrent() {
            return;
        }

        if let Some(idx) = state.pending_position(thread) {
            if let Some(req) = state.pending.remove(idx) {
                state.grant(req, Some(level));
                state.outcomes.insert(thread, Outcome::Granted);
            }
            self.cond.notify_all();
            return;
        }
        let duplicate = state
            .holds
            .get(&thread)
            .is_some_and(|h| h.server.contains(level) || (level.is_read() && h.server.is_write()));
        if duplicate {
            debug!(lock_id = %self.lock_id, %thread, %level, "Award for a hold already granted");
            return;
        }
        warn!(lock_id = %self.lock_id, %thread, %level, "Award for thread not pending, releasing");
        let msg = Message::Unlock {
            lock_id: self.lock_id.clone(),
            thread,
        };
        state.send(remote, msg);
    }

    pub(crate) fn on_refused(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        let Some(idx) = state.pending_position(thread) else {
            debug!(lock_id = %self.lock_id, %thread, "Refusal for thread not pending");
            return;
        };
        if matches!(state.pending[idx].kind, RequestKind::TryLock { .. }) {
            state.pending.remove(idx);
            state.outcomes.insert(thread, Outcome::Refused);
            self.cond.notify_all();
        }
    }

    pub(crate) fn on_recall(&self, remote: &RemoteLockManager) {
        let mut state = self.state.lock();
        if state.greedy.is_none() {
            debug!(lock_id = %self.lock_id, "Recall for lock not held greedily");
            return;
        }
        state.commit_recall(&self.lock_id, remote, Instant::now());
        self.cond.notify_all();
    }

    /// The server moved `thread` from its waiters to its pending queue.
    pub(crate) fn on_wait_done(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        match state.waiters.iter().position(|w| w.thread == thread) {
            Some(pos) => {
                state.wake_waiter(pos);
                self.cond.notify_all();
            },
            None => debug!(lock_id = %self.lock_id, %thread, "Wake for thread not waiting"),
        }
    }

    pub(crate) fn pause(&self) {
        self.state.lock().paused = true;
    }

    /// State for a new server. Anything held back so far is described by the
    /// report and is dropped.
    pub(crate) fn handshake(&self) -> Option<LockReport> {
        let mut state = self.state.lock();
        state.held_back.clear();
        let report = match state.greedy {
            Some(levels) => {
                let mut report = LockReport::new(self.lock_id.clone());
                report.held.push(HeldContext {
                    thread: ThreadId::VM,
                    levels,
                });
                report
            },
            None => state.report(&self.lock_id, Instant::now(), false),
        };
        (!report.is_empty()).then_some(report)
    }

    pub(crate) fn unpause(&self, remote: &RemoteLockManager) {
        let mut state = self.state.lock();
        state.paused = false;
        for msg in std::mem::take(&mut state.held_back) {
            remote.send(msg);
        }
    }

    /// Drop all state and fail every parked thread.
    pub(crate) fn disconnect(&self) {
        let mut state = self.state.lock();
        state.disconnected = true;
        state.holds.clear();
        state.pending.clear();
        state.waiters.clear();
        state.outcomes.clear();
        state.interrupted.clear();
        state.held_back.clear();
        state.greedy = None;
        self.cond.notify_all();
    }

    /// Hand back a greedy grant nobody has used for `idle`.
    pub(crate) fn release_if_idle(&self, now: Instant, idle: Duration, remote: &RemoteLockManager) -> bool {
        let mut state = self.state.lock();
        if state.greedy.is_none()
            || !state.is_quiet()
            || now.saturating_duration_since(state.last_used) < idle
        {
            return false;
        }
        state.commit_recall(&self.lock_id, remote, now);
        true
    }

    pub(crate) fn is_unused(&self) -> bool {
        let state = self.state.lock();
        state.greedy.is_none() && state.is_quiet() && state.outcomes.is_empty() && state.held_back.is_empty()
    }

    pub(crate) fn hold_count(&self, thread: ThreadId) -> usize {
        self.state
            .lock()
            .holds
            .get(&thread)
            .map_or(0, |h| h.stack.len())
    }

    pub(crate) fn is_held_by(&self, thread: ThreadId, level: LockLevel) -> bool {
        self.state
            .lock()
            .holds
            .get(&thread)
            .is_some_and(|h| h.covers(level) && (level.is_concurrent() || h.holds_any()))
    }

    pub(crate) fn greedy_level(&self) -> Option<LevelSet> {
        self.state.lock().greedy
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implied_levels_follow_acquisition_order() {
        use LockLevel::{Concurrent, Read, Write};
        assert_eq!(implied_server_levels(&[Write, Read]), LevelSet::of(Write));
        let upgrade = implied_server_levels(&[Read, Write]);
        assert!(upgrade.is_upgrade());
        assert_eq!(implied_server_levels(&[Concurrent]), LevelSet::EMPTY);
        assert_eq!(implied_server_levels(&[Read, Read]), LevelSet::of(Read));
    }

    #[test]
    fn test_hold_covers() {
        let hold = Hold {
            stack: vec![LockLevel::Write],
            server: LevelSet::of(LockLevel::Write),
        };
        assert!(hold.covers(LockLevel::Read));
        assert!(hold.covers(LockLevel::Write));

        let read = Hold {
            stack: vec![LockLevel::Concurrent, LockLevel::Read],
            server: LevelSet::of(LockLevel::Read),
        };
        assert!(read.covers(LockLevel::Read));
        assert!(!read.covers(LockLevel::Write));

        let concurrent_only = Hold {
            stack: vec![LockLevel::Concurrent],
            server: LevelSet::EMPTY,
        };
        assert!(!concurrent_only.covers(LockLevel::Read));
    }

    #[test]
    fn test_local_grant_respects_queue_order() {
        let mut state = LockState::new(false);
        state.greedy = Some(LevelSet::of(LockLevel::Write));
        state.pending.push_back(LocalRequest {
            thread: ThreadId(1),
            level: LockLevel::Write,
            kind: RequestKind::Lock,
        });
        assert!(!state.can_grant_locally(ThreadId(2), LockLevel::Read, 1));
        assert!(state.can_grant_locally(ThreadId(1), LockLevel::Write, 0));
    }

    #[test]
    fn test_read_greedy_does_not_cover_write() {
        let mut state = LockState::new(false);
        state.greedy = Some(LevelSet::of(LockLevel::Read));
        assert!(state.can_grant_locally(ThreadId(1), LockLevel::Read, 0));
        assert!(!state.can_grant_locally(ThreadId(1), LockLevel::Write, 0));
    }

    #[test]
    fn test_recall_report_adopts_implied_levels() {
        let mut state = LockState::new(false);
        state.greedy = Some(LevelSet::of(LockLevel::Write));
        state.holds.insert(
            ThreadId(1),
            Hold {
                stack: vec![LockLevel::Write, LockLevel::Read],
                server: LevelSet::EMPTY,
            },
        );
        let (remote, mut rx) = RemoteLockManager::new();
        state.commit_recall(&LockId::new("l"), &remote, Instant::now());
        assert!(state.greedy.is_none());
        match rx.try_recv().unwrap() {
            Message::RecallCommit(report) => {
                assert_eq!(report.held.len(), 1);
                assert_eq!(report.held[0].levels, LevelSet::of(LockLevel::Write));
            },
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state.holds[&ThreadId(1)].server, LevelSet::of(LockLevel::Write));
    }

    #[test]
    fn test_paused_messages_held_back() {
        let mut state = LockState::new(true);
        let (remote, mut rx) = RemoteLockManager::new();
        state.send(&remote, Message::Goodbye);
        assert!(rx.try_recv().is_err());
        assert_eq!(state.held_back.len(), 1);
    }
}
