// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Server-side state of a single distributed lock.
//!
//! A [`ServerLock`] owns the holder set, the FIFO pending queue, the upgrade
//! queue and the waiter list for one [`LockId`]. Node-wide (greedy) grants are
//! ordinary holders keyed by the node's VM context. Every operation runs under
//! the manager's mutex and appends the messages it produces to an outbox that
//! is flushed after the mutex is released.
//!
//! ```text
//!   request ──► grantable now? ──yes──► award (greedy if policy allows)
//!                    │ no
//!                    ▼
//!            greedy holders? ──yes──► recall them
//!                    │
//!                    ▼
//!        pending (FIFO) / upgrades ──► next_pending on every release
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::LockPolicy;
use crate::deadlock::WaitForGraph;
use crate::error::{MonitorError, Result};
use crate::ids::{LockId, NodeId, ThreadContext, ThreadId};
use crate::lock_level::{LevelSet, LockLevel};
use crate::messages::{LockReport, Message, TimerSpec};
use crate::metrics::LockStats;

/// Messages produced while the manager mutex is held.
pub(crate) type Outbox = Vec<(NodeId, Message)>;

/// Everything a lock operation needs besides the lock itself.
pub(crate) struct Effects<'a> {
    pub policy: LockPolicy,
    pub now: Instant,
    pub out: &'a mut Outbox,
    pub stats: &'a LockStats,
}

impl Effects<'_> {
    fn greedy_allowed(&self) -> bool {
        self.policy == LockPolicy::Greedy
    }
}

#[derive(Debug, Clone)]
struct PendingRequest {
    ctx: ThreadContext,
    level: LockLevel,
    /// Set for try-lock requests.
    try_deadline: Option<Instant>,
    queued_at: Instant,
}

impl PendingRequest {
    fn expired(&self, now: Instant) -> bool {
        self.try_deadline.is_some_and(|d| d <= now)
    }
}

#[derive(Debug, Clone)]
struct Waiter {
    ctx: ThreadContext,
    timer: TimerSpec,
    /// `None` for indefinite waits and for re-established waits not yet started.
    deadline: Option<Instant>,
}

/// Snapshot of one lock, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_id: LockId,
    /// Union of all held components.
    pub level: LevelSet,
    /// Per-thread holders.
    pub holders: Vec<(ThreadContext, LevelSet)>,
    pub greedy_holders: Vec<(NodeId, LevelSet)>,
    pub concurrent_holders: Vec<ThreadContext>,
    pub pending: Vec<(ThreadContext, LockLevel)>,
    pub pending_upgrades: Vec<ThreadContext>,
    pub waiters: Vec<ThreadContext>,
    pub recalled: bool,
}

#[derive(Debug)]
pub(crate) struct ServerLock {
    lock_id: LockId,
    holders: BTreeMap<ThreadContext, LevelSet>,
    concurrent: BTreeSet<ThreadContext>,
    pending: VecDeque<PendingRequest>,
    upgrades: VecDeque<PendingRequest>,
    waiters: VecDeque<Waiter>,
    /// A recall is outstanding for the current greedy holders.
    recalled: bool,
}

impl ServerLock {
    pub(crate) fn new(lock_id: LockId) -> Self {
        Self {
            lock_id,
            holders: BTreeMap::new(),
            concurrent: BTreeSet::new(),
            pending: VecDeque::new(),
            upgrades: VecDeque::new(),
            waiters: VecDeque::new(),
            recalled: false,
        }
    }

    fn level(&self) -> LevelSet {
        let mut level = LevelSet::EMPTY;
        for held in self.holders.values() {
            for l in held.levels() {
                level.add(l);
            }
        }
        level
    }

    fn has_write_holder(&self) -> bool {
        self.holders.values().any(LevelSet::is_write)
    }

    fn greedy_level(&self, node: &NodeId) -> Option<LevelSet> {
        self.holders
            .get(&ThreadContext::new(node.clone(), ThreadId::VM))
            .copied()
    }

    fn has_greedy_holders(&self) -> bool {
        self.holders.keys().any(ThreadContext::is_vm)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.upgrades.is_empty()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len() + self.upgrades.len()
    }

    pub(crate) fn is_clear(&self) -> bool {
        self.holders.is_empty()
            && self.concurrent.is_empty()
            && !self.has_pending()
            && self.waiters.is_empty()
    }

    pub(crate) fn has_timers(&self) -> bool {
        self.waiters.iter().any(|w| w.deadline.is_some())
            || self
                .pending
                .iter()
                .chain(self.upgrades.iter())
                .any(|p| p.try_deadline.is_some())
    }

    fn is_pending(&self, ctx: &ThreadContext) -> bool {
        self.pending
            .iter()
            .chain(self.upgrades.iter())
            .any(|p| p.ctx == *ctx)
    }

    fn clear_recalled_if_no_greedy(&mut self) {
        if !self.has_greedy_holders() {
            self.recalled = false;
        }
    }

    /// Handle a lock or try-lock request.
    ///
    /// `try_timeout` is `None` for a blocking request and `Some(ZERO)` for a
    /// request that must be refused rather than queued.
    pub(crate) fn request(
        &mut self,
        ctx: ThreadContext,
        level: LockLevel,
        try_timeout: Option<Duration>,
        fx: &mut Effects<'_>,
    ) {
        LockStats::incr(&fx.stats.requests);

        if level.is_concurrent() {
            self.concurrent.insert(ctx.clone());
            self.send_award(&ctx, level, false, fx);
            return;
        }

        if let Some(greedy) = self.greedy_level(&ctx.node) {
            if greedy.is_write() || greedy.contains(level) {
                debug!(lock_id = %self.lock_id, ctx = %ctx, %level, "Request covered by greedy grant");
                return;
            }
        }

        if self.try_grant(&ctx, level, fx) {
            return;
        }

        if try_timeout == Some(Duration::ZERO) {
            self.refuse(&ctx, level, fx);
            self.recall(fx);
            return;
        }

        if self.has_greedy_holders() {
            self.recall(fx);
        }
        let try_deadline = try_timeout.map(|d| fx.now + d);
        self.add_pending(ctx, level, try_deadline, fx);
    }

    /// Award immediately if nothing has to queue ahead of this request.
    fn try_grant(&mut self, ctx: &ThreadContext, level: LockLevel, fx: &mut Effects<'_>) -> bool {
        if let Some(held) = self.holders.get(ctx).copied() {
            // A thread never blocks on its own hold.
            if held.contains(level) || (held.is_write() && level.is_read()) {
                self.award(ctx.clone(), level, false, None, fx);
                return true;
            }
            if held.is_read_only() && level.is_write() && self.holders.len() == 1 {
                self.award(ctx.clone(), level, false, None, fx);
                return true;
            }
        }

        if self.recalled {
            return false;
        }

        let uncontended = self.holders.is_empty()
            || (level.is_read() && !self.has_write_holder() && !self.has_pending());
        if uncontended {
            let greedy = fx.greedy_allowed() && (level.is_read() || self.waiters.is_empty());
            self.award(ctx.clone(), level, greedy, None, fx);
            return true;
        }
        false
    }

    fn award(
        &mut self,
        ctx: ThreadContext,
        level: LockLevel,
        greedy: bool,
        queued_at: Option<Instant>,
        fx: &mut Effects<'_>,
    ) {
        if let Some(queued_at) = queued_at {
            fx.stats
                .queued_timing
                .record_duration(fx.now.saturating_duration_since(queued_at));
        }
        if greedy {
            self.award_greedy(ctx.node, level, fx);
            return;
        }
        self.holders.entry(ctx.clone()).or_default().add(level);
        self.send_award(&ctx, level, false, fx);
    }

    /// Grant to the whole node. Per-thread holds and queued requests of that
    /// node become covered by the grant and are dropped from the server view.
    fn award_greedy(&mut self, node: NodeId, level: LockLevel, fx: &mut Effects<'_>) {
        self.holders.retain(|c, _| c.node != node || c.is_vm());
        // A READ grant cannot cover a queued WRITE; those stay queued.
        self.pending
            .retain(|p| p.ctx.node != node || (level.is_read() && p.level.is_write()));
        self.upgrades.retain(|p| p.ctx.node != node);

        let vm = ThreadContext::new(node, ThreadId::VM);
        self.holders.insert(vm.clone(), LevelSet::of(level));
        self.send_award(&vm, level, true, fx);
    }

    fn send_award(&self, ctx: &ThreadContext, level: LockLevel, greedy: bool, fx: &mut Effects<'_>) {
        if greedy {
            LockStats::incr(&fx.stats.greedy_awards);
        } else {
            LockStats::incr(&fx.stats.awards);
        }
        fx.out.push((
            ctx.node.clone(),
            Message::LockAward {
                lock_id: self.lock_id.clone(),
                thread: ctx.thread,
                level,
                greedy,
            },
        ));
    }

    fn refuse(&self, ctx: &ThreadContext, level: LockLevel, fx: &mut Effects<'_>) {
        LockStats::incr(&fx.stats.rejections);
        fx.out.push((
            ctx.node.clone(),
            Message::LockRefused {
                lock_id: self.lock_id.clone(),
                thread: ctx.thread,
                level,
            },
        ));
    }

    fn add_pending(
        &mut self,
        ctx: ThreadContext,
        level: LockLevel,
        try_deadline: Option<Instant>,
        fx: &mut Effects<'_>,
    ) {
        let upgrade =
            level.is_write() && self.holders.get(&ctx).is_some_and(LevelSet::is_read_only);
        if self.is_pending(&ctx) {
            debug!(lock_id = %self.lock_id, ctx = %ctx, "Duplicate pending request ignored");
            return;
        }
        let req = PendingRequest {
            ctx,
            level,
            try_deadline,
            queued_at: fx.now,
        };
        if upgrade {
            self.upgrades.push_back(req);
        } else {
            self.pending.push_back(req);
        }
        fx.stats.observe_pending(self.pending.len());
    }

    /// Ask every greedy holder to hand its grant back.
    fn recall(&mut self, fx: &mut Effects<'_>) {
        if self.recalled {
            return;
        }
        let nodes: Vec<NodeId> = self
            .holders
            .keys()
            .filter(|c| c.is_vm())
            .map(|c| c.node.clone())
            .collect();
        if nodes.is_empty() {
            return;
        }
        self.recalled = true;
        for node in nodes {
            LockStats::incr(&fx.stats.recalls);
            debug!(lock_id = %self.lock_id, node = %node, "Recalling greedy grant");
            fx.out.push((
                node,
                Message::LockRecall {
                    lock_id: self.lock_id.clone(),
                },
            ));
        }
    }

    /// Hand the lock to whatever is now at the front of the queues.
    fn next_pending(&mut self, fx: &mut Effects<'_>) {
        if self.holders.len() == 1 {
            let sole = self.holders.keys().next().cloned();
            if let Some(sole) = sole {
                if let Some(pos) = self.upgrades.iter().position(|p| p.ctx == sole) {
                    if let Some(req) = self.upgrades.remove(pos) {
                        self.award(req.ctx, LockLevel::Write, false, Some(req.queued_at), fx);
                    }
                    return;
                }
            }
        }

        let Some(head) = self.pending.front() else {
            return;
        };
        if head.level.is_write() {
            if !self.holders.is_empty() {
                return;
            }
            let node = head.ctx.node.clone();
            let greedy = fx.greedy_allowed()
                && self.waiters.is_empty()
                && self.pending.iter().all(|p| p.ctx.node == node);
            if let Some(req) = self.pending.pop_front() {
                self.award(req.ctx, LockLevel::Write, greedy, Some(req.queued_at), fx);
            }
        } else if !self.has_write_holder() {
            self.award_all_reads(fx);
        }
    }

    /// Award the run of READ requests at the head of the queue.
    fn award_all_reads(&mut self, fx: &mut Effects<'_>) {
        let write_pending = self.pending.iter().any(|p| p.level.is_write());
        let greedy = fx.greedy_allowed() && !write_pending && !self.recalled;

        let mut reads = Vec::new();
        while self.pending.front().is_some_and(|p| p.level.is_read()) {
            if let Some(req) = self.pending.pop_front() {
                reads.push(req);
            }
        }
        for req in reads {
            if self.greedy_level(&req.ctx.node).is_some() {
                debug!(lock_id = %self.lock_id, ctx = %req.ctx, "Queued READ covered by greedy grant");
                continue;
            }
            self.award(req.ctx, LockLevel::Read, greedy, Some(req.queued_at), fx);
        }
    }

    /// Release the innermost hold of `ctx`.
    ///
    /// Client managers keep CONCURRENT holds local, so concurrent entries only
    /// come from raw [`Message::LockRequest`]s. Such a hold is the one taken
    /// last when the context also holds the lock normally, and goes first.
    pub(crate) fn unlock(&mut self, ctx: &ThreadContext, fx: &mut Effects<'_>) -> Result<()> {
        if self.concurrent.remove(ctx) {
            return Ok(());
        }
        match self.holders.get_mut(ctx) {
            // Releasing an upgrade keeps the original READ.
            Some(held) if held.is_upgrade() => held.remove(LockLevel::Write),
            Some(_) => {
                self.holders.remove(ctx);
            },
            None => {
                warn!(lock_id = %self.lock_id, ctx = %ctx, "Unlock of lock not held");
                return Err(MonitorError::IllegalMonitorState(format!(
                    "{ctx} does not hold {}",
                    self.lock_id
                )));
            },
        }
        self.clear_recalled_if_no_greedy();
        self.next_pending(fx);
        Ok(())
    }

    /// The caller must be the only holder, at WRITE, either itself or through
    /// its node's greedy grant. Returns the holder entry to act on.
    fn monitor_owner(&self, ctx: &ThreadContext, operation: &str) -> Result<ThreadContext> {
        let mut holders = self.holders.iter();
        let owner = match (holders.next(), holders.next()) {
            (Some((holder, held)), None)
                if held.is_write() && (holder == ctx || (holder.is_vm() && holder.node == ctx.node)) =>
            {
                Some(holder.clone())
            },
            _ => None,
        };
        owner.ok_or_else(|| {
            MonitorError::IllegalMonitorState(format!(
                "{ctx} cannot {operation} on {}: not the exclusive holder (holders: {})",
                self.lock_id,
                self.holders.len()
            ))
        })
    }

    pub(crate) fn wait(
        &mut self,
        ctx: &ThreadContext,
        timer: TimerSpec,
        fx: &mut Effects<'_>,
    ) -> Result<()> {
        let owner = self.monitor_owner(ctx, "wait")?;
        self.holders.remove(&owner);
        self.clear_recalled_if_no_greedy();
        self.waiters.push_back(Waiter {
            ctx: ctx.clone(),
            timer,
            deadline: timer.deadline_from(fx.now),
        });
        LockStats::incr(&fx.stats.waits);
        self.next_pending(fx);
        Ok(())
    }

    /// Move one or all waiters to pending. Returns the contexts woken.
    pub(crate) fn notify(
        &mut self,
        ctx: &ThreadContext,
        all: bool,
        fx: &mut Effects<'_>,
    ) -> Result<Vec<ThreadContext>> {
        self.monitor_owner(ctx, "notify")?;
        LockStats::incr(&fx.stats.notifies);

        let count = if all {
            self.waiters.len()
        } else {
            self.waiters.len().min(1)
        };
        let woken: Vec<Waiter> = self.waiters.drain(..count).collect();
        let mut notified = Vec::with_capacity(woken.len());
        for waiter in woken {
            fx.out.push((
                waiter.ctx.node.clone(),
                Message::Notified {
                    lock_id: self.lock_id.clone(),
                    thread: waiter.ctx.thread,
                },
            ));
            notified.push(waiter.ctx.clone());
            self.add_pending(waiter.ctx, LockLevel::Write, None, fx);
        }
        if !notified.is_empty() && self.has_greedy_holders() {
            self.recall(fx);
        }
        Ok(notified)
    }

    /// Wake a waiting thread as if notified.
    pub(crate) fn interrupt(&mut self, ctx: &ThreadContext, fx: &mut Effects<'_>) {
        let Some(pos) = self.waiters.iter().position(|w| w.ctx == *ctx) else {
            debug!(lock_id = %self.lock_id, ctx = %ctx, "Interrupt for thread not waiting");
            return;
        };
        if let Some(waiter) = self.waiters.remove(pos) {
            self.add_pending(waiter.ctx, LockLevel::Write, None, fx);
        }
        if self.has_greedy_holders() {
            self.recall(fx);
        }
        self.next_pending(fx);
    }

    /// Fire expired wait and try-lock timers.
    pub(crate) fn expire_timers(&mut self, fx: &mut Effects<'_>) {
        let now = fx.now;

        let (expired, kept): (Vec<Waiter>, Vec<Waiter>) = self
            .waiters
            .drain(..)
            .partition(|w| w.deadline.is_some_and(|d| d <= now));
        self.waiters = kept.into();
        for waiter in expired {
            LockStats::incr(&fx.stats.timeouts);
            fx.out.push((
                waiter.ctx.node.clone(),
                Message::WaitTimeout {
                    lock_id: self.lock_id.clone(),
                    thread: waiter.ctx.thread,
                },
            ));
            if self.holders.is_empty() && !self.recalled {
                let greedy =
                    fx.greedy_allowed() && self.waiters.is_empty() && !self.has_pending();
                self.award(waiter.ctx, LockLevel::Write, greedy, None, fx);
            } else {
                self.add_pending(waiter.ctx, LockLevel::Write, None, fx);
            }
        }

        let mut refused = Vec::new();
        for queue in [&mut self.pending, &mut self.upgrades] {
            let (gone, kept): (Vec<_>, Vec<_>) = queue.drain(..).partition(|p| p.expired(now));
            *queue = kept.into();
            refused.extend(gone);
        }
        if refused.is_empty() {
            return;
        }
        for req in refused {
            LockStats::incr(&fx.stats.timeouts);
            self.refuse(&req.ctx, req.level, fx);
        }
        self.next_pending(fx);
    }

    /// Drop every hold, request and wait owned by `node`.
    pub(crate) fn clear_node(&mut self, node: &NodeId, fx: &mut Effects<'_>) {
        self.holders.retain(|c, _| c.node != *node);
        self.concurrent.retain(|c| c.node != *node);
        self.pending.retain(|p| p.ctx.node != *node);
        self.upgrades.retain(|p| p.ctx.node != *node);
        self.waiters.retain(|w| w.ctx.node != *node);
        self.clear_recalled_if_no_greedy();
        self.next_pending(fx);
    }

    /// Replace a node's greedy grant with the per-thread state it reports.
    ///
    /// Reported pending requests are queued ahead of requests from other nodes.
    pub(crate) fn recall_commit(
        &mut self,
        node: &NodeId,
        report: LockReport,
        fx: &mut Effects<'_>,
    ) -> Result<()> {
        LockStats::incr(&fx.stats.recall_commits);
        let vm = ThreadContext::new(node.clone(), ThreadId::VM);
        let Some(greedy) = self.holders.get(&vm).copied() else {
            warn!(lock_id = %self.lock_id, node = %node, "Recall commit without a greedy grant, ignored");
            return Ok(());
        };
        if let Some(bad) = report
            .held
            .iter()
            .find(|h| h.levels.is_write() && !greedy.is_write())
        {
            error!(lock_id = %self.lock_id, node = %node, thread = %bad.thread, "WRITE hold reported under READ greedy grant");
            return Err(MonitorError::IllegalMonitorState(format!(
                "{node}/{} reports WRITE on {} under a READ greedy grant",
                bad.thread, self.lock_id
            )));
        }
        debug!(
            lock_id = %self.lock_id,
            node = %node,
            held = report.held.len(),
            waiting = report.waiting.len(),
            pending = report.pending.len(),
            "Applying recall commit"
        );

        for held in report.held {
            if held.levels.is_empty() {
                continue;
            }
            self.holders
                .insert(ThreadContext::new(node.clone(), held.thread), held.levels);
        }

        for wait in report.waiting {
            let ctx = ThreadContext::new(node.clone(), wait.thread);
            if self.waiters.iter().any(|w| w.ctx == ctx) || self.is_pending(&ctx) {
                continue;
            }
            self.waiters.push_back(Waiter {
                ctx,
                timer: wait.timer,
                deadline: wait.timer.deadline_from(fx.now),
            });
        }

        let mut front = Vec::new();
        for req in report.pending {
            let ctx = ThreadContext::new(node.clone(), req.thread);
            if self.is_pending(&ctx) || front.iter().any(|p: &PendingRequest| p.ctx == ctx) {
                continue;
            }
            let pending = PendingRequest {
                try_deadline: req
                    .try_timeout_ms
                    .map(|ms| fx.now + Duration::from_millis(ms)),
                queued_at: fx.now,
                level: req.level,
                ctx,
            };
            if pending.level.is_write()
                && self
                    .holders
                    .get(&pending.ctx)
                    .is_some_and(LevelSet::is_read_only)
            {
                self.upgrades.push_back(pending);
            } else {
                front.push(pending);
            }
        }
        for req in front.into_iter().rev() {
            self.pending.push_front(req);
        }
        fx.stats.observe_pending(self.pending.len());

        self.holders.remove(&vm);
        self.clear_recalled_if_no_greedy();
        self.next_pending(fx);
        // Whatever the report queued may be blocked by another node's grant.
        if self.has_pending() && self.has_greedy_holders() {
            self.recall(fx);
        }
        Ok(())
    }

    /// Rebuild a hold reported by a reconnecting client.
    pub(crate) fn reestablish_hold(&mut self, ctx: ThreadContext, levels: LevelSet) -> Result<()> {
        let conflict = self
            .holders
            .iter()
            .find(|(holder, held)| **holder != ctx && (levels.is_write() || held.is_write()));
        if let Some((holder, held)) = conflict {
            error!(lock_id = %self.lock_id, ctx = %ctx, holder = %holder, "Conflicting re-established hold");
            return Err(MonitorError::Handoff(format!(
                "{ctx} re-establishing {levels} on {} conflicts with {holder} holding {held}",
                self.lock_id
            )));
        }
        let entry = self.holders.entry(ctx).or_default();
        for level in levels.levels() {
            entry.add(level);
        }
        Ok(())
    }

    /// Rebuild a parked wait. Its timer starts with [`Self::start_timers`].
    pub(crate) fn reestablish_wait(&mut self, ctx: ThreadContext, timer: TimerSpec) {
        if self.waiters.iter().any(|w| w.ctx == ctx) {
            return;
        }
        self.waiters.push_back(Waiter {
            ctx,
            timer,
            deadline: None,
        });
    }

    pub(crate) fn start_timers(&mut self, now: Instant) {
        for waiter in &mut self.waiters {
            if waiter.deadline.is_none() {
                waiter.deadline = waiter.timer.deadline_from(now);
            }
        }
    }

    /// Recall greedy grants outright, used when greedy granting is switched off.
    pub(crate) fn recall_greedy(&mut self, fx: &mut Effects<'_>) {
        if self.has_greedy_holders() {
            self.recall(fx);
        }
    }

    pub(crate) fn add_wait_edges(&self, graph: &mut WaitForGraph) {
        for req in self.pending.iter().chain(self.upgrades.iter()) {
            for holder in self.holders.keys() {
                graph.add_wait(req.ctx.clone(), holder.clone());
            }
        }
    }

    pub(crate) fn info(&self) -> LockInfo {
        LockInfo {
            lock_id: self.lock_id.clone(),
            level: self.level(),
            holders: self
                .holders
                .iter()
                .filter(|(c, _)| !c.is_vm())
                .map(|(c, l)| (c.clone(), *l))
                .collect(),
            greedy_holders: self
                .holders
                .iter()
                .filter(|(c, _)| c.is_vm())
                .map(|(c, l)| (c.node.clone(), *l))
                .collect(),
            concurrent_holders: self.concurrent.iter().cloned().collect(),
            pending: self
                .pending
                .iter()
                .map(|p| (p.ctx.clone(), p.level))
                .collect(),
            pending_upgrades: self.upgrades.iter().map(|p| p.ctx.clone()).collect(),
            waiters: self.waiters.iter().map(|w| w.ctx.clone()).collect(),
            recalled: self.recalled,
        }
    }
}
