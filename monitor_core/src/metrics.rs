// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Lock and sequencer statistics.
//!
//! Counters are plain atomics with `Ordering::Relaxed`. Nothing in the award
//! path reads them back, so they can never influence grant order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Thread-safe timing statistics using atomics.
///
/// Records count, total duration, min and max for a category of operations.
#[derive(Debug)]
pub struct TimingStats {
    count: AtomicU64,
    total_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl Default for TimingStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingStats {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }

    /// Record a duration in microseconds.
    pub fn record(&self, duration_us: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(duration_us, Ordering::Relaxed);
        self.min_us.fetch_min(duration_us, Ordering::Relaxed);
        self.max_us.fetch_max(duration_us, Ordering::Relaxed);
    }

    pub fn record_duration(&self, duration: Duration) {
        self.record(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX));
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TimingSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_us.load(Ordering::Relaxed);
        let min = self.min_us.load(Ordering::Relaxed);
        let max = self.max_us.load(Ordering::Relaxed);
        TimingSnapshot {
            count,
            total_us: total,
            min_us: if min == u64::MAX { 0 } else { min },
            max_us: max,
            avg_us: if count == 0 {
                0.0
            } else {
                total as f64 / count as f64
            },
        }
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.total_us.store(0, Ordering::Relaxed);
        self.min_us.store(u64::MAX, Ordering::Relaxed);
        self.max_us.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of timing statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingSnapshot {
    pub count: u64,
    pub total_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub avg_us: f64,
}

impl TimingSnapshot {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn avg_ms(&self) -> f64 {
        self.avg_us / 1000.0
    }
}

/// Server lock manager counters.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Lock and try-lock requests received.
    pub requests: AtomicU64,
    /// Per-thread awards.
    pub awards: AtomicU64,
    /// Node-wide (greedy) awards.
    pub greedy_awards: AtomicU64,
    /// Recalls sent to greedy holders.
    pub recalls: AtomicU64,
    pub recall_commits: AtomicU64,
    /// Try-lock refusals.
    pub rejections: AtomicU64,
    /// Try-lock and wait timeouts.
    pub timeouts: AtomicU64,
    pub waits: AtomicU64,
    pub notifies: AtomicU64,
    /// Largest pending queue seen on any lock.
    pub pending_high_water: AtomicU64,
    /// Time between a request being queued and its award.
    pub queued_timing: TimingStats,
}

impl LockStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_pending(&self, depth: usize) {
        self.pending_high_water
            .fetch_max(depth as u64, Ordering::Relaxed);
    }

    /// Fraction of awards that went to a whole node.
    pub fn greedy_ratio(&self) -> f32 {
        let greedy = self.greedy_awards.load(Ordering::Relaxed);
        let total = greedy + self.awards.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        greedy as f32 / total as f32
    }

    pub fn snapshot(&self) -> LockStatsSnapshot {
        LockStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            awards: self.awards.load(Ordering::Relaxed),
            greedy_awards: self.greedy_awards.load(Ordering::Relaxed),
            recalls: self.recalls.load(Ordering::Relaxed),
            recall_commits: self.recall_commits.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            notifies: self.notifies.load(Ordering::Relaxed),
            pending_high_water: self.pending_high_water.load(Ordering::Relaxed),
            queued_timing: self.queued_timing.snapshot(),
            greedy_ratio: self.greedy_ratio(),
        }
    }
}

/// Point-in-time snapshot of lock statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockStatsSnapshot {
    pub requests: u64,
    pub awards: u64,
    pub greedy_awards: u64,
    pub recalls: u64,
    pub recall_commits: u64,
    pub rejections: u64,
    pub timeouts: u64,
    pub waits: u64,
    pub notifies: u64,
    pub pending_high_water: u64,
    pub queued_timing: TimingSnapshot,
    pub greedy_ratio: f32,
}

/// Transaction store counters.
#[derive(Debug, Default)]
pub struct SequencerStats {
    pub created: AtomicU64,
    pub committed: AtomicU64,
    /// Descriptors removed by low-water-mark or node cleanup.
    pub purged: AtomicU64,
    /// Failover re-mappings of a transaction to a different global id.
    pub remapped: AtomicU64,
    pub persistence_failures: AtomicU64,
}

impl SequencerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SequencerStatsSnapshot {
        SequencerStatsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
            remapped: self.remapped.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerStatsSnapshot {
    pub created: u64,
    pub committed: u64,
    pub purged: u64,
    pub remapped: u64,
    pub persistence_failures: u64,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_timing_stats_record_multiple() {
        let stats = TimingStats::new();
        stats.record(100);
        stats.record(200);
        stats.record(300);

        let snap = stats.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.total_us, 600);
        assert_eq!(snap.min_us, 100);
        assert_eq!(snap.max_us, 300);
        assert_eq!(snap.avg_us, 200.0);
    }

    #[test]
    fn test_timing_stats_empty_snapshot() {
        let snap = TimingStats::new().snapshot();
        assert!(snap.is_empty());
        assert_eq!(snap.min_us, 0);
    }

    #[test]
    fn test_timing_stats_reset() {
        let stats = TimingStats::new();
        stats.record_duration(Duration::from_millis(2));
        assert_eq!(stats.count(), 1);
        stats.reset();
        assert!(stats.snapshot().is_empty());
    }

    #[test]
    fn test_timing_stats_concurrent() {
        let stats = Arc::new(TimingStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for i in 1..=100 {
                        stats.record(i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.count(), 400);
        assert_eq!(stats.snapshot().max_us, 100);
    }

    #[test]
    fn test_lock_stats_greedy_ratio() {
        let stats = LockStats::new();
        assert_eq!(stats.greedy_ratio(), 0.0);
        LockStats::incr(&stats.awards);
        LockStats::incr(&stats.greedy_awards);
        assert_eq!(stats.greedy_ratio(), 0.5);
    }

    #[test]
    fn test_pending_high_water_keeps_max() {
        let stats = LockStats::new();
        stats.observe_pending(3);
        stats.observe_pending(7);
        stats.observe_pending(2);
        assert_eq!(stats.snapshot().pending_high_water, 7);
    }

    #[test]
    fn test_sequencer_stats_snapshot() {
        let stats = SequencerStats::new();
        SequencerStats::add(&stats.created, 5);
        SequencerStats::add(&stats.purged, 2);
        let snap = stats.snapshot();
        assert_eq!(snap.created, 5);
        assert_eq!(snap.purged, 2);
        assert_eq!(snap.remapped, 0);
    }
}
