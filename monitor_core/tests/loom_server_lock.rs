// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Loom verification of the server lock table.
//!
//! Under the `loom` feature the manager's table mutex is a loom mutex, so
//! these drive the real `ServerLockManager` through every interleaving of
//! concurrent requests and releases.
//!
//! Run with: cargo test --package monitor_core --features loom --test loom_server_lock

#![cfg(feature = "loom")]

use std::sync::Arc as StdArc;

use loom::sync::Arc;
use loom::thread;

use monitor_core::{
    LockId, LockLevel, LockManagerConfig, LockPolicy, Message, NodeId, RecordingSink, ServerLockManager,
    ThreadContext, ThreadId,
};

fn ctx(node: &str) -> ThreadContext {
    ThreadContext::new(NodeId::new(node), ThreadId(1))
}

fn awards(sink: &RecordingSink) -> Vec<NodeId> {
    sink.take()
        .into_iter()
        .filter(|(_, msg)| matches!(msg, Message::LockAward { .. }))
        .map(|(to, _)| to)
        .collect()
}

#[test]
fn loom_concurrent_write_requests_award_once() {
    loom::model(|| {
        let sink = StdArc::new(RecordingSink::new());
        let manager = Arc::new(ServerLockManager::started(LockManagerConfig::default(), sink.clone()));
        let lock = LockId::new("L");

        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|node| {
                let manager = Arc::clone(&manager);
                let lock = lock.clone();
                thread::spawn(move || {
                    manager.request_lock(&lock, ctx(node), LockLevel::Write).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(awards(&sink).len(), 1, "exactly one writer is granted");
        let info = manager.query_lock(&lock).unwrap();
        assert_eq!(info.holders.len() + info.greedy_holders.len(), 1);
        assert_eq!(info.pending.len(), 1);
    });
}

#[test]
fn loom_unlock_racing_request() {
    loom::model(|| {
        let sink = StdArc::new(RecordingSink::new());
        let config = LockManagerConfig::default().with_policy(LockPolicy::Altruistic);
        let manager = Arc::new(ServerLockManager::started(config, sink.clone()));
        let lock = LockId::new("L");
        manager.request_lock(&lock, ctx("a"), LockLevel::Write).unwrap();
        assert_eq!(awards(&sink), vec![NodeId::new("a")]);

        let releaser = {
            let manager = Arc::clone(&manager);
            let lock = lock.clone();
            thread::spawn(move || manager.unlock(&lock, &ctx("a")).unwrap())
        };
        let requester = {
            let manager = Arc::clone(&manager);
            let lock = lock.clone();
            thread::spawn(move || manager.request_lock(&lock, ctx("b"), LockLevel::Write).unwrap())
        };
        releaser.join().unwrap();
        requester.join().unwrap();

        // Whichever ran first, b ends up the only holder with one award.
        assert_eq!(awards(&sink), vec![NodeId::new("b")]);
        let info = manager.query_lock(&lock).unwrap();
        assert_eq!(info.holders, vec![(ctx("b"), monitor_core::LevelSet::of(LockLevel::Write))]);
        assert!(info.pending.is_empty());
    });
}
