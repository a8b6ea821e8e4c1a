// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Monitor wait/notify, locally under a greedy grant and across nodes.

mod common;

use std::time::Duration;

use common::{blocking, eventually, join, Cluster};
use monitor_core::{LockId, LockLevel, MonitorError, NodeId, ThreadContext, ThreadId};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_waiter_moves_to_server_on_recall_and_is_notified_remotely() {
    let cluster = Cluster::start(2).await;
    let a = cluster.client(0).locks().clone();
    let b = cluster.client(1).locks().clone();
    let lock = LockId::new("queue");
    let t1 = ThreadId(1);

    let (a2, l2) = (a.clone(), lock.clone());
    let waiter = blocking(move || {
        a2.acquire(&l2, t1, LockLevel::Write)?;
        a2.wait(&l2, t1, None)
    });
    eventually("A waiting locally", || a.waiter_count(&lock) == 1).await;
    assert!(a.greedy_level(&lock).is_some());

    // B's request recalls A's grant; A's waiter is handed to the server.
    let (b2, l2) = (b.clone(), lock.clone());
    join(blocking(move || b2.acquire(&l2, t1, LockLevel::Write)))
        .await
        .unwrap();
    assert!(b.greedy_level(&lock).is_none(), "no greedy grant while someone waits");

    let server = cluster.server.lock_manager().clone();
    let a_ctx = ThreadContext::new(NodeId::new("client-0"), t1);
    let info = server.query_lock(&lock).unwrap();
    assert_eq!(info.waiters, vec![a_ctx.clone()]);

    b.notify(&lock, t1, false).unwrap();
    eventually("A moved to pending", || {
        server
            .query_lock(&lock)
            .is_some_and(|info| info.waiters.is_empty() && info.pending.iter().any(|(c, _)| *c == a_ctx))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished(), "wait returned before B released");

    b.release(&lock, t1).unwrap();
    join(waiter).await.unwrap();
    assert_eq!(a.hold_count(&lock, t1), 1);
    assert!(a.is_held_by(&lock, t1, LockLevel::Write));
    a.release(&lock, t1).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_side_wait_times_out() {
    let cluster = Cluster::start(2).await;
    let a = cluster.client(0).locks().clone();
    let b = cluster.client(1).locks().clone();
    let lock = LockId::new("timed");
    let t1 = ThreadId(1);

    let (a2, l2) = (a.clone(), lock.clone());
    let waiter = blocking(move || {
        a2.acquire(&l2, t1, LockLevel::Write)?;
        a2.wait(&l2, t1, Some(Duration::from_millis(300)))
    });
    eventually("A waiting locally", || a.waiter_count(&lock) == 1).await;

    let (b2, l2) = (b.clone(), lock.clone());
    join(blocking(move || b2.acquire(&l2, t1, LockLevel::Write)))
        .await
        .unwrap();

    // Nobody notifies; the server expires the wait and queues A behind B.
    let server = cluster.server.lock_manager().clone();
    eventually("wait expired on the server", || {
        server
            .query_lock(&lock)
            .is_some_and(|info| info.waiters.is_empty() && !info.pending.is_empty())
    })
    .await;

    b.release(&lock, t1).unwrap();
    join(waiter).await.unwrap();
    assert!(a.is_held_by(&lock, t1, LockLevel::Write));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_notify_all_wakes_every_waiter() {
    let cluster = Cluster::start(1).await;
    let a = cluster.client(0).locks().clone();
    let lock = LockId::new("local");

    let mut waiters = Vec::new();
    for thread in 1..=2 {
        let (a2, l2) = (a.clone(), lock.clone());
        waiters.push(blocking(move || {
            a2.acquire(&l2, ThreadId(thread), LockLevel::Write)?;
            a2.wait(&l2, ThreadId(thread), None)?;
            a2.release(&l2, ThreadId(thread))
        }));
        let expected = thread as usize;
        eventually("thread waiting", || a.waiter_count(&lock) == expected).await;
    }

    let sent = a.remote().sent_count();
    let (a2, l2) = (a.clone(), lock.clone());
    join(blocking(move || {
        a2.acquire(&l2, ThreadId(3), LockLevel::Write)?;
        a2.notify(&l2, ThreadId(3), true)?;
        a2.release(&l2, ThreadId(3))
    }))
    .await
    .unwrap();

    for waiter in waiters {
        join(waiter).await.unwrap();
    }
    assert_eq!(a.waiter_count(&lock), 0);
    assert_eq!(a.remote().sent_count(), sent, "greedy wait/notify stays local");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interrupted_wait_returns_with_lock_held() {
    let cluster = Cluster::start(1).await;
    let a = cluster.client(0).locks().clone();
    let lock = LockId::new("interrupt");
    let t1 = ThreadId(1);

    let (a2, l2) = (a.clone(), lock.clone());
    let waiter = blocking(move || {
        a2.acquire(&l2, t1, LockLevel::Write)?;
        a2.acquire(&l2, t1, LockLevel::Write)?;
        a2.wait(&l2, t1, None)
    });
    eventually("A waiting", || a.waiter_count(&lock) == 1).await;

    assert!(a.interrupt(&lock, t1));
    let result = join(waiter).await;
    assert!(matches!(result, Err(MonitorError::Interrupted(_))), "got {result:?}");
    // Both reentrant acquisitions are restored.
    assert_eq!(a.hold_count(&lock, t1), 2);
    assert!(!a.interrupt(&lock, ThreadId(9)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_without_write_is_illegal() {
    let cluster = Cluster::start(1).await;
    let a = cluster.client(0).locks().clone();
    let lock = LockId::new("reader");
    let t1 = ThreadId(1);

    let (a2, l2) = (a.clone(), lock.clone());
    join(blocking(move || a2.acquire(&l2, t1, LockLevel::Read)))
        .await
        .unwrap();
    let err = a.wait(&lock, t1, Some(Duration::from_millis(10))).unwrap_err();
    assert!(matches!(err, MonitorError::IllegalMonitorState(_)));
    assert!(a.is_held_by(&lock, t1, LockLevel::Read));

    let err = a.notify(&LockId::new("never"), t1, false).unwrap_err();
    assert!(matches!(err, MonitorError::IllegalMonitorState(_)));
}
