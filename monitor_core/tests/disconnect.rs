// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Departure of a client node, voluntary or forced.

mod common;

use std::time::Duration;

use common::{blocking, eventually, join, Cluster};
use monitor_core::{LockId, LockLevel, Message, MonitorError, NodeId, ThreadId, Transport};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_departed_holder_releases_locks_and_transactions() {
    let mut config = common::config();
    // Only the departure may remove descriptors here.
    config.sequencer.lwm_cleanup_interval_ms = 60_000;
    let mut cluster = Cluster::start_with(2, config).await;
    let a = cluster.client(0).clone();
    let b = cluster.client(1).locks().clone();
    let lock = LockId::new("L");
    let t1 = ThreadId(1);

    let locks = a.locks().clone();
    let l2 = lock.clone();
    join(blocking(move || locks.acquire(&l2, t1, LockLevel::Write)))
        .await
        .unwrap();
    a.commit(b"a-1".to_vec()).await.unwrap();
    let store = cluster.server.store().clone();
    assert_eq!(store.len(), 1);

    let (b2, l2) = (b.clone(), lock.clone());
    let contender = blocking(move || b2.acquire(&l2, t1, LockLevel::Write));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!contender.is_finished());

    // A leaves while still holding the lock.
    drop(a);
    cluster.clients.remove(0).stop().await;

    join(contender).await.unwrap();
    assert!(b.is_held_by(&lock, t1, LockLevel::Write));
    eventually("A's transactions removed", || store.is_empty()).await;
    assert_eq!(cluster.persistor.deleted_ids(), vec![1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_eviction_fails_parked_threads() {
    let cluster = Cluster::start(2).await;
    let a = cluster.client(0).locks().clone();
    let b = cluster.client(1).locks().clone();
    let lock = LockId::new("L");

    let (a2, l2) = (a.clone(), lock.clone());
    join(blocking(move || a2.acquire(&l2, ThreadId(1), LockLevel::Write)))
        .await
        .unwrap();
    let (b2, l2) = (b.clone(), lock.clone());
    let parked = blocking(move || b2.acquire(&l2, ThreadId(1), LockLevel::Write));
    eventually("B queued", || b.pending_count(&lock) == 1).await;

    cluster
        .server_transport
        .send(&NodeId::new("client-1"), Message::Goodbye)
        .await
        .unwrap();

    let result = join(parked).await;
    assert!(matches!(result, Err(MonitorError::Disconnected(_))), "got {result:?}");
    assert!(b.is_disconnected());
    let err = b.acquire(&LockId::new("other"), ThreadId(2), LockLevel::Read).unwrap_err();
    assert!(matches!(err, MonitorError::Disconnected(_)));

    // The other node is unaffected.
    assert!(a.is_held_by(&lock, ThreadId(1), LockLevel::Write));
}
