// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Cluster-wide monitors: distributed locks with wait/notify, plus a global
//! commit order for client transactions.
//!
//! # Architecture
//!
//! ```text
//! ClientNode ─────────────────────────────── ServerNode
//!   ├── ClientLockManager                      ├── ServerLockManager
//!   │     └── ClientLock (per lock:               │     └── ServerLock (holders, FIFO
//!   │           holds, greedy grant,               │           pending, upgrades,
//!   │           parked threads)                    │           waiters, recall)
//!   └── RemoteLockManager ──── Transport ────►   ├── TransactionStore
//!                                                │     └── GlobalTransactionDescriptor
//!                                                └── FailoverHandoff
//! ```
//!
//! Locks are granted to threads, or greedily to a whole node so that its
//! threads can lock and unlock without a round-trip until another node
//! contends. The server then recalls the grant and the node reports what it
//! holds, waits on and still wants, re-expressed per thread.
//!
//! # Quick Start
//!
//! ```ignore
//! use monitor_core::{ClientNode, LockId, LockLevel, ThreadId};
//!
//! let (client, applied) = ClientNode::new(transport, server_id, config.client);
//! tokio::spawn(async move { client.run(shutdown).await });
//!
//! let locks = client.locks().clone();
//! std::thread::spawn(move || {
//!     locks.acquire(&LockId::new("orders"), ThreadId(1), LockLevel::Write)?;
//!     locks.release(&LockId::new("orders"), ThreadId(1))
//! });
//! ```

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

mod client_lock;
pub mod client_lock_manager;
pub mod config;
pub mod deadlock;
pub mod descriptor;
pub mod error;
pub mod failover;
pub mod ids;
pub mod lock_level;
pub mod messages;
pub mod metrics;
pub mod node;
pub mod remote;
pub mod server_lock;
pub mod server_lock_manager;
pub mod sink;
mod sync_compat;
pub mod transaction_store;
pub mod transport;

// Re-exports
pub use client_lock_manager::ClientLockManager;
pub use config::{
    ClientLockConfig, HandoffConfig, LockManagerConfig, LockPolicy, MonitorConfig, SequencerConfig,
};
pub use deadlock::WaitForGraph;
pub use descriptor::GlobalTransactionDescriptor;
pub use error::{MonitorError, Result};
pub use failover::{FailoverHandoff, HandoffPhase, HandoffStats};
pub use ids::{
    GlobalTransactionId, LockId, NodeId, ServerTransactionId, ThreadContext, ThreadId, TransactionId,
    SERVER_NODE_PREFIX,
};
pub use lock_level::{LevelSet, LockLevel};
pub use messages::{HeldContext, LockReport, Message, PendingContext, TimerSpec, WaitContext};
pub use metrics::{LockStats, LockStatsSnapshot, SequencerStats, SequencerStatsSnapshot, TimingStats};
pub use node::{AppliedTransaction, ClientNode, ServerNode};
pub use remote::RemoteLockManager;
pub use server_lock::LockInfo;
pub use server_lock_manager::{ManagerState, ServerLockManager};
pub use sink::{ChannelSink, RecordingSink, ResponseSink};
pub use transaction_store::{StoreTransaction, TransactionStore};
pub use transport::{MemoryTransport, Transport};
