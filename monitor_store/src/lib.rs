// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Persistence for the cluster monitor coordinator.
//!
//! The coordinator never talks to a storage engine directly. It opens a
//! [`PersistenceTx`] on a [`TransactionPersistor`], buffers descriptor saves
//! and deletes into it, and commits or aborts the whole batch.
//!
//! ```text
//! TransactionPersistor
//!   ├── MemoryPersistor (heap, failure injection)
//!   └── WalPersistor    (append-only log + checkpoint)
//! MutableSequence
//!   ├── MemorySequence
//!   └── FileSequence    (block reservations)
//! ```

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod atomic_io;
pub mod error;
pub mod persistor;
pub mod record;
pub mod sequence;
pub mod transaction;
pub mod wal;

pub use atomic_io::{atomic_write, AtomicIoError};
pub use error::{Result, StoreError};
pub use persistor::{MemoryPersistor, TransactionPersistor};
pub use record::{DescriptorRecord, StoreOp};
pub use sequence::{FileSequence, MemorySequence, MutableSequence};
pub use transaction::{Journal, PersistenceTx};
pub use wal::WalPersistor;
