// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Error types for monitor_store.

use thiserror::Error;

/// Result type for monitor_store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while persisting coordinator state.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The transaction belongs to a different persistor.
    #[error("persistence transaction {tx_id} does not belong to journal {journal}")]
    ForeignTransaction { tx_id: u64, journal: String },

    /// Commit was rejected by the backend; nothing from the batch was applied.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// A durable sequence was asked to move backwards.
    #[error("sequence cannot move backwards: current {current}, requested {requested}")]
    SequenceRegression { current: u64, requested: u64 },

    /// The on-disk state is not readable.
    #[error("corrupted store: {0}")]
    Corrupted(String),
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<crate::atomic_io::AtomicIoError> for StoreError {
    fn from(err: crate::atomic_io::AtomicIoError) -> Self {
        StoreError::Io(err.into())
    }
}
