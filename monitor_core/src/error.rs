// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Error types for monitor_core.

use monitor_store::StoreError;
use thiserror::Error;

/// Result type for monitor_core operations.
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors that can occur in lock management and transaction sequencing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MonitorError {
    /// Monitor protocol violation by the caller (wait/notify/unlock without the lock).
    #[error("illegal monitor state: {0}")]
    IllegalMonitorState(String),

    /// Operation not valid in the lock manager's current lifecycle state.
    #[error("lock manager is {state}: {operation} not allowed")]
    LockManagerState {
        state: &'static str,
        operation: &'static str,
    },

    /// No state exists for the named lock.
    #[error("unknown lock: {0}")]
    UnknownLock(String),

    /// The node or its server connection is gone.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// A parked thread was interrupted.
    #[error("interrupted while waiting on {0}")]
    Interrupted(String),

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Persistence collaborator failure.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// A global transaction id was about to be assigned twice outside failover.
    #[error("global transaction id {global_id} already bound to {existing}, refusing {requested}")]
    DuplicateGlobalTransactionId {
        global_id: u64,
        existing: String,
        requested: String,
    },

    /// Failover hand-off could not complete.
    #[error("handoff error: {0}")]
    Handoff(String),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),
}

impl From<bincode::Error> for MonitorError {
    fn from(err: bincode::Error) -> Self {
        MonitorError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(err: std::io::Error) -> Self {
        MonitorError::Storage(StoreError::Io(err))
    }
}
