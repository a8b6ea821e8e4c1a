// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Durable record layout for global transaction descriptors.

use serde::{Deserialize, Serialize};

/// One persisted global transaction descriptor.
///
/// The store keys records by `global_id`; the server transaction id
/// (`node_id`, `client_txn_id`) is carried so the in-memory indexes can be
/// rebuilt on restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorRecord {
    /// Node that created the transaction.
    pub node_id: String,
    /// Client-local transaction id.
    pub client_txn_id: u64,
    /// Cluster-wide commit sequence number.
    pub global_id: u64,
    /// Whether the commit has completed on the server.
    pub commit_complete: bool,
}

impl DescriptorRecord {
    pub fn new(node_id: impl Into<String>, client_txn_id: u64, global_id: u64) -> Self {
        Self {
            node_id: node_id.into(),
            client_txn_id,
            global_id,
            commit_complete: false,
        }
    }

    pub fn completed(mut self) -> Self {
        self.commit_complete = true;
        self
    }
}

/// A single mutation buffered inside a persistence transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOp {
    /// Insert or replace the record for `record.global_id`.
    Save(DescriptorRecord),
    /// Remove the records with these global ids.
    Delete(Vec<u64>),
}

impl StoreOp {
    /// Number of records touched by this operation.
    pub fn record_count(&self) -> usize {
        match self {
            StoreOp::Save(_) => 1,
            StoreOp::Delete(ids) => ids.len(),
        }
    }
}
