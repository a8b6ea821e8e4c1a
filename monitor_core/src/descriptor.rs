// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Global transaction descriptors.

use std::collections::BTreeSet;

use monitor_store::DescriptorRecord;
use serde::{Deserialize, Serialize};

use crate::ids::{GlobalTransactionId, NodeId, ServerTransactionId};

/// Binds a client transaction to its place in the global commit order and
/// tracks which nodes still have to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalTransactionDescriptor {
    server_txn: ServerTransactionId,
    global_id: GlobalTransactionId,
    commit_complete: bool,
    awaiting: BTreeSet<NodeId>,
}

impl GlobalTransactionDescriptor {
    pub fn new(server_txn: ServerTransactionId, global_id: GlobalTransactionId) -> Self {
        Self {
            server_txn,
            global_id,
            commit_complete: false,
            awaiting: BTreeSet::new(),
        }
    }

    /// Acknowledgements are not persisted; a reloaded descriptor awaits none.
    pub fn from_record(record: &DescriptorRecord) -> Self {
        Self {
            server_txn: ServerTransactionId::new(record.node_id.as_str(), record.client_txn_id),
            global_id: GlobalTransactionId(record.global_id),
            commit_complete: record.commit_complete,
            awaiting: BTreeSet::new(),
        }
    }

    pub fn to_record(&self) -> DescriptorRecord {
        DescriptorRecord {
            node_id: self.server_txn.node.0.clone(),
            client_txn_id: self.server_txn.txn.0,
            global_id: self.global_id.0,
            commit_complete: self.commit_complete,
        }
    }

    pub fn server_txn(&self) -> &ServerTransactionId {
        &self.server_txn
    }

    pub fn global_id(&self) -> GlobalTransactionId {
        self.global_id
    }

    pub fn is_commit_complete(&self) -> bool {
        self.commit_complete
    }

    pub fn awaiting(&self) -> &BTreeSet<NodeId> {
        &self.awaiting
    }

    /// Mark the commit done; every node in `awaiting` must acknowledge it.
    pub fn complete(&mut self, awaiting: impl IntoIterator<Item = NodeId>) {
        self.commit_complete = true;
        self.awaiting.extend(awaiting);
    }

    /// Returns whether `node` was still expected.
    pub fn acknowledge(&mut self, node: &NodeId) -> bool {
        self.awaiting.remove(node)
    }

    /// Committed and acknowledged by everyone it was sent to.
    pub fn is_settled(&self) -> bool {
        self.commit_complete && self.awaiting.is_empty()
    }

    /// Take over the progress another descriptor made for the same
    /// transaction under a different global id.
    pub fn save_state_from(&mut self, other: &GlobalTransactionDescriptor) {
        self.commit_complete |= other.commit_complete;
        self.awaiting.extend(other.awaiting.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settles_after_all_acks() {
        let mut desc = GlobalTransactionDescriptor::new(ServerTransactionId::new("x", 1), GlobalTransactionId(1));
        assert!(!desc.is_settled());
        desc.complete([NodeId::new("y"), NodeId::new("z")]);
        assert!(desc.acknowledge(&NodeId::new("y")));
        assert!(!desc.acknowledge(&NodeId::new("y")));
        assert!(!desc.is_settled());
        desc.acknowledge(&NodeId::new("z"));
        assert!(desc.is_settled());
    }

    #[test]
    fn test_record_keeps_identity() {
        let mut desc = GlobalTransactionDescriptor::new(ServerTransactionId::new("x", 7), GlobalTransactionId(42));
        desc.complete([NodeId::new("y")]);
        let back = GlobalTransactionDescriptor::from_record(&desc.to_record());
        assert_eq!(back.server_txn(), desc.server_txn());
        assert_eq!(back.global_id(), GlobalTransactionId(42));
        assert!(back.is_settled());
    }

    #[test]
    fn test_save_state_from_merges_progress() {
        let mut old = GlobalTransactionDescriptor::new(ServerTransactionId::new("x", 1), GlobalTransactionId(3));
        old.complete([NodeId::new("y")]);
        let mut new = GlobalTransactionDescriptor::new(ServerTransactionId::new("x", 1), GlobalTransactionId(5));
        new.save_state_from(&old);
        assert!(new.is_commit_complete());
        assert!(new.awaiting().contains(&NodeId::new("y")));
        assert_eq!(new.global_id(), GlobalTransactionId(5));
    }
}
