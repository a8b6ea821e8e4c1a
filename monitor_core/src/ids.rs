// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Opaque identifiers shared by every component.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Cluster member identity, stable for the lifetime of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of one distributed lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(pub String);

impl LockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Virtual thread identity, scoped to one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// The node-wide thread that owns greedy grants.
    pub const VM: ThreadId = ThreadId(0);

    pub fn is_vm(self) -> bool {
        self == Self::VM
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_vm() {
            f.write_str("vm")
        } else {
            write!(f, "t{}", self.0)
        }
    }
}

/// Lock ownership scope: a thread on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadContext {
    pub node: NodeId,
    pub thread: ThreadId,
}

impl ThreadContext {
    pub fn new(node: NodeId, thread: ThreadId) -> Self {
        Self { node, thread }
    }

    /// The greedy (node-wide) context for the same node.
    pub fn vm(&self) -> Self {
        Self {
            node: self.node.clone(),
            thread: ThreadId::VM,
        }
    }

    pub fn is_vm(&self) -> bool {
        self.thread.is_vm()
    }
}

impl fmt::Display for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.thread)
    }
}

/// Client-local transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Globally unique, but not globally ordered, transaction identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerTransactionId {
    pub node: NodeId,
    pub txn: TransactionId,
}

impl ServerTransactionId {
    pub fn new(node: impl Into<NodeId>, txn: u64) -> Self {
        Self {
            node: node.into(),
            txn: TransactionId(txn),
        }
    }

    /// Server-generated transactions carry no client to acknowledge.
    pub fn is_server_generated(&self) -> bool {
        self.node.0.starts_with(SERVER_NODE_PREFIX)
    }
}

impl fmt::Display for ServerTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.txn.0)
    }
}

/// Node ids with this prefix identify servers rather than clients.
pub const SERVER_NODE_PREFIX: &str = "server-";

/// Cluster-wide commit order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalTransactionId(pub u64);

impl fmt::Display for GlobalTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gid:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_context() {
        let ctx = ThreadContext::new(NodeId::new("a"), ThreadId(7));
        assert!(!ctx.is_vm());
        let vm = ctx.vm();
        assert!(vm.is_vm());
        assert_eq!(vm.node, ctx.node);
        assert_eq!(vm.to_string(), "a/vm");
        assert_eq!(ctx.to_string(), "a/t7");
    }

    #[test]
    fn test_server_generated() {
        assert!(ServerTransactionId::new("server-1", 3).is_server_generated());
        assert!(!ServerTransactionId::new("client-1", 3).is_server_generated());
    }

    #[test]
    fn test_server_txn_ordering_within_node() {
        let a = ServerTransactionId::new("n", 1);
        let b = ServerTransactionId::new("n", 2);
        assert!(a < b);
        assert_eq!(a.to_string(), "n:1");
    }
}
