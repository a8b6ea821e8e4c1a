// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Message transport between cluster members.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::{MonitorError, Result};
use crate::ids::NodeId;
use crate::messages::Message;

const CHANNEL_CAPACITY: usize = 4096;

type Frame = (NodeId, Vec<u8>);

/// Transport trait for network communication.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, to: &NodeId, msg: Message) -> Result<()>;

    async fn broadcast(&self, msg: Message) -> Result<()>;

    async fn recv(&self) -> Result<(NodeId, Message)>;

    async fn disconnect(&self, peer_id: &NodeId) -> Result<()>;

    fn peers(&self) -> Vec<NodeId>;

    fn local_id(&self) -> &NodeId;
}

/// In-memory transport for testing with partition injection support.
///
/// Messages cross the channel as encoded frames, so every hop goes through
/// the wire codec.
pub struct MemoryTransport {
    local_id: NodeId,
    receiver: AsyncMutex<mpsc::Receiver<Frame>>,
    peers: RwLock<HashMap<NodeId, mpsc::Sender<Frame>>>,
    /// Sender for this node (given to peers).
    local_sender: mpsc::Sender<Frame>,
    /// Messages to these nodes are dropped.
    partitioned: RwLock<HashSet<NodeId>>,
    dropped_messages: AtomicU64,
}

impl MemoryTransport {
    pub fn new(local_id: NodeId) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            local_id,
            receiver: AsyncMutex::new(rx),
            peers: RwLock::new(HashMap::new()),
            local_sender: tx,
            partitioned: RwLock::new(HashSet::new()),
            dropped_messages: AtomicU64::new(0),
        }
    }

    pub fn connect_to(&self, other_id: NodeId, sender: mpsc::Sender<Frame>) {
        tracing::debug!(local_id = %self.local_id, peer_id = %other_id, "Peer connected");
        self.peers.write().insert(other_id, sender);
    }

    /// Connect two transports in both directions.
    pub fn link(a: &MemoryTransport, b: &MemoryTransport) {
        a.connect_to(b.local_id.clone(), b.local_sender.clone());
        b.connect_to(a.local_id.clone(), a.local_sender.clone());
    }

    /// Simulate a network partition: messages to this peer are dropped.
    pub fn partition(&self, peer_id: &NodeId) {
        tracing::info!(local_id = %self.local_id, peer_id = %peer_id, "Network partition simulated");
        self.partitioned.write().insert(peer_id.clone());
    }

    pub fn heal(&self, peer_id: &NodeId) {
        tracing::info!(local_id = %self.local_id, peer_id = %peer_id, "Network partition healed");
        self.partitioned.write().remove(peer_id);
    }

    pub fn is_partitioned(&self, peer_id: &NodeId) -> bool {
        self.partitioned.read().contains(peer_id)
    }

    pub fn dropped_message_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    fn sender_for(&self, to: &NodeId) -> Result<mpsc::Sender<Frame>> {
        if self.partitioned.read().contains(to) {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(from = %self.local_id, to = %to, "Message dropped: network partition");
            return Err(MonitorError::Network(format!(
                "network partition: {} -> {}",
                self.local_id, to
            )));
        }
        self.peers
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| MonitorError::Network(format!("peer not found: {to}")))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &NodeId, msg: Message) -> Result<()> {
        let sender = self.sender_for(to)?;
        let frame = msg.encode()?;
        sender
            .send((self.local_id.clone(), frame))
            .await
            .map_err(|e| MonitorError::Network(e.to_string()))
    }

    async fn broadcast(&self, msg: Message) -> Result<()> {
        let frame = msg.encode()?;
        let senders: Vec<_> = {
            let partitioned = self.partitioned.read();
            self.peers
                .read()
                .iter()
                .filter(|(id, _)| !partitioned.contains(*id))
                .map(|(_, sender)| sender.clone())
                .collect()
        };
        for sender in senders {
            let _ = sender.send((self.local_id.clone(), frame.clone())).await;
        }
        Ok(())
    }

    async fn recv(&self) -> Result<(NodeId, Message)> {
        let (from, frame) = self
            .receiver
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| MonitorError::Disconnected(format!("{} inbox closed", self.local_id)))?;
        match Message::decode(&frame)? {
            Some((msg, _)) => Ok((from, msg)),
            None => Err(MonitorError::Serialization(format!(
                "truncated frame from {from}"
            ))),
        }
    }

    async fn disconnect(&self, peer_id: &NodeId) -> Result<()> {
        tracing::debug!(local_id = %self.local_id, peer_id = %peer_id, "Peer disconnected");
        self.peers.write().remove(peer_id);
        Ok(())
    }

    fn peers(&self) -> Vec<NodeId> {
        self.peers.read().keys().cloned().collect()
    }

    fn local_id(&self) -> &NodeId {
        &self.local_id
    }
}
