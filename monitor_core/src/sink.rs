// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Where server-side components deliver the messages they produce.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::ids::NodeId;
use crate::messages::Message;

/// Receives messages addressed to client nodes.
///
/// Called after the producing component has released its internal lock, so
/// an implementation may call back into that component.
pub trait ResponseSink: Send + Sync {
    fn deliver(&self, to: &NodeId, msg: Message);
}

/// Forwards to an unbounded channel drained by the server's network loop.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(NodeId, Message)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(NodeId, Message)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ResponseSink for ChannelSink {
    fn deliver(&self, to: &NodeId, msg: Message) {
        if self.tx.send((to.clone(), msg)).is_err() {
            warn!(to = %to, "Response dropped: outbound channel closed");
        }
    }
}

/// Keeps every delivered message in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<(NodeId, Message)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything delivered so far.
    pub fn take(&self) -> Vec<(NodeId, Message)> {
        std::mem::take(&mut *self.messages.lock())
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

impl ResponseSink for RecordingSink {
    fn deliver(&self, to: &NodeId, msg: Message) {
        self.messages.lock().push((to.clone(), msg));
    }
}
