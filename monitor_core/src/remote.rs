// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Client-side handle for sending lock traffic to the primary server.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::warn;

use crate::messages::Message;

/// Non-blocking, ordered channel to the server.
///
/// Application threads push into it while holding a lock's mutex, which keeps
/// the per-lock message order; the client node's network loop drains it.
#[derive(Debug)]
pub struct RemoteLockManager {
    tx: mpsc::UnboundedSender<Message>,
    sent: AtomicU64,
}

impl RemoteLockManager {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                sent: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn send(&self, msg: Message) {
        let type_name = msg.type_name();
        if self.tx.send(msg).is_err() {
            warn!(msg_type = type_name, "Server link closed, message dropped");
            return;
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_counts() {
        let (remote, mut rx) = RemoteLockManager::new();
        remote.send(Message::Goodbye);
        assert_eq!(remote.sent_count(), 1);
        assert_eq!(rx.try_recv().unwrap(), Message::Goodbye);
    }

    #[test]
    fn test_closed_link_not_counted() {
        let (remote, rx) = RemoteLockManager::new();
        drop(rx);
        remote.send(Message::Goodbye);
        assert_eq!(remote.sent_count(), 0);
    }
}
