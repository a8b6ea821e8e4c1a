// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Wire messages exchanged between client nodes and the primary server.
//!
//! Frame format:
//! ```text
//! +------------------+-------------------+
//! | Length (4B BE)   | Payload (bincode) |
//! +------------------+-------------------+
//! ```
//!
//! The sending node is not part of the payload; the transport supplies it.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, Result};
use crate::ids::{GlobalTransactionId, LockId, NodeId, ServerTransactionId, ThreadId, TransactionId};
use crate::lock_level::{LevelSet, LockLevel};

/// Largest accepted frame payload.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// How long a wait may park.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerSpec {
    Indefinite,
    Millis(u64),
}

impl TimerSpec {
    pub fn from_duration(timeout: Option<Duration>) -> Self {
        match timeout {
            None => TimerSpec::Indefinite,
            Some(d) => TimerSpec::Millis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    pub fn is_indefinite(&self) -> bool {
        matches!(self, TimerSpec::Indefinite)
    }

    pub fn deadline_from(&self, now: Instant) -> Option<Instant> {
        match self {
            TimerSpec::Indefinite => None,
            TimerSpec::Millis(ms) => Some(now + Duration::from_millis(*ms)),
        }
    }

    /// Time left until `deadline`, expressed as a new timer.
    pub fn remaining(deadline: Option<Instant>, now: Instant) -> Self {
        match deadline {
            None => TimerSpec::Indefinite,
            Some(d) => TimerSpec::from_duration(Some(d.saturating_duration_since(now))),
        }
    }
}

/// A thread's hold, as the server levels it was granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldContext {
    pub thread: ThreadId,
    pub levels: LevelSet,
}

/// A thread parked in a distributed wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitContext {
    pub thread: ThreadId,
    pub timer: TimerSpec,
}

/// A request not yet granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingContext {
    pub thread: ThreadId,
    pub level: LockLevel,
    /// `Some` for try-lock requests, carrying the time still left.
    pub try_timeout_ms: Option<u64>,
}

/// Everything one node knows about one lock.
///
/// Sent as a recall commit, and per lock during a failover handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockReport {
    pub lock_id: LockId,
    pub held: Vec<HeldContext>,
    pub waiting: Vec<WaitContext>,
    pub pending: Vec<PendingContext>,
}

impl LockReport {
    pub fn new(lock_id: LockId) -> Self {
        Self {
            lock_id,
            held: Vec::new(),
            waiting: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Number of entries the server re-admits for this report.
    pub fn entry_count(&self) -> usize {
        self.held.len() + self.waiting.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }
}

/// Messages of the lock and commit protocols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // Client to server: locking
    LockRequest {
        lock_id: LockId,
        thread: ThreadId,
        level: LockLevel,
    },
    /// Refused instead of queued if not grantable within `timeout_ms` (0 = immediately).
    TryLockRequest {
        lock_id: LockId,
        thread: ThreadId,
        level: LockLevel,
        timeout_ms: u64,
    },
    Unlock {
        lock_id: LockId,
        thread: ThreadId,
    },
    WaitRequest {
        lock_id: LockId,
        thread: ThreadId,
        timer: TimerSpec,
    },
    Notify {
        lock_id: LockId,
        thread: ThreadId,
        all: bool,
    },
    Interrupt {
        lock_id: LockId,
        thread: ThreadId,
    },
    RecallCommit(LockReport),

    // Server to client: locking
    LockAward {
        lock_id: LockId,
        thread: ThreadId,
        level: LockLevel,
        greedy: bool,
    },
    LockRefused {
        lock_id: LockId,
        thread: ThreadId,
        level: LockLevel,
    },
    LockRecall {
        lock_id: LockId,
    },
    /// The waiter was moved to pending by a notify.
    Notified {
        lock_id: LockId,
        thread: ThreadId,
    },
    WaitTimeout {
        lock_id: LockId,
        thread: ThreadId,
    },

    // Failover
    /// A new primary asks every client for its lock state.
    HandoffStart {
        epoch: u64,
    },
    Handshake {
        epoch: u64,
        reports: Vec<LockReport>,
    },
    HandshakeAck {
        epoch: u64,
    },

    // Commit ordering
    CommitTransaction {
        txn: ServerTransactionId,
        changes: Vec<u8>,
    },
    /// Sent to the committing client once the global id is durable.
    CommitComplete {
        txn: ServerTransactionId,
        global_id: GlobalTransactionId,
    },
    /// Sent to every other client that must apply the change.
    TransactionBroadcast {
        txn: ServerTransactionId,
        global_id: GlobalTransactionId,
        changes: Vec<u8>,
    },
    CommitAck {
        global_id: GlobalTransactionId,
        node: NodeId,
    },
    /// The client no longer needs its transactions below this id.
    ClientLowWaterMark {
        below: TransactionId,
    },

    /// Orderly client shutdown.
    Goodbye,
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::LockRequest { .. } => "LockRequest",
            Message::TryLockRequest { .. } => "TryLockRequest",
            Message::Unlock { .. } => "Unlock",
            Message::WaitRequest { .. } => "WaitRequest",
            Message::Notify { .. } => "Notify",
            Message::Interrupt { .. } => "Interrupt",
            Message::RecallCommit(_) => "RecallCommit",
            Message::LockAward { .. } => "LockAward",
            Message::LockRefused { .. } => "LockRefused",
            Message::LockRecall { .. } => "LockRecall",
            Message::Notified { .. } => "Notified",
            Message::WaitTimeout { .. } => "WaitTimeout",
            Message::HandoffStart { .. } => "HandoffStart",
            Message::Handshake { .. } => "Handshake",
            Message::HandshakeAck { .. } => "HandshakeAck",
            Message::CommitTransaction { .. } => "CommitTransaction",
            Message::CommitComplete { .. } => "CommitComplete",
            Message::TransactionBroadcast { .. } => "TransactionBroadcast",
            Message::CommitAck { .. } => "CommitAck",
            Message::ClientLowWaterMark { .. } => "ClientLowWaterMark",
            Message::Goodbye => "Goodbye",
        }
    }

    /// The lock a locking message refers to.
    pub fn lock_id(&self) -> Option<&LockId> {
        match self {
            Message::LockRequest { lock_id, .. }
            | Message::TryLockRequest { lock_id, .. }
            | Message::Unlock { lock_id, .. }
            | Message::WaitRequest { lock_id, .. }
            | Message::Notify { lock_id, .. }
            | Message::Interrupt { lock_id, .. }
            | Message::LockAward { lock_id, .. }
            | Message::LockRefused { lock_id, .. }
            | Message::LockRecall { lock_id }
            | Message::Notified { lock_id, .. }
            | Message::WaitTimeout { lock_id, .. } => Some(lock_id),
            Message::RecallCommit(report) => Some(&report.lock_id),
            _ => None,
        }
    }

    /// Encode into a length-prefixed frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|_| payload.len() <= MAX_FRAME_LENGTH)
            .ok_or_else(|| {
                MonitorError::Serialization(format!(
                    "frame of {} bytes exceeds {MAX_FRAME_LENGTH}",
                    payload.len()
                ))
            })?;
        let mut frame = Vec::with_capacity(LENGTH_PREFIX + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete, otherwise the message
    /// and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>> {
        let Some(prefix) = buf.get(..LENGTH_PREFIX) else {
            return Ok(None);
        };
        let mut len_bytes = [0u8; LENGTH_PREFIX];
        len_bytes.copy_from_slice(prefix);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LENGTH {
            return Err(MonitorError::Serialization(format!(
                "frame of {len} bytes exceeds {MAX_FRAME_LENGTH}"
            )));
        }
        let Some(payload) = buf.get(LENGTH_PREFIX..LENGTH_PREFIX + len) else {
            return Ok(None);
        };
        let msg = bincode::deserialize(payload)?;
        Ok(Some((msg, LENGTH_PREFIX + len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recall_commit() -> Message {
        let mut report = LockReport::new(LockId::new("L"));
        report.held.push(HeldContext {
            thread: ThreadId(3),
            levels: LevelSet::of(LockLevel::Write),
        });
        report.waiting.push(WaitContext {
            thread: ThreadId(4),
            timer: TimerSpec::Millis(250),
        });
        report.pending.push(PendingContext {
            thread: ThreadId(5),
            level: LockLevel::Read,
            try_timeout_ms: Some(10),
        });
        Message::RecallCommit(report)
    }

    #[test]
    fn test_frame_roundtrip() {
        let msg = recall_commit();
        let frame = msg.encode().unwrap();
        let (decoded, used) = Message::decode(&frame).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(used, frame.len());
    }

    #[test]
    fn test_decode_partial_frame() {
        let frame = Message::Goodbye.encode().unwrap();
        assert!(Message::decode(&frame[..2]).unwrap().is_none());
        assert!(Message::decode(&frame[..frame.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let a = Message::LockRecall {
            lock_id: LockId::new("a"),
        };
        let b = Message::Unlock {
            lock_id: LockId::new("b"),
            thread: ThreadId(1),
        };
        let mut buf = a.encode().unwrap();
        buf.extend(b.encode().unwrap());

        let (first, used) = Message::decode(&buf).unwrap().unwrap();
        assert_eq!(first, a);
        let (second, _) = Message::decode(&buf[used..]).unwrap().unwrap();
        assert_eq!(second, b);
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut buf = (MAX_FRAME_LENGTH as u32 + 1).to_be_bytes().to_vec();
        buf.extend_from_slice(&[0; 8]);
        assert!(matches!(
            Message::decode(&buf),
            Err(MonitorError::Serialization(_))
        ));
    }

    #[test]
    fn test_report_entry_count() {
        let Message::RecallCommit(report) = recall_commit() else {
            unreachable!()
        };
        assert_eq!(report.entry_count(), 3);
        assert!(!report.is_empty());
        assert_eq!(recall_commit().lock_id(), Some(&LockId::new("L")));
    }

    #[test]
    fn test_timer_remaining() {
        let now = Instant::now();
        let spec = TimerSpec::Millis(100);
        let deadline = spec.deadline_from(now);
        assert_eq!(
            TimerSpec::remaining(deadline, now + Duration::from_millis(40)),
            TimerSpec::Millis(60)
        );
        assert_eq!(
            TimerSpec::remaining(deadline, now + Duration::from_secs(1)),
            TimerSpec::Millis(0)
        );
        assert_eq!(TimerSpec::remaining(None, now), TimerSpec::Indefinite);
    }
}
