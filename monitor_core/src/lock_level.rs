// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Lock levels and level sets.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Requested mode of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockLevel {
    /// Shared; any number of readers with no writer.
    Read,
    /// Exclusive.
    Write,
    /// Unordered concurrent access; never conflicts and never queues.
    Concurrent,
}

impl LockLevel {
    pub fn is_read(self) -> bool {
        self == LockLevel::Read
    }

    pub fn is_write(self) -> bool {
        self == LockLevel::Write
    }

    pub fn is_concurrent(self) -> bool {
        self == LockLevel::Concurrent
    }

    pub fn name(self) -> &'static str {
        match self {
            LockLevel::Read => "READ",
            LockLevel::Write => "WRITE",
            LockLevel::Concurrent => "CONCURRENT",
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The READ/WRITE components one context holds at once.
///
/// Both are set while an upgrade is held: the original READ plus the
/// WRITE granted on top of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LevelSet {
    read: bool,
    write: bool,
}

impl LevelSet {
    pub const EMPTY: LevelSet = LevelSet {
        read: false,
        write: false,
    };

    pub fn of(level: LockLevel) -> Self {
        let mut set = Self::EMPTY;
        set.add(level);
        set
    }

    /// Add a component. CONCURRENT has no server-visible component.
    pub fn add(&mut self, level: LockLevel) {
        match level {
            LockLevel::Read => self.read = true,
            LockLevel::Write => self.write = true,
            LockLevel::Concurrent => {},
        }
    }

    pub fn remove(&mut self, level: LockLevel) {
        match level {
            LockLevel::Read => self.read = false,
            LockLevel::Write => self.write = false,
            LockLevel::Concurrent => {},
        }
    }

    pub fn contains(&self, level: LockLevel) -> bool {
        match level {
            LockLevel::Read => self.read,
            LockLevel::Write => self.write,
            LockLevel::Concurrent => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.read && !self.write
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    /// READ only, no WRITE.
    pub fn is_read_only(&self) -> bool {
        self.read && !self.write
    }

    /// READ with WRITE granted on top of it.
    pub fn is_upgrade(&self) -> bool {
        self.read && self.write
    }

    /// The strongest component, used when re-expressing a hold as a request.
    pub fn strongest(&self) -> Option<LockLevel> {
        if self.write {
            Some(LockLevel::Write)
        } else if self.read {
            Some(LockLevel::Read)
        } else {
            None
        }
    }

    /// Components in grant order: READ before WRITE.
    pub fn levels(&self) -> impl Iterator<Item = LockLevel> {
        let read = self.read.then_some(LockLevel::Read);
        let write = self.write.then_some(LockLevel::Write);
        read.into_iter().chain(write)
    }
}

impl fmt::Display for LevelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (false, false) => f.write_str("NIL"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (true, true) => f.write_str("READ|WRITE"),
        }
    }
}
