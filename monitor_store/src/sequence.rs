// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Durable monotonic counters for global transaction id assignment.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::{
    atomic_io::{atomic_write, read_if_exists},
    error::{Result, StoreError},
};

/// A strictly increasing counter that never hands out the same value twice.
pub trait MutableSequence: Send + Sync {
    /// Return the next value and advance.
    fn next(&self) -> Result<u64>;

    /// The value the next call to [`MutableSequence::next`] returns.
    fn current(&self) -> u64;

    /// Move the counter so the next value is at least `next`.
    ///
    /// Moving backwards is a [`StoreError::SequenceRegression`].
    fn set_next(&self, next: u64) -> Result<()>;
}

/// Heap-only sequence starting at 1.
#[derive(Debug)]
pub struct MemorySequence {
    next: Mutex<u64>,
}

impl Default for MemorySequence {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl MemorySequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Mutex::new(first),
        }
    }
}

impl MutableSequence for MemorySequence {
    fn next(&self) -> Result<u64> {
        let mut next = self.next.lock();
        let value = *next;
        *next += 1;
        Ok(value)
    }

    fn current(&self) -> u64 {
        *self.next.lock()
    }

    fn set_next(&self, requested: u64) -> Result<()> {
        let mut next = self.next.lock();
        if requested < *next {
            return Err(StoreError::SequenceRegression {
                current: *next,
                requested,
            });
        }
        *next = requested;
        Ok(())
    }
}

#[derive(Debug)]
struct Reservation {
    next: u64,
    /// Exclusive upper bound persisted on disk.
    reserved_to: u64,
}

/// File-backed sequence that reserves ids in blocks.
///
/// Only the upper bound of the current block is written, so a restart
/// resumes at that bound. Ids handed out before a crash are never reissued;
/// the unused remainder of the block is skipped.
#[derive(Debug)]
pub struct FileSequence {
    path: PathBuf,
    block_size: u64,
    state: Mutex<Reservation>,
}

impl FileSequence {
    pub const DEFAULT_BLOCK_SIZE: u64 = 1000;

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_block_size(path, Self::DEFAULT_BLOCK_SIZE)
    }

    pub fn open_with_block_size(path: impl AsRef<Path>, block_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let start = match read_if_exists(&path)? {
            Some(bytes) => decode_bound(&bytes)?,
            None => 1,
        };
        tracing::debug!(path = %path.display(), start, "sequence opened");

        Ok(Self {
            path,
            block_size: block_size.max(1),
            state: Mutex::new(Reservation {
                next: start,
                reserved_to: start,
            }),
        })
    }

    fn reserve(&self, state: &mut Reservation, min_bound: u64) -> Result<()> {
        let bound = min_bound.max(state.next) + self.block_size;
        atomic_write(&self.path, &bound.to_le_bytes())?;
        state.reserved_to = bound;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn decode_bound(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupted(format!("sequence file has {} bytes", bytes.len())))?;
    Ok(u64::from_le_bytes(raw))
}

impl MutableSequence for FileSequence {
    fn next(&self) -> Result<u64> {
        let mut state = self.state.lock();
        if state.next >= state.reserved_to {
            let from = state.next;
            self.reserve(&mut state, from)?;
        }
        let value = state.next;
        state.next += 1;
        Ok(value)
    }

    fn current(&self) -> u64 {
        self.state.lock().next
    }

    fn set_next(&self, requested: u64) -> Result<()> {
        let mut state = self.state.lock();
        if requested < state.next {
            return Err(StoreError::SequenceRegression {
                current: state.next,
                requested,
            });
        }
        if requested >= state.reserved_to {
            self.reserve(&mut state, requested)?;
        }
        state.next = requested;
        Ok(())
    }
}
