//! Shared per-step work queues.
//!
//! Each step owns a [`TodoQueue`] of blocks whose contents still need
//! scavenging. The queue is the real cross-thread contention point, so
//! it is paired with a one-slot staging cell in each workspace: a
//! completed todo block parks in the staging cell, and only when a
//! second block completes are both pushed under a single lock
//! acquisition. Keeping the two levels as an explicit abstraction makes
//! the batching behavior independently testable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::block::BlockRef;

/// A lock-protected queue of blocks pending scavenge, with a length
/// mirror readable without the lock.
pub struct TodoQueue {
    shared: Mutex<VecDeque<BlockRef>>,
    len: AtomicUsize,
}

impl TodoQueue {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            shared: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Pushes one block.
    pub fn push(&self, bd: BlockRef) {
        let mut q = self.shared.lock();
        q.push_back(bd);
        self.len.store(q.len(), Ordering::Release);
    }

    /// Pushes two blocks under one lock acquisition. This is the
    /// batched path fed by the staging cell.
    pub fn push_pair(&self, a: BlockRef, b: BlockRef) {
        let mut q = self.shared.lock();
        q.push_back(a);
        q.push_back(b);
        self.len.store(q.len(), Ordering::Release);
    }

    /// Pops one block, oldest first.
    #[must_use]
    pub fn pop(&self) -> Option<BlockRef> {
        let mut q = self.shared.lock();
        let bd = q.pop_front();
        self.len.store(q.len(), Ordering::Release);
        bd
    }

    /// Approximate length without taking the lock. Used by the idle
    /// threads' work probe.
    #[must_use]
    pub fn len_hint(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the queue is (approximately) empty.
    #[must_use]
    pub fn is_empty_hint(&self) -> bool {
        self.len_hint() == 0
    }
}

impl Default for TodoQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The thread-local staging cell in front of a [`TodoQueue`].
///
/// Absorbs one completed block; the next completion pushes both,
/// halving the frequency of queue lock acquisitions.
#[derive(Default)]
pub struct StagingCell {
    slot: Option<BlockRef>,
}

impl StagingCell {
    /// Creates an empty cell.
    #[must_use]
    pub const fn new() -> Self {
        Self { slot: None }
    }

    /// Hands a completed block to the two-level queue.
    pub fn push(&mut self, queue: &TodoQueue, bd: BlockRef) {
        match self.slot.take() {
            None => self.slot = Some(bd),
            Some(staged) => queue.push_pair(staged, bd),
        }
    }

    /// Takes back the staged block, if any. The owner scans it when no
    /// shared work is left, and flushes it at the end of a collection.
    #[must_use]
    pub fn take(&mut self) -> Option<BlockRef> {
        self.slot.take()
    }

    /// Whether a block is currently staged.
    #[must_use]
    pub const fn is_occupied(&self) -> bool {
        self.slot.is_some()
    }
}
