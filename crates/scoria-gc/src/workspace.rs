//! Per-(generation, step) per-thread workspaces.
//!
//! A workspace is the staging area one GC thread uses for one
//! destination step during one collection. Evacuated objects are copied
//! into the `todo` block; a full todo block travels through the one-slot
//! staging cell to the step's shared queue. Blocks whose contents are
//! fully scavenged collect on the local `scavd` list until the end of
//! the collection, so the shared "done" bookkeeping is touched once per
//! thread instead of once per block.
//!
//! A block appears in at most one of scan/todo/staging/queue/scavd at
//! any instant; that single-position rule is what makes evacuation
//! happen at most once per object.

use crate::block::{BlockPool, BlockRef};
use crate::object::{HeapRef, Word};
use crate::queue::{StagingCell, TodoQueue};

/// One thread's staging area for one step.
pub struct Workspace {
    /// Destination generation of this workspace.
    pub gen_no: usize,
    /// Destination step of this workspace.
    pub step_no: usize,
    /// Block currently being scavenged; its cursor lives in the block
    /// header. May be the same block as `todo_bd`.
    pub scan_bd: Option<BlockRef>,
    /// Block currently receiving evacuated objects.
    pub todo_bd: Option<BlockRef>,
    /// One-slot buffer in front of the step's shared queue.
    pub staging: StagingCell,
    /// Large objects claimed for this step, pending in-place scavenge.
    pub todo_large: Vec<HeapRef>,
    /// Fully scavenged blocks, held locally until collection end.
    pub scavd: Vec<BlockRef>,
    /// Scavenged large-object groups, held locally until collection end.
    pub scavd_large: Vec<BlockRef>,
}

impl Workspace {
    /// Creates an empty workspace for destination step
    /// (`gen_no`, `step_no`).
    #[must_use]
    pub fn new(gen_no: usize, step_no: usize) -> Self {
        Self {
            gen_no,
            step_no,
            scan_bd: None,
            todo_bd: None,
            staging: StagingCell::new(),
            todo_large: Vec::new(),
            scavd: Vec::new(),
            scavd_large: Vec::new(),
        }
    }

    /// Allocates `words` words of to-space in this workspace.
    ///
    /// A full todo block is handed to the step's queue through the
    /// staging cell — unless it is also the block currently being
    /// scanned, in which case it stays put and the scan loop finishes
    /// it. Fresh blocks come from the thread's `free` buffer, refilled
    /// from the pool `refill` blocks at a time.
    pub fn alloc(
        &mut self,
        words: usize,
        queue: &TodoQueue,
        free: &mut Vec<BlockRef>,
        pool: &BlockPool,
        refill: usize,
    ) -> *mut Word {
        if let Some(bd) = self.todo_bd {
            if let Some(p) = bd.try_alloc(words) {
                return p;
            }
            self.retire_todo(bd, queue);
        }
        let bd = match free.pop() {
            Some(bd) => bd,
            None => {
                pool.alloc_batch(refill.max(1), free);
                free.pop().expect("pool refill returned no blocks")
            }
        };
        bd.set_step(self.gen_no, self.step_no);
        bd.set_evacuated();
        self.todo_bd = Some(bd);
        bd.try_alloc(words)
            .expect("object exceeds block capacity; should have gone to the large path")
    }

    /// Undoes the most recent [`alloc`](Self::alloc). Called when a
    /// forwarding race is lost and the copy must be discarded.
    pub fn retract_alloc(&mut self, words: usize) {
        self.todo_bd
            .expect("retract without a todo block")
            .retract(words);
    }

    fn retire_todo(&mut self, bd: BlockRef, queue: &TodoQueue) {
        self.todo_bd = None;
        if self.scan_bd == Some(bd) {
            // Partially scanned: the scan loop still owns it and will
            // finish it; pushing it now would give it two owners.
            return;
        }
        if bd.fully_scanned() {
            self.scavd.push(bd);
        } else {
            self.staging.push(queue, bd);
        }
    }

    /// Picks a local block to resume scanning: first the staged block
    /// (full and unscanned), then a partially filled todo block. This is
    /// deliberately the lowest-priority work source.
    #[must_use]
    pub fn local_scan_candidate(&mut self) -> Option<BlockRef> {
        if let Some(bd) = self.staging.take() {
            return Some(bd);
        }
        match self.todo_bd {
            Some(bd) if !bd.fully_scanned() => Some(bd),
            _ => None,
        }
    }

    /// Whether any local scan work remains.
    #[must_use]
    pub fn has_local_work(&self) -> bool {
        if self.staging.is_occupied() || !self.todo_large.is_empty() {
            return true;
        }
        matches!(self.scan_bd, Some(bd) if !bd.fully_scanned())
            || matches!(self.todo_bd, Some(bd) if !bd.fully_scanned())
    }

    /// Drains every block still held here (scan, todo, staged, scavd),
    /// deduplicating the scan/todo overlap. Called when a thread's share
    /// of the round is done; all drained blocks hold live data for the
    /// step. The evacuated flag stays set until the heap reclaims
    /// from-space: the epilogue rescans may still walk these blocks.
    #[must_use]
    pub fn take_blocks(&mut self) -> Vec<BlockRef> {
        let mut out = std::mem::take(&mut self.scavd);
        if let Some(bd) = self.todo_bd.take() {
            debug_assert!(bd.fully_scanned(), "unscanned todo block at flush");
            out.push(bd);
        }
        if let Some(bd) = self.scan_bd.take() {
            debug_assert!(bd.fully_scanned(), "unscanned scan block at flush");
            if !out.contains(&bd) {
                out.push(bd);
            }
        }
        if let Some(bd) = self.staging.take() {
            debug_assert!(bd.fully_scanned(), "unscanned staged block at flush");
            out.push(bd);
        }
        out
    }

    /// Drains the scavenged large-object groups.
    #[must_use]
    pub fn take_large(&mut self) -> Vec<BlockRef> {
        std::mem::take(&mut self.scavd_large)
    }
}

#[cfg(test)]
mod tests {
    use super::Workspace;
    use crate::block::{BlockPool, BF_EVACUATED, BLOCK_HDR_WORDS, BLOCK_WORDS};
    use crate::queue::TodoQueue;

    #[test]
    fn alloc_bumps_within_one_block() {
        let pool = BlockPool::new(None);
        let queue = TodoQueue::new();
        let mut free = Vec::new();
        let mut ws = Workspace::new(0, 1);

        let a = ws.alloc(8, &queue, &mut free, &pool, 4);
        let b = ws.alloc(8, &queue, &mut free, &pool, 4);
        assert_eq!(unsafe { a.add(8) }, b);

        let bd = ws.todo_bd.expect("todo block exists");
        assert_eq!(bd.gen_no(), 0);
        assert_eq!(bd.step_no(), 1);
        assert_eq!(queue.len_hint(), 0);
    }

    #[test]
    fn full_todo_blocks_reach_the_queue_in_pairs() {
        let pool = BlockPool::new(None);
        let queue = TodoQueue::new();
        let mut free = Vec::new();
        let mut ws = Workspace::new(1, 0);

        let cap = BLOCK_WORDS - BLOCK_HDR_WORDS;
        // Fill and overflow three blocks.
        for _ in 0..3 {
            let _ = ws.alloc(cap, &queue, &mut free, &pool, 4);
        }
        // First full block staged, second pushed the pair.
        assert_eq!(queue.len_hint(), 2);
        assert!(!ws.staging.is_occupied());

        let _ = ws.alloc(cap, &queue, &mut free, &pool, 4);
        assert_eq!(queue.len_hint(), 2);
        assert!(ws.staging.is_occupied());
    }

    #[test]
    fn scan_block_is_never_pushed_while_owned() {
        let pool = BlockPool::new(None);
        let queue = TodoQueue::new();
        let mut free = Vec::new();
        let mut ws = Workspace::new(0, 0);

        let cap = BLOCK_WORDS - BLOCK_HDR_WORDS;
        let _ = ws.alloc(cap, &queue, &mut free, &pool, 4);
        ws.scan_bd = ws.todo_bd;

        // Overflowing while the todo block is being scanned keeps it
        // out of the queue.
        let _ = ws.alloc(8, &queue, &mut free, &pool, 4);
        assert_eq!(queue.len_hint(), 0);
        assert!(!ws.staging.is_occupied());
        assert!(ws.scan_bd.is_some());
        assert_ne!(ws.scan_bd, ws.todo_bd);
    }

    #[test]
    fn flushed_blocks_stay_flagged_as_to_space() {
        let pool = BlockPool::new(None);
        let queue = TodoQueue::new();
        let mut free = Vec::new();
        let mut ws = Workspace::new(1, 1);

        let _ = ws.alloc(8, &queue, &mut free, &pool, 4);
        let bd = ws.todo_bd.expect("todo block exists");
        bd.set_scan_off(bd.free_off());
        let blocks = ws.take_blocks();
        assert_eq!(blocks.len(), 1);
        // Flushing must not strip the flag: the round's epilogue still
        // relies on it to tell to-space from from-space.
        assert_ne!(blocks[0].flags() & BF_EVACUATED, 0);
    }

    #[test]
    fn retract_returns_the_space() {
        let pool = BlockPool::new(None);
        let queue = TodoQueue::new();
        let mut free = Vec::new();
        let mut ws = Workspace::new(0, 0);

        let a = ws.alloc(16, &queue, &mut free, &pool, 4);
        ws.retract_alloc(16);
        let b = ws.alloc(16, &queue, &mut free, &pool, 4);
        assert_eq!(a, b);
    }
}
