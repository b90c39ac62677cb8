//! Scavenging: tracing the fields of evacuated objects.
//!
//! A to-space block is scanned from its scan cursor to its fill point,
//! evacuating everything its objects reference; copies land in the same
//! thread's workspaces, so the scan chases the wavefront until the
//! whole reachable graph has moved. `do_some_work` orders the work
//! sources; `work_loop` runs them to global termination, detected by
//! counting idle threads with one recheck before declaring the round
//! over.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::utils::Backoff;

use crate::block::BlockRef;
use crate::object::{HeapRef, ObjKind};
use crate::thread::GcThread;

impl GcThread {
    /// Evacuates every reference field of `obj` in place, leaving
    /// `failed_to_evac` set when some referent could not reach
    /// `evac_gen`.
    fn scavenge_fields(&mut self, obj: HeapRef) {
        self.failed_to_evac = false;
        let ptrs = obj.info().ptrs as usize;
        for i in 0..ptrs {
            if let Some(field) = obj.ref_field(i) {
                let to = self.evacuate(field);
                if to != field {
                    obj.set_ref_field(i, Some(to));
                }
            }
        }
    }

    /// Scans a to-space block from its cursor to its fill point. The
    /// fill point is re-read every iteration: when the block is also
    /// the thread's todo block, scavenging grows it underneath us.
    fn scavenge_block(&mut self, bd: BlockRef) {
        let heap = Arc::clone(&self.heap);
        let g = bd.gen_no();
        self.evac_gen = g;
        self.eager_promotion = false;
        loop {
            let scan = bd.scan_off();
            if scan >= bd.free_off() {
                break;
            }
            // SAFETY: the scan cursor stays below the fill point, which
            // bounds the initialized words of the block.
            let p = unsafe { bd.base().add(scan) };
            let obj = HeapRef::from_ptr(p);
            let size = obj.info().size_words();
            self.scavenge_fields(obj);
            if self.failed_to_evac {
                heap.gens[g].mut_list.lock().push(obj);
            }
            bd.set_scan_off(scan + size);
        }
    }

    /// Scavenges a large object in place and re-lists its group on the
    /// destination step.
    fn scavenge_large(&mut self, obj: HeapRef) {
        let heap = Arc::clone(&self.heap);
        let bd = BlockRef::of_object(obj.as_ptr());
        let g = bd.gen_no();
        self.evac_gen = g;
        self.eager_promotion = false;
        self.scavenge_fields(obj);
        if self.failed_to_evac {
            heap.gens[g].mut_list.lock().push(obj);
        }
        let ix = self.ws_index(g, bd.step_no());
        self.workspaces[ix].scavd_large.push(bd);
    }

    /// Scavenges one remembered set. Referents are promoted eagerly to
    /// the owning generation so the entry can usually be dropped; a
    /// referent that could not be promoted keeps the entry alive.
    pub(crate) fn scavenge_mut_list(&mut self, g: usize) {
        let heap = Arc::clone(&self.heap);
        let entries = std::mem::take(&mut *heap.gens[g].mut_list.lock());
        self.evac_gen = g;
        self.evac_dest = (g, 0);
        self.eager_promotion = true;
        for obj in entries {
            // Per-kind accounting is diagnostic-build only.
            if cfg!(debug_assertions) {
                match obj.info().kind {
                    ObjKind::MutVar => self.stats.mutlist.mut_vars += 1,
                    ObjKind::Array => self.stats.mutlist.arrays += 1,
                    _ => self.stats.mutlist.others += 1,
                }
            }
            self.scavenge_fields(obj);
            if self.failed_to_evac {
                heap.gens[g].mut_list.lock().push(obj);
            }
        }
        self.eager_promotion = false;
    }

    fn scavenge_static(&mut self, obj: HeapRef) {
        self.evac_gen = 0;
        self.eager_promotion = false;
        self.scavenge_fields(obj);
    }

    /// Scavenges an object marked in place in the oldest generation.
    fn scavenge_marked(&mut self, obj: HeapRef) {
        let heap = Arc::clone(&self.heap);
        let g = heap.collect_gen.load(Ordering::Acquire);
        self.evac_gen = g;
        self.eager_promotion = false;
        self.scavenge_fields(obj);
        if self.failed_to_evac {
            heap.gens[g].mut_list.lock().push(obj);
        }
    }

    fn finish_scan(&mut self, ix: usize) {
        let ws = &mut self.workspaces[ix];
        if let Some(bd) = ws.scan_bd.take() {
            if ws.todo_bd != Some(bd) {
                ws.scavd.push(bd);
            }
        }
    }

    /// Performs one unit of work. Sources in priority order: local
    /// scan blocks and claimed large objects, discovered statics, the
    /// mark stack, the shared step queues, and last the thread's own
    /// partially filled blocks.
    pub(crate) fn do_some_work(&mut self) -> bool {
        let heap = Arc::clone(&self.heap);

        for ix in 0..self.workspaces.len() {
            if let Some(obj) = self.workspaces[ix].todo_large.pop() {
                self.scavenge_large(obj);
                return true;
            }
            if let Some(bd) = self.workspaces[ix].scan_bd {
                if !bd.fully_scanned() {
                    self.scavenge_block(bd);
                    self.finish_scan(ix);
                    return true;
                }
                self.finish_scan(ix);
            }
        }

        if let Some(obj) = heap.pop_static_todo() {
            self.scavenge_static(obj);
            return true;
        }

        if let Some(obj) = heap.mark_stack.pop() {
            self.scavenge_marked(obj);
            return true;
        }

        for gen in &heap.gens {
            for step in &gen.steps {
                if let Some(bd) = step.queue.pop() {
                    let ix = self.ws_index(gen.no, step.no);
                    debug_assert!(self.workspaces[ix].scan_bd.is_none());
                    self.workspaces[ix].scan_bd = Some(bd);
                    return true;
                }
            }
        }

        for ix in 0..self.workspaces.len() {
            if let Some(bd) = self.workspaces[ix].local_scan_candidate() {
                self.workspaces[ix].scan_bd = Some(bd);
                return true;
            }
        }

        false
    }

    fn any_global_work(&self) -> bool {
        let heap = &self.heap;
        heap.static_todo_hint() > 0
            || heap.mark_stack.depth_hint() > 0
            || heap
                .gens
                .iter()
                .any(|gen| gen.steps.iter().any(|s| !s.queue.is_empty_hint()))
    }

    /// Pulls work until every thread of the round is idle.
    pub(crate) fn work_loop(&mut self) {
        let heap = Arc::clone(&self.heap);
        let n_threads = heap.config.gc_threads;
        'round: loop {
            while self.do_some_work() {}
            heap.n_idle.fetch_add(1, Ordering::AcqRel);
            let backoff = Backoff::new();
            loop {
                if heap.done.load(Ordering::Acquire) {
                    return;
                }
                if self.any_global_work() {
                    heap.n_idle.fetch_sub(1, Ordering::AcqRel);
                    continue 'round;
                }
                if heap.n_idle.load(Ordering::Acquire) == n_threads {
                    // Everyone idle; recheck once before declaring the
                    // round over, in case a push raced with going idle.
                    backoff.snooze();
                    if heap.n_idle.load(Ordering::Acquire) == n_threads
                        && !self.any_global_work()
                    {
                        heap.done.store(true, Ordering::Release);
                        return;
                    }
                } else {
                    backoff.snooze();
                }
            }
        }
    }

    /// Re-scans every marked object of the in-place oldest step. Used
    /// after a mark-stack overflow dropped entries; re-scavenging an
    /// already-scanned object is a no-op, so the walk is safe to
    /// repeat. Single-threaded.
    pub(crate) fn rescan_marked(&mut self) {
        let heap = Arc::clone(&self.heap);
        let (g, s) = heap.marked_step();
        let step = heap.step(g, s);
        let blocks: Vec<BlockRef> = step.blocks.lock().clone();
        for bd in blocks {
            for obj in bd.objects() {
                if obj.info().marked {
                    self.scavenge_marked(obj);
                }
            }
        }
        let groups: Vec<BlockRef> = step.large.lock().clone();
        for group in groups {
            // SAFETY: a large group holds one object at its start.
            let p = unsafe { group.base().add(group.start_off()) };
            let obj = HeapRef::from_ptr(p);
            if obj.info().marked {
                self.scavenge_marked(obj);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::block::{BlockRef, BF_EVACUATED};
    use crate::heap::{Heap, HeapConfig};
    use crate::object::ObjKind;
    use crate::thread::GcThread;

    fn heap() -> Arc<Heap> {
        Arc::new(Heap::new(HeapConfig {
            generations: 2,
            steps_per_gen: 2,
            gc_threads: 1,
            ..HeapConfig::default()
        }))
    }

    #[test]
    fn scavenging_chases_the_reachable_graph() {
        let heap = heap();
        let b = heap.alloc(0, 1, ObjKind::Data);
        b.set_raw_field(0, 7);
        let a = heap.alloc(1, 0, ObjKind::Data);
        a.set_ref_field(0, Some(b));
        let dead = heap.alloc(0, 1, ObjKind::Data);
        dead.set_raw_field(0, 13);

        heap.begin_collection(0);
        let mut gc = GcThread::new(0, Arc::clone(&heap));
        let a_to = gc.evacuate(a);
        gc.work_loop();

        let b_to = a_to.ref_field(0).expect("field survived");
        assert_ne!(b_to, b);
        assert_eq!(b_to.raw_field(0), 7);
        assert_eq!(b.forwarded_to(), Some(b_to));
        assert!(dead.forwarded_to().is_none());

        gc.flush_workspaces();
        // Flushed to-space blocks stay flagged until the heap reclaims
        // from-space.
        let to_bd = BlockRef::of_object(b_to.as_ptr());
        assert_ne!(to_bd.flags() & BF_EVACUATED, 0);
        heap.finalize_collection();
        assert_eq!(to_bd.flags() & BF_EVACUATED, 0);
        assert_eq!(heap.is_alive(b), Some(b_to));
        assert_eq!(heap.is_alive(dead), None);
    }

    #[test]
    fn mut_list_entries_promote_their_referents() {
        let heap = heap();
        let young = heap.alloc(0, 1, ObjKind::Data);
        young.set_raw_field(0, 5);
        let old = heap.alloc_in_gen(1, 1, 0, ObjKind::MutVar);
        old.set_ref_field(0, Some(young));
        heap.remember(old);

        heap.begin_collection(0);
        let mut gc = GcThread::new(0, Arc::clone(&heap));
        gc.scavenge_mut_list(1);
        gc.work_loop();

        let to = old.ref_field(0).expect("referent survived");
        let bd = BlockRef::of_object(to.as_ptr());
        assert_eq!((bd.gen_no(), bd.step_no()), (1, 0));
        assert_eq!(to.raw_field(0), 5);
        // Promotion succeeded, so the entry was dropped.
        assert!(heap.gens[1].mut_list.lock().is_empty());
        assert_eq!(gc.stats.mutlist.mut_vars, 1);
    }

    #[test]
    fn static_scan_reaches_heap_referents() {
        let heap = heap();
        let target = heap.alloc(0, 1, ObjKind::Data);
        target.set_raw_field(0, 3);
        let s = heap.alloc_static(1, 0, ObjKind::Data);
        s.set_ref_field(0, Some(target));

        heap.begin_collection(0);
        let mut gc = GcThread::new(0, Arc::clone(&heap));
        assert_eq!(gc.evacuate(s), s);
        gc.work_loop();

        let to = s.ref_field(0).expect("referent survived");
        assert_ne!(to, target);
        assert_eq!(to.raw_field(0), 3);
        assert_eq!(heap.statics.scavenged_len(), 1);
    }

    #[test]
    fn large_objects_are_scavenged_in_place() {
        let heap = heap();
        let child = heap.alloc(0, 1, ObjKind::Data);
        child.set_raw_field(0, 11);
        let big = u16::try_from(crate::block::BLOCK_WORDS).expect("fits");
        let arr = heap.alloc(1, big - 1, ObjKind::Array);
        arr.set_ref_field(0, Some(child));
        let addr = arr.as_ptr();

        heap.begin_collection(0);
        let mut gc = GcThread::new(0, Arc::clone(&heap));
        let to = gc.evacuate(arr);
        gc.work_loop();
        assert_eq!(to.as_ptr(), addr);

        let child_to = to.ref_field(0).expect("element survived");
        assert_ne!(child_to, child);
        assert_eq!(child_to.raw_field(0), 11);

        gc.flush_workspaces();
        heap.finalize_collection();
        // The group moved to the next step's list rather than the pool.
        assert_eq!(heap.step(0, 1).large.lock().len(), 1);
        assert!(heap.step(0, 0).from_large.lock().is_empty());
    }
}
