//! Collection coordination.
//!
//! A [`Collector`] owns the worker pool and drives stop-the-world
//! collections over a shared [`Heap`]. The calling thread is the
//! leader: it flips the collected steps to from-space, wakes the
//! workers, evacuates the roots and the uncollected remembered sets,
//! then joins the work loop itself. Once every thread has gone idle it
//! runs the single-threaded epilogue (mark-stack overflow recovery and
//! from-space reclamation) alone.

use std::sync::Arc;

use crate::heap::Heap;
use crate::object::HeapRef;
use crate::thread::{Command, GcThread, Rendezvous, WorkerHandle};
use crate::tracing::internal as trc;

/// Supplies the root set of a collection.
///
/// `each_root` must visit every slot that keeps an object alive; the
/// collector rewrites slots whose referents moved.
pub trait RootSource {
    fn each_root(&mut self, f: &mut dyn FnMut(&mut Option<HeapRef>));
}

impl RootSource for [Option<HeapRef>] {
    fn each_root(&mut self, f: &mut dyn FnMut(&mut Option<HeapRef>)) {
        for slot in self {
            f(slot);
        }
    }
}

impl RootSource for Vec<Option<HeapRef>> {
    fn each_root(&mut self, f: &mut dyn FnMut(&mut Option<HeapRef>)) {
        self.as_mut_slice().each_root(f);
    }
}

/// Drives collections over one heap.
pub struct Collector {
    heap: Arc<Heap>,
    lead: GcThread,
    workers: Vec<WorkerHandle>,
    rendezvous: Arc<Rendezvous>,
}

impl Collector {
    /// Spawns the worker pool (`gc_threads - 1` persistent threads).
    #[must_use]
    pub fn new(heap: Arc<Heap>) -> Self {
        let rendezvous = Arc::new(Rendezvous::new());
        let workers = (1..heap.config.gc_threads)
            .map(|i| WorkerHandle::spawn(i, Arc::clone(&heap), Arc::clone(&rendezvous)))
            .collect();
        let lead = GcThread::new(0, Arc::clone(&heap));
        Self {
            heap,
            lead,
            workers,
            rendezvous,
        }
    }

    /// The heap this collector serves.
    #[must_use]
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Collects every generation.
    pub fn collect_major(&mut self, roots: &mut dyn RootSource) {
        self.collect(self.heap.oldest_gen(), roots);
    }

    /// Collects generations `0..=oldest`. Mutators must be stopped for
    /// the duration; on return every live object reachable from `roots`
    /// has been preserved and the root slots point at the survivors.
    ///
    /// # Panics
    ///
    /// Panics if `oldest` names a generation the heap does not have.
    pub fn collect(&mut self, oldest: usize, roots: &mut dyn RootSource) {
        assert!(oldest <= self.heap.oldest_gen(), "no such generation");
        let heap = Arc::clone(&self.heap);
        let gc_id = trc::next_gc_id();
        #[cfg(feature = "tracing")]
        let _span = trc::trace_collection(oldest, oldest == heap.oldest_gen(), gc_id);

        heap.begin_collection(oldest);
        for worker in &self.workers {
            worker.signal.send(Command::Collect);
        }

        self.lead.begin_round();
        debug_assert_eq!(self.lead.index, 0);
        debug_assert_eq!(self.lead.rounds, heap.gc_count());
        roots.each_root(&mut |slot| {
            if let Some(r) = *slot {
                let to = self.lead.evacuate(r);
                if to != r {
                    *slot = Some(to);
                }
            }
        });
        // Remembered sets of the uncollected generations stand in for
        // the references we are not tracing.
        for g in (oldest + 1)..=heap.oldest_gen() {
            self.lead.scavenge_mut_list(g);
        }
        // Statics reached in earlier collections stay roots: their
        // fields may point anywhere in the heap.
        for s in heap.statics.scavenged_snapshot() {
            heap.push_static_todo(s);
        }

        self.lead.work_loop();
        self.rendezvous.wait_for(self.workers.len());

        // Single-threaded epilogue: recover from mark-stack overflow by
        // rescanning, repeating until the round reaches a fixpoint.
        loop {
            if heap.mark_stack.take_overflow() {
                #[cfg(feature = "tracing")]
                trc::log_mark_overflow(gc_id);
                self.lead.rescan_marked();
            }
            while self.lead.do_some_work() {}
            if !heap.mark_stack.overflow_pending() {
                break;
            }
        }

        self.lead.flush_workspaces();
        heap.finalize_collection();
        #[cfg(feature = "tracing")]
        trc::log_collection_end(
            gc_id,
            heap.stats().total_copied_bytes(),
            heap.blocks_in_use(),
        );
        #[cfg(not(feature = "tracing"))]
        let _ = gc_id;
    }
}
