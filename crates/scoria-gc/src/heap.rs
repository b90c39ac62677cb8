//! The heap: generations, steps, and the mutator-facing allocation API.
//!
//! The heap is a table of generations, each split into steps. Objects
//! are allocated into generation 0, step 0 and age along the step
//! wiring: step `s` promotes to step `s + 1`, the last step of a
//! generation promotes into the next generation, and the last step of
//! the oldest generation is its own destination.
//!
//! Collections are stop-the-world: the allocation API and
//! [`Collector::collect`](crate::collect::Collector::collect) must not
//! run concurrently. Between collections the heap is plain shared
//! state; during one it is driven by the GC threads.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::block::{blocks_for_words, BlockPool, BlockRef, BLOCK_HDR_WORDS, BLOCK_WORDS};
use crate::mark_stack::MarkStack;
use crate::metrics::{GcStats, StatsSnapshot};
use crate::object::{HeapRef, InfoWord, ObjKind};
use crate::queue::TodoQueue;
use crate::statics::StaticRegistry;

/// Heap construction parameters.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Number of generations, at least 1.
    pub generations: usize,
    /// Steps per generation, at least 1.
    pub steps_per_gen: usize,
    /// GC threads used per collection, at least 1. Thread 1 is the
    /// caller of `collect`; the rest are persistent workers.
    pub gc_threads: usize,
    /// Objects larger than this many words (header included) go to the
    /// large-object lists and are never copied.
    pub large_object_words: usize,
    /// Capacity of the shared mark stack used for the non-moving oldest
    /// generation. Overflow falls back to a rescan pass.
    pub mark_stack_capacity: usize,
    /// Mark the oldest generation in place during major collections
    /// instead of copying it.
    pub mark_oldest: bool,
    /// Blocks fetched from the pool per free-list refill.
    pub free_list_refill: usize,
    /// Optional hard cap on live blocks; exceeding it aborts.
    pub pool_limit_blocks: Option<usize>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            generations: 2,
            steps_per_gen: 2,
            gc_threads: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            large_object_words: BLOCK_WORDS * 4 / 5,
            mark_stack_capacity: 4096,
            mark_oldest: false,
            free_list_refill: 8,
            pool_limit_blocks: None,
        }
    }
}

impl HeapConfig {
    /// Sets the number of generations.
    #[must_use]
    pub fn generations(mut self, n: usize) -> Self {
        self.generations = n;
        self
    }

    /// Sets the steps per generation.
    #[must_use]
    pub fn steps_per_gen(mut self, n: usize) -> Self {
        self.steps_per_gen = n;
        self
    }

    /// Sets the number of GC threads per collection.
    #[must_use]
    pub fn gc_threads(mut self, n: usize) -> Self {
        self.gc_threads = n;
        self
    }

    /// Marks the oldest generation in place during major collections.
    #[must_use]
    pub fn mark_oldest(mut self, yes: bool) -> Self {
        self.mark_oldest = yes;
        self
    }

    /// Sets the mark-stack capacity used with [`mark_oldest`](Self::mark_oldest).
    #[must_use]
    pub fn mark_stack_capacity(mut self, n: usize) -> Self {
        self.mark_stack_capacity = n;
        self
    }
}

/// One step of a generation.
pub(crate) struct Step {
    pub gen_no: usize,
    pub no: usize,
    /// Destination step for survivors of this step.
    pub to: (usize, usize),
    /// Current mutator allocation block.
    cur: Mutex<Option<BlockRef>>,
    /// Filled blocks belonging to this step.
    pub blocks: Mutex<Vec<BlockRef>>,
    /// Large-object groups belonging to this step.
    pub large: Mutex<Vec<BlockRef>>,
    /// From-space blocks of the collection in progress.
    pub from: Mutex<Vec<BlockRef>>,
    /// From-space large-object groups of the collection in progress.
    pub from_large: Mutex<Vec<BlockRef>>,
    /// Shared queue of full, unscanned to-space blocks.
    pub queue: TodoQueue,
}

impl Step {
    fn new(gen_no: usize, no: usize, to: (usize, usize)) -> Self {
        Self {
            gen_no,
            no,
            to,
            cur: Mutex::new(None),
            blocks: Mutex::new(Vec::new()),
            large: Mutex::new(Vec::new()),
            from: Mutex::new(Vec::new()),
            from_large: Mutex::new(Vec::new()),
            queue: TodoQueue::new(),
        }
    }
}

/// One generation.
pub(crate) struct Generation {
    pub no: usize,
    pub steps: Vec<Step>,
    /// Remembered set: objects in this generation that may hold
    /// references into younger generations.
    pub mut_list: Mutex<Vec<HeapRef>>,
}

/// The managed heap.
pub struct Heap {
    pub(crate) config: HeapConfig,
    pub(crate) pool: BlockPool,
    pub(crate) gens: Vec<Generation>,
    pub(crate) statics: StaticRegistry,
    pub(crate) mark_stack: MarkStack,
    /// Static objects discovered this collection, pending field scan.
    static_todo: Mutex<Vec<HeapRef>>,
    static_todo_len: AtomicUsize,
    pub(crate) stats: GcStats,
    gc_count: AtomicU64,

    // State of the collection in progress.
    /// Oldest generation being collected.
    pub(crate) collect_gen: AtomicUsize,
    pub(crate) major: AtomicBool,
    /// Whether this collection marks the oldest generation in place.
    pub(crate) mark_mode: AtomicBool,
    /// Whether oldest-generation mark bits describe the last collection.
    marked_valid: AtomicBool,
    pub(crate) n_idle: AtomicUsize,
    pub(crate) done: AtomicBool,
}

impl Heap {
    /// Creates an empty heap.
    ///
    /// # Panics
    ///
    /// Panics if the configuration asks for zero generations, steps, or
    /// threads.
    #[must_use]
    pub fn new(config: HeapConfig) -> Self {
        assert!(config.generations >= 1, "need at least one generation");
        assert!(config.steps_per_gen >= 1, "need at least one step");
        assert!(config.gc_threads >= 1, "need at least one GC thread");
        assert!(
            config.large_object_words <= BLOCK_WORDS - BLOCK_HDR_WORDS,
            "large-object threshold exceeds block capacity"
        );

        let n_gens = config.generations;
        let n_steps = config.steps_per_gen;
        let gens = (0..n_gens)
            .map(|g| Generation {
                no: g,
                steps: (0..n_steps)
                    .map(|s| {
                        let to = if s + 1 < n_steps {
                            (g, s + 1)
                        } else if g + 1 < n_gens {
                            (g + 1, 0)
                        } else {
                            (g, s)
                        };
                        Step::new(g, s, to)
                    })
                    .collect(),
                mut_list: Mutex::new(Vec::new()),
            })
            .collect();

        Self {
            pool: BlockPool::new(config.pool_limit_blocks),
            gens,
            statics: StaticRegistry::new(),
            mark_stack: MarkStack::new(config.mark_stack_capacity),
            static_todo: Mutex::new(Vec::new()),
            static_todo_len: AtomicUsize::new(0),
            stats: GcStats::default(),
            gc_count: AtomicU64::new(0),
            collect_gen: AtomicUsize::new(0),
            major: AtomicBool::new(false),
            mark_mode: AtomicBool::new(false),
            marked_valid: AtomicBool::new(false),
            n_idle: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            config,
        }
    }

    pub(crate) fn step(&self, g: usize, s: usize) -> &Step {
        &self.gens[g].steps[s]
    }

    /// Index of the oldest generation.
    #[must_use]
    pub fn oldest_gen(&self) -> usize {
        self.gens.len() - 1
    }

    /// The step marked in place under `mark_oldest`.
    pub(crate) fn marked_step(&self) -> (usize, usize) {
        (self.oldest_gen(), self.config.steps_per_gen - 1)
    }

    /// Number of collections performed so far.
    #[must_use]
    pub fn gc_count(&self) -> u64 {
        self.gc_count.load(Ordering::Relaxed)
    }

    /// Blocks currently backing the heap.
    #[must_use]
    pub fn blocks_in_use(&self) -> usize {
        self.pool.blocks_in_use()
    }

    /// Point-in-time counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates a new object in the nursery with `ptrs` null reference
    /// fields followed by `raws` zeroed raw words.
    pub fn alloc(&self, ptrs: u16, raws: u16, kind: ObjKind) -> HeapRef {
        self.alloc_in_step(0, 0, ptrs, raws, kind)
    }

    /// Allocates directly into step 0 of generation `g`.
    pub fn alloc_in_gen(&self, g: usize, ptrs: u16, raws: u16, kind: ObjKind) -> HeapRef {
        self.alloc_in_step(g, 0, ptrs, raws, kind)
    }

    /// Allocates a static object, which is never moved or reclaimed.
    pub fn alloc_static(&self, ptrs: u16, raws: u16, kind: ObjKind) -> HeapRef {
        self.statics.alloc(ptrs, raws, kind)
    }

    fn alloc_in_step(&self, g: usize, s: usize, ptrs: u16, raws: u16, kind: ObjKind) -> HeapRef {
        let info = InfoWord::new(ptrs, raws, kind);
        let words = info.size_words();
        if words > self.config.large_object_words {
            return self.alloc_large(g, s, info);
        }
        let step = self.step(g, s);
        let mut cur = step.cur.lock();
        loop {
            if let Some(bd) = *cur {
                if let Some(p) = bd.try_alloc(words) {
                    return Self::init_object(p, info);
                }
                step.blocks.lock().push(bd);
            }
            let bd = self.pool.alloc();
            bd.set_step(g, s);
            *cur = Some(bd);
        }
    }

    fn alloc_large(&self, g: usize, s: usize, info: InfoWord) -> HeapRef {
        let words = info.size_words();
        let group = self.pool.alloc_group(blocks_for_words(words));
        group.set_step(g, s);
        let p = group
            .try_alloc(words)
            .expect("fresh group sized for this object");
        let obj = Self::init_object(p, info);
        self.step(g, s).large.lock().push(group);
        obj
    }

    fn init_object(p: *mut crate::object::Word, info: InfoWord) -> HeapRef {
        // Blocks are reused without zeroing; clear the payload here.
        // SAFETY: try_alloc reserved info.size_words() words at p.
        unsafe {
            p.write(info.encode());
            std::ptr::write_bytes(p.add(1), 0, info.size_words() - 1);
        }
        HeapRef::from_ptr(p)
    }

    /// Records `obj` on its generation's remembered set. Call after
    /// storing a reference to a possibly-younger object into `obj`.
    /// No-op for nursery and static objects.
    pub fn remember(&self, obj: HeapRef) {
        if obj.info().is_static {
            return;
        }
        let g = BlockRef::of_object(obj.as_ptr()).gen_no();
        if g > 0 {
            self.gens[g].mut_list.lock().push(obj);
        }
    }

    /// Reports whether `obj` survived the most recent collection,
    /// returning the surviving copy (which may have moved).
    ///
    /// Only meaningful between collections, before new allocations
    /// reuse reclaimed blocks.
    #[must_use]
    pub fn is_alive(&self, obj: HeapRef) -> Option<HeapRef> {
        if let Some(to) = obj.forwarded_to() {
            return Some(to);
        }
        let info = obj.info();
        if info.is_static {
            return Some(obj);
        }
        let bd = BlockRef::of_object(obj.as_ptr());
        if bd.is_free() {
            return None;
        }
        if self.marked_valid.load(Ordering::Acquire)
            && (bd.gen_no(), bd.step_no()) == self.marked_step()
        {
            return info.marked.then_some(obj);
        }
        Some(obj)
    }

    // ------------------------------------------------------------------
    // Collection-round state (driven by the collector)
    // ------------------------------------------------------------------

    pub(crate) fn push_static_todo(&self, obj: HeapRef) {
        self.static_todo.lock().push(obj);
        self.static_todo_len.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn pop_static_todo(&self) -> Option<HeapRef> {
        let obj = self.static_todo.lock().pop();
        if obj.is_some() {
            self.static_todo_len.fetch_sub(1, Ordering::Release);
        }
        obj
    }

    pub(crate) fn static_todo_hint(&self) -> usize {
        self.static_todo_len.load(Ordering::Acquire)
    }

    /// Flips the collected steps to from-space and resets the round
    /// state. Mutators must already be stopped.
    pub(crate) fn begin_collection(&self, oldest: usize) {
        debug_assert!(oldest <= self.oldest_gen());
        self.gc_count.fetch_add(1, Ordering::Relaxed);
        let major = oldest == self.oldest_gen();
        let mark_mode = major && self.config.mark_oldest;
        self.collect_gen.store(oldest, Ordering::Release);
        self.major.store(major, Ordering::Release);
        self.mark_mode.store(mark_mode, Ordering::Release);
        self.n_idle.store(0, Ordering::Release);
        self.done.store(false, Ordering::Release);
        self.stats.note_collection(major);

        for gen in &self.gens[..=oldest] {
            // Everything in a collected generation gets traced, so its
            // remembered set is stale.
            gen.mut_list.lock().clear();
            for step in &gen.steps {
                if let Some(bd) = step.cur.lock().take() {
                    step.blocks.lock().push(bd);
                }
                if mark_mode && (gen.no, step.no) == self.marked_step() {
                    self.reset_marks(step);
                    continue;
                }
                step.from.lock().append(&mut step.blocks.lock());
                step.from_large.lock().append(&mut step.large.lock());
                debug_assert!(step.queue.is_empty_hint());
            }
        }
    }

    /// Clears mark bits on the in-place step before a marking round.
    fn reset_marks(&self, step: &Step) {
        self.marked_valid.store(false, Ordering::Release);
        for bd in step.blocks.lock().iter() {
            for obj in bd.objects() {
                obj.clear_mark();
            }
        }
        for group in step.large.lock().iter() {
            // SAFETY: a large group holds one object at its start.
            let p = unsafe { group.base().add(group.start_off()) };
            HeapRef::from_ptr(p).clear_mark();
        }
    }

    /// Reclaims from-space and publishes the new step contents. Runs
    /// single-threaded after every worker has parked.
    pub(crate) fn finalize_collection(&self) {
        let oldest = self.collect_gen.load(Ordering::Acquire);
        let mark_mode = self.mark_mode.load(Ordering::Acquire);
        for gen in &self.gens[..=oldest] {
            for step in &gen.steps {
                for bd in step.from.lock().drain(..) {
                    self.pool.free(bd);
                }
                for group in step.from_large.lock().drain(..) {
                    if group.flags() & crate::block::BF_EVACUATED != 0 {
                        // Reached this round; it was re-listed on its
                        // destination step by the claiming thread.
                        group.clear_evacuated();
                    } else {
                        self.pool.free_group(group);
                    }
                }
            }
        }
        // To-space blocks keep their evacuated flag through the epilogue
        // rescans; only once the round is over does it come off. Eager
        // promotion lands blocks in uncollected generations too, so the
        // sweep covers every step.
        for gen in &self.gens {
            for step in &gen.steps {
                for bd in step.blocks.lock().iter() {
                    bd.clear_evacuated();
                }
            }
        }
        if mark_mode {
            self.sweep_marked_large();
            self.marked_valid.store(true, Ordering::Release);
        }
    }

    /// Frees unmarked large-object groups of the in-place step. Its
    /// ordinary blocks are retained whole, but a dead large object owns
    /// its entire group, so the group goes back to the pool.
    fn sweep_marked_large(&self) {
        let (g, s) = self.marked_step();
        let mut large = self.step(g, s).large.lock();
        large.retain(|group| {
            // SAFETY: a large group holds one object at its start.
            let p = unsafe { group.base().add(group.start_off()) };
            let live = HeapRef::from_ptr(p).info().marked;
            if !live {
                self.pool.free_group(*group);
            }
            live
        });
    }
}
