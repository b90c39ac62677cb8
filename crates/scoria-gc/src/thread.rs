//! GC thread state and the persistent worker pool.
//!
//! Thread 0 is the caller of `collect`; the remaining threads are
//! spawned once and parked between collections. Each thread owns a
//! [`GcThread`]: its workspaces, free-block buffer, and per-round
//! counters survive across collections.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::block::BlockRef;
use crate::heap::Heap;
use crate::metrics::ThreadStats;
use crate::workspace::Workspace;

/// Per-thread collector state.
pub(crate) struct GcThread {
    /// Thread index; 0 is the collection leader.
    pub index: usize,
    pub heap: Arc<Heap>,
    /// One workspace per (generation, step), including uncollected
    /// destinations, indexed by [`Self::ws_index`].
    pub workspaces: Vec<Workspace>,
    /// Local buffer of free blocks, refilled from the pool in batches.
    pub free_blocks: Vec<BlockRef>,
    pub stats: ThreadStats,
    /// Collection rounds this thread has taken part in.
    pub rounds: u64,

    // Evacuation context, set by the scavenger around each object.
    /// Youngest generation the object being scavenged may point into
    /// without a remembered-set entry.
    pub evac_gen: usize,
    /// Destination step for objects evacuated right now.
    pub evac_dest: (usize, usize),
    /// Promote straight to `evac_dest` instead of the source's aging
    /// destination.
    pub eager_promotion: bool,
    /// Set when an evacuation could not reach `evac_gen`; the object
    /// under scavenge must go on a remembered set.
    pub failed_to_evac: bool,
}

impl GcThread {
    pub fn new(index: usize, heap: Arc<Heap>) -> Self {
        let n_steps = heap.config.steps_per_gen;
        let workspaces = (0..heap.config.generations)
            .flat_map(|g| (0..n_steps).map(move |s| Workspace::new(g, s)))
            .collect();
        Self {
            index,
            heap,
            workspaces,
            free_blocks: Vec::new(),
            stats: ThreadStats::default(),
            rounds: 0,
            evac_gen: 0,
            evac_dest: (0, 0),
            eager_promotion: false,
            failed_to_evac: false,
        }
    }

    pub fn ws_index(&self, g: usize, s: usize) -> usize {
        g * self.heap.config.steps_per_gen + s
    }

    /// Resets the per-round context at the start of a collection.
    pub fn begin_round(&mut self) {
        self.rounds += 1;
        self.evac_gen = 0;
        self.evac_dest = (0, 0);
        self.eager_promotion = false;
        self.failed_to_evac = false;
    }

    /// Runs one worker's share of a collection round: pull work until
    /// global termination, then flush.
    pub fn run_round(&mut self) {
        self.begin_round();
        #[cfg(feature = "tracing")]
        tracing::trace!(thread = self.index, round = self.rounds, "gc_round_start");
        self.work_loop();
        self.flush_workspaces();
    }

    /// Publishes workspace contents onto the owning steps and folds the
    /// round's counters into the heap totals.
    pub fn flush_workspaces(&mut self) {
        let heap = Arc::clone(&self.heap);
        for ws in &mut self.workspaces {
            debug_assert!(ws.todo_large.is_empty(), "unscavenged large object at flush");
            let step = heap.step(ws.gen_no, ws.step_no);
            let mut blocks = ws.take_blocks();
            if !blocks.is_empty() {
                step.blocks.lock().append(&mut blocks);
            }
            let mut large = ws.take_large();
            if !large.is_empty() {
                step.large.lock().append(&mut large);
            }
        }
        heap.stats.fold(&self.stats);
        self.stats.reset();
    }
}

// ----------------------------------------------------------------------------
// Worker pool
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Park,
    Collect,
    Exit,
}

/// Mailbox through which the leader drives one worker.
pub(crate) struct WorkerSignal {
    cmd: Mutex<Command>,
    cond: Condvar,
}

impl WorkerSignal {
    fn new() -> Self {
        Self {
            cmd: Mutex::new(Command::Park),
            cond: Condvar::new(),
        }
    }

    pub fn send(&self, cmd: Command) {
        *self.cmd.lock() = cmd;
        self.cond.notify_one();
    }

    fn wait_for_command(&self) -> Command {
        let mut cmd = self.cmd.lock();
        while *cmd == Command::Park {
            self.cond.wait(&mut cmd);
        }
        std::mem::replace(&mut *cmd, Command::Park)
    }
}

/// Counts workers that have finished their round.
pub(crate) struct Rendezvous {
    arrived: Mutex<usize>,
    cond: Condvar,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self {
            arrived: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn arrive(&self) {
        *self.arrived.lock() += 1;
        self.cond.notify_one();
    }

    /// Blocks until `n` workers have arrived, then resets the count.
    pub fn wait_for(&self, n: usize) {
        let mut arrived = self.arrived.lock();
        while *arrived < n {
            self.cond.wait(&mut arrived);
        }
        *arrived = 0;
    }
}

/// A spawned worker and its mailbox.
pub(crate) struct WorkerHandle {
    pub signal: Arc<WorkerSignal>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(index: usize, heap: Arc<Heap>, rendezvous: Arc<Rendezvous>) -> Self {
        let signal = Arc::new(WorkerSignal::new());
        let sig = Arc::clone(&signal);
        let join = std::thread::Builder::new()
            .name(format!("scoria-gc-{index}"))
            .spawn(move || worker_main(index, heap, &sig, &rendezvous))
            .expect("failed to spawn GC worker thread");
        Self {
            signal,
            join: Some(join),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.signal.send(Command::Exit);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn worker_main(index: usize, heap: Arc<Heap>, signal: &WorkerSignal, rendezvous: &Rendezvous) {
    let mut thread = GcThread::new(index, heap);
    loop {
        match signal.wait_for_command() {
            Command::Exit => return,
            Command::Collect => {
                thread.run_round();
                rendezvous.arrive();
            }
            Command::Park => unreachable!("wait_for_command never returns Park"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, Rendezvous, WorkerSignal};
    use std::sync::Arc;

    #[test]
    fn signal_delivers_commands_in_order() {
        let signal = Arc::new(WorkerSignal::new());
        let sig = Arc::clone(&signal);
        let handle = std::thread::spawn(move || {
            let first = sig.wait_for_command();
            let second = sig.wait_for_command();
            (first, second)
        });
        signal.send(Command::Collect);
        // The worker resets the mailbox to Park after consuming.
        while *signal.cmd.lock() != Command::Park {
            std::thread::yield_now();
        }
        signal.send(Command::Exit);
        let (first, second) = handle.join().expect("worker thread");
        assert_eq!(first, Command::Collect);
        assert_eq!(second, Command::Exit);
    }

    #[test]
    fn rendezvous_counts_arrivals() {
        let rendezvous = Arc::new(Rendezvous::new());
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let r = Arc::clone(&rendezvous);
                std::thread::spawn(move || r.arrive())
            })
            .collect();
        rendezvous.wait_for(3);
        for h in handles {
            h.join().expect("arriving thread");
        }
        // The count reset; a fresh round starts from zero.
        rendezvous.arrive();
        rendezvous.wait_for(1);
    }
}
