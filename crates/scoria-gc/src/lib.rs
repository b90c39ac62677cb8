//! A parallel, generational, copying garbage collector.
//!
//! `scoria-gc` manages a heap of word-addressed objects divided into
//! generations, each split into aging **steps**. Minor collections copy
//! the young generations; survivors age step by step and are promoted
//! into older generations. Collections run stop-the-world on a pool of
//! GC threads that share work through per-step block queues.
//!
//! # Layout
//!
//! - **Blocks**: all heap memory is 4 KiB, block-aligned; any object
//!   address finds its block header with one mask.
//! - **Objects**: one header word (field counts, kind) followed by the
//!   payload; reference fields first, raw words after.
//! - **Large objects** live in dedicated block groups and never move.
//! - **Static objects** live outside the heap and are discovered, not
//!   copied.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use scoria_gc::{Collector, Heap, HeapConfig, ObjKind};
//!
//! let heap = Arc::new(Heap::new(HeapConfig::default()));
//! let mut gc = Collector::new(Arc::clone(&heap));
//!
//! let child = heap.alloc(0, 1, ObjKind::Data);
//! let parent = heap.alloc(1, 0, ObjKind::Data);
//! parent.set_ref_field(0, Some(child));
//!
//! let mut roots = vec![Some(parent)];
//! gc.collect(0, &mut roots); // minor collection
//! let parent = roots[0].unwrap(); // moved; the root was rewritten
//! ```
//!
//! # Write barrier
//!
//! Storing a reference into an object of an older generation must be
//! followed by [`Heap::remember`]; minor collections trace those
//! remembered sets instead of the whole old generation.
//!
//! # Thread safety
//!
//! Allocation is thread-safe. Collections are stop-the-world: no
//! mutator may touch the heap while [`Collector::collect`] runs.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod block;
mod collect;
mod evac;
mod heap;
mod mark_stack;
mod metrics;
mod object;
mod queue;
mod scav;
mod statics;
mod thread;
mod tracing;
mod workspace;

pub use collect::{Collector, RootSource};
pub use heap::{Heap, HeapConfig};
pub use metrics::StatsSnapshot;
pub use object::{HeapRef, InfoWord, ObjKind, Word};
pub use crate::tracing::GcId;

#[cfg(test)]
mod scenario_tests;
