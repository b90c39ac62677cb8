//! Collection tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for collection rounds.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Stable identifier for one collection round, used to correlate
    /// all events within it. Monotonically increasing from 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique collection ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for an entire collection round.
    pub fn trace_collection(oldest_gen: usize, major: bool, gc_id: GcId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            oldest_gen,
            major,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Log the end of a collection round.
    pub fn log_collection_end(gc_id: GcId, copied_bytes: u64, blocks_in_use: usize) {
        tracing::debug!(gc_id = gc_id.0, copied_bytes, blocks_in_use, "gc_done");
    }

    /// Log a mark-stack overflow and the rescan it triggers.
    pub fn log_mark_overflow(gc_id: GcId) {
        tracing::debug!(gc_id = gc_id.0, "mark_stack_overflow");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
