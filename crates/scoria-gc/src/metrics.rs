//! Collection counters.
//!
//! Threads accumulate into plain fields on their own state and fold the
//! totals into the shared [`GcStats`] once per collection, so the hot
//! copy loop never touches an atomic for accounting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-thread accounting for one collection round. Folded into the
/// heap-wide [`GcStats`] when the round ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadStats {
    /// Bytes copied for objects that still need scavenging.
    pub copied: u64,
    /// Bytes copied for objects with no reference fields, which skip
    /// the scan queue entirely.
    pub scavd_copied: u64,
    /// Mutable-list entries scavenged, by why they were there.
    pub mutlist: MutListStats,
}

/// Breakdown of mutable-list traffic, for tuning write-barrier cost.
#[derive(Debug, Default, Clone, Copy)]
pub struct MutListStats {
    pub mut_vars: u64,
    pub arrays: u64,
    pub others: u64,
}

impl ThreadStats {
    pub fn note_copied(&mut self, bytes: usize) {
        self.copied += bytes as u64;
    }

    pub fn note_scavd_copied(&mut self, bytes: usize) {
        self.scavd_copied += bytes as u64;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Heap-wide totals, updated at collection boundaries.
#[derive(Debug, Default)]
pub struct GcStats {
    collections: AtomicU64,
    major_collections: AtomicU64,
    copied: AtomicU64,
    scavd_copied: AtomicU64,
    mutlist_mut_vars: AtomicU64,
    mutlist_arrays: AtomicU64,
    mutlist_others: AtomicU64,
}

impl GcStats {
    pub(crate) fn note_collection(&self, major: bool) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        if major {
            self.major_collections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn fold(&self, t: &ThreadStats) {
        self.copied.fetch_add(t.copied, Ordering::Relaxed);
        self.scavd_copied.fetch_add(t.scavd_copied, Ordering::Relaxed);
        self.mutlist_mut_vars
            .fetch_add(t.mutlist.mut_vars, Ordering::Relaxed);
        self.mutlist_arrays
            .fetch_add(t.mutlist.arrays, Ordering::Relaxed);
        self.mutlist_others
            .fetch_add(t.mutlist.others, Ordering::Relaxed);
    }

    /// Consistent-enough point-in-time copy. Individual counters are
    /// read independently, which is fine between collections.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            collections: self.collections.load(Ordering::Relaxed),
            major_collections: self.major_collections.load(Ordering::Relaxed),
            copied_bytes: self.copied.load(Ordering::Relaxed),
            scavd_copied_bytes: self.scavd_copied.load(Ordering::Relaxed),
            mutlist_mut_vars: self.mutlist_mut_vars.load(Ordering::Relaxed),
            mutlist_arrays: self.mutlist_arrays.load(Ordering::Relaxed),
            mutlist_others: self.mutlist_others.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`GcStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub collections: u64,
    pub major_collections: u64,
    pub copied_bytes: u64,
    pub scavd_copied_bytes: u64,
    pub mutlist_mut_vars: u64,
    pub mutlist_arrays: u64,
    pub mutlist_others: u64,
}

impl StatsSnapshot {
    /// Total bytes moved by the copying collector.
    #[must_use]
    pub fn total_copied_bytes(&self) -> u64 {
        self.copied_bytes + self.scavd_copied_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::{GcStats, ThreadStats};

    #[test]
    fn thread_stats_fold_into_totals() {
        let stats = GcStats::default();
        let mut a = ThreadStats::default();
        a.note_copied(128);
        a.note_scavd_copied(32);
        a.mutlist.mut_vars = 3;
        let mut b = ThreadStats::default();
        b.note_copied(64);
        b.mutlist.arrays = 1;

        stats.note_collection(true);
        stats.fold(&a);
        stats.fold(&b);

        let snap = stats.snapshot();
        assert_eq!(snap.collections, 1);
        assert_eq!(snap.major_collections, 1);
        assert_eq!(snap.copied_bytes, 192);
        assert_eq!(snap.scavd_copied_bytes, 32);
        assert_eq!(snap.total_copied_bytes(), 224);
        assert_eq!(snap.mutlist_mut_vars, 3);
        assert_eq!(snap.mutlist_arrays, 1);
        assert_eq!(snap.mutlist_others, 0);
    }

    #[test]
    fn reset_clears_a_round() {
        let mut t = ThreadStats::default();
        t.note_copied(8);
        t.reset();
        assert_eq!(t.copied, 0);
        assert_eq!(t.scavd_copied, 0);
    }
}
