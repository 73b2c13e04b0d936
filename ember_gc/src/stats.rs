//! Heap statistics.
//!
//! Counters are relaxed atomics; readers take a [`GcStatsSnapshot`] when
//! they need a consistent-looking view for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing allocation and barrier activity.
#[derive(Debug, Default)]
pub struct GcStats {
    // =========================================================================
    // Allocation Statistics
    // =========================================================================
    /// Total bytes allocated since start.
    pub bytes_allocated: AtomicU64,
    /// Total objects allocated since start.
    pub objects_allocated: AtomicU64,
    /// Allocations served from a thread-local buffer.
    pub tlab_allocations: AtomicU64,
    /// Number of TLABs handed out.
    pub tlab_refills: AtomicU64,
    /// Bytes wasted in retired TLAB tails.
    pub tlab_waste: AtomicU64,

    // =========================================================================
    // Barrier Statistics
    // =========================================================================
    /// Cards dirtied by the write barrier.
    pub cards_marked: AtomicU64,
    /// Read-barrier mark calls.
    pub read_barrier_marks: AtomicU64,
    /// Read-barrier calls that found a gray holder.
    pub gray_hits: AtomicU64,
}

impl GcStats {
    /// Create new empty statistics.
    pub const fn new() -> Self {
        Self {
            bytes_allocated: AtomicU64::new(0),
            objects_allocated: AtomicU64::new(0),
            tlab_allocations: AtomicU64::new(0),
            tlab_refills: AtomicU64::new(0),
            tlab_waste: AtomicU64::new(0),
            cards_marked: AtomicU64::new(0),
            read_barrier_marks: AtomicU64::new(0),
            gray_hits: AtomicU64::new(0),
        }
    }

    /// Record an allocation.
    #[inline]
    pub fn record_allocation(&self, size: usize, from_tlab: bool) {
        self.bytes_allocated
            .fetch_add(size as u64, Ordering::Relaxed);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        if from_tlab {
            self.tlab_allocations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a TLAB refill and the tail abandoned by it.
    #[inline]
    pub fn record_tlab_refill(&self, wasted: usize) {
        self.tlab_refills.fetch_add(1, Ordering::Relaxed);
        self.tlab_waste.fetch_add(wasted as u64, Ordering::Relaxed);
    }

    /// Record a card mark.
    #[inline]
    pub fn record_card_mark(&self) {
        self.cards_marked.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a read-barrier mark.
    #[inline]
    pub fn record_read_barrier(&self, was_gray: bool) {
        self.read_barrier_marks.fetch_add(1, Ordering::Relaxed);
        if was_gray {
            self.gray_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take a snapshot of all counters.
    pub fn snapshot(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            objects_allocated: self.objects_allocated.load(Ordering::Relaxed),
            tlab_allocations: self.tlab_allocations.load(Ordering::Relaxed),
            tlab_refills: self.tlab_refills.load(Ordering::Relaxed),
            tlab_waste: self.tlab_waste.load(Ordering::Relaxed),
            cards_marked: self.cards_marked.load(Ordering::Relaxed),
            read_barrier_marks: self.read_barrier_marks.load(Ordering::Relaxed),
            gray_hits: self.gray_hits.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`GcStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStatsSnapshot {
    /// Total bytes allocated.
    pub bytes_allocated: u64,
    /// Total objects allocated.
    pub objects_allocated: u64,
    /// Allocations served from a TLAB.
    pub tlab_allocations: u64,
    /// TLABs handed out.
    pub tlab_refills: u64,
    /// Bytes abandoned in retired TLABs.
    pub tlab_waste: u64,
    /// Cards dirtied.
    pub cards_marked: u64,
    /// Read-barrier mark calls.
    pub read_barrier_marks: u64,
    /// Gray holders observed.
    pub gray_hits: u64,
}

impl GcStatsSnapshot {
    /// Fraction of allocations that took the TLAB fast path.
    pub fn tlab_hit_rate(&self) -> f64 {
        if self.objects_allocated == 0 {
            return 0.0;
        }
        self.tlab_allocations as f64 / self.objects_allocated as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_allocation() {
        let stats = GcStats::new();
        stats.record_allocation(64, true);
        stats.record_allocation(32, false);

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_allocated, 96);
        assert_eq!(snap.objects_allocated, 2);
        assert_eq!(snap.tlab_allocations, 1);
        assert!((snap.tlab_hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_barrier_counters() {
        let stats = GcStats::new();
        stats.record_card_mark();
        stats.record_read_barrier(true);
        stats.record_read_barrier(false);
        stats.record_tlab_refill(24);

        let snap = stats.snapshot();
        assert_eq!(snap.cards_marked, 1);
        assert_eq!(snap.read_barrier_marks, 2);
        assert_eq!(snap.gray_hits, 1);
        assert_eq!(snap.tlab_refills, 1);
        assert_eq!(snap.tlab_waste, 24);
    }

    #[test]
    fn test_empty_hit_rate() {
        assert_eq!(GcStatsSnapshot::default().tlab_hit_rate(), 0.0);
    }
}
