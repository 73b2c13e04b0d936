//! Thread-local allocation buffers.
//!
//! A TLAB is a contiguous window of the heap owned by one thread:
//!
//! ```text
//! start          pos            end                 limit
//!   |-- used ----|-- free -------|-- reserved ------|
//! ```
//!
//! Allocation bumps `pos`. When `pos + size` passes `end` the caller falls
//! back to the heap, which may either hand out a fresh buffer or `expand`
//! this one into the reserved tail up to `limit`.

/// Thread-local allocation buffer bounds.
///
/// Invariant: `start <= pos <= end <= limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tlab {
    start: usize,
    pos: usize,
    end: usize,
    limit: usize,
}

impl Tlab {
    /// An empty buffer; every allocation overflows.
    pub const EMPTY: Tlab = Tlab {
        start: 0,
        pos: 0,
        end: 0,
        limit: 0,
    };

    /// Create a buffer covering `[start, end)` with room to grow to `limit`.
    pub fn new(start: usize, end: usize, limit: usize) -> Self {
        let tlab = Self {
            start,
            pos: start,
            end,
            limit,
        };
        tlab.check_invariant();
        tlab
    }

    /// Replace the bounds with a freshly registered buffer.
    pub fn reset(&mut self, start: usize, end: usize, limit: usize) {
        *self = Tlab::new(start, end, limit);
    }

    /// Drop the buffer; the unused tail is returned to the heap by the caller.
    pub fn clear(&mut self) {
        *self = Tlab::EMPTY;
    }

    /// Bump-allocate `size` bytes. Returns the address or `None` on overflow.
    #[inline]
    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        let new_pos = self.pos.checked_add(size)?;
        if new_pos > self.end {
            return None;
        }
        let addr = self.pos;
        self.pos = new_pos;
        Some(addr)
    }

    /// Move `end` forward by `bytes`, bounded by `limit`.
    ///
    /// Returns `false` (and leaves the buffer unchanged) if the reserved
    /// tail is too short.
    pub fn expand(&mut self, bytes: usize) -> bool {
        match self.end.checked_add(bytes) {
            Some(new_end) if new_end <= self.limit => {
                self.end = new_end;
                true
            }
            _ => false,
        }
    }

    /// Relocate the buffer by `delta` bytes after the collector moved it.
    pub fn slide(&mut self, delta: isize) {
        let shift = |v: usize| v.wrapping_add_signed(delta);
        self.start = shift(self.start);
        self.pos = shift(self.pos);
        self.end = shift(self.end);
        self.limit = shift(self.limit);
        self.check_invariant();
    }

    /// Bytes left before `end`.
    #[inline]
    pub const fn remaining(&self) -> usize {
        self.end - self.pos
    }

    /// Bytes handed out so far.
    #[inline]
    pub const fn used(&self) -> usize {
        self.pos - self.start
    }

    /// Whether a buffer is installed.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.limit == 0
    }

    /// Start address.
    #[inline]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// Current bump pointer.
    #[inline]
    pub const fn pos(&self) -> usize {
        self.pos
    }

    /// Current allocation end.
    #[inline]
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Hard end of the reserved region.
    #[inline]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Check `start <= pos <= end <= limit`.
    #[inline]
    pub fn check_invariant(&self) {
        ember_core::check!(
            self.start <= self.pos && self.pos <= self.end && self.end <= self.limit,
            "tlab invariant violated: {:?}",
            self
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_expand_sequence() {
        let mut tlab = Tlab::new(0, 64, 256);
        assert_eq!(tlab.alloc(32), Some(0));
        assert_eq!(tlab.pos(), 32);

        assert_eq!(tlab.alloc(40), None);
        assert_eq!(tlab.pos(), 32);

        assert!(tlab.expand(128));
        assert_eq!(tlab.end(), 192);

        assert_eq!(tlab.alloc(40), Some(32));
        assert_eq!(tlab.pos(), 72);
    }

    #[test]
    fn test_expand_past_limit_fails() {
        let mut tlab = Tlab::new(0, 64, 100);
        assert!(!tlab.expand(64));
        assert_eq!(tlab.end(), 64);
        assert!(tlab.expand(36));
        assert_eq!(tlab.end(), 100);
    }

    #[test]
    fn test_empty_tlab_overflows() {
        let mut tlab = Tlab::EMPTY;
        assert!(tlab.is_empty());
        assert_eq!(tlab.alloc(8), None);
        assert_eq!(tlab.alloc(0), Some(0));
    }

    #[test]
    fn test_slide() {
        let mut tlab = Tlab::new(0x1000, 0x1400, 0x2000);
        tlab.alloc(0x100);
        tlab.slide(0x800);
        assert_eq!(tlab.start(), 0x1800);
        assert_eq!(tlab.pos(), 0x1900);
        assert_eq!(tlab.end(), 0x1c00);
        assert_eq!(tlab.limit(), 0x2800);

        tlab.slide(-0x1800);
        assert_eq!(tlab.start(), 0);
        assert_eq!(tlab.used(), 0x100);
    }

    #[test]
    fn test_remaining_and_used() {
        let mut tlab = Tlab::new(100, 200, 300);
        tlab.alloc(30);
        assert_eq!(tlab.used(), 30);
        assert_eq!(tlab.remaining(), 70);
    }

    #[test]
    #[should_panic(expected = "tlab invariant violated")]
    fn test_invalid_bounds_are_fatal() {
        let _ = Tlab::new(64, 32, 128);
    }
}
