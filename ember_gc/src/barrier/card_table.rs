//! Card table for the generational write barrier.
//!
//! The heap is divided into `1 << shift` byte cards. A reference store into
//! an object dirties the card holding the object's address; the collector
//! scans only dirty cards for cross-region pointers. Emitted code computes
//! the card address as `biased_begin + (addr >> shift)` and stores the low
//! byte of `biased_begin`, so [`CARD_DIRTY`] is chosen to match it.

use std::sync::atomic::{AtomicU8, Ordering};

/// Clean card value.
pub const CARD_CLEAN: u8 = 0;
/// Dirty card value.
pub const CARD_DIRTY: u8 = 0x70;

/// Card table covering one contiguous address range.
pub struct CardTable {
    /// The card bytes.
    cards: Box<[AtomicU8]>,
    /// Start address of the covered region.
    base: usize,
    /// Log2 of card size.
    shift: u32,
}

impl CardTable {
    /// Create a card table for `[base, base + size)`.
    pub fn new(base: usize, size: usize, shift: u32) -> Self {
        let card_size = 1usize << shift;
        let num_cards = size.div_ceil(card_size);
        let cards: Vec<AtomicU8> = (0..num_cards).map(|_| AtomicU8::new(CARD_CLEAN)).collect();

        Self {
            cards: cards.into_boxed_slice(),
            base,
            shift,
        }
    }

    #[inline]
    fn card_index(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base)?;
        let index = offset >> self.shift;
        (index < self.cards.len()).then_some(index)
    }

    /// Dirty the card covering `addr`. Returns whether it was clean before.
    #[inline]
    pub fn mark(&self, addr: usize) -> bool {
        match self.card_index(addr) {
            Some(index) => self.cards[index].swap(CARD_DIRTY, Ordering::Relaxed) != CARD_DIRTY,
            None => false,
        }
    }

    /// Whether the card covering `addr` is dirty.
    #[inline]
    pub fn is_dirty(&self, addr: usize) -> bool {
        self.card_index(addr)
            .is_some_and(|i| self.cards[i].load(Ordering::Relaxed) == CARD_DIRTY)
    }

    /// Clear the card covering `addr`.
    #[inline]
    pub fn clear(&self, addr: usize) {
        if let Some(index) = self.card_index(addr) {
            self.cards[index].store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Clear all cards.
    pub fn clear_all(&self) {
        for card in self.cards.iter() {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Call `f(card_start, card_end)` for every dirty card.
    pub fn for_each_dirty<F>(&self, mut f: F)
    where
        F: FnMut(usize, usize),
    {
        for (i, card) in self.cards.iter().enumerate() {
            if card.load(Ordering::Relaxed) == CARD_DIRTY {
                let start = self.base + (i << self.shift);
                f(start, start + (1 << self.shift));
            }
        }
    }

    /// Address of the card byte for `addr`, relative to the table start.
    ///
    /// Emitted code adds this to the table's runtime base.
    #[inline]
    pub fn card_address(&self, addr: usize) -> Option<usize> {
        self.card_index(addr)
    }

    /// Number of dirty cards.
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) == CARD_DIRTY)
            .count()
    }

    /// Total number of cards.
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether the table covers nothing.
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Log2 of the card size.
    pub fn shift(&self) -> u32 {
        self.shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_table_creation() {
        let table = CardTable::new(0x1000, 4096, 9);
        assert_eq!(table.len(), 8);
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    fn test_mark_and_clear() {
        let table = CardTable::new(0x1000, 4096, 9);
        assert!(table.mark(0x1200));
        assert!(!table.mark(0x1210));
        assert!(table.is_dirty(0x1200));
        assert!(table.is_dirty(0x13ff));
        assert!(!table.is_dirty(0x1400));

        table.clear(0x1200);
        assert!(!table.is_dirty(0x1200));
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let table = CardTable::new(0x1000, 1024, 9);
        assert!(!table.mark(0x10));
        assert!(!table.mark(0x9000));
        assert_eq!(table.dirty_count(), 0);
        assert_eq!(table.card_address(0x10), None);
    }

    #[test]
    fn test_for_each_dirty() {
        let table = CardTable::new(0, 4096, 10);
        table.mark(100);
        table.mark(3000);

        let mut seen = Vec::new();
        table.for_each_dirty(|start, end| seen.push((start, end)));
        assert_eq!(seen, vec![(0, 1024), (2048, 3072)]);

        table.clear_all();
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    fn test_card_address() {
        let table = CardTable::new(0x4000, 0x4000, 10);
        assert_eq!(table.card_address(0x4000), Some(0));
        assert_eq!(table.card_address(0x4c00), Some(3));
    }
}
