//! Stack maps for GC safepoints.
//!
//! Every call site and implicit-fault site records the native PC, the dex PC
//! it maps back to, and which registers and frame slots hold references.
//! Entries are sorted by native PC for binary-search lookup during stack
//! walks.

// =============================================================================
// Entry
// =============================================================================

/// Why a stack map was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafepointKind {
    /// Return address of a call.
    Call,
    /// Instruction that may fault (implicit null check, stack probe).
    ImplicitFault,
    /// Slow-path call with live registers spilled.
    SlowPath,
}

/// A single safepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackMapEntry {
    /// Offset from the method's code start.
    pub native_pc: u32,
    pub dex_pc: u32,
    pub kind: SafepointKind,
    /// Bit `n` set: core register `n` holds a reference. At slow-path
    /// safepoints the register has been saved to the frame's save area.
    pub register_mask: u16,
    /// Bit `n` set: the 4-byte frame slot at `[sp + 4n]` holds a reference.
    pub stack_mask: u64,
}

impl StackMapEntry {
    #[inline]
    pub const fn is_register_live(&self, reg: u8) -> bool {
        self.register_mask & (1 << reg) != 0
    }

    #[inline]
    pub const fn is_stack_slot_live(&self, slot: u8) -> bool {
        self.stack_mask & (1 << slot) != 0
    }

    #[inline]
    pub fn live_registers(&self) -> LiveBitmapIter<u16> {
        LiveBitmapIter { bitmap: self.register_mask }
    }

    /// Frame offsets of live reference slots.
    pub fn live_stack_offsets(&self) -> impl Iterator<Item = i32> {
        LiveBitmapIter { bitmap: self.stack_mask }.map(|bit| bit as i32 * 4)
    }
}

// =============================================================================
// LiveBitmapIter
// =============================================================================

/// Iterator over set bits, lowest first.
#[derive(Debug, Clone)]
pub struct LiveBitmapIter<T> {
    bitmap: T,
}

macro_rules! bitmap_iter {
    ($($ty:ty),*) => {$(
        impl Iterator for LiveBitmapIter<$ty> {
            type Item = u8;

            #[inline]
            fn next(&mut self) -> Option<u8> {
                if self.bitmap == 0 {
                    return None;
                }
                let bit = self.bitmap.trailing_zeros() as u8;
                self.bitmap &= self.bitmap - 1;
                Some(bit)
            }

            #[inline]
            fn size_hint(&self) -> (usize, Option<usize>) {
                let n = self.bitmap.count_ones() as usize;
                (n, Some(n))
            }
        }

        impl ExactSizeIterator for LiveBitmapIter<$ty> {}
    )*};
}

bitmap_iter!(u16, u64);

// =============================================================================
// StackMap
// =============================================================================

/// All safepoints of one compiled method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackMap {
    pub frame_size: u32,
    pub core_spill_mask: u16,
    pub fpu_spill_mask: u16,
    /// SP-relative start of the slow-path register save area; core register
    /// `n` is saved at `save_area_offset + 8n`.
    pub save_area_offset: Option<u32>,
    entries: Box<[StackMapEntry]>,
}

impl StackMap {
    /// Entry recorded exactly at `native_pc`.
    pub fn lookup(&self, native_pc: u32) -> Option<&StackMapEntry> {
        self.entries
            .binary_search_by_key(&native_pc, |e| e.native_pc)
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Entry at `native_pc` or the closest one before it.
    pub fn lookup_at_or_before(&self, native_pc: u32) -> Option<&StackMapEntry> {
        match self.entries.binary_search_by_key(&native_pc, |e| e.native_pc) {
            Ok(i) => Some(&self.entries[i]),
            Err(0) => None,
            Err(i) => Some(&self.entries[i - 1]),
        }
    }

    /// Native PC recorded for `dex_pc`, if any.
    pub fn native_pc_for(&self, dex_pc: u32) -> Option<u32> {
        self.entries.iter().find(|e| e.dex_pc == dex_pc).map(|e| e.native_pc)
    }

    pub fn entries(&self) -> &[StackMapEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Collects safepoints during emission.
#[derive(Debug, Default)]
pub struct StackMapBuilder {
    entries: Vec<StackMapEntry>,
}

impl StackMapBuilder {
    pub fn new() -> Self {
        Self { entries: Vec::with_capacity(16) }
    }

    pub fn add(&mut self, entry: StackMapEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sort and freeze. A later entry at the same PC replaces an earlier one.
    pub fn finish(mut self, frame_size: u32, core_spill_mask: u16, fpu_spill_mask: u16) -> StackMap {
        self.entries.sort_by_key(|e| e.native_pc);
        self.entries.dedup_by(|later, earlier| {
            if later.native_pc == earlier.native_pc {
                *earlier = *later;
                true
            } else {
                false
            }
        });
        StackMap {
            frame_size,
            core_spill_mask,
            fpu_spill_mask,
            save_area_offset: None,
            entries: self.entries.into_boxed_slice(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(native_pc: u32, dex_pc: u32, regs: u16, stack: u64) -> StackMapEntry {
        StackMapEntry {
            native_pc,
            dex_pc,
            kind: SafepointKind::Call,
            register_mask: regs,
            stack_mask: stack,
        }
    }

    #[test]
    fn test_sorted_lookup() {
        let mut b = StackMapBuilder::new();
        b.add(entry(0x20, 5, 0, 0b10));
        b.add(entry(0x10, 2, 0b1, 0));
        let map = b.finish(48, 0, 0);
        assert_eq!(map.len(), 2);
        assert_eq!(map.lookup(0x10).map(|e| e.dex_pc), Some(2));
        assert!(map.lookup(0x18).is_none());
        assert_eq!(map.lookup_at_or_before(0x18).map(|e| e.dex_pc), Some(2));
        assert!(map.lookup_at_or_before(0x8).is_none());
        assert_eq!(map.native_pc_for(5), Some(0x20));
    }

    #[test]
    fn test_same_pc_keeps_latest() {
        let mut b = StackMapBuilder::new();
        b.add(entry(0x10, 1, 0, 0));
        b.add(entry(0x10, 9, 0, 0));
        let map = b.finish(16, 0, 0);
        assert_eq!(map.len(), 1);
        assert_eq!(map.entries()[0].dex_pc, 9);
    }

    #[test]
    fn test_bitmaps() {
        let e = entry(0, 0, 0b1000_0001, 0b1100);
        assert!(e.is_register_live(7));
        assert!(!e.is_register_live(1));
        assert_eq!(e.live_registers().collect::<Vec<_>>(), vec![0, 7]);
        assert_eq!(e.live_stack_offsets().collect::<Vec<_>>(), vec![8, 12]);
        assert!(e.is_stack_slot_live(3));
    }
}
