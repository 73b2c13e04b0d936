//! Literal pool appended after the code.
//!
//! Entries are 32-bit slots. 32-bit literals are deduplicated by value; a
//! 64-bit literal reuses any two consecutive slots that already hold its
//! low and high halves, even if they were added as separate 32-bit values.

use ember_core::bits::{high32, low32};
use rustc_hash::FxHashMap;

/// Pool of literals addressed by byte offset from the area start.
#[derive(Debug, Default, Clone)]
pub struct ConstantArea {
    slots: Vec<i32>,
    first_index: FxHashMap<i32, usize>,
}

impl ConstantArea {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append without deduplication. Returns the byte offset.
    pub fn append_int32(&mut self, value: i32) -> u32 {
        let index = self.slots.len();
        self.slots.push(value);
        self.first_index.entry(value).or_insert(index);
        (index * 4) as u32
    }

    /// Add a 32-bit literal, reusing an existing slot with the same value.
    pub fn add_int32(&mut self, value: i32) -> u32 {
        match self.first_index.get(&value) {
            Some(&index) => (index * 4) as u32,
            None => self.append_int32(value),
        }
    }

    /// Add a 64-bit literal, reusing two consecutive matching slots.
    pub fn add_int64(&mut self, value: i64) -> u32 {
        let (lo, hi) = (low32(value), high32(value));
        if let Some(index) = self.slots.windows(2).position(|w| w[0] == lo && w[1] == hi) {
            return (index * 4) as u32;
        }
        let offset = self.append_int32(lo);
        self.append_int32(hi);
        offset
    }

    /// Add a `float` literal by bit pattern.
    pub fn add_float(&mut self, value: f32) -> u32 {
        self.add_int32(value.to_bits() as i32)
    }

    /// Add a `double` literal by bit pattern.
    pub fn add_double(&mut self, value: f64) -> u32 {
        self.add_int64(value.to_bits() as i64)
    }

    /// Size of the pool in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.slots.len() * 4
    }

    /// Whether the pool is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots in order.
    pub fn slots(&self) -> &[i32] {
        &self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int32_dedup() {
        let mut area = ConstantArea::new();
        let a = area.add_int32(42);
        let b = area.add_int32(7);
        assert_eq!(area.add_int32(42), a);
        assert_eq!(b, 4);
        assert_eq!(area.size(), 8);
    }

    #[test]
    fn test_append_never_dedups() {
        let mut area = ConstantArea::new();
        area.append_int32(1);
        assert_eq!(area.append_int32(1), 4);
        assert_eq!(area.add_int32(1), 0);
    }

    #[test]
    fn test_int64_matches_consecutive_pair() {
        let mut area = ConstantArea::new();
        area.add_int32(0x2222);
        area.add_int32(0x1111);
        // Halves 0x1111 (low) and 0x3333 (high) are not adjacent yet.
        let off = area.add_int64(0x3333_i64 << 32 | 0x1111);
        assert_eq!(off, 8);
        assert_eq!(area.size(), 16);

        // Low 0x2222, high 0x1111 sits in slots 0 and 1.
        assert_eq!(area.add_int64(0x1111_i64 << 32 | 0x2222), 0);
        assert_eq!(area.add_int64(0x3333_i64 << 32 | 0x1111), 8);
        assert_eq!(area.size(), 16);
    }

    #[test]
    fn test_float_and_double() {
        let mut area = ConstantArea::new();
        let f = area.add_float(1.5);
        assert_eq!(area.add_float(1.5), f);
        let d = area.add_double(-0.0);
        assert_eq!(area.add_double(-0.0), d);
        assert_ne!(area.add_double(0.0), d);
        assert_eq!(area.slots()[0], 1.5f32.to_bits() as i32);
    }
}
