//! Range predicates and bit helpers.
//!
//! The assembler checks every immediate and displacement against these
//! before choosing an encoding; the decoder uses the sign-extension helpers.

/// Value fits a signed 8-bit immediate.
#[inline]
pub const fn is_int8(v: i64) -> bool {
    v >= i8::MIN as i64 && v <= i8::MAX as i64
}

/// Value fits an unsigned 8-bit immediate.
#[inline]
pub const fn is_uint8(v: i64) -> bool {
    v >= 0 && v <= u8::MAX as i64
}

/// Value fits a signed 16-bit immediate.
#[inline]
pub const fn is_int16(v: i64) -> bool {
    v >= i16::MIN as i64 && v <= i16::MAX as i64
}

/// Value fits an unsigned 16-bit immediate.
#[inline]
pub const fn is_uint16(v: i64) -> bool {
    v >= 0 && v <= u16::MAX as i64
}

/// Value fits a signed 32-bit immediate.
#[inline]
pub const fn is_int32(v: i64) -> bool {
    v >= i32::MIN as i64 && v <= i32::MAX as i64
}

/// Value fits an unsigned 32-bit immediate.
#[inline]
pub const fn is_uint32(v: i64) -> bool {
    v >= 0 && v <= u32::MAX as i64
}

/// High 32 bits of a 64-bit value.
#[inline]
pub const fn high32(v: i64) -> i32 {
    (v >> 32) as i32
}

/// Low 32 bits of a 64-bit value.
#[inline]
pub const fn low32(v: i64) -> i32 {
    v as i32
}

/// Round `value` up to a multiple of `alignment` (a power of two).
#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Whether `value` is a multiple of `alignment` (a power of two).
#[inline]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

/// Sign-extend the low `bits` bits of `value`.
#[inline]
pub const fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_ranges() {
        assert!(is_int8(127));
        assert!(is_int8(-128));
        assert!(!is_int8(128));
        assert!(is_uint16(65535));
        assert!(!is_uint16(-1));
        assert!(is_int32(i32::MIN as i64));
        assert!(!is_int32(i32::MAX as i64 + 1));
        assert!(is_uint32(u32::MAX as i64));
    }

    #[test]
    fn test_halves() {
        let v = 0x1234_5678_9abc_def0u64 as i64;
        assert_eq!(high32(v), 0x1234_5678);
        assert_eq!(low32(v), 0x9abc_def0u32 as i32);
    }

    #[test]
    fn test_align_and_sign_extend() {
        assert_eq!(align_up(13, 8), 16);
        assert_eq!(align_up(16, 8), 16);
        assert!(is_aligned(64, 16));
        assert_eq!(sign_extend(0xF, 4), -1);
        assert_eq!(sign_extend(0x7, 4), 7);
        assert_eq!(sign_extend(0x80, 8), -128);
    }
}
