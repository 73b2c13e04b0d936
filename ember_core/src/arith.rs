//! Managed-language arithmetic semantics.
//!
//! Integer operations wrap in two's complement, shifts mask their
//! distance, float-to-integer conversions saturate and map NaN to zero,
//! and the two floating compare flavours differ only in how NaN is biased.

/// Outcome of an integer division or remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivOutcome<T> {
    /// The operation produced a value.
    Value(T),
    /// The divisor was zero; the caller throws `ArithmeticException`.
    DivideByZero,
}

/// Wrapping addition.
#[inline]
pub fn safe_add<T: WrappingOps>(a: T, b: T) -> T {
    a.wrapping_add_(b)
}

/// Wrapping subtraction.
#[inline]
pub fn safe_sub<T: WrappingOps>(a: T, b: T) -> T {
    a.wrapping_sub_(b)
}

/// Wrapping multiplication.
#[inline]
pub fn safe_mul<T: WrappingOps>(a: T, b: T) -> T {
    a.wrapping_mul_(b)
}

/// Integer types with two's-complement wrapping arithmetic.
pub trait WrappingOps: Copy {
    /// `self + rhs` modulo 2^N.
    fn wrapping_add_(self, rhs: Self) -> Self;
    /// `self - rhs` modulo 2^N.
    fn wrapping_sub_(self, rhs: Self) -> Self;
    /// `self * rhs` modulo 2^N.
    fn wrapping_mul_(self, rhs: Self) -> Self;
}

macro_rules! impl_wrapping {
    ($($t:ty),*) => {$(
        impl WrappingOps for $t {
            #[inline]
            fn wrapping_add_(self, rhs: Self) -> Self { self.wrapping_add(rhs) }
            #[inline]
            fn wrapping_sub_(self, rhs: Self) -> Self { self.wrapping_sub(rhs) }
            #[inline]
            fn wrapping_mul_(self, rhs: Self) -> Self { self.wrapping_mul(rhs) }
        }
    )*};
}

impl_wrapping!(i32, i64);

/// `int` division: MIN / -1 yields MIN.
#[inline]
pub fn div_int(a: i32, b: i32) -> DivOutcome<i32> {
    if b == 0 {
        DivOutcome::DivideByZero
    } else {
        DivOutcome::Value(a.wrapping_div(b))
    }
}

/// `int` remainder: MIN % -1 yields 0.
#[inline]
pub fn rem_int(a: i32, b: i32) -> DivOutcome<i32> {
    if b == 0 {
        DivOutcome::DivideByZero
    } else {
        DivOutcome::Value(a.wrapping_rem(b))
    }
}

/// `long` division: MIN / -1 yields MIN.
#[inline]
pub fn div_long(a: i64, b: i64) -> DivOutcome<i64> {
    if b == 0 {
        DivOutcome::DivideByZero
    } else {
        DivOutcome::Value(a.wrapping_div(b))
    }
}

/// `long` remainder: MIN % -1 yields 0.
#[inline]
pub fn rem_long(a: i64, b: i64) -> DivOutcome<i64> {
    if b == 0 {
        DivOutcome::DivideByZero
    } else {
        DivOutcome::Value(a.wrapping_rem(b))
    }
}

/// `shl-int`: distance masked to 5 bits.
#[inline]
pub fn shl_int(a: i32, distance: i32) -> i32 {
    a.wrapping_shl((distance & 0x1f) as u32)
}

/// `shr-int`: arithmetic, distance masked to 5 bits.
#[inline]
pub fn shr_int(a: i32, distance: i32) -> i32 {
    a.wrapping_shr((distance & 0x1f) as u32)
}

/// `ushr-int`: logical, distance masked to 5 bits.
#[inline]
pub fn ushr_int(a: i32, distance: i32) -> i32 {
    ((a as u32) >> (distance & 0x1f)) as i32
}

/// `shl-long`: distance masked to 6 bits.
#[inline]
pub fn shl_long(a: i64, distance: i32) -> i64 {
    a.wrapping_shl((distance & 0x3f) as u32)
}

/// `shr-long`: arithmetic, distance masked to 6 bits.
#[inline]
pub fn shr_long(a: i64, distance: i32) -> i64 {
    a.wrapping_shr((distance & 0x3f) as u32)
}

/// `ushr-long`: logical, distance masked to 6 bits.
#[inline]
pub fn ushr_long(a: i64, distance: i32) -> i64 {
    ((a as u64) >> (distance & 0x3f)) as i64
}

/// `cmpl-float`: NaN compares as less (-1).
#[inline]
pub fn cmpl_float(a: f32, b: f32) -> i32 {
    if a > b {
        1
    } else if a == b {
        0
    } else {
        -1
    }
}

/// `cmpg-float`: NaN compares as greater (+1).
#[inline]
pub fn cmpg_float(a: f32, b: f32) -> i32 {
    if a < b {
        -1
    } else if a == b {
        0
    } else {
        1
    }
}

/// `cmpl-double`: NaN compares as less (-1).
#[inline]
pub fn cmpl_double(a: f64, b: f64) -> i32 {
    if a > b {
        1
    } else if a == b {
        0
    } else {
        -1
    }
}

/// `cmpg-double`: NaN compares as greater (+1).
#[inline]
pub fn cmpg_double(a: f64, b: f64) -> i32 {
    if a < b {
        -1
    } else if a == b {
        0
    } else {
        1
    }
}

/// `cmp-long`.
#[inline]
pub fn cmp_long(a: i64, b: i64) -> i32 {
    a.cmp(&b) as i32
}

/// `float-to-int`: saturating, NaN becomes 0.
#[inline]
pub fn f2i(v: f32) -> i32 {
    // Rust `as` casts already saturate and map NaN to 0.
    v as i32
}

/// `float-to-long`: saturating, NaN becomes 0.
#[inline]
pub fn f2l(v: f32) -> i64 {
    v as i64
}

/// `double-to-int`: saturating, NaN becomes 0.
#[inline]
pub fn d2i(v: f64) -> i32 {
    v as i32
}

/// `double-to-long`: saturating, NaN becomes 0.
#[inline]
pub fn d2l(v: f64) -> i64 {
    v as i64
}

/// `rem-float`: C `fmodf` semantics.
#[inline]
pub fn rem_float(a: f32, b: f32) -> f32 {
    a % b
}

/// `rem-double`: C `fmod` semantics.
#[inline]
pub fn rem_double(a: f64, b: f64) -> f64 {
    a % b
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_division_edge_cases() {
        assert_eq!(div_int(i32::MIN, -1), DivOutcome::Value(i32::MIN));
        assert_eq!(rem_int(i32::MIN, -1), DivOutcome::Value(0));
        assert_eq!(div_int(7, 0), DivOutcome::DivideByZero);
        assert_eq!(div_long(i64::MIN, -1), DivOutcome::Value(i64::MIN));
        assert_eq!(rem_long(5, 0), DivOutcome::DivideByZero);
        assert_eq!(div_int(-7, 2), DivOutcome::Value(-3));
        assert_eq!(rem_int(-7, 2), DivOutcome::Value(-1));
    }

    #[test]
    fn test_shift_masking() {
        assert_eq!(shl_int(1, 33), 2);
        assert_eq!(ushr_int(-1, 28), 0xf);
        assert_eq!(shr_int(-16, 2), -4);
        assert_eq!(shl_long(1, 65), 2);
        assert_eq!(ushr_long(-1, 60), 0xf);
    }

    #[test]
    fn test_nan_compare_bias() {
        assert_eq!(cmpl_float(f32::NAN, 0.0), -1);
        assert_eq!(cmpg_float(f32::NAN, 0.0), 1);
        assert_eq!(cmpl_double(0.0, f64::NAN), -1);
        assert_eq!(cmpg_double(0.0, f64::NAN), 1);
        assert_eq!(cmpl_float(0.0, -0.0), 0);
    }

    #[test]
    fn test_saturating_conversions() {
        assert_eq!(f2i(f32::NAN), 0);
        assert_eq!(f2i(1e20), i32::MAX);
        assert_eq!(d2l(-1e300), i64::MIN);
        assert_eq!(d2i(-2.9), -2);
    }

    proptest! {
        #[test]
        fn prop_add_int_wraps(x: i32, y: i32) {
            let expected = ((x as i64 + y as i64) as u64 & 0xffff_ffff) as u32 as i32;
            prop_assert_eq!(safe_add(x, y), expected);
        }

        #[test]
        fn prop_mul_int_wraps(x: i32, y: i32) {
            let expected = ((x as i64).wrapping_mul(y as i64) as u64 & 0xffff_ffff) as u32 as i32;
            prop_assert_eq!(safe_mul(x, y), expected);
        }

        #[test]
        fn prop_float_compare_sign(a in -1.0e6f32..1.0e6, b in -1.0e6f32..1.0e6) {
            let expected = if a > b { 1 } else if a < b { -1 } else { 0 };
            prop_assert_eq!(cmpl_float(a, b), expected);
            prop_assert_eq!(cmpg_float(a, b), expected);
        }

        #[test]
        fn prop_double_compare_sign(a in -1.0e12f64..1.0e12, b in -1.0e12f64..1.0e12) {
            let expected = if a > b { 1 } else if a < b { -1 } else { 0 };
            prop_assert_eq!(cmpl_double(a, b), expected);
            prop_assert_eq!(cmpg_double(a, b), expected);
        }
    }
}
