//! Untyped managed values.

use ember_core::ObjRef;

/// A value of any managed type: the interpreter's result register and the
/// currency of native calls.
///
/// Primitive bits and the reference are stored separately so that a
/// reference is always visible to root visitors regardless of how it was
/// produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JValue {
    bits: u64,
    reference: Option<ObjRef>,
}

impl JValue {
    pub const VOID: JValue = JValue {
        bits: 0,
        reference: None,
    };

    #[inline]
    pub const fn from_int(v: i32) -> Self {
        Self {
            bits: v as u32 as u64,
            reference: None,
        }
    }

    #[inline]
    pub const fn from_long(v: i64) -> Self {
        Self {
            bits: v as u64,
            reference: None,
        }
    }

    #[inline]
    pub fn from_float(v: f32) -> Self {
        Self::from_int(v.to_bits() as i32)
    }

    #[inline]
    pub fn from_double(v: f64) -> Self {
        Self::from_long(v.to_bits() as i64)
    }

    #[inline]
    pub const fn from_ref(r: Option<ObjRef>) -> Self {
        Self { bits: 0, reference: r }
    }

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self { bits, reference: None }
    }

    #[inline]
    pub const fn int(&self) -> i32 {
        self.bits as u32 as i32
    }

    #[inline]
    pub const fn long(&self) -> i64 {
        self.bits as i64
    }

    #[inline]
    pub fn float(&self) -> f32 {
        f32::from_bits(self.bits as u32)
    }

    #[inline]
    pub fn double(&self) -> f64 {
        f64::from_bits(self.bits)
    }

    #[inline]
    pub const fn reference(&self) -> Option<ObjRef> {
        self.reference
    }

    #[inline]
    pub const fn bits(&self) -> u64 {
        self.bits
    }

    #[inline]
    pub fn reference_mut(&mut self) -> &mut Option<ObjRef> {
        &mut self.reference
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views() {
        assert_eq!(JValue::from_int(-1).int(), -1);
        assert_eq!(JValue::from_int(-1).long(), 0xffff_ffff);
        assert_eq!(JValue::from_long(-5).long(), -5);
        assert_eq!(JValue::from_float(1.5).float(), 1.5);
        assert_eq!(JValue::from_double(-2.25).double(), -2.25);
        let r = ObjRef::from_index(4);
        assert_eq!(JValue::from_ref(Some(r)).reference(), Some(r));
        assert_eq!(JValue::VOID, JValue::default());
    }
}
