//! Immediate and memory operands.
//!
//! An [`Address`] is encoded once, at construction: the ModR/M byte with an
//! empty reg field, the optional SIB byte, the displacement and the REX X/B
//! bits its registers need. The assembler only merges in the reg/opcode
//! field at emission time.

use super::encoder::{modrm, sib, Mod};
use super::registers::CpuRegister;
use ember_core::bits;

// =============================================================================
// Immediates
// =============================================================================

/// An immediate operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Immediate(pub i64);

impl Immediate {
    /// Value of the immediate.
    #[inline(always)]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Fits a sign-extended 8-bit field.
    #[inline(always)]
    pub const fn is_int8(self) -> bool {
        bits::is_int8(self.0)
    }

    /// Fits an unsigned 8-bit field.
    #[inline(always)]
    pub const fn is_uint8(self) -> bool {
        bits::is_uint8(self.0)
    }

    /// Fits a sign-extended 16-bit field.
    #[inline(always)]
    pub const fn is_int16(self) -> bool {
        bits::is_int16(self.0)
    }

    /// Fits an unsigned 16-bit field.
    #[inline(always)]
    pub const fn is_uint16(self) -> bool {
        bits::is_uint16(self.0)
    }

    /// Fits a sign-extended 32-bit field.
    #[inline(always)]
    pub const fn is_int32(self) -> bool {
        bits::is_int32(self.0)
    }
}

impl From<i32> for Immediate {
    fn from(v: i32) -> Self {
        Immediate(v as i64)
    }
}

impl From<i64> for Immediate {
    fn from(v: i64) -> Self {
        Immediate(v)
    }
}

// =============================================================================
// Scale
// =============================================================================

/// Index scale for SIB addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ScaleFactor {
    Times1 = 0,
    Times2 = 1,
    Times4 = 2,
    Times8 = 3,
}

impl ScaleFactor {
    /// Scale for elements of `size` bytes.
    pub const fn for_size(size: usize) -> ScaleFactor {
        match size {
            1 => ScaleFactor::Times1,
            2 => ScaleFactor::Times2,
            4 => ScaleFactor::Times4,
            8 => ScaleFactor::Times8,
            _ => panic!("no scale factor for element size"),
        }
    }

    /// Multiplier value.
    #[inline(always)]
    pub const fn value(self) -> u8 {
        1 << (self as u8)
    }
}

// =============================================================================
// Address
// =============================================================================

/// Encoded displacement of an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Displacement {
    /// No displacement bytes.
    None,
    /// One sign-extended byte.
    Disp8(i8),
    /// Four bytes.
    Disp32(i32),
}

impl Displacement {
    /// Number of displacement bytes.
    #[inline]
    pub const fn len(self) -> usize {
        match self {
            Displacement::None => 0,
            Displacement::Disp8(_) => 1,
            Displacement::Disp32(_) => 4,
        }
    }

    /// Whether no bytes are emitted.
    #[inline]
    pub const fn is_empty(self) -> bool {
        matches!(self, Displacement::None)
    }
}

/// Memory operand with pre-computed encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    modrm: u8,
    sib: Option<u8>,
    disp: Displacement,
    rex_x: bool,
    rex_b: bool,
    /// Offset into the constant area this operand refers to, if any.
    constant: Option<u32>,
}

impl Address {
    fn with_base(base: CpuRegister, disp: i32) -> (u8, Displacement) {
        if disp == 0 && !base.needs_displacement() {
            (modrm(Mod::Indirect, 0, base.low_bits()), Displacement::None)
        } else if bits::is_int8(disp as i64) {
            (
                modrm(Mod::IndirectDisp8, 0, base.low_bits()),
                Displacement::Disp8(disp as i8),
            )
        } else {
            (
                modrm(Mod::IndirectDisp32, 0, base.low_bits()),
                Displacement::Disp32(disp),
            )
        }
    }

    /// `[base + disp]`.
    pub fn new(base: CpuRegister, disp: i32) -> Self {
        let (m, d) = Self::with_base(base, disp);
        let sib = base
            .needs_sib_as_base()
            .then(|| sib(ScaleFactor::Times1, 0b100, base.low_bits()));
        let m = if sib.is_some() { (m & !0x7) | 0b100 } else { m };
        Address {
            modrm: m,
            sib,
            disp: d,
            rex_x: false,
            rex_b: base.high_bit(),
            constant: None,
        }
    }

    /// `[base + index * scale + disp]`.
    pub fn indexed(base: CpuRegister, index: CpuRegister, scale: ScaleFactor, disp: i32) -> Self {
        ember_core::check!(index != CpuRegister::RSP, "rsp cannot be an index register");
        let (m, d) = Self::with_base(base, disp);
        Address {
            modrm: (m & !0x7) | 0b100,
            sib: Some(sib(scale, index.low_bits(), base.low_bits())),
            disp: d,
            rex_x: index.high_bit(),
            rex_b: base.high_bit(),
            constant: None,
        }
    }

    /// `[index * scale + disp32]` with no base.
    pub fn index_only(index: CpuRegister, scale: ScaleFactor, disp: i32) -> Self {
        ember_core::check!(index != CpuRegister::RSP, "rsp cannot be an index register");
        Address {
            modrm: modrm(Mod::Indirect, 0, 0b100),
            sib: Some(sib(scale, index.low_bits(), 0b101)),
            disp: Displacement::Disp32(disp),
            rex_x: index.high_bit(),
            rex_b: false,
            constant: None,
        }
    }

    /// `[rip + disp32]` on x86-64; the bare `[disp32]` form on x86.
    pub fn rip(disp: i32) -> Self {
        Address {
            modrm: modrm(Mod::Indirect, 0, 0b101),
            sib: None,
            disp: Displacement::Disp32(disp),
            rex_x: false,
            rex_b: false,
            constant: None,
        }
    }

    /// Absolute `[disp32]` via a SIB byte with neither base nor index.
    ///
    /// Used with a segment prefix for thread-local fields.
    pub fn absolute(addr: i32) -> Self {
        Address {
            modrm: modrm(Mod::Indirect, 0, 0b100),
            sib: Some(0x25),
            disp: Displacement::Disp32(addr),
            rex_x: false,
            rex_b: false,
            constant: None,
        }
    }

    /// Literal at `offset` in the constant area.
    ///
    /// The displacement is fixed up when the assembler is finalized.
    pub fn constant_area(offset: u32) -> Self {
        Address {
            constant: Some(offset),
            ..Address::rip(0)
        }
    }

    /// Same location displaced by `extra` bytes.
    pub fn displaced(base: CpuRegister, disp: i32, extra: i32) -> Self {
        Address::new(base, disp + extra)
    }

    /// ModR/M byte with an empty reg field.
    #[inline]
    pub const fn modrm(&self) -> u8 {
        self.modrm
    }

    /// SIB byte, if any.
    #[inline]
    pub const fn sib(&self) -> Option<u8> {
        self.sib
    }

    /// Displacement.
    #[inline]
    pub const fn displacement(&self) -> Displacement {
        self.disp
    }

    /// REX.X needed.
    #[inline]
    pub const fn rex_x(&self) -> bool {
        self.rex_x
    }

    /// REX.B needed.
    #[inline]
    pub const fn rex_b(&self) -> bool {
        self.rex_b
    }

    /// Constant-area offset, for operands created by [`Address::constant_area`].
    #[inline]
    pub const fn constant(&self) -> Option<u32> {
        self.constant
    }

    /// Whether this is the `[rip + disp32]` form.
    #[inline]
    pub const fn is_rip_relative(&self) -> bool {
        self.modrm & 0xC7 == 0x05
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_ranges() {
        assert!(Immediate(127).is_int8());
        assert!(!Immediate(128).is_int8());
        assert!(Immediate(255).is_uint8());
        assert!(Immediate(0xffff).is_uint16());
        assert!(Immediate(-1).is_int32());
        assert!(!Immediate(1 << 40).is_int32());
    }

    #[test]
    fn test_base_only() {
        let a = Address::new(CpuRegister::RAX, 0);
        assert_eq!(a.modrm(), 0x00);
        assert_eq!(a.sib(), None);
        assert_eq!(a.displacement(), Displacement::None);
    }

    #[test]
    fn test_rbp_needs_disp8() {
        let a = Address::new(CpuRegister::RBP, 0);
        assert_eq!(a.modrm(), 0x45);
        assert_eq!(a.displacement(), Displacement::Disp8(0));

        let a = Address::new(CpuRegister::R13, 0);
        assert_eq!(a.modrm(), 0x45);
        assert!(a.rex_b());
    }

    #[test]
    fn test_rsp_needs_sib() {
        let a = Address::new(CpuRegister::RSP, 8);
        assert_eq!(a.modrm(), 0x44);
        assert_eq!(a.sib(), Some(0x24));
        assert_eq!(a.displacement(), Displacement::Disp8(8));

        let a = Address::new(CpuRegister::R12, 0x1000);
        assert_eq!(a.modrm(), 0x84);
        assert_eq!(a.sib(), Some(0x24));
        assert!(a.rex_b());
    }

    #[test]
    fn test_indexed() {
        let a = Address::indexed(CpuRegister::RBX, CpuRegister::R9, ScaleFactor::Times4, 12);
        assert_eq!(a.modrm(), 0x44);
        assert_eq!(a.sib(), Some(0x8B));
        assert!(a.rex_x());
        assert!(!a.rex_b());
    }

    #[test]
    fn test_rip_and_absolute() {
        assert!(Address::rip(16).is_rip_relative());
        assert!(!Address::absolute(16).is_rip_relative());
        assert_eq!(Address::constant_area(24).constant(), Some(24));
    }

    #[test]
    #[should_panic(expected = "rsp cannot be an index register")]
    fn test_rsp_index_is_fatal() {
        let _ = Address::indexed(CpuRegister::RAX, CpuRegister::RSP, ScaleFactor::Times1, 0);
    }
}
