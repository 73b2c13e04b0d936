//! x86/x86-64 register definitions and calling conventions.
//!
//! This module provides:
//! - General-purpose register definitions with their hardware encoding
//! - XMM registers for scalar floating point, SSE and AVX
//! - Condition codes for `jcc`, `setcc` and `cmovcc`
//! - Bitfield register sets
//! - The managed calling convention and the runtime-call convention
//!
//! On 32-bit x86 only the first eight registers of each file exist; the
//! assembler rejects the others when running in that mode.

use std::fmt;

// =============================================================================
// General-Purpose Registers
// =============================================================================

/// General-purpose register with its hardware encoding.
///
/// - Bits 0-2: stored in ModR/M, SIB or the opcode
/// - Bit 3: stored in REX.R, REX.X or REX.B
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum CpuRegister {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl CpuRegister {
    /// All 16 registers in encoding order.
    pub const ALL: [CpuRegister; 16] = [
        CpuRegister::RAX,
        CpuRegister::RCX,
        CpuRegister::RDX,
        CpuRegister::RBX,
        CpuRegister::RSP,
        CpuRegister::RBP,
        CpuRegister::RSI,
        CpuRegister::RDI,
        CpuRegister::R8,
        CpuRegister::R9,
        CpuRegister::R10,
        CpuRegister::R11,
        CpuRegister::R12,
        CpuRegister::R13,
        CpuRegister::R14,
        CpuRegister::R15,
    ];

    /// Hardware encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Bits 0-2 for ModR/M.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    /// Bit 3, carried in a REX prefix.
    #[inline(always)]
    pub const fn high_bit(self) -> bool {
        self.encoding() >= 8
    }

    /// RSP and R12 need a SIB byte when used as a base.
    #[inline(always)]
    pub const fn needs_sib_as_base(self) -> bool {
        self.low_bits() == 4
    }

    /// RBP and R13 cannot use the displacement-free ModR/M form.
    #[inline(always)]
    pub const fn needs_displacement(self) -> bool {
        self.low_bits() == 5
    }

    /// Whether the low byte needs a REX prefix to be addressable (SPL..DIL).
    #[inline(always)]
    pub const fn byte_needs_rex(self) -> bool {
        matches!(self.encoding(), 4..=7)
    }

    /// Convert from an encoding.
    #[inline]
    pub const fn from_encoding(enc: u8) -> Option<CpuRegister> {
        if enc < 16 {
            Some(Self::ALL[enc as usize])
        } else {
            None
        }
    }

    /// 32-bit name.
    pub const fn name_32(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d",
            "r11d", "r12d", "r13d", "r14d", "r15d",
        ];
        NAMES[self as usize]
    }

    /// 64-bit name.
    pub const fn name_64(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        NAMES[self as usize]
    }
}

impl fmt::Display for CpuRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name_64())
    }
}

// =============================================================================
// XMM Registers
// =============================================================================

/// XMM register. AVX instructions use the same encodings for YMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum XmmRegister {
    XMM0 = 0,
    XMM1 = 1,
    XMM2 = 2,
    XMM3 = 3,
    XMM4 = 4,
    XMM5 = 5,
    XMM6 = 6,
    XMM7 = 7,
    XMM8 = 8,
    XMM9 = 9,
    XMM10 = 10,
    XMM11 = 11,
    XMM12 = 12,
    XMM13 = 13,
    XMM14 = 14,
    XMM15 = 15,
}

impl XmmRegister {
    /// All 16 registers.
    pub const ALL: [XmmRegister; 16] = [
        XmmRegister::XMM0,
        XmmRegister::XMM1,
        XmmRegister::XMM2,
        XmmRegister::XMM3,
        XmmRegister::XMM4,
        XmmRegister::XMM5,
        XmmRegister::XMM6,
        XmmRegister::XMM7,
        XmmRegister::XMM8,
        XmmRegister::XMM9,
        XmmRegister::XMM10,
        XmmRegister::XMM11,
        XmmRegister::XMM12,
        XmmRegister::XMM13,
        XmmRegister::XMM14,
        XmmRegister::XMM15,
    ];

    /// Hardware encoding.
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Bits 0-2 for ModR/M.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    /// Bit 3, carried in REX or VEX.
    #[inline(always)]
    pub const fn high_bit(self) -> bool {
        self.encoding() >= 8
    }

    /// Convert from an encoding.
    #[inline]
    pub const fn from_encoding(enc: u8) -> Option<XmmRegister> {
        if enc < 16 {
            Some(Self::ALL[enc as usize])
        } else {
            None
        }
    }
}

impl fmt::Display for XmmRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.encoding())
    }
}

// =============================================================================
// Condition Codes
// =============================================================================

/// x86 condition codes (the low nibble of `jcc`/`setcc`/`cmovcc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Condition {
    Overflow = 0,
    NoOverflow = 1,
    Below = 2,
    AboveEqual = 3,
    Equal = 4,
    NotEqual = 5,
    BelowEqual = 6,
    Above = 7,
    Sign = 8,
    NotSign = 9,
    ParityEven = 10,
    ParityOdd = 11,
    Less = 12,
    GreaterEqual = 13,
    LessEqual = 14,
    Greater = 15,
}

impl Condition {
    /// Alias used after `bt`: carry set.
    pub const CARRY: Condition = Condition::Below;
    /// Alias used after `bt`: carry clear.
    pub const NOT_CARRY: Condition = Condition::AboveEqual;
    /// Alias: zero flag set.
    pub const ZERO: Condition = Condition::Equal;
    /// Alias: zero flag clear.
    pub const NOT_ZERO: Condition = Condition::NotEqual;

    /// Condition code nibble.
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// The opposite condition.
    #[inline]
    pub const fn negate(self) -> Condition {
        const ALL: [Condition; 16] = [
            Condition::Overflow,
            Condition::NoOverflow,
            Condition::Below,
            Condition::AboveEqual,
            Condition::Equal,
            Condition::NotEqual,
            Condition::BelowEqual,
            Condition::Above,
            Condition::Sign,
            Condition::NotSign,
            Condition::ParityEven,
            Condition::ParityOdd,
            Condition::Less,
            Condition::GreaterEqual,
            Condition::LessEqual,
            Condition::Greater,
        ];
        ALL[(self as u8 ^ 1) as usize]
    }
}

// =============================================================================
// Register Sets
// =============================================================================

/// A set of general-purpose registers as a 16-bit bitfield.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct RegisterSet(u16);

impl RegisterSet {
    /// Empty set.
    pub const EMPTY: RegisterSet = RegisterSet(0);

    /// All 16 registers.
    pub const ALL: RegisterSet = RegisterSet(0xFFFF);

    /// Set containing a single register.
    #[inline(always)]
    pub const fn singleton(reg: CpuRegister) -> Self {
        RegisterSet(1 << reg.encoding())
    }

    /// Create from a raw bitmask.
    #[inline(always)]
    pub const fn from_bits(bits: u16) -> Self {
        RegisterSet(bits)
    }

    /// Raw bitmask.
    #[inline(always)]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Membership test.
    #[inline(always)]
    pub const fn contains(self, reg: CpuRegister) -> bool {
        (self.0 & (1 << reg.encoding())) != 0
    }

    /// Add a register.
    #[inline(always)]
    pub const fn insert(self, reg: CpuRegister) -> Self {
        RegisterSet(self.0 | (1 << reg.encoding()))
    }

    /// Remove a register.
    #[inline(always)]
    pub const fn remove(self, reg: CpuRegister) -> Self {
        RegisterSet(self.0 & !(1 << reg.encoding()))
    }

    /// Union of two sets.
    #[inline(always)]
    pub const fn union(self, other: RegisterSet) -> Self {
        RegisterSet(self.0 | other.0)
    }

    /// Intersection of two sets.
    #[inline(always)]
    pub const fn intersection(self, other: RegisterSet) -> Self {
        RegisterSet(self.0 & other.0)
    }

    /// Difference (self - other).
    #[inline(always)]
    pub const fn difference(self, other: RegisterSet) -> Self {
        RegisterSet(self.0 & !other.0)
    }

    /// Whether the set is empty.
    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of registers in the set.
    #[inline(always)]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest-numbered register in the set.
    #[inline]
    pub const fn first(self) -> Option<CpuRegister> {
        if self.0 == 0 {
            None
        } else {
            CpuRegister::from_encoding(self.0.trailing_zeros() as u8)
        }
    }

    /// Registers in ascending encoding order.
    pub fn iter(self) -> impl DoubleEndedIterator<Item = CpuRegister> {
        CpuRegister::ALL
            .into_iter()
            .filter(move |r| self.contains(*r))
    }
}

impl fmt::Debug for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A set of XMM registers as a 16-bit bitfield.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct XmmSet(u16);

impl XmmSet {
    /// Empty set.
    pub const EMPTY: XmmSet = XmmSet(0);

    /// All 16 registers.
    pub const ALL: XmmSet = XmmSet(0xFFFF);

    /// Set containing a single register.
    #[inline(always)]
    pub const fn singleton(reg: XmmRegister) -> Self {
        XmmSet(1 << reg.encoding())
    }

    /// Create from a raw bitmask.
    #[inline(always)]
    pub const fn from_bits(bits: u16) -> Self {
        XmmSet(bits)
    }

    /// Raw bitmask.
    #[inline(always)]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Membership test.
    #[inline(always)]
    pub const fn contains(self, reg: XmmRegister) -> bool {
        (self.0 & (1 << reg.encoding())) != 0
    }

    /// Add a register.
    #[inline(always)]
    pub const fn insert(self, reg: XmmRegister) -> Self {
        XmmSet(self.0 | (1 << reg.encoding()))
    }

    /// Remove a register.
    #[inline(always)]
    pub const fn remove(self, reg: XmmRegister) -> Self {
        XmmSet(self.0 & !(1 << reg.encoding()))
    }

    /// Union of two sets.
    #[inline(always)]
    pub const fn union(self, other: XmmSet) -> Self {
        XmmSet(self.0 | other.0)
    }

    /// Difference (self - other).
    #[inline(always)]
    pub const fn difference(self, other: XmmSet) -> Self {
        XmmSet(self.0 & !other.0)
    }

    /// Whether the set is empty.
    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of registers in the set.
    #[inline(always)]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Registers in ascending encoding order.
    pub fn iter(self) -> impl DoubleEndedIterator<Item = XmmRegister> {
        XmmRegister::ALL
            .into_iter()
            .filter(move |r| self.contains(*r))
    }
}

impl fmt::Debug for XmmSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// =============================================================================
// Calling Conventions
// =============================================================================

/// Register assignment for calls between compiled managed methods.
///
/// The callee method pointer travels in RDI; arguments follow in the
/// remaining System V integer registers and the first eight XMMs.
pub struct ManagedCallingConvention;

impl ManagedCallingConvention {
    /// Register holding the callee method.
    pub const METHOD_REGISTER: CpuRegister = CpuRegister::RDI;

    /// Integer/reference argument registers, after the method register.
    pub const CORE_ARGUMENTS: [CpuRegister; 5] = [
        CpuRegister::RSI,
        CpuRegister::RDX,
        CpuRegister::RCX,
        CpuRegister::R8,
        CpuRegister::R9,
    ];

    /// Floating-point argument registers.
    pub const FPU_ARGUMENTS: [XmmRegister; 8] = [
        XmmRegister::XMM0,
        XmmRegister::XMM1,
        XmmRegister::XMM2,
        XmmRegister::XMM3,
        XmmRegister::XMM4,
        XmmRegister::XMM5,
        XmmRegister::XMM6,
        XmmRegister::XMM7,
    ];

    /// Integer return register.
    pub const CORE_RETURN: CpuRegister = CpuRegister::RAX;

    /// Floating-point return register.
    pub const FPU_RETURN: XmmRegister = XmmRegister::XMM0;

    /// Core registers preserved across managed calls: RBX, RBP, R12-R15.
    pub const CALLEE_SAVES: RegisterSet = RegisterSet::from_bits(0xF028);

    /// FPU registers preserved across managed calls: XMM12-XMM15.
    pub const FPU_CALLEE_SAVES: XmmSet = XmmSet::from_bits(0xF000);

    /// Scratch register never handed to the register allocator.
    pub const SCRATCH: CpuRegister = CpuRegister::R11;

    /// Stack alignment at call sites.
    pub const STACK_ALIGNMENT: usize = 16;
}

/// Register assignment for calls into runtime entrypoints (System V).
pub struct RuntimeCallingConvention;

impl RuntimeCallingConvention {
    /// Integer argument registers.
    pub const CORE_ARGUMENTS: [CpuRegister; 6] = [
        CpuRegister::RDI,
        CpuRegister::RSI,
        CpuRegister::RDX,
        CpuRegister::RCX,
        CpuRegister::R8,
        CpuRegister::R9,
    ];

    /// Floating-point argument registers.
    pub const FPU_ARGUMENTS: [XmmRegister; 4] = [
        XmmRegister::XMM0,
        XmmRegister::XMM1,
        XmmRegister::XMM2,
        XmmRegister::XMM3,
    ];

    /// Registers clobbered by a runtime call: RAX, RCX, RDX, RSI, RDI, R8-R11.
    pub const CALLER_SAVES: RegisterSet = RegisterSet::from_bits(0x0FC7);

    /// All XMMs are clobbered.
    pub const FPU_CALLER_SAVES: XmmSet = XmmSet::ALL;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_encoding() {
        assert_eq!(CpuRegister::RAX.encoding(), 0);
        assert_eq!(CpuRegister::R8.encoding(), 8);
        assert!(CpuRegister::R15.high_bit());
        assert_eq!(CpuRegister::R12.low_bits(), 4);
        assert!(CpuRegister::R12.needs_sib_as_base());
        assert!(CpuRegister::R13.needs_displacement());
        assert!(CpuRegister::RSI.byte_needs_rex());
        assert!(!CpuRegister::RBX.byte_needs_rex());
        assert_eq!(CpuRegister::from_encoding(16), None);
    }

    #[test]
    fn test_register_names() {
        assert_eq!(CpuRegister::R9.name_32(), "r9d");
        assert_eq!(CpuRegister::RDI.to_string(), "rdi");
        assert_eq!(XmmRegister::XMM14.to_string(), "xmm14");
    }

    #[test]
    fn test_condition_negate() {
        assert_eq!(Condition::Equal.negate(), Condition::NotEqual);
        assert_eq!(Condition::Less.negate(), Condition::GreaterEqual);
        assert_eq!(Condition::Above.negate(), Condition::BelowEqual);
        assert_eq!(Condition::CARRY, Condition::Below);
    }

    #[test]
    fn test_register_set() {
        let set = RegisterSet::EMPTY
            .insert(CpuRegister::RAX)
            .insert(CpuRegister::R12);
        assert!(set.contains(CpuRegister::R12));
        assert_eq!(set.count(), 2);
        assert_eq!(set.first(), Some(CpuRegister::RAX));
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![CpuRegister::RAX, CpuRegister::R12]
        );
        assert!(set.remove(CpuRegister::RAX).remove(CpuRegister::R12).is_empty());
    }

    #[test]
    fn test_callee_saves() {
        let saves = ManagedCallingConvention::CALLEE_SAVES;
        for reg in [
            CpuRegister::RBX,
            CpuRegister::RBP,
            CpuRegister::R12,
            CpuRegister::R13,
            CpuRegister::R14,
            CpuRegister::R15,
        ] {
            assert!(saves.contains(reg));
        }
        assert_eq!(saves.count(), 6);
        assert!(
            saves
                .intersection(RuntimeCallingConvention::CALLER_SAVES)
                .is_empty()
        );
        assert_eq!(ManagedCallingConvention::FPU_CALLEE_SAVES.count(), 4);
    }
}
