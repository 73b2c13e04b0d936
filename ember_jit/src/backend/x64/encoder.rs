//! Prefix, ModR/M and SIB encoding.
//!
//! x86 instruction format:
//! ```text
//! [Legacy prefixes] [REX | VEX] [Opcode] [ModR/M] [SIB] [Disp] [Imm]
//! ```
//!
//! Every mnemonic in the assembler funnels through [`Rex::for_operands`] and
//! [`RmOperand`], so the REX decision lives in one place.

use super::operand::{Address, ScaleFactor};

// =============================================================================
// REX Prefix
// =============================================================================

/// REX prefix byte.
///
/// Format: `0100WRXB`
/// - W: 64-bit operand size
/// - R: extension of the ModR/M reg field
/// - X: extension of the SIB index field
/// - B: extension of the ModR/M r/m field, SIB base or opcode register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rex {
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
    /// Force an empty REX (0x40) to select SPL/BPL/SIL/DIL.
    pub force: bool,
}

impl Rex {
    /// Compute the REX bits for a reg field and an r/m operand.
    #[inline]
    pub const fn for_operands(w: bool, reg: u8, rm: &RmOperand) -> Self {
        let (x, b) = match rm {
            RmOperand::Reg(r) => (false, *r >= 8),
            RmOperand::Mem(a) => (a.rex_x(), a.rex_b()),
        };
        Rex {
            w,
            r: reg >= 8,
            x,
            b,
            force: false,
        }
    }

    /// REX for an opcode-embedded register (`push r`, `mov r, imm`, `bswap`).
    #[inline]
    pub const fn for_opcode_reg(w: bool, reg: u8) -> Self {
        Rex {
            w,
            r: false,
            x: false,
            b: reg >= 8,
            force: false,
        }
    }

    /// Whether a prefix byte must be emitted.
    #[inline]
    pub const fn is_needed(&self) -> bool {
        self.w || self.r || self.x || self.b || self.force
    }

    /// Encode the prefix byte.
    #[inline]
    pub const fn encode(&self) -> u8 {
        0x40 | ((self.w as u8) << 3) | ((self.r as u8) << 2) | ((self.x as u8) << 1) | (self.b as u8)
    }
}

// =============================================================================
// ModR/M and SIB
// =============================================================================

/// Mod field values for ModR/M.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mod {
    /// `[reg]`, `[disp32]` or `[SIB]` depending on r/m.
    Indirect = 0b00,
    /// `[reg + disp8]`
    IndirectDisp8 = 0b01,
    /// `[reg + disp32]`
    IndirectDisp32 = 0b10,
    /// Register direct.
    Direct = 0b11,
}

/// Encode a ModR/M byte.
#[inline]
pub const fn modrm(mod_: Mod, reg: u8, rm: u8) -> u8 {
    ((mod_ as u8) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

/// Encode a SIB byte.
#[inline]
pub const fn sib(scale: ScaleFactor, index: u8, base: u8) -> u8 {
    ((scale as u8) << 6) | ((index & 0x7) << 3) | (base & 0x7)
}

/// The r/m side of an instruction: a register encoding or a memory operand.
#[derive(Debug, Clone, Copy)]
pub enum RmOperand<'a> {
    /// Register direct, by hardware encoding.
    Reg(u8),
    /// Memory.
    Mem(&'a Address),
}

/// Legacy mandatory prefixes used by SSE encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SsePrefix {
    None = 0,
    P66 = 0x66,
    PF3 = 0xF3,
    PF2 = 0xF2,
}

impl SsePrefix {
    /// VEX `pp` field for this prefix.
    #[inline]
    pub const fn vex_pp(self) -> u8 {
        match self {
            SsePrefix::None => 0,
            SsePrefix::P66 => 1,
            SsePrefix::PF3 => 2,
            SsePrefix::PF2 => 3,
        }
    }
}

/// Maximum encoded instruction length.
pub const MAX_INST_LEN: usize = 15;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x64::registers::CpuRegister;

    #[test]
    fn test_rex_encoding() {
        let rex = Rex {
            w: true,
            ..Rex::default()
        };
        assert_eq!(rex.encode(), 0x48);

        let rex = Rex::for_operands(true, 9, &RmOperand::Reg(10));
        assert_eq!(rex.encode(), 0x4D);
        assert!(!Rex::for_operands(false, 1, &RmOperand::Reg(2)).is_needed());
    }

    #[test]
    fn test_rex_for_memory() {
        let addr = crate::backend::x64::Address::indexed(
            CpuRegister::R13,
            CpuRegister::R8,
            ScaleFactor::Times8,
            0,
        );
        let rex = Rex::for_operands(false, 0, &RmOperand::Mem(&addr));
        assert!(rex.x && rex.b && !rex.r && !rex.w);
        assert_eq!(rex.encode(), 0x43);
    }

    #[test]
    fn test_modrm_sib() {
        assert_eq!(modrm(Mod::Direct, 0, 0), 0xC0);
        assert_eq!(modrm(Mod::IndirectDisp8, 2, 4), 0x54);
        assert_eq!(sib(ScaleFactor::Times2, 1, 3), 0x4B);
    }

    #[test]
    fn test_forced_rex() {
        let rex = Rex {
            force: true,
            ..Rex::default()
        };
        assert!(rex.is_needed());
        assert_eq!(rex.encode(), 0x40);
        assert_eq!(SsePrefix::PF2.vex_pp(), 3);
    }
}
