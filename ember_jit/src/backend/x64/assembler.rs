//! x86 / x86-64 assembler.
//!
//! One method per mnemonic. Every encoding goes through [`Assembler::emit_op`]
//! (or its opcode-register and VEX siblings), which lays out
//!
//! ```text
//! [legacy prefix] [REX] [opcode bytes] [ModR/M] [SIB] [disp] [imm]
//! ```
//!
//! and is the single place that decides whether a REX prefix is needed. An
//! assembler created for [`InstructionSet::X86`] aborts on any encoding that
//! would need one.
//!
//! Operand-constraint violations (an immediate that does not fit, a branch
//! that cannot reach its near label, a label bound twice) are fatal.

use super::buffer::{AssemblerBuffer, FixupKind};
use super::constant_area::ConstantArea;
use super::encoder::{modrm, Mod, Rex, RmOperand, SsePrefix, MAX_INST_LEN};
use super::label::{Label, LabelState, NearLabel};
use super::operand::{Address, Displacement, Immediate};
use super::registers::{Condition, CpuRegister, XmmRegister};
use super::vex::{OpcodeMap, VectorLength, Vex};
use crate::options::InstructionSet;
use ember_core::bits::is_int8;
use ember_core::{check, fatal};

/// Finalized machine code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledCode {
    /// Instructions followed by the constant area.
    pub code: Vec<u8>,
    /// Offset of the constant area within `code`.
    pub constant_area_offset: usize,
    /// Number of constant-area fixups that were patched.
    pub fixups_resolved: usize,
    /// x86 only: positions of absolute displacements holding code-relative
    /// offsets, to be rebased by the code's load address.
    pub absolute_fixups: Vec<usize>,
}

impl AssembledCode {
    /// Code bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.code
    }

    /// Total size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Whether nothing was emitted.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

// =============================================================================
// Mnemonic generators
// =============================================================================

/// Integer ALU group sharing the `op r/m, r` / `op r, r/m` / `81 /ext` layout.
macro_rules! alu_ops {
    ($ext:literal, $mn:literal:
     $rr32:ident, $rr64:ident, $ri32:ident, $ri64:ident,
     $rm32:ident, $rm64:ident, $mr32:ident, $mr64:ident,
     $mi32:ident, $mi64:ident) => {
        #[doc = concat!("`", $mn, " r32, r32`")]
        pub fn $rr32(&mut self, dst: CpuRegister, src: CpuRegister) {
            self.alu_rr(false, $ext, dst, src);
        }

        #[doc = concat!("`", $mn, " r64, r64`")]
        pub fn $rr64(&mut self, dst: CpuRegister, src: CpuRegister) {
            self.alu_rr(true, $ext, dst, src);
        }

        #[doc = concat!("`", $mn, " r32, imm`")]
        pub fn $ri32(&mut self, dst: CpuRegister, imm: Immediate) {
            self.alu_ri(false, $ext, dst, imm);
        }

        #[doc = concat!("`", $mn, " r64, imm32`")]
        pub fn $ri64(&mut self, dst: CpuRegister, imm: Immediate) {
            self.alu_ri(true, $ext, dst, imm);
        }

        #[doc = concat!("`", $mn, " r32, [mem]`")]
        pub fn $rm32(&mut self, dst: CpuRegister, src: &Address) {
            self.emit_op(SsePrefix::None, false, &[$ext * 8 + 3], dst.encoding(), RmOperand::Mem(src), 0);
        }

        #[doc = concat!("`", $mn, " r64, [mem]`")]
        pub fn $rm64(&mut self, dst: CpuRegister, src: &Address) {
            self.emit_op(SsePrefix::None, true, &[$ext * 8 + 3], dst.encoding(), RmOperand::Mem(src), 0);
        }

        #[doc = concat!("`", $mn, " [mem], r32`")]
        pub fn $mr32(&mut self, dst: &Address, src: CpuRegister) {
            self.emit_op(SsePrefix::None, false, &[$ext * 8 + 1], src.encoding(), RmOperand::Mem(dst), 0);
        }

        #[doc = concat!("`", $mn, " [mem], r64`")]
        pub fn $mr64(&mut self, dst: &Address, src: CpuRegister) {
            self.emit_op(SsePrefix::None, true, &[$ext * 8 + 1], src.encoding(), RmOperand::Mem(dst), 0);
        }

        #[doc = concat!("`", $mn, " dword [mem], imm`")]
        pub fn $mi32(&mut self, dst: &Address, imm: Immediate) {
            self.alu_mi(false, $ext, dst, imm);
        }

        #[doc = concat!("`", $mn, " qword [mem], imm32`")]
        pub fn $mi64(&mut self, dst: &Address, imm: Immediate) {
            self.alu_mi(true, $ext, dst, imm);
        }
    };
}

/// Shift/rotate group (`C1 /ext ib`, `D1 /ext`, `D3 /ext`).
macro_rules! shift_ops {
    ($ext:literal, $mn:literal: $ri32:ident, $ri64:ident, $cl32:ident, $cl64:ident) => {
        #[doc = concat!("`", $mn, " r32, imm8`")]
        pub fn $ri32(&mut self, reg: CpuRegister, imm: Immediate) {
            self.shift(false, $ext, reg, Some(imm));
        }

        #[doc = concat!("`", $mn, " r64, imm8`")]
        pub fn $ri64(&mut self, reg: CpuRegister, imm: Immediate) {
            self.shift(true, $ext, reg, Some(imm));
        }

        #[doc = concat!("`", $mn, " r32, cl`")]
        pub fn $cl32(&mut self, reg: CpuRegister) {
            self.shift(false, $ext, reg, None);
        }

        #[doc = concat!("`", $mn, " r64, cl`")]
        pub fn $cl64(&mut self, reg: CpuRegister) {
            self.shift(true, $ext, reg, None);
        }
    };
}

/// One-operand `F7 /ext` group.
macro_rules! unary_ops {
    ($($ext:literal, $mn:literal: $r32:ident, $r64:ident;)*) => {$(
        #[doc = concat!("`", $mn, " r32`")]
        pub fn $r32(&mut self, reg: CpuRegister) {
            self.emit_op(SsePrefix::None, false, &[0xF7], $ext, RmOperand::Reg(reg.encoding()), 0);
        }

        #[doc = concat!("`", $mn, " r64`")]
        pub fn $r64(&mut self, reg: CpuRegister) {
            self.emit_op(SsePrefix::None, true, &[0xF7], $ext, RmOperand::Reg(reg.encoding()), 0);
        }
    )*};
}

/// Scalar SSE arithmetic with register and memory sources.
macro_rules! sse_ops {
    ($($prefix:expr, $op:literal, $mn:literal: $rr:ident, $rm:ident;)*) => {$(
        #[doc = concat!("`", $mn, " xmm, xmm`")]
        pub fn $rr(&mut self, dst: XmmRegister, src: XmmRegister) {
            self.emit_op($prefix, false, &[0x0F, $op], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
        }

        #[doc = concat!("`", $mn, " xmm, [mem]`")]
        pub fn $rm(&mut self, dst: XmmRegister, src: &Address) {
            self.emit_op($prefix, false, &[0x0F, $op], dst.encoding(), RmOperand::Mem(src), 0);
        }
    )*};
}

/// Three-operand AVX/AVX2 ops in map 0F.
macro_rules! avx_ops {
    ($($prefix:expr, $op:literal, $commutative:literal, $mn:literal: $name:ident;)*) => {$(
        #[doc = concat!("`", $mn, " dst, src1, src2`")]
        pub fn $name(&mut self, dst: XmmRegister, src1: XmmRegister, src2: XmmRegister, len: VectorLength) {
            self.emit_vex_rrr($prefix, OpcodeMap::Map0F, $op, dst, src1, src2, len, $commutative);
        }
    )*};
}

// =============================================================================
// Assembler
// =============================================================================

/// Machine-code emitter for one compilation.
#[derive(Debug)]
pub struct Assembler {
    buffer: AssemblerBuffer,
    constant_area: ConstantArea,
    isa: InstructionSet,
}

impl Assembler {
    /// Create an assembler for `isa`.
    pub fn new(isa: InstructionSet) -> Self {
        Self {
            buffer: AssemblerBuffer::new(),
            constant_area: ConstantArea::new(),
            isa,
        }
    }

    /// Target instruction set.
    #[inline]
    pub fn instruction_set(&self) -> InstructionSet {
        self.isa
    }

    /// Bytes emitted so far, excluding the constant area.
    #[inline]
    pub fn code_size(&self) -> usize {
        self.buffer.size()
    }

    /// View of the code emitted so far.
    #[inline]
    pub fn code(&self) -> &[u8] {
        self.buffer.contents()
    }

    /// Underlying buffer.
    #[inline]
    pub fn buffer(&self) -> &AssemblerBuffer {
        &self.buffer
    }

    /// Literal pool.
    #[inline]
    pub fn constant_area(&self) -> &ConstantArea {
        &self.constant_area
    }

    // =========================================================================
    // Encoding core
    // =========================================================================

    fn emit_rex(&mut self, rex: Rex) {
        if rex.is_needed() {
            if self.isa == InstructionSet::X86 {
                fatal!("encoding needs REX {:#04x}, unavailable on x86", rex.encode());
            }
            self.buffer.emit_u8(rex.encode());
        }
    }

    fn emit_prefix(&mut self, prefix: SsePrefix) {
        if prefix != SsePrefix::None {
            self.buffer.emit_u8(prefix as u8);
        }
    }

    /// `[prefix] [REX] opcode modrm...` with `trailing` immediate bytes to
    /// follow, needed to compute RIP-relative constant displacements.
    fn emit_rm(
        &mut self,
        prefix: SsePrefix,
        rex: Rex,
        opcode: &[u8],
        reg: u8,
        rm: RmOperand<'_>,
        trailing: usize,
    ) {
        self.buffer.ensure_capacity(MAX_INST_LEN);
        self.emit_prefix(prefix);
        self.emit_rex(rex);
        self.buffer.emit_bytes(opcode);
        self.emit_operand(reg, rm, trailing);
    }

    fn emit_op(
        &mut self,
        prefix: SsePrefix,
        w: bool,
        opcode: &[u8],
        reg: u8,
        rm: RmOperand<'_>,
        trailing: usize,
    ) {
        let rex = Rex::for_operands(w, reg, &rm);
        self.emit_rm(prefix, rex, opcode, reg, rm, trailing);
    }

    /// Like [`Self::emit_op`], forcing REX when a byte register needs it.
    fn emit_byte_op(&mut self, opcode: &[u8], reg: u8, rm: RmOperand<'_>, byte_regs: &[CpuRegister], trailing: usize) {
        let mut rex = Rex::for_operands(false, reg, &rm);
        rex.force = byte_regs.iter().any(|r| r.byte_needs_rex());
        self.emit_rm(SsePrefix::None, rex, opcode, reg, rm, trailing);
    }

    /// Opcode with the register in its low three bits.
    fn emit_opcode_reg(&mut self, w: bool, base: u8, reg: CpuRegister) {
        self.emit_rex(Rex::for_opcode_reg(w, reg.encoding()));
        self.buffer.emit_u8(base + reg.low_bits());
    }

    fn emit_operand(&mut self, reg: u8, rm: RmOperand<'_>, trailing: usize) {
        match rm {
            RmOperand::Reg(r) => self.buffer.emit_u8(modrm(Mod::Direct, reg, r)),
            RmOperand::Mem(addr) => {
                self.buffer.emit_u8(addr.modrm() | ((reg & 0x7) << 3));
                if let Some(sib) = addr.sib() {
                    self.buffer.emit_u8(sib);
                }
                match addr.constant() {
                    Some(offset) => self.emit_constant_displacement(offset, trailing),
                    None => match addr.displacement() {
                        Displacement::None => {}
                        Displacement::Disp8(d) => self.buffer.emit_u8(d as u8),
                        Displacement::Disp32(d) => self.buffer.emit_u32(d as u32),
                    },
                }
            }
        }
    }

    /// Displacement for a constant-area literal, completed at finalization by
    /// adding the area start. RIP-relative on x86-64, absolute on x86.
    fn emit_constant_displacement(&mut self, offset: u32, trailing: usize) {
        let position = self.buffer.size();
        let value = match self.isa {
            InstructionSet::X86_64 => offset as i64 - (position + 4 + trailing) as i64,
            InstructionSet::X86 => offset as i64,
        };
        self.buffer.emit_u32(value as i32 as u32);
        self.buffer.add_fixup(position, FixupKind::ConstantArea);
    }

    fn emit_imm32(&mut self, imm: Immediate) {
        check!(imm.is_int32() || ember_core::bits::is_uint32(imm.value()), "immediate {:#x} does not fit 32 bits", imm.value());
        self.buffer.emit_u32(imm.value() as u32);
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_vex(
        &mut self,
        prefix: SsePrefix,
        map: OpcodeMap,
        w: bool,
        len: VectorLength,
        opcode: u8,
        reg: u8,
        vvvv: u8,
        rm: RmOperand<'_>,
    ) {
        let (x, b) = match rm {
            RmOperand::Reg(r) => (false, r >= 8),
            RmOperand::Mem(a) => (a.rex_x(), a.rex_b()),
        };
        let vex = Vex {
            l: len,
            pp: prefix.vex_pp(),
            map,
            w,
            r: reg >= 8,
            x,
            b,
            vvvv,
        };
        if self.isa == InstructionSet::X86 && (vex.r || vex.x || vex.b || vvvv >= 8) {
            fatal!("vex operand outside xmm0-xmm7 on x86");
        }
        self.buffer.ensure_capacity(MAX_INST_LEN);
        let mut bytes = [0u8; 3];
        let n = vex.encode_into(&mut bytes);
        self.buffer.emit_bytes(&bytes[..n]);
        self.buffer.emit_u8(opcode);
        self.emit_operand(reg, rm, 0);
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_vex_rrr(
        &mut self,
        prefix: SsePrefix,
        map: OpcodeMap,
        opcode: u8,
        dst: XmmRegister,
        src1: XmmRegister,
        src2: XmmRegister,
        len: VectorLength,
        commutative: bool,
    ) {
        // src2 sits in r/m; a high register there forces the 3-byte form.
        let (src1, src2) = if commutative && src2.high_bit() && !src1.high_bit() {
            (src2, src1)
        } else {
            (src1, src2)
        };
        self.emit_vex(
            prefix,
            map,
            false,
            len,
            opcode,
            dst.encoding(),
            src1.encoding(),
            RmOperand::Reg(src2.encoding()),
        );
    }

    // =========================================================================
    // Prefixes
    // =========================================================================

    /// `lock` prefix for the next instruction.
    pub fn lock(&mut self) -> &mut Self {
        self.buffer.emit_u8(0xF0);
        self
    }

    /// `gs` segment override for the next instruction.
    pub fn gs(&mut self) -> &mut Self {
        self.buffer.emit_u8(0x65);
        self
    }

    /// `fs` segment override for the next instruction.
    pub fn fs(&mut self) -> &mut Self {
        self.buffer.emit_u8(0x64);
        self
    }

    // =========================================================================
    // Moves
    // =========================================================================

    /// `mov r32, r32`
    pub fn movl_rr(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0x8B], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `mov r64, r64`
    pub fn movq_rr(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.emit_op(SsePrefix::None, true, &[0x8B], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `mov r32, imm32` (`B8+rd`).
    pub fn movl_ri(&mut self, dst: CpuRegister, imm: Immediate) {
        self.emit_opcode_reg(false, 0xB8, dst);
        self.emit_imm32(imm);
    }

    /// `mov r64, imm`: sign-extended `C7 /0` when the value fits 32 bits,
    /// otherwise `movabs`.
    pub fn movq_ri(&mut self, dst: CpuRegister, imm: Immediate) {
        if imm.is_int32() {
            self.emit_op(SsePrefix::None, true, &[0xC7], 0, RmOperand::Reg(dst.encoding()), 0);
            self.buffer.emit_u32(imm.value() as u32);
        } else {
            self.emit_opcode_reg(true, 0xB8, dst);
            self.buffer.emit_u64(imm.value() as u64);
        }
    }

    /// `mov r32, [mem]`
    pub fn movl_rm(&mut self, dst: CpuRegister, src: &Address) {
        self.emit_op(SsePrefix::None, false, &[0x8B], dst.encoding(), RmOperand::Mem(src), 0);
    }

    /// `mov r64, [mem]`
    pub fn movq_rm(&mut self, dst: CpuRegister, src: &Address) {
        self.emit_op(SsePrefix::None, true, &[0x8B], dst.encoding(), RmOperand::Mem(src), 0);
    }

    /// `mov [mem], r32`
    pub fn movl_mr(&mut self, dst: &Address, src: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0x89], src.encoding(), RmOperand::Mem(dst), 0);
    }

    /// `mov [mem], r64`
    pub fn movq_mr(&mut self, dst: &Address, src: CpuRegister) {
        self.emit_op(SsePrefix::None, true, &[0x89], src.encoding(), RmOperand::Mem(dst), 0);
    }

    /// `mov dword [mem], imm32`
    pub fn movl_mi(&mut self, dst: &Address, imm: Immediate) {
        self.emit_op(SsePrefix::None, false, &[0xC7], 0, RmOperand::Mem(dst), 4);
        self.emit_imm32(imm);
    }

    /// `mov qword [mem], simm32`
    pub fn movq_mi(&mut self, dst: &Address, imm: Immediate) {
        check!(imm.is_int32(), "movq immediate {:#x} does not fit 32 bits", imm.value());
        self.emit_op(SsePrefix::None, true, &[0xC7], 0, RmOperand::Mem(dst), 4);
        self.buffer.emit_u32(imm.value() as u32);
    }

    /// `mov word [mem], r16`
    pub fn movw_mr(&mut self, dst: &Address, src: CpuRegister) {
        self.emit_op(SsePrefix::P66, false, &[0x89], src.encoding(), RmOperand::Mem(dst), 0);
    }

    /// `mov word [mem], imm16`
    pub fn movw_mi(&mut self, dst: &Address, imm: Immediate) {
        check!(imm.is_int16() || imm.is_uint16(), "movw immediate {:#x} does not fit 16 bits", imm.value());
        self.emit_op(SsePrefix::P66, false, &[0xC7], 0, RmOperand::Mem(dst), 2);
        self.buffer.emit_u16(imm.value() as u16);
    }

    /// `mov byte [mem], r8`
    pub fn movb_mr(&mut self, dst: &Address, src: CpuRegister) {
        self.emit_byte_op(&[0x88], src.encoding(), RmOperand::Mem(dst), &[src], 0);
    }

    /// `mov byte [mem], imm8`
    pub fn movb_mi(&mut self, dst: &Address, imm: Immediate) {
        check!(imm.is_int8() || imm.is_uint8(), "movb immediate {:#x} does not fit 8 bits", imm.value());
        self.emit_op(SsePrefix::None, false, &[0xC6], 0, RmOperand::Mem(dst), 1);
        self.buffer.emit_u8(imm.value() as u8);
    }

    /// `movzx r32, r8`
    pub fn movzxb_rr(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.emit_byte_op(&[0x0F, 0xB6], dst.encoding(), RmOperand::Reg(src.encoding()), &[src], 0);
    }

    /// `movzx r32, byte [mem]`
    pub fn movzxb_rm(&mut self, dst: CpuRegister, src: &Address) {
        self.emit_op(SsePrefix::None, false, &[0x0F, 0xB6], dst.encoding(), RmOperand::Mem(src), 0);
    }

    /// `movsx r32, r8`
    pub fn movsxb_rr(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.emit_byte_op(&[0x0F, 0xBE], dst.encoding(), RmOperand::Reg(src.encoding()), &[src], 0);
    }

    /// `movsx r32, byte [mem]`
    pub fn movsxb_rm(&mut self, dst: CpuRegister, src: &Address) {
        self.emit_op(SsePrefix::None, false, &[0x0F, 0xBE], dst.encoding(), RmOperand::Mem(src), 0);
    }

    /// `movzx r32, r16`
    pub fn movzxw_rr(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0x0F, 0xB7], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `movzx r32, word [mem]`
    pub fn movzxw_rm(&mut self, dst: CpuRegister, src: &Address) {
        self.emit_op(SsePrefix::None, false, &[0x0F, 0xB7], dst.encoding(), RmOperand::Mem(src), 0);
    }

    /// `movsx r32, r16`
    pub fn movsxw_rr(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0x0F, 0xBF], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `movsx r32, word [mem]`
    pub fn movsxw_rm(&mut self, dst: CpuRegister, src: &Address) {
        self.emit_op(SsePrefix::None, false, &[0x0F, 0xBF], dst.encoding(), RmOperand::Mem(src), 0);
    }

    /// `movsxd r64, r32`
    pub fn movsxd_rr(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.emit_op(SsePrefix::None, true, &[0x63], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `movsxd r64, dword [mem]`
    pub fn movsxd_rm(&mut self, dst: CpuRegister, src: &Address) {
        self.emit_op(SsePrefix::None, true, &[0x63], dst.encoding(), RmOperand::Mem(src), 0);
    }

    /// `lea r32, [mem]`
    pub fn leal_rm(&mut self, dst: CpuRegister, src: &Address) {
        self.emit_op(SsePrefix::None, false, &[0x8D], dst.encoding(), RmOperand::Mem(src), 0);
    }

    /// `lea r64, [mem]`
    pub fn leaq_rm(&mut self, dst: CpuRegister, src: &Address) {
        self.emit_op(SsePrefix::None, true, &[0x8D], dst.encoding(), RmOperand::Mem(src), 0);
    }

    /// `cmovcc r32, r32`
    pub fn cmovl(&mut self, cond: Condition, dst: CpuRegister, src: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0x0F, 0x40 + cond.encoding()], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `cmovcc r64, r64`
    pub fn cmovq(&mut self, cond: Condition, dst: CpuRegister, src: CpuRegister) {
        self.emit_op(SsePrefix::None, true, &[0x0F, 0x40 + cond.encoding()], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `cmovcc r64, [mem]`
    pub fn cmovq_rm(&mut self, cond: Condition, dst: CpuRegister, src: &Address) {
        self.emit_op(SsePrefix::None, true, &[0x0F, 0x40 + cond.encoding()], dst.encoding(), RmOperand::Mem(src), 0);
    }

    /// `setcc r8`
    pub fn setcc(&mut self, cond: Condition, dst: CpuRegister) {
        self.emit_byte_op(&[0x0F, 0x90 + cond.encoding()], 0, RmOperand::Reg(dst.encoding()), &[dst], 0);
    }

    /// `xchg r32, r32`
    pub fn xchgl_rr(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0x87], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `xchg r64, r64`
    pub fn xchgq_rr(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.emit_op(SsePrefix::None, true, &[0x87], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `xchg r32, [mem]` (implicitly locked).
    pub fn xchgl_rm(&mut self, reg: CpuRegister, addr: &Address) {
        self.emit_op(SsePrefix::None, false, &[0x87], reg.encoding(), RmOperand::Mem(addr), 0);
    }

    /// `xchg r64, [mem]`
    pub fn xchgq_rm(&mut self, reg: CpuRegister, addr: &Address) {
        self.emit_op(SsePrefix::None, true, &[0x87], reg.encoding(), RmOperand::Mem(addr), 0);
    }

    // =========================================================================
    // Stack
    // =========================================================================

    /// `push r64` (`push r32` on x86).
    pub fn pushq_r(&mut self, reg: CpuRegister) {
        self.emit_opcode_reg(false, 0x50, reg);
    }

    /// `push qword [mem]`
    pub fn pushq_m(&mut self, addr: &Address) {
        self.emit_op(SsePrefix::None, false, &[0xFF], 6, RmOperand::Mem(addr), 0);
    }

    /// `push imm`: `6A ib` or `68 id`. A 64-bit immediate is fatal.
    pub fn pushq_i(&mut self, imm: Immediate) {
        if imm.is_int8() {
            self.buffer.emit_u8(0x6A);
            self.buffer.emit_u8(imm.value() as u8);
        } else {
            check!(imm.is_int32(), "pushq immediate {:#x} does not fit 32 bits", imm.value());
            self.buffer.emit_u8(0x68);
            self.buffer.emit_u32(imm.value() as u32);
        }
    }

    /// `pop r64` (`pop r32` on x86).
    pub fn popq_r(&mut self, reg: CpuRegister) {
        self.emit_opcode_reg(false, 0x58, reg);
    }

    /// `pop qword [mem]`
    pub fn popq_m(&mut self, addr: &Address) {
        self.emit_op(SsePrefix::None, false, &[0x8F], 0, RmOperand::Mem(addr), 0);
    }

    // =========================================================================
    // Integer arithmetic
    // =========================================================================

    fn alu_rr(&mut self, w: bool, ext: u8, dst: CpuRegister, src: CpuRegister) {
        self.emit_op(SsePrefix::None, w, &[ext * 8 + 1], src.encoding(), RmOperand::Reg(dst.encoding()), 0);
    }

    /// Normalize an ALU immediate: 32-bit ops accept any 32-bit pattern,
    /// 64-bit ops only sign-extended 32-bit values.
    fn alu_imm(w: bool, imm: Immediate) -> i64 {
        if w {
            check!(imm.is_int32(), "64-bit ALU immediate {:#x} does not fit simm32", imm.value());
            imm.value()
        } else {
            check!(
                imm.is_int32() || ember_core::bits::is_uint32(imm.value()),
                "32-bit ALU immediate {:#x} does not fit 32 bits",
                imm.value()
            );
            imm.value() as i32 as i64
        }
    }

    fn alu_ri(&mut self, w: bool, ext: u8, dst: CpuRegister, imm: Immediate) {
        let value = Self::alu_imm(w, imm);
        if is_int8(value) {
            self.emit_op(SsePrefix::None, w, &[0x83], ext, RmOperand::Reg(dst.encoding()), 1);
            self.buffer.emit_u8(value as u8);
        } else if dst == CpuRegister::RAX {
            self.emit_rex(Rex {
                w,
                ..Rex::default()
            });
            self.buffer.emit_u8(ext * 8 + 5);
            self.buffer.emit_u32(value as u32);
        } else {
            self.emit_op(SsePrefix::None, w, &[0x81], ext, RmOperand::Reg(dst.encoding()), 4);
            self.buffer.emit_u32(value as u32);
        }
    }

    fn alu_mi(&mut self, w: bool, ext: u8, dst: &Address, imm: Immediate) {
        let value = Self::alu_imm(w, imm);
        if is_int8(value) {
            self.emit_op(SsePrefix::None, w, &[0x83], ext, RmOperand::Mem(dst), 1);
            self.buffer.emit_u8(value as u8);
        } else {
            self.emit_op(SsePrefix::None, w, &[0x81], ext, RmOperand::Mem(dst), 4);
            self.buffer.emit_u32(value as u32);
        }
    }

    alu_ops!(0, "add": addl_rr, addq_rr, addl_ri, addq_ri, addl_rm, addq_rm, addl_mr, addq_mr, addl_mi, addq_mi);
    alu_ops!(1, "or": orl_rr, orq_rr, orl_ri, orq_ri, orl_rm, orq_rm, orl_mr, orq_mr, orl_mi, orq_mi);
    alu_ops!(4, "and": andl_rr, andq_rr, andl_ri, andq_ri, andl_rm, andq_rm, andl_mr, andq_mr, andl_mi, andq_mi);
    alu_ops!(5, "sub": subl_rr, subq_rr, subl_ri, subq_ri, subl_rm, subq_rm, subl_mr, subq_mr, subl_mi, subq_mi);
    alu_ops!(6, "xor": xorl_rr, xorq_rr, xorl_ri, xorq_ri, xorl_rm, xorq_rm, xorl_mr, xorq_mr, xorl_mi, xorq_mi);
    alu_ops!(7, "cmp": cmpl_rr, cmpq_rr, cmpl_ri, cmpq_ri, cmpl_rm, cmpq_rm, cmpl_mr, cmpq_mr, cmpl_mi, cmpq_mi);

    /// `test r32, r32`
    pub fn testl_rr(&mut self, a: CpuRegister, b: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0x85], b.encoding(), RmOperand::Reg(a.encoding()), 0);
    }

    /// `test r64, r64`
    pub fn testq_rr(&mut self, a: CpuRegister, b: CpuRegister) {
        self.emit_op(SsePrefix::None, true, &[0x85], b.encoding(), RmOperand::Reg(a.encoding()), 0);
    }

    /// `test r32, [mem]`
    pub fn testl_rm(&mut self, reg: CpuRegister, addr: &Address) {
        self.emit_op(SsePrefix::None, false, &[0x85], reg.encoding(), RmOperand::Mem(addr), 0);
    }

    /// `test r64, [mem]`
    pub fn testq_rm(&mut self, reg: CpuRegister, addr: &Address) {
        self.emit_op(SsePrefix::None, true, &[0x85], reg.encoding(), RmOperand::Mem(addr), 0);
    }

    /// `test r32, imm32` (`A9 id` for eax).
    pub fn testl_ri(&mut self, reg: CpuRegister, imm: Immediate) {
        if reg == CpuRegister::RAX {
            self.buffer.emit_u8(0xA9);
        } else {
            self.emit_op(SsePrefix::None, false, &[0xF7], 0, RmOperand::Reg(reg.encoding()), 4);
        }
        self.emit_imm32(imm);
    }

    /// `test dword [mem], imm32`
    pub fn testl_mi(&mut self, addr: &Address, imm: Immediate) {
        self.emit_op(SsePrefix::None, false, &[0xF7], 0, RmOperand::Mem(addr), 4);
        self.emit_imm32(imm);
    }

    /// `test byte [mem], imm8`
    pub fn testb_mi(&mut self, addr: &Address, imm: Immediate) {
        check!(imm.is_int8() || imm.is_uint8(), "testb immediate {:#x} does not fit 8 bits", imm.value());
        self.emit_op(SsePrefix::None, false, &[0xF6], 0, RmOperand::Mem(addr), 1);
        self.buffer.emit_u8(imm.value() as u8);
    }

    /// `imul r32, r32`
    pub fn imull_rr(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0x0F, 0xAF], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `imul r64, r64`
    pub fn imulq_rr(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.emit_op(SsePrefix::None, true, &[0x0F, 0xAF], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    fn imul_rri(&mut self, w: bool, dst: CpuRegister, src: CpuRegister, imm: Immediate) {
        let value = Self::alu_imm(w, imm);
        if is_int8(value) {
            self.emit_op(SsePrefix::None, w, &[0x6B], dst.encoding(), RmOperand::Reg(src.encoding()), 1);
            self.buffer.emit_u8(value as u8);
        } else {
            self.emit_op(SsePrefix::None, w, &[0x69], dst.encoding(), RmOperand::Reg(src.encoding()), 4);
            self.buffer.emit_u32(value as u32);
        }
    }

    /// `imul r32, r32, imm`
    pub fn imull_rri(&mut self, dst: CpuRegister, src: CpuRegister, imm: Immediate) {
        self.imul_rri(false, dst, src, imm);
    }

    /// `imul r64, r64, simm32`
    pub fn imulq_rri(&mut self, dst: CpuRegister, src: CpuRegister, imm: Immediate) {
        self.imul_rri(true, dst, src, imm);
    }

    unary_ops! {
        2, "not": notl, notq;
        3, "neg": negl, negq;
        4, "mul": mull, mulq;
        5, "imul": imull, imulq;
        6, "div": divl, divq;
        7, "idiv": idivl, idivq;
    }

    /// `inc r32`
    pub fn incl(&mut self, reg: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0xFF], 0, RmOperand::Reg(reg.encoding()), 0);
    }

    /// `inc r64`
    pub fn incq(&mut self, reg: CpuRegister) {
        self.emit_op(SsePrefix::None, true, &[0xFF], 0, RmOperand::Reg(reg.encoding()), 0);
    }

    /// `dec r32`
    pub fn decl(&mut self, reg: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0xFF], 1, RmOperand::Reg(reg.encoding()), 0);
    }

    /// `dec r64`
    pub fn decq(&mut self, reg: CpuRegister) {
        self.emit_op(SsePrefix::None, true, &[0xFF], 1, RmOperand::Reg(reg.encoding()), 0);
    }

    /// `cdq`
    pub fn cdq(&mut self) {
        self.buffer.emit_u8(0x99);
    }

    /// `cqo`
    pub fn cqo(&mut self) {
        self.emit_rex(Rex {
            w: true,
            ..Rex::default()
        });
        self.buffer.emit_u8(0x99);
    }

    fn shift(&mut self, w: bool, ext: u8, reg: CpuRegister, imm: Option<Immediate>) {
        let rm = RmOperand::Reg(reg.encoding());
        match imm {
            None => self.emit_op(SsePrefix::None, w, &[0xD3], ext, rm, 0),
            Some(Immediate(1)) => self.emit_op(SsePrefix::None, w, &[0xD1], ext, rm, 0),
            Some(imm) => {
                check!(imm.is_uint8(), "shift count {} does not fit 8 bits", imm.value());
                self.emit_op(SsePrefix::None, w, &[0xC1], ext, rm, 1);
                self.buffer.emit_u8(imm.value() as u8);
            }
        }
    }

    shift_ops!(0, "rol": roll_ri, rolq_ri, roll_cl, rolq_cl);
    shift_ops!(1, "ror": rorl_ri, rorq_ri, rorl_cl, rorq_cl);
    shift_ops!(4, "shl": shll_ri, shlq_ri, shll_cl, shlq_cl);
    shift_ops!(5, "shr": shrl_ri, shrq_ri, shrl_cl, shrq_cl);
    shift_ops!(7, "sar": sarl_ri, sarq_ri, sarl_cl, sarq_cl);

    // =========================================================================
    // Atomics and bit operations
    // =========================================================================

    /// `cmpxchg [mem], r32` (compare with eax). Prefix with [`Self::lock`].
    pub fn cmpxchgl(&mut self, addr: &Address, reg: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0x0F, 0xB1], reg.encoding(), RmOperand::Mem(addr), 0);
    }

    /// `cmpxchg [mem], r64` (compare with rax).
    pub fn cmpxchgq(&mut self, addr: &Address, reg: CpuRegister) {
        self.emit_op(SsePrefix::None, true, &[0x0F, 0xB1], reg.encoding(), RmOperand::Mem(addr), 0);
    }

    /// `xadd [mem], r32`
    pub fn xaddl(&mut self, addr: &Address, reg: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0x0F, 0xC1], reg.encoding(), RmOperand::Mem(addr), 0);
    }

    /// `xadd [mem], r64`
    pub fn xaddq(&mut self, addr: &Address, reg: CpuRegister) {
        self.emit_op(SsePrefix::None, true, &[0x0F, 0xC1], reg.encoding(), RmOperand::Mem(addr), 0);
    }

    /// `bt r32, r32`
    pub fn btl_rr(&mut self, base: CpuRegister, bit: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0x0F, 0xA3], bit.encoding(), RmOperand::Reg(base.encoding()), 0);
    }

    /// `bt r32, imm8`
    pub fn btl_ri(&mut self, base: CpuRegister, bit: Immediate) {
        check!(bit.is_uint8(), "bit index {} does not fit 8 bits", bit.value());
        self.emit_op(SsePrefix::None, false, &[0x0F, 0xBA], 4, RmOperand::Reg(base.encoding()), 1);
        self.buffer.emit_u8(bit.value() as u8);
    }

    /// `bt r64, r64`
    pub fn btq_rr(&mut self, base: CpuRegister, bit: CpuRegister) {
        self.emit_op(SsePrefix::None, true, &[0x0F, 0xA3], bit.encoding(), RmOperand::Reg(base.encoding()), 0);
    }

    fn bit_scan(&mut self, prefix: SsePrefix, w: bool, op: u8, dst: CpuRegister, src: CpuRegister) {
        self.emit_op(prefix, w, &[0x0F, op], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `bsf r32, r32`
    pub fn bsfl(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.bit_scan(SsePrefix::None, false, 0xBC, dst, src);
    }

    /// `bsf r64, r64`
    pub fn bsfq(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.bit_scan(SsePrefix::None, true, 0xBC, dst, src);
    }

    /// `bsr r32, r32`
    pub fn bsrl(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.bit_scan(SsePrefix::None, false, 0xBD, dst, src);
    }

    /// `bsr r64, r64`
    pub fn bsrq(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.bit_scan(SsePrefix::None, true, 0xBD, dst, src);
    }

    /// `lzcnt r32, r32`
    pub fn lzcntl(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.bit_scan(SsePrefix::PF3, false, 0xBD, dst, src);
    }

    /// `lzcnt r64, r64`
    pub fn lzcntq(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.bit_scan(SsePrefix::PF3, true, 0xBD, dst, src);
    }

    /// `tzcnt r32, r32`
    pub fn tzcntl(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.bit_scan(SsePrefix::PF3, false, 0xBC, dst, src);
    }

    /// `tzcnt r64, r64`
    pub fn tzcntq(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.bit_scan(SsePrefix::PF3, true, 0xBC, dst, src);
    }

    /// `popcnt r32, r32`
    pub fn popcntl(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.bit_scan(SsePrefix::PF3, false, 0xB8, dst, src);
    }

    /// `popcnt r64, r64`
    pub fn popcntq(&mut self, dst: CpuRegister, src: CpuRegister) {
        self.bit_scan(SsePrefix::PF3, true, 0xB8, dst, src);
    }

    /// `bswap r32`
    pub fn bswapl(&mut self, reg: CpuRegister) {
        self.emit_rex(Rex::for_opcode_reg(false, reg.encoding()));
        self.buffer.emit_u8(0x0F);
        self.buffer.emit_u8(0xC8 + reg.low_bits());
    }

    /// `bswap r64`
    pub fn bswapq(&mut self, reg: CpuRegister) {
        self.emit_rex(Rex::for_opcode_reg(true, reg.encoding()));
        self.buffer.emit_u8(0x0F);
        self.buffer.emit_u8(0xC8 + reg.low_bits());
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    /// Append a link to `label`'s chain of 32-bit slots.
    fn emit_label_link(&mut self, label: &mut Label) {
        let slot = self.buffer.size();
        let link = match label.state {
            LabelState::Unused => 0,
            LabelState::Linked(prev) => prev + 1,
            LabelState::Bound(pos) => fatal!("linking already bound label at {}", pos),
        };
        self.buffer.emit_u32(link as u32);
        label.state = LabelState::Linked(slot);
    }

    /// Append a link to `label`'s chain of 8-bit slots.
    fn emit_near_label_link(&mut self, label: &mut NearLabel) {
        let slot = self.buffer.size();
        let delta = match label.state {
            LabelState::Unused => 0,
            LabelState::Linked(prev) => slot - prev,
            LabelState::Bound(pos) => fatal!("linking already bound near label at {}", pos),
        };
        check!(delta <= u8::MAX as usize, "near label chain step {} does not fit 8 bits", delta);
        self.buffer.emit_u8(delta as u8);
        label.state = LabelState::Linked(slot);
    }

    /// Bind `label` to the current position, resolving every pending branch.
    pub fn bind(&mut self, label: &mut Label) {
        let bound = self.buffer.size();
        let mut cursor = match label.state {
            LabelState::Unused => None,
            LabelState::Linked(slot) => Some(slot),
            LabelState::Bound(pos) => fatal!("label already bound at {}", pos),
        };
        while let Some(slot) = cursor {
            let next = self.buffer.load_u32(slot) as usize;
            let disp = bound as i64 - (slot as i64 + 4);
            self.buffer.store_u32(slot, disp as i32 as u32);
            cursor = next.checked_sub(1);
        }
        label.state = LabelState::Bound(bound);
    }

    /// Bind a near label to the current position.
    pub fn bind_near(&mut self, label: &mut NearLabel) {
        let bound = self.buffer.size();
        let mut cursor = match label.state {
            LabelState::Unused => None,
            LabelState::Linked(slot) => Some(slot),
            LabelState::Bound(pos) => fatal!("near label already bound at {}", pos),
        };
        while let Some(slot) = cursor {
            let step = self.buffer.load_u8(slot) as usize;
            let disp = bound as i64 - (slot as i64 + 1);
            check!(is_int8(disp), "near branch displacement {} does not fit 8 bits", disp);
            self.buffer.store_u8(slot, disp as i8 as u8);
            cursor = (step != 0).then(|| slot - step);
        }
        label.state = LabelState::Bound(bound);
    }

    /// `jcc label`: short form when a bound target is in reach.
    pub fn j(&mut self, cond: Condition, label: &mut Label) {
        if let LabelState::Bound(pos) = label.state {
            let offset = pos as i64 - self.buffer.size() as i64;
            if is_int8(offset - 2) {
                self.buffer.emit_u8(0x70 + cond.encoding());
                self.buffer.emit_u8((offset - 2) as u8);
            } else {
                self.buffer.emit_u8(0x0F);
                self.buffer.emit_u8(0x80 + cond.encoding());
                self.buffer.emit_u32((offset - 6) as i32 as u32);
            }
        } else {
            self.buffer.emit_u8(0x0F);
            self.buffer.emit_u8(0x80 + cond.encoding());
            self.emit_label_link(label);
        }
    }

    /// `jcc rel8` to a near label.
    pub fn j_near(&mut self, cond: Condition, label: &mut NearLabel) {
        self.buffer.emit_u8(0x70 + cond.encoding());
        self.emit_near_target(label);
    }

    fn emit_near_target(&mut self, label: &mut NearLabel) {
        if let LabelState::Bound(pos) = label.state {
            let disp = pos as i64 - (self.buffer.size() as i64 + 1);
            check!(is_int8(disp), "near branch displacement {} does not fit 8 bits", disp);
            self.buffer.emit_u8(disp as i8 as u8);
        } else {
            self.emit_near_label_link(label);
        }
    }

    /// `jmp label`: short form when a bound target is in reach.
    pub fn jmp(&mut self, label: &mut Label) {
        if let LabelState::Bound(pos) = label.state {
            let offset = pos as i64 - self.buffer.size() as i64;
            if is_int8(offset - 2) {
                self.buffer.emit_u8(0xEB);
                self.buffer.emit_u8((offset - 2) as u8);
            } else {
                self.buffer.emit_u8(0xE9);
                self.buffer.emit_u32((offset - 5) as i32 as u32);
            }
        } else {
            self.buffer.emit_u8(0xE9);
            self.emit_label_link(label);
        }
    }

    /// `jmp rel8` to a near label.
    pub fn jmp_near(&mut self, label: &mut NearLabel) {
        self.buffer.emit_u8(0xEB);
        self.emit_near_target(label);
    }

    /// `jmp r64`
    pub fn jmp_r(&mut self, reg: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0xFF], 4, RmOperand::Reg(reg.encoding()), 0);
    }

    /// `jmp qword [mem]`
    pub fn jmp_m(&mut self, addr: &Address) {
        self.emit_op(SsePrefix::None, false, &[0xFF], 4, RmOperand::Mem(addr), 0);
    }

    /// `call label`
    pub fn call(&mut self, label: &mut Label) {
        self.buffer.emit_u8(0xE8);
        if let LabelState::Bound(pos) = label.state {
            let disp = pos as i64 - (self.buffer.size() as i64 + 4);
            self.buffer.emit_u32(disp as i32 as u32);
        } else {
            self.emit_label_link(label);
        }
    }

    /// `call r64`
    pub fn call_r(&mut self, reg: CpuRegister) {
        self.emit_op(SsePrefix::None, false, &[0xFF], 2, RmOperand::Reg(reg.encoding()), 0);
    }

    /// `call qword [mem]`
    pub fn call_m(&mut self, addr: &Address) {
        self.emit_op(SsePrefix::None, false, &[0xFF], 2, RmOperand::Mem(addr), 0);
    }

    /// `ret`
    pub fn ret(&mut self) {
        self.buffer.emit_u8(0xC3);
    }

    /// `ret imm16`
    pub fn ret_imm(&mut self, bytes: u16) {
        self.buffer.emit_u8(0xC2);
        self.buffer.emit_u16(bytes);
    }

    /// `nop`
    pub fn nop(&mut self) {
        self.buffer.emit_u8(0x90);
    }

    /// `int3`
    pub fn int3(&mut self) {
        self.buffer.emit_u8(0xCC);
    }

    /// `hlt`
    pub fn hlt(&mut self) {
        self.buffer.emit_u8(0xF4);
    }

    /// `mfence`
    pub fn mfence(&mut self) {
        self.buffer.emit_bytes(&[0x0F, 0xAE, 0xF0]);
    }

    /// `rep movsw`
    pub fn rep_movsw(&mut self) {
        self.buffer.emit_bytes(&[0x66, 0xF3, 0xA5]);
    }

    /// `rep movsb`
    pub fn rep_movsb(&mut self) {
        self.buffer.emit_bytes(&[0xF3, 0xA4]);
    }

    /// `repne scasw`
    pub fn repne_scasw(&mut self) {
        self.buffer.emit_bytes(&[0x66, 0xF2, 0xAF]);
    }

    /// `repe cmpsw`
    pub fn repe_cmpsw(&mut self) {
        self.buffer.emit_bytes(&[0x66, 0xF3, 0xA7]);
    }

    /// `repe cmpsd`
    pub fn repe_cmpsl(&mut self) {
        self.buffer.emit_bytes(&[0xF3, 0xA7]);
    }

    /// `repe cmpsq`
    pub fn repe_cmpsq(&mut self) {
        self.buffer.emit_u8(0xF3);
        self.emit_rex(Rex {
            w: true,
            ..Rex::default()
        });
        self.buffer.emit_u8(0xA7);
    }

    /// Emit `count` bytes of padding using the recommended multi-byte nops.
    pub fn nop_bytes(&mut self, mut count: usize) {
        const NOPS: [&[u8]; 9] = [
            &[0x90],
            &[0x66, 0x90],
            &[0x0F, 0x1F, 0x00],
            &[0x0F, 0x1F, 0x40, 0x00],
            &[0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
            &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        ];
        while count > 0 {
            let chunk = count.min(NOPS.len());
            self.buffer.emit_bytes(NOPS[chunk - 1]);
            count -= chunk;
        }
    }

    /// Pad with nops until `code_size() + offset` is a multiple of `alignment`.
    pub fn align(&mut self, alignment: usize, offset: usize) {
        check!(alignment.is_power_of_two(), "alignment {} is not a power of two", alignment);
        let misalign = (self.buffer.size() + offset) & (alignment - 1);
        if misalign != 0 {
            self.nop_bytes(alignment - misalign);
        }
    }

    // =========================================================================
    // SSE
    // =========================================================================

    /// `movss xmm, xmm`
    pub fn movss_rr(&mut self, dst: XmmRegister, src: XmmRegister) {
        self.emit_op(SsePrefix::PF3, false, &[0x0F, 0x10], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `movss xmm, [mem]`
    pub fn movss_rm(&mut self, dst: XmmRegister, src: &Address) {
        self.emit_op(SsePrefix::PF3, false, &[0x0F, 0x10], dst.encoding(), RmOperand::Mem(src), 0);
    }

    /// `movss [mem], xmm`
    pub fn movss_mr(&mut self, dst: &Address, src: XmmRegister) {
        self.emit_op(SsePrefix::PF3, false, &[0x0F, 0x11], src.encoding(), RmOperand::Mem(dst), 0);
    }

    /// `movsd xmm, xmm`
    pub fn movsd_rr(&mut self, dst: XmmRegister, src: XmmRegister) {
        self.emit_op(SsePrefix::PF2, false, &[0x0F, 0x10], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `movsd xmm, [mem]`
    pub fn movsd_rm(&mut self, dst: XmmRegister, src: &Address) {
        self.emit_op(SsePrefix::PF2, false, &[0x0F, 0x10], dst.encoding(), RmOperand::Mem(src), 0);
    }

    /// `movsd [mem], xmm`
    pub fn movsd_mr(&mut self, dst: &Address, src: XmmRegister) {
        self.emit_op(SsePrefix::PF2, false, &[0x0F, 0x11], src.encoding(), RmOperand::Mem(dst), 0);
    }

    /// `movd xmm, r32`
    pub fn movd_xr(&mut self, dst: XmmRegister, src: CpuRegister) {
        self.emit_op(SsePrefix::P66, false, &[0x0F, 0x6E], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `movd r32, xmm`
    pub fn movd_rx(&mut self, dst: CpuRegister, src: XmmRegister) {
        self.emit_op(SsePrefix::P66, false, &[0x0F, 0x7E], src.encoding(), RmOperand::Reg(dst.encoding()), 0);
    }

    /// `movq xmm, r64`
    pub fn movq_xr(&mut self, dst: XmmRegister, src: CpuRegister) {
        self.emit_op(SsePrefix::P66, true, &[0x0F, 0x6E], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `movq r64, xmm`
    pub fn movq_rx(&mut self, dst: CpuRegister, src: XmmRegister) {
        self.emit_op(SsePrefix::P66, true, &[0x0F, 0x7E], src.encoding(), RmOperand::Reg(dst.encoding()), 0);
    }

    sse_ops! {
        SsePrefix::PF3, 0x58, "addss": addss_rr, addss_rm;
        SsePrefix::PF2, 0x58, "addsd": addsd_rr, addsd_rm;
        SsePrefix::PF3, 0x5C, "subss": subss_rr, subss_rm;
        SsePrefix::PF2, 0x5C, "subsd": subsd_rr, subsd_rm;
        SsePrefix::PF3, 0x59, "mulss": mulss_rr, mulss_rm;
        SsePrefix::PF2, 0x59, "mulsd": mulsd_rr, mulsd_rm;
        SsePrefix::PF3, 0x5E, "divss": divss_rr, divss_rm;
        SsePrefix::PF2, 0x5E, "divsd": divsd_rr, divsd_rm;
        SsePrefix::PF3, 0x51, "sqrtss": sqrtss_rr, sqrtss_rm;
        SsePrefix::PF2, 0x51, "sqrtsd": sqrtsd_rr, sqrtsd_rm;
        SsePrefix::PF3, 0x5A, "cvtss2sd": cvtss2sd_rr, cvtss2sd_rm;
        SsePrefix::PF2, 0x5A, "cvtsd2ss": cvtsd2ss_rr, cvtsd2ss_rm;
        SsePrefix::None, 0x2F, "comiss": comiss_rr, comiss_rm;
        SsePrefix::P66, 0x2F, "comisd": comisd_rr, comisd_rm;
        SsePrefix::None, 0x2E, "ucomiss": ucomiss_rr, ucomiss_rm;
        SsePrefix::P66, 0x2E, "ucomisd": ucomisd_rr, ucomisd_rm;
        SsePrefix::None, 0x54, "andps": andps_rr, andps_rm;
        SsePrefix::P66, 0x54, "andpd": andpd_rr, andpd_rm;
        SsePrefix::None, 0x56, "orps": orps_rr, orps_rm;
        SsePrefix::P66, 0x56, "orpd": orpd_rr, orpd_rm;
        SsePrefix::None, 0x57, "xorps": xorps_rr, xorps_rm;
        SsePrefix::P66, 0x57, "xorpd": xorpd_rr, xorpd_rm;
        SsePrefix::None, 0x28, "movaps": movaps_rr, movaps_rm;
        SsePrefix::None, 0x10, "movups": movups_rr, movups_rm;
    }

    /// `movups [mem], xmm`
    pub fn movups_mr(&mut self, dst: &Address, src: XmmRegister) {
        self.emit_op(SsePrefix::None, false, &[0x0F, 0x11], src.encoding(), RmOperand::Mem(dst), 0);
    }

    /// `cvtsi2ss xmm, r32/r64`
    pub fn cvtsi2ss(&mut self, dst: XmmRegister, src: CpuRegister, is64: bool) {
        self.emit_op(SsePrefix::PF3, is64, &[0x0F, 0x2A], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `cvtsi2sd xmm, r32/r64`
    pub fn cvtsi2sd(&mut self, dst: XmmRegister, src: CpuRegister, is64: bool) {
        self.emit_op(SsePrefix::PF2, is64, &[0x0F, 0x2A], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `cvttss2si r32/r64, xmm`
    pub fn cvttss2si(&mut self, dst: CpuRegister, src: XmmRegister, is64: bool) {
        self.emit_op(SsePrefix::PF3, is64, &[0x0F, 0x2C], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `cvttsd2si r32/r64, xmm`
    pub fn cvttsd2si(&mut self, dst: CpuRegister, src: XmmRegister, is64: bool) {
        self.emit_op(SsePrefix::PF2, is64, &[0x0F, 0x2C], dst.encoding(), RmOperand::Reg(src.encoding()), 0);
    }

    /// `roundss xmm, xmm, imm8`
    pub fn roundss(&mut self, dst: XmmRegister, src: XmmRegister, mode: Immediate) {
        check!(mode.is_uint8(), "rounding mode {} does not fit 8 bits", mode.value());
        self.emit_op(SsePrefix::P66, false, &[0x0F, 0x3A, 0x0A], dst.encoding(), RmOperand::Reg(src.encoding()), 1);
        self.buffer.emit_u8(mode.value() as u8);
    }

    /// `roundsd xmm, xmm, imm8`
    pub fn roundsd(&mut self, dst: XmmRegister, src: XmmRegister, mode: Immediate) {
        check!(mode.is_uint8(), "rounding mode {} does not fit 8 bits", mode.value());
        self.emit_op(SsePrefix::P66, false, &[0x0F, 0x3A, 0x0B], dst.encoding(), RmOperand::Reg(src.encoding()), 1);
        self.buffer.emit_u8(mode.value() as u8);
    }

    // =========================================================================
    // AVX / AVX2
    // =========================================================================

    avx_ops! {
        SsePrefix::None, 0x58, true, "vaddps": vaddps;
        SsePrefix::P66, 0x58, true, "vaddpd": vaddpd;
        SsePrefix::None, 0x5C, false, "vsubps": vsubps;
        SsePrefix::P66, 0x5C, false, "vsubpd": vsubpd;
        SsePrefix::None, 0x59, true, "vmulps": vmulps;
        SsePrefix::P66, 0x59, true, "vmulpd": vmulpd;
        SsePrefix::None, 0x5E, false, "vdivps": vdivps;
        SsePrefix::P66, 0x5E, false, "vdivpd": vdivpd;
        SsePrefix::P66, 0xFE, true, "vpaddd": vpaddd;
        SsePrefix::P66, 0xD4, true, "vpaddq": vpaddq;
        SsePrefix::P66, 0xFA, false, "vpsubd": vpsubd;
        SsePrefix::P66, 0xDB, true, "vpand": vpand;
        SsePrefix::P66, 0xEB, true, "vpor": vpor;
        SsePrefix::P66, 0xEF, true, "vpxor": vpxor;
        SsePrefix::P66, 0xDF, false, "vpandn": vpandn;
    }

    /// `vmovaps dst, src`
    pub fn vmovaps_rr(&mut self, dst: XmmRegister, src: XmmRegister, len: VectorLength) {
        self.emit_vex(SsePrefix::None, OpcodeMap::Map0F, false, len, 0x28, dst.encoding(), 0, RmOperand::Reg(src.encoding()));
    }

    /// `vmovaps dst, [mem]`
    pub fn vmovaps_rm(&mut self, dst: XmmRegister, src: &Address, len: VectorLength) {
        self.emit_vex(SsePrefix::None, OpcodeMap::Map0F, false, len, 0x28, dst.encoding(), 0, RmOperand::Mem(src));
    }

    /// `vmovaps [mem], src`
    pub fn vmovaps_mr(&mut self, dst: &Address, src: XmmRegister, len: VectorLength) {
        self.emit_vex(SsePrefix::None, OpcodeMap::Map0F, false, len, 0x29, src.encoding(), 0, RmOperand::Mem(dst));
    }

    /// `vmovdqu dst, [mem]`
    pub fn vmovdqu_rm(&mut self, dst: XmmRegister, src: &Address, len: VectorLength) {
        self.emit_vex(SsePrefix::PF3, OpcodeMap::Map0F, false, len, 0x6F, dst.encoding(), 0, RmOperand::Mem(src));
    }

    /// `vmovdqu [mem], src`
    pub fn vmovdqu_mr(&mut self, dst: &Address, src: XmmRegister, len: VectorLength) {
        self.emit_vex(SsePrefix::PF3, OpcodeMap::Map0F, false, len, 0x7F, src.encoding(), 0, RmOperand::Mem(dst));
    }

    /// `vpbroadcastd dst, xmm`
    pub fn vpbroadcastd(&mut self, dst: XmmRegister, src: XmmRegister, len: VectorLength) {
        self.emit_vex(SsePrefix::P66, OpcodeMap::Map0F38, false, len, 0x58, dst.encoding(), 0, RmOperand::Reg(src.encoding()));
    }

    /// `vpermq ymm, ymm, imm8` (256-bit only).
    pub fn vpermq(&mut self, dst: XmmRegister, src: XmmRegister, order: u8) {
        self.emit_vex(
            SsePrefix::P66,
            OpcodeMap::Map0F3A,
            true,
            VectorLength::L256,
            0x00,
            dst.encoding(),
            0,
            RmOperand::Reg(src.encoding()),
        );
        self.buffer.emit_u8(order);
    }

    // =========================================================================
    // Constant area
    // =========================================================================

    /// Address of a deduplicated 32-bit literal.
    pub fn literal_int32(&mut self, value: i32) -> Address {
        Address::constant_area(self.constant_area.add_int32(value))
    }

    /// Address of a deduplicated 64-bit literal.
    pub fn literal_int64(&mut self, value: i64) -> Address {
        Address::constant_area(self.constant_area.add_int64(value))
    }

    /// Address of a `float` literal.
    pub fn literal_float(&mut self, value: f32) -> Address {
        Address::constant_area(self.constant_area.add_float(value))
    }

    /// Address of a `double` literal.
    pub fn literal_double(&mut self, value: f64) -> Address {
        Address::constant_area(self.constant_area.add_double(value))
    }

    /// Address of a fresh 32-bit slot, never shared (jump tables).
    pub fn append_int32(&mut self, value: i32) -> Address {
        Address::constant_area(self.constant_area.append_int32(value))
    }

    /// Append the constant area and resolve every fixup against its start.
    pub fn finalize(mut self) -> AssembledCode {
        if !self.constant_area.is_empty() {
            self.align(4, 0);
        }
        let start = self.buffer.size();
        let self_isa = self.isa;
        let Self {
            mut buffer,
            constant_area,
            ..
        } = self;
        buffer.ensure_capacity(constant_area.size());
        for &slot in constant_area.slots() {
            buffer.emit_u32(slot as u32);
        }
        let (mut code, fixups) = buffer.into_parts();
        let mut absolute_fixups = Vec::new();
        for fixup in &fixups {
            match fixup.kind {
                FixupKind::ConstantArea => {
                    let at = fixup.position;
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(&code[at..at + 4]);
                    let value = i32::from_le_bytes(raw).wrapping_add(start as i32);
                    code[at..at + 4].copy_from_slice(&value.to_le_bytes());
                    if self_isa == InstructionSet::X86 {
                        absolute_fixups.push(at);
                    }
                }
            }
        }
        tracing::debug!(
            code_size = start,
            constant_area = constant_area.size(),
            fixups = fixups.len(),
            "assembler finalized"
        );
        AssembledCode {
            code,
            constant_area_offset: start,
            fixups_resolved: fixups.len(),
            absolute_fixups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x64::ScaleFactor;
    use CpuRegister::*;

    fn asm() -> Assembler {
        Assembler::new(InstructionSet::X86_64)
    }

    #[test]
    fn test_xor_zeroing() {
        let mut a = asm();
        a.xorl_rr(RAX, RAX);
        a.xorq_rr(RAX, RAX);
        assert_eq!(a.code(), &[0x31, 0xC0, 0x48, 0x31, 0xC0]);
    }

    #[test]
    fn test_mov_imm_ret() {
        let mut a = asm();
        a.movl_ri(RCX, Immediate(0x1234_5678));
        a.ret();
        assert_eq!(a.code(), &[0xB9, 0x78, 0x56, 0x34, 0x12, 0xC3]);
    }

    #[test]
    fn test_alu_immediate_forms() {
        let mut a = asm();
        a.addl_ri(RCX, Immediate(1));
        assert_eq!(a.code(), &[0x83, 0xC1, 0x01]);

        let mut a = asm();
        a.addl_ri(RAX, Immediate(0x1000));
        assert_eq!(a.code(), &[0x05, 0x00, 0x10, 0x00, 0x00]);

        let mut a = asm();
        a.cmpq_ri(R9, Immediate(0x1000));
        assert_eq!(a.code(), &[0x49, 0x81, 0xF9, 0x00, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn test_movq_immediate_forms() {
        let mut a = asm();
        a.movq_ri(RAX, Immediate(-1));
        assert_eq!(a.code(), &[0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]);

        let mut a = asm();
        a.movq_ri(R10, Immediate(0x1_0000_0000));
        assert_eq!(a.code(), &[0x49, 0xBA, 0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_memory_operands() {
        let mut a = asm();
        a.movl_rm(RAX, &Address::new(RSP, 8));
        assert_eq!(a.code(), &[0x8B, 0x44, 0x24, 0x08]);

        let mut a = asm();
        a.movq_mr(&Address::indexed(R12, R9, ScaleFactor::Times8, 0x100), RDX);
        assert_eq!(a.code(), &[0x4B, 0x89, 0x94, 0xCC, 0x00, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_byte_register_forces_rex() {
        let mut a = asm();
        a.setcc(Condition::Equal, RSI);
        assert_eq!(a.code(), &[0x40, 0x0F, 0x94, 0xC6]);

        let mut a = asm();
        a.setcc(Condition::Equal, RAX);
        assert_eq!(a.code(), &[0x0F, 0x94, 0xC0]);
    }

    #[test]
    fn test_push_pop() {
        let mut a = asm();
        a.pushq_r(RBP);
        a.pushq_r(R12);
        a.popq_r(R12);
        a.pushq_i(Immediate(5));
        a.pushq_i(Immediate(0x1000));
        assert_eq!(
            a.code(),
            &[0x55, 0x41, 0x54, 0x41, 0x5C, 0x6A, 0x05, 0x68, 0x00, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    #[should_panic(expected = "pushq immediate")]
    fn test_push_imm64_is_fatal() {
        asm().pushq_i(Immediate(1 << 40));
    }

    #[test]
    fn test_forward_jump_binds() {
        let mut a = asm();
        let mut label = Label::new();
        a.jmp(&mut label);
        a.j(Condition::Equal, &mut label);
        a.nop();
        a.bind(&mut label);
        // jmp rel32 at 0..5, je rel32 at 5..11, nop at 11, target 12.
        assert_eq!(&a.code()[..5], &[0xE9, 0x07, 0x00, 0x00, 0x00]);
        assert_eq!(&a.code()[5..11], &[0x0F, 0x84, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(label.position(), 12);
    }

    #[test]
    fn test_backward_jump_short_and_long() {
        let mut a = asm();
        let mut top = Label::new();
        a.bind(&mut top);
        a.nop();
        a.jmp(&mut top);
        assert_eq!(&a.code()[1..], &[0xEB, 0xFD]);

        a.nop_bytes(200);
        let before = a.code_size();
        a.j(Condition::NotEqual, &mut top);
        let disp = i32::from_le_bytes(a.code()[before + 2..before + 6].try_into().unwrap());
        assert_eq!(a.code()[before..before + 2], [0x0F, 0x85]);
        assert_eq!(disp as i64, -(before as i64 + 6));
    }

    #[test]
    fn test_near_label_chain() {
        let mut a = asm();
        let mut done = NearLabel::new();
        a.j_near(Condition::Equal, &mut done);
        a.nop();
        a.jmp_near(&mut done);
        a.bind_near(&mut done);
        assert_eq!(a.code(), &[0x74, 0x03, 0x90, 0xEB, 0x00]);
    }

    #[test]
    #[should_panic(expected = "does not fit 8 bits")]
    fn test_near_label_out_of_range() {
        let mut a = asm();
        let mut done = NearLabel::new();
        a.jmp_near(&mut done);
        a.nop_bytes(300);
        a.bind_near(&mut done);
    }

    #[test]
    fn test_constant_area_fixup() {
        let mut a = asm();
        let lit = a.literal_double(1.0);
        a.movsd_rm(XmmRegister::XMM0, &lit);
        a.ret();
        let code = a.finalize();
        // movsd xmm0, [rip+disp32] is 8 bytes, ret 1, then padding to 12.
        assert_eq!(code.constant_area_offset, 12);
        assert_eq!(code.fixups_resolved, 1);
        let disp = i32::from_le_bytes(code.code[4..8].try_into().unwrap());
        assert_eq!(8 + disp as usize, code.constant_area_offset);
        assert_eq!(&code.code[12..20], &1.0f64.to_bits().to_le_bytes());
    }

    #[test]
    fn test_x86_mode_plain_encodings() {
        let mut a = Assembler::new(InstructionSet::X86);
        a.xorl_rr(RAX, RAX);
        a.pushq_r(RBP);
        assert_eq!(a.code(), &[0x31, 0xC0, 0x55]);
    }

    #[test]
    #[should_panic(expected = "unavailable on x86")]
    fn test_x86_mode_rejects_rex() {
        Assembler::new(InstructionSet::X86).addq_rr(RAX, RCX);
    }

    #[test]
    fn test_vex_commutative_swap() {
        let mut a = asm();
        a.vpaddd(XmmRegister::XMM0, XmmRegister::XMM1, XmmRegister::XMM9, VectorLength::L128);
        // Swapped to vvvv=xmm9, rm=xmm1 so the 2-byte form applies.
        assert_eq!(a.code(), &[0xC5, 0xB1, 0xFE, 0xC1]);

        let mut a = asm();
        a.vpsubd(XmmRegister::XMM0, XmmRegister::XMM1, XmmRegister::XMM9, VectorLength::L128);
        assert_eq!(a.code(), &[0xC4, 0xC1, 0x71, 0xFA, 0xC1]);
    }

    #[test]
    fn test_align() {
        let mut a = asm();
        a.ret();
        a.align(16, 0);
        assert_eq!(a.code_size(), 16);
        a.align(16, 0);
        assert_eq!(a.code_size(), 16);
    }
}
