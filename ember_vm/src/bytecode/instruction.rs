//! Instruction decoding over a code-unit stream.

use super::opcodes::{IndexType, InstructionFormat, Opcode};
use smallvec::SmallVec;
use std::fmt::Write as _;

/// Pseudo-opcode identifiers carried in the high byte of a `nop`.
pub const PACKED_SWITCH_SIGNATURE: u16 = 0x0100;
pub const SPARSE_SWITCH_SIGNATURE: u16 = 0x0200;
pub const ARRAY_DATA_SIGNATURE: u16 = 0x0300;

/// Maximum number of argument registers in the non-range invoke forms.
pub const MAX_VAR_ARG_REGS: usize = 5;

/// A decoded view of one instruction.
///
/// Borrows the code units from the instruction's first unit to the end of
/// the method, so payload-relative offsets can be followed.
#[derive(Clone, Copy)]
pub struct Instruction<'a> {
    units: &'a [u16],
}

impl<'a> Instruction<'a> {
    /// View the instruction at `dex_pc`. `None` if the pc is out of range.
    #[inline]
    pub fn at(code: &'a [u16], dex_pc: u32) -> Option<Self> {
        let units = code.get(dex_pc as usize..)?;
        if units.is_empty() {
            return None;
        }
        Some(Self { units })
    }

    #[inline(always)]
    fn unit(&self, i: usize) -> u16 {
        self.units.get(i).copied().unwrap_or(0)
    }

    #[inline(always)]
    pub fn opcode(&self) -> Opcode {
        Opcode::from_u8(self.unit(0) as u8)
    }

    #[inline(always)]
    pub fn format(&self) -> InstructionFormat {
        self.opcode().format()
    }

    #[inline(always)]
    fn inst_aa(&self) -> u32 {
        u32::from(self.unit(0) >> 8)
    }

    #[inline(always)]
    fn inst_a(&self) -> u32 {
        u32::from((self.unit(0) >> 8) & 0xf)
    }

    #[inline(always)]
    fn inst_b(&self) -> u32 {
        u32::from(self.unit(0) >> 12)
    }

    #[inline(always)]
    fn fetch32(&self, i: usize) -> u32 {
        u32::from(self.unit(i)) | (u32::from(self.unit(i + 1)) << 16)
    }

    /// Whether this `nop` heads a data payload.
    pub fn is_payload(&self) -> bool {
        matches!(
            self.unit(0),
            PACKED_SWITCH_SIGNATURE | SPARSE_SWITCH_SIGNATURE | ARRAY_DATA_SIGNATURE
        )
    }

    /// Size in code units, payload pseudo-instructions included.
    pub fn size_in_code_units(&self) -> usize {
        match self.unit(0) {
            PACKED_SWITCH_SIGNATURE => 4 + usize::from(self.unit(1)) * 2,
            SPARSE_SWITCH_SIGNATURE => 2 + usize::from(self.unit(1)) * 4,
            ARRAY_DATA_SIGNATURE => {
                let width = usize::from(self.unit(1));
                let count = self.fetch32(2) as usize;
                4 + (width * count).div_ceil(2)
            }
            _ => self.format().size_in_code_units(),
        }
    }

    /// Register (or literal) A.
    pub fn vreg_a(&self) -> u32 {
        use InstructionFormat::*;
        match self.format() {
            K12x | K11n | K22t | K22s | K22c => self.inst_a(),
            K11x | K10t | K22x | K21t | K21s | K21h | K21c | K23x | K22b | K31t | K31i | K31c | K3rc | K4rcc
            | K51l | K20bc => self.inst_aa(),
            K20t => u32::from(self.unit(1)),
            K32x => u32::from(self.unit(1)),
            K30t => self.fetch32(1),
            K35c | K45cc => self.inst_b(),
            K10x => 0,
        }
    }

    /// Register (or literal, index) B.
    pub fn vreg_b(&self) -> u32 {
        use InstructionFormat::*;
        match self.format() {
            K12x | K11n => self.inst_b(),
            K22x | K21t | K21s | K21h | K21c | K35c | K3rc | K45cc | K4rcc | K20bc => u32::from(self.unit(1)),
            K23x | K22b => u32::from(self.unit(1) & 0xff),
            K22t | K22s | K22c => self.inst_b(),
            K32x => u32::from(self.unit(2)),
            K31t | K31i | K31c => self.fetch32(1),
            K51l => self.fetch32(1),
            _ => 0,
        }
    }

    /// Register (or literal, index) C.
    pub fn vreg_c(&self) -> u32 {
        use InstructionFormat::*;
        match self.format() {
            K23x | K22b => u32::from(self.unit(1) >> 8),
            K22t | K22s | K22c => u32::from(self.unit(1)),
            K35c | K45cc => u32::from(self.unit(2) & 0xf),
            K3rc | K4rcc => u32::from(self.unit(2)),
            _ => 0,
        }
    }

    /// The prototype index of the polymorphic forms.
    pub fn vreg_h(&self) -> u32 {
        match self.format() {
            InstructionFormat::K45cc | InstructionFormat::K4rcc => u32::from(self.unit(3)),
            _ => 0,
        }
    }

    /// Signed 4-bit literal of `const/4`.
    pub fn literal_11n(&self) -> i32 {
        ((self.unit(0) as i16) >> 12) as i32
    }

    /// Signed 16-bit B of the 21s/21t/22s/22t forms.
    pub fn literal_s16(&self, unit: usize) -> i32 {
        i32::from(self.unit(unit) as i16)
    }

    /// Signed 8-bit C of the 22b form.
    pub fn literal_22b(&self) -> i32 {
        i32::from((self.unit(1) >> 8) as u8 as i8)
    }

    /// The 64-bit literal of `const-wide`.
    pub fn wide_literal(&self) -> i64 {
        (u64::from(self.fetch32(1)) | (u64::from(self.fetch32(3)) << 32)) as i64
    }

    /// Branch offset in code units, sign-extended.
    pub fn branch_offset(&self) -> i32 {
        use InstructionFormat::*;
        match self.format() {
            K10t => i32::from((self.unit(0) >> 8) as u8 as i8),
            K20t => self.literal_s16(1),
            K30t => self.fetch32(1) as i32,
            K21t => self.literal_s16(1),
            K22t => self.literal_s16(1),
            K31t => self.fetch32(1) as i32,
            _ => 0,
        }
    }

    /// Registers of a 35c/45cc argument list, in order.
    pub fn var_args(&self) -> SmallVec<[u32; MAX_VAR_ARG_REGS]> {
        let count = self.inst_b() as usize;
        let packed = self.unit(2);
        let mut regs = SmallVec::new();
        let all = [
            u32::from(packed & 0xf),
            u32::from((packed >> 4) & 0xf),
            u32::from((packed >> 8) & 0xf),
            u32::from((packed >> 12) & 0xf),
            self.inst_a(),
        ];
        regs.extend_from_slice(&all[..count.min(MAX_VAR_ARG_REGS)]);
        regs
    }

    /// Argument registers of either form.
    pub fn arg_registers(&self) -> SmallVec<[u32; MAX_VAR_ARG_REGS]> {
        match self.format() {
            InstructionFormat::K3rc | InstructionFormat::K4rcc => {
                let first = self.vreg_c();
                (first..first + self.inst_aa()).collect()
            }
            _ => self.var_args(),
        }
    }

    /// The code units following this instruction's start.
    pub fn raw(&self) -> &'a [u16] {
        self.units
    }

    /// Human-readable disassembly, e.g. `add-int v0, v1, v2`.
    pub fn dump(&self) -> String {
        let op = self.opcode();
        match self.unit(0) {
            PACKED_SWITCH_SIGNATURE => return format!("packed-switch-payload ({} entries)", self.unit(1)),
            SPARSE_SWITCH_SIGNATURE => return format!("sparse-switch-payload ({} entries)", self.unit(1)),
            ARRAY_DATA_SIGNATURE => {
                return format!("array-data ({} x {} bytes)", self.fetch32(2), self.unit(1));
            }
            _ => {}
        }
        let mut out = String::from(op.name());
        let index = |kind: IndexType, value: u32| -> String {
            let tag = match kind {
                IndexType::StringRef => "string",
                IndexType::TypeRef => "type",
                IndexType::FieldRef => "field",
                IndexType::MethodRef | IndexType::MethodAndProtoRef => "method",
                IndexType::CallSiteRef => "call_site",
                IndexType::MethodHandleRef => "method_handle",
                IndexType::ProtoRef => "proto",
                IndexType::None => "",
            };
            format!("{}@{}", tag, value)
        };
        use InstructionFormat::*;
        let _ = match op.format() {
            K10x => Ok(()),
            K12x => write!(out, " v{}, v{}", self.vreg_a(), self.vreg_b()),
            K11n => write!(out, " v{}, #{}", self.vreg_a(), self.literal_11n()),
            K11x => write!(out, " v{}", self.vreg_a()),
            K10t | K20t | K30t => write!(out, " {:+}", self.branch_offset()),
            K20bc => write!(out, " {}", self.vreg_b()),
            K22x | K32x => write!(out, " v{}, v{}", self.vreg_a(), self.vreg_b()),
            K21t => write!(out, " v{}, {:+}", self.vreg_a(), self.branch_offset()),
            K21s => write!(out, " v{}, #{}", self.vreg_a(), self.literal_s16(1)),
            K21h => write!(out, " v{}, #{:#x}", self.vreg_a(), self.vreg_b()),
            K21c | K31c => write!(out, " v{}, {}", self.vreg_a(), index(op.index_type(), self.vreg_b())),
            K23x => write!(out, " v{}, v{}, v{}", self.vreg_a(), self.vreg_b(), self.vreg_c()),
            K22b => write!(out, " v{}, v{}, #{}", self.vreg_a(), self.vreg_b(), self.literal_22b()),
            K22t => write!(out, " v{}, v{}, {:+}", self.vreg_a(), self.vreg_b(), self.branch_offset()),
            K22s => write!(out, " v{}, v{}, #{}", self.vreg_a(), self.vreg_b(), self.literal_s16(1)),
            K22c => write!(
                out,
                " v{}, v{}, {}",
                self.vreg_a(),
                self.vreg_b(),
                index(op.index_type(), self.vreg_c())
            ),
            K31t => write!(out, " v{}, {:+}", self.vreg_a(), self.branch_offset()),
            K31i => write!(out, " v{}, #{}", self.vreg_a(), self.vreg_b() as i32),
            K35c | K45cc => {
                let regs: Vec<String> = self.var_args().iter().map(|r| format!("v{}", r)).collect();
                let _ = write!(out, " {{{}}}, {}", regs.join(", "), index(op.index_type(), self.vreg_b()));
                if op.format() == K45cc {
                    write!(out, ", proto@{}", self.vreg_h())
                } else {
                    Ok(())
                }
            }
            K3rc | K4rcc => {
                let first = self.vreg_c();
                let last = (first + self.inst_aa()).saturating_sub(1);
                let _ = write!(out, " {{v{} .. v{}}}, {}", first, last, index(op.index_type(), self.vreg_b()));
                if op.format() == K4rcc {
                    write!(out, ", proto@{}", self.vreg_h())
                } else {
                    Ok(())
                }
            }
            K51l => write!(out, " v{}, #{}", self.vreg_a(), self.wide_literal()),
        };
        out
    }
}

impl std::fmt::Debug for Instruction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.dump())
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// A `packed-switch` table: consecutive keys from `first_key`.
#[derive(Debug)]
pub struct PackedSwitchPayload<'a> {
    pub first_key: i32,
    targets: &'a [u16],
}

impl PackedSwitchPayload<'_> {
    pub fn len(&self) -> usize {
        self.targets.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Branch offset (relative to the switch) for `key`.
    pub fn lookup(&self, key: i32) -> Option<i32> {
        let index = i64::from(key) - i64::from(self.first_key);
        if index < 0 || index >= self.len() as i64 {
            return None;
        }
        let i = index as usize * 2;
        Some((u32::from(self.targets[i]) | (u32::from(self.targets[i + 1]) << 16)) as i32)
    }
}

/// A `sparse-switch` table: sorted keys then targets.
#[derive(Debug)]
pub struct SparseSwitchPayload<'a> {
    keys: &'a [u16],
    targets: &'a [u16],
}

impl SparseSwitchPayload<'_> {
    fn read(units: &[u16], i: usize) -> i32 {
        (u32::from(units[i * 2]) | (u32::from(units[i * 2 + 1]) << 16)) as i32
    }

    pub fn len(&self) -> usize {
        self.keys.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn lookup(&self, key: i32) -> Option<i32> {
        let (mut lo, mut hi) = (0usize, self.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            let k = Self::read(self.keys, mid);
            match k.cmp(&key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(Self::read(self.targets, mid)),
            }
        }
        None
    }
}

/// A `fill-array-data` table.
#[derive(Debug)]
pub struct ArrayDataPayload<'a> {
    pub element_width: usize,
    pub element_count: usize,
    data: &'a [u16],
}

impl ArrayDataPayload<'_> {
    /// Element `i`, zero-extended to 64 bits.
    pub fn element(&self, i: usize) -> u64 {
        let byte_at = |b: usize| -> u64 {
            let unit = self.data[b / 2];
            u64::from(if b % 2 == 0 { unit & 0xff } else { unit >> 8 })
        };
        let start = i * self.element_width;
        (0..self.element_width).fold(0u64, |acc, k| acc | (byte_at(start + k) << (8 * k)))
    }
}

impl<'a> Instruction<'a> {
    /// The payload addressed by a 31t instruction, if well formed.
    fn payload(&self) -> Option<&'a [u16]> {
        let offset = self.branch_offset();
        if offset < 0 {
            return None;
        }
        self.units.get(offset as usize..)
    }

    pub fn packed_switch_payload(&self) -> Option<PackedSwitchPayload<'a>> {
        let p = self.payload()?;
        if *p.first()? != PACKED_SWITCH_SIGNATURE {
            return None;
        }
        let size = usize::from(*p.get(1)?);
        let first_key = (u32::from(*p.get(2)?) | (u32::from(*p.get(3)?) << 16)) as i32;
        let targets = p.get(4..4 + size * 2)?;
        Some(PackedSwitchPayload { first_key, targets })
    }

    pub fn sparse_switch_payload(&self) -> Option<SparseSwitchPayload<'a>> {
        let p = self.payload()?;
        if *p.first()? != SPARSE_SWITCH_SIGNATURE {
            return None;
        }
        let size = usize::from(*p.get(1)?);
        let keys = p.get(2..2 + size * 2)?;
        let targets = p.get(2 + size * 2..2 + size * 4)?;
        Some(SparseSwitchPayload { keys, targets })
    }

    pub fn array_data_payload(&self) -> Option<ArrayDataPayload<'a>> {
        let p = self.payload()?;
        if *p.first()? != ARRAY_DATA_SIGNATURE {
            return None;
        }
        let element_width = usize::from(*p.get(1)?);
        let element_count = (u32::from(*p.get(2)?) | (u32::from(*p.get(3)?) << 16)) as usize;
        let data = p.get(4..4 + (element_width * element_count).div_ceil(2))?;
        Some(ArrayDataPayload {
            element_width,
            element_count,
            data,
        })
    }
}

/// Iterate instructions of a code array in order.
pub fn instructions(code: &[u16]) -> impl Iterator<Item = (u32, Instruction<'_>)> {
    let mut pc = 0usize;
    std::iter::from_fn(move || {
        let inst = Instruction::at(code, pc as u32)?;
        let at = pc as u32;
        pc += inst.size_in_code_units().max(1);
        Some((at, inst))
    })
}
