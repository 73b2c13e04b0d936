//! Programmatic construction of code items.
//!
//! Used by the runtime to synthesize small stubs and by tests to write
//! methods without a dex file. Branch targets are symbolic [`CodeLabel`]s
//! patched at [`CodeItemBuilder::build`]; switch and array payloads are laid
//! out after the last instruction.

use super::code_item::{CatchHandler, CodeItem, TryItem};
use super::instruction::{ARRAY_DATA_SIGNATURE, PACKED_SWITCH_SIGNATURE, SPARSE_SWITCH_SIGNATURE};
use super::opcodes::{InstructionFormat, Opcode};
use ember_core::{EmberError, EmberResult, TypeIndex};

/// A branch target inside a code item under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeLabel(usize);

#[derive(Debug, Clone, Copy)]
enum FixupKind {
    /// Signed byte in the high half of the first unit.
    Rel8,
    /// Signed 16 bits at unit 1.
    Rel16,
    /// Signed 32 bits at units 1..3.
    Rel32,
}

#[derive(Debug)]
struct Fixup {
    inst_pc: u32,
    label: CodeLabel,
    kind: FixupKind,
}

#[derive(Debug)]
enum Payload {
    Packed { first_key: i32, targets: Vec<CodeLabel> },
    Sparse { entries: Vec<(i32, CodeLabel)> },
    Array { width: u16, elements: Vec<u64> },
}

#[derive(Debug)]
struct PendingTry {
    start: CodeLabel,
    end: CodeLabel,
    handlers: Vec<(TypeIndex, CodeLabel)>,
    catch_all: Option<CodeLabel>,
}

/// Builds a [`CodeItem`] one instruction at a time.
#[derive(Debug)]
pub struct CodeItemBuilder {
    registers: u16,
    ins: u16,
    outs: u16,
    insns: Vec<u16>,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
    payloads: Vec<(u32, Payload)>,
    tries: Vec<PendingTry>,
}

impl CodeItemBuilder {
    /// A method with `registers` virtual registers, the last `ins` of which
    /// receive the arguments.
    pub fn new(registers: u16, ins: u16) -> Self {
        Self {
            registers,
            ins,
            outs: 0,
            insns: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            payloads: Vec::new(),
            tries: Vec::new(),
        }
    }

    /// Current position in code units.
    pub fn pc(&self) -> u32 {
        self.insns.len() as u32
    }

    pub fn label(&mut self) -> CodeLabel {
        self.labels.push(None);
        CodeLabel(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: CodeLabel) {
        self.labels[label.0] = Some(self.pc());
    }

    fn first_unit(op: Opcode, high: u16) -> u16 {
        (high << 8) | op as u16
    }

    fn check_format(op: Opcode, expected: &[InstructionFormat]) {
        debug_assert!(expected.contains(&op.format()), "{} has format {:?}", op, op.format());
    }

    // =========================================================================
    // Plain formats
    // =========================================================================

    pub fn op_10x(&mut self, op: Opcode) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K10x]);
        self.insns.push(op as u16);
        self
    }

    pub fn op_12x(&mut self, op: Opcode, a: u16, b: u16) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K12x]);
        self.insns.push(Self::first_unit(op, (b << 4) | (a & 0xf)));
        self
    }

    pub fn op_11n(&mut self, op: Opcode, a: u16, literal: i8) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K11n]);
        let nibble = (literal as u16) & 0xf;
        self.insns.push(Self::first_unit(op, (nibble << 4) | (a & 0xf)));
        self
    }

    pub fn op_11x(&mut self, op: Opcode, a: u16) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K11x]);
        self.insns.push(Self::first_unit(op, a));
        self
    }

    pub fn op_22x(&mut self, op: Opcode, a: u16, b: u16) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K22x]);
        self.insns.extend_from_slice(&[Self::first_unit(op, a), b]);
        self
    }

    pub fn op_32x(&mut self, op: Opcode, a: u16, b: u16) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K32x]);
        self.insns.extend_from_slice(&[op as u16, a, b]);
        self
    }

    /// 21s, 21h and 21c: `AA|op BBBB`.
    pub fn op_21(&mut self, op: Opcode, a: u16, b: u16) -> &mut Self {
        Self::check_format(
            op,
            &[InstructionFormat::K21s, InstructionFormat::K21h, InstructionFormat::K21c],
        );
        self.insns.extend_from_slice(&[Self::first_unit(op, a), b]);
        self
    }

    pub fn op_23x(&mut self, op: Opcode, a: u16, b: u16, c: u16) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K23x]);
        self.insns.extend_from_slice(&[Self::first_unit(op, a), (c << 8) | (b & 0xff)]);
        self
    }

    pub fn op_22b(&mut self, op: Opcode, a: u16, b: u16, literal: i8) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K22b]);
        self.insns
            .extend_from_slice(&[Self::first_unit(op, a), ((literal as u8 as u16) << 8) | (b & 0xff)]);
        self
    }

    /// 22s and 22c: `B|A|op CCCC`.
    pub fn op_22(&mut self, op: Opcode, a: u16, b: u16, c: u16) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K22s, InstructionFormat::K22c]);
        self.insns
            .extend_from_slice(&[Self::first_unit(op, (b << 4) | (a & 0xf)), c]);
        self
    }

    /// 31i and 31c: `AA|op BBBBlo BBBBhi`.
    pub fn op_31(&mut self, op: Opcode, a: u16, b: u32) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K31i, InstructionFormat::K31c]);
        self.insns
            .extend_from_slice(&[Self::first_unit(op, a), b as u16, (b >> 16) as u16]);
        self
    }

    pub fn op_51l(&mut self, op: Opcode, a: u16, literal: i64) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K51l]);
        let bits = literal as u64;
        self.insns.extend_from_slice(&[
            Self::first_unit(op, a),
            bits as u16,
            (bits >> 16) as u16,
            (bits >> 32) as u16,
            (bits >> 48) as u16,
        ]);
        self
    }

    /// 35c argument list; `index` is the method, type or call-site index.
    pub fn op_35c(&mut self, op: Opcode, index: u16, args: &[u16]) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K35c]);
        self.push_var_args(op, index, args);
        self
    }

    fn push_var_args(&mut self, op: Opcode, index: u16, args: &[u16]) {
        assert!(args.len() <= 5, "at most five argument registers");
        let get = |i: usize| args.get(i).copied().unwrap_or(0) & 0xf;
        let high = ((args.len() as u16) << 4) | get(4);
        let packed = get(0) | (get(1) << 4) | (get(2) << 8) | (get(3) << 12);
        self.insns.extend_from_slice(&[Self::first_unit(op, high), index, packed]);
        self.outs = self.outs.max(args.len() as u16);
    }

    /// 3rc register range `first .. first + count`.
    pub fn op_3rc(&mut self, op: Opcode, index: u16, first: u16, count: u8) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K3rc]);
        self.insns
            .extend_from_slice(&[Self::first_unit(op, u16::from(count)), index, first]);
        self.outs = self.outs.max(u16::from(count));
        self
    }

    pub fn op_45cc(&mut self, op: Opcode, method: u16, args: &[u16], proto: u16) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K45cc]);
        self.push_var_args(op, method, args);
        self.insns.push(proto);
        self
    }

    pub fn op_4rcc(&mut self, op: Opcode, method: u16, first: u16, count: u8, proto: u16) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K4rcc]);
        self.insns
            .extend_from_slice(&[Self::first_unit(op, u16::from(count)), method, first, proto]);
        self.outs = self.outs.max(u16::from(count));
        self
    }

    // =========================================================================
    // Branches
    // =========================================================================

    /// `goto/32`, which reaches any label.
    pub fn goto(&mut self, target: CodeLabel) -> &mut Self {
        self.fixups.push(Fixup {
            inst_pc: self.pc(),
            label: target,
            kind: FixupKind::Rel32,
        });
        self.insns.extend_from_slice(&[Opcode::Goto32 as u16, 0, 0]);
        self
    }

    /// One-unit `goto`; the target must be within a signed byte.
    pub fn goto_short(&mut self, target: CodeLabel) -> &mut Self {
        self.fixups.push(Fixup {
            inst_pc: self.pc(),
            label: target,
            kind: FixupKind::Rel8,
        });
        self.insns.push(Opcode::Goto as u16);
        self
    }

    /// Two-register compare-and-branch (`if-eq` .. `if-le`).
    pub fn if_test(&mut self, op: Opcode, a: u16, b: u16, target: CodeLabel) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K22t]);
        self.fixups.push(Fixup {
            inst_pc: self.pc(),
            label: target,
            kind: FixupKind::Rel16,
        });
        self.insns
            .extend_from_slice(&[Self::first_unit(op, (b << 4) | (a & 0xf)), 0]);
        self
    }

    /// Compare-with-zero branch (`if-eqz` .. `if-lez`).
    pub fn if_testz(&mut self, op: Opcode, a: u16, target: CodeLabel) -> &mut Self {
        Self::check_format(op, &[InstructionFormat::K21t]);
        self.fixups.push(Fixup {
            inst_pc: self.pc(),
            label: target,
            kind: FixupKind::Rel16,
        });
        self.insns.extend_from_slice(&[Self::first_unit(op, a), 0]);
        self
    }

    // =========================================================================
    // Payload instructions
    // =========================================================================

    fn push_31t(&mut self, op: Opcode, a: u16, payload: Payload) {
        self.payloads.push((self.pc(), payload));
        self.insns.extend_from_slice(&[Self::first_unit(op, a), 0, 0]);
    }

    pub fn packed_switch(&mut self, a: u16, first_key: i32, targets: &[CodeLabel]) -> &mut Self {
        self.push_31t(
            Opcode::PackedSwitch,
            a,
            Payload::Packed {
                first_key,
                targets: targets.to_vec(),
            },
        );
        self
    }

    pub fn sparse_switch(&mut self, a: u16, entries: &[(i32, CodeLabel)]) -> &mut Self {
        let mut entries = entries.to_vec();
        entries.sort_by_key(|(k, _)| *k);
        self.push_31t(Opcode::SparseSwitch, a, Payload::Sparse { entries });
        self
    }

    /// `fill-array-data` with `width`-byte elements.
    pub fn fill_array_data(&mut self, a: u16, width: u16, elements: &[u64]) -> &mut Self {
        self.push_31t(
            Opcode::FillArrayData,
            a,
            Payload::Array {
                width,
                elements: elements.to_vec(),
            },
        );
        self
    }

    // =========================================================================
    // Try ranges
    // =========================================================================

    /// Protect `[start, end)` with typed handlers and an optional catch-all.
    pub fn try_range(
        &mut self,
        start: CodeLabel,
        end: CodeLabel,
        handlers: &[(TypeIndex, CodeLabel)],
        catch_all: Option<CodeLabel>,
    ) -> &mut Self {
        self.tries.push(PendingTry {
            start,
            end,
            handlers: handlers.to_vec(),
            catch_all,
        });
        self
    }

    // =========================================================================
    // Build
    // =========================================================================

    fn resolve(&self, label: CodeLabel) -> EmberResult<u32> {
        self.labels
            .get(label.0)
            .copied()
            .flatten()
            .ok_or(EmberError::UnboundLabel { position: label.0 })
    }

    /// Lay out payloads, patch branches and produce the code item.
    pub fn build(mut self) -> EmberResult<CodeItem> {
        let payloads = std::mem::take(&mut self.payloads);
        for (inst_pc, payload) in payloads {
            // Payloads must start on an even code unit.
            if self.insns.len() % 2 == 1 {
                self.insns.push(Opcode::Nop as u16);
            }
            let at = self.pc();
            let offset = at - inst_pc;
            self.insns[inst_pc as usize + 1] = offset as u16;
            self.insns[inst_pc as usize + 2] = (offset >> 16) as u16;
            match payload {
                Payload::Packed { first_key, targets } => {
                    self.insns.push(PACKED_SWITCH_SIGNATURE);
                    self.insns.push(targets.len() as u16);
                    self.push_i32(first_key);
                    for t in targets {
                        let rel = self.resolve(t)? as i32 - inst_pc as i32;
                        self.push_i32(rel);
                    }
                }
                Payload::Sparse { entries } => {
                    self.insns.push(SPARSE_SWITCH_SIGNATURE);
                    self.insns.push(entries.len() as u16);
                    for (key, _) in &entries {
                        self.push_i32(*key);
                    }
                    for (_, t) in &entries {
                        let rel = self.resolve(*t)? as i32 - inst_pc as i32;
                        self.push_i32(rel);
                    }
                }
                Payload::Array { width, elements } => {
                    self.insns.push(ARRAY_DATA_SIGNATURE);
                    self.insns.push(width);
                    self.push_i32(elements.len() as i32);
                    let mut bytes = Vec::with_capacity(elements.len() * usize::from(width));
                    for e in elements {
                        bytes.extend_from_slice(&e.to_le_bytes()[..usize::from(width)]);
                    }
                    for pair in bytes.chunks(2) {
                        let lo = u16::from(pair[0]);
                        let hi = pair.get(1).map_or(0, |&b| u16::from(b));
                        self.insns.push(lo | (hi << 8));
                    }
                }
            }
        }

        for fixup in std::mem::take(&mut self.fixups) {
            let rel = self.resolve(fixup.label)? as i64 - i64::from(fixup.inst_pc);
            let at = fixup.inst_pc as usize;
            match fixup.kind {
                FixupKind::Rel8 => {
                    let byte = i8::try_from(rel).map_err(|_| EmberError::encoding("goto target out of range"))?;
                    self.insns[at] = (u16::from(byte as u8) << 8) | (self.insns[at] & 0xff);
                }
                FixupKind::Rel16 => {
                    let half = i16::try_from(rel).map_err(|_| EmberError::encoding("branch target out of range"))?;
                    self.insns[at + 1] = half as u16;
                }
                FixupKind::Rel32 => {
                    self.insns[at + 1] = rel as u16;
                    self.insns[at + 2] = ((rel as i32) >> 16) as u16;
                }
            }
        }

        let mut tries = Vec::with_capacity(self.tries.len());
        for t in &self.tries {
            let start = self.resolve(t.start)?;
            let end = self.resolve(t.end)?;
            let handlers = t
                .handlers
                .iter()
                .map(|(type_index, label)| {
                    Ok(CatchHandler {
                        type_index: *type_index,
                        address: self.resolve(*label)?,
                    })
                })
                .collect::<EmberResult<Vec<_>>>()?;
            let catch_all = t.catch_all.map(|l| self.resolve(l)).transpose()?;
            tries.push(TryItem {
                start_addr: start,
                insn_count: end.saturating_sub(start),
                handlers,
                catch_all,
            });
        }

        Ok(CodeItem {
            registers_size: self.registers,
            ins_size: self.ins,
            outs_size: self.outs,
            insns: self.insns,
            tries,
        })
    }

    fn push_i32(&mut self, value: i32) {
        let bits = value as u32;
        self.insns.push(bits as u16);
        self.insns.push((bits >> 16) as u16);
    }
}
