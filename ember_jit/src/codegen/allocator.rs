//! Local register assignment and frame layout.
//!
//! Values live in home stack slots between instructions. Each instruction's
//! unallocated constraints are resolved to distinct physical registers; the
//! code generator loads inputs from their homes, runs the instruction and
//! stores the output back. Nothing stays in a register across instructions,
//! so calls never need caller-save spilling and stack maps only describe
//! home slots plus the registers a slow path saves.
//!
//! # Frame layout (RSP-relative, growing down)
//!
//! ```text
//! ┌───────────────────────────────┐ caller's SP
//! │  return address               │
//! ├───────────────────────────────┤
//! │  callee-save pushes           │
//! ├───────────────────────────────┤
//! │  slow-path register save area │ (only with non-fatal slow paths)
//! ├───────────────────────────────┤
//! │  value homes (references first)│
//! ├───────────────────────────────┤
//! │  outgoing stack arguments     │ ← SP + 8
//! ├───────────────────────────────┤
//! │  current method               │ ← SP
//! └───────────────────────────────┘
//! ```

use super::hir::{BlockId, DataType, HGraph, HKind, InstructionId};
use super::location::{CallKind, Location, LocationSummary, Policy};
use crate::backend::x64::{
    CpuRegister, ManagedCallingConvention, RegisterSet, RuntimeCallingConvention, XmmRegister, XmmSet,
};
use crate::error::{CodegenError, CodegenResult};
use crate::options::{CodegenOptions, InstructionSet};
use ember_core::bits::align_up;

/// Start of the outgoing argument area.
pub const OUT_ARGS_OFFSET: i32 = 8;
/// Bytes per home slot and per stack argument.
pub const SLOT_SIZE: i32 = 8;
/// Core registers then XMM registers, one slot each.
const SAVE_AREA_SIZE: i32 = 32 * SLOT_SIZE;
/// Frame bytes a stack-map stack mask can describe.
const STACK_MASK_REACH: i32 = 64 * 4;

const CORE_PREFERENCE_64: [CpuRegister; 14] = [
    CpuRegister::RAX,
    CpuRegister::RCX,
    CpuRegister::RDX,
    CpuRegister::RSI,
    CpuRegister::RDI,
    CpuRegister::R8,
    CpuRegister::R9,
    CpuRegister::R10,
    CpuRegister::RBX,
    CpuRegister::RBP,
    CpuRegister::R12,
    CpuRegister::R13,
    CpuRegister::R14,
    CpuRegister::R15,
];

const CORE_PREFERENCE_32: [CpuRegister; 6] = [
    CpuRegister::RAX,
    CpuRegister::RCX,
    CpuRegister::RDX,
    CpuRegister::RSI,
    CpuRegister::RDI,
    CpuRegister::RBX,
];

/// Register reserved for memory-to-memory moves and cycle breaking.
#[inline]
pub const fn scratch_register(isa: InstructionSet) -> CpuRegister {
    match isa {
        InstructionSet::X86_64 => ManagedCallingConvention::SCRATCH,
        InstructionSet::X86 => CpuRegister::RBP,
    }
}

/// XMM register reserved for swaps and never allocated.
#[inline]
pub const fn fpu_scratch_register(isa: InstructionSet) -> XmmRegister {
    match isa {
        InstructionSet::X86_64 => XmmRegister::XMM15,
        InstructionSet::X86 => XmmRegister::XMM7,
    }
}

/// Core argument registers of managed calls.
pub fn managed_core_arguments(isa: InstructionSet) -> &'static [CpuRegister] {
    match isa {
        InstructionSet::X86_64 => &ManagedCallingConvention::CORE_ARGUMENTS,
        InstructionSet::X86 => &ManagedCallingConvention::CORE_ARGUMENTS[..3],
    }
}

/// XMM argument registers of managed calls. x86 keeps XMM7 free as the
/// FPU scratch register.
pub fn managed_fpu_arguments(isa: InstructionSet) -> &'static [XmmRegister] {
    match isa {
        InstructionSet::X86_64 => &ManagedCallingConvention::FPU_ARGUMENTS,
        InstructionSet::X86 => &ManagedCallingConvention::FPU_ARGUMENTS[..4],
    }
}

/// Register carrying runtime argument `index`.
pub fn runtime_argument(isa: InstructionSet, index: usize) -> CpuRegister {
    let limit = match isa {
        InstructionSet::X86_64 => RuntimeCallingConvention::CORE_ARGUMENTS.len(),
        InstructionSet::X86 => 4,
    };
    ember_core::check!(index < limit, "runtime argument {} has no register on {}", index, isa);
    RuntimeCallingConvention::CORE_ARGUMENTS[index]
}

// =============================================================================
// Arguments
// =============================================================================

/// Where one argument of a managed call travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    Core(CpuRegister),
    /// 64-bit integer on x86.
    CorePair(CpuRegister, CpuRegister),
    Fpu(XmmRegister),
    /// Stack argument `n`, one slot each.
    Stack(u32),
}

/// Walks a managed signature assigning argument locations.
#[derive(Debug, Clone)]
pub struct ArgumentVisitor {
    core: &'static [CpuRegister],
    fpu: &'static [XmmRegister],
    pairs: bool,
    next_core: usize,
    next_fpu: usize,
    next_stack: u32,
}

impl ArgumentVisitor {
    pub fn managed(isa: InstructionSet) -> Self {
        Self {
            core: managed_core_arguments(isa),
            fpu: managed_fpu_arguments(isa),
            pairs: isa == InstructionSet::X86,
            next_core: 0,
            next_fpu: 0,
            next_stack: 0,
        }
    }

    pub fn next(&mut self, ty: DataType) -> ArgLocation {
        if ty.is_floating_point() {
            if let Some(&r) = self.fpu.get(self.next_fpu) {
                self.next_fpu += 1;
                return ArgLocation::Fpu(r);
            }
        } else if ty == DataType::Int64 && self.pairs {
            if let &[low, high, ..] = &self.core[self.next_core.min(self.core.len())..] {
                self.next_core += 2;
                return ArgLocation::CorePair(low, high);
            }
        } else if let Some(&r) = self.core.get(self.next_core) {
            self.next_core += 1;
            return ArgLocation::Core(r);
        }
        self.next_stack += 1;
        ArgLocation::Stack(self.next_stack - 1)
    }

    /// Stack slots consumed so far.
    pub fn stack_slots(&self) -> u32 {
        self.next_stack
    }
}

// =============================================================================
// Intervals and frame
// =============================================================================

/// Linear-order positions where a value is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiveInterval {
    pub start: u32,
    pub end: u32,
}

impl LiveInterval {
    /// Whether the value is live across `pos`, excluding its definition and
    /// a last use at `pos`.
    #[inline]
    pub fn is_live_across(&self, pos: u32) -> bool {
        self.start < pos && pos < self.end
    }
}

/// Frame shape of a compiled method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    /// Bytes between SP after the prologue and the caller's SP.
    pub frame_size: u32,
    /// Callee-save registers pushed by the prologue.
    pub core_spill_mask: RegisterSet,
    pub fpu_spill_mask: XmmSet,
    pub out_args_size: i32,
    pub homes_offset: i32,
    pub save_area_offset: Option<i32>,
    pointer_size: i32,
}

impl FrameLayout {
    /// Slot a slow path saves core register `reg` to.
    pub fn core_save_slot(&self, reg: CpuRegister) -> i32 {
        self.save_area() + SLOT_SIZE * reg.encoding() as i32
    }

    /// Slot a slow path saves XMM register `reg` to.
    pub fn fpu_save_slot(&self, reg: XmmRegister) -> i32 {
        self.save_area() + SLOT_SIZE * (16 + reg.encoding() as i32)
    }

    fn save_area(&self) -> i32 {
        match self.save_area_offset {
            Some(o) => o,
            None => ember_core::fatal!("frame has no slow-path save area"),
        }
    }

    /// Offset of incoming stack argument `index` from SP.
    pub fn incoming_stack_arg(&self, index: u32) -> i32 {
        self.frame_size as i32 + OUT_ARGS_OFFSET + SLOT_SIZE * index as i32
    }

    /// Offset of outgoing stack argument `index` from SP.
    pub fn outgoing_stack_arg(&self, index: u32) -> i32 {
        OUT_ARGS_OFFSET + SLOT_SIZE * index as i32
    }

    /// Bytes of callee-save pushes.
    pub fn push_size(&self) -> i32 {
        self.core_spill_mask.count() as i32 * self.pointer_size
    }

    /// Bytes the prologue subtracts from SP after pushing.
    pub fn sp_adjustment(&self) -> i32 {
        self.frame_size as i32 - self.push_size() - self.pointer_size
    }
}

/// Result of allocation for one graph.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// Home of each instruction's value; constants map to themselves.
    pub homes: Vec<Location>,
    pub intervals: Vec<LiveInterval>,
    /// Linear position of each instruction.
    pub positions: Vec<u32>,
    pub frame: FrameLayout,
    /// No instruction calls out.
    pub is_leaf: bool,
}

impl Allocation {
    #[inline]
    pub fn home(&self, id: InstructionId) -> Location {
        self.homes[id.index()]
    }

    #[inline]
    pub fn position(&self, id: InstructionId) -> u32 {
        self.positions[id.index()]
    }

    /// Stack mask of reference homes live across `id`.
    pub fn live_reference_slots(&self, graph: &HGraph, id: InstructionId) -> u64 {
        let pos = self.position(id);
        graph
            .instructions()
            .iter()
            .filter(|i| i.ty.is_reference() && self.intervals[i.id.index()].is_live_across(pos))
            .filter_map(|i| match self.homes[i.id.index()] {
                Location::StackSlot(o) => Some(1u64 << (o / 4)),
                _ => None,
            })
            .fold(0, |mask, bit| mask | bit)
    }
}

// =============================================================================
// Allocation
// =============================================================================

/// Constant operand bits of a constant instruction.
pub fn constant_bits(kind: &HKind) -> Option<i64> {
    match kind {
        HKind::IntConstant(v) => Some(*v as i64),
        HKind::LongConstant(v) => Some(*v),
        HKind::FloatConstant(v) => Some(v.to_bits() as i64),
        HKind::DoubleConstant(v) => Some(v.to_bits() as i64),
        HKind::NullConstant => Some(0),
        _ => None,
    }
}

/// Assign homes, registers and the frame.
pub fn allocate(graph: &mut HGraph, options: &CodegenOptions) -> CodegenResult<Allocation> {
    let isa = options.instruction_set;
    let n = graph.instructions().len();

    let mut positions = vec![0u32; n];
    let mut block_start = vec![0u32; graph.num_blocks()];
    let mut next = 0u32;
    for b in graph.block_ids() {
        block_start[b.index()] = next;
        for &id in &graph.block(b).instructions {
            positions[id.index()] = next;
            next += 1;
        }
    }

    let intervals = compute_intervals(graph, &positions, &block_start);

    // Outgoing stack arguments.
    let mut out_slots = 0u32;
    for instr in graph.instructions() {
        if instr.kind.is_invoke() {
            let mut visitor = ArgumentVisitor::managed(isa);
            for &input in graph.invoke_arguments(instr.id) {
                visitor.next(graph.get(input).ty);
            }
            out_slots = out_slots.max(visitor.stack_slots());
        }
    }
    let out_args_size = out_slots as i32 * SLOT_SIZE;
    let homes_offset = OUT_ARGS_OFFSET + out_args_size;

    // Homes, references first so the stack mask reaches them.
    let mut homes = vec![Location::Invalid; n];
    let mut offset = homes_offset;
    let by_kind = |refs: bool| {
        graph
            .instructions()
            .iter()
            .filter(move |i| {
                i.has_value() && i.ty.is_reference() == refs && !i.kind.is_constant() && !i.kind.is_check()
            })
            .map(|i| (i.id, i.ty))
            .collect::<Vec<_>>()
    };
    for (id, ty) in by_kind(true).into_iter().chain(by_kind(false)) {
        homes[id.index()] = if ty.is_64bit() {
            Location::DoubleStackSlot(offset)
        } else {
            Location::StackSlot(offset)
        };
        if ty.is_reference() && offset + 4 > STACK_MASK_REACH {
            return Err(CodegenError::unsupported(
                format!("reference home at [sp+{offset}] beyond stack-map reach"),
                isa,
            ));
        }
        offset += SLOT_SIZE;
    }
    for instr in graph.instructions() {
        if let Some(bits) = constant_bits(&instr.kind) {
            homes[instr.id.index()] = Location::Constant(bits);
        }
    }
    // A check's value is its first input; share the home.
    for instr in graph.instructions() {
        if instr.kind.is_check() {
            homes[instr.id.index()] = homes[instr.input(0).index()];
        }
    }

    // Registers.
    let mut used_core = RegisterSet::EMPTY;
    let mut has_slow_calls = false;
    let mut is_leaf = true;
    for idx in 0..n {
        let id = InstructionId(idx as u32);
        let inputs: Vec<InputInfo> = graph
            .get(id)
            .inputs
            .iter()
            .map(|&i| (i, graph.get(i).ty, homes[i.index()]))
            .collect();
        let out_ty = graph.get(id).ty;
        let pos = positions[idx];
        let Some(summary) = graph.get_mut(id).locations.as_mut() else {
            continue;
        };
        assign_registers(summary, &inputs, out_ty, isa, id)?;
        compute_slow_path_liveness(summary, &inputs, &intervals, pos);

        is_leaf &= !summary.can_call();
        has_slow_calls |= matches!(
            summary.call_kind(),
            CallKind::CallOnSlowPath | CallKind::CallOnMainAndSlowPath
        );
        for loc in summary.all() {
            match loc {
                Location::Register(r) => used_core = used_core.insert(*r),
                Location::RegisterPair { low, high } => used_core = used_core.insert(*low).insert(*high),
                _ => {}
            }
        }
    }

    let mut core_spill_mask = used_core.intersection(ManagedCallingConvention::CALLEE_SAVES);
    if isa == InstructionSet::X86 {
        core_spill_mask = core_spill_mask.insert(scratch_register(isa));
    }

    let mut locals_end = offset;
    let save_area_offset = has_slow_calls.then(|| {
        let start = locals_end;
        locals_end += SAVE_AREA_SIZE;
        start
    });

    let pointer_size = isa.pointer_size() as i32;
    let pushes = core_spill_mask.count() as i32 * pointer_size;
    let frame_size = align_up((locals_end + pushes + pointer_size) as usize, 16);
    if frame_size > options.max_frame_size {
        return Err(CodegenError::FrameTooLarge {
            size: frame_size,
            limit: options.max_frame_size,
        });
    }

    tracing::trace!(
        frame_size,
        homes = (offset - homes_offset) / SLOT_SIZE,
        spills = core_spill_mask.count(),
        is_leaf,
        "frame laid out"
    );

    Ok(Allocation {
        homes,
        intervals,
        positions,
        frame: FrameLayout {
            frame_size: frame_size as u32,
            core_spill_mask,
            fpu_spill_mask: XmmSet::EMPTY,
            out_args_size,
            homes_offset,
            save_area_offset,
            pointer_size,
        },
        is_leaf,
    })
}

fn compute_intervals(graph: &HGraph, positions: &[u32], block_start: &[u32]) -> Vec<LiveInterval> {
    let mut intervals: Vec<LiveInterval> = positions
        .iter()
        .map(|&p| LiveInterval { start: p, end: p })
        .collect();
    for instr in graph.instructions() {
        let pos = positions[instr.id.index()];
        for &input in &instr.inputs {
            let iv = &mut intervals[input.index()];
            iv.end = iv.end.max(pos);
        }
    }

    // A value live into a loop header stays live to the back edge.
    let back_edges: Vec<(u32, u32)> = graph
        .block_ids()
        .flat_map(|b| {
            let last = graph.block(b).instructions.last().map(|&i| positions[i.index()]);
            graph
                .block(b)
                .successors
                .iter()
                .filter(move |s: &&BlockId| s.index() <= b.index())
                .filter_map(move |s| last.map(|l| (block_start[s.index()], l)))
                .collect::<Vec<_>>()
        })
        .collect();
    let mut changed = true;
    while changed {
        changed = false;
        for &(header, edge) in &back_edges {
            for iv in &mut intervals {
                if iv.start < header && iv.end >= header && iv.end < edge {
                    iv.end = edge;
                    changed = true;
                }
            }
        }
    }
    intervals
}

struct RegisterPool {
    isa: InstructionSet,
    core: Vec<CpuRegister>,
    fpu: Vec<XmmRegister>,
    byte_limit: u8,
}

impl RegisterPool {
    fn new(isa: InstructionSet, summary: &LocationSummary) -> Self {
        let mut fixed_core = RegisterSet::EMPTY;
        let mut fixed_fpu = XmmSet::EMPTY;
        for loc in summary.all() {
            match loc {
                Location::Register(r) => fixed_core = fixed_core.insert(*r),
                Location::RegisterPair { low, high } => fixed_core = fixed_core.insert(*low).insert(*high),
                Location::FpuRegister(r) => fixed_fpu = fixed_fpu.insert(*r),
                _ => {}
            }
        }
        let (core_pref, fpu_count, byte_limit): (&[CpuRegister], u8, u8) = match isa {
            InstructionSet::X86_64 => (&CORE_PREFERENCE_64, 12, 16),
            InstructionSet::X86 => (&CORE_PREFERENCE_32, 7, 4),
        };
        Self {
            isa,
            core: core_pref.iter().copied().filter(|r| !fixed_core.contains(*r)).collect(),
            fpu: (0..fpu_count)
                .filter_map(XmmRegister::from_encoding)
                .filter(|r| !fixed_fpu.contains(*r))
                .collect(),
            byte_limit,
        }
    }

    fn take_core(&mut self, byte: bool) -> Option<CpuRegister> {
        let limit = if byte { self.byte_limit } else { 16 };
        let pos = self.core.iter().position(|r| r.encoding() < limit)?;
        Some(self.core.remove(pos))
    }

    fn take_fpu(&mut self) -> Option<XmmRegister> {
        (!self.fpu.is_empty()).then(|| self.fpu.remove(0))
    }

    fn take_pair(&mut self) -> Option<Location> {
        let low = self.take_core(false)?;
        let high = self.take_core(false)?;
        Some(Location::RegisterPair { low, high })
    }

    fn resolve(&mut self, policy: Policy, ty: DataType, id: InstructionId) -> CodegenResult<Location> {
        let wide_pair = ty == DataType::Int64 && self.isa == InstructionSet::X86;
        let loc = match policy {
            Policy::RequiresRegister | Policy::RegisterOrConstant | Policy::Any if wide_pair => self.take_pair(),
            Policy::RequiresFpuRegister => self.take_fpu().map(Location::FpuRegister),
            Policy::RequiresByteRegister => self.take_core(true).map(Location::Register),
            Policy::RequiresRegister | Policy::RegisterOrConstant => self.take_core(false).map(Location::Register),
            Policy::Any if ty.is_floating_point() => self.take_fpu().map(Location::FpuRegister),
            Policy::Any => self.take_core(false).map(Location::Register),
            Policy::SameAsFirstInput => {
                return Err(CodegenError::MalformedGraph(format!(
                    "{id}: same-as-first-input used outside the output"
                )));
            }
        };
        loc.ok_or(CodegenError::OutOfRegisters(id.0))
    }
}

/// Input id, type and home.
type InputInfo = (InstructionId, DataType, Location);

fn assign_registers(
    summary: &mut LocationSummary,
    inputs: &[InputInfo],
    out_ty: DataType,
    isa: InstructionSet,
    id: InstructionId,
) -> CodegenResult<()> {
    let mut pool = RegisterPool::new(isa, summary);
    for (i, slot) in summary.inputs_mut().iter_mut().enumerate() {
        if let Location::Unallocated(policy) = *slot {
            let (_, ty, home) = inputs.get(i).copied().unwrap_or((id, DataType::Int32, Location::Invalid));
            *slot = match (policy, home) {
                (Policy::Any | Policy::RegisterOrConstant, Location::Constant(bits)) => Location::Constant(bits),
                (Policy::Any, Location::StackSlot(_) | Location::DoubleStackSlot(_)) => home,
                _ => pool.resolve(policy, ty, id)?,
            };
        }
    }
    for slot in summary.temps_mut() {
        if let Location::Unallocated(policy) = *slot {
            *slot = pool.resolve(policy, DataType::Int32, id)?;
        }
    }
    let out = summary.out();
    if let Location::Unallocated(policy) = out {
        let loc = match policy {
            Policy::SameAsFirstInput => summary.in_at(0),
            other => pool.resolve(other, out_ty, id)?,
        };
        *summary.out_mut() = loc;
    }
    Ok(())
}

fn compute_slow_path_liveness(
    summary: &mut LocationSummary,
    inputs: &[InputInfo],
    intervals: &[LiveInterval],
    pos: u32,
) {
    if !matches!(
        summary.call_kind(),
        CallKind::CallOnSlowPath | CallKind::CallOnMainAndSlowPath
    ) {
        return;
    }
    let out = summary.out();
    let mut core = RegisterSet::EMPTY;
    let mut fpu = XmmSet::EMPTY;
    let mut refs = RegisterSet::EMPTY;
    for (i, loc) in summary.inputs().iter().enumerate() {
        match loc {
            Location::RegisterPair { low, high } if !loc.overlaps(&out) => core = core.insert(*low).insert(*high),
            Location::Register(r) if Location::Register(*r) != out => {
                core = core.insert(*r);
                if let Some(&(input, ty, _)) = inputs.get(i) {
                    if ty.is_reference() && intervals[input.index()].end > pos {
                        refs = refs.insert(*r);
                    }
                }
            }
            Location::FpuRegister(r) if Location::FpuRegister(*r) != out => fpu = fpu.insert(*r),
            _ => {}
        }
    }
    for loc in summary.temps() {
        match loc {
            Location::Register(r) if Location::Register(*r) != out => core = core.insert(*r),
            Location::FpuRegister(r) if Location::FpuRegister(*r) != out => fpu = fpu.insert(*r),
            _ => {}
        }
    }
    let mut saves = RuntimeCallingConvention::CALLER_SAVES;
    let mut fpu_saves = RuntimeCallingConvention::FPU_CALLER_SAVES;
    if let Some(custom) = summary.custom_slow_path_caller_saves() {
        saves = saves.intersection(custom);
        fpu_saves = XmmSet::EMPTY;
    }
    summary.live_registers = core.intersection(saves);
    summary.live_fpu_registers = fpu.difference(XmmSet::ALL.difference(fpu_saves));
    summary.reference_registers = refs.intersection(summary.live_registers);
}
