//! Out-of-line code reached from fast-path branches.
//!
//! A slow path is created while its instruction is emitted, captures the
//! locations it needs, and is emitted after the method body. Each one is
//! entered through `labels().entry` and, unless fatal, jumps back to
//! `labels().exit`.

use super::allocator::runtime_argument;
use super::code_generator::CodeGeneratorX86_64;
use super::entrypoints::QuickEntrypoint;
use super::hir::{BlockId, DataType, InstructionId, MoveOperands};
use super::location::{Location, LocationSummary};
use super::stack_map::SafepointKind;
use crate::backend::x64::{Address, CpuRegister, Immediate, Label, RegisterSet, XmmSet};
use crate::options::InstructionSet;
use ember_core::MethodIndex;
use std::fmt;

/// Entry and exit of a slow path.
#[derive(Debug, Default)]
pub struct SlowPathLabels {
    pub entry: Label,
    pub exit: Label,
}

/// Deferred out-of-line code.
pub trait SlowPathCode: fmt::Debug {
    fn labels(&mut self) -> &mut SlowPathLabels;

    /// Emit the body; the entry label is already bound.
    fn emit_native_code(&mut self, cg: &mut CodeGeneratorX86_64<'_>);

    /// Never returns to the fast path.
    fn is_fatal(&self) -> bool {
        false
    }

    fn description(&self) -> &'static str;
}

// =============================================================================
// Register saving
// =============================================================================

/// Registers a calling slow path preserves, captured from the instruction's
/// location summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavedRegisters {
    pub core: RegisterSet,
    pub fpu: XmmSet,
    /// Subset of `core` holding references.
    pub references: RegisterSet,
}

impl SavedRegisters {
    pub fn of(locations: &LocationSummary) -> Self {
        Self {
            core: locations.live_registers,
            fpu: locations.live_fpu_registers,
            references: locations.reference_registers,
        }
    }
}

/// Spill live registers to the frame's save area.
pub fn save_live_registers(cg: &mut CodeGeneratorX86_64<'_>, saved: &SavedRegisters) {
    for reg in saved.core.iter() {
        let slot = Address::new(CpuRegister::RSP, cg.frame().core_save_slot(reg));
        match cg.isa {
            InstructionSet::X86_64 => cg.asm.movq_mr(&slot, reg),
            InstructionSet::X86 => cg.asm.movl_mr(&slot, reg),
        }
    }
    for reg in saved.fpu.iter() {
        let slot = Address::new(CpuRegister::RSP, cg.frame().fpu_save_slot(reg));
        cg.asm.movsd_mr(&slot, reg);
    }
}

/// Reload what [`save_live_registers`] spilled.
pub fn restore_live_registers(cg: &mut CodeGeneratorX86_64<'_>, saved: &SavedRegisters) {
    for reg in saved.core.iter() {
        let slot = Address::new(CpuRegister::RSP, cg.frame().core_save_slot(reg));
        match cg.isa {
            InstructionSet::X86_64 => cg.asm.movq_rm(reg, &slot),
            InstructionSet::X86 => cg.asm.movl_rm(reg, &slot),
        }
    }
    for reg in saved.fpu.iter() {
        let slot = Address::new(CpuRegister::RSP, cg.frame().fpu_save_slot(reg));
        cg.asm.movsd_rm(reg, &slot);
    }
}

/// Move `args` into the runtime argument registers, in order.
fn move_runtime_arguments(cg: &mut CodeGeneratorX86_64<'_>, args: &[(Location, DataType)]) {
    let isa = cg.isa;
    let moves: Vec<MoveOperands> = args
        .iter()
        .enumerate()
        .map(|(i, &(source, ty))| MoveOperands {
            source,
            destination: Location::Register(runtime_argument(isa, i)),
            ty,
        })
        .collect();
    cg.parallel_move(&moves);
}

fn return_register(ty: DataType) -> Location {
    if ty.is_floating_point() {
        Location::FpuRegister(crate::backend::x64::ManagedCallingConvention::FPU_RETURN)
    } else {
        Location::Register(CpuRegister::RAX)
    }
}

macro_rules! slow_path_labels {
    () => {
        fn labels(&mut self) -> &mut SlowPathLabels {
            &mut self.labels
        }
    };
}

// =============================================================================
// Checks
// =============================================================================

#[derive(Debug)]
pub struct NullCheckSlowPath {
    labels: SlowPathLabels,
    instruction: InstructionId,
}

impl NullCheckSlowPath {
    pub fn new(instruction: InstructionId) -> Self {
        Self {
            labels: SlowPathLabels::default(),
            instruction,
        }
    }
}

impl SlowPathCode for NullCheckSlowPath {
    slow_path_labels!();

    fn emit_native_code(&mut self, cg: &mut CodeGeneratorX86_64<'_>) {
        cg.invoke_runtime(QuickEntrypoint::ThrowNullPointer, self.instruction, SafepointKind::SlowPath, RegisterSet::EMPTY);
    }

    fn is_fatal(&self) -> bool {
        true
    }

    fn description(&self) -> &'static str {
        "NullCheckSlowPath"
    }
}

#[derive(Debug)]
pub struct BoundsCheckSlowPath {
    labels: SlowPathLabels,
    instruction: InstructionId,
    index: Location,
    length: Location,
}

impl BoundsCheckSlowPath {
    pub fn new(instruction: InstructionId, index: Location, length: Location) -> Self {
        Self {
            labels: SlowPathLabels::default(),
            instruction,
            index,
            length,
        }
    }
}

impl SlowPathCode for BoundsCheckSlowPath {
    slow_path_labels!();

    fn emit_native_code(&mut self, cg: &mut CodeGeneratorX86_64<'_>) {
        move_runtime_arguments(cg, &[(self.index, DataType::Int32), (self.length, DataType::Int32)]);
        cg.invoke_runtime(QuickEntrypoint::ThrowArrayBounds, self.instruction, SafepointKind::SlowPath, RegisterSet::EMPTY);
    }

    fn is_fatal(&self) -> bool {
        true
    }

    fn description(&self) -> &'static str {
        "BoundsCheckSlowPath"
    }
}

#[derive(Debug)]
pub struct DivZeroCheckSlowPath {
    labels: SlowPathLabels,
    instruction: InstructionId,
}

impl DivZeroCheckSlowPath {
    pub fn new(instruction: InstructionId) -> Self {
        Self {
            labels: SlowPathLabels::default(),
            instruction,
        }
    }
}

impl SlowPathCode for DivZeroCheckSlowPath {
    slow_path_labels!();

    fn emit_native_code(&mut self, cg: &mut CodeGeneratorX86_64<'_>) {
        cg.invoke_runtime(QuickEntrypoint::ThrowDivZero, self.instruction, SafepointKind::SlowPath, RegisterSet::EMPTY);
    }

    fn is_fatal(&self) -> bool {
        true
    }

    fn description(&self) -> &'static str {
        "DivZeroCheckSlowPath"
    }
}

/// `x / -1` and `x % -1`, which `idiv` would trap on for the minimum value.
#[derive(Debug)]
pub struct DivRemMinusOneSlowPath {
    labels: SlowPathLabels,
    reg: CpuRegister,
    is_div: bool,
    wide: bool,
}

impl DivRemMinusOneSlowPath {
    pub fn new(reg: CpuRegister, is_div: bool, wide: bool) -> Self {
        Self {
            labels: SlowPathLabels::default(),
            reg,
            is_div,
            wide,
        }
    }
}

impl SlowPathCode for DivRemMinusOneSlowPath {
    slow_path_labels!();

    fn emit_native_code(&mut self, cg: &mut CodeGeneratorX86_64<'_>) {
        match (self.is_div, self.wide) {
            (true, false) => cg.asm.negl(self.reg),
            (true, true) => cg.asm.negq(self.reg),
            (false, _) => cg.asm.xorl_rr(self.reg, self.reg),
        }
        cg.asm.jmp(&mut self.labels.exit);
    }

    fn description(&self) -> &'static str {
        "DivRemMinusOneSlowPath"
    }
}

// =============================================================================
// Suspension
// =============================================================================

#[derive(Debug)]
pub struct SuspendCheckSlowPath {
    labels: SlowPathLabels,
    instruction: InstructionId,
    /// Back-edge target to resume at instead of the exit label.
    successor: Option<BlockId>,
    saved: SavedRegisters,
}

impl SuspendCheckSlowPath {
    pub fn new(instruction: InstructionId, successor: Option<BlockId>, saved: SavedRegisters) -> Self {
        Self {
            labels: SlowPathLabels::default(),
            instruction,
            successor,
            saved,
        }
    }
}

impl SlowPathCode for SuspendCheckSlowPath {
    slow_path_labels!();

    fn emit_native_code(&mut self, cg: &mut CodeGeneratorX86_64<'_>) {
        save_live_registers(cg, &self.saved);
        cg.invoke_runtime(QuickEntrypoint::TestSuspend, self.instruction, SafepointKind::SlowPath, self.saved.references);
        restore_live_registers(cg, &self.saved);
        match self.successor {
            None => cg.asm.jmp(&mut self.labels.exit),
            Some(block) => cg.asm.jmp(&mut cg.block_labels[block.index()]),
        }
    }

    fn description(&self) -> &'static str {
        "SuspendCheckSlowPath"
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Resolve a class, string or method type through the runtime and return it
/// in `out`.
#[derive(Debug)]
pub struct ResolveSlowPath {
    labels: SlowPathLabels,
    instruction: InstructionId,
    entrypoint: QuickEntrypoint,
    index: u32,
    out: Location,
    saved: SavedRegisters,
}

impl ResolveSlowPath {
    fn new(entrypoint: QuickEntrypoint, instruction: InstructionId, index: u32, out: Location, saved: SavedRegisters) -> Self {
        Self {
            labels: SlowPathLabels::default(),
            instruction,
            entrypoint,
            index,
            out,
            saved,
        }
    }

    pub fn load_class(instruction: InstructionId, type_index: u32, out: Location, saved: SavedRegisters) -> Self {
        Self::new(QuickEntrypoint::ResolveType, instruction, type_index, out, saved)
    }

    pub fn load_string(instruction: InstructionId, string_index: u32, out: Location, saved: SavedRegisters) -> Self {
        Self::new(QuickEntrypoint::ResolveString, instruction, string_index, out, saved)
    }

    pub fn load_method_type(instruction: InstructionId, proto_index: u32, out: Location, saved: SavedRegisters) -> Self {
        Self::new(QuickEntrypoint::ResolveMethodType, instruction, proto_index, out, saved)
    }
}

impl SlowPathCode for ResolveSlowPath {
    slow_path_labels!();

    fn emit_native_code(&mut self, cg: &mut CodeGeneratorX86_64<'_>) {
        save_live_registers(cg, &self.saved);
        let arg0 = runtime_argument(cg.isa, 0);
        cg.asm.movl_ri(arg0, Immediate(self.index as i64));
        cg.invoke_runtime(self.entrypoint, self.instruction, SafepointKind::SlowPath, self.saved.references);
        cg.move_location(self.out, Location::Register(CpuRegister::RAX), DataType::Reference);
        restore_live_registers(cg, &self.saved);
        cg.asm.jmp(&mut self.labels.exit);
    }

    fn description(&self) -> &'static str {
        match self.entrypoint {
            QuickEntrypoint::ResolveType => "LoadClassSlowPath",
            QuickEntrypoint::ResolveString => "LoadStringSlowPath",
            _ => "LoadMethodTypeSlowPath",
        }
    }
}

// =============================================================================
// Type checks and deoptimization
// =============================================================================

/// Non-trivial instance-of or check-cast.
#[derive(Debug)]
pub struct TypeCheckSlowPath {
    labels: SlowPathLabels,
    instruction: InstructionId,
    /// Object class for instance-of, the object for check-cast.
    subject: Location,
    class: Location,
    /// Instance-of result; `None` for check-cast.
    out: Option<Location>,
    saved: SavedRegisters,
}

impl TypeCheckSlowPath {
    pub fn instance_of(instruction: InstructionId, object_class: Location, class: Location, out: Location, saved: SavedRegisters) -> Self {
        Self {
            labels: SlowPathLabels::default(),
            instruction,
            subject: object_class,
            class,
            out: Some(out),
            saved,
        }
    }

    pub fn check_cast(instruction: InstructionId, object: Location, class: Location, saved: SavedRegisters) -> Self {
        Self {
            labels: SlowPathLabels::default(),
            instruction,
            subject: object,
            class,
            out: None,
            saved,
        }
    }
}

impl SlowPathCode for TypeCheckSlowPath {
    slow_path_labels!();

    fn emit_native_code(&mut self, cg: &mut CodeGeneratorX86_64<'_>) {
        save_live_registers(cg, &self.saved);
        move_runtime_arguments(cg, &[(self.subject, DataType::Reference), (self.class, DataType::Reference)]);
        let entrypoint = match self.out {
            Some(_) => QuickEntrypoint::InstanceofNonTrivial,
            None => QuickEntrypoint::CheckInstanceOf,
        };
        cg.invoke_runtime(entrypoint, self.instruction, SafepointKind::SlowPath, self.saved.references);
        if let Some(out) = self.out {
            cg.move_location(out, Location::Register(CpuRegister::RAX), DataType::Bool);
        }
        restore_live_registers(cg, &self.saved);
        cg.asm.jmp(&mut self.labels.exit);
    }

    fn description(&self) -> &'static str {
        match self.out {
            Some(_) => "InstanceOfSlowPath",
            None => "CheckCastSlowPath",
        }
    }
}

#[derive(Debug)]
pub struct DeoptimizationSlowPath {
    labels: SlowPathLabels,
    instruction: InstructionId,
    reason: u32,
}

impl DeoptimizationSlowPath {
    pub fn new(instruction: InstructionId, reason: u32) -> Self {
        Self {
            labels: SlowPathLabels::default(),
            instruction,
            reason,
        }
    }
}

impl SlowPathCode for DeoptimizationSlowPath {
    slow_path_labels!();

    fn emit_native_code(&mut self, cg: &mut CodeGeneratorX86_64<'_>) {
        let arg0 = runtime_argument(cg.isa, 0);
        cg.asm.movl_ri(arg0, Immediate(self.reason as i64));
        cg.invoke_runtime(QuickEntrypoint::Deoptimize, self.instruction, SafepointKind::SlowPath, RegisterSet::EMPTY);
    }

    fn is_fatal(&self) -> bool {
        true
    }

    fn description(&self) -> &'static str {
        "DeoptimizationSlowPath"
    }
}

// =============================================================================
// Read barriers
// =============================================================================

/// Mark the reference in `reg` in place. The mark entrypoints preserve
/// every register, so nothing is saved.
#[derive(Debug)]
pub struct ReadBarrierMarkSlowPath {
    labels: SlowPathLabels,
    instruction: InstructionId,
    reg: CpuRegister,
    unpoison: bool,
}

impl ReadBarrierMarkSlowPath {
    pub fn new(instruction: InstructionId, reg: CpuRegister, unpoison: bool) -> Self {
        Self {
            labels: SlowPathLabels::default(),
            instruction,
            reg,
            unpoison,
        }
    }
}

impl SlowPathCode for ReadBarrierMarkSlowPath {
    slow_path_labels!();

    fn emit_native_code(&mut self, cg: &mut CodeGeneratorX86_64<'_>) {
        if self.unpoison {
            cg.maybe_unpoison_heap_reference(self.reg);
        }
        let entrypoint = QuickEntrypoint::ReadBarrierMarkReg(self.reg.encoding());
        cg.invoke_runtime(entrypoint, self.instruction, SafepointKind::SlowPath, RegisterSet::EMPTY);
        cg.asm.jmp(&mut self.labels.exit);
    }

    fn description(&self) -> &'static str {
        "ReadBarrierMarkSlowPath"
    }
}

/// Hand a loaded heap reference to the runtime's read barrier.
#[derive(Debug)]
pub struct ReadBarrierForHeapReferenceSlowPath {
    labels: SlowPathLabels,
    instruction: InstructionId,
    out: CpuRegister,
    object: CpuRegister,
    offset: u32,
    /// Element index and its shift for array loads.
    index: Option<(Location, u8)>,
    saved: SavedRegisters,
}

impl ReadBarrierForHeapReferenceSlowPath {
    pub fn new(
        instruction: InstructionId,
        out: CpuRegister,
        object: CpuRegister,
        offset: u32,
        index: Option<(Location, u8)>,
        saved: SavedRegisters,
    ) -> Self {
        Self {
            labels: SlowPathLabels::default(),
            instruction,
            out,
            object,
            offset,
            index,
            saved,
        }
    }
}

impl SlowPathCode for ReadBarrierForHeapReferenceSlowPath {
    slow_path_labels!();

    fn emit_native_code(&mut self, cg: &mut CodeGeneratorX86_64<'_>) {
        save_live_registers(cg, &self.saved);
        let mut args = vec![
            (Location::Register(self.out), DataType::Reference),
            (Location::Register(self.object), DataType::Reference),
        ];
        if let Some((index, _)) = self.index {
            args.push((index, DataType::Int32));
        }
        move_runtime_arguments(cg, &args);
        let arg2 = runtime_argument(cg.isa, 2);
        match self.index {
            Some((Location::Constant(i), shift)) => {
                let offset = self.offset as i64 + (i << shift);
                cg.asm.movl_ri(arg2, Immediate(offset));
            }
            Some((_, shift)) => {
                cg.asm.shll_ri(arg2, Immediate(shift as i64));
                cg.asm.addl_ri(arg2, Immediate(self.offset as i64));
            }
            None => cg.asm.movl_ri(arg2, Immediate(self.offset as i64)),
        }
        cg.invoke_runtime(QuickEntrypoint::ReadBarrierSlow, self.instruction, SafepointKind::SlowPath, self.saved.references);
        cg.move_location(Location::Register(self.out), Location::Register(CpuRegister::RAX), DataType::Reference);
        restore_live_registers(cg, &self.saved);
        cg.asm.jmp(&mut self.labels.exit);
    }

    fn description(&self) -> &'static str {
        "ReadBarrierForHeapReferenceSlowPath"
    }
}

#[derive(Debug)]
pub struct ReadBarrierForRootSlowPath {
    labels: SlowPathLabels,
    instruction: InstructionId,
    out: CpuRegister,
    saved: SavedRegisters,
}

impl ReadBarrierForRootSlowPath {
    pub fn new(instruction: InstructionId, out: CpuRegister, saved: SavedRegisters) -> Self {
        Self {
            labels: SlowPathLabels::default(),
            instruction,
            out,
            saved,
        }
    }
}

impl SlowPathCode for ReadBarrierForRootSlowPath {
    slow_path_labels!();

    fn emit_native_code(&mut self, cg: &mut CodeGeneratorX86_64<'_>) {
        save_live_registers(cg, &self.saved);
        move_runtime_arguments(cg, &[(Location::Register(self.out), DataType::Reference)]);
        cg.invoke_runtime(QuickEntrypoint::ReadBarrierForRootSlow, self.instruction, SafepointKind::SlowPath, self.saved.references);
        cg.move_location(Location::Register(self.out), Location::Register(CpuRegister::RAX), DataType::Reference);
        restore_live_registers(cg, &self.saved);
        cg.asm.jmp(&mut self.labels.exit);
    }

    fn description(&self) -> &'static str {
        "ReadBarrierForRootSlowPath"
    }
}

// =============================================================================
// Intrinsic fallbacks
// =============================================================================

/// `System.arraycopy` through the runtime when the inline copy's
/// preconditions fail.
#[derive(Debug)]
pub struct ArrayCopySlowPath {
    labels: SlowPathLabels,
    instruction: InstructionId,
    /// Source, source position, destination, destination position, length.
    args: [Location; 5],
    saved: SavedRegisters,
}

impl ArrayCopySlowPath {
    pub fn new(instruction: InstructionId, args: [Location; 5], saved: SavedRegisters) -> Self {
        Self {
            labels: SlowPathLabels::default(),
            instruction,
            args,
            saved,
        }
    }
}

impl SlowPathCode for ArrayCopySlowPath {
    slow_path_labels!();

    fn emit_native_code(&mut self, cg: &mut CodeGeneratorX86_64<'_>) {
        save_live_registers(cg, &self.saved);
        let types = [
            DataType::Reference,
            DataType::Int32,
            DataType::Reference,
            DataType::Int32,
            DataType::Int32,
        ];
        let args: Vec<_> = self.args.iter().copied().zip(types).collect();
        move_runtime_arguments(cg, &args);
        cg.invoke_runtime(QuickEntrypoint::ArrayCopy, self.instruction, SafepointKind::SlowPath, self.saved.references);
        restore_live_registers(cg, &self.saved);
        cg.asm.jmp(&mut self.labels.exit);
    }

    fn description(&self) -> &'static str {
        "ArrayCopySlowPath"
    }
}

/// What an intrinsic's fallback calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicFallback {
    /// A runtime helper taking the arguments in runtime registers.
    Runtime(QuickEntrypoint),
    /// The intrinsified method itself, dispatched through the polymorphic
    /// invoke trampoline with managed-convention arguments.
    Polymorphic(MethodIndex),
}

/// Leaves an intrinsic's fast path by making the call it replaced.
#[derive(Debug)]
pub struct IntrinsicSlowPath {
    labels: SlowPathLabels,
    instruction: InstructionId,
    fallback: IntrinsicFallback,
    args: Vec<(Location, DataType)>,
    out: Location,
    out_type: DataType,
    saved: SavedRegisters,
}

impl IntrinsicSlowPath {
    pub fn new(
        instruction: InstructionId,
        fallback: IntrinsicFallback,
        args: Vec<(Location, DataType)>,
        out: Location,
        out_type: DataType,
        saved: SavedRegisters,
    ) -> Self {
        Self {
            labels: SlowPathLabels::default(),
            instruction,
            fallback,
            args,
            out,
            out_type,
            saved,
        }
    }
}

impl SlowPathCode for IntrinsicSlowPath {
    slow_path_labels!();

    fn emit_native_code(&mut self, cg: &mut CodeGeneratorX86_64<'_>) {
        save_live_registers(cg, &self.saved);
        match self.fallback {
            IntrinsicFallback::Runtime(entrypoint) => {
                move_runtime_arguments(cg, &self.args);
                cg.invoke_runtime(entrypoint, self.instruction, SafepointKind::SlowPath, self.saved.references);
            }
            IntrinsicFallback::Polymorphic(method) => {
                cg.move_managed_arguments(&self.args);
                cg.generate_runtime_dispatch(
                    QuickEntrypoint::InvokePolymorphic,
                    method,
                    self.instruction,
                    SafepointKind::SlowPath,
                    self.saved.references,
                );
            }
        }
        if self.out.is_valid() {
            cg.move_location(self.out, return_register(self.out_type), self.out_type);
        }
        restore_live_registers(cg, &self.saved);
        cg.asm.jmp(&mut self.labels.exit);
    }

    fn description(&self) -> &'static str {
        "IntrinsicSlowPath"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saved_registers_from_summary() {
        let mut s = LocationSummary::new(0, super::super::location::CallKind::CallOnSlowPath);
        s.live_registers = RegisterSet::EMPTY.insert(CpuRegister::RCX).insert(CpuRegister::RSI);
        s.reference_registers = RegisterSet::EMPTY.insert(CpuRegister::RSI);
        let saved = SavedRegisters::of(&s);
        assert_eq!(saved.core.count(), 2);
        assert!(saved.references.contains(CpuRegister::RSI));
        assert!(saved.fpu.is_empty());
    }

    #[test]
    fn test_fatal_classification() {
        let mut null = NullCheckSlowPath::new(InstructionId(0));
        assert!(null.is_fatal());
        assert!(null.labels().entry.is_unused());
        let minus_one = DivRemMinusOneSlowPath::new(CpuRegister::RAX, true, false);
        assert!(!minus_one.is_fatal());
        let resolve = ResolveSlowPath::load_string(InstructionId(1), 7, Location::Register(CpuRegister::RAX), SavedRegisters::default());
        assert_eq!(resolve.description(), "LoadStringSlowPath");
    }
}
