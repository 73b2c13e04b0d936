//! The x86 / x86-64 code generator.
//!
//! [`CodeGeneratorX86_64`] owns the assembler and everything emission
//! accumulates: block labels, slow paths, stack maps and pending linker
//! patches. It walks the graph in block order; for each instruction it
//! loads inputs from their homes into the locations the allocator chose,
//! hands the instruction to [`InstructionCodeGeneratorX86_64`] and stores
//! the output back home. The shared lowering helpers (moves, typed memory
//! access, runtime calls, barriers, invokes) live here so slow paths and
//! intrinsics reach them too.
//!
//! Both ISAs go through this type; x86 differs in pointer width, the
//! thread segment (`fs` instead of `gs`), register pairs for `long` and
//! PC-relative addressing anchored on a base-method-address register.

use super::allocator::{
    self, fpu_scratch_register, scratch_register, Allocation, ArgLocation, ArgumentVisitor, FrameLayout,
    OUT_ARGS_OFFSET, SLOT_SIZE,
};
use super::entrypoints::QuickEntrypoint;
use super::hir::{
    BlockId, CodePtrLocation, DataType, DispatchInfo, HGraph, HKind, InstructionId, MethodLoadKind, MoveOperands,
};
use super::instruction_visitor::InstructionCodeGeneratorX86_64;
use super::layout::{ClassLayout, MethodLayout, CLASS_OFFSET, GRAY_BIT_IN_BYTE, GRAY_BYTE_OFFSET};
use super::linker_patch::{LinkerPatch, PatchAnchor, PatchKind, PendingPatch, PLACEHOLDER_32BIT_OFFSET};
use super::location::Location;
use super::locations_builder;
use super::parallel_move::{self, MoveEmitter};
use super::slow_path::{
    NullCheckSlowPath, ReadBarrierForHeapReferenceSlowPath, ReadBarrierForRootSlowPath, ReadBarrierMarkSlowPath,
    SavedRegisters, SlowPathCode, SuspendCheckSlowPath,
};
use super::stack_map::{SafepointKind, StackMap, StackMapBuilder, StackMapEntry};
use crate::backend::x64::{
    Address, Assembler, Condition, CpuRegister, Immediate, Label, ManagedCallingConvention, NearLabel, RegisterSet,
    ScaleFactor, XmmRegister, XmmSet,
};
use crate::error::CodegenResult;
use crate::options::{CodegenOptions, InstructionSet};
use ember_core::abi::{flags, ThreadOffsets, STACK_OVERFLOW_RESERVED_BYTES};
use ember_core::bits::{high32, is_int32, is_uint32, low32};
use ember_core::{fatal, MethodIndex};
use ember_gc::ReadBarrierKind;
use rustc_hash::{FxHashMap, FxHashSet};

/// Field offsets below this fault on a null base, so the access doubles as
/// the null check.
pub const MAX_IMPLICIT_NULL_CHECK_OFFSET: u32 = 4096;

// =============================================================================
// Output
// =============================================================================

/// Machine code and metadata for one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledMethod {
    /// Code followed by the constant area.
    pub code: Vec<u8>,
    pub instruction_set: InstructionSet,
    pub frame_size: u32,
    pub core_spill_mask: RegisterSet,
    pub fpu_spill_mask: XmmSet,
    /// Safepoints, native pc to dex pc plus live references.
    pub stack_map: StackMap,
    pub patches: Vec<LinkerPatch>,
    /// Start of the constant area within `code`.
    pub constant_area_offset: usize,
    /// x86 only: code offsets holding absolute constant-area addresses that
    /// must be relocated by the load address.
    pub absolute_fixups: Vec<usize>,
}

impl CompiledMethod {
    /// Instruction bytes without the constant area.
    pub fn instructions(&self) -> &[u8] {
        &self.code[..self.constant_area_offset]
    }
}

/// Compile `graph`: build location summaries, allocate, emit and finalize.
pub fn compile(graph: &mut HGraph, options: &CodegenOptions) -> CodegenResult<CompiledMethod> {
    options.validate()?;
    graph
        .validate()
        .map_err(crate::error::CodegenError::MalformedGraph)?;
    locations_builder::build_locations(graph, options)?;
    let alloc = allocator::allocate(graph, options)?;
    let graph: &HGraph = graph;
    let mut codegen = CodeGeneratorX86_64::new(graph, options, alloc);
    codegen.generate()?;
    let method = codegen.finalize();
    tracing::debug!(
        method = %graph.method_index,
        isa = %options.instruction_set,
        code_size = method.constant_area_offset,
        frame_size = method.frame_size,
        safepoints = method.stack_map.len(),
        patches = method.patches.len(),
        "method compiled"
    );
    Ok(method)
}

/// Stack slot of the right width for `ty` at `offset`.
#[inline]
pub fn stack_location(ty: DataType, offset: i32) -> Location {
    if ty.is_64bit() {
        Location::DoubleStackSlot(offset)
    } else {
        Location::StackSlot(offset)
    }
}

/// Location a managed-call argument is passed in, from the caller's side.
pub fn outgoing_argument(arg: ArgLocation, ty: DataType) -> Location {
    match arg {
        ArgLocation::Core(r) => Location::Register(r),
        ArgLocation::CorePair(low, high) => Location::RegisterPair { low, high },
        ArgLocation::Fpu(r) => Location::FpuRegister(r),
        ArgLocation::Stack(n) => stack_location(ty, OUT_ARGS_OFFSET + SLOT_SIZE * n as i32),
    }
}

/// Operand for `[obj + index * scale + offset]`.
pub fn heap_address(obj: CpuRegister, index: Option<Location>, scale: ScaleFactor, offset: i32) -> Address {
    match index {
        None => Address::new(obj, offset),
        Some(Location::Constant(i)) => Address::new(obj, offset + (i as i32) * scale.value() as i32),
        Some(Location::Register(r)) => Address::indexed(obj, r, scale, offset),
        Some(other) => fatal!("array index in {}", other),
    }
}

#[inline]
fn stack(offset: i32) -> Address {
    Address::new(CpuRegister::RSP, offset)
}

// =============================================================================
// Code generator
// =============================================================================

/// Emission state for one method.
pub struct CodeGeneratorX86_64<'g> {
    pub(crate) asm: Assembler,
    pub(crate) graph: &'g HGraph,
    pub(crate) options: &'g CodegenOptions,
    pub(crate) alloc: Allocation,
    pub(crate) isa: InstructionSet,
    pub(crate) thread: ThreadOffsets,
    pub(crate) method_layout: MethodLayout,
    pub(crate) class_layout: ClassLayout,
    pub(crate) block_labels: Vec<Label>,
    pub(crate) frame_entry_label: Label,
    pub(crate) slow_paths: Vec<Box<dyn SlowPathCode>>,
    stack_maps: StackMapBuilder,
    patches: Vec<PendingPatch>,
    /// Code offset each base-method-address instruction materialized.
    base_method_addresses: FxHashMap<InstructionId, u32>,
    /// User instruction to the null check its memory access performs.
    folded_null_checks: FxHashMap<InstructionId, InstructionId>,
    folded_checks: FxHashSet<InstructionId>,
    /// Loop header to the suspend check its back edges emit.
    loop_suspend_checks: FxHashMap<BlockId, InstructionId>,
    pub(crate) current_block: BlockId,
}

impl<'g> CodeGeneratorX86_64<'g> {
    /// Prepare emission for an allocated graph.
    pub fn new(graph: &'g HGraph, options: &'g CodegenOptions, alloc: Allocation) -> Self {
        let isa = options.instruction_set;
        let folded_null_checks = if options.implicit_null_checks {
            fold_null_checks(graph)
        } else {
            FxHashMap::default()
        };
        let folded_checks = folded_null_checks.values().copied().collect();
        Self {
            asm: Assembler::new(isa),
            graph,
            options,
            alloc,
            isa,
            thread: ThreadOffsets::new(isa.pointer_size()),
            method_layout: MethodLayout::new(isa),
            class_layout: ClassLayout::new(isa),
            block_labels: (0..graph.num_blocks()).map(|_| Label::new()).collect(),
            frame_entry_label: Label::new(),
            slow_paths: Vec::new(),
            stack_maps: StackMapBuilder::new(),
            patches: Vec::new(),
            base_method_addresses: FxHashMap::default(),
            folded_null_checks,
            folded_checks,
            loop_suspend_checks: find_loop_suspend_checks(graph),
            current_block: BlockId(0),
        }
    }

    #[inline]
    pub fn frame(&self) -> &FrameLayout {
        &self.alloc.frame
    }

    /// Emit the whole method.
    pub fn generate(&mut self) -> CodegenResult<()> {
        let graph = self.graph;
        self.generate_frame_entry();
        for block in graph.block_ids() {
            self.current_block = block;
            self.asm.bind(&mut self.block_labels[block.index()]);
            for &id in &graph.block(block).instructions {
                let instr = graph.get(id);
                if instr.kind.is_constant()
                    || matches!(instr.kind, HKind::Parameter { .. })
                    || self.folded_checks.contains(&id)
                {
                    continue;
                }
                if instr.locations.is_none() {
                    return Err(crate::error::CodegenError::MissingLocations(id.0));
                }
                self.load_inputs(id);
                InstructionCodeGeneratorX86_64::new(self).visit(id)?;
                self.store_output(id);
            }
        }
        self.emit_slow_paths();
        Ok(())
    }

    fn load_inputs(&mut self, id: InstructionId) {
        let graph = self.graph;
        let instr = graph.get(id);
        let locations = instr.locations();
        let moves: Vec<MoveOperands> = instr
            .inputs
            .iter()
            .enumerate()
            .filter_map(|(i, &input)| {
                let destination = locations.in_at(i);
                let source = self.alloc.home(input);
                (destination.is_valid() && !destination.is_unallocated() && destination != source).then(|| {
                    MoveOperands {
                        source,
                        destination,
                        ty: graph.get(input).ty,
                    }
                })
            })
            .collect();
        self.parallel_move(&moves);
    }

    fn store_output(&mut self, id: InstructionId) {
        let instr = self.graph.get(id);
        if !instr.has_value() || instr.kind.is_check() {
            return;
        }
        let out = instr.locations().out();
        let home = self.alloc.home(id);
        if out.is_valid() && home.is_stack_slot() && out != home {
            self.move_location(home, out, instr.ty);
        }
    }

    fn emit_slow_paths(&mut self) {
        while !self.slow_paths.is_empty() {
            let mut batch = std::mem::take(&mut self.slow_paths);
            for slow_path in &mut batch {
                tracing::trace!(
                    slow_path = slow_path.description(),
                    offset = self.asm.code_size(),
                    "emitting slow path"
                );
                self.asm.bind(&mut slow_path.labels().entry);
                slow_path.emit_native_code(self);
            }
        }
    }

    /// Extract the finished method.
    pub fn finalize(self) -> CompiledMethod {
        let patches = self.emit_linker_patches();
        let Self {
            asm, alloc, stack_maps, isa, ..
        } = self;
        let frame = alloc.frame;
        let assembled = asm.finalize();
        let mut stack_map = stack_maps.finish(
            frame.frame_size,
            frame.core_spill_mask.bits(),
            frame.fpu_spill_mask.bits(),
        );
        stack_map.save_area_offset = frame.save_area_offset.map(|o| o as u32);
        CompiledMethod {
            code: assembled.code,
            instruction_set: isa,
            frame_size: frame.frame_size,
            core_spill_mask: frame.core_spill_mask,
            fpu_spill_mask: frame.fpu_spill_mask,
            stack_map,
            patches,
            constant_area_offset: assembled.constant_area_offset,
            absolute_fixups: assembled.absolute_fixups,
        }
    }

    // =========================================================================
    // Frame
    // =========================================================================

    /// Prologue: stack probe, callee-save pushes, SP adjustment, method and
    /// parameter stores.
    pub fn generate_frame_entry(&mut self) {
        self.asm.bind(&mut self.frame_entry_label);
        let frame_size = self.alloc.frame.frame_size as i32;
        let skip_overflow_check = self.alloc.is_leaf && frame_size < STACK_OVERFLOW_RESERVED_BYTES;
        if !skip_overflow_check {
            self.asm
                .testl_rm(CpuRegister::RAX, &stack(-STACK_OVERFLOW_RESERVED_BYTES));
            self.stack_maps.add(StackMapEntry {
                native_pc: self.asm.code_size() as u32,
                dex_pc: 0,
                kind: SafepointKind::ImplicitFault,
                register_mask: 0,
                stack_mask: 0,
            });
        }
        for reg in self.alloc.frame.core_spill_mask.iter().rev() {
            self.asm.pushq_r(reg);
        }
        let adjustment = self.alloc.frame.sp_adjustment();
        if adjustment != 0 {
            self.asm.subq_ri(CpuRegister::RSP, Immediate(adjustment as i64));
        }
        self.store_pointer(&stack(0), ManagedCallingConvention::METHOD_REGISTER);

        let graph = self.graph;
        let mut parameters: Vec<_> = graph
            .instructions()
            .iter()
            .filter_map(|i| match i.kind {
                HKind::Parameter { index } => Some((index, i.id, i.ty)),
                _ => None,
            })
            .collect();
        parameters.sort_by_key(|p| p.0);
        let mut visitor = ArgumentVisitor::managed(self.isa);
        let moves: Vec<MoveOperands> = parameters
            .into_iter()
            .map(|(_, id, ty)| {
                let source = match visitor.next(ty) {
                    ArgLocation::Stack(n) => stack_location(ty, self.alloc.frame.incoming_stack_arg(n)),
                    arg => outgoing_argument(arg, ty),
                };
                MoveOperands {
                    source,
                    destination: self.alloc.home(id),
                    ty,
                }
            })
            .collect();
        self.parallel_move(&moves);
    }

    /// Epilogue and return.
    pub fn generate_frame_exit(&mut self) {
        let adjustment = self.alloc.frame.sp_adjustment();
        if adjustment != 0 {
            self.asm.addq_ri(CpuRegister::RSP, Immediate(adjustment as i64));
        }
        for reg in self.alloc.frame.core_spill_mask.iter() {
            self.asm.popq_r(reg);
        }
        self.asm.ret();
    }

    // =========================================================================
    // Pointer-width helpers
    // =========================================================================

    /// The assembler with the thread segment prefix applied.
    pub(crate) fn thread_asm(&mut self) -> &mut Assembler {
        match self.isa {
            InstructionSet::X86_64 => self.asm.gs(),
            InstructionSet::X86 => self.asm.fs(),
        }
    }

    pub(crate) fn load_pointer(&mut self, dst: CpuRegister, src: &Address) {
        match self.isa {
            InstructionSet::X86_64 => self.asm.movq_rm(dst, src),
            InstructionSet::X86 => self.asm.movl_rm(dst, src),
        }
    }

    pub(crate) fn store_pointer(&mut self, dst: &Address, src: CpuRegister) {
        match self.isa {
            InstructionSet::X86_64 => self.asm.movq_mr(dst, src),
            InstructionSet::X86 => self.asm.movl_mr(dst, src),
        }
    }

    pub(crate) fn lea_pointer(&mut self, dst: CpuRegister, src: &Address) {
        match self.isa {
            InstructionSet::X86_64 => self.asm.leaq_rm(dst, src),
            InstructionSet::X86 => self.asm.leal_rm(dst, src),
        }
    }

    pub(crate) fn move_register(&mut self, dst: CpuRegister, src: CpuRegister) {
        if dst == src {
            return;
        }
        match self.isa {
            InstructionSet::X86_64 => self.asm.movq_rr(dst, src),
            InstructionSet::X86 => self.asm.movl_rr(dst, src),
        }
    }

    /// `lock addl [rsp], 0`: a full fence cheaper than `mfence`.
    pub(crate) fn memory_fence(&mut self) {
        self.asm.lock().addl_mi(&stack(0), Immediate(0));
    }

    // =========================================================================
    // Moves
    // =========================================================================

    /// Load `value` into `dst`; `wide` selects a 64-bit destination.
    pub fn move_constant(&mut self, dst: CpuRegister, value: i64, wide: bool) {
        if value == 0 {
            self.asm.xorl_rr(dst, dst);
        } else if !wide || is_uint32(value) {
            self.asm.movl_ri(dst, Immediate(value));
        } else {
            self.asm.movq_ri(dst, Immediate(value));
        }
    }

    fn move_fp_constant(&mut self, dst: XmmRegister, bits: i64, ty: DataType) {
        if bits == 0 {
            self.asm.xorps_rr(dst, dst);
        } else if ty.is_64bit() {
            let literal = self.asm.literal_int64(bits);
            self.asm.movsd_rm(dst, &literal);
        } else {
            let literal = self.asm.literal_int32(bits as i32);
            self.asm.movss_rm(dst, &literal);
        }
    }

    /// Copy a value of `ty` from `source` to `destination`.
    pub fn move_location(&mut self, destination: Location, source: Location, ty: DataType) {
        use Location::*;
        if destination == source {
            return;
        }
        let scratch = scratch_register(self.isa);
        let wide_regs = self.isa.is_64bit();
        match (destination, source) {
            (Register(d), Register(s)) => self.move_register(d, s),
            (Register(d), StackSlot(o)) => self.asm.movl_rm(d, &stack(o)),
            (Register(d), DoubleStackSlot(o)) => self.asm.movq_rm(d, &stack(o)),
            (Register(d), Constant(bits)) => self.move_constant(d, bits, wide_regs && ty.is_64bit()),
            (Register(d), FpuRegister(s)) if ty.is_64bit() => self.asm.movq_rx(d, s),
            (Register(d), FpuRegister(s)) => self.asm.movd_rx(d, s),

            (FpuRegister(d), FpuRegister(s)) => self.asm.movaps_rr(d, s),
            (FpuRegister(d), Register(s)) if ty.is_64bit() => self.asm.movq_xr(d, s),
            (FpuRegister(d), Register(s)) => self.asm.movd_xr(d, s),
            (FpuRegister(d), StackSlot(o)) => self.asm.movss_rm(d, &stack(o)),
            (FpuRegister(d), DoubleStackSlot(o)) => self.asm.movsd_rm(d, &stack(o)),
            (FpuRegister(d), Constant(bits)) => self.move_fp_constant(d, bits, ty),

            (StackSlot(o), Register(s)) => self.asm.movl_mr(&stack(o), s),
            (StackSlot(o), FpuRegister(s)) => self.asm.movss_mr(&stack(o), s),
            (StackSlot(o), Constant(bits)) => self.asm.movl_mi(&stack(o), Immediate(bits as i32 as i64)),
            (StackSlot(d), StackSlot(s)) => {
                self.asm.movl_rm(scratch, &stack(s));
                self.asm.movl_mr(&stack(d), scratch);
            }

            (DoubleStackSlot(o), Register(s)) => self.asm.movq_mr(&stack(o), s),
            (DoubleStackSlot(o), FpuRegister(s)) => self.asm.movsd_mr(&stack(o), s),
            (DoubleStackSlot(o), Constant(bits)) => {
                if wide_regs && is_int32(bits) {
                    self.asm.movq_mi(&stack(o), Immediate(bits));
                } else {
                    self.asm.movl_mi(&stack(o), Immediate(low32(bits) as i64));
                    self.asm.movl_mi(&stack(o + 4), Immediate(high32(bits) as i64));
                }
            }
            (DoubleStackSlot(d), DoubleStackSlot(s)) => {
                if wide_regs {
                    self.asm.movq_rm(scratch, &stack(s));
                    self.asm.movq_mr(&stack(d), scratch);
                } else {
                    for half in [0, 4] {
                        self.asm.movl_rm(scratch, &stack(s + half));
                        self.asm.movl_mr(&stack(d + half), scratch);
                    }
                }
            }
            (DoubleStackSlot(o), RegisterPair { low, high }) => {
                self.asm.movl_mr(&stack(o), low);
                self.asm.movl_mr(&stack(o + 4), high);
            }

            (RegisterPair { low, high }, DoubleStackSlot(o)) => {
                self.asm.movl_rm(low, &stack(o));
                self.asm.movl_rm(high, &stack(o + 4));
            }
            (RegisterPair { low, high }, Constant(bits)) => {
                self.move_constant(low, low32(bits) as i64, false);
                self.move_constant(high, high32(bits) as i64, false);
            }
            (RegisterPair { low: dl, high: dh }, RegisterPair { low: sl, high: sh }) => {
                if dl == sh && dh == sl {
                    self.asm.xchgl_rr(dl, dh);
                } else if dl == sh {
                    self.asm.movl_rr(dh, sh);
                    self.asm.movl_rr(dl, sl);
                } else {
                    if dl != sl {
                        self.asm.movl_rr(dl, sl);
                    }
                    if dh != sh {
                        self.asm.movl_rr(dh, sh);
                    }
                }
            }
            (d, s) => fatal!("cannot move {} to {} as {:?}", s, d, ty),
        }
    }

    /// Perform `moves` as one simultaneous assignment.
    pub fn parallel_move(&mut self, moves: &[MoveOperands]) {
        parallel_move::resolve(moves, &mut MoveResolver { cg: self });
    }

    /// Move `args` into managed-call argument locations, in order.
    pub fn move_managed_arguments(&mut self, args: &[(Location, DataType)]) {
        let mut visitor = ArgumentVisitor::managed(self.isa);
        let moves: Vec<MoveOperands> = args
            .iter()
            .map(|&(source, ty)| MoveOperands {
                source,
                destination: outgoing_argument(visitor.next(ty), ty),
                ty,
            })
            .collect();
        self.parallel_move(&moves);
    }

    // =========================================================================
    // Typed memory access
    // =========================================================================

    /// Load a `ty` from `[base + index * scale + offset]` into `dst`,
    /// widening sub-word values.
    pub fn load_from_offset(
        &mut self,
        ty: DataType,
        dst: Location,
        base: CpuRegister,
        index: Option<Location>,
        scale: ScaleFactor,
        offset: i32,
    ) {
        let addr = heap_address(base, index, scale, offset);
        match (ty, dst) {
            (DataType::Bool, Location::Register(r)) => self.asm.movzxb_rm(r, &addr),
            (DataType::Int8, Location::Register(r)) => self.asm.movsxb_rm(r, &addr),
            (DataType::Uint16, Location::Register(r)) => self.asm.movzxw_rm(r, &addr),
            (DataType::Int16, Location::Register(r)) => self.asm.movsxw_rm(r, &addr),
            (DataType::Int32 | DataType::Reference, Location::Register(r)) => self.asm.movl_rm(r, &addr),
            (DataType::Int64, Location::Register(r)) => self.asm.movq_rm(r, &addr),
            (DataType::Int64, Location::RegisterPair { low, high }) => {
                let high_addr = heap_address(base, index, scale, offset + 4);
                let clobbers_address =
                    low == base || index.is_some_and(|i| i.overlaps(&Location::Register(low)));
                if clobbers_address {
                    self.asm.movl_rm(high, &high_addr);
                    self.asm.movl_rm(low, &addr);
                } else {
                    self.asm.movl_rm(low, &addr);
                    self.asm.movl_rm(high, &high_addr);
                }
            }
            (DataType::Float32, Location::FpuRegister(x)) => self.asm.movss_rm(x, &addr),
            (DataType::Float64, Location::FpuRegister(x)) => self.asm.movsd_rm(x, &addr),
            (ty, dst) => fatal!("cannot load {:?} into {}", ty, dst),
        }
    }

    /// Store `value` as a `ty` to `[base + index * scale + offset]`.
    pub fn store_to_offset(
        &mut self,
        ty: DataType,
        value: Location,
        base: CpuRegister,
        index: Option<Location>,
        scale: ScaleFactor,
        offset: i32,
    ) {
        let addr = heap_address(base, index, scale, offset);
        match (ty, value) {
            (_, Location::Constant(bits)) => match ty.size() {
                1 => self.asm.movb_mi(&addr, Immediate(bits as i8 as i64)),
                2 => self.asm.movw_mi(&addr, Immediate(bits as i16 as i64)),
                4 => self.asm.movl_mi(&addr, Immediate(bits as i32 as i64)),
                _ if self.isa.is_64bit() && is_int32(bits) => self.asm.movq_mi(&addr, Immediate(bits)),
                _ => {
                    self.asm.movl_mi(&addr, Immediate(low32(bits) as i64));
                    let high_addr = heap_address(base, index, scale, offset + 4);
                    self.asm.movl_mi(&high_addr, Immediate(high32(bits) as i64));
                }
            },
            (DataType::Bool | DataType::Int8, Location::Register(r)) => self.asm.movb_mr(&addr, r),
            (DataType::Uint16 | DataType::Int16, Location::Register(r)) => self.asm.movw_mr(&addr, r),
            (DataType::Int32 | DataType::Reference, Location::Register(r)) => self.asm.movl_mr(&addr, r),
            (DataType::Int64, Location::Register(r)) => self.asm.movq_mr(&addr, r),
            (DataType::Int64, Location::RegisterPair { low, high }) => {
                self.asm.movl_mr(&addr, low);
                let high_addr = heap_address(base, index, scale, offset + 4);
                self.asm.movl_mr(&high_addr, high);
            }
            (DataType::Float32, Location::FpuRegister(x)) => self.asm.movss_mr(&addr, x),
            (DataType::Float64, Location::FpuRegister(x)) => self.asm.movsd_mr(&addr, x),
            (ty, value) => fatal!("cannot store {} as {:?}", value, ty),
        }
    }

    // =========================================================================
    // Runtime calls and safepoints
    // =========================================================================

    /// Call `entrypoint` through the thread's entrypoint table and record a
    /// safepoint for `at` when the callee can suspend.
    pub fn invoke_runtime(
        &mut self,
        entrypoint: QuickEntrypoint,
        at: InstructionId,
        kind: SafepointKind,
        references: RegisterSet,
    ) {
        let offset = entrypoint.thread_offset(self.isa);
        self.thread_asm().call_m(&Address::absolute(offset));
        if entrypoint.needs_stack_map() {
            self.record_pc_info(at, kind, references);
        }
    }

    /// Record a safepoint at the current code offset.
    pub fn record_pc_info(&mut self, at: InstructionId, kind: SafepointKind, references: RegisterSet) {
        let stack_mask = self.alloc.live_reference_slots(self.graph, at);
        self.stack_maps.add(StackMapEntry {
            native_pc: self.asm.code_size() as u32,
            dex_pc: self.graph.get(at).dex_pc,
            kind,
            register_mask: references.bits(),
            stack_mask,
        });
    }

    /// Load `method`'s index into the method register and call a runtime
    /// trampoline that resolves and dispatches it.
    pub fn generate_runtime_dispatch(
        &mut self,
        entrypoint: QuickEntrypoint,
        method: MethodIndex,
        at: InstructionId,
        kind: SafepointKind,
        references: RegisterSet,
    ) {
        self.asm
            .movl_ri(ManagedCallingConvention::METHOD_REGISTER, Immediate(method.0 as i64));
        self.invoke_runtime(entrypoint, at, kind, references);
    }

    pub(crate) fn add_slow_path(&mut self, slow_path: Box<dyn SlowPathCode>) -> usize {
        self.slow_paths.push(slow_path);
        self.slow_paths.len() - 1
    }

    /// Branch to slow path `index`, unconditionally when `cond` is `None`.
    pub(crate) fn jump_to_slow_path(&mut self, cond: Option<Condition>, index: usize) {
        let entry = &mut self.slow_paths[index].labels().entry;
        match cond {
            Some(cond) => self.asm.j(cond, entry),
            None => self.asm.jmp(entry),
        }
    }

    pub(crate) fn bind_slow_path_exit(&mut self, index: usize) {
        self.asm.bind(&mut self.slow_paths[index].labels().exit);
    }

    /// Poll the thread's request flags. With a `successor` this is a loop
    /// back edge: the fast path branches straight to the loop header.
    pub fn generate_suspend_check(&mut self, check: InstructionId, successor: Option<BlockId>) {
        let saved = SavedRegisters::of(self.graph.get(check).locations());
        let index = self.add_slow_path(Box::new(SuspendCheckSlowPath::new(check, successor, saved)));
        let flags_addr = Address::absolute(self.thread.state_and_flags());
        self.thread_asm()
            .testl_mi(&flags_addr, Immediate(flags::SUSPEND_OR_CHECKPOINT_REQUEST as i64));
        match successor {
            None => {
                self.jump_to_slow_path(Some(Condition::NotEqual), index);
                self.bind_slow_path_exit(index);
            }
            Some(block) => {
                self.asm.j(Condition::Equal, &mut self.block_labels[block.index()]);
                self.jump_to_slow_path(None, index);
            }
        }
    }

    /// Suspend check a back edge to `header` must emit, if the header's own
    /// check was moved to its back edges.
    pub(crate) fn back_edge_suspend_check(&self, header: BlockId) -> Option<InstructionId> {
        if header.index() > self.current_block.index() {
            return None;
        }
        self.loop_suspend_checks.get(&header).copied()
    }

    /// Whether `check` is emitted at its loop's back edges instead.
    pub(crate) fn is_moved_suspend_check(&self, check: InstructionId) -> bool {
        let block = self.graph.get(check).block;
        self.loop_suspend_checks.get(&block) == Some(&check)
    }

    // =========================================================================
    // Null checks
    // =========================================================================

    pub fn generate_null_check(&mut self, check: InstructionId) {
        let object = self.graph.get(check).locations().in_at(0);
        if self.options.implicit_null_checks {
            self.asm.testl_rm(CpuRegister::RAX, &Address::new(object.reg(), 0));
            self.record_pc_info(check, SafepointKind::ImplicitFault, RegisterSet::EMPTY);
            return;
        }
        let index = self.add_slow_path(Box::new(NullCheckSlowPath::new(check)));
        match object {
            Location::Register(r) => {
                self.asm.testl_rr(r, r);
                self.jump_to_slow_path(Some(Condition::Equal), index);
            }
            Location::StackSlot(o) => {
                self.asm.cmpl_mi(&stack(o), Immediate(0));
                self.jump_to_slow_path(Some(Condition::Equal), index);
            }
            Location::Constant(0) => self.jump_to_slow_path(None, index),
            Location::Constant(_) => {}
            other => fatal!("null check of {}", other),
        }
    }

    /// Record the fault site of a memory access that performs a folded null
    /// check. Call right after emitting the access.
    pub fn maybe_record_implicit_null_check(&mut self, user: InstructionId) {
        if let Some(&check) = self.folded_null_checks.get(&user) {
            self.record_pc_info(check, SafepointKind::ImplicitFault, RegisterSet::EMPTY);
        }
    }

    // =========================================================================
    // GC barriers
    // =========================================================================

    pub fn maybe_poison_heap_reference(&mut self, reg: CpuRegister) {
        if self.options.heap_poisoning {
            self.asm.negl(reg);
        }
    }

    pub fn maybe_unpoison_heap_reference(&mut self, reg: CpuRegister) {
        if self.options.heap_poisoning {
            self.asm.negl(reg);
        }
    }

    /// Dirty the card of `object` after storing `value` into it. `card`
    /// must be byte-addressable on x86.
    pub fn mark_gc_card(
        &mut self,
        temp: CpuRegister,
        card: CpuRegister,
        object: CpuRegister,
        value: CpuRegister,
        value_can_be_null: bool,
    ) {
        let mut is_null = NearLabel::new();
        if value_can_be_null {
            self.asm.testl_rr(value, value);
            self.asm.j_near(Condition::Equal, &mut is_null);
        }
        let card_table = Address::absolute(self.thread.card_table());
        match self.isa {
            InstructionSet::X86_64 => self.asm.gs().movq_rm(card, &card_table),
            InstructionSet::X86 => self.asm.fs().movl_rm(card, &card_table),
        }
        self.asm.movl_rr(temp, object);
        self.asm
            .shrl_ri(temp, Immediate(self.options.card_shift as i64));
        // The table base is biased so its low byte is the dirty value.
        self.asm
            .movb_mr(&Address::indexed(card, temp, ScaleFactor::Times1, 0), card);
        if value_can_be_null {
            self.asm.bind_near(&mut is_null);
        }
    }

    /// Load the reference at `[obj + index * 4 + offset]` into `out` behind
    /// the configured read barrier. `at` is the instruction performing the
    /// load; a null check folded into it is recorded on the first access.
    pub fn generate_reference_load_with_barrier(
        &mut self,
        at: InstructionId,
        out: CpuRegister,
        obj: CpuRegister,
        offset: i32,
        index: Option<Location>,
        saved: SavedRegisters,
    ) {
        let addr = heap_address(obj, index, ScaleFactor::Times4, offset);
        match self.options.read_barrier {
            ReadBarrierKind::Baker => {
                // Gray test first: x86 keeps the later load ordered after it.
                self.asm
                    .testb_mi(&Address::new(obj, GRAY_BYTE_OFFSET), Immediate(GRAY_BIT_IN_BYTE));
                self.maybe_record_implicit_null_check(at);
                self.asm.movl_rm(out, &addr);
                let unpoison = self.options.heap_poisoning;
                let slow = self.add_slow_path(Box::new(ReadBarrierMarkSlowPath::new(at, out, unpoison)));
                self.jump_to_slow_path(Some(Condition::NotEqual), slow);
                self.maybe_unpoison_heap_reference(out);
                self.bind_slow_path_exit(slow);
            }
            ReadBarrierKind::Slow => {
                self.asm.movl_rm(out, &addr);
                self.maybe_record_implicit_null_check(at);
                self.maybe_unpoison_heap_reference(out);
                let slow = self.add_slow_path(Box::new(ReadBarrierForHeapReferenceSlowPath::new(
                    at,
                    out,
                    obj,
                    offset as u32,
                    index.map(|i| (i, ScaleFactor::Times4 as u8)),
                    saved,
                )));
                self.jump_to_slow_path(None, slow);
                self.bind_slow_path_exit(slow);
            }
            ReadBarrierKind::None => {
                self.asm.movl_rm(out, &addr);
                self.maybe_record_implicit_null_check(at);
                self.maybe_unpoison_heap_reference(out);
            }
        }
    }

    /// Load a GC root (class or string slot) from `addr`. A `patch`
    /// describes the PC-relative displacement just emitted in `addr`.
    pub fn generate_gc_root_load(
        &mut self,
        at: InstructionId,
        out: CpuRegister,
        addr: &Address,
        patch: Option<(PatchKind, u32, Option<InstructionId>)>,
        saved: SavedRegisters,
    ) {
        self.asm.movl_rm(out, addr);
        if let Some((kind, target, base)) = patch {
            self.record_patch(kind, target, base);
        }
        match self.options.read_barrier {
            ReadBarrierKind::Baker => {
                let marking = Address::absolute(self.thread.is_gc_marking());
                self.thread_asm().cmpl_mi(&marking, Immediate(0));
                let slow = self.add_slow_path(Box::new(ReadBarrierMarkSlowPath::new(at, out, false)));
                self.jump_to_slow_path(Some(Condition::NotEqual), slow);
                self.bind_slow_path_exit(slow);
            }
            ReadBarrierKind::Slow => {
                let slow = self.add_slow_path(Box::new(ReadBarrierForRootSlowPath::new(at, out, saved)));
                self.jump_to_slow_path(None, slow);
                self.bind_slow_path_exit(slow);
            }
            ReadBarrierKind::None => {}
        }
    }

    // =========================================================================
    // PC-relative addressing and linker patches
    // =========================================================================

    /// Base-method-address input of `id` and the register holding it.
    pub(crate) fn pc_relative_base(&self, id: InstructionId) -> Option<(InstructionId, CpuRegister)> {
        let instr = self.graph.get(id);
        let last = *instr.inputs.last()?;
        if !matches!(self.graph.get(last).kind, HKind::ComputeBaseMethodAddress) {
            return None;
        }
        let reg = instr.locations().in_at(instr.inputs.len() - 1).reg();
        Some((last, reg))
    }

    /// Placeholder operand for a PC-relative reference from `id`.
    pub(crate) fn pc_relative_address(&self, id: InstructionId) -> Address {
        match (self.isa, self.pc_relative_base(id)) {
            (_, Some((_, reg))) => Address::new(reg, PLACEHOLDER_32BIT_OFFSET),
            (InstructionSet::X86_64, None) => Address::rip(PLACEHOLDER_32BIT_OFFSET),
            (InstructionSet::X86, None) => fatal!("{} needs a base method address on x86", id),
        }
    }

    /// Register a patch for the displacement ending at the current offset.
    pub fn record_patch(&mut self, kind: PatchKind, target: u32, base: Option<InstructionId>) {
        let literal_offset = self.asm.code_size() as u32 - 4;
        let anchor = match base {
            Some(b) => PatchAnchor::BaseMethodAddress(b),
            None => PatchAnchor::NextInstruction,
        };
        self.patches.push(PendingPatch {
            kind,
            literal_offset,
            anchor,
            target,
        });
    }

    /// Emit a PC-relative `op` for `id` and record its patch.
    pub(crate) fn emit_pc_relative(
        &mut self,
        id: InstructionId,
        kind: PatchKind,
        target: u32,
        op: impl FnOnce(&mut Self, &Address),
    ) {
        let addr = self.pc_relative_address(id);
        op(self, &addr);
        let base = self.pc_relative_base(id).map(|b| b.0);
        self.record_patch(kind, target, base);
    }

    /// Materialize the anchor for x86 PC-relative addressing: `call` the
    /// next instruction and pop the return address.
    pub(crate) fn generate_base_method_address(&mut self, id: InstructionId, out: CpuRegister) {
        let mut next = Label::new();
        self.asm.call(&mut next);
        self.asm.bind(&mut next);
        self.base_method_addresses
            .insert(id, self.asm.code_size() as u32);
        self.asm.popq_r(out);
    }

    /// Resolve anchors of recorded patches.
    pub fn emit_linker_patches(&self) -> Vec<LinkerPatch> {
        self.patches
            .iter()
            .map(|p| {
                let pc_insn_offset = match p.anchor {
                    PatchAnchor::NextInstruction => p.literal_offset + 4,
                    PatchAnchor::BaseMethodAddress(id) => match self.base_method_addresses.get(&id) {
                        Some(&offset) => offset,
                        None => fatal!("patch anchored on unemitted {}", id),
                    },
                };
                LinkerPatch {
                    kind: p.kind,
                    literal_offset: p.literal_offset,
                    pc_insn_offset,
                    target: p.target,
                }
            })
            .collect()
    }

    // =========================================================================
    // Invokes
    // =========================================================================

    /// Static and direct calls. `.bss` method slots start out holding the
    /// runtime's resolution method, so the call is valid before resolution.
    pub fn generate_static_or_direct_call(&mut self, at: InstructionId, method: MethodIndex, dispatch: DispatchInfo) {
        let method_reg = ManagedCallingConvention::METHOD_REGISTER;
        match dispatch.method_load_kind {
            MethodLoadKind::Recursive => self.load_pointer(method_reg, &stack(0)),
            MethodLoadKind::BootImageLinkTimePcRelative => {
                self.emit_pc_relative(at, PatchKind::BootImageMethod, method.0, |cg, addr| {
                    cg.lea_pointer(method_reg, addr)
                });
            }
            MethodLoadKind::BssEntry => {
                self.emit_pc_relative(at, PatchKind::MethodBssEntry, method.0, |cg, addr| {
                    cg.load_pointer(method_reg, addr)
                });
            }
            MethodLoadKind::RuntimeCall => {
                self.generate_runtime_dispatch(
                    QuickEntrypoint::InvokeStaticTrampolineWithAccessCheck,
                    method,
                    at,
                    SafepointKind::Call,
                    RegisterSet::EMPTY,
                );
                return;
            }
        }
        match dispatch.code_ptr_location {
            CodePtrLocation::CallSelf => self.asm.call(&mut self.frame_entry_label),
            CodePtrLocation::CallArtMethod => {
                let entry = Address::new(method_reg, self.method_layout.entry_point());
                self.asm.call_m(&entry);
            }
        }
        self.record_pc_info(at, SafepointKind::Call, RegisterSet::EMPTY);
    }

    /// Load the receiver's class into the method register.
    fn load_receiver_class(&mut self, at: InstructionId) {
        let receiver = self.graph.get(at).locations().in_at(0).reg();
        let temp = ManagedCallingConvention::METHOD_REGISTER;
        self.asm.movl_rm(temp, &Address::new(receiver, CLASS_OFFSET));
        self.maybe_record_implicit_null_check(at);
        self.maybe_unpoison_heap_reference(temp);
    }

    /// Virtual call through the embedded vtable, or the resolution
    /// trampoline when the slot is unknown.
    pub fn generate_virtual_call(&mut self, at: InstructionId, method: MethodIndex, vtable_index: Option<u32>) {
        let Some(index) = vtable_index else {
            self.generate_runtime_dispatch(
                QuickEntrypoint::InvokeVirtualTrampoline,
                method,
                at,
                SafepointKind::Call,
                RegisterSet::EMPTY,
            );
            return;
        };
        let temp = ManagedCallingConvention::METHOD_REGISTER;
        self.load_receiver_class(at);
        let entry = Address::new(temp, self.class_layout.vtable_entry(index));
        self.load_pointer(temp, &entry);
        self.asm
            .call_m(&Address::new(temp, self.method_layout.entry_point()));
        self.record_pc_info(at, SafepointKind::Call, RegisterSet::EMPTY);
    }

    /// Interface call through the class's IMT. The interface method index
    /// travels in RAX so conflict stubs can find the target.
    pub fn generate_interface_call(&mut self, at: InstructionId, method: MethodIndex, imt_index: Option<u32>) {
        let Some(index) = imt_index else {
            self.generate_runtime_dispatch(
                QuickEntrypoint::InvokeInterfaceTrampoline,
                method,
                at,
                SafepointKind::Call,
                RegisterSet::EMPTY,
            );
            return;
        };
        let temp = ManagedCallingConvention::METHOD_REGISTER;
        self.load_receiver_class(at);
        let imt = Address::new(temp, self.class_layout.imt_ptr());
        self.load_pointer(temp, &imt);
        let entry = Address::new(temp, self.class_layout.imt_entry(index));
        self.load_pointer(temp, &entry);
        self.asm
            .movl_ri(CpuRegister::RAX, Immediate(method.0 as i64));
        self.asm
            .call_m(&Address::new(temp, self.method_layout.entry_point()));
        self.record_pc_info(at, SafepointKind::Call, RegisterSet::EMPTY);
    }

    /// `invoke-polymorphic` goes through the method-handle invoker.
    pub fn generate_polymorphic_call(&mut self, at: InstructionId, method: MethodIndex) {
        self.generate_runtime_dispatch(
            QuickEntrypoint::InvokePolymorphic,
            method,
            at,
            SafepointKind::Call,
            RegisterSet::EMPTY,
        );
    }
}

// =============================================================================
// Parallel moves
// =============================================================================

struct MoveResolver<'a, 'g> {
    cg: &'a mut CodeGeneratorX86_64<'g>,
}

impl MoveEmitter for MoveResolver<'_, '_> {
    fn emit_move(&mut self, destination: Location, source: Location, ty: DataType) {
        self.cg.move_location(destination, source, ty);
    }

    fn emit_swap(&mut self, a: Location, b: Location, ty: DataType) {
        use Location::*;
        let cg = &mut *self.cg;
        let scratch = scratch_register(cg.isa);
        let fpu_scratch = fpu_scratch_register(cg.isa);
        match (a, b) {
            (Register(x), Register(y)) => match cg.isa {
                InstructionSet::X86_64 => cg.asm.xchgq_rr(x, y),
                InstructionSet::X86 => cg.asm.xchgl_rr(x, y),
            },
            (Register(r), slot) | (slot, Register(r)) if slot.is_stack_slot() => {
                cg.move_location(Register(scratch), slot, ty);
                cg.move_location(slot, Register(r), ty);
                cg.move_register(r, scratch);
            }
            (FpuRegister(x), FpuRegister(y)) => {
                cg.asm.movaps_rr(fpu_scratch, x);
                cg.asm.movaps_rr(x, y);
                cg.asm.movaps_rr(y, fpu_scratch);
            }
            (FpuRegister(x), slot) | (slot, FpuRegister(x)) if slot.is_stack_slot() => {
                cg.move_location(FpuRegister(fpu_scratch), slot, ty);
                cg.move_location(slot, FpuRegister(x), ty);
                cg.asm.movaps_rr(x, fpu_scratch);
            }
            (RegisterPair { low: al, high: ah }, RegisterPair { low: bl, high: bh }) => {
                cg.asm.xchgl_rr(al, bl);
                cg.asm.xchgl_rr(ah, bh);
            }
            (RegisterPair { low, high }, DoubleStackSlot(o)) | (DoubleStackSlot(o), RegisterPair { low, high }) => {
                for (reg, half) in [(low, 0), (high, 4)] {
                    cg.asm.movl_rm(scratch, &stack(o + half));
                    cg.asm.movl_mr(&stack(o + half), reg);
                    cg.asm.movl_rr(reg, scratch);
                }
            }
            (x, y) if x.is_stack_slot() && y.is_stack_slot() => {
                // One side parks in the FPU scratch while the other moves
                // through the core scratch.
                let parked = FpuRegister(fpu_scratch);
                let as_fp = if matches!(x, DoubleStackSlot(_)) {
                    DataType::Float64
                } else {
                    DataType::Float32
                };
                cg.move_location(parked, x, as_fp);
                cg.move_location(x, y, ty);
                cg.move_location(y, parked, as_fp);
            }
            (x, y) => fatal!("cannot swap {} and {}", x, y),
        }
    }
}

// =============================================================================
// Graph analysis
// =============================================================================

/// Null checks whose next instruction dereferences the checked object at
/// a small offset, keyed by that instruction.
fn fold_null_checks(graph: &HGraph) -> FxHashMap<InstructionId, InstructionId> {
    let mut folded = FxHashMap::default();
    for check in graph.instructions().iter().filter(|i| matches!(i.kind, HKind::NullCheck)) {
        let Some(next) = graph.next_in_block(check.id) else {
            continue;
        };
        let user = graph.get(next);
        if user.inputs.first() == Some(&check.id) && can_fold_null_check(&user.kind) {
            folded.insert(user.id, check.id);
        }
    }
    folded
}

fn can_fold_null_check(kind: &HKind) -> bool {
    match kind {
        HKind::InstanceFieldGet { offset, .. } | HKind::InstanceFieldSet { offset, .. } => {
            *offset < MAX_IMPLICIT_NULL_CHECK_OFFSET
        }
        HKind::ArrayLength => true,
        HKind::InvokeVirtual { vtable_index, .. } => vtable_index.is_some(),
        HKind::InvokeInterface { imt_index, .. } => imt_index.is_some(),
        _ => false,
    }
}

/// Loop headers whose back edges are all gotos, mapped to the header's
/// suspend check. Those checks are emitted at the back edges, where the
/// fast path doubles as the loop branch.
fn find_loop_suspend_checks(graph: &HGraph) -> FxHashMap<BlockId, InstructionId> {
    let mut all_gotos: FxHashMap<BlockId, bool> = FxHashMap::default();
    for b in graph.block_ids() {
        let block = graph.block(b);
        let Some(&last) = block.instructions.last() else {
            continue;
        };
        let is_goto = matches!(graph.get(last).kind, HKind::Goto { .. });
        for &s in block.successors.iter().filter(|s| s.index() <= b.index()) {
            *all_gotos.entry(s).or_insert(true) &= is_goto;
        }
    }
    all_gotos
        .into_iter()
        .filter(|&(_, gotos)| gotos)
        .filter_map(|(header, _)| {
            graph
                .block(header)
                .instructions
                .iter()
                .copied()
                .find(|&i| matches!(graph.get(i).kind, HKind::SuspendCheck))
                .map(|check| (header, check))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::location::{CallKind, LocationSummary};
    use ember_core::MethodIndex;

    fn empty_graph() -> HGraph {
        let mut g = HGraph::new(MethodIndex(0), true);
        let b = g.add_block();
        g.add(b, HKind::ReturnVoid, DataType::Void, &[], 0);
        g
    }

    fn with_codegen(options: &CodegenOptions, f: impl FnOnce(&mut CodeGeneratorX86_64<'_>)) -> Vec<u8> {
        let mut graph = empty_graph();
        let id = InstructionId(0);
        graph.get_mut(id).locations = Some(LocationSummary::new(0, CallKind::NoCall));
        let alloc = allocator::allocate(&mut graph, options).unwrap();
        let mut cg = CodeGeneratorX86_64::new(&graph, options, alloc);
        f(&mut cg);
        cg.asm.code().to_vec()
    }

    #[test]
    fn test_move_constant_forms() {
        let opts = CodegenOptions::plain();
        let code = with_codegen(&opts, |cg| {
            cg.move_constant(CpuRegister::RAX, 0, true);
            cg.move_constant(CpuRegister::RCX, 0x1234_5678, false);
            cg.move_constant(CpuRegister::RDX, -1, true);
        });
        assert_eq!(&code[..2], &[0x31, 0xC0]);
        assert_eq!(&code[2..7], &[0xB9, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(&code[7..], &[0x48, 0xC7, 0xC2, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_stack_to_stack_uses_scratch() {
        let opts = CodegenOptions::plain();
        let code = with_codegen(&opts, |cg| {
            cg.move_location(Location::StackSlot(16), Location::StackSlot(8), DataType::Int32);
        });
        // movl r11d, [rsp+8]; movl [rsp+16], r11d
        assert_eq!(
            code,
            vec![0x44, 0x8B, 0x5C, 0x24, 0x08, 0x44, 0x89, 0x5C, 0x24, 0x10]
        );
    }

    #[test]
    fn test_pair_moves_on_x86() {
        let opts = CodegenOptions::x86();
        let code = with_codegen(&opts, |cg| {
            let a = Location::RegisterPair {
                low: CpuRegister::RAX,
                high: CpuRegister::RCX,
            };
            let crossed = Location::RegisterPair {
                low: CpuRegister::RCX,
                high: CpuRegister::RAX,
            };
            cg.move_location(crossed, a, DataType::Int64);
        });
        // xchg ecx, eax in either operand order.
        assert_eq!(code.len(), 2);
        assert_eq!(code[0], 0x87);
    }

    #[test]
    fn test_parallel_move_swaps_registers() {
        let opts = CodegenOptions::plain();
        let code = with_codegen(&opts, |cg| {
            let rax = Location::Register(CpuRegister::RAX);
            let rcx = Location::Register(CpuRegister::RCX);
            cg.parallel_move(&[
                MoveOperands {
                    source: rcx,
                    destination: rax,
                    ty: DataType::Int32,
                },
                MoveOperands {
                    source: rax,
                    destination: rcx,
                    ty: DataType::Int32,
                },
            ]);
        });
        assert_eq!(code[..2], [0x48, 0x87]);
        assert_eq!(code.len(), 3);
    }

    #[test]
    fn test_runtime_call_records_safepoint() {
        let opts = CodegenOptions::plain();
        let mut graph = empty_graph();
        graph.get_mut(InstructionId(0)).locations = Some(LocationSummary::new(0, CallKind::NoCall));
        let alloc = allocator::allocate(&mut graph, &opts).unwrap();
        let mut cg = CodeGeneratorX86_64::new(&graph, &opts, alloc);
        cg.invoke_runtime(
            QuickEntrypoint::TestSuspend,
            InstructionId(0),
            SafepointKind::Call,
            RegisterSet::EMPTY,
        );
        let end = cg.asm.code_size() as u32;
        // gs: call [abs32] is 8 bytes.
        assert_eq!(end, 8);
        assert_eq!(cg.asm.code()[0], 0x65);
        cg.invoke_runtime(
            QuickEntrypoint::Fmod,
            InstructionId(0),
            SafepointKind::Call,
            RegisterSet::EMPTY,
        );
        let method = cg.finalize();
        assert_eq!(method.stack_map.len(), 1);
        assert_eq!(method.stack_map.entries()[0].native_pc, end);
    }

    #[test]
    fn test_card_mark_sequence() {
        let opts = CodegenOptions::plain();
        let code = with_codegen(&opts, |cg| {
            cg.mark_gc_card(CpuRegister::RDX, CpuRegister::RCX, CpuRegister::RSI, CpuRegister::RDI, true);
        });
        // testl edi, edi; je +n
        assert_eq!(&code[..3], &[0x85, 0xFF, 0x74]);
        // gs prefix of the card-table load.
        assert_eq!(code[4], 0x65);
        // The sequence ends with movb [rcx+rdx], cl.
        assert_eq!(&code[code.len() - 3..], &[0x88, 0x0C, 0x11]);
        assert_eq!(code[3] as usize, code.len() - 4);
    }

    #[test]
    fn test_loop_suspend_check_detection() {
        let mut g = HGraph::new(MethodIndex(0), true);
        let entry = g.add_block();
        let header = g.add_block();
        let body = g.add_block();
        let exit = g.add_block();
        let c = g.add(entry, HKind::IntConstant(1), DataType::Bool, &[], 0);
        g.add(entry, HKind::Goto { target: header }, DataType::Void, &[], 0);
        let check = g.add(header, HKind::SuspendCheck, DataType::Void, &[], 1);
        g.add(header, HKind::If { true_block: body, false_block: exit }, DataType::Void, &[c], 1);
        g.add(body, HKind::Goto { target: header }, DataType::Void, &[], 2);
        g.add(exit, HKind::ReturnVoid, DataType::Void, &[], 3);
        let found = find_loop_suspend_checks(&g);
        assert_eq!(found.get(&header), Some(&check));
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_null_check_folding_rules() {
        assert!(can_fold_null_check(&HKind::InstanceFieldGet {
            offset: 8,
            volatile: false
        }));
        assert!(!can_fold_null_check(&HKind::InstanceFieldGet {
            offset: MAX_IMPLICIT_NULL_CHECK_OFFSET,
            volatile: false
        }));
        assert!(!can_fold_null_check(&HKind::InvokeVirtual {
            method: MethodIndex(1),
            vtable_index: None
        }));
        assert!(can_fold_null_check(&HKind::ArrayLength));
    }

    #[test]
    fn test_heap_address_constant_index() {
        let addr = heap_address(CpuRegister::RSI, Some(Location::Constant(3)), ScaleFactor::Times4, 12);
        assert_eq!(addr, Address::new(CpuRegister::RSI, 24));
    }
}
