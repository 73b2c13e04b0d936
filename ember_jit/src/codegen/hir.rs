//! High-level IR consumed by the code generator.
//!
//! The graph is an arena: instructions and blocks are addressed by
//! [`InstructionId`] and [`BlockId`], and each instruction carries the
//! [`LocationSummary`] the locations builder attaches to it. Optimization
//! happens elsewhere; this module only models what code generation reads.

use super::intrinsics::Intrinsic;
use super::location::{Location, LocationSummary};
use ember_core::{MethodIndex, ProtoIndex, StringIndex, TypeIndex};
use smallvec::SmallVec;
use std::fmt;

// =============================================================================
// Ids and types
// =============================================================================

/// Index of an instruction in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstructionId(pub u32);

impl InstructionId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// Index of a basic block in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Value type of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    Bool,
    Int8,
    Uint16,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Reference,
    #[default]
    Void,
}

impl DataType {
    /// Size of a value in memory.
    pub const fn size(self) -> usize {
        match self {
            DataType::Bool | DataType::Int8 => 1,
            DataType::Uint16 | DataType::Int16 => 2,
            DataType::Int32 | DataType::Float32 | DataType::Reference => 4,
            DataType::Int64 | DataType::Float64 => 8,
            DataType::Void => 0,
        }
    }

    #[inline]
    pub const fn is_floating_point(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    #[inline]
    pub const fn is_64bit(self) -> bool {
        matches!(self, DataType::Int64 | DataType::Float64)
    }

    #[inline]
    pub const fn is_reference(self) -> bool {
        matches!(self, DataType::Reference)
    }

    /// Integral types that occupy a 32-bit register.
    #[inline]
    pub const fn is_int_or_smaller(self) -> bool {
        matches!(
            self,
            DataType::Bool | DataType::Int8 | DataType::Uint16 | DataType::Int16 | DataType::Int32
        )
    }
}

// =============================================================================
// Instruction kinds
// =============================================================================

/// Bias of a floating-point [`HKind::Compare`] when an operand is NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ComparisonBias {
    /// Integral compare; no NaN.
    #[default]
    None,
    /// NaN compares greater (`cmpg`).
    GtBias,
    /// NaN compares less (`cmpl`).
    LtBias,
}

/// Condition evaluated by [`HKind::Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IfCondition {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned `<`.
    B,
    /// Unsigned `<=`.
    Be,
    /// Unsigned `>`.
    A,
    /// Unsigned `>=`.
    Ae,
}

/// How a class, string or method is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadKind {
    /// The declaring class of the compiled method.
    ReferrersClass,
    /// PC-relative address in the boot image, fixed at link time.
    BootImageLinkTimePcRelative,
    /// PC-relative load from a read-only relocated entry.
    BootImageRelRo,
    /// PC-relative load from a `.bss` slot filled lazily at run time.
    BssEntry,
    /// Resolve through a runtime call every time.
    RuntimeCall,
}

/// How an invoke target is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodLoadKind {
    /// The method being compiled.
    Recursive,
    /// PC-relative address of a boot-image method.
    BootImageLinkTimePcRelative,
    /// PC-relative load from a `.bss` slot.
    BssEntry,
    /// Call through a resolution trampoline.
    RuntimeCall,
}

/// Where the callee's code is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodePtrLocation {
    /// Call our own frame entry.
    CallSelf,
    /// Load the entrypoint from the callee method.
    CallArtMethod,
}

/// Dispatch information for static and direct invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchInfo {
    pub method_load_kind: MethodLoadKind,
    pub code_ptr_location: CodePtrLocation,
}

impl DispatchInfo {
    /// Dispatch through the method's entrypoint after loading it `kind`.
    pub const fn via_method(kind: MethodLoadKind) -> Self {
        Self {
            method_load_kind: kind,
            code_ptr_location: CodePtrLocation::CallArtMethod,
        }
    }
}

/// Type check flavors for instance-of and check-cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCheckKind {
    /// The class is final: a class-pointer compare decides.
    ExactCheck,
    /// Anything else: compare, then ask the runtime.
    UnresolvedCheck,
}

/// Ordering constraint of an [`HKind::MemoryBarrier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemBarrierKind {
    AnyStore,
    LoadAny,
    StoreStore,
    AnyAny,
    /// Orders non-temporal stores.
    NtStoreStore,
}

/// One move of an [`HKind::ParallelMove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOperands {
    pub source: Location,
    pub destination: Location,
    pub ty: DataType,
}

/// What an instruction does.
#[derive(Debug, Clone, PartialEq)]
pub enum HKind {
    IntConstant(i32),
    LongConstant(i64),
    FloatConstant(f32),
    DoubleConstant(f64),
    NullConstant,
    /// Incoming argument `index` (the receiver is 0 for instance methods).
    Parameter { index: u16 },

    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    UShr,
    Neg,
    Not,
    /// Three-way compare producing -1, 0 or 1.
    Compare { bias: ComparisonBias },
    /// Materialized boolean condition.
    Condition { cond: IfCondition, bias: ComparisonBias },
    TypeConversion { from: DataType },

    If { true_block: BlockId, false_block: BlockId },
    Goto { target: BlockId },
    Return,
    ReturnVoid,

    NullCheck,
    BoundsCheck,
    DivZeroCheck,
    SuspendCheck,

    InstanceFieldGet { offset: u32, volatile: bool },
    InstanceFieldSet { offset: u32, volatile: bool, value_can_be_null: bool },
    StaticFieldGet { offset: u32, volatile: bool },
    StaticFieldSet { offset: u32, volatile: bool, value_can_be_null: bool },
    ArrayGet,
    /// `needs_type_check` stores go through the runtime's checked store.
    ArraySet { value_can_be_null: bool, needs_type_check: bool },
    ArrayLength,

    NewInstance { type_index: TypeIndex },
    NewArray { type_index: TypeIndex },
    LoadClass { type_index: TypeIndex, kind: LoadKind },
    LoadString { string_index: StringIndex, kind: LoadKind },
    LoadMethodType { proto_index: ProtoIndex, kind: LoadKind },
    LoadMethodHandle { index: u32 },
    InstanceOf { check: TypeCheckKind },
    CheckCast { check: TypeCheckKind },
    MonitorOperation { enter: bool },
    Throw,
    /// Leave compiled code when input 0 is true, resuming in the
    /// interpreter; `reason` is passed to the runtime.
    Deoptimize { reason: u32 },

    InvokeStaticOrDirect { method: MethodIndex, dispatch: DispatchInfo },
    /// `None` when the vtable slot is unknown at compile time; the call then
    /// goes through the runtime trampoline.
    InvokeVirtual { method: MethodIndex, vtable_index: Option<u32> },
    /// `None` dispatches through the trampoline that walks the iftable.
    InvokeInterface { method: MethodIndex, imt_index: Option<u32> },
    InvokePolymorphic { method: MethodIndex },
    InvokeIntrinsic { method: MethodIndex, intrinsic: Intrinsic },

    /// Anchor for PC-relative addressing on x86.
    ComputeBaseMethodAddress,
    ParallelMove(Vec<MoveOperands>),
    MemoryBarrier(MemBarrierKind),
}

impl HKind {
    /// Constants are materialized at their uses.
    pub fn is_constant(&self) -> bool {
        matches!(
            self,
            HKind::IntConstant(_)
                | HKind::LongConstant(_)
                | HKind::FloatConstant(_)
                | HKind::DoubleConstant(_)
                | HKind::NullConstant
        )
    }

    /// Whether the instruction ends its block.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            HKind::If { .. } | HKind::Goto { .. } | HKind::Return | HKind::ReturnVoid | HKind::Throw
        )
    }

    /// Checks pass their first input through unchanged.
    pub fn is_check(&self) -> bool {
        matches!(self, HKind::NullCheck | HKind::BoundsCheck | HKind::DivZeroCheck)
    }

    /// Whether the instruction calls managed code.
    pub fn is_invoke(&self) -> bool {
        matches!(
            self,
            HKind::InvokeStaticOrDirect { .. }
                | HKind::InvokeVirtual { .. }
                | HKind::InvokeInterface { .. }
                | HKind::InvokePolymorphic { .. }
                | HKind::InvokeIntrinsic { .. }
        )
    }

    /// Short name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            HKind::IntConstant(_) => "IntConstant",
            HKind::LongConstant(_) => "LongConstant",
            HKind::FloatConstant(_) => "FloatConstant",
            HKind::DoubleConstant(_) => "DoubleConstant",
            HKind::NullConstant => "NullConstant",
            HKind::Parameter { .. } => "Parameter",
            HKind::Add => "Add",
            HKind::Sub => "Sub",
            HKind::Mul => "Mul",
            HKind::Div => "Div",
            HKind::Rem => "Rem",
            HKind::And => "And",
            HKind::Or => "Or",
            HKind::Xor => "Xor",
            HKind::Shl => "Shl",
            HKind::Shr => "Shr",
            HKind::UShr => "UShr",
            HKind::Neg => "Neg",
            HKind::Not => "Not",
            HKind::Compare { .. } => "Compare",
            HKind::Condition { .. } => "Condition",
            HKind::TypeConversion { .. } => "TypeConversion",
            HKind::If { .. } => "If",
            HKind::Goto { .. } => "Goto",
            HKind::Return => "Return",
            HKind::ReturnVoid => "ReturnVoid",
            HKind::NullCheck => "NullCheck",
            HKind::BoundsCheck => "BoundsCheck",
            HKind::DivZeroCheck => "DivZeroCheck",
            HKind::SuspendCheck => "SuspendCheck",
            HKind::InstanceFieldGet { .. } => "InstanceFieldGet",
            HKind::InstanceFieldSet { .. } => "InstanceFieldSet",
            HKind::StaticFieldGet { .. } => "StaticFieldGet",
            HKind::StaticFieldSet { .. } => "StaticFieldSet",
            HKind::ArrayGet => "ArrayGet",
            HKind::ArraySet { .. } => "ArraySet",
            HKind::ArrayLength => "ArrayLength",
            HKind::NewInstance { .. } => "NewInstance",
            HKind::NewArray { .. } => "NewArray",
            HKind::LoadClass { .. } => "LoadClass",
            HKind::LoadString { .. } => "LoadString",
            HKind::LoadMethodType { .. } => "LoadMethodType",
            HKind::LoadMethodHandle { .. } => "LoadMethodHandle",
            HKind::InstanceOf { .. } => "InstanceOf",
            HKind::CheckCast { .. } => "CheckCast",
            HKind::MonitorOperation { .. } => "MonitorOperation",
            HKind::Throw => "Throw",
            HKind::Deoptimize { .. } => "Deoptimize",
            HKind::InvokeStaticOrDirect { .. } => "InvokeStaticOrDirect",
            HKind::InvokeVirtual { .. } => "InvokeVirtual",
            HKind::InvokeInterface { .. } => "InvokeInterface",
            HKind::InvokePolymorphic { .. } => "InvokePolymorphic",
            HKind::InvokeIntrinsic { .. } => "InvokeIntrinsic",
            HKind::ComputeBaseMethodAddress => "ComputeBaseMethodAddress",
            HKind::ParallelMove(_) => "ParallelMove",
            HKind::MemoryBarrier(_) => "MemoryBarrier",
        }
    }
}

// =============================================================================
// Instructions, blocks, graph
// =============================================================================

/// A node of the graph.
#[derive(Debug, Clone)]
pub struct HInstruction {
    pub id: InstructionId,
    pub kind: HKind,
    pub ty: DataType,
    pub inputs: SmallVec<[InstructionId; 4]>,
    pub block: BlockId,
    pub dex_pc: u32,
    pub locations: Option<LocationSummary>,
}

impl HInstruction {
    /// Input `i`; aborts if absent.
    #[inline]
    pub fn input(&self, i: usize) -> InstructionId {
        match self.inputs.get(i) {
            Some(&id) => id,
            None => ember_core::fatal!("{} {} has no input {}", self.kind.name(), self.id, i),
        }
    }

    /// Location summary; aborts if the locations builder has not run.
    #[inline]
    pub fn locations(&self) -> &LocationSummary {
        match &self.locations {
            Some(l) => l,
            None => ember_core::fatal!("{} {} has no locations", self.kind.name(), self.id),
        }
    }

    /// Whether the instruction defines a value.
    #[inline]
    pub fn has_value(&self) -> bool {
        self.ty != DataType::Void
    }
}

/// Basic block: a straight-line list of instructions.
#[derive(Debug, Clone, Default)]
pub struct HBasicBlock {
    pub instructions: Vec<InstructionId>,
    pub successors: SmallVec<[BlockId; 2]>,
}

/// Method graph.
#[derive(Debug, Clone, Default)]
pub struct HGraph {
    instructions: Vec<HInstruction>,
    blocks: Vec<HBasicBlock>,
    /// Number of incoming arguments, including the receiver.
    pub num_parameters: u16,
    /// Whether the method is static.
    pub is_static: bool,
    /// Method index of the compiled method, for recursive calls.
    pub method_index: MethodIndex,
}

impl HGraph {
    /// Create an empty graph.
    pub fn new(method_index: MethodIndex, is_static: bool) -> Self {
        Self {
            method_index,
            is_static,
            ..Self::default()
        }
    }

    /// Append a block. The first block is the entry.
    pub fn add_block(&mut self) -> BlockId {
        self.blocks.push(HBasicBlock::default());
        BlockId(self.blocks.len() as u32 - 1)
    }

    /// Append an instruction to `block`.
    pub fn add(
        &mut self,
        block: BlockId,
        kind: HKind,
        ty: DataType,
        inputs: &[InstructionId],
        dex_pc: u32,
    ) -> InstructionId {
        let id = InstructionId(self.instructions.len() as u32);
        match &kind {
            HKind::Parameter { index } => {
                self.num_parameters = self.num_parameters.max(index + 1);
            }
            HKind::If { true_block, false_block } => {
                self.blocks[block.index()].successors.extend([*true_block, *false_block]);
            }
            HKind::Goto { target } => {
                self.blocks[block.index()].successors.push(*target);
            }
            _ => {}
        }
        self.instructions.push(HInstruction {
            id,
            kind,
            ty,
            inputs: SmallVec::from_slice(inputs),
            block,
            dex_pc,
            locations: None,
        });
        self.blocks[block.index()].instructions.push(id);
        id
    }

    #[inline]
    pub fn get(&self, id: InstructionId) -> &HInstruction {
        &self.instructions[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: InstructionId) -> &mut HInstruction {
        &mut self.instructions[id.index()]
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &HBasicBlock {
        &self.blocks[id.index()]
    }

    /// Blocks in layout order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn instructions(&self) -> &[HInstruction] {
        &self.instructions
    }

    /// Arguments of an invoke, without the trailing base-address input that
    /// PC-relative dispatch adds on x86.
    pub fn invoke_arguments(&self, id: InstructionId) -> &[InstructionId] {
        let inputs = &self.get(id).inputs;
        match inputs.last() {
            Some(&last) if self.get(last).kind == HKind::ComputeBaseMethodAddress => &inputs[..inputs.len() - 1],
            _ => inputs,
        }
    }

    /// The instruction following `id` in its block, if any.
    pub fn next_in_block(&self, id: InstructionId) -> Option<InstructionId> {
        let block = &self.blocks[self.get(id).block.index()];
        let pos = block.instructions.iter().position(|&i| i == id)?;
        block.instructions.get(pos + 1).copied()
    }

    /// Whether no instruction calls out of the method.
    pub fn is_leaf(&self) -> bool {
        self.instructions
            .iter()
            .all(|i| i.locations.as_ref().is_none_or(|l| !l.can_call()))
    }

    /// Check structural invariants: every block ends in control flow and
    /// inputs refer to earlier instructions.
    pub fn validate(&self) -> Result<(), String> {
        for (b, block) in self.blocks.iter().enumerate() {
            let Some(&last) = block.instructions.last() else {
                return Err(format!("block {b} is empty"));
            };
            if !self.get(last).kind.is_control_flow() {
                return Err(format!("block {b} does not end in control flow"));
            }
            for s in &block.successors {
                if s.index() >= self.blocks.len() {
                    return Err(format!("block {b} branches to missing block {}", s.0));
                }
            }
        }
        for instr in &self.instructions {
            if let Some(bad) = instr.inputs.iter().find(|i| i.index() >= self.instructions.len()) {
                return Err(format!("{} uses missing value {}", instr.id, bad));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x64::{CpuRegister, XmmRegister};

    #[test]
    fn test_build_and_validate() {
        let mut g = HGraph::new(MethodIndex(0), true);
        let entry = g.add_block();
        let a = g.add(entry, HKind::Parameter { index: 0 }, DataType::Int32, &[], 0);
        let b = g.add(entry, HKind::IntConstant(2), DataType::Int32, &[], 0);
        let sum = g.add(entry, HKind::Add, DataType::Int32, &[a, b], 1);
        g.add(entry, HKind::Return, DataType::Void, &[sum], 2);
        assert_eq!(g.num_parameters, 1);
        assert!(g.validate().is_ok());
        assert_eq!(g.next_in_block(a), Some(b));
        assert_eq!(g.get(sum).input(1), b);
    }

    #[test]
    fn test_invoke_arguments_skip_base() {
        let mut g = HGraph::new(MethodIndex(0), true);
        let entry = g.add_block();
        let base = g.add(entry, HKind::ComputeBaseMethodAddress, DataType::Int32, &[], 0);
        let a = g.add(entry, HKind::IntConstant(1), DataType::Int32, &[], 0);
        let call = g.add(
            entry,
            HKind::InvokeStaticOrDirect {
                method: MethodIndex(3),
                dispatch: DispatchInfo::via_method(MethodLoadKind::BssEntry),
            },
            DataType::Void,
            &[a, base],
            1,
        );
        g.add(entry, HKind::ReturnVoid, DataType::Void, &[], 2);
        assert_eq!(g.invoke_arguments(call), &[a]);
        assert!(HKind::NullCheck.is_check());
    }

    #[test]
    fn test_parallel_moves_compare_by_value() {
        let spill = MoveOperands {
            source: Location::Register(CpuRegister::RAX),
            destination: Location::StackSlot(8),
            ty: DataType::Int32,
        };
        let reload = MoveOperands {
            source: Location::DoubleStackSlot(16),
            destination: Location::FpuRegister(XmmRegister::XMM3),
            ty: DataType::Float64,
        };
        let mut moves = vec![spill, spill, reload];
        moves.dedup();
        assert_eq!(moves, [spill, reload]);
        assert_eq!(HKind::ParallelMove(moves.clone()), HKind::ParallelMove(vec![spill, reload]));
        assert_ne!(spill, MoveOperands { ty: DataType::Reference, ..spill });
    }

    #[test]
    fn test_validate_rejects_open_block() {
        let mut g = HGraph::new(MethodIndex(0), true);
        let entry = g.add_block();
        g.add(entry, HKind::IntConstant(1), DataType::Int32, &[], 0);
        assert!(g.validate().is_err());
    }

    #[test]
    fn test_successors_recorded() {
        let mut g = HGraph::new(MethodIndex(0), true);
        let b0 = g.add_block();
        let b1 = g.add_block();
        let b2 = g.add_block();
        let c = g.add(b0, HKind::IntConstant(1), DataType::Bool, &[], 0);
        g.add(b0, HKind::If { true_block: b1, false_block: b2 }, DataType::Void, &[c], 0);
        assert_eq!(g.block(b0).successors.as_slice(), &[b1, b2]);
    }
}
