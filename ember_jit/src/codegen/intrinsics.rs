//! Inline expansions of recognized library methods.
//!
//! The locations builder asks [`IntrinsicLocationsBuilder`] first; a `None`
//! means the call stays an ordinary invoke. Summaries it does produce are
//! marked intrinsified and later expanded by [`IntrinsicCodeGenerator`].
//! Expansions that can fail at run time (null arguments, out-of-range
//! positions, var-handle mismatches) branch to a slow path making the call
//! they replaced.

use super::allocator::{constant_bits, runtime_argument};
use super::code_generator::{heap_address, CodeGeneratorX86_64};
use super::entrypoints::QuickEntrypoint;
use super::hir::{DataType, HGraph, HInstruction, HKind, InstructionId};
use super::instruction_visitor::{AluOp, InstructionCodeGeneratorX86_64};
use super::layout::{
    array_data_offset, ARRAY_LENGTH_OFFSET, CLASS_OFFSET, FIELD_OFFSET_OFFSET, STRING_COUNT_OFFSET,
    STRING_VALUE_OFFSET, VAR_HANDLE_ACCESS_MODES_OFFSET, VAR_HANDLE_COORDINATE_TYPE0_OFFSET,
    VAR_HANDLE_FIELD_OFFSET,
};
use super::location::{CallKind, Location, LocationSummary};
use super::slow_path::{ArrayCopySlowPath, IntrinsicFallback, IntrinsicSlowPath, SavedRegisters};
use super::stack_map::SafepointKind;
use crate::backend::x64::{Address, Condition, CpuRegister, Immediate, Label, NearLabel, RegisterSet, ScaleFactor, XmmRegister};
use crate::error::{CodegenError, CodegenResult};
use crate::options::{CodegenOptions, CpuFeatures, InstructionSet};
use ember_core::{fatal, MethodIndex};
use ember_gc::ReadBarrierKind;

/// A library method with an inline expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    MathAbsInt,
    MathAbsLong,
    MathAbsFloat,
    MathAbsDouble,
    MathMinInt,
    MathMinLong,
    MathMinFloat,
    MathMinDouble,
    MathMaxInt,
    MathMaxLong,
    MathMaxFloat,
    MathMaxDouble,
    MathSqrt,
    MathRoundFloat,
    MathRoundDouble,
    MathCos,
    MathSin,
    MathTan,
    MathExp,
    MathLog,
    MathPow,
    MathAtan2,
    IntegerBitCount,
    LongBitCount,
    IntegerReverseBytes,
    LongReverseBytes,
    IntegerNumberOfLeadingZeros,
    LongNumberOfLeadingZeros,
    IntegerNumberOfTrailingZeros,
    LongNumberOfTrailingZeros,
    StringCompareTo,
    StringEquals,
    StringIndexOf,
    SystemArrayCopyChar,
    UnsafeCASInt,
    UnsafeCASLong,
    UnsafeCASObject,
    UnsafeGet,
    UnsafeGetLong,
    UnsafeGetObject,
    UnsafePut,
    UnsafePutLong,
    UnsafePutObject,
    VarHandleGet,
    VarHandleSet,
    VarHandleCompareAndSet,
    VarHandleGetAndAdd,
    VarHandleGetAndBitwiseOr,
    VarHandleGetAndBitwiseAnd,
    VarHandleGetAndBitwiseXor,
    ThreadCurrentThread,
    MemoryPeekByte,
    MemoryPeekIntNative,
    MemoryPeekLongNative,
    MemoryPokeByte,
    MemoryPokeIntNative,
    MemoryPokeLongNative,
}

impl Intrinsic {
    /// Expansions that hold a 64-bit integer in one register. Not available
    /// on x86, where longs live in register pairs.
    pub const fn needs_64bit_registers(self) -> bool {
        use Intrinsic::*;
        matches!(
            self,
            MathAbsLong
                | MathMinLong
                | MathMaxLong
                | MathRoundDouble
                | LongBitCount
                | LongReverseBytes
                | LongNumberOfLeadingZeros
                | LongNumberOfTrailingZeros
                | UnsafeCASInt
                | UnsafeCASLong
                | UnsafeCASObject
                | UnsafeGet
                | UnsafeGetLong
                | UnsafeGetObject
                | UnsafePut
                | UnsafePutLong
                | UnsafePutObject
                | MemoryPeekByte
                | MemoryPeekIntNative
                | MemoryPeekLongNative
                | MemoryPokeByte
                | MemoryPokeIntNative
                | MemoryPokeLongNative
        )
    }

    /// Expansions that load references without a read barrier.
    pub const fn reads_references_raw(self) -> bool {
        matches!(self, Intrinsic::UnsafeCASObject | Intrinsic::UnsafeGetObject)
    }

    /// Whether the operation is 64-bit wide.
    const fn is_long(self) -> bool {
        use Intrinsic::*;
        matches!(
            self,
            MathAbsLong
                | MathMinLong
                | MathMaxLong
                | MathRoundDouble
                | LongBitCount
                | LongReverseBytes
                | LongNumberOfLeadingZeros
                | LongNumberOfTrailingZeros
                | UnsafeCASLong
                | UnsafeGetLong
                | UnsafePutLong
                | MemoryPeekLongNative
                | MemoryPokeLongNative
        )
    }

    /// Runtime helper of a transcendental.
    const fn math_entrypoint(self) -> Option<QuickEntrypoint> {
        use Intrinsic::*;
        Some(match self {
            MathCos => QuickEntrypoint::Cos,
            MathSin => QuickEntrypoint::Sin,
            MathTan => QuickEntrypoint::Tan,
            MathExp => QuickEntrypoint::Exp,
            MathLog => QuickEntrypoint::Log,
            MathPow => QuickEntrypoint::Pow,
            MathAtan2 => QuickEntrypoint::Atan2,
            _ => return None,
        })
    }

    /// Ordinal of the `VarHandle.AccessMode` an operation performs.
    const fn access_mode(self) -> Option<u32> {
        use Intrinsic::*;
        Some(match self {
            VarHandleGet => 0,
            VarHandleSet => 1,
            VarHandleCompareAndSet => 8,
            VarHandleGetAndAdd => 19,
            VarHandleGetAndBitwiseOr => 22,
            VarHandleGetAndBitwiseAnd => 25,
            VarHandleGetAndBitwiseXor => 28,
            _ => return None,
        })
    }
}

/// Canonical quiet NaNs returned by min/max.
const FLOAT_NAN_BITS: i32 = 0x7FC0_0000;
const DOUBLE_NAN_BITS: i64 = 0x7FF8_0000_0000_0000;

/// `roundss`/`roundsd` mode: toward negative infinity.
const ROUND_FLOOR: i64 = 1;

// =============================================================================
// Locations
// =============================================================================

/// Decides which intrinsic calls are expanded and with what constraints.
pub struct IntrinsicLocationsBuilder<'a> {
    graph: &'a HGraph,
    options: &'a CodegenOptions,
    isa: InstructionSet,
}

impl<'a> IntrinsicLocationsBuilder<'a> {
    pub fn new(graph: &'a HGraph, options: &'a CodegenOptions) -> Self {
        Self {
            graph,
            options,
            isa: options.instruction_set,
        }
    }

    /// Summary for an expanded call to `intrinsic`, or `None` to keep the
    /// call.
    pub fn try_dispatch(&self, id: InstructionId, intrinsic: Intrinsic) -> Option<LocationSummary> {
        use Intrinsic::*;
        let instr = self.graph.get(id);
        let x86 = self.isa == InstructionSet::X86;
        if x86 && intrinsic.needs_64bit_registers() {
            return None;
        }
        if self.options.read_barrier != ReadBarrierKind::None && intrinsic.reads_references_raw() {
            return None;
        }
        let n = self.graph.invoke_arguments(id).len();
        let summary = match intrinsic {
            MathAbsInt | MathAbsLong => {
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(0, Location::requires_register());
                s.add_temp(Location::requires_register());
                s.set_out(Location::same_as_first_input(), true);
                s
            }
            MathAbsFloat | MathAbsDouble => {
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(0, Location::requires_fpu_register());
                s.add_temp(Location::requires_fpu_register());
                s.set_out(Location::same_as_first_input(), true);
                s
            }
            MathMinInt | MathMinLong | MathMaxInt | MathMaxLong => {
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(0, Location::requires_register());
                s.set_in_at(1, Location::requires_register());
                s.set_out(Location::same_as_first_input(), true);
                s
            }
            MathMinFloat | MathMinDouble | MathMaxFloat | MathMaxDouble => {
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(0, Location::requires_fpu_register());
                s.set_in_at(1, Location::requires_fpu_register());
                s.set_out(Location::same_as_first_input(), true);
                s
            }
            MathSqrt => {
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(0, Location::requires_fpu_register());
                s.set_out(Location::requires_fpu_register(), false);
                s
            }
            MathRoundFloat | MathRoundDouble => {
                if !self.options.has(CpuFeatures::SSE4_1) {
                    return None;
                }
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(0, Location::requires_fpu_register());
                s.add_temp(Location::requires_fpu_register());
                s.add_temp(Location::requires_fpu_register());
                s.set_out(Location::requires_register(), true);
                s
            }
            MathCos | MathSin | MathTan | MathExp | MathLog | MathPow | MathAtan2 => {
                let mut s = LocationSummary::intrinsified(n, CallKind::CallOnMainOnly);
                for i in 0..n {
                    s.set_in_at(i, Location::FpuRegister(fpu_argument(i)));
                }
                s.set_out(Location::FpuRegister(XmmRegister::XMM0), false);
                s
            }
            IntegerBitCount | LongBitCount => {
                if !self.options.has(CpuFeatures::POPCNT) {
                    return None;
                }
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(0, Location::requires_register());
                s.set_out(Location::requires_register(), false);
                s
            }
            IntegerReverseBytes | LongReverseBytes => {
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(0, Location::requires_register());
                s.set_out(Location::same_as_first_input(), true);
                s
            }
            IntegerNumberOfLeadingZeros
            | LongNumberOfLeadingZeros
            | IntegerNumberOfTrailingZeros
            | LongNumberOfTrailingZeros => {
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(0, Location::requires_register());
                s.set_out(Location::requires_register(), true);
                s
            }
            StringCompareTo => {
                let mut s = LocationSummary::intrinsified(n, CallKind::CallOnMainAndSlowPath);
                s.set_in_at(0, Location::Register(runtime_argument(self.isa, 0)));
                s.set_in_at(1, Location::Register(runtime_argument(self.isa, 1)));
                s.set_out(Location::Register(CpuRegister::RAX), false);
                s
            }
            StringEquals => {
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(0, Location::Register(CpuRegister::RSI));
                s.set_in_at(1, Location::Register(CpuRegister::RDI));
                s.add_temp(Location::Register(CpuRegister::RCX));
                s.set_out(Location::requires_register(), true);
                s
            }
            StringIndexOf => {
                if let Some(c) = self.constant_input(instr, 1) {
                    if !(0..=0xFFFF).contains(&c) {
                        return None;
                    }
                }
                let mut s = LocationSummary::intrinsified(n, CallKind::CallOnSlowPath);
                s.set_in_at(0, Location::Register(CpuRegister::RDI));
                s.set_in_at(1, Location::Register(CpuRegister::RAX));
                s.add_temp(Location::Register(CpuRegister::RCX));
                s.add_temp(Location::Register(CpuRegister::RDX));
                s.set_out(Location::requires_register(), true);
                s
            }
            SystemArrayCopyChar => {
                // Three fixed string registers leave too few for five
                // operands on x86.
                if x86 {
                    return None;
                }
                let mut s = LocationSummary::intrinsified(n, CallKind::CallOnSlowPath);
                s.set_in_at(0, Location::requires_register());
                s.set_in_at(1, Location::register_or_constant());
                s.set_in_at(2, Location::requires_register());
                s.set_in_at(3, Location::register_or_constant());
                s.set_in_at(4, Location::register_or_constant());
                s.add_temp(Location::Register(CpuRegister::RSI));
                s.add_temp(Location::Register(CpuRegister::RDI));
                s.add_temp(Location::Register(CpuRegister::RCX));
                s
            }
            UnsafeCASInt | UnsafeCASLong | UnsafeCASObject => {
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(1, Location::requires_register());
                s.set_in_at(2, Location::requires_register());
                s.set_in_at(3, Location::Register(CpuRegister::RAX));
                s.set_in_at(4, Location::requires_register());
                if intrinsic == UnsafeCASObject {
                    s.add_temp(Location::requires_register());
                    s.add_temp(Location::requires_register());
                }
                s.set_out(Location::requires_register(), true);
                s
            }
            UnsafeGet | UnsafeGetLong | UnsafeGetObject => {
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(1, Location::requires_register());
                s.set_in_at(2, Location::requires_register());
                s.set_out(Location::requires_register(), true);
                s
            }
            UnsafePut | UnsafePutLong | UnsafePutObject => {
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(1, Location::requires_register());
                s.set_in_at(2, Location::requires_register());
                s.set_in_at(3, Location::requires_register());
                if intrinsic == UnsafePutObject {
                    s.add_temp(Location::requires_register());
                    s.add_temp(Location::requires_register());
                }
                s
            }
            VarHandleGet
            | VarHandleSet
            | VarHandleCompareAndSet
            | VarHandleGetAndAdd
            | VarHandleGetAndBitwiseOr
            | VarHandleGetAndBitwiseAnd
            | VarHandleGetAndBitwiseXor => return self.var_handle(instr, intrinsic, n),
            ThreadCurrentThread => {
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_out(Location::requires_register(), false);
                s
            }
            MemoryPeekByte | MemoryPeekIntNative | MemoryPeekLongNative => {
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(0, Location::requires_register());
                s.set_out(Location::requires_register(), false);
                s
            }
            MemoryPokeByte | MemoryPokeIntNative | MemoryPokeLongNative => {
                let mut s = LocationSummary::intrinsified(n, CallKind::NoCall);
                s.set_in_at(0, Location::requires_register());
                let value = match self.constant_input(instr, 1) {
                    Some(c) if !intrinsic.is_long() || ember_core::bits::is_int32(c) => Location::Constant(c),
                    _ => Location::requires_register(),
                };
                s.set_in_at(1, value);
                s
            }
        };
        Some(summary)
    }

    fn constant_input(&self, instr: &HInstruction, i: usize) -> Option<i64> {
        constant_bits(&self.graph.get(instr.input(i)).kind)
    }

    fn input_type(&self, instr: &HInstruction, i: usize) -> DataType {
        self.graph.get(instr.input(i)).ty
    }

    /// Field var-handle access on an instance. Inputs are the handle, the
    /// receiver, then the operation's values.
    fn var_handle(&self, instr: &HInstruction, intrinsic: Intrinsic, n: usize) -> Option<LocationSummary> {
        use Intrinsic::*;
        if n < 2 || !self.input_type(instr, 1).is_reference() {
            return None;
        }
        let ty = match intrinsic {
            VarHandleGet => instr.ty,
            VarHandleCompareAndSet => self.input_type(instr, 3),
            _ => self.input_type(instr, 2),
        };
        let x86 = self.isa == InstructionSet::X86;
        if ty == DataType::Int64 && x86 {
            return None;
        }
        let barrier = self.options.read_barrier != ReadBarrierKind::None;
        let supported = match intrinsic {
            VarHandleGet => ty != DataType::Void && !(ty.is_reference() && barrier),
            VarHandleSet => ty != DataType::Void,
            VarHandleCompareAndSet => {
                matches!(ty, DataType::Int32 | DataType::Int64) || (ty.is_reference() && !barrier && !x86)
            }
            _ => matches!(ty, DataType::Int32 | DataType::Int64),
        };
        if !supported {
            return None;
        }

        let mut s = LocationSummary::intrinsified(n, CallKind::CallOnSlowPath);
        s.set_in_at(0, Location::requires_register());
        s.set_in_at(1, Location::requires_register());
        // Field offset.
        s.add_temp(Location::requires_register());
        let value = if ty.is_floating_point() {
            Location::requires_fpu_register()
        } else if matches!(ty, DataType::Bool | DataType::Int8) {
            Location::requires_byte_register()
        } else {
            Location::requires_register()
        };
        match intrinsic {
            VarHandleGet => {
                let out = if ty.is_floating_point() {
                    Location::requires_fpu_register()
                } else {
                    Location::requires_register()
                };
                s.set_out(out, true);
            }
            VarHandleSet => {
                s.set_in_at(2, value);
                if ty.is_reference() {
                    s.add_temp(Location::requires_register());
                    s.add_temp(Location::requires_byte_register());
                }
            }
            VarHandleCompareAndSet => {
                s.set_in_at(2, Location::Register(CpuRegister::RAX));
                s.set_in_at(3, Location::requires_register());
                if ty.is_reference() {
                    s.add_temp(Location::requires_register());
                    s.add_temp(Location::requires_register());
                }
                s.set_out(Location::requires_byte_register(), true);
            }
            VarHandleGetAndAdd => {
                s.set_in_at(2, Location::requires_register());
                s.set_out(Location::requires_register(), true);
            }
            _ => {
                s.set_in_at(2, Location::requires_register());
                s.add_temp(Location::requires_register());
                s.set_out(Location::Register(CpuRegister::RAX), true);
            }
        }
        Some(s)
    }
}

/// Runtime convention for floating-point helper arguments.
fn fpu_argument(i: usize) -> XmmRegister {
    match i {
        0 => XmmRegister::XMM0,
        1 => XmmRegister::XMM1,
        _ => fatal!("math helper argument {}", i),
    }
}

// =============================================================================
// Code
// =============================================================================

/// Emits the expansion of an intrinsified call.
pub struct IntrinsicCodeGenerator<'a, 'g> {
    cg: &'a mut CodeGeneratorX86_64<'g>,
}

impl<'a, 'g> IntrinsicCodeGenerator<'a, 'g> {
    pub fn new(cg: &'a mut CodeGeneratorX86_64<'g>) -> Self {
        Self { cg }
    }

    pub fn dispatch(&mut self, id: InstructionId, intrinsic: Intrinsic) -> CodegenResult<()> {
        use Intrinsic::*;
        let graph = self.cg.graph;
        let instr = graph.get(id);
        let wide = intrinsic.is_long();
        match intrinsic {
            MathAbsInt | MathAbsLong => self.abs_int(instr, wide),
            MathAbsFloat => self.abs_fp(instr, false),
            MathAbsDouble => self.abs_fp(instr, true),
            MathMinInt | MathMinLong => self.min_max_int(instr, true, wide),
            MathMaxInt | MathMaxLong => self.min_max_int(instr, false, wide),
            MathMinFloat => self.min_max_fp(instr, true, false),
            MathMinDouble => self.min_max_fp(instr, true, true),
            MathMaxFloat => self.min_max_fp(instr, false, false),
            MathMaxDouble => self.min_max_fp(instr, false, true),
            MathSqrt => {
                let locations = instr.locations();
                let (out, input) = (locations.out().xmm(), locations.in_at(0).xmm());
                if instr.ty == DataType::Float32 {
                    self.cg.asm.sqrtss_rr(out, input);
                } else {
                    self.cg.asm.sqrtsd_rr(out, input);
                }
            }
            MathRoundFloat | MathRoundDouble => {
                if !self.cg.options.has(CpuFeatures::SSE4_1) {
                    return Err(CodegenError::unsupported("Math.round without SSE4.1", self.cg.isa));
                }
                self.round(instr, wide);
            }
            MathCos | MathSin | MathTan | MathExp | MathLog | MathPow | MathAtan2 => {
                let Some(entrypoint) = intrinsic.math_entrypoint() else {
                    fatal!("{:?} has no runtime helper", intrinsic);
                };
                self.cg
                    .invoke_runtime(entrypoint, id, SafepointKind::Call, RegisterSet::EMPTY);
            }
            IntegerBitCount | LongBitCount => {
                let locations = instr.locations();
                let (out, input) = (locations.out().reg(), locations.in_at(0).reg());
                if wide {
                    self.cg.asm.popcntq(out, input);
                } else {
                    self.cg.asm.popcntl(out, input);
                }
            }
            IntegerReverseBytes | LongReverseBytes => {
                let out = instr.locations().out().reg();
                if wide {
                    self.cg.asm.bswapq(out);
                } else {
                    self.cg.asm.bswapl(out);
                }
            }
            IntegerNumberOfLeadingZeros | LongNumberOfLeadingZeros => self.leading_zeros(instr, wide),
            IntegerNumberOfTrailingZeros | LongNumberOfTrailingZeros => self.trailing_zeros(instr, wide),
            StringCompareTo => self.string_compare_to(instr),
            StringEquals => self.string_equals(instr),
            StringIndexOf => self.string_index_of(instr),
            SystemArrayCopyChar => self.array_copy_char(instr),
            UnsafeCASInt | UnsafeCASLong | UnsafeCASObject => self.unsafe_cas(instr, intrinsic),
            UnsafeGet | UnsafeGetLong | UnsafeGetObject => self.unsafe_get(instr, intrinsic),
            UnsafePut | UnsafePutLong | UnsafePutObject => self.unsafe_put(instr, intrinsic),
            VarHandleGet
            | VarHandleSet
            | VarHandleCompareAndSet
            | VarHandleGetAndAdd
            | VarHandleGetAndBitwiseOr
            | VarHandleGetAndBitwiseAnd
            | VarHandleGetAndBitwiseXor => self.var_handle(instr, intrinsic),
            ThreadCurrentThread => {
                let out = instr.locations().out().reg();
                let peer = Address::absolute(self.cg.thread.peer());
                self.cg.thread_asm().movl_rm(out, &peer);
            }
            MemoryPeekByte | MemoryPeekIntNative | MemoryPeekLongNative => {
                let locations = instr.locations();
                let addr = Address::new(locations.in_at(0).reg(), 0);
                let out = locations.out().reg();
                match intrinsic {
                    MemoryPeekByte => self.cg.asm.movsxb_rm(out, &addr),
                    MemoryPeekIntNative => self.cg.asm.movl_rm(out, &addr),
                    _ => self.cg.asm.movq_rm(out, &addr),
                }
            }
            MemoryPokeByte | MemoryPokeIntNative | MemoryPokeLongNative => {
                let locations = instr.locations();
                let addr = Address::new(locations.in_at(0).reg(), 0);
                let asm = &mut self.cg.asm;
                match (intrinsic, locations.in_at(1)) {
                    (MemoryPokeByte, Location::Constant(c)) => asm.movb_mi(&addr, Immediate(c as i8 as i64)),
                    (MemoryPokeByte, value) => asm.movb_mr(&addr, value.reg()),
                    (MemoryPokeIntNative, Location::Constant(c)) => asm.movl_mi(&addr, Immediate(c as i32 as i64)),
                    (MemoryPokeIntNative, value) => asm.movl_mr(&addr, value.reg()),
                    (_, Location::Constant(c)) => asm.movq_mi(&addr, Immediate(c)),
                    (_, value) => asm.movq_mr(&addr, value.reg()),
                }
            }
        }
        Ok(())
    }

    fn fallback_method(instr: &HInstruction) -> MethodIndex {
        match instr.kind {
            HKind::InvokeIntrinsic { method, .. } => method,
            _ => fatal!("{} is not an intrinsic call", instr.id),
        }
    }

    /// Slow path calling the method itself with the current argument
    /// locations.
    fn add_call_fallback(&mut self, instr: &HInstruction) -> usize {
        let graph = self.cg.graph;
        let locations = instr.locations();
        let args = graph
            .invoke_arguments(instr.id)
            .iter()
            .enumerate()
            .map(|(i, &arg)| (locations.in_at(i), graph.get(arg).ty))
            .collect();
        let out = if instr.ty == DataType::Void {
            Location::Invalid
        } else {
            locations.out()
        };
        self.cg.add_slow_path(Box::new(IntrinsicSlowPath::new(
            instr.id,
            IntrinsicFallback::Polymorphic(Self::fallback_method(instr)),
            args,
            out,
            instr.ty,
            SavedRegisters::of(locations),
        )))
    }

    // =========================================================================
    // Math
    // =========================================================================

    fn abs_int(&mut self, instr: &HInstruction, wide: bool) {
        let locations = instr.locations();
        let out = locations.out().reg();
        let mask = locations.temp(0).reg();
        let asm = &mut self.cg.asm;
        if wide {
            asm.movq_rr(mask, out);
            asm.sarq_ri(mask, Immediate(63));
            asm.xorq_rr(out, mask);
            asm.subq_rr(out, mask);
        } else {
            asm.movl_rr(mask, out);
            asm.sarl_ri(mask, Immediate(31));
            asm.xorl_rr(out, mask);
            asm.subl_rr(out, mask);
        }
    }

    fn abs_fp(&mut self, instr: &HInstruction, double: bool) {
        let locations = instr.locations();
        let out = locations.out().xmm();
        let mask = locations.temp(0).xmm();
        let asm = &mut self.cg.asm;
        if double {
            let literal = asm.literal_int64(i64::MAX);
            asm.movsd_rm(mask, &literal);
            asm.andpd_rr(out, mask);
        } else {
            let literal = asm.literal_int32(i32::MAX);
            asm.movss_rm(mask, &literal);
            asm.andps_rr(out, mask);
        }
    }

    fn min_max_int(&mut self, instr: &HInstruction, is_min: bool, wide: bool) {
        let locations = instr.locations();
        let out = locations.out().reg();
        let other = locations.in_at(1).reg();
        let take_other = if is_min { Condition::Greater } else { Condition::Less };
        let asm = &mut self.cg.asm;
        if wide {
            asm.cmpq_rr(out, other);
            asm.cmovq(take_other, out, other);
        } else {
            asm.cmpl_rr(out, other);
            asm.cmovl(take_other, out, other);
        }
    }

    /// Java min/max: NaN wins, and -0.0 orders below +0.0.
    fn min_max_fp(&mut self, instr: &HInstruction, is_min: bool, double: bool) {
        let locations = instr.locations();
        let out = locations.out().xmm();
        let other = locations.in_at(1).xmm();
        let mut nan = NearLabel::new();
        let mut equal = NearLabel::new();
        let mut done = NearLabel::new();
        let asm = &mut self.cg.asm;
        if double {
            asm.ucomisd_rr(out, other);
        } else {
            asm.ucomiss_rr(out, other);
        }
        asm.j_near(Condition::ParityEven, &mut nan);
        asm.j_near(Condition::Equal, &mut equal);
        asm.j_near(if is_min { Condition::Below } else { Condition::Above }, &mut done);
        asm.movaps_rr(out, other);
        asm.jmp_near(&mut done);

        // Equal values differ at most in the sign of zero.
        asm.bind_near(&mut equal);
        match (is_min, double) {
            (true, false) => asm.orps_rr(out, other),
            (true, true) => asm.orpd_rr(out, other),
            (false, false) => asm.andps_rr(out, other),
            (false, true) => asm.andpd_rr(out, other),
        }
        asm.jmp_near(&mut done);

        asm.bind_near(&mut nan);
        if double {
            let literal = asm.literal_int64(DOUBLE_NAN_BITS);
            asm.movsd_rm(out, &literal);
        } else {
            let literal = asm.literal_int32(FLOAT_NAN_BITS);
            asm.movss_rm(out, &literal);
        }
        asm.bind_near(&mut done);
    }

    /// `floor(x)`, plus one when the fraction is at least one half, then
    /// the saturating conversion.
    fn round(&mut self, instr: &HInstruction, double: bool) {
        let locations = instr.locations();
        let input = locations.in_at(0).xmm();
        let out = locations.out().reg();
        let floor = locations.temp(0).xmm();
        let scratch = locations.temp(1).xmm();
        let mut skip = NearLabel::new();
        let asm = &mut self.cg.asm;
        asm.movaps_rr(floor, input);
        asm.movaps_rr(scratch, input);
        if double {
            asm.roundsd(floor, floor, Immediate(ROUND_FLOOR));
            asm.subsd_rr(scratch, floor);
            let half = asm.literal_double(0.5);
            asm.comisd_rm(scratch, &half);
            asm.j_near(Condition::Below, &mut skip);
            let one = asm.literal_double(1.0);
            asm.addsd_rm(floor, &one);
        } else {
            asm.roundss(floor, floor, Immediate(ROUND_FLOOR));
            asm.subss_rr(scratch, floor);
            let half = asm.literal_float(0.5);
            asm.comiss_rm(scratch, &half);
            asm.j_near(Condition::Below, &mut skip);
            let one = asm.literal_float(1.0);
            asm.addss_rm(floor, &one);
        }
        asm.bind_near(&mut skip);
        let (from, to) = if double {
            (DataType::Float64, DataType::Int64)
        } else {
            (DataType::Float32, DataType::Int32)
        };
        InstructionCodeGeneratorX86_64::new(self.cg).generate_fp_to_int(from, to, floor, out, scratch);
    }

    // =========================================================================
    // Bits
    // =========================================================================

    fn leading_zeros(&mut self, instr: &HInstruction, wide: bool) {
        let locations = instr.locations();
        let input = locations.in_at(0).reg();
        let out = locations.out().reg();
        let width = if wide { 64 } else { 32 };
        if self.cg.options.has(CpuFeatures::LZCNT) {
            if wide {
                self.cg.asm.lzcntq(out, input);
            } else {
                self.cg.asm.lzcntl(out, input);
            }
            return;
        }
        let mut zero = NearLabel::new();
        let mut done = NearLabel::new();
        let asm = &mut self.cg.asm;
        if wide {
            asm.bsrq(out, input);
        } else {
            asm.bsrl(out, input);
        }
        asm.j_near(Condition::Equal, &mut zero);
        asm.xorl_ri(out, Immediate(width - 1));
        asm.jmp_near(&mut done);
        asm.bind_near(&mut zero);
        asm.movl_ri(out, Immediate(width));
        asm.bind_near(&mut done);
    }

    fn trailing_zeros(&mut self, instr: &HInstruction, wide: bool) {
        let locations = instr.locations();
        let input = locations.in_at(0).reg();
        let out = locations.out().reg();
        if self.cg.options.has(CpuFeatures::BMI1) {
            if wide {
                self.cg.asm.tzcntq(out, input);
            } else {
                self.cg.asm.tzcntl(out, input);
            }
            return;
        }
        let mut done = NearLabel::new();
        let asm = &mut self.cg.asm;
        if wide {
            asm.bsfq(out, input);
        } else {
            asm.bsfl(out, input);
        }
        asm.j_near(Condition::NotEqual, &mut done);
        asm.movl_ri(out, Immediate(if wide { 64 } else { 32 }));
        asm.bind_near(&mut done);
    }

    // =========================================================================
    // Strings and arrays
    // =========================================================================

    fn string_compare_to(&mut self, instr: &HInstruction) {
        let argument = instr.locations().in_at(1).reg();
        let slow = self.add_call_fallback(instr);
        self.cg.asm.testl_rr(argument, argument);
        self.cg.jump_to_slow_path(Some(Condition::Equal), slow);
        self.cg
            .invoke_runtime(QuickEntrypoint::StringCompareTo, instr.id, SafepointKind::Call, RegisterSet::EMPTY);
        self.cg.bind_slow_path_exit(slow);
    }

    /// Class check, length check, then a whole-word `repe cmps` over the
    /// character data.
    fn string_equals(&mut self, instr: &HInstruction) {
        let locations = instr.locations();
        let string = locations.in_at(0).reg();
        let argument = locations.in_at(1).reg();
        let count = locations.temp(0).reg();
        let out = locations.out().reg();
        let x86 = self.cg.isa == InstructionSet::X86;
        let mut return_true = NearLabel::new();
        let mut return_false = NearLabel::new();
        let mut end = NearLabel::new();

        let asm = &mut self.cg.asm;
        asm.testl_rr(argument, argument);
        asm.j_near(Condition::Equal, &mut return_false);
        asm.cmpl_rr(string, argument);
        asm.j_near(Condition::Equal, &mut return_true);
        // Poisoned class references compare the same way as plain ones.
        asm.movl_rm(count, &Address::new(string, CLASS_OFFSET));
        asm.cmpl_rm(count, &Address::new(argument, CLASS_OFFSET));
        asm.j_near(Condition::NotEqual, &mut return_false);
        asm.movl_rm(count, &Address::new(string, STRING_COUNT_OFFSET));
        asm.cmpl_rm(count, &Address::new(argument, STRING_COUNT_OFFSET));
        asm.j_near(Condition::NotEqual, &mut return_false);
        asm.testl_rr(count, count);
        asm.j_near(Condition::Equal, &mut return_true);

        self.cg.lea_pointer(string, &Address::new(string, STRING_VALUE_OFFSET));
        self.cg.lea_pointer(argument, &Address::new(argument, STRING_VALUE_OFFSET));
        let asm = &mut self.cg.asm;
        // Characters to words, rounding up into the zeroed padding.
        if x86 {
            asm.addl_ri(count, Immediate(1));
            asm.shrl_ri(count, Immediate(1));
            asm.repe_cmpsl();
        } else {
            asm.addl_ri(count, Immediate(3));
            asm.shrl_ri(count, Immediate(2));
            asm.repe_cmpsq();
        }
        asm.j_near(Condition::NotEqual, &mut return_false);

        asm.bind_near(&mut return_true);
        asm.movl_ri(out, Immediate(1));
        asm.jmp_near(&mut end);
        asm.bind_near(&mut return_false);
        asm.xorl_rr(out, out);
        asm.bind_near(&mut end);
    }

    /// `indexOf(char)` with `repne scasw`. Supplementary code points take
    /// the call.
    fn string_index_of(&mut self, instr: &HInstruction) {
        let locations = instr.locations();
        let string = locations.in_at(0).reg();
        let ch = locations.in_at(1).reg();
        let count = locations.temp(0).reg();
        let base = locations.temp(1).reg();
        let out = locations.out().reg();
        let known_char = constant_bits(&self.cg.graph.get(instr.input(1)).kind).is_some();

        let slow = (!known_char).then(|| {
            let slow = self.add_call_fallback(instr);
            self.cg.asm.cmpl_ri(ch, Immediate(0xFFFF));
            self.cg.jump_to_slow_path(Some(Condition::Above), slow);
            slow
        });

        let mut not_found = NearLabel::new();
        let mut done = NearLabel::new();
        self.cg.asm.movl_rm(count, &Address::new(string, STRING_COUNT_OFFSET));
        self.cg.asm.testl_rr(count, count);
        self.cg.asm.j_near(Condition::Equal, &mut not_found);
        self.cg.move_register(base, string);
        self.cg.lea_pointer(string, &Address::new(string, STRING_VALUE_OFFSET));
        let asm = &mut self.cg.asm;
        asm.repne_scasw();
        asm.j_near(Condition::NotEqual, &mut not_found);
        // The scan stops one past the match.
        asm.movl_rm(out, &Address::new(base, STRING_COUNT_OFFSET));
        asm.subl_rr(out, count);
        asm.decl(out);
        asm.jmp_near(&mut done);
        asm.bind_near(&mut not_found);
        asm.movl_ri(out, Immediate(-1));
        asm.bind_near(&mut done);
        if let Some(slow) = slow {
            self.cg.bind_slow_path_exit(slow);
        }
    }

    /// `System.arraycopy(char[], int, char[], int, int)`: range checks, then
    /// `rep movsw`. Overlapping copies within one array take the runtime
    /// path.
    fn array_copy_char(&mut self, instr: &HInstruction) {
        let locations = instr.locations();
        let args = [
            locations.in_at(0),
            locations.in_at(1),
            locations.in_at(2),
            locations.in_at(3),
            locations.in_at(4),
        ];
        let [src, src_pos, dest, dest_pos, length] = args;
        let (src, dest) = (src.reg(), dest.reg());
        let rsi = locations.temp(0).reg();
        let rdi = locations.temp(1).reg();
        let rcx = locations.temp(2).reg();
        let slow = self.cg.add_slow_path(Box::new(ArrayCopySlowPath::new(
            instr.id,
            args,
            SavedRegisters::of(locations),
        )));

        for array in [src, dest] {
            self.cg.asm.testl_rr(array, array);
            self.cg.jump_to_slow_path(Some(Condition::Equal), slow);
        }
        self.cg.asm.cmpl_rr(src, dest);
        self.cg.jump_to_slow_path(Some(Condition::Equal), slow);
        for value in [src_pos, dest_pos, length] {
            self.check_non_negative(value, slow);
        }
        self.check_range(src, src_pos, length, rcx, slow);
        self.check_range(dest, dest_pos, length, rcx, slow);

        let data = array_data_offset(DataType::Uint16);
        self.cg
            .lea_pointer(rsi, &heap_address(src, Some(src_pos), ScaleFactor::Times2, data));
        self.cg
            .lea_pointer(rdi, &heap_address(dest, Some(dest_pos), ScaleFactor::Times2, data));
        match length {
            Location::Constant(c) => self.cg.asm.movl_ri(rcx, Immediate(c as i32 as i64)),
            other => self.cg.asm.movl_rr(rcx, other.reg()),
        }
        self.cg.asm.rep_movsw();
        self.cg.bind_slow_path_exit(slow);
    }

    fn check_non_negative(&mut self, value: Location, slow: usize) {
        match value {
            Location::Constant(c) if (c as i32) < 0 => self.cg.jump_to_slow_path(None, slow),
            Location::Constant(_) => {}
            other => {
                let reg = other.reg();
                self.cg.asm.testl_rr(reg, reg);
                self.cg.jump_to_slow_path(Some(Condition::Less), slow);
            }
        }
    }

    /// `array.length - pos >= length`, signed.
    fn check_range(&mut self, array: CpuRegister, pos: Location, length: Location, temp: CpuRegister, slow: usize) {
        let asm = &mut self.cg.asm;
        asm.movl_rm(temp, &Address::new(array, ARRAY_LENGTH_OFFSET));
        match pos {
            Location::Constant(0) => {}
            Location::Constant(p) => asm.subl_ri(temp, Immediate(p as i32 as i64)),
            other => asm.subl_rr(temp, other.reg()),
        }
        match length {
            Location::Constant(l) => asm.cmpl_ri(temp, Immediate(l as i32 as i64)),
            other => asm.cmpl_rr(temp, other.reg()),
        }
        self.cg.jump_to_slow_path(Some(Condition::Less), slow);
    }

    // =========================================================================
    // Unsafe
    // =========================================================================

    fn unsafe_cas(&mut self, instr: &HInstruction, intrinsic: Intrinsic) {
        let locations = instr.locations();
        let obj = locations.in_at(1).reg();
        let offset = locations.in_at(2).reg();
        let expected = locations.in_at(3).reg();
        let mut value = locations.in_at(4).reg();
        let out = locations.out().reg();
        let addr = Address::indexed(obj, offset, ScaleFactor::Times1, 0);
        if intrinsic == Intrinsic::UnsafeCASObject {
            let temp = locations.temp(0).reg();
            let card = locations.temp(1).reg();
            self.cg.mark_gc_card(temp, card, obj, value, true);
            if self.cg.options.heap_poisoning {
                self.cg.maybe_poison_heap_reference(expected);
                self.cg.asm.movl_rr(temp, value);
                self.cg.maybe_poison_heap_reference(temp);
                value = temp;
            }
        }
        let asm = &mut self.cg.asm;
        if intrinsic == Intrinsic::UnsafeCASLong {
            asm.lock().cmpxchgq(&addr, value);
        } else {
            asm.lock().cmpxchgl(&addr, value);
        }
        asm.setcc(Condition::Equal, out);
        asm.movzxb_rr(out, out);
    }

    fn unsafe_get(&mut self, instr: &HInstruction, intrinsic: Intrinsic) {
        let locations = instr.locations();
        let addr = Address::indexed(locations.in_at(1).reg(), locations.in_at(2).reg(), ScaleFactor::Times1, 0);
        let out = locations.out().reg();
        if intrinsic == Intrinsic::UnsafeGetLong {
            self.cg.asm.movq_rm(out, &addr);
        } else {
            self.cg.asm.movl_rm(out, &addr);
        }
        if intrinsic == Intrinsic::UnsafeGetObject {
            self.cg.maybe_unpoison_heap_reference(out);
        }
    }

    fn unsafe_put(&mut self, instr: &HInstruction, intrinsic: Intrinsic) {
        let locations = instr.locations();
        let obj = locations.in_at(1).reg();
        let addr = Address::indexed(obj, locations.in_at(2).reg(), ScaleFactor::Times1, 0);
        let value = locations.in_at(3).reg();
        match intrinsic {
            Intrinsic::UnsafePutLong => self.cg.asm.movq_mr(&addr, value),
            Intrinsic::UnsafePutObject => {
                let temp = locations.temp(0).reg();
                let card = locations.temp(1).reg();
                if self.cg.options.heap_poisoning {
                    self.cg.asm.movl_rr(temp, value);
                    self.cg.maybe_poison_heap_reference(temp);
                    self.cg.asm.movl_mr(&addr, temp);
                } else {
                    self.cg.asm.movl_mr(&addr, value);
                }
                self.cg.mark_gc_card(temp, card, obj, value, true);
            }
            _ => self.cg.asm.movl_mr(&addr, value),
        }
    }

    // =========================================================================
    // VarHandle
    // =========================================================================

    /// Field var-handle access. The fast path requires the access mode to
    /// be supported and the receiver's class to match the handle's
    /// coordinate exactly; anything else makes the call.
    fn var_handle(&mut self, instr: &HInstruction, intrinsic: Intrinsic) {
        let Some(mode) = intrinsic.access_mode() else {
            fatal!("{:?} is not a var-handle operation", intrinsic);
        };
        let graph = self.cg.graph;
        let locations = instr.locations();
        let handle = locations.in_at(0).reg();
        let obj = locations.in_at(1).reg();
        let offset = locations.temp(0).reg();
        let slow = self.add_call_fallback(instr);

        self.cg.asm.testl_mi(
            &Address::new(handle, VAR_HANDLE_ACCESS_MODES_OFFSET),
            Immediate(1 << mode),
        );
        self.cg.jump_to_slow_path(Some(Condition::Equal), slow);
        self.cg.asm.testl_rr(obj, obj);
        self.cg.jump_to_slow_path(Some(Condition::Equal), slow);
        // Both class references carry the same poisoning.
        self.cg.asm.movl_rm(offset, &Address::new(obj, CLASS_OFFSET));
        self.cg
            .asm
            .cmpl_rm(offset, &Address::new(handle, VAR_HANDLE_COORDINATE_TYPE0_OFFSET));
        self.cg.jump_to_slow_path(Some(Condition::NotEqual), slow);
        self.cg.load_pointer(offset, &Address::new(handle, VAR_HANDLE_FIELD_OFFSET));
        self.cg.asm.movl_rm(offset, &Address::new(offset, FIELD_OFFSET_OFFSET));

        let field = Some(Location::Register(offset));
        let addr = Address::indexed(obj, offset, ScaleFactor::Times1, 0);
        match intrinsic {
            Intrinsic::VarHandleGet => {
                let out = locations.out();
                self.cg
                    .load_from_offset(instr.ty, out, obj, field, ScaleFactor::Times1, 0);
                if instr.ty.is_reference() {
                    self.cg.maybe_unpoison_heap_reference(out.reg());
                }
            }
            Intrinsic::VarHandleSet => {
                let ty = graph.get(instr.input(2)).ty;
                let value = locations.in_at(2);
                if ty.is_reference() {
                    let temp = locations.temp(1).reg();
                    let card = locations.temp(2).reg();
                    let mut stored = value;
                    if self.cg.options.heap_poisoning {
                        self.cg.asm.movl_rr(temp, value.reg());
                        self.cg.maybe_poison_heap_reference(temp);
                        stored = Location::Register(temp);
                    }
                    self.cg
                        .store_to_offset(ty, stored, obj, field, ScaleFactor::Times1, 0);
                    self.cg.mark_gc_card(temp, card, obj, value.reg(), true);
                } else {
                    self.cg
                        .store_to_offset(ty, value, obj, field, ScaleFactor::Times1, 0);
                }
            }
            Intrinsic::VarHandleCompareAndSet => {
                let ty = graph.get(instr.input(3)).ty;
                let expected = locations.in_at(2).reg();
                let mut value = locations.in_at(3).reg();
                if ty.is_reference() {
                    let temp = locations.temp(1).reg();
                    let card = locations.temp(2).reg();
                    self.cg.mark_gc_card(temp, card, obj, value, true);
                    if self.cg.options.heap_poisoning {
                        self.cg.maybe_poison_heap_reference(expected);
                        self.cg.asm.movl_rr(temp, value);
                        self.cg.maybe_poison_heap_reference(temp);
                        value = temp;
                    }
                }
                let out = locations.out().reg();
                let asm = &mut self.cg.asm;
                if ty == DataType::Int64 {
                    asm.lock().cmpxchgq(&addr, value);
                } else {
                    asm.lock().cmpxchgl(&addr, value);
                }
                asm.setcc(Condition::Equal, out);
                asm.movzxb_rr(out, out);
            }
            Intrinsic::VarHandleGetAndAdd => {
                let wide = graph.get(instr.input(2)).ty == DataType::Int64;
                let delta = locations.in_at(2).reg();
                let out = locations.out().reg();
                let asm = &mut self.cg.asm;
                if wide {
                    asm.movq_rr(out, delta);
                    asm.lock().xaddq(&addr, out);
                } else {
                    asm.movl_rr(out, delta);
                    asm.lock().xaddl(&addr, out);
                }
            }
            _ => {
                let op = match intrinsic {
                    Intrinsic::VarHandleGetAndBitwiseOr => AluOp::Or,
                    Intrinsic::VarHandleGetAndBitwiseAnd => AluOp::And,
                    _ => AluOp::Xor,
                };
                let wide = graph.get(instr.input(2)).ty == DataType::Int64;
                let operand = locations.in_at(2);
                let new_value = locations.temp(1).reg();
                // `out` is RAX, the implicit cmpxchg operand.
                let old = locations.out().reg();
                let mut retry = Label::new();
                self.cg.asm.bind(&mut retry);
                if wide {
                    self.cg.asm.movq_rm(old, &addr);
                    self.cg.asm.movq_rr(new_value, old);
                } else {
                    self.cg.asm.movl_rm(old, &addr);
                    self.cg.asm.movl_rr(new_value, old);
                }
                InstructionCodeGeneratorX86_64::new(self.cg).alu(op, wide, new_value, operand);
                let asm = &mut self.cg.asm;
                if wide {
                    asm.lock().cmpxchgq(&addr, new_value);
                } else {
                    asm.lock().cmpxchgl(&addr, new_value);
                }
                asm.j(Condition::NotEqual, &mut retry);
            }
        }
        self.cg.bind_slow_path_exit(slow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Graph calling `intrinsic` on fresh parameters of `types`.
    fn call(intrinsic: Intrinsic, types: &[DataType], ret: DataType) -> (HGraph, InstructionId) {
        let mut g = HGraph::new(MethodIndex(0), true);
        let b = g.add_block();
        let args: Vec<_> = types
            .iter()
            .enumerate()
            .map(|(i, &ty)| g.add(b, HKind::Parameter { index: i as u16 }, ty, &[], 0))
            .collect();
        let id = g.add(
            b,
            HKind::InvokeIntrinsic {
                method: MethodIndex(9),
                intrinsic,
            },
            ret,
            &args,
            1,
        );
        g.add(b, HKind::ReturnVoid, DataType::Void, &[], 2);
        (g, id)
    }

    #[test]
    fn test_long_intrinsics_declined_on_x86() {
        let (g, id) = call(Intrinsic::MathAbsLong, &[DataType::Int64], DataType::Int64);
        let x86 = CodegenOptions::x86();
        assert!(IntrinsicLocationsBuilder::new(&g, &x86).try_dispatch(id, Intrinsic::MathAbsLong).is_none());
        let x64 = CodegenOptions::plain();
        let s = IntrinsicLocationsBuilder::new(&g, &x64)
            .try_dispatch(id, Intrinsic::MathAbsLong)
            .unwrap();
        assert!(s.is_intrinsified());
        assert_eq!(s.temps().len(), 1);
    }

    #[test]
    fn test_feature_gated_intrinsics() {
        let (g, id) = call(Intrinsic::MathRoundFloat, &[DataType::Float32], DataType::Int32);
        let no_sse41 = CodegenOptions {
            features: CpuFeatures::empty(),
            ..CodegenOptions::plain()
        };
        let builder = IntrinsicLocationsBuilder::new(&g, &no_sse41);
        assert!(builder.try_dispatch(id, Intrinsic::MathRoundFloat).is_none());
        let opts = CodegenOptions::plain();
        assert!(IntrinsicLocationsBuilder::new(&g, &opts).try_dispatch(id, Intrinsic::MathRoundFloat).is_some());
    }

    #[test]
    fn test_raw_reference_access_declined_under_read_barriers() {
        let types = [
            DataType::Reference,
            DataType::Reference,
            DataType::Int64,
            DataType::Reference,
            DataType::Reference,
        ];
        let (g, id) = call(Intrinsic::UnsafeCASObject, &types, DataType::Bool);
        let baker = CodegenOptions::default();
        assert!(IntrinsicLocationsBuilder::new(&g, &baker).try_dispatch(id, Intrinsic::UnsafeCASObject).is_none());
        let plain = CodegenOptions::plain();
        let s = IntrinsicLocationsBuilder::new(&g, &plain)
            .try_dispatch(id, Intrinsic::UnsafeCASObject)
            .unwrap();
        assert_eq!(s.in_at(3), Location::Register(CpuRegister::RAX));
        assert!(!s.in_at(0).is_valid());
        assert_eq!(s.temps().len(), 2);
    }

    #[test]
    fn test_string_intrinsics_pin_string_registers() {
        let (g, id) = call(Intrinsic::StringEquals, &[DataType::Reference, DataType::Reference], DataType::Bool);
        let opts = CodegenOptions::plain();
        let s = IntrinsicLocationsBuilder::new(&g, &opts)
            .try_dispatch(id, Intrinsic::StringEquals)
            .unwrap();
        assert_eq!(s.in_at(0), Location::Register(CpuRegister::RSI));
        assert_eq!(s.in_at(1), Location::Register(CpuRegister::RDI));
        assert_eq!(s.temp(0), Location::Register(CpuRegister::RCX));
        assert_eq!(s.call_kind(), CallKind::NoCall);
    }

    #[test]
    fn test_var_handle_type_support() {
        let opts = CodegenOptions::plain();
        let (g, id) = call(
            Intrinsic::VarHandleGetAndAdd,
            &[DataType::Reference, DataType::Reference, DataType::Float64],
            DataType::Float64,
        );
        assert!(IntrinsicLocationsBuilder::new(&g, &opts).try_dispatch(id, Intrinsic::VarHandleGetAndAdd).is_none());

        let (g, id) = call(
            Intrinsic::VarHandleGetAndBitwiseOr,
            &[DataType::Reference, DataType::Reference, DataType::Int32],
            DataType::Int32,
        );
        let s = IntrinsicLocationsBuilder::new(&g, &opts)
            .try_dispatch(id, Intrinsic::VarHandleGetAndBitwiseOr)
            .unwrap();
        assert_eq!(s.out(), Location::Register(CpuRegister::RAX));
        assert_eq!(s.call_kind(), CallKind::CallOnSlowPath);
    }

    #[test]
    fn test_access_modes() {
        assert_eq!(Intrinsic::VarHandleGet.access_mode(), Some(0));
        assert_eq!(Intrinsic::VarHandleCompareAndSet.access_mode(), Some(8));
        assert_eq!(Intrinsic::VarHandleGetAndBitwiseXor.access_mode(), Some(28));
        assert_eq!(Intrinsic::MathSqrt.access_mode(), None);
        assert_eq!(Intrinsic::MathPow.math_entrypoint(), Some(QuickEntrypoint::Pow));
    }
}
