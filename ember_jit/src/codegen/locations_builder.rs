//! Register constraints per instruction.
//!
//! The builder runs before allocation and attaches a [`LocationSummary`] to
//! every instruction that emits code. Constants and parameters get none:
//! constants are materialized at their uses and parameters are stored to
//! their homes by the frame entry.

use super::allocator::{constant_bits, runtime_argument, ArgumentVisitor};
use super::code_generator::outgoing_argument;
use super::hir::{
    DataType, HGraph, HInstruction, HKind, InstructionId, LoadKind, MethodLoadKind, TypeCheckKind,
};
use super::intrinsics::IntrinsicLocationsBuilder;
use super::location::{CallKind, Location, LocationSummary};
use crate::backend::x64::{CpuRegister, ManagedCallingConvention, RegisterSet, XmmRegister};
use crate::error::{CodegenError, CodegenResult};
use crate::options::{CodegenOptions, InstructionSet};
use ember_core::bits::is_int32;
use ember_gc::ReadBarrierKind;

/// Attach location summaries to every instruction of `graph`.
pub fn build_locations(graph: &mut HGraph, options: &CodegenOptions) -> CodegenResult<()> {
    let summaries = {
        let builder = LocationsBuilderX86_64::new(graph, options);
        graph
            .instructions()
            .iter()
            .map(|i| builder.visit(i.id))
            .collect::<CodegenResult<Vec<_>>>()?
    };
    for (idx, summary) in summaries.into_iter().enumerate() {
        graph.get_mut(InstructionId(idx as u32)).locations = summary;
    }
    Ok(())
}

/// Where a value of `ty` comes back from a call.
pub fn return_location(ty: DataType, isa: InstructionSet) -> Location {
    match ty {
        DataType::Void => Location::Invalid,
        DataType::Float32 | DataType::Float64 => Location::FpuRegister(ManagedCallingConvention::FPU_RETURN),
        DataType::Int64 if isa == InstructionSet::X86 => Location::RegisterPair {
            low: CpuRegister::RAX,
            high: CpuRegister::RDX,
        },
        _ => Location::Register(ManagedCallingConvention::CORE_RETURN),
    }
}

/// Computes location summaries.
pub struct LocationsBuilderX86_64<'a> {
    graph: &'a HGraph,
    options: &'a CodegenOptions,
    isa: InstructionSet,
}

impl<'a> LocationsBuilderX86_64<'a> {
    pub fn new(graph: &'a HGraph, options: &'a CodegenOptions) -> Self {
        Self {
            graph,
            options,
            isa: options.instruction_set,
        }
    }

    /// Summary for `id`, or `None` for instructions that emit nothing.
    pub fn visit(&self, id: InstructionId) -> CodegenResult<Option<LocationSummary>> {
        let instr = self.graph.get(id);
        let summary = match &instr.kind {
            HKind::IntConstant(_)
            | HKind::LongConstant(_)
            | HKind::FloatConstant(_)
            | HKind::DoubleConstant(_)
            | HKind::NullConstant
            | HKind::Parameter { .. } => return Ok(None),

            HKind::Add | HKind::Sub | HKind::And | HKind::Or | HKind::Xor => self.visit_binary_op(instr)?,
            HKind::Mul => self.visit_mul(instr)?,
            HKind::Div | HKind::Rem => self.visit_div_rem(instr)?,
            HKind::Shl | HKind::Shr | HKind::UShr => self.visit_shift(instr)?,
            HKind::Neg | HKind::Not => self.visit_unary_op(instr)?,
            HKind::Compare { .. } => self.visit_compare(instr, false)?,
            HKind::Condition { .. } => self.visit_compare(instr, true)?,
            HKind::TypeConversion { from } => self.visit_type_conversion(instr, *from)?,

            HKind::If { .. } => {
                let mut s = LocationSummary::new(1, CallKind::NoCall);
                s.set_in_at(0, Location::any());
                s
            }
            HKind::Deoptimize { .. } => {
                let mut s = LocationSummary::new(1, CallKind::CallOnSlowPath);
                s.set_in_at(0, Location::any());
                s.set_custom_slow_path_caller_saves(RegisterSet::EMPTY);
                s
            }
            HKind::Goto { .. } | HKind::ReturnVoid => LocationSummary::new(0, CallKind::NoCall),
            HKind::Return => {
                let mut s = LocationSummary::new(1, CallKind::NoCall);
                s.set_in_at(0, return_location(self.graph.get(instr.input(0)).ty, self.isa));
                s
            }

            HKind::NullCheck => {
                let mut s = if self.options.implicit_null_checks {
                    let mut s = LocationSummary::new(1, CallKind::NoCall);
                    s.set_in_at(0, Location::requires_register());
                    s
                } else {
                    let mut s = LocationSummary::new(1, CallKind::CallOnSlowPath);
                    s.set_in_at(0, Location::any());
                    s
                };
                s.set_custom_slow_path_caller_saves(RegisterSet::EMPTY);
                s
            }
            HKind::BoundsCheck => {
                let mut s = LocationSummary::new(2, CallKind::CallOnSlowPath);
                s.set_in_at(0, Location::register_or_constant());
                s.set_in_at(1, Location::any());
                s.set_custom_slow_path_caller_saves(RegisterSet::EMPTY);
                s
            }
            HKind::DivZeroCheck => {
                let mut s = LocationSummary::new(1, CallKind::CallOnSlowPath);
                s.set_in_at(0, Location::any());
                s.set_custom_slow_path_caller_saves(RegisterSet::EMPTY);
                s
            }
            HKind::SuspendCheck => {
                let mut s = LocationSummary::new(0, CallKind::CallOnSlowPath);
                s.set_custom_slow_path_caller_saves(RegisterSet::EMPTY);
                s
            }

            HKind::InstanceFieldGet { volatile, .. } | HKind::StaticFieldGet { volatile, .. } => {
                self.visit_field_get(instr, *volatile)?
            }
            HKind::InstanceFieldSet { volatile, value_can_be_null, .. }
            | HKind::StaticFieldSet { volatile, value_can_be_null, .. } => {
                self.visit_field_set(instr, *volatile, *value_can_be_null)?
            }
            HKind::ArrayGet => self.visit_array_get(instr)?,
            HKind::ArraySet { value_can_be_null, needs_type_check } => {
                self.visit_array_set(instr, *value_can_be_null, *needs_type_check)?
            }
            HKind::ArrayLength => {
                let mut s = LocationSummary::new(1, CallKind::NoCall);
                s.set_in_at(0, Location::requires_register());
                s.set_out(Location::requires_register(), false);
                s
            }

            HKind::NewInstance { .. } | HKind::LoadMethodHandle { .. } => self.runtime_call(instr, &[]),
            HKind::NewArray { .. } => self.runtime_call(instr, &[1]),
            HKind::LoadClass { kind, .. } => self.visit_load(instr, *kind, true)?,
            HKind::LoadString { kind, .. } => {
                if *kind == LoadKind::ReferrersClass {
                    return Err(CodegenError::MalformedGraph(format!("{id}: string loaded as a class")));
                }
                self.visit_load(instr, *kind, false)?
            }
            HKind::LoadMethodType { kind, .. } => match kind {
                LoadKind::BssEntry => self.visit_load(instr, *kind, false)?,
                LoadKind::RuntimeCall => self.runtime_call(instr, &[]),
                other => {
                    return Err(CodegenError::MalformedGraph(format!(
                        "{id}: method type cannot be loaded as {other:?}"
                    )));
                }
            },
            HKind::InstanceOf { check } => self.visit_type_check(*check, true),
            HKind::CheckCast { check } => self.visit_type_check(*check, false),
            HKind::MonitorOperation { .. } | HKind::Throw => self.runtime_call(instr, &[0]),

            HKind::InvokeStaticOrDirect { dispatch, .. } => {
                let pc_relative = matches!(
                    dispatch.method_load_kind,
                    MethodLoadKind::BootImageLinkTimePcRelative | MethodLoadKind::BssEntry
                );
                if pc_relative && self.isa == InstructionSet::X86 && !self.has_base_address(instr) {
                    return Err(CodegenError::MalformedGraph(format!(
                        "{id}: PC-relative dispatch without a base method address"
                    )));
                }
                self.invoke(instr, false)
            }
            HKind::InvokeVirtual { .. } | HKind::InvokePolymorphic { .. } => self.invoke(instr, false),
            HKind::InvokeInterface { .. } => self.invoke(instr, true),
            HKind::InvokeIntrinsic { intrinsic, .. } => {
                let intrinsics = IntrinsicLocationsBuilder::new(self.graph, self.options);
                match intrinsics.try_dispatch(id, *intrinsic) {
                    Some(s) => s,
                    None => {
                        tracing::trace!(%id, ?intrinsic, "intrinsic not expanded, calling the method");
                        self.invoke(instr, false)
                    }
                }
            }

            HKind::ComputeBaseMethodAddress => {
                let mut s = LocationSummary::new(0, CallKind::NoCall);
                s.set_out(Location::requires_register(), false);
                s
            }
            HKind::ParallelMove(_) | HKind::MemoryBarrier(_) => LocationSummary::new(0, CallKind::NoCall),
        };
        Ok(Some(summary))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn input_type(&self, instr: &HInstruction, i: usize) -> DataType {
        self.graph.get(instr.input(i)).ty
    }

    fn constant_input(&self, instr: &HInstruction, i: usize) -> Option<i64> {
        constant_bits(&self.graph.get(instr.input(i)).kind)
    }

    fn is_long_pair(&self, ty: DataType) -> bool {
        ty == DataType::Int64 && self.isa == InstructionSet::X86
    }

    /// x86 keeps `long` in register pairs, which only value moves support.
    fn reject_long_pair(&self, instr: &HInstruction, ty: DataType) -> CodegenResult<()> {
        if self.is_long_pair(ty) {
            return Err(CodegenError::unsupported(
                format!("{} on long", instr.kind.name()),
                self.isa,
            ));
        }
        Ok(())
    }

    fn value_register(ty: DataType) -> Location {
        if ty.is_floating_point() {
            Location::requires_fpu_register()
        } else {
            Location::requires_register()
        }
    }

    /// Constant usable as an instruction immediate, otherwise a register.
    fn register_or_immediate(&self, instr: &HInstruction, i: usize) -> Location {
        match self.constant_input(instr, i) {
            Some(bits) if is_int32(bits) || !self.input_type(instr, i).is_64bit() => Location::Constant(bits),
            _ => Location::requires_register(),
        }
    }

    /// Immediate, register or home slot; wide constants that do not fit an
    /// immediate need a register.
    fn immediate_or_any(&self, instr: &HInstruction, i: usize) -> Location {
        match (self.constant_input(instr, i), self.register_or_immediate(instr, i)) {
            (_, Location::Constant(c)) => Location::Constant(c),
            (Some(_), register) => register,
            (None, _) => Location::any(),
        }
    }

    /// Core register for a value stored or converted as a byte.
    fn byte_register(&self) -> Location {
        match self.isa {
            InstructionSet::X86 => Location::requires_byte_register(),
            InstructionSet::X86_64 => Location::requires_register(),
        }
    }

    fn has_base_address(&self, instr: &HInstruction) -> bool {
        instr
            .inputs
            .last()
            .is_some_and(|&i| self.graph.get(i).kind == HKind::ComputeBaseMethodAddress)
    }

    /// A trailing base-method-address input needs a register.
    fn base_address_input(&self, instr: &HInstruction, s: &mut LocationSummary) {
        if self.has_base_address(instr) {
            s.set_in_at(instr.inputs.len() - 1, Location::requires_register());
        }
    }

    /// Main-path runtime call; inputs listed in `args` travel in runtime
    /// argument registers `args[k]`, the rest are unused by the call.
    fn runtime_call(&self, instr: &HInstruction, args: &[usize]) -> LocationSummary {
        let mut s = LocationSummary::new(instr.inputs.len(), CallKind::CallOnMainOnly);
        for (i, &reg_index) in args.iter().enumerate() {
            if i < instr.inputs.len() {
                s.set_in_at(i, Location::Register(runtime_argument(self.isa, reg_index)));
            }
        }
        s.set_out(return_location(instr.ty, self.isa), false);
        s
    }

    /// Managed call: arguments per the managed convention, the method
    /// register as a temp and RAX too for the interface hidden argument.
    pub(crate) fn invoke(&self, instr: &HInstruction, hidden_argument: bool) -> LocationSummary {
        let mut s = LocationSummary::new(instr.inputs.len(), CallKind::CallOnMainOnly);
        let mut visitor = ArgumentVisitor::managed(self.isa);
        let args = self.graph.invoke_arguments(instr.id).len();
        for i in 0..args {
            let ty = self.input_type(instr, i);
            s.set_in_at(i, outgoing_argument(visitor.next(ty), ty));
        }
        self.base_address_input(instr, &mut s);
        s.add_temp(Location::Register(ManagedCallingConvention::METHOD_REGISTER));
        if hidden_argument {
            s.add_temp(Location::Register(CpuRegister::RAX));
        }
        s.set_out(return_location(instr.ty, self.isa), false);
        s
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    fn visit_binary_op(&self, instr: &HInstruction) -> CodegenResult<LocationSummary> {
        self.reject_long_pair(instr, instr.ty)?;
        let mut s = LocationSummary::new(2, CallKind::NoCall);
        if instr.ty.is_floating_point() {
            if matches!(instr.kind, HKind::Add | HKind::Sub) {
                s.set_in_at(0, Location::requires_fpu_register());
                s.set_in_at(1, Location::any());
            } else {
                return Err(CodegenError::MalformedGraph(format!(
                    "{}: {} on {:?}",
                    instr.id,
                    instr.kind.name(),
                    instr.ty
                )));
            }
        } else {
            s.set_in_at(0, Location::requires_register());
            s.set_in_at(1, self.immediate_or_any(instr, 1));
        }
        s.set_out(Location::same_as_first_input(), true);
        Ok(s)
    }

    fn visit_mul(&self, instr: &HInstruction) -> CodegenResult<LocationSummary> {
        self.reject_long_pair(instr, instr.ty)?;
        let mut s = LocationSummary::new(2, CallKind::NoCall);
        if instr.ty.is_floating_point() {
            s.set_in_at(0, Location::requires_fpu_register());
            s.set_in_at(1, Location::any());
        } else {
            s.set_in_at(0, Location::requires_register());
            s.set_in_at(1, self.register_or_immediate(instr, 1));
        }
        s.set_out(Location::same_as_first_input(), true);
        Ok(s)
    }

    fn visit_div_rem(&self, instr: &HInstruction) -> CodegenResult<LocationSummary> {
        self.reject_long_pair(instr, instr.ty)?;
        let is_div = matches!(instr.kind, HKind::Div);
        match instr.ty {
            DataType::Float32 | DataType::Float64 if is_div => {
                let mut s = LocationSummary::new(2, CallKind::NoCall);
                s.set_in_at(0, Location::requires_fpu_register());
                s.set_in_at(1, Location::any());
                s.set_out(Location::same_as_first_input(), true);
                Ok(s)
            }
            DataType::Float32 | DataType::Float64 => {
                // fmod through the runtime's math helpers.
                let mut s = LocationSummary::new(2, CallKind::CallOnMainOnly);
                s.set_in_at(0, Location::FpuRegister(XmmRegister::XMM0));
                s.set_in_at(1, Location::FpuRegister(XmmRegister::XMM1));
                s.set_out(Location::FpuRegister(XmmRegister::XMM0), false);
                Ok(s)
            }
            _ => {
                let mut s = LocationSummary::new(2, CallKind::NoCall);
                s.set_in_at(0, Location::Register(CpuRegister::RAX));
                s.set_in_at(1, Location::requires_register());
                if is_div {
                    s.add_temp(Location::Register(CpuRegister::RDX));
                    s.set_out(Location::Register(CpuRegister::RAX), false);
                } else {
                    s.set_out(Location::Register(CpuRegister::RDX), false);
                }
                Ok(s)
            }
        }
    }

    fn visit_shift(&self, instr: &HInstruction) -> CodegenResult<LocationSummary> {
        self.reject_long_pair(instr, instr.ty)?;
        let mut s = LocationSummary::new(2, CallKind::NoCall);
        s.set_in_at(0, Location::requires_register());
        s.set_in_at(1, match self.constant_input(instr, 1) {
            Some(c) => Location::Constant(c),
            None => Location::Register(CpuRegister::RCX),
        });
        s.set_out(Location::same_as_first_input(), true);
        Ok(s)
    }

    fn visit_unary_op(&self, instr: &HInstruction) -> CodegenResult<LocationSummary> {
        self.reject_long_pair(instr, instr.ty)?;
        let mut s = LocationSummary::new(1, CallKind::NoCall);
        s.set_in_at(0, Self::value_register(instr.ty));
        if instr.ty.is_floating_point() {
            // Sign mask.
            s.add_temp(Location::requires_fpu_register());
        }
        s.set_out(Location::same_as_first_input(), true);
        Ok(s)
    }

    fn visit_compare(&self, instr: &HInstruction, materialize_bool: bool) -> CodegenResult<LocationSummary> {
        let ty = self.input_type(instr, 0);
        self.reject_long_pair(instr, ty)?;
        let mut s = LocationSummary::new(2, CallKind::NoCall);
        if ty.is_floating_point() {
            s.set_in_at(0, Location::requires_fpu_register());
            s.set_in_at(1, Location::any());
        } else {
            s.set_in_at(0, Location::requires_register());
            s.set_in_at(1, self.immediate_or_any(instr, 1));
        }
        let out = if materialize_bool {
            self.byte_register()
        } else {
            Location::requires_register()
        };
        s.set_out(out, true);
        Ok(s)
    }

    fn visit_type_conversion(&self, instr: &HInstruction, from: DataType) -> CodegenResult<LocationSummary> {
        let to = instr.ty;
        let long_involved = self.is_long_pair(from) || self.is_long_pair(to);
        let int_widening = from.is_int_or_smaller() && to == DataType::Int64;
        let long_narrowing = from == DataType::Int64 && to.is_int_or_smaller();
        if long_involved && !int_widening && !long_narrowing {
            return Err(CodegenError::unsupported(
                format!("conversion from {from:?} to {to:?}"),
                self.isa,
            ));
        }
        let mut s = LocationSummary::new(1, CallKind::NoCall);
        let input = if to == DataType::Int8 && from.is_int_or_smaller() {
            self.byte_register()
        } else {
            Self::value_register(from)
        };
        s.set_in_at(0, input);
        if from.is_floating_point() && !to.is_floating_point() {
            // Holds the saturation bound.
            s.add_temp(Location::requires_fpu_register());
        }
        s.set_out(Self::value_register(to), true);
        Ok(s)
    }

    // =========================================================================
    // Memory
    // =========================================================================

    fn barrier_call_kind(&self, ty: DataType) -> CallKind {
        if ty.is_reference() && self.options.read_barrier != ReadBarrierKind::None {
            CallKind::CallOnSlowPath
        } else {
            CallKind::NoCall
        }
    }

    fn barrier_summary(&self, num_inputs: usize, ty: DataType) -> LocationSummary {
        let kind = self.barrier_call_kind(ty);
        let mut s = LocationSummary::new(num_inputs, kind);
        if ty.is_reference() && self.options.read_barrier == ReadBarrierKind::Baker {
            // Mark entrypoints preserve every register.
            s.set_custom_slow_path_caller_saves(RegisterSet::EMPTY);
        }
        s
    }

    fn visit_field_get(&self, instr: &HInstruction, volatile: bool) -> CodegenResult<LocationSummary> {
        if volatile && self.is_long_pair(instr.ty) {
            return Err(CodegenError::unsupported("volatile long field access", self.isa));
        }
        let mut s = self.barrier_summary(1, instr.ty);
        s.set_in_at(0, Location::requires_register());
        s.set_out(Self::value_register(instr.ty), true);
        Ok(s)
    }

    /// Locations of a stored value at input `value` plus the temps a
    /// reference store needs for poisoning and card marking.
    fn stored_value(&self, instr: &HInstruction, s: &mut LocationSummary, value: usize, needs_card: bool) {
        let ty = self.input_type(instr, value);
        let constant = self.constant_input(instr, value);
        let location = match (ty, constant) {
            (_, Some(bits)) if is_int32(bits) || !ty.is_64bit() || self.is_long_pair(ty) => {
                Location::Constant(bits)
            }
            (DataType::Bool | DataType::Int8, _) => self.byte_register(),
            _ => Self::value_register(ty),
        };
        s.set_in_at(value, location);
        if ty.is_reference() && needs_card && constant != Some(0) {
            s.add_temp(Location::requires_register());
            s.add_temp(self.byte_register());
        }
    }

    fn visit_field_set(
        &self,
        instr: &HInstruction,
        volatile: bool,
        _value_can_be_null: bool,
    ) -> CodegenResult<LocationSummary> {
        if volatile && self.is_long_pair(self.input_type(instr, 1)) {
            return Err(CodegenError::unsupported("volatile long field access", self.isa));
        }
        let mut s = LocationSummary::new(2, CallKind::NoCall);
        s.set_in_at(0, Location::requires_register());
        self.stored_value(instr, &mut s, 1, true);
        Ok(s)
    }

    fn visit_array_get(&self, instr: &HInstruction) -> CodegenResult<LocationSummary> {
        let mut s = self.barrier_summary(2, instr.ty);
        s.set_in_at(0, Location::requires_register());
        s.set_in_at(1, Location::register_or_constant());
        s.set_out(Self::value_register(instr.ty), true);
        Ok(s)
    }

    fn visit_array_set(
        &self,
        instr: &HInstruction,
        _value_can_be_null: bool,
        needs_type_check: bool,
    ) -> CodegenResult<LocationSummary> {
        let value_ty = self.input_type(instr, 2);
        if value_ty.is_reference() && needs_type_check {
            return Ok(self.runtime_call(instr, &[0, 1, 2]));
        }
        let mut s = LocationSummary::new(3, CallKind::NoCall);
        s.set_in_at(0, Location::requires_register());
        s.set_in_at(1, Location::register_or_constant());
        self.stored_value(instr, &mut s, 2, true);
        Ok(s)
    }

    /// Class, string and method-type loads.
    fn visit_load(&self, instr: &HInstruction, kind: LoadKind, is_class: bool) -> CodegenResult<LocationSummary> {
        let pc_relative = matches!(
            kind,
            LoadKind::BootImageLinkTimePcRelative | LoadKind::BootImageRelRo | LoadKind::BssEntry
        );
        if pc_relative && self.isa == InstructionSet::X86 && !self.has_base_address(instr) {
            return Err(CodegenError::MalformedGraph(format!(
                "{}: PC-relative load without a base method address",
                instr.id
            )));
        }
        let s = match kind {
            LoadKind::RuntimeCall => self.runtime_call(instr, &[]),
            LoadKind::BssEntry => {
                let mut s = LocationSummary::new(instr.inputs.len(), CallKind::CallOnSlowPath);
                self.base_address_input(instr, &mut s);
                s.set_out(Location::requires_register(), false);
                s
            }
            LoadKind::ReferrersClass if !is_class => {
                return Err(CodegenError::MalformedGraph(format!(
                    "{}: only classes load from the referrer",
                    instr.id
                )));
            }
            LoadKind::ReferrersClass => {
                let mut s = self.barrier_summary(instr.inputs.len(), DataType::Reference);
                s.set_out(Location::requires_register(), false);
                s
            }
            LoadKind::BootImageLinkTimePcRelative | LoadKind::BootImageRelRo => {
                let mut s = LocationSummary::new(instr.inputs.len(), CallKind::NoCall);
                self.base_address_input(instr, &mut s);
                s.set_out(Location::requires_register(), false);
                s
            }
        };
        Ok(s)
    }

    fn visit_type_check(&self, check: TypeCheckKind, is_instance_of: bool) -> LocationSummary {
        let kind = match (check, is_instance_of) {
            (TypeCheckKind::ExactCheck, true) => CallKind::NoCall,
            _ => CallKind::CallOnSlowPath,
        };
        let mut s = LocationSummary::new(2, kind);
        s.set_in_at(0, Location::requires_register());
        s.set_in_at(1, Location::requires_register());
        if is_instance_of {
            s.set_out(Location::requires_register(), true);
        } else {
            s.add_temp(Location::requires_register());
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::hir::{DispatchInfo, MethodLoadKind};
    use ember_core::{MethodIndex, TypeIndex};

    fn summary_of(g: &HGraph, opts: &CodegenOptions, id: InstructionId) -> LocationSummary {
        LocationsBuilderX86_64::new(g, opts).visit(id).unwrap().unwrap()
    }

    #[test]
    fn test_constants_and_parameters_have_no_summary() {
        let mut g = HGraph::new(MethodIndex(0), true);
        let b = g.add_block();
        let p = g.add(b, HKind::Parameter { index: 0 }, DataType::Int32, &[], 0);
        let constants = [
            g.add(b, HKind::IntConstant(1), DataType::Int32, &[], 0),
            g.add(b, HKind::LongConstant(-1), DataType::Int64, &[], 0),
            g.add(b, HKind::FloatConstant(0.5), DataType::Float32, &[], 0),
            g.add(b, HKind::DoubleConstant(2.0), DataType::Float64, &[], 0),
            g.add(b, HKind::NullConstant, DataType::Reference, &[], 0),
        ];
        g.add(b, HKind::ReturnVoid, DataType::Void, &[], 0);
        let opts = CodegenOptions::default();
        let builder = LocationsBuilderX86_64::new(&g, &opts);
        assert!(builder.visit(p).unwrap().is_none());
        for c in constants {
            assert!(builder.visit(c).unwrap().is_none(), "{}", g.get(c).kind.name());
        }
    }

    #[test]
    fn test_division_pins_rax_and_rdx() {
        let mut g = HGraph::new(MethodIndex(0), true);
        let b = g.add_block();
        let x = g.add(b, HKind::Parameter { index: 0 }, DataType::Int32, &[], 0);
        let y = g.add(b, HKind::Parameter { index: 1 }, DataType::Int32, &[], 0);
        let div = g.add(b, HKind::Div, DataType::Int32, &[x, y], 1);
        let rem = g.add(b, HKind::Rem, DataType::Int32, &[x, y], 2);
        g.add(b, HKind::ReturnVoid, DataType::Void, &[], 3);
        let opts = CodegenOptions::default();
        let s = summary_of(&g, &opts, div);
        assert_eq!(s.in_at(0), Location::Register(CpuRegister::RAX));
        assert_eq!(s.temp(0), Location::Register(CpuRegister::RDX));
        assert_eq!(s.out(), Location::Register(CpuRegister::RAX));
        let s = summary_of(&g, &opts, rem);
        assert_eq!(s.out(), Location::Register(CpuRegister::RDX));
    }

    #[test]
    fn test_shift_by_register_uses_cl() {
        let mut g = HGraph::new(MethodIndex(0), true);
        let b = g.add_block();
        let x = g.add(b, HKind::Parameter { index: 0 }, DataType::Int64, &[], 0);
        let n = g.add(b, HKind::Parameter { index: 1 }, DataType::Int32, &[], 0);
        let c = g.add(b, HKind::IntConstant(3), DataType::Int32, &[], 0);
        let shl = g.add(b, HKind::Shl, DataType::Int64, &[x, n], 1);
        let shr = g.add(b, HKind::Shr, DataType::Int64, &[x, c], 1);
        g.add(b, HKind::ReturnVoid, DataType::Void, &[], 2);
        let opts = CodegenOptions::default();
        assert_eq!(summary_of(&g, &opts, shl).in_at(1), Location::Register(CpuRegister::RCX));
        assert_eq!(summary_of(&g, &opts, shr).in_at(1), Location::Constant(3));
        let x86 = CodegenOptions::x86();
        let err = LocationsBuilderX86_64::new(&g, &x86).visit(shl).unwrap_err();
        assert!(matches!(err, CodegenError::Unsupported { .. }));
    }

    #[test]
    fn test_invoke_arguments_follow_managed_convention() {
        let mut g = HGraph::new(MethodIndex(0), true);
        let b = g.add_block();
        let a = g.add(b, HKind::Parameter { index: 0 }, DataType::Int32, &[], 0);
        let d = g.add(b, HKind::Parameter { index: 1 }, DataType::Float64, &[], 0);
        let l = g.add(b, HKind::Parameter { index: 2 }, DataType::Int64, &[], 0);
        let call = g.add(
            b,
            HKind::InvokeStaticOrDirect {
                method: MethodIndex(9),
                dispatch: DispatchInfo::via_method(MethodLoadKind::BssEntry),
            },
            DataType::Float32,
            &[a, d, l],
            1,
        );
        g.add(b, HKind::ReturnVoid, DataType::Void, &[], 2);
        let opts = CodegenOptions::default();
        let s = summary_of(&g, &opts, call);
        assert_eq!(s.in_at(0), Location::Register(CpuRegister::RSI));
        assert_eq!(s.in_at(1), Location::FpuRegister(XmmRegister::XMM0));
        assert_eq!(s.in_at(2), Location::Register(CpuRegister::RDX));
        assert_eq!(s.temp(0), Location::Register(CpuRegister::RDI));
        assert_eq!(s.out(), Location::FpuRegister(XmmRegister::XMM0));
        assert!(s.calls_on_main_path());

        // x86 needs the base address for PC-relative dispatch.
        let err = LocationsBuilderX86_64::new(&g, &CodegenOptions::x86()).visit(call).unwrap_err();
        assert!(matches!(err, CodegenError::MalformedGraph(_)));
    }

    #[test]
    fn test_reference_store_reserves_card_temps() {
        let mut g = HGraph::new(MethodIndex(0), false);
        let b = g.add_block();
        let obj = g.add(b, HKind::Parameter { index: 0 }, DataType::Reference, &[], 0);
        let val = g.add(b, HKind::Parameter { index: 1 }, DataType::Reference, &[], 0);
        let null = g.add(b, HKind::NullConstant, DataType::Reference, &[], 0);
        let set = g.add(
            b,
            HKind::InstanceFieldSet {
                offset: 8,
                volatile: false,
                value_can_be_null: true,
            },
            DataType::Void,
            &[obj, val],
            1,
        );
        let set_null = g.add(
            b,
            HKind::InstanceFieldSet {
                offset: 8,
                volatile: false,
                value_can_be_null: true,
            },
            DataType::Void,
            &[obj, null],
            2,
        );
        g.add(b, HKind::ReturnVoid, DataType::Void, &[], 3);
        let opts = CodegenOptions::x86();
        let s = summary_of(&g, &opts, set);
        assert_eq!(s.temps().len(), 2);
        assert_eq!(s.temp(1), Location::requires_byte_register());
        let s = summary_of(&g, &opts, set_null);
        assert!(s.temps().is_empty());
        assert_eq!(s.in_at(1), Location::Constant(0));
    }

    #[test]
    fn test_load_kinds() {
        let mut g = HGraph::new(MethodIndex(0), true);
        let b = g.add_block();
        let bss = g.add(
            b,
            HKind::LoadClass {
                type_index: TypeIndex(3),
                kind: LoadKind::BssEntry,
            },
            DataType::Reference,
            &[],
            0,
        );
        let rt = g.add(
            b,
            HKind::LoadClass {
                type_index: TypeIndex(3),
                kind: LoadKind::RuntimeCall,
            },
            DataType::Reference,
            &[],
            0,
        );
        g.add(b, HKind::ReturnVoid, DataType::Void, &[], 1);
        let opts = CodegenOptions::default();
        assert_eq!(summary_of(&g, &opts, bss).call_kind(), CallKind::CallOnSlowPath);
        let s = summary_of(&g, &opts, rt);
        assert_eq!(s.call_kind(), CallKind::CallOnMainOnly);
        assert_eq!(s.out(), Location::Register(CpuRegister::RAX));
    }

    #[test]
    fn test_type_checks() {
        let mut g = HGraph::new(MethodIndex(0), false);
        let b = g.add_block();
        let obj = g.add(b, HKind::Parameter { index: 0 }, DataType::Reference, &[], 0);
        let class = g.add(b, HKind::Parameter { index: 1 }, DataType::Reference, &[], 0);
        let exact = g.add(
            b,
            HKind::InstanceOf {
                check: TypeCheckKind::ExactCheck,
            },
            DataType::Bool,
            &[obj, class],
            1,
        );
        let cast = g.add(
            b,
            HKind::CheckCast {
                check: TypeCheckKind::UnresolvedCheck,
            },
            DataType::Void,
            &[obj, class],
            2,
        );
        g.add(b, HKind::ReturnVoid, DataType::Void, &[], 3);
        let opts = CodegenOptions::default();

        let s = summary_of(&g, &opts, exact);
        assert_eq!(s.call_kind(), CallKind::NoCall);
        assert_eq!(s.out(), Location::requires_register());
        assert!(s.temps().is_empty());

        let s = summary_of(&g, &opts, cast);
        assert_eq!(s.call_kind(), CallKind::CallOnSlowPath);
        assert_eq!(s.in_at(1), Location::requires_register());
        assert_eq!(s.temps().len(), 1);
    }
}
