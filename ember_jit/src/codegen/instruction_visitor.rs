//! Per-instruction lowering.
//!
//! Runs after allocation: every location in the summary is concrete and the
//! inputs already sit where the summary asked for them.

use super::allocator::{runtime_argument, scratch_register};
use super::code_generator::CodeGeneratorX86_64;
use super::entrypoints::QuickEntrypoint;
use super::hir::{
    BlockId, ComparisonBias, DataType, HInstruction, HKind, IfCondition, InstructionId, LoadKind, MemBarrierKind,
    TypeCheckKind,
};
use super::intrinsics::IntrinsicCodeGenerator;
use super::layout::{array_data_offset, ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET, CLASS_OFFSET};
use super::linker_patch::PatchKind;
use super::location::Location;
use super::slow_path::{
    BoundsCheckSlowPath, DeoptimizationSlowPath, DivRemMinusOneSlowPath, DivZeroCheckSlowPath, ResolveSlowPath,
    SavedRegisters, TypeCheckSlowPath,
};
use super::stack_map::SafepointKind;
use crate::backend::x64::{Address, Condition, CpuRegister, Immediate, NearLabel, RegisterSet, ScaleFactor, XmmRegister};
use crate::error::CodegenResult;
use crate::options::InstructionSet;
use ember_core::fatal;

#[inline]
fn stack(offset: i32) -> Address {
    Address::new(CpuRegister::RSP, offset)
}

/// Two-operand integer ALU instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
}

/// Scalar SSE arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FpOp {
    Add,
    Sub,
    Mul,
    Div,
    /// Unordered compare.
    Compare,
}

/// Signed or unsigned condition code for an integral compare.
pub(crate) fn int_condition(cond: IfCondition) -> Condition {
    match cond {
        IfCondition::Eq => Condition::Equal,
        IfCondition::Ne => Condition::NotEqual,
        IfCondition::Lt => Condition::Less,
        IfCondition::Le => Condition::LessEqual,
        IfCondition::Gt => Condition::Greater,
        IfCondition::Ge => Condition::GreaterEqual,
        IfCondition::B => Condition::Below,
        IfCondition::Be => Condition::BelowEqual,
        IfCondition::A => Condition::Above,
        IfCondition::Ae => Condition::AboveEqual,
    }
}

/// `ucomis` sets flags like an unsigned compare.
pub(crate) fn fp_condition(cond: IfCondition) -> Condition {
    match cond {
        IfCondition::Eq => Condition::Equal,
        IfCondition::Ne => Condition::NotEqual,
        IfCondition::Lt | IfCondition::B => Condition::Below,
        IfCondition::Le | IfCondition::Be => Condition::BelowEqual,
        IfCondition::Gt | IfCondition::A => Condition::Above,
        IfCondition::Ge | IfCondition::Ae => Condition::AboveEqual,
    }
}

/// Result of a floating-point condition when an operand is NaN.
pub(crate) fn nan_result(cond: IfCondition, bias: ComparisonBias) -> bool {
    match cond {
        IfCondition::Eq => false,
        IfCondition::Ne => true,
        IfCondition::Lt | IfCondition::Le | IfCondition::B | IfCondition::Be => bias == ComparisonBias::LtBias,
        IfCondition::Gt | IfCondition::Ge | IfCondition::A | IfCondition::Ae => bias == ComparisonBias::GtBias,
    }
}

/// Emits the code of one instruction.
pub struct InstructionCodeGeneratorX86_64<'a, 'g> {
    cg: &'a mut CodeGeneratorX86_64<'g>,
}

impl<'a, 'g> InstructionCodeGeneratorX86_64<'a, 'g> {
    pub fn new(cg: &'a mut CodeGeneratorX86_64<'g>) -> Self {
        Self { cg }
    }

    pub fn visit(&mut self, id: InstructionId) -> CodegenResult<()> {
        let graph = self.cg.graph;
        let instr = graph.get(id);
        match &instr.kind {
            HKind::Add => self.visit_binary_op(instr, AluOp::Add, FpOp::Add),
            HKind::Sub => self.visit_binary_op(instr, AluOp::Sub, FpOp::Sub),
            HKind::And => self.visit_binary_op(instr, AluOp::And, FpOp::Add),
            HKind::Or => self.visit_binary_op(instr, AluOp::Or, FpOp::Add),
            HKind::Xor => self.visit_binary_op(instr, AluOp::Xor, FpOp::Add),
            HKind::Mul => self.visit_mul(instr),
            HKind::Div | HKind::Rem => self.visit_div_rem(instr),
            HKind::Shl | HKind::Shr | HKind::UShr => self.visit_shift(instr),
            HKind::Neg | HKind::Not => self.visit_unary_op(instr),
            HKind::Compare { bias } => self.visit_compare(instr, *bias),
            HKind::Condition { cond, bias } => self.visit_condition(instr, *cond, *bias),
            HKind::TypeConversion { from } => self.visit_type_conversion(instr, *from),

            HKind::If { true_block, false_block } => self.visit_if(instr, *true_block, *false_block),
            HKind::Goto { target } => self.visit_goto(*target),
            HKind::Return | HKind::ReturnVoid => self.cg.generate_frame_exit(),

            HKind::NullCheck => self.cg.generate_null_check(id),
            HKind::BoundsCheck => self.visit_bounds_check(instr),
            HKind::DivZeroCheck => self.visit_div_zero_check(instr),
            HKind::SuspendCheck => {
                if !self.cg.is_moved_suspend_check(id) {
                    self.cg.generate_suspend_check(id, None);
                }
            }

            HKind::InstanceFieldGet { offset, .. } | HKind::StaticFieldGet { offset, .. } => {
                self.visit_field_get(instr, *offset as i32)
            }
            HKind::InstanceFieldSet {
                offset,
                volatile,
                value_can_be_null,
            }
            | HKind::StaticFieldSet {
                offset,
                volatile,
                value_can_be_null,
            } => {
                self.generate_store(instr, 1, None, *offset as i32, *value_can_be_null);
                if *volatile {
                    self.cg.memory_fence();
                }
            }
            HKind::ArrayGet => self.visit_array_get(instr),
            HKind::ArraySet {
                value_can_be_null,
                needs_type_check,
            } => {
                let value_ty = graph.get(instr.input(2)).ty;
                if value_ty.is_reference() && *needs_type_check {
                    self.cg
                        .invoke_runtime(QuickEntrypoint::AputObject, id, SafepointKind::Call, RegisterSet::EMPTY);
                } else {
                    let index = instr.locations().in_at(1);
                    self.generate_store(instr, 2, Some(index), array_data_offset(value_ty), *value_can_be_null);
                }
            }
            HKind::ArrayLength => {
                let locations = instr.locations();
                let obj = locations.in_at(0).reg();
                let out = locations.out().reg();
                self.cg.asm.movl_rm(out, &Address::new(obj, ARRAY_LENGTH_OFFSET));
                self.cg.maybe_record_implicit_null_check(id);
            }

            HKind::NewInstance { type_index } => {
                self.runtime_call_with_index(QuickEntrypoint::AllocObject, id, type_index.0)
            }
            HKind::NewArray { type_index } => {
                self.runtime_call_with_index(QuickEntrypoint::AllocArray, id, type_index.0)
            }
            HKind::LoadClass { type_index, kind } => self.visit_load_class(instr, type_index.0, *kind),
            HKind::LoadString { string_index, kind } => self.visit_load_string(instr, string_index.0, *kind),
            HKind::LoadMethodType { proto_index, kind } => {
                self.visit_load_method_type(instr, proto_index.0, *kind)
            }
            HKind::LoadMethodHandle { index } => {
                self.runtime_call_with_index(QuickEntrypoint::ResolveMethodHandle, id, *index)
            }
            HKind::InstanceOf { check } => self.visit_instance_of(instr, *check),
            HKind::CheckCast { .. } => self.visit_check_cast(instr),
            HKind::MonitorOperation { enter } => {
                let entrypoint = if *enter {
                    QuickEntrypoint::LockObject
                } else {
                    QuickEntrypoint::UnlockObject
                };
                self.cg
                    .invoke_runtime(entrypoint, id, SafepointKind::Call, RegisterSet::EMPTY);
            }
            HKind::Throw => {
                self.cg
                    .invoke_runtime(QuickEntrypoint::DeliverException, id, SafepointKind::Call, RegisterSet::EMPTY);
            }
            HKind::Deoptimize { reason } => self.visit_deoptimize(instr, *reason),

            HKind::InvokeStaticOrDirect { method, dispatch } => {
                self.cg.generate_static_or_direct_call(id, *method, *dispatch)
            }
            HKind::InvokeVirtual { method, vtable_index } => {
                self.cg.generate_virtual_call(id, *method, *vtable_index)
            }
            HKind::InvokeInterface { method, imt_index } => {
                self.cg.generate_interface_call(id, *method, *imt_index)
            }
            HKind::InvokePolymorphic { method } => self.cg.generate_polymorphic_call(id, *method),
            HKind::InvokeIntrinsic { method, intrinsic } => {
                if instr.locations().is_intrinsified() {
                    IntrinsicCodeGenerator::new(self.cg).dispatch(id, *intrinsic)?;
                } else {
                    self.cg.generate_runtime_dispatch(
                        QuickEntrypoint::InvokeStaticTrampolineWithAccessCheck,
                        *method,
                        id,
                        SafepointKind::Call,
                        RegisterSet::EMPTY,
                    );
                }
            }

            HKind::ComputeBaseMethodAddress => {
                let out = instr.locations().out().reg();
                self.cg.generate_base_method_address(id, out);
            }
            HKind::ParallelMove(moves) => self.cg.parallel_move(moves),
            HKind::MemoryBarrier(kind) => match kind {
                MemBarrierKind::AnyAny => self.cg.memory_fence(),
                MemBarrierKind::NtStoreStore => self.cg.asm.mfence(),
                // x86 orders everything else already.
                MemBarrierKind::AnyStore | MemBarrierKind::LoadAny | MemBarrierKind::StoreStore => {}
            },

            HKind::IntConstant(_)
            | HKind::LongConstant(_)
            | HKind::FloatConstant(_)
            | HKind::DoubleConstant(_)
            | HKind::NullConstant
            | HKind::Parameter { .. } => {}
        }
        Ok(())
    }

    // =========================================================================
    // Operand helpers
    // =========================================================================

    /// `dst op= rhs` for a 32-bit or 64-bit integer operation.
    pub(crate) fn alu(&mut self, op: AluOp, wide: bool, dst: CpuRegister, rhs: Location) {
        let asm = &mut self.cg.asm;
        macro_rules! emit {
            ($rr32:ident, $rr64:ident, $ri32:ident, $ri64:ident, $rm32:ident, $rm64:ident) => {
                match (rhs, wide) {
                    (Location::Register(r), false) => asm.$rr32(dst, r),
                    (Location::Register(r), true) => asm.$rr64(dst, r),
                    (Location::Constant(c), false) => asm.$ri32(dst, Immediate(c as i32 as i64)),
                    (Location::Constant(c), true) => asm.$ri64(dst, Immediate(c)),
                    (Location::StackSlot(o) | Location::DoubleStackSlot(o), false) => asm.$rm32(dst, &stack(o)),
                    (Location::StackSlot(o) | Location::DoubleStackSlot(o), true) => asm.$rm64(dst, &stack(o)),
                    (other, _) => fatal!("ALU operand {}", other),
                }
            };
        }
        match op {
            AluOp::Add => emit!(addl_rr, addq_rr, addl_ri, addq_ri, addl_rm, addq_rm),
            AluOp::Sub => emit!(subl_rr, subq_rr, subl_ri, subq_ri, subl_rm, subq_rm),
            AluOp::And => emit!(andl_rr, andq_rr, andl_ri, andq_ri, andl_rm, andq_rm),
            AluOp::Or => emit!(orl_rr, orq_rr, orl_ri, orq_ri, orl_rm, orq_rm),
            AluOp::Xor => emit!(xorl_rr, xorq_rr, xorl_ri, xorq_ri, xorl_rm, xorq_rm),
            AluOp::Cmp => emit!(cmpl_rr, cmpq_rr, cmpl_ri, cmpq_ri, cmpl_rm, cmpq_rm),
        }
    }

    /// Memory operand for a floating-point `rhs` held in a slot or as a
    /// constant.
    fn fp_operand(&mut self, ty: DataType, rhs: Location) -> Option<Address> {
        match rhs {
            Location::StackSlot(o) | Location::DoubleStackSlot(o) => Some(stack(o)),
            Location::Constant(bits) if ty == DataType::Float64 => Some(self.cg.asm.literal_int64(bits)),
            Location::Constant(bits) => Some(self.cg.asm.literal_int32(bits as i32)),
            _ => None,
        }
    }

    /// `dst op= rhs` in scalar single or double precision.
    pub(crate) fn fp_op(&mut self, op: FpOp, ty: DataType, dst: XmmRegister, rhs: Location) {
        let double = ty == DataType::Float64;
        let memory = self.fp_operand(ty, rhs);
        let asm = &mut self.cg.asm;
        macro_rules! emit {
            ($ss_rr:ident, $ss_rm:ident, $sd_rr:ident, $sd_rm:ident) => {
                match (memory, rhs, double) {
                    (Some(addr), _, false) => asm.$ss_rm(dst, &addr),
                    (Some(addr), _, true) => asm.$sd_rm(dst, &addr),
                    (None, Location::FpuRegister(r), false) => asm.$ss_rr(dst, r),
                    (None, Location::FpuRegister(r), true) => asm.$sd_rr(dst, r),
                    (None, other, _) => fatal!("floating-point operand {}", other),
                }
            };
        }
        match op {
            FpOp::Add => emit!(addss_rr, addss_rm, addsd_rr, addsd_rm),
            FpOp::Sub => emit!(subss_rr, subss_rm, subsd_rr, subsd_rm),
            FpOp::Mul => emit!(mulss_rr, mulss_rm, mulsd_rr, mulsd_rm),
            FpOp::Div => emit!(divss_rr, divss_rm, divsd_rr, divsd_rm),
            FpOp::Compare => emit!(ucomiss_rr, ucomiss_rm, ucomisd_rr, ucomisd_rm),
        }
    }

    fn is_wide(&self, ty: DataType) -> bool {
        ty == DataType::Int64 && self.cg.isa == InstructionSet::X86_64
    }

    fn runtime_call_with_index(&mut self, entrypoint: QuickEntrypoint, id: InstructionId, index: u32) {
        let arg0 = runtime_argument(self.cg.isa, 0);
        self.cg.asm.movl_ri(arg0, Immediate(index as i64));
        self.cg
            .invoke_runtime(entrypoint, id, SafepointKind::Call, RegisterSet::EMPTY);
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    fn visit_binary_op(&mut self, instr: &HInstruction, op: AluOp, fp: FpOp) {
        let locations = instr.locations();
        let rhs = locations.in_at(1);
        if instr.ty.is_floating_point() {
            self.fp_op(fp, instr.ty, locations.out().xmm(), rhs);
        } else {
            self.alu(op, self.is_wide(instr.ty), locations.out().reg(), rhs);
        }
    }

    fn visit_mul(&mut self, instr: &HInstruction) {
        let locations = instr.locations();
        let rhs = locations.in_at(1);
        if instr.ty.is_floating_point() {
            self.fp_op(FpOp::Mul, instr.ty, locations.out().xmm(), rhs);
            return;
        }
        let out = locations.out().reg();
        let wide = self.is_wide(instr.ty);
        let asm = &mut self.cg.asm;
        match (rhs, wide) {
            (Location::Register(r), false) => asm.imull_rr(out, r),
            (Location::Register(r), true) => asm.imulq_rr(out, r),
            (Location::Constant(c), false) => asm.imull_rri(out, out, Immediate(c as i32 as i64)),
            (Location::Constant(c), true) => asm.imulq_rri(out, out, Immediate(c)),
            (other, _) => fatal!("multiplier in {}", other),
        }
    }

    fn visit_div_rem(&mut self, instr: &HInstruction) {
        let locations = instr.locations();
        let is_div = matches!(instr.kind, HKind::Div);
        if instr.ty.is_floating_point() {
            if is_div {
                self.fp_op(FpOp::Div, instr.ty, locations.out().xmm(), locations.in_at(1));
            } else {
                let entrypoint = if instr.ty == DataType::Float64 {
                    QuickEntrypoint::Fmod
                } else {
                    QuickEntrypoint::Fmodf
                };
                self.cg
                    .invoke_runtime(entrypoint, instr.id, SafepointKind::Call, RegisterSet::EMPTY);
            }
            return;
        }
        let divisor = locations.in_at(1).reg();
        let out = locations.out().reg();
        let wide = self.is_wide(instr.ty);
        // idiv traps on MIN / -1; the slow path produces the Java result.
        let slow = self
            .cg
            .add_slow_path(Box::new(DivRemMinusOneSlowPath::new(out, is_div, wide)));
        let asm = &mut self.cg.asm;
        if wide {
            asm.cmpq_ri(divisor, Immediate(-1));
        } else {
            asm.cmpl_ri(divisor, Immediate(-1));
        }
        self.cg.jump_to_slow_path(Some(Condition::Equal), slow);
        let asm = &mut self.cg.asm;
        if wide {
            asm.cqo();
            asm.idivq(divisor);
        } else {
            asm.cdq();
            asm.idivl(divisor);
        }
        self.cg.bind_slow_path_exit(slow);
    }

    fn visit_shift(&mut self, instr: &HInstruction) {
        let locations = instr.locations();
        let out = locations.out().reg();
        let wide = self.is_wide(instr.ty);
        let asm = &mut self.cg.asm;
        macro_rules! emit {
            ($ri32:ident, $ri64:ident, $cl32:ident, $cl64:ident) => {
                match (locations.in_at(1), wide) {
                    (Location::Constant(c), false) => {
                        if c & 0x1f != 0 {
                            asm.$ri32(out, Immediate(c & 0x1f));
                        }
                    }
                    (Location::Constant(c), true) => {
                        if c & 0x3f != 0 {
                            asm.$ri64(out, Immediate(c & 0x3f));
                        }
                    }
                    // The hardware masks the count like Java does.
                    (Location::Register(_), false) => asm.$cl32(out),
                    (Location::Register(_), true) => asm.$cl64(out),
                    (other, _) => fatal!("shift count in {}", other),
                }
            };
        }
        match instr.kind {
            HKind::Shl => emit!(shll_ri, shlq_ri, shll_cl, shlq_cl),
            HKind::Shr => emit!(sarl_ri, sarq_ri, sarl_cl, sarq_cl),
            _ => emit!(shrl_ri, shrq_ri, shrl_cl, shrq_cl),
        }
    }

    fn visit_unary_op(&mut self, instr: &HInstruction) {
        let locations = instr.locations();
        let is_neg = matches!(instr.kind, HKind::Neg);
        match instr.ty {
            DataType::Float32 if is_neg => {
                let mask = locations.temp(0).xmm();
                let literal = self.cg.asm.literal_int32(i32::MIN);
                self.cg.asm.movss_rm(mask, &literal);
                self.cg.asm.xorps_rr(locations.out().xmm(), mask);
            }
            DataType::Float64 if is_neg => {
                let mask = locations.temp(0).xmm();
                let literal = self.cg.asm.literal_int64(i64::MIN);
                self.cg.asm.movsd_rm(mask, &literal);
                self.cg.asm.xorpd_rr(locations.out().xmm(), mask);
            }
            ty => {
                let out = locations.out().reg();
                let wide = self.is_wide(ty);
                let asm = &mut self.cg.asm;
                match (is_neg, wide) {
                    (true, false) => asm.negl(out),
                    (true, true) => asm.negq(out),
                    (false, false) => asm.notl(out),
                    (false, true) => asm.notq(out),
                }
            }
        }
    }

    /// Compare inputs 0 and 1, leaving the flags set.
    fn compare_inputs(&mut self, instr: &HInstruction) -> DataType {
        let graph = self.cg.graph;
        let ty = graph.get(instr.input(0)).ty;
        let locations = instr.locations();
        if ty.is_floating_point() {
            self.fp_op(FpOp::Compare, ty, locations.in_at(0).xmm(), locations.in_at(1));
        } else {
            self.alu(AluOp::Cmp, self.is_wide(ty), locations.in_at(0).reg(), locations.in_at(1));
        }
        ty
    }

    fn visit_compare(&mut self, instr: &HInstruction, bias: ComparisonBias) {
        let out = instr.locations().out().reg();
        let mut less = NearLabel::new();
        let mut greater = NearLabel::new();
        let mut done = NearLabel::new();
        let ty = self.compare_inputs(instr);
        let asm = &mut self.cg.asm;
        let less_condition = if ty.is_floating_point() {
            let unordered = if bias == ComparisonBias::LtBias {
                &mut less
            } else {
                &mut greater
            };
            asm.j_near(Condition::ParityEven, unordered);
            Condition::Below
        } else {
            Condition::Less
        };
        // mov leaves the flags alone.
        asm.movl_ri(out, Immediate(0));
        asm.j_near(Condition::Equal, &mut done);
        asm.j_near(less_condition, &mut less);
        asm.bind_near(&mut greater);
        asm.movl_ri(out, Immediate(1));
        asm.jmp_near(&mut done);
        asm.bind_near(&mut less);
        asm.movl_ri(out, Immediate(-1));
        asm.bind_near(&mut done);
    }

    fn visit_condition(&mut self, instr: &HInstruction, cond: IfCondition, bias: ComparisonBias) {
        let out = instr.locations().out().reg();
        self.cg.asm.xorl_rr(out, out);
        let ty = self.compare_inputs(instr);
        let asm = &mut self.cg.asm;
        if !ty.is_floating_point() {
            asm.setcc(int_condition(cond), out);
            return;
        }
        let mut done = NearLabel::new();
        if nan_result(cond, bias) {
            let mut nan = NearLabel::new();
            asm.j_near(Condition::ParityEven, &mut nan);
            asm.setcc(fp_condition(cond), out);
            asm.jmp_near(&mut done);
            asm.bind_near(&mut nan);
            asm.movl_ri(out, Immediate(1));
        } else {
            asm.j_near(Condition::ParityEven, &mut done);
            asm.setcc(fp_condition(cond), out);
        }
        asm.bind_near(&mut done);
    }

    fn visit_type_conversion(&mut self, instr: &HInstruction, from: DataType) {
        let locations = instr.locations();
        let input = locations.in_at(0);
        let out = locations.out();
        let to = instr.ty;
        let x86 = self.cg.isa == InstructionSet::X86;
        let asm = &mut self.cg.asm;
        match (from, to) {
            (f, DataType::Int64) if f.is_int_or_smaller() => match out {
                Location::RegisterPair { low, high } => {
                    asm.movl_rr(low, input.reg());
                    asm.movl_rr(high, input.reg());
                    asm.sarl_ri(high, Immediate(31));
                }
                _ => asm.movsxd_rr(out.reg(), input.reg()),
            },
            (DataType::Int64, t) if t.is_int_or_smaller() => {
                let src = if x86 { input.low() } else { input.reg() };
                asm.movl_rr(out.reg(), src);
            }
            (_, DataType::Int8) => asm.movsxb_rr(out.reg(), input.reg()),
            (_, DataType::Int16) => asm.movsxw_rr(out.reg(), input.reg()),
            (_, DataType::Uint16) => asm.movzxw_rr(out.reg(), input.reg()),
            (f, DataType::Int32 | DataType::Bool) if f.is_int_or_smaller() => {
                if out != input {
                    asm.movl_rr(out.reg(), input.reg());
                }
            }
            (f, DataType::Float32) if !f.is_floating_point() => {
                asm.cvtsi2ss(out.xmm(), input.reg(), f == DataType::Int64)
            }
            (f, DataType::Float64) if !f.is_floating_point() => {
                asm.cvtsi2sd(out.xmm(), input.reg(), f == DataType::Int64)
            }
            (DataType::Float32, DataType::Float64) => asm.cvtss2sd_rr(out.xmm(), input.xmm()),
            (DataType::Float64, DataType::Float32) => asm.cvtsd2ss_rr(out.xmm(), input.xmm()),
            (DataType::Float32 | DataType::Float64, DataType::Int32 | DataType::Int64) => {
                self.generate_fp_to_int(from, to, input.xmm(), out.reg(), locations.temp(0).xmm())
            }
            (f, t) => fatal!("conversion from {:?} to {:?}", f, t),
        }
    }

    /// Java's saturating float-to-integer conversion: NaN becomes 0 and
    /// out-of-range values clamp. `cvtt` already yields the minimum value
    /// for negative overflow.
    pub(crate) fn generate_fp_to_int(
        &mut self,
        from: DataType,
        to: DataType,
        input: XmmRegister,
        out: CpuRegister,
        bound: XmmRegister,
    ) {
        let wide = to == DataType::Int64;
        let double = from == DataType::Float64;
        let mut nan = NearLabel::new();
        let mut done = NearLabel::new();
        let asm = &mut self.cg.asm;
        if wide {
            asm.movq_ri(out, Immediate(i64::MAX));
        } else {
            asm.movl_ri(out, Immediate(i32::MAX as i64));
        }
        if double {
            asm.cvtsi2sd(bound, out, wide);
            asm.comisd_rr(input, bound);
        } else {
            asm.cvtsi2ss(bound, out, wide);
            asm.comiss_rr(input, bound);
        }
        asm.j_near(Condition::AboveEqual, &mut done);
        asm.j_near(Condition::ParityEven, &mut nan);
        if double {
            asm.cvttsd2si(out, input, wide);
        } else {
            asm.cvttss2si(out, input, wide);
        }
        asm.jmp_near(&mut done);
        asm.bind_near(&mut nan);
        asm.xorl_rr(out, out);
        asm.bind_near(&mut done);
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    fn is_next_block(&self, block: BlockId) -> bool {
        block.index() == self.cg.current_block.index() + 1
    }

    fn jump_to_block(&mut self, block: BlockId) {
        if !self.is_next_block(block) {
            self.cg.asm.jmp(&mut self.cg.block_labels[block.index()]);
        }
    }

    fn visit_if(&mut self, instr: &HInstruction, true_block: BlockId, false_block: BlockId) {
        let condition = instr.locations().in_at(0);
        match condition {
            Location::Constant(c) => {
                self.jump_to_block(if c != 0 { true_block } else { false_block });
                return;
            }
            Location::Register(r) => self.cg.asm.testl_rr(r, r),
            Location::StackSlot(o) => self.cg.asm.cmpl_mi(&stack(o), Immediate(0)),
            other => fatal!("branch condition in {}", other),
        }
        if self.is_next_block(true_block) {
            self.cg
                .asm
                .j(Condition::Equal, &mut self.cg.block_labels[false_block.index()]);
        } else {
            self.cg
                .asm
                .j(Condition::NotEqual, &mut self.cg.block_labels[true_block.index()]);
            self.jump_to_block(false_block);
        }
    }

    fn visit_goto(&mut self, target: BlockId) {
        if let Some(check) = self.cg.back_edge_suspend_check(target) {
            self.cg.generate_suspend_check(check, Some(target));
            return;
        }
        self.jump_to_block(target);
    }

    // =========================================================================
    // Checks
    // =========================================================================

    fn visit_bounds_check(&mut self, instr: &HInstruction) {
        let locations = instr.locations();
        let index = locations.in_at(0);
        let length = locations.in_at(1);
        if let (Location::Constant(i), Location::Constant(l)) = (index, length) {
            if (i as u32) < (l as u32) {
                return;
            }
        }
        let slow = self
            .cg
            .add_slow_path(Box::new(BoundsCheckSlowPath::new(instr.id, index, length)));
        let asm = &mut self.cg.asm;
        let failure = match (index, length) {
            (Location::Constant(_), Location::Constant(_)) => None,
            (Location::Constant(i), Location::Register(l)) => {
                asm.cmpl_ri(l, Immediate(i as i32 as i64));
                Some(Condition::BelowEqual)
            }
            (Location::Constant(i), Location::StackSlot(o)) => {
                asm.cmpl_mi(&stack(o), Immediate(i as i32 as i64));
                Some(Condition::BelowEqual)
            }
            (Location::Register(i), Location::Register(l)) => {
                asm.cmpl_rr(i, l);
                Some(Condition::AboveEqual)
            }
            (Location::Register(i), Location::StackSlot(o)) => {
                asm.cmpl_rm(i, &stack(o));
                Some(Condition::AboveEqual)
            }
            (Location::Register(i), Location::Constant(l)) => {
                asm.cmpl_ri(i, Immediate(l as i32 as i64));
                Some(Condition::AboveEqual)
            }
            (i, l) => fatal!("bounds check of {} against {}", i, l),
        };
        self.cg.jump_to_slow_path(failure, slow);
    }

    fn visit_div_zero_check(&mut self, instr: &HInstruction) {
        let value = instr.locations().in_at(0);
        if let Location::Constant(c) = value {
            if c != 0 {
                return;
            }
        }
        let slow = self
            .cg
            .add_slow_path(Box::new(DivZeroCheckSlowPath::new(instr.id)));
        let scratch = scratch_register(self.cg.isa);
        let x86 = self.cg.isa == InstructionSet::X86;
        let asm = &mut self.cg.asm;
        match value {
            Location::Constant(_) => {
                self.cg.jump_to_slow_path(None, slow);
                return;
            }
            Location::Register(r) if self.cg.graph.get(instr.input(0)).ty == DataType::Int64 => asm.testq_rr(r, r),
            Location::Register(r) => asm.testl_rr(r, r),
            Location::RegisterPair { low, high } => {
                asm.movl_rr(scratch, low);
                asm.orl_rr(scratch, high);
            }
            Location::StackSlot(o) => asm.cmpl_mi(&stack(o), Immediate(0)),
            Location::DoubleStackSlot(o) if x86 => {
                asm.movl_rm(scratch, &stack(o));
                asm.orl_rm(scratch, &stack(o + 4));
            }
            Location::DoubleStackSlot(o) => asm.cmpq_mi(&stack(o), Immediate(0)),
            other => fatal!("divisor in {}", other),
        }
        self.cg.jump_to_slow_path(Some(Condition::Equal), slow);
    }

    fn visit_deoptimize(&mut self, instr: &HInstruction, reason: u32) {
        let condition = instr.locations().in_at(0);
        if condition == Location::Constant(0) {
            return;
        }
        let slow = self
            .cg
            .add_slow_path(Box::new(DeoptimizationSlowPath::new(instr.id, reason)));
        let cond = match condition {
            Location::Constant(_) => None,
            Location::Register(r) => {
                self.cg.asm.testl_rr(r, r);
                Some(Condition::NotEqual)
            }
            Location::StackSlot(o) => {
                self.cg.asm.cmpl_mi(&stack(o), Immediate(0));
                Some(Condition::NotEqual)
            }
            other => fatal!("deoptimization condition in {}", other),
        };
        self.cg.jump_to_slow_path(cond, slow);
    }

    // =========================================================================
    // Fields and arrays
    // =========================================================================

    fn visit_field_get(&mut self, instr: &HInstruction, offset: i32) {
        let locations = instr.locations();
        let obj = locations.in_at(0).reg();
        let out = locations.out();
        if instr.ty.is_reference() {
            let saved = SavedRegisters::of(locations);
            self.cg
                .generate_reference_load_with_barrier(instr.id, out.reg(), obj, offset, None, saved);
        } else {
            self.cg
                .load_from_offset(instr.ty, out, obj, None, ScaleFactor::Times1, offset);
            self.cg.maybe_record_implicit_null_check(instr.id);
        }
    }

    fn visit_array_get(&mut self, instr: &HInstruction) {
        let locations = instr.locations();
        let array = locations.in_at(0).reg();
        let index = locations.in_at(1);
        let out = locations.out();
        let ty = instr.ty;
        if ty.is_reference() {
            let saved = SavedRegisters::of(locations);
            self.cg
                .generate_reference_load_with_barrier(instr.id, out.reg(), array, ARRAY_DATA_OFFSET, Some(index), saved);
        } else {
            let scale = ScaleFactor::for_size(ty.size());
            self.cg
                .load_from_offset(ty, out, array, Some(index), scale, array_data_offset(ty));
            self.cg.maybe_record_implicit_null_check(instr.id);
        }
    }

    /// Store input `value` to `[input 0 + index * size + offset]`, with
    /// poisoning and a card mark for references.
    fn generate_store(
        &mut self,
        instr: &HInstruction,
        value: usize,
        index: Option<Location>,
        offset: i32,
        value_can_be_null: bool,
    ) {
        let locations = instr.locations();
        let obj = locations.in_at(0).reg();
        let mut stored = locations.in_at(value);
        let ty = self.cg.graph.get(instr.input(value)).ty;
        let scale = ScaleFactor::for_size(ty.size().max(1));
        let needs_card = ty.is_reference() && !stored.is_constant();
        if needs_card && self.cg.options.heap_poisoning {
            let temp = locations.temp(0).reg();
            self.cg.asm.movl_rr(temp, stored.reg());
            self.cg.maybe_poison_heap_reference(temp);
            stored = Location::Register(temp);
        }
        self.cg.store_to_offset(ty, stored, obj, index, scale, offset);
        self.cg.maybe_record_implicit_null_check(instr.id);
        if needs_card {
            let temp = locations.temp(0).reg();
            let card = locations.temp(1).reg();
            let value_reg = locations.in_at(value).reg();
            self.cg
                .mark_gc_card(temp, card, obj, value_reg, value_can_be_null);
        }
    }

    // =========================================================================
    // Class, string and method-type loads
    // =========================================================================

    fn visit_load_class(&mut self, instr: &HInstruction, type_index: u32, kind: LoadKind) {
        let id = instr.id;
        let locations = instr.locations();
        let saved = SavedRegisters::of(locations);
        match kind {
            LoadKind::ReferrersClass => {
                let out = locations.out().reg();
                self.cg.load_pointer(out, &stack(0));
                let declaring_class = Address::new(out, self.cg.method_layout.declaring_class());
                self.cg.generate_gc_root_load(id, out, &declaring_class, None, saved);
            }
            LoadKind::RuntimeCall => self.runtime_call_with_index(QuickEntrypoint::ResolveType, id, type_index),
            _ => self.generate_pc_relative_load(
                instr,
                kind,
                type_index,
                [PatchKind::BootImageType, PatchKind::AppImageRelRo, PatchKind::TypeBssEntry],
                ResolveSlowPath::load_class,
            ),
        }
    }

    fn visit_load_string(&mut self, instr: &HInstruction, string_index: u32, kind: LoadKind) {
        match kind {
            LoadKind::RuntimeCall => {
                self.runtime_call_with_index(QuickEntrypoint::ResolveString, instr.id, string_index)
            }
            LoadKind::ReferrersClass => fatal!("{}: string loaded from the referrer", instr.id),
            _ => self.generate_pc_relative_load(
                instr,
                kind,
                string_index,
                [PatchKind::BootImageString, PatchKind::AppImageRelRo, PatchKind::StringBssEntry],
                ResolveSlowPath::load_string,
            ),
        }
    }

    fn visit_load_method_type(&mut self, instr: &HInstruction, proto_index: u32, kind: LoadKind) {
        match kind {
            LoadKind::BssEntry => self.generate_pc_relative_load(
                instr,
                kind,
                proto_index,
                [PatchKind::MethodTypeBssEntry; 3],
                ResolveSlowPath::load_method_type,
            ),
            _ => self.runtime_call_with_index(QuickEntrypoint::ResolveMethodType, instr.id, proto_index),
        }
    }

    /// Boot-image address, relocated boot-image slot or `.bss` slot.
    /// `patches` holds the patch kind for each of those in that order.
    fn generate_pc_relative_load(
        &mut self,
        instr: &HInstruction,
        kind: LoadKind,
        index: u32,
        patches: [PatchKind; 3],
        resolve: fn(InstructionId, u32, Location, SavedRegisters) -> ResolveSlowPath,
    ) {
        let id = instr.id;
        let locations = instr.locations();
        let out = locations.out().reg();
        match kind {
            LoadKind::BootImageLinkTimePcRelative => {
                self.cg
                    .emit_pc_relative(id, patches[0], index, |cg, addr| cg.asm.leal_rm(out, addr));
            }
            LoadKind::BootImageRelRo => {
                self.cg
                    .emit_pc_relative(id, patches[1], index, |cg, addr| cg.asm.movl_rm(out, addr));
            }
            LoadKind::BssEntry => {
                let saved = SavedRegisters::of(locations);
                let addr = self.cg.pc_relative_address(id);
                let base = self.cg.pc_relative_base(id).map(|b| b.0);
                self.cg
                    .generate_gc_root_load(id, out, &addr, Some((patches[2], index, base)), saved);
                let slow = self
                    .cg
                    .add_slow_path(Box::new(resolve(id, index, Location::Register(out), saved)));
                self.cg.asm.testl_rr(out, out);
                self.cg.jump_to_slow_path(Some(Condition::Equal), slow);
                self.cg.bind_slow_path_exit(slow);
            }
            LoadKind::ReferrersClass | LoadKind::RuntimeCall => fatal!("{}: {:?} is not PC-relative", id, kind),
        }
    }

    // =========================================================================
    // Type checks
    // =========================================================================

    fn visit_instance_of(&mut self, instr: &HInstruction, check: TypeCheckKind) {
        let locations = instr.locations();
        let obj = locations.in_at(0).reg();
        let class = locations.in_at(1).reg();
        let out = locations.out().reg();
        let mut zero = NearLabel::new();
        let mut done = NearLabel::new();
        self.cg.asm.testl_rr(obj, obj);
        self.cg.asm.j_near(Condition::Equal, &mut zero);
        self.cg.asm.movl_rm(out, &Address::new(obj, CLASS_OFFSET));
        self.cg.maybe_unpoison_heap_reference(out);
        self.cg.asm.cmpl_rr(out, class);
        let slow = match check {
            TypeCheckKind::ExactCheck => {
                self.cg.asm.j_near(Condition::NotEqual, &mut zero);
                None
            }
            TypeCheckKind::UnresolvedCheck => {
                let saved = SavedRegisters::of(locations);
                let slow = self.cg.add_slow_path(Box::new(TypeCheckSlowPath::instance_of(
                    instr.id,
                    Location::Register(out),
                    Location::Register(class),
                    Location::Register(out),
                    saved,
                )));
                self.cg.jump_to_slow_path(Some(Condition::NotEqual), slow);
                Some(slow)
            }
        };
        self.cg.asm.movl_ri(out, Immediate(1));
        self.cg.asm.jmp_near(&mut done);
        self.cg.asm.bind_near(&mut zero);
        self.cg.asm.xorl_rr(out, out);
        self.cg.asm.bind_near(&mut done);
        if let Some(slow) = slow {
            self.cg.bind_slow_path_exit(slow);
        }
    }

    /// Exact and unresolved casts share one shape: a class-pointer compare
    /// and the runtime for the rest, which throws on failure.
    fn visit_check_cast(&mut self, instr: &HInstruction) {
        let locations = instr.locations();
        let obj = locations.in_at(0).reg();
        let class = locations.in_at(1).reg();
        let temp = locations.temp(0).reg();
        let saved = SavedRegisters::of(locations);
        let slow = self.cg.add_slow_path(Box::new(TypeCheckSlowPath::check_cast(
            instr.id,
            Location::Register(obj),
            Location::Register(class),
            saved,
        )));
        let mut done = NearLabel::new();
        self.cg.asm.testl_rr(obj, obj);
        self.cg.asm.j_near(Condition::Equal, &mut done);
        self.cg.asm.movl_rm(temp, &Address::new(obj, CLASS_OFFSET));
        self.cg.maybe_unpoison_heap_reference(temp);
        self.cg.asm.cmpl_rr(temp, class);
        self.cg.jump_to_slow_path(Some(Condition::NotEqual), slow);
        self.cg.asm.bind_near(&mut done);
        self.cg.bind_slow_path_exit(slow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_tables() {
        assert_eq!(int_condition(IfCondition::Lt), Condition::Less);
        assert_eq!(int_condition(IfCondition::Ae), Condition::AboveEqual);
        assert_eq!(fp_condition(IfCondition::Lt), Condition::Below);
        assert_eq!(fp_condition(IfCondition::Ge), Condition::AboveEqual);
    }

    #[test]
    fn test_nan_results_follow_bias() {
        // cmpg: NaN compares greater, so `<` is false and `>` true.
        assert!(!nan_result(IfCondition::Lt, ComparisonBias::GtBias));
        assert!(nan_result(IfCondition::Gt, ComparisonBias::GtBias));
        // cmpl: NaN compares less.
        assert!(nan_result(IfCondition::Le, ComparisonBias::LtBias));
        assert!(!nan_result(IfCondition::Ge, ComparisonBias::LtBias));
        assert!(!nan_result(IfCondition::Eq, ComparisonBias::GtBias));
        assert!(nan_result(IfCondition::Ne, ComparisonBias::LtBias));
    }
}
