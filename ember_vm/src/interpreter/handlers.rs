//! Register moves, constants, returns, branches and arithmetic.

use super::switch_impl::{ControlFlow, Interp};
use crate::bytecode::Instruction;
use crate::class_linker::descriptors as d;
use crate::value::JValue;
use ember_core::arith::{self, DivOutcome};

// =============================================================================
// Operand shapes
// =============================================================================

/// `(destination, left, right)` of a 32-bit binary operation.
macro_rules! int_operands {
    (x23, $f:ident, $inst:ident) => {
        (
            $inst.vreg_a() as usize,
            $f.get_vreg($inst.vreg_b() as usize),
            $f.get_vreg($inst.vreg_c() as usize),
        )
    };
    (addr2, $f:ident, $inst:ident) => {
        (
            $inst.vreg_a() as usize,
            $f.get_vreg($inst.vreg_a() as usize),
            $f.get_vreg($inst.vreg_b() as usize),
        )
    };
    (lit16, $f:ident, $inst:ident) => {
        (
            $inst.vreg_a() as usize,
            $f.get_vreg($inst.vreg_b() as usize),
            $inst.literal_s16(1),
        )
    };
    (lit8, $f:ident, $inst:ident) => {
        ($inst.vreg_a() as usize, $f.get_vreg($inst.vreg_b() as usize), $inst.literal_22b())
    };
}

macro_rules! int_op {
    ($name:ident, $form:ident, |$x:ident, $y:ident| $e:expr) => {
        pub(super) fn $name(&mut self, inst: Instruction<'_>) -> ControlFlow {
            let mut f = self.frame();
            let (dst, $x, $y) = int_operands!($form, f, inst);
            f.set_vreg(dst, $e);
            ControlFlow::Continue
        }
    };
}

macro_rules! int_div_op {
    ($name:ident, $form:ident, $op:path) => {
        pub(super) fn $name(&mut self, inst: Instruction<'_>) -> ControlFlow {
            let (dst, outcome) = {
                let f = self.frame();
                let (dst, x, y) = int_operands!($form, f, inst);
                (dst, $op(x, y))
            };
            self.store_int_quotient(dst, outcome)
        }
    };
}

macro_rules! long_op {
    ($name:ident, x23, |$x:ident, $y:ident| $e:expr) => {
        pub(super) fn $name(&mut self, inst: Instruction<'_>) -> ControlFlow {
            let mut f = self.frame();
            let $x = f.get_vreg_long(inst.vreg_b() as usize);
            let $y = f.get_vreg_long(inst.vreg_c() as usize);
            f.set_vreg_long(inst.vreg_a() as usize, $e);
            ControlFlow::Continue
        }
    };
    ($name:ident, addr2, |$x:ident, $y:ident| $e:expr) => {
        pub(super) fn $name(&mut self, inst: Instruction<'_>) -> ControlFlow {
            let mut f = self.frame();
            let $x = f.get_vreg_long(inst.vreg_a() as usize);
            let $y = f.get_vreg_long(inst.vreg_b() as usize);
            f.set_vreg_long(inst.vreg_a() as usize, $e);
            ControlFlow::Continue
        }
    };
}

/// Long shifts take their distance from a 32-bit register.
macro_rules! long_shift_op {
    ($name:ident, x23, $op:path) => {
        pub(super) fn $name(&mut self, inst: Instruction<'_>) -> ControlFlow {
            let mut f = self.frame();
            let value = f.get_vreg_long(inst.vreg_b() as usize);
            let distance = f.get_vreg(inst.vreg_c() as usize);
            f.set_vreg_long(inst.vreg_a() as usize, $op(value, distance));
            ControlFlow::Continue
        }
    };
    ($name:ident, addr2, $op:path) => {
        pub(super) fn $name(&mut self, inst: Instruction<'_>) -> ControlFlow {
            let mut f = self.frame();
            let value = f.get_vreg_long(inst.vreg_a() as usize);
            let distance = f.get_vreg(inst.vreg_b() as usize);
            f.set_vreg_long(inst.vreg_a() as usize, $op(value, distance));
            ControlFlow::Continue
        }
    };
}

macro_rules! long_div_op {
    ($name:ident, $a:ident, $b:ident, $op:path) => {
        pub(super) fn $name(&mut self, inst: Instruction<'_>) -> ControlFlow {
            let (dst, outcome) = {
                let f = self.frame();
                let x = f.get_vreg_long(inst.$a() as usize);
                let y = f.get_vreg_long(inst.$b() as usize);
                (inst.vreg_a() as usize, $op(x, y))
            };
            match outcome {
                DivOutcome::Value(v) => {
                    self.frame().set_vreg_long(dst, v);
                    ControlFlow::Continue
                }
                DivOutcome::DivideByZero => self.throw_divide_by_zero(),
            }
        }
    };
}

macro_rules! float_op {
    ($name:ident, $get:ident, $set:ident, $a:ident, $b:ident, |$x:ident, $y:ident| $e:expr) => {
        pub(super) fn $name(&mut self, inst: Instruction<'_>) -> ControlFlow {
            let mut f = self.frame();
            let $x = f.$get(inst.$a() as usize);
            let $y = f.$get(inst.$b() as usize);
            f.$set(inst.vreg_a() as usize, $e);
            ControlFlow::Continue
        }
    };
}

/// `vA = op(vB)` with the given register views.
macro_rules! unary_op {
    ($name:ident, $get:ident, $set:ident, |$x:ident| $e:expr) => {
        pub(super) fn $name(&mut self, inst: Instruction<'_>) -> ControlFlow {
            let mut f = self.frame();
            let $x = f.$get(inst.vreg_b() as usize);
            f.$set(inst.vreg_a() as usize, $e);
            ControlFlow::Continue
        }
    };
}

macro_rules! compare_op {
    ($name:ident, $get:ident, $op:path) => {
        pub(super) fn $name(&mut self, inst: Instruction<'_>) -> ControlFlow {
            let mut f = self.frame();
            let result = $op(f.$get(inst.vreg_b() as usize), f.$get(inst.vreg_c() as usize));
            f.set_vreg(inst.vreg_a() as usize, result);
            ControlFlow::Continue
        }
    };
}

macro_rules! if_test {
    ($name:ident, $cmp:tt) => {
        pub(super) fn $name(&mut self, inst: Instruction<'_>) -> ControlFlow {
            let taken = {
                let f = self.frame();
                f.get_vreg(inst.vreg_a() as usize) $cmp f.get_vreg(inst.vreg_b() as usize)
            };
            if taken {
                ControlFlow::Branch(inst.branch_offset())
            } else {
                ControlFlow::Continue
            }
        }
    };
}

macro_rules! if_testz {
    ($name:ident, $cmp:tt) => {
        pub(super) fn $name(&mut self, inst: Instruction<'_>) -> ControlFlow {
            if self.frame().get_vreg(inst.vreg_a() as usize) $cmp 0 {
                ControlFlow::Branch(inst.branch_offset())
            } else {
                ControlFlow::Continue
            }
        }
    };
}

impl<const TRANSACTION_ACTIVE: bool, const INSTRUMENTED: bool> Interp<'_, TRANSACTION_ACTIVE, INSTRUMENTED> {
    fn throw_divide_by_zero(&self) -> ControlFlow {
        self.throw(d::ARITHMETIC_EXCEPTION, Some("divide by zero"))
    }

    fn store_int_quotient(&self, dst: usize, outcome: DivOutcome<i32>) -> ControlFlow {
        match outcome {
            DivOutcome::Value(v) => {
                self.frame().set_vreg(dst, v);
                ControlFlow::Continue
            }
            DivOutcome::DivideByZero => self.throw_divide_by_zero(),
        }
    }

    // =========================================================================
    // Moves
    // =========================================================================

    pub(super) fn nop(&mut self, _inst: Instruction<'_>) -> ControlFlow {
        ControlFlow::Continue
    }

    fn copy(&mut self, dst: u32, src: u32) -> ControlFlow {
        self.frame().copy_vreg(dst as usize, src as usize);
        ControlFlow::Continue
    }

    fn copy_wide(&mut self, dst: u32, src: u32) -> ControlFlow {
        let mut f = self.frame();
        let value = f.get_vreg_long(src as usize);
        f.set_vreg_long(dst as usize, value);
        ControlFlow::Continue
    }

    pub(super) fn move_(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.copy(inst.vreg_a(), inst.vreg_b())
    }

    pub(super) fn move_from16(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.copy(inst.vreg_a(), inst.vreg_b())
    }

    pub(super) fn move_16(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.copy(inst.vreg_a(), inst.vreg_b())
    }

    pub(super) fn move_wide(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.copy_wide(inst.vreg_a(), inst.vreg_b())
    }

    pub(super) fn move_wide_from16(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.copy_wide(inst.vreg_a(), inst.vreg_b())
    }

    pub(super) fn move_wide_16(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.copy_wide(inst.vreg_a(), inst.vreg_b())
    }

    pub(super) fn move_object(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.copy(inst.vreg_a(), inst.vreg_b())
    }

    pub(super) fn move_object_from16(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.copy(inst.vreg_a(), inst.vreg_b())
    }

    pub(super) fn move_object_16(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.copy(inst.vreg_a(), inst.vreg_b())
    }

    pub(super) fn move_result(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let mut f = self.frame();
        let value = f.result_register.int();
        f.set_vreg(inst.vreg_a() as usize, value);
        ControlFlow::Continue
    }

    pub(super) fn move_result_wide(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let mut f = self.frame();
        let value = f.result_register.long();
        f.set_vreg_long(inst.vreg_a() as usize, value);
        ControlFlow::Continue
    }

    pub(super) fn move_result_object(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let mut f = self.frame();
        let value = f.result_register.reference();
        f.set_vreg_reference(inst.vreg_a() as usize, value);
        ControlFlow::Continue
    }

    pub(super) fn move_exception(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let mut f = self.frame();
        let exception = f.caught_exception.take();
        f.set_vreg_reference(inst.vreg_a() as usize, exception);
        ControlFlow::Continue
    }

    // =========================================================================
    // Returns
    // =========================================================================

    pub(super) fn return_void(&mut self, _inst: Instruction<'_>) -> ControlFlow {
        ControlFlow::Return(JValue::VOID)
    }

    pub(super) fn return_(&mut self, inst: Instruction<'_>) -> ControlFlow {
        ControlFlow::Return(JValue::from_int(self.frame().get_vreg(inst.vreg_a() as usize)))
    }

    pub(super) fn return_wide(&mut self, inst: Instruction<'_>) -> ControlFlow {
        ControlFlow::Return(JValue::from_long(self.frame().get_vreg_long(inst.vreg_a() as usize)))
    }

    pub(super) fn return_object(&mut self, inst: Instruction<'_>) -> ControlFlow {
        ControlFlow::Return(JValue::from_ref(self.frame().get_vreg_reference(inst.vreg_a() as usize)))
    }

    // =========================================================================
    // Constants
    // =========================================================================

    fn set_int(&mut self, dst: u32, value: i32) -> ControlFlow {
        self.frame().set_vreg(dst as usize, value);
        ControlFlow::Continue
    }

    fn set_long(&mut self, dst: u32, value: i64) -> ControlFlow {
        self.frame().set_vreg_long(dst as usize, value);
        ControlFlow::Continue
    }

    pub(super) fn const_4(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.set_int(inst.vreg_a(), inst.literal_11n())
    }

    pub(super) fn const_16(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.set_int(inst.vreg_a(), inst.literal_s16(1))
    }

    pub(super) fn const_(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.set_int(inst.vreg_a(), inst.vreg_b() as i32)
    }

    pub(super) fn const_high16(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.set_int(inst.vreg_a(), inst.literal_s16(1) << 16)
    }

    pub(super) fn const_wide_16(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.set_long(inst.vreg_a(), i64::from(inst.literal_s16(1)))
    }

    pub(super) fn const_wide_32(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.set_long(inst.vreg_a(), i64::from(inst.vreg_b() as i32))
    }

    pub(super) fn const_wide(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.set_long(inst.vreg_a(), inst.wide_literal())
    }

    pub(super) fn const_wide_high16(&mut self, inst: Instruction<'_>) -> ControlFlow {
        self.set_long(inst.vreg_a(), i64::from(inst.literal_s16(1)) << 48)
    }

    // =========================================================================
    // Branches
    // =========================================================================

    pub(super) fn goto(&mut self, inst: Instruction<'_>) -> ControlFlow {
        ControlFlow::Branch(inst.branch_offset())
    }

    pub(super) fn goto_16(&mut self, inst: Instruction<'_>) -> ControlFlow {
        ControlFlow::Branch(inst.branch_offset())
    }

    pub(super) fn goto_32(&mut self, inst: Instruction<'_>) -> ControlFlow {
        ControlFlow::Branch(inst.branch_offset())
    }

    pub(super) fn packed_switch(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let key = self.frame().get_vreg(inst.vreg_a() as usize);
        let Some(payload) = inst.packed_switch_payload() else {
            ember_core::fatal!("{}: bad packed-switch payload at {}", self.method.name, self.dex_pc);
        };
        payload.lookup(key).map_or(ControlFlow::Continue, ControlFlow::Branch)
    }

    pub(super) fn sparse_switch(&mut self, inst: Instruction<'_>) -> ControlFlow {
        let key = self.frame().get_vreg(inst.vreg_a() as usize);
        let Some(payload) = inst.sparse_switch_payload() else {
            ember_core::fatal!("{}: bad sparse-switch payload at {}", self.method.name, self.dex_pc);
        };
        payload.lookup(key).map_or(ControlFlow::Continue, ControlFlow::Branch)
    }

    if_test!(if_eq, ==);
    if_test!(if_ne, !=);
    if_test!(if_lt, <);
    if_test!(if_ge, >=);
    if_test!(if_gt, >);
    if_test!(if_le, <=);
    if_testz!(if_eqz, ==);
    if_testz!(if_nez, !=);
    if_testz!(if_ltz, <);
    if_testz!(if_gez, >=);
    if_testz!(if_gtz, >);
    if_testz!(if_lez, <=);

    // =========================================================================
    // Comparisons
    // =========================================================================

    compare_op!(cmpl_float, get_vreg_float, arith::cmpl_float);
    compare_op!(cmpg_float, get_vreg_float, arith::cmpg_float);
    compare_op!(cmpl_double, get_vreg_double, arith::cmpl_double);
    compare_op!(cmpg_double, get_vreg_double, arith::cmpg_double);
    compare_op!(cmp_long, get_vreg_long, arith::cmp_long);

    // =========================================================================
    // Unary operations and conversions
    // =========================================================================

    unary_op!(neg_int, get_vreg, set_vreg, |x| x.wrapping_neg());
    unary_op!(not_int, get_vreg, set_vreg, |x| !x);
    unary_op!(neg_long, get_vreg_long, set_vreg_long, |x| x.wrapping_neg());
    unary_op!(not_long, get_vreg_long, set_vreg_long, |x| !x);
    unary_op!(neg_float, get_vreg_float, set_vreg_float, |x| -x);
    unary_op!(neg_double, get_vreg_double, set_vreg_double, |x| -x);
    unary_op!(int_to_long, get_vreg, set_vreg_long, |x| i64::from(x));
    unary_op!(int_to_float, get_vreg, set_vreg_float, |x| x as f32);
    unary_op!(int_to_double, get_vreg, set_vreg_double, |x| f64::from(x));
    unary_op!(long_to_int, get_vreg_long, set_vreg, |x| x as i32);
    unary_op!(long_to_float, get_vreg_long, set_vreg_float, |x| x as f32);
    unary_op!(long_to_double, get_vreg_long, set_vreg_double, |x| x as f64);
    unary_op!(float_to_int, get_vreg_float, set_vreg, |x| arith::f2i(x));
    unary_op!(float_to_long, get_vreg_float, set_vreg_long, |x| arith::f2l(x));
    unary_op!(float_to_double, get_vreg_float, set_vreg_double, |x| f64::from(x));
    unary_op!(double_to_int, get_vreg_double, set_vreg, |x| arith::d2i(x));
    unary_op!(double_to_long, get_vreg_double, set_vreg_long, |x| arith::d2l(x));
    unary_op!(double_to_float, get_vreg_double, set_vreg_float, |x| x as f32);
    unary_op!(int_to_byte, get_vreg, set_vreg, |x| i32::from(x as i8));
    unary_op!(int_to_char, get_vreg, set_vreg, |x| i32::from(x as u16));
    unary_op!(int_to_short, get_vreg, set_vreg, |x| i32::from(x as i16));

    // =========================================================================
    // 32-bit integer arithmetic
    // =========================================================================

    int_op!(add_int, x23, |x, y| arith::safe_add(x, y));
    int_op!(sub_int, x23, |x, y| arith::safe_sub(x, y));
    int_op!(mul_int, x23, |x, y| arith::safe_mul(x, y));
    int_div_op!(div_int, x23, arith::div_int);
    int_div_op!(rem_int, x23, arith::rem_int);
    int_op!(and_int, x23, |x, y| x & y);
    int_op!(or_int, x23, |x, y| x | y);
    int_op!(xor_int, x23, |x, y| x ^ y);
    int_op!(shl_int, x23, |x, y| arith::shl_int(x, y));
    int_op!(shr_int, x23, |x, y| arith::shr_int(x, y));
    int_op!(ushr_int, x23, |x, y| arith::ushr_int(x, y));

    int_op!(add_int_2addr, addr2, |x, y| arith::safe_add(x, y));
    int_op!(sub_int_2addr, addr2, |x, y| arith::safe_sub(x, y));
    int_op!(mul_int_2addr, addr2, |x, y| arith::safe_mul(x, y));
    int_div_op!(div_int_2addr, addr2, arith::div_int);
    int_div_op!(rem_int_2addr, addr2, arith::rem_int);
    int_op!(and_int_2addr, addr2, |x, y| x & y);
    int_op!(or_int_2addr, addr2, |x, y| x | y);
    int_op!(xor_int_2addr, addr2, |x, y| x ^ y);
    int_op!(shl_int_2addr, addr2, |x, y| arith::shl_int(x, y));
    int_op!(shr_int_2addr, addr2, |x, y| arith::shr_int(x, y));
    int_op!(ushr_int_2addr, addr2, |x, y| arith::ushr_int(x, y));

    int_op!(add_int_lit16, lit16, |x, y| arith::safe_add(x, y));
    int_op!(rsub_int, lit16, |x, y| arith::safe_sub(y, x));
    int_op!(mul_int_lit16, lit16, |x, y| arith::safe_mul(x, y));
    int_div_op!(div_int_lit16, lit16, arith::div_int);
    int_div_op!(rem_int_lit16, lit16, arith::rem_int);
    int_op!(and_int_lit16, lit16, |x, y| x & y);
    int_op!(or_int_lit16, lit16, |x, y| x | y);
    int_op!(xor_int_lit16, lit16, |x, y| x ^ y);

    int_op!(add_int_lit8, lit8, |x, y| arith::safe_add(x, y));
    int_op!(rsub_int_lit8, lit8, |x, y| arith::safe_sub(y, x));
    int_op!(mul_int_lit8, lit8, |x, y| arith::safe_mul(x, y));
    int_div_op!(div_int_lit8, lit8, arith::div_int);
    int_div_op!(rem_int_lit8, lit8, arith::rem_int);
    int_op!(and_int_lit8, lit8, |x, y| x & y);
    int_op!(or_int_lit8, lit8, |x, y| x | y);
    int_op!(xor_int_lit8, lit8, |x, y| x ^ y);
    int_op!(shl_int_lit8, lit8, |x, y| arith::shl_int(x, y));
    int_op!(shr_int_lit8, lit8, |x, y| arith::shr_int(x, y));
    int_op!(ushr_int_lit8, lit8, |x, y| arith::ushr_int(x, y));

    // =========================================================================
    // 64-bit integer arithmetic
    // =========================================================================

    long_op!(add_long, x23, |x, y| arith::safe_add(x, y));
    long_op!(sub_long, x23, |x, y| arith::safe_sub(x, y));
    long_op!(mul_long, x23, |x, y| arith::safe_mul(x, y));
    long_div_op!(div_long, vreg_b, vreg_c, arith::div_long);
    long_div_op!(rem_long, vreg_b, vreg_c, arith::rem_long);
    long_op!(and_long, x23, |x, y| x & y);
    long_op!(or_long, x23, |x, y| x | y);
    long_op!(xor_long, x23, |x, y| x ^ y);
    long_shift_op!(shl_long, x23, arith::shl_long);
    long_shift_op!(shr_long, x23, arith::shr_long);
    long_shift_op!(ushr_long, x23, arith::ushr_long);

    long_op!(add_long_2addr, addr2, |x, y| arith::safe_add(x, y));
    long_op!(sub_long_2addr, addr2, |x, y| arith::safe_sub(x, y));
    long_op!(mul_long_2addr, addr2, |x, y| arith::safe_mul(x, y));
    long_div_op!(div_long_2addr, vreg_a, vreg_b, arith::div_long);
    long_div_op!(rem_long_2addr, vreg_a, vreg_b, arith::rem_long);
    long_op!(and_long_2addr, addr2, |x, y| x & y);
    long_op!(or_long_2addr, addr2, |x, y| x | y);
    long_op!(xor_long_2addr, addr2, |x, y| x ^ y);
    long_shift_op!(shl_long_2addr, addr2, arith::shl_long);
    long_shift_op!(shr_long_2addr, addr2, arith::shr_long);
    long_shift_op!(ushr_long_2addr, addr2, arith::ushr_long);

    // =========================================================================
    // Floating point
    // =========================================================================

    float_op!(add_float, get_vreg_float, set_vreg_float, vreg_b, vreg_c, |x, y| x + y);
    float_op!(sub_float, get_vreg_float, set_vreg_float, vreg_b, vreg_c, |x, y| x - y);
    float_op!(mul_float, get_vreg_float, set_vreg_float, vreg_b, vreg_c, |x, y| x * y);
    float_op!(div_float, get_vreg_float, set_vreg_float, vreg_b, vreg_c, |x, y| x / y);
    float_op!(rem_float, get_vreg_float, set_vreg_float, vreg_b, vreg_c, |x, y| arith::rem_float(x, y));
    float_op!(add_double, get_vreg_double, set_vreg_double, vreg_b, vreg_c, |x, y| x + y);
    float_op!(sub_double, get_vreg_double, set_vreg_double, vreg_b, vreg_c, |x, y| x - y);
    float_op!(mul_double, get_vreg_double, set_vreg_double, vreg_b, vreg_c, |x, y| x * y);
    float_op!(div_double, get_vreg_double, set_vreg_double, vreg_b, vreg_c, |x, y| x / y);
    float_op!(rem_double, get_vreg_double, set_vreg_double, vreg_b, vreg_c, |x, y| arith::rem_double(x, y));

    float_op!(add_float_2addr, get_vreg_float, set_vreg_float, vreg_a, vreg_b, |x, y| x + y);
    float_op!(sub_float_2addr, get_vreg_float, set_vreg_float, vreg_a, vreg_b, |x, y| x - y);
    float_op!(mul_float_2addr, get_vreg_float, set_vreg_float, vreg_a, vreg_b, |x, y| x * y);
    float_op!(div_float_2addr, get_vreg_float, set_vreg_float, vreg_a, vreg_b, |x, y| x / y);
    float_op!(rem_float_2addr, get_vreg_float, set_vreg_float, vreg_a, vreg_b, |x, y| arith::rem_float(x, y));
    float_op!(add_double_2addr, get_vreg_double, set_vreg_double, vreg_a, vreg_b, |x, y| x + y);
    float_op!(sub_double_2addr, get_vreg_double, set_vreg_double, vreg_a, vreg_b, |x, y| x - y);
    float_op!(mul_double_2addr, get_vreg_double, set_vreg_double, vreg_a, vreg_b, |x, y| x * y);
    float_op!(div_double_2addr, get_vreg_double, set_vreg_double, vreg_a, vreg_b, |x, y| x / y);
    float_op!(rem_double_2addr, get_vreg_double, set_vreg_double, vreg_a, vreg_b, |x, y| arith::rem_double(x, y));
}
