//! Property tests: interpreted arithmetic agrees with the language rules.

use ember_vm::bytecode::{CodeItemBuilder, Opcode};
use ember_vm::mirror::{AccessFlags, Method};
use ember_vm::{ClassDef, JValue, Runtime, Thread};
use proptest::prelude::*;
use std::sync::{Arc, OnceLock};

struct Fixture {
    runtime: Arc<Runtime>,
    thread: Arc<Thread>,
    methods: Vec<Arc<Method>>,
}

const BINARY_INT: [(&str, Opcode); 6] = [
    ("add", Opcode::AddInt),
    ("sub", Opcode::SubInt),
    ("mul", Opcode::MulInt),
    ("shl", Opcode::ShlInt),
    ("shr", Opcode::ShrInt),
    ("ushr", Opcode::UshrInt),
];

/// One runtime shared by every case; each method is `(I, I) -> I` or
/// `(J, J) -> I` and ends in a single operation.
fn fixture() -> &'static parking_lot::Mutex<Fixture> {
    static FIXTURE: OnceLock<parking_lot::Mutex<Fixture>> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let runtime = Runtime::testing();
        let thread = runtime.attach_current_thread("prop");
        let flags = AccessFlags::PUBLIC | AccessFlags::STATIC;
        let mut def = ClassDef::new("LProps;");
        for (name, op) in BINARY_INT {
            let mut b = CodeItemBuilder::new(3, 2);
            b.op_23x(op, 0, 1, 2).op_11x(Opcode::Return, 0);
            def = def.method(name, "III", flags, b.build().unwrap());
        }
        let mut b = CodeItemBuilder::new(5, 4);
        b.op_23x(Opcode::CmpLong, 0, 1, 3).op_11x(Opcode::Return, 0);
        def = def.method("cmp", "IJJ", flags, b.build().unwrap());
        let mut b = CodeItemBuilder::new(3, 2);
        b.op_23x(Opcode::RemInt, 0, 1, 2).op_11x(Opcode::Return, 0);
        def = def.method("rem", "III", flags, b.build().unwrap());

        let class = runtime.class_linker().define_class(&thread, def).unwrap();
        let methods = class.methods.clone();
        parking_lot::Mutex::new(Fixture {
            runtime,
            thread,
            methods,
        })
    })
}

fn call(name: &str, args: &[JValue]) -> JValue {
    let fixture = fixture().lock();
    let method = fixture
        .methods
        .iter()
        .find(|m| m.name == name)
        .unwrap()
        .clone();
    fixture.runtime.invoke(&fixture.thread, &method, args)
}

fn int_op(name: &str, a: i32, b: i32) -> i32 {
    call(name, &[JValue::from_int(a), JValue::from_int(b)]).int()
}

proptest! {
    #[test]
    fn int_ops_wrap_and_mask_shifts(a in any::<i32>(), b in any::<i32>()) {
        prop_assert_eq!(int_op("add", a, b), a.wrapping_add(b));
        prop_assert_eq!(int_op("sub", a, b), a.wrapping_sub(b));
        prop_assert_eq!(int_op("mul", a, b), a.wrapping_mul(b));
        prop_assert_eq!(int_op("shl", a, b), a.wrapping_shl(b as u32 & 31));
        prop_assert_eq!(int_op("shr", a, b), a >> (b & 31));
        prop_assert_eq!(int_op("ushr", a, b), ((a as u32) >> (b & 31)) as i32);
    }

    #[test]
    fn rem_matches_truncated_division(a in any::<i32>(), b in any::<i32>().prop_filter("non-zero", |b| *b != 0)) {
        prop_assert_eq!(int_op("rem", a, b), a.wrapping_rem(b));
    }

    #[test]
    fn cmp_long_is_three_way(a in any::<i64>(), b in any::<i64>()) {
        let result = call("cmp", &[JValue::from_long(a), JValue::from_long(b)]).int();
        prop_assert_eq!(result, a.cmp(&b) as i32);
    }
}

#[test]
fn rem_min_by_minus_one_is_zero() {
    assert_eq!(int_op("rem", i32::MIN, -1), 0);
}
