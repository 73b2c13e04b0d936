//! Bytecode execution through the public runtime API.

use ember_core::ObjRef;
use ember_vm::bytecode::{CodeItem, CodeItemBuilder, DexFile, Opcode};
use ember_vm::class_linker::descriptors as d;
use ember_vm::mirror::{AccessFlags, Class, Method};
use ember_vm::{ClassDef, ClassLinker, JValue, Runtime, Thread};
use std::sync::Arc;

// =============================================================================
// Helpers
// =============================================================================

const PUBLIC_STATIC: AccessFlags = AccessFlags::PUBLIC.union(AccessFlags::STATIC);

struct Vm {
    runtime: Arc<Runtime>,
    thread: Arc<Thread>,
}

impl Vm {
    fn new() -> Self {
        let runtime = Runtime::testing();
        let thread = runtime.attach_current_thread("main");
        Self { runtime, thread }
    }

    fn define(&self, def: ClassDef) -> Arc<Class> {
        self.runtime.class_linker().define_class(&self.thread, def).unwrap()
    }

    fn run(&self, method: &Arc<Method>, args: &[JValue]) -> JValue {
        self.runtime.invoke(&self.thread, method, args)
    }

    /// Take the pending exception and return its class descriptor and message.
    fn take_exception(&self) -> Option<(String, Option<String>)> {
        let exception = self.thread.exception()?;
        self.thread.clear_exception();
        let linker = self.runtime.class_linker();
        let class = linker.lookup_class(self.runtime.heap().class_of(exception))?;
        Some((class.descriptor.clone(), self.runtime.exception_message(exception)))
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.runtime.detach_current_thread(&self.thread);
    }
}

fn code(registers: u16, ins: u16, f: impl FnOnce(&mut CodeItemBuilder)) -> CodeItem {
    let mut b = CodeItemBuilder::new(registers, ins);
    f(&mut b);
    b.build().unwrap()
}

fn method(class: &Class, name: &str, shorty: &str) -> Arc<Method> {
    class.find_declared_method(name, shorty).unwrap().clone()
}

fn returns_const(value: i16) -> CodeItem {
    code(1, 1, |b| {
        b.op_21(Opcode::Const16, 0, value as u16).op_11x(Opcode::Return, 0);
    })
}

// =============================================================================
// Arithmetic and control flow
// =============================================================================

#[test]
fn test_add_int() {
    let vm = Vm::new();
    let add = code(3, 2, |b| {
        b.op_23x(Opcode::AddInt, 0, 1, 2).op_11x(Opcode::Return, 0);
    });
    let class = vm.define(ClassDef::new("LMath;").method("add", "III", PUBLIC_STATIC, add));
    let result = vm.run(&method(&class, "add", "III"), &[JValue::from_int(1), JValue::from_int(2)]);
    assert_eq!(result.int(), 3);
    let wrapped = vm.run(
        &method(&class, "add", "III"),
        &[JValue::from_int(i32::MAX), JValue::from_int(1)],
    );
    assert_eq!(wrapped.int(), i32::MIN);
}

#[test]
fn test_float_compare_bias() {
    let vm = Vm::new();
    let cmpl = code(3, 2, |b| {
        b.op_23x(Opcode::CmplFloat, 0, 1, 2).op_11x(Opcode::Return, 0);
    });
    let cmpg = code(3, 2, |b| {
        b.op_23x(Opcode::CmpgFloat, 0, 1, 2).op_11x(Opcode::Return, 0);
    });
    let class = vm.define(
        ClassDef::new("LCmp;")
            .method("l", "IFF", PUBLIC_STATIC, cmpl)
            .method("g", "IFF", PUBLIC_STATIC, cmpg),
    );
    let nan = [JValue::from_float(f32::NAN), JValue::from_float(1.0)];
    assert_eq!(vm.run(&method(&class, "l", "IFF"), &nan).int(), -1);
    assert_eq!(vm.run(&method(&class, "g", "IFF"), &nan).int(), 1);
    let ordered = [JValue::from_float(2.0), JValue::from_float(1.0)];
    assert_eq!(vm.run(&method(&class, "l", "IFF"), &ordered).int(), 1);
    assert_eq!(vm.run(&method(&class, "g", "IFF"), &ordered).int(), 1);
}

#[test]
fn test_counting_loop() {
    let vm = Vm::new();
    let count = code(2, 1, |b| {
        let (top, done) = (b.label(), b.label());
        b.op_11n(Opcode::Const4, 0, 0);
        b.bind(top);
        b.if_testz(Opcode::IfLez, 1, done)
            .op_22b(Opcode::AddIntLit8, 0, 0, 1)
            .op_22b(Opcode::AddIntLit8, 1, 1, -1)
            .goto(top);
        b.bind(done);
        b.op_11x(Opcode::Return, 0);
    });
    let class = vm.define(ClassDef::new("LLoop;").method("count", "II", PUBLIC_STATIC, count));
    let m = method(&class, "count", "II");
    assert_eq!(vm.run(&m, &[JValue::from_int(1000)]).int(), 1000);
    assert_eq!(vm.run(&m, &[JValue::from_int(-5)]).int(), 0);
    assert!(m.hotness() > 0);
}

#[test]
fn test_packed_and_sparse_switch() {
    let vm = Vm::new();
    let packed = code(2, 1, |b| {
        let (a, c) = (b.label(), b.label());
        b.packed_switch(1, 10, &[a, c]);
        b.op_21(Opcode::Const16, 0, (-1i16) as u16).op_11x(Opcode::Return, 0);
        b.bind(a);
        b.op_21(Opcode::Const16, 0, 100).op_11x(Opcode::Return, 0);
        b.bind(c);
        b.op_21(Opcode::Const16, 0, 200).op_11x(Opcode::Return, 0);
    });
    let sparse = code(2, 1, |b| {
        let hit = b.label();
        b.sparse_switch(1, &[(-1000, hit), (7, hit)]);
        b.op_11n(Opcode::Const4, 0, 0).op_11x(Opcode::Return, 0);
        b.bind(hit);
        b.op_11n(Opcode::Const4, 0, 1).op_11x(Opcode::Return, 0);
    });
    let class = vm.define(
        ClassDef::new("LSwitch;")
            .method("packed", "II", PUBLIC_STATIC, packed)
            .method("sparse", "II", PUBLIC_STATIC, sparse),
    );
    let p = method(&class, "packed", "II");
    let s = method(&class, "sparse", "II");
    assert_eq!(vm.run(&p, &[JValue::from_int(10)]).int(), 100);
    assert_eq!(vm.run(&p, &[JValue::from_int(11)]).int(), 200);
    assert_eq!(vm.run(&p, &[JValue::from_int(12)]).int(), -1);
    assert_eq!(vm.run(&s, &[JValue::from_int(-1000)]).int(), 1);
    assert_eq!(vm.run(&s, &[JValue::from_int(7)]).int(), 1);
    assert_eq!(vm.run(&s, &[JValue::from_int(8)]).int(), 0);
}

#[test]
fn test_wide_arithmetic() {
    let vm = Vm::new();
    let mul = code(6, 4, |b| {
        b.op_23x(Opcode::MulLong, 0, 2, 4).op_11x(Opcode::ReturnWide, 0);
    });
    let class = vm.define(ClassDef::new("LWide;").method("mul", "JJJ", PUBLIC_STATIC, mul));
    let result = vm.run(
        &method(&class, "mul", "JJJ"),
        &[JValue::from_long(1 << 40), JValue::from_long(-3)],
    );
    assert_eq!(result.long(), -3 << 40);
}

// =============================================================================
// Exceptions
// =============================================================================

#[test]
fn test_divide_by_zero_caught() {
    let vm = Vm::new();
    let mut dex = DexFile::new("div.dex");
    let arith = dex.add_type(d::ARITHMETIC_EXCEPTION);
    let div = code(3, 2, |b| {
        let (start, end, handler) = (b.label(), b.label(), b.label());
        b.bind(start);
        b.op_23x(Opcode::DivInt, 0, 1, 2);
        b.bind(end);
        b.op_11x(Opcode::Return, 0);
        b.bind(handler);
        b.op_11x(Opcode::MoveException, 0)
            .op_21(Opcode::Const16, 0, (-1i16) as u16)
            .op_11x(Opcode::Return, 0);
        b.try_range(start, end, &[(arith, handler)], None);
    });
    let class = vm.define(
        ClassDef::new("LDiv;")
            .dex_file(Arc::new(dex))
            .method("div", "III", PUBLIC_STATIC, div),
    );
    let m = method(&class, "div", "III");
    assert_eq!(vm.run(&m, &[JValue::from_int(7), JValue::from_int(2)]).int(), 3);
    assert_eq!(vm.run(&m, &[JValue::from_int(7), JValue::from_int(0)]).int(), -1);
    assert!(!vm.thread.is_exception_pending());
    assert_eq!(vm.thread.stack_depth(), 0);
}

#[test]
fn test_uncaught_exception_stays_pending() {
    let vm = Vm::new();
    let npe = code(2, 0, |b| {
        b.op_11n(Opcode::Const4, 0, 0)
            .op_12x(Opcode::ArrayLength, 1, 0)
            .op_11x(Opcode::Return, 1);
    });
    let class = vm.define(ClassDef::new("LNpe;").method("run", "I", PUBLIC_STATIC, npe));
    vm.run(&method(&class, "run", "I"), &[]);
    let (descriptor, message) = vm.take_exception().unwrap();
    assert_eq!(descriptor, d::NULL_POINTER_EXCEPTION);
    assert!(message.unwrap().contains("null"));
}

#[test]
fn test_catch_all_handler_and_rethrow() {
    let vm = Vm::new();
    let rethrow = code(2, 0, |b| {
        let (start, end, all) = (b.label(), b.label(), b.label());
        b.bind(start);
        b.op_11n(Opcode::Const4, 0, 0).op_12x(Opcode::ArrayLength, 1, 0);
        b.bind(end);
        b.op_11x(Opcode::Return, 1);
        b.bind(all);
        b.op_11x(Opcode::MoveException, 1).op_11x(Opcode::Throw, 1);
        b.try_range(start, end, &[], Some(all));
    });
    let class = vm.define(ClassDef::new("LRethrow;").method("run", "I", PUBLIC_STATIC, rethrow));
    vm.run(&method(&class, "run", "I"), &[]);
    let (descriptor, _) = vm.take_exception().unwrap();
    assert_eq!(descriptor, d::NULL_POINTER_EXCEPTION);
}

#[test]
fn test_stack_overflow() {
    let handle = std::thread::Builder::new()
        .stack_size(256 << 20)
        .spawn(|| {
            let vm = Vm::new();
            let mut dex = DexFile::new("rec.dex");
            let spin = dex.add_method("LRec;", "spin", "V");
            let body = code(0, 0, |b| {
                b.op_35c(Opcode::InvokeStatic, spin.0 as u16, &[]).op_10x(Opcode::ReturnVoid);
            });
            let class = vm.define(
                ClassDef::new("LRec;")
                    .dex_file(Arc::new(dex))
                    .method("spin", "V", PUBLIC_STATIC, body),
            );
            vm.run(&method(&class, "spin", "V"), &[]);
            let (descriptor, _) = vm.take_exception().unwrap();
            assert_eq!(descriptor, d::STACK_OVERFLOW_ERROR);
            assert_eq!(vm.thread.stack_depth(), 0);
        })
        .unwrap();
    handle.join().unwrap();
}

// =============================================================================
// Objects, fields and arrays
// =============================================================================

#[test]
fn test_instance_fields_narrow() {
    let vm = Vm::new();
    let mut dex = DexFile::new("point.dex");
    let point = dex.add_type("LPoint;");
    let x = dex.add_field("LPoint;", "x", "I");
    let tiny = dex.add_field("LPoint;", "tiny", "B");
    let dex = Arc::new(dex);
    vm.define(
        ClassDef::new("LPoint;")
            .field("x", "I", AccessFlags::PUBLIC)
            .field("tiny", "B", AccessFlags::PUBLIC),
    );
    let body = code(4, 0, |b| {
        b.op_21(Opcode::NewInstance, 0, point.0 as u16)
            .op_21(Opcode::Const16, 1, 42)
            .op_22(Opcode::Iput, 1, 0, x.0 as u16)
            .op_21(Opcode::Const16, 1, 0x1ff)
            .op_22(Opcode::IputByte, 1, 0, tiny.0 as u16)
            .op_22(Opcode::Iget, 2, 0, x.0 as u16)
            .op_22(Opcode::IgetByte, 3, 0, tiny.0 as u16)
            .op_23x(Opcode::AddInt, 2, 2, 3)
            .op_11x(Opcode::Return, 2);
    });
    let class = vm.define(ClassDef::new("LMain;").dex_file(dex).method("run", "I", PUBLIC_STATIC, body));
    // 42 + (byte)0x1ff
    assert_eq!(vm.run(&method(&class, "run", "I"), &[]).int(), 41);
}

#[test]
fn test_static_initializer_runs_once() {
    let vm = Vm::new();
    let mut dex = DexFile::new("counter.dex");
    let count = dex.add_field("LCounter;", "count", "I");
    let dex = Arc::new(dex);
    let clinit = code(1, 0, |b| {
        b.op_21(Opcode::Const16, 0, 5)
            .op_21(Opcode::Sput, 0, count.0 as u16)
            .op_10x(Opcode::ReturnVoid);
    });
    let counter = vm.define(
        ClassDef::new("LCounter;")
            .dex_file(Arc::clone(&dex))
            .field("count", "I", AccessFlags::STATIC)
            .method("<clinit>", "V", AccessFlags::STATIC, clinit),
    );
    assert!(!counter.is_initialized());
    let bump = code(1, 0, |b| {
        b.op_21(Opcode::Sget, 0, count.0 as u16)
            .op_22b(Opcode::AddIntLit8, 0, 0, 1)
            .op_21(Opcode::Sput, 0, count.0 as u16)
            .op_21(Opcode::Sget, 0, count.0 as u16)
            .op_11x(Opcode::Return, 0);
    });
    let class = vm.define(ClassDef::new("LBump;").dex_file(dex).method("bump", "I", PUBLIC_STATIC, bump));
    let m = method(&class, "bump", "I");
    assert_eq!(vm.run(&m, &[]).int(), 6);
    assert_eq!(vm.run(&m, &[]).int(), 7);
    assert!(counter.is_initialized());
}

#[test]
fn test_failing_initializer_wraps_exception() {
    let vm = Vm::new();
    let mut dex = DexFile::new("bad.dex");
    let value = dex.add_field("LBad;", "value", "I");
    let dex = Arc::new(dex);
    let clinit = code(2, 0, |b| {
        b.op_11n(Opcode::Const4, 0, 1)
            .op_11n(Opcode::Const4, 1, 0)
            .op_23x(Opcode::DivInt, 0, 0, 1)
            .op_10x(Opcode::ReturnVoid);
    });
    vm.define(
        ClassDef::new("LBad;")
            .dex_file(Arc::clone(&dex))
            .field("value", "I", AccessFlags::STATIC)
            .method("<clinit>", "V", AccessFlags::STATIC, clinit),
    );
    let read = code(1, 0, |b| {
        b.op_21(Opcode::Sget, 0, value.0 as u16).op_11x(Opcode::Return, 0);
    });
    let class = vm.define(ClassDef::new("LReader;").dex_file(dex).method("read", "I", PUBLIC_STATIC, read));
    let m = method(&class, "read", "I");
    vm.run(&m, &[]);
    assert_eq!(vm.take_exception().unwrap().0, d::EXCEPTION_IN_INITIALIZER_ERROR);
    vm.run(&m, &[]);
    assert_eq!(vm.take_exception().unwrap().0, d::NO_CLASS_DEF_FOUND_ERROR);
}

#[test]
fn test_array_fill_and_bounds() {
    let vm = Vm::new();
    let mut dex = DexFile::new("array.dex");
    let int_array = dex.add_type("[I");
    let dex = Arc::new(dex);
    let body = code(3, 1, |b| {
        b.op_11n(Opcode::Const4, 1, 3)
            .op_22(Opcode::NewArray, 0, 1, int_array.0 as u16)
            .fill_array_data(0, 4, &[10, 20, 30])
            .op_23x(Opcode::Aget, 1, 0, 2)
            .op_11x(Opcode::Return, 1);
    });
    let negative = code(2, 0, |b| {
        b.op_11n(Opcode::Const4, 1, -1)
            .op_22(Opcode::NewArray, 0, 1, int_array.0 as u16)
            .op_11x(Opcode::Return, 1);
    });
    let class = vm.define(
        ClassDef::new("LArrays;")
            .dex_file(dex)
            .method("get", "II", PUBLIC_STATIC, body)
            .method("negative", "I", PUBLIC_STATIC, negative),
    );
    let get = method(&class, "get", "II");
    assert_eq!(vm.run(&get, &[JValue::from_int(2)]).int(), 30);
    vm.run(&get, &[JValue::from_int(3)]);
    let (descriptor, message) = vm.take_exception().unwrap();
    assert_eq!(descriptor, d::ARRAY_INDEX_OUT_OF_BOUNDS_EXCEPTION);
    assert_eq!(message.as_deref(), Some("length=3; index=3"));

    vm.run(&method(&class, "negative", "I"), &[]);
    assert_eq!(vm.take_exception().unwrap().0, d::NEGATIVE_ARRAY_SIZE_EXCEPTION);
}

#[test]
fn test_filled_new_array() {
    let vm = Vm::new();
    let mut dex = DexFile::new("filled.dex");
    let int_array = dex.add_type("[I");
    let dex = Arc::new(dex);
    let body = code(4, 0, |b| {
        b.op_11n(Opcode::Const4, 0, 4)
            .op_11n(Opcode::Const4, 1, 5)
            .op_11n(Opcode::Const4, 2, 6)
            .op_35c(Opcode::FilledNewArray, int_array.0 as u16, &[0, 1, 2])
            .op_11x(Opcode::MoveResultObject, 3)
            .op_12x(Opcode::ArrayLength, 0, 3)
            .op_11x(Opcode::Return, 0);
    });
    let class = vm.define(ClassDef::new("LFilled;").dex_file(dex).method("run", "I", PUBLIC_STATIC, body));
    assert_eq!(vm.run(&method(&class, "run", "I"), &[]).int(), 3);
}

#[test]
fn test_check_cast_failure() {
    let vm = Vm::new();
    let mut dex = DexFile::new("cast.dex");
    let a = dex.add_type("LA;");
    let b_ty = dex.add_type("LB;");
    let dex = Arc::new(dex);
    vm.define(ClassDef::new("LA;"));
    vm.define(ClassDef::new("LB;").extends("LA;"));
    let body = code(2, 0, |b| {
        b.op_21(Opcode::NewInstance, 0, a.0 as u16)
            .op_22(Opcode::InstanceOf, 1, 0, b_ty.0 as u16)
            .op_21(Opcode::CheckCast, 0, b_ty.0 as u16)
            .op_11x(Opcode::Return, 1);
    });
    let class = vm.define(ClassDef::new("LCast;").dex_file(dex).method("run", "I", PUBLIC_STATIC, body));
    vm.run(&method(&class, "run", "I"), &[]);
    let (descriptor, message) = vm.take_exception().unwrap();
    assert_eq!(descriptor, d::CLASS_CAST_EXCEPTION);
    assert_eq!(message.as_deref(), Some("LA; cannot be cast to LB;"));
}

// =============================================================================
// Invokes
// =============================================================================

#[test]
fn test_virtual_dispatch() {
    let vm = Vm::new();
    let mut dex = DexFile::new("virtual.dex");
    let b_ty = dex.add_type("LB;");
    let value = dex.add_method("LA;", "value", "I");
    let dex = Arc::new(dex);
    vm.define(ClassDef::new("LA;").method("value", "I", AccessFlags::PUBLIC, returns_const(1)));
    vm.define(
        ClassDef::new("LB;")
            .extends("LA;")
            .method("value", "I", AccessFlags::PUBLIC, returns_const(2)),
    );
    let body = code(1, 0, |b| {
        b.op_21(Opcode::NewInstance, 0, b_ty.0 as u16)
            .op_35c(Opcode::InvokeVirtual, value.0 as u16, &[0])
            .op_11x(Opcode::MoveResult, 0)
            .op_11x(Opcode::Return, 0);
    });
    let class = vm.define(ClassDef::new("LMain;").dex_file(dex).method("run", "I", PUBLIC_STATIC, body));
    assert_eq!(vm.run(&method(&class, "run", "I"), &[]).int(), 2);
}

#[test]
fn test_interface_dispatch() {
    let vm = Vm::new();
    let mut dex = DexFile::new("iface.dex");
    let task = dex.add_type("LTask;");
    let run = dex.add_method("LRunnable;", "run", "I");
    let dex = Arc::new(dex);
    vm.define(
        ClassDef::new("LRunnable;")
            .access(AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT)
            .abstract_method("run", "I", AccessFlags::PUBLIC),
    );
    vm.define(
        ClassDef::new("LTask;")
            .implements("LRunnable;")
            .method("run", "I", AccessFlags::PUBLIC, returns_const(9)),
    );
    let body = code(1, 0, |b| {
        b.op_21(Opcode::NewInstance, 0, task.0 as u16)
            .op_35c(Opcode::InvokeInterface, run.0 as u16, &[0])
            .op_11x(Opcode::MoveResult, 0)
            .op_11x(Opcode::Return, 0);
    });
    let wrong_kind = code(1, 0, |b| {
        b.op_21(Opcode::NewInstance, 0, task.0 as u16)
            .op_35c(Opcode::InvokeVirtual, run.0 as u16, &[0])
            .op_11x(Opcode::MoveResult, 0)
            .op_11x(Opcode::Return, 0);
    });
    let class = vm.define(
        ClassDef::new("LMain;")
            .dex_file(dex)
            .method("run", "I", PUBLIC_STATIC, body)
            .method("wrong", "I", PUBLIC_STATIC, wrong_kind),
    );
    assert_eq!(vm.run(&method(&class, "run", "I"), &[]).int(), 9);
    vm.run(&method(&class, "wrong", "I"), &[]);
    assert_eq!(vm.take_exception().unwrap().0, d::INCOMPATIBLE_CLASS_CHANGE_ERROR);
}

#[test]
fn test_native_string_methods() {
    let vm = Vm::new();
    let mut dex = DexFile::new("strings.dex");
    let hello = dex.add_string("hello");
    let length = dex.add_method(d::STRING, "length", "I");
    let dex = Arc::new(dex);
    let body = code(1, 0, |b| {
        b.op_21(Opcode::ConstString, 0, hello.0 as u16)
            .op_35c(Opcode::InvokeVirtual, length.0 as u16, &[0])
            .op_11x(Opcode::MoveResult, 0)
            .op_11x(Opcode::Return, 0);
    });
    let class = vm.define(ClassDef::new("LMain;").dex_file(dex).method("run", "I", PUBLIC_STATIC, body));
    assert_eq!(vm.run(&method(&class, "run", "I"), &[]).int(), 5);
}

#[test]
fn test_invoke_on_null_receiver() {
    let vm = Vm::new();
    let mut dex = DexFile::new("null.dex");
    let hash = dex.add_method(d::OBJECT, "hashCode", "I");
    let dex = Arc::new(dex);
    let body = code(1, 0, |b| {
        b.op_11n(Opcode::Const4, 0, 0)
            .op_35c(Opcode::InvokeVirtual, hash.0 as u16, &[0])
            .op_11x(Opcode::MoveResult, 0)
            .op_11x(Opcode::Return, 0);
    });
    let class = vm.define(ClassDef::new("LMain;").dex_file(dex).method("run", "I", PUBLIC_STATIC, body));
    vm.run(&method(&class, "run", "I"), &[]);
    assert_eq!(vm.take_exception().unwrap().0, d::NULL_POINTER_EXCEPTION);
}

#[test]
fn test_method_handle_invoke() {
    let vm = Vm::new();
    let mut dex = DexFile::new("handles.dex");
    let target = dex.add_method("LHandles;", "twice", "II");
    let handle = dex.add_method_handle(ember_vm::bytecode::MethodHandleKind::InvokeStatic, target);
    let invoke = dex.add_method(d::METHOD_HANDLE, "invoke", "LL");
    let proto = dex.add_proto("II");
    let bad_proto = dex.add_proto("IJ");
    let dex = Arc::new(dex);
    let twice = code(2, 1, |b| {
        b.op_23x(Opcode::AddInt, 0, 1, 1).op_11x(Opcode::Return, 0);
    });
    let call = code(3, 1, |b| {
        b.op_21(Opcode::ConstMethodHandle, 0, handle as u16)
            .op_45cc(Opcode::InvokePolymorphic, invoke.0 as u16, &[0, 2], proto.0 as u16)
            .op_11x(Opcode::MoveResult, 0)
            .op_11x(Opcode::Return, 0);
    });
    let mismatch = code(3, 1, |b| {
        b.op_21(Opcode::ConstMethodHandle, 0, handle as u16)
            .op_45cc(Opcode::InvokePolymorphic, invoke.0 as u16, &[0, 2], bad_proto.0 as u16)
            .op_11x(Opcode::MoveResult, 0)
            .op_11x(Opcode::Return, 0);
    });
    let class = vm.define(
        ClassDef::new("LHandles;")
            .dex_file(dex)
            .method("twice", "II", PUBLIC_STATIC, twice)
            .method("call", "II", PUBLIC_STATIC, call)
            .method("mismatch", "II", PUBLIC_STATIC, mismatch),
    );
    assert_eq!(vm.run(&method(&class, "call", "II"), &[JValue::from_int(21)]).int(), 42);
    vm.run(&method(&class, "mismatch", "II"), &[JValue::from_int(1)]);
    assert_eq!(vm.take_exception().unwrap().0, d::WRONG_METHOD_TYPE_EXCEPTION);
}

#[test]
fn test_invoke_custom_links_call_site() {
    let vm = Vm::new();
    let mut dex = DexFile::new("indy.dex");
    let target = dex.add_method("LIndy;", "seven", "I");
    let handle = dex.add_method_handle(ember_vm::bytecode::MethodHandleKind::InvokeStatic, target);
    let site = dex.add_call_site(handle);
    let dex = Arc::new(dex);
    let body = code(1, 0, |b| {
        b.op_35c(Opcode::InvokeCustom, site as u16, &[])
            .op_11x(Opcode::MoveResult, 0)
            .op_11x(Opcode::Return, 0);
    });
    let class = vm.define(
        ClassDef::new("LIndy;")
            .dex_file(dex)
            .method("seven", "I", PUBLIC_STATIC, code(1, 0, |b| {
                b.op_11n(Opcode::Const4, 0, 7).op_11x(Opcode::Return, 0);
            }))
            .method("run", "I", PUBLIC_STATIC, body),
    );
    assert_eq!(vm.run(&method(&class, "run", "I"), &[]).int(), 7);
}

// =============================================================================
// Monitors
// =============================================================================

fn lock_object(vm: &Vm) -> ObjRef {
    vm.runtime.class_linker().intern("lock").unwrap()
}

#[test]
fn test_monitors_released_when_exception_escapes() {
    let vm = Vm::new();
    let body = code(2, 1, |b| {
        b.op_11x(Opcode::MonitorEnter, 1)
            .op_11n(Opcode::Const4, 0, 0)
            .op_12x(Opcode::ArrayLength, 0, 0)
            .op_11x(Opcode::MonitorExit, 1)
            .op_10x(Opcode::ReturnVoid);
    });
    let class = vm.define(ClassDef::new("LLocks;").method("run", "VL", PUBLIC_STATIC, body));
    let obj = lock_object(&vm);
    vm.run(&method(&class, "run", "VL"), &[JValue::from_ref(Some(obj))]);
    assert_eq!(vm.take_exception().unwrap().0, d::NULL_POINTER_EXCEPTION);
    assert_eq!(vm.runtime.monitors().lock_count(&vm.thread, obj), 0);
}

#[test]
fn test_unbalanced_monitor_exit() {
    let vm = Vm::new();
    let body = code(1, 1, |b| {
        b.op_11x(Opcode::MonitorExit, 0).op_10x(Opcode::ReturnVoid);
    });
    let class = vm.define(ClassDef::new("LLocks;").method("run", "VL", PUBLIC_STATIC, body));
    let obj = lock_object(&vm);
    vm.run(&method(&class, "run", "VL"), &[JValue::from_ref(Some(obj))]);
    assert_eq!(vm.take_exception().unwrap().0, d::ILLEGAL_MONITOR_STATE_EXCEPTION);
}

#[test]
fn test_synchronized_method_holds_receiver_lock() {
    let vm = Vm::new();
    let mut dex = DexFile::new("sync.dex");
    let holds = dex.add_method("LSync;", "probe", "ZL");
    let dex = Arc::new(dex);
    fn probe(ctx: &ember_vm::mirror::NativeContext<'_>, args: &[JValue]) -> JValue {
        let obj = args[0].reference().unwrap();
        JValue::from_int(i32::from(ctx.runtime.monitors().holds_lock(ctx.thread, obj)))
    }
    let body = code(2, 1, |b| {
        b.op_35c(Opcode::InvokeStatic, holds.0 as u16, &[1])
            .op_11x(Opcode::MoveResult, 0)
            .op_11x(Opcode::Return, 0);
    });
    let class = vm.define(
        ClassDef::new("LSync;")
            .dex_file(dex)
            .native_method("probe", "ZL", PUBLIC_STATIC, probe)
            .method("run", "IL", PUBLIC_STATIC | AccessFlags::SYNCHRONIZED, body),
    );
    let obj = lock_object(&vm);
    // Static synchronized methods lock the class object, not the argument.
    assert_eq!(vm.run(&method(&class, "run", "IL"), &[JValue::from_ref(Some(obj))]).int(), 0);
    let class_object = vm.runtime.class_linker().class_object(class.id).unwrap();
    assert_eq!(vm.run(&method(&class, "run", "IL"), &[JValue::from_ref(Some(class_object))]).int(), 1);
    assert_eq!(vm.runtime.monitors().lock_count(&vm.thread, class_object), 0);
}
