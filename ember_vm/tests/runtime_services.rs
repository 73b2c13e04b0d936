//! Transactions, deoptimization, instrumentation and suspension observed
//! through running bytecode.

use ember_core::ObjRef;
use ember_vm::bytecode::{CodeItem, CodeItemBuilder, DexFile, Opcode};
use ember_vm::class_linker::descriptors as d;
use ember_vm::deoptimizer::{DeoptReason, DeoptimizationContext, DeoptimizationKind, DeoptimizationMethodType};
use ember_vm::instrumentation::{InstrumentationEvents, InstrumentationListener, ListenerError, ListenerResult};
use ember_vm::mirror::{AccessFlags, Class, ClassStatus, Field, Method, NativeContext};
use ember_vm::{ClassDef, ClassLinker, JValue, Runtime, ShadowFrame, Thread, ThreadState};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

const PUBLIC_STATIC: AccessFlags = AccessFlags::PUBLIC.union(AccessFlags::STATIC);

/// Route runtime logs to the test harness; `--nocapture` shows them.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn code(registers: u16, ins: u16, f: impl FnOnce(&mut CodeItemBuilder)) -> CodeItem {
    let mut b = CodeItemBuilder::new(registers, ins);
    f(&mut b);
    b.build().unwrap()
}

fn define(runtime: &Runtime, thread: &Thread, def: ClassDef) -> Arc<Class> {
    runtime.class_linker().define_class(thread, def).unwrap()
}

fn method(class: &Class, name: &str, shorty: &str) -> Arc<Method> {
    class.find_declared_method(name, shorty).unwrap().clone()
}

fn static_int(class: &Class, name: &str) -> i32 {
    let field = class.find_declared_field(name, true).unwrap();
    class.get_static_prim(field.slot) as u32 as i32
}

// =============================================================================
// Transactions
// =============================================================================

#[test]
fn test_transaction_commits_initializer_writes() {
    let runtime = Runtime::testing();
    let thread = runtime.attach_current_thread("main");
    let mut dex = DexFile::new("good.dex");
    let answer = dex.add_field("LGood;", "answer", "I");
    let clinit = code(1, 0, |b| {
        b.op_21(Opcode::Const16, 0, 42)
            .op_21(Opcode::Sput, 0, answer.0 as u16)
            .op_10x(Opcode::ReturnVoid);
    });
    let good = define(
        &runtime,
        &thread,
        ClassDef::new("LGood;")
            .dex_file(Arc::new(dex))
            .field("answer", "I", AccessFlags::STATIC)
            .method("<clinit>", "V", AccessFlags::STATIC, clinit),
    );
    assert!(runtime.initialize_class_in_transaction(&thread, &good));
    assert!(good.is_initialized());
    assert_eq!(static_int(&good, "answer"), 42);
    assert!(!runtime.transaction_active());
    runtime.detach_current_thread(&thread);
}

#[test]
fn test_boot_image_write_aborts_and_rolls_back() {
    init_logging();
    let runtime = Runtime::testing();
    let thread = runtime.attach_current_thread("main");
    let boot = define(
        &runtime,
        &thread,
        ClassDef::new("LBoot;").boot_image().field("value", "I", PUBLIC_STATIC),
    );
    let mut dex = DexFile::new("init.dex");
    let mine = dex.add_field("LInit;", "mine", "I");
    let boot_value = dex.add_field("LBoot;", "value", "I");
    let clinit = code(1, 0, |b| {
        b.op_11n(Opcode::Const4, 0, 5)
            .op_21(Opcode::Sput, 0, mine.0 as u16)
            .op_21(Opcode::Sput, 0, boot_value.0 as u16)
            .op_10x(Opcode::ReturnVoid);
    });
    let init = define(
        &runtime,
        &thread,
        ClassDef::new("LInit;")
            .dex_file(Arc::new(dex))
            .field("mine", "I", AccessFlags::STATIC)
            .method("<clinit>", "V", AccessFlags::STATIC, clinit),
    );

    assert!(!runtime.initialize_class_in_transaction(&thread, &init));
    assert_eq!(init.status(), ClassStatus::Linked);
    assert_eq!(static_int(&init, "mine"), 0);
    assert_eq!(static_int(&boot, "value"), 0);
    assert!(!thread.is_exception_pending());
    assert!(runtime.active_transaction().is_none());
    runtime.detach_current_thread(&thread);
}

// =============================================================================
// Deoptimization
// =============================================================================

fn request_single_frame_deopt(ctx: &NativeContext<'_>, _args: &[JValue]) -> JValue {
    let class = ctx.runtime.class_linker().find_class("LDeopt;").unwrap();
    let target = method(&class, "target", "I");
    let frame = ShadowFrame::create(1, None, target, 0);
    let deopt = DeoptimizationContext::new(
        vec![frame],
        DeoptimizationKind::SingleFrame,
        DeoptimizationMethodType::KeepDexPc,
        DeoptReason::UncommonTrap,
    );
    ctx.runtime.request_deoptimization(ctx.thread, deopt);
    // Discarded: the interpreted frame supplies the result.
    JValue::from_int(-1)
}

#[test]
fn test_native_requested_deoptimization_supplies_result() {
    init_logging();
    let runtime = Runtime::testing();
    let thread = runtime.attach_current_thread("main");
    let mut dex = DexFile::new("deopt.dex");
    let trap = dex.add_method("LDeopt;", "trap", "I");
    let target = code(1, 0, |b| {
        b.op_11n(Opcode::Const4, 0, 7).op_11x(Opcode::Return, 0);
    });
    let main = code(1, 0, |b| {
        b.op_35c(Opcode::InvokeStatic, trap.0 as u16, &[])
            .op_11x(Opcode::MoveResult, 0)
            .op_22b(Opcode::AddIntLit8, 0, 0, 1)
            .op_11x(Opcode::Return, 0);
    });
    let class = define(
        &runtime,
        &thread,
        ClassDef::new("LDeopt;")
            .dex_file(Arc::new(dex))
            .native_method("trap", "I", PUBLIC_STATIC, request_single_frame_deopt)
            .method("target", "I", PUBLIC_STATIC, target)
            .method("main", "I", PUBLIC_STATIC, main),
    );
    let result = runtime.invoke(&thread, &method(&class, "main", "I"), &[]);
    assert_eq!(result.int(), 8);
    assert!(!thread.is_exception_pending());
    assert_eq!(runtime.deopt_stats().total_count(), 1);
    assert_eq!(runtime.deopt_stats().count_for_reason(DeoptReason::UncommonTrap), 1);
    runtime.detach_current_thread(&thread);
}

// =============================================================================
// Instrumentation
// =============================================================================

#[derive(Default)]
struct Counting {
    entered: AtomicU32,
    exited: AtomicU32,
    written: AtomicU32,
    reject_entry: AtomicBool,
}

impl InstrumentationListener for Counting {
    fn method_entered(&self, _thread: &Thread, _method: &Method) -> ListenerResult {
        self.entered.fetch_add(1, Ordering::SeqCst);
        if self.reject_entry.load(Ordering::SeqCst) {
            return Err(ListenerError::new(d::RUNTIME_EXCEPTION, Some("entry rejected")));
        }
        Ok(())
    }

    fn method_exited(&self, _thread: &Thread, _method: &Method, _dex_pc: u32, _value: JValue) -> ListenerResult {
        self.exited.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn field_written(
        &self,
        _thread: &Thread,
        _this: Option<ObjRef>,
        _method: &Method,
        _dex_pc: u32,
        field: &Field,
        value: JValue,
    ) -> ListenerResult {
        assert_eq!(field.name, "total");
        assert_eq!(value.int(), 3);
        self.written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_listener_sees_calls_and_field_writes() {
    let runtime = Runtime::testing();
    let thread = runtime.attach_current_thread("main");
    let mut dex = DexFile::new("events.dex");
    let total = dex.add_field("LEvents;", "total", "I");
    let helper = dex.add_method("LEvents;", "three", "I");
    let main = code(1, 0, |b| {
        b.op_35c(Opcode::InvokeStatic, helper.0 as u16, &[])
            .op_11x(Opcode::MoveResult, 0)
            .op_21(Opcode::Sput, 0, total.0 as u16)
            .op_10x(Opcode::ReturnVoid);
    });
    let three = code(1, 0, |b| {
        b.op_11n(Opcode::Const4, 0, 3).op_11x(Opcode::Return, 0);
    });
    let class = define(
        &runtime,
        &thread,
        ClassDef::new("LEvents;")
            .dex_file(Arc::new(dex))
            .field("total", "I", PUBLIC_STATIC)
            .method("three", "I", PUBLIC_STATIC, three)
            .method("main", "V", PUBLIC_STATIC, main),
    );
    let listener = Arc::new(Counting::default());
    runtime.instrumentation().add_listener(
        listener.clone(),
        InstrumentationEvents::METHOD_ENTERED | InstrumentationEvents::METHOD_EXITED | InstrumentationEvents::FIELD_WRITTEN,
    );

    runtime.invoke(&thread, &method(&class, "main", "V"), &[]);
    assert!(!thread.is_exception_pending());
    assert_eq!(listener.entered.load(Ordering::SeqCst), 2);
    assert_eq!(listener.exited.load(Ordering::SeqCst), 2);
    assert_eq!(listener.written.load(Ordering::SeqCst), 1);
    assert_eq!(static_int(&class, "total"), 3);
    runtime.detach_current_thread(&thread);
}

#[test]
fn test_listener_failure_throws_into_method() {
    let runtime = Runtime::testing();
    let thread = runtime.attach_current_thread("main");
    let body = code(1, 0, |b| {
        b.op_11n(Opcode::Const4, 0, 1).op_11x(Opcode::Return, 0);
    });
    let class = define(&runtime, &thread, ClassDef::new("LGuarded;").method("run", "I", PUBLIC_STATIC, body));
    let listener = Arc::new(Counting::default());
    listener.reject_entry.store(true, Ordering::SeqCst);
    runtime
        .instrumentation()
        .add_listener(listener.clone(), InstrumentationEvents::METHOD_ENTERED);

    runtime.invoke(&thread, &method(&class, "run", "I"), &[]);
    let exception = thread.exception().unwrap();
    thread.clear_exception();
    let thrown = runtime.heap().class_of(exception);
    assert_eq!(runtime.class_linker().find_class(d::RUNTIME_EXCEPTION).unwrap().id, thrown);
    assert_eq!(runtime.exception_message(exception).as_deref(), Some("entry rejected"));
    assert_eq!(thread.stack_depth(), 0);
    runtime.detach_current_thread(&thread);
}

// =============================================================================
// Suspension
// =============================================================================

static SPIN_POLLS: AtomicU32 = AtomicU32::new(0);
static SPIN_STOP: AtomicBool = AtomicBool::new(false);

fn should_stop(_ctx: &NativeContext<'_>, _args: &[JValue]) -> JValue {
    SPIN_POLLS.fetch_add(1, Ordering::SeqCst);
    JValue::from_int(i32::from(SPIN_STOP.load(Ordering::SeqCst)))
}

#[test]
fn test_suspend_all_stops_interpreted_loop() {
    init_logging();
    let runtime = Runtime::testing();
    let me = runtime.attach_current_thread("gc");
    let mut dex = DexFile::new("spin.dex");
    let poll = dex.add_method("LSpin;", "shouldStop", "Z");
    let spin = code(1, 0, |b| {
        let top = b.label();
        b.bind(top);
        b.op_35c(Opcode::InvokeStatic, poll.0 as u16, &[])
            .op_11x(Opcode::MoveResult, 0)
            .if_testz(Opcode::IfEqz, 0, top)
            .op_10x(Opcode::ReturnVoid);
    });
    let class = define(
        &runtime,
        &me,
        ClassDef::new("LSpin;")
            .dex_file(Arc::new(dex))
            .native_method("shouldStop", "Z", PUBLIC_STATIC, should_stop)
            .method("spin", "V", PUBLIC_STATIC, spin),
    );
    let spin = method(&class, "spin", "V");

    let worker = runtime.attach_current_thread("worker");
    let (rt, w) = (Arc::clone(&runtime), Arc::clone(&worker));
    let handle = std::thread::spawn(move || {
        rt.invoke(&w, &spin, &[]);
        assert!(!w.is_exception_pending());
    });
    while SPIN_POLLS.load(Ordering::SeqCst) == 0 {
        std::thread::yield_now();
    }

    runtime.thread_list().suspend_all(&me, "test").unwrap();
    assert_eq!(worker.state(), ThreadState::Suspended);
    let frozen = SPIN_POLLS.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(SPIN_POLLS.load(Ordering::SeqCst), frozen);
    let mut frames = Vec::new();
    worker.for_each_frame(|frame| frames.push(frame.method().name.clone()));
    assert_eq!(frames, ["spin"]);
    runtime.thread_list().resume_all(&me);

    SPIN_STOP.store(true, Ordering::SeqCst);
    handle.join().unwrap();
    runtime.detach_current_thread(&worker);
    runtime.detach_current_thread(&me);
    runtime.shutdown().unwrap();
}
