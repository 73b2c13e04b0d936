//! Interpreter Benchmarks
//!
//! # Benchmark Categories
//!
//! 1. **Dispatch**: tight arithmetic loops, one handler per instruction
//! 2. **Invoke**: static and virtual calls through frame setup and teardown
//! 3. **Safepoints**: empty checkpoints against an attached idle thread
//!
//! # Performance Targets
//!
//! - Loop iteration (4 instructions): < 40ns
//! - Static invoke round trip: < 300ns

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ember_vm::bytecode::{CodeItem, CodeItemBuilder, DexFile, Opcode};
use ember_vm::mirror::{AccessFlags, Class, Method};
use ember_vm::{ClassDef, JValue, Runtime};
use std::sync::Arc;

// =============================================================================
// Benchmark Helpers
// =============================================================================

const PUBLIC_STATIC: AccessFlags = AccessFlags::PUBLIC.union(AccessFlags::STATIC);

fn build(registers: u16, ins: u16, f: impl FnOnce(&mut CodeItemBuilder)) -> CodeItem {
    let mut b = CodeItemBuilder::new(registers, ins);
    f(&mut b);
    b.build().unwrap()
}

/// `sum(n)`: adds `n, n-1, ..., 1`.
fn sum_loop() -> CodeItem {
    build(2, 1, |b| {
        let (top, done) = (b.label(), b.label());
        b.op_11n(Opcode::Const4, 0, 0);
        b.bind(top);
        b.if_testz(Opcode::IfLez, 1, done)
            .op_12x(Opcode::AddInt2Addr, 0, 1)
            .op_22b(Opcode::AddIntLit8, 1, 1, -1)
            .goto(top);
        b.bind(done);
        b.op_11x(Opcode::Return, 0);
    })
}

/// `calls(n)`: invokes `method_index` `n` times.
fn call_loop(op: Opcode, method_index: u16, receiver: bool) -> CodeItem {
    build(3, 2, |b| {
        let (top, done) = (b.label(), b.label());
        b.bind(top);
        b.if_testz(Opcode::IfLez, 2, done);
        if receiver {
            b.op_35c(op, method_index, &[1]);
        } else {
            b.op_35c(op, method_index, &[]);
        }
        b.op_22b(Opcode::AddIntLit8, 2, 2, -1).goto(top);
        b.bind(done);
        b.op_10x(Opcode::ReturnVoid);
    })
}

fn method(class: &Class, name: &str, shorty: &str) -> Arc<Method> {
    class.find_declared_method(name, shorty).unwrap().clone()
}

// =============================================================================
// Dispatch Benchmarks
// =============================================================================

fn bench_dispatch(c: &mut Criterion) {
    let runtime = Runtime::testing();
    let thread = runtime.attach_current_thread("bench");
    let class = runtime
        .class_linker()
        .define_class(&thread, ClassDef::new("LSum;").method("sum", "II", PUBLIC_STATIC, sum_loop()))
        .unwrap();
    let sum = method(&class, "sum", "II");

    let mut group = c.benchmark_group("dispatch");
    for n in [10i32, 1_000, 100_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("sum_loop", n), &n, |b, &n| {
            b.iter(|| black_box(runtime.invoke(&thread, &sum, &[JValue::from_int(black_box(n))]).int()))
        });
    }
    group.finish();
    runtime.detach_current_thread(&thread);
}

// =============================================================================
// Invoke Benchmarks
// =============================================================================

fn bench_invoke(c: &mut Criterion) {
    let runtime = Runtime::testing();
    let thread = runtime.attach_current_thread("bench");
    let mut dex = DexFile::new("calls.dex");
    let leaf_static = dex.add_method("LCalls;", "leaf", "V");
    let leaf_virtual = dex.add_method("LCalls;", "touch", "V");
    let void = build(0, 0, |b| {
        b.op_10x(Opcode::ReturnVoid);
    });
    let receiver_void = build(1, 1, |b| {
        b.op_10x(Opcode::ReturnVoid);
    });
    let class = runtime
        .class_linker()
        .define_class(
            &thread,
            ClassDef::new("LCalls;")
                .dex_file(Arc::new(dex))
                .method("leaf", "V", PUBLIC_STATIC, void)
                .method("touch", "V", AccessFlags::PUBLIC, receiver_void)
                .method(
                    "statics",
                    "VLI",
                    PUBLIC_STATIC,
                    call_loop(Opcode::InvokeStatic, leaf_static.0 as u16, false),
                )
                .method(
                    "virtuals",
                    "VLI",
                    PUBLIC_STATIC,
                    call_loop(Opcode::InvokeVirtual, leaf_virtual.0 as u16, true),
                ),
        )
        .unwrap();
    let receiver = runtime
        .heap()
        .alloc_object(
            &mut ember_gc::Tlab::EMPTY,
            class.id,
            class.instance_prims as usize,
            class.instance_refs as usize,
        )
        .unwrap();

    let mut group = c.benchmark_group("invoke");
    const CALLS: i32 = 1_000;
    group.throughput(Throughput::Elements(CALLS as u64));
    for name in ["statics", "virtuals"] {
        let m = method(&class, name, "VLI");
        group.bench_function(name, |b| {
            b.iter(|| {
                runtime.invoke(
                    &thread,
                    &m,
                    &[JValue::from_ref(Some(receiver)), JValue::from_int(CALLS)],
                )
            })
        });
    }
    group.finish();
    runtime.detach_current_thread(&thread);
}

// =============================================================================
// Safepoint Benchmarks
// =============================================================================

fn bench_safepoints(c: &mut Criterion) {
    let runtime = Runtime::testing();
    let me = runtime.attach_current_thread("bench");
    let idle = runtime.attach_current_thread("idle");

    c.bench_function("empty_checkpoint", |b| {
        b.iter(|| black_box(runtime.thread_list().run_empty_checkpoint(&me)))
    });
    c.bench_function("suspend_resume_all", |b| {
        b.iter(|| {
            runtime.thread_list().suspend_all(&me, "bench").unwrap();
            runtime.thread_list().resume_all(&me);
        })
    });

    runtime.detach_current_thread(&idle);
    runtime.detach_current_thread(&me);
}

criterion_group!(benches, bench_dispatch, bench_invoke, bench_safepoints);
criterion_main!(benches);
