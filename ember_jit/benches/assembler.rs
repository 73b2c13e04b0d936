//! Assembler and Code Generator Benchmarks
//!
//! # Benchmark Categories
//!
//! 1. **Encoding**: raw instruction emission rate for common forms
//! 2. **Labels**: forward-branch chains resolved at bind time
//! 3. **Compilation**: whole-method codegen for straight-line and looping graphs
//!
//! # Performance Targets
//!
//! - Register-register ALU op: < 5ns
//! - Small method compile: < 20us

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ember_core::MethodIndex;
use ember_jit::backend::x64::{Address, Assembler, Condition, CpuRegister, Label, ScaleFactor, XmmRegister};
use ember_jit::codegen::{compile, ComparisonBias, DataType, HGraph, HKind, IfCondition};
use ember_jit::{CodegenOptions, InstructionSet};

// =============================================================================
// Benchmark Helpers
// =============================================================================

/// Straight-line sum of `n` parameters.
fn sum_graph(n: u16) -> HGraph {
    let mut g = HGraph::new(MethodIndex(0), true);
    let entry = g.add_block();
    let params: Vec<_> = (0..n)
        .map(|i| g.add(entry, HKind::Parameter { index: i }, DataType::Int32, &[], 0))
        .collect();
    let mut acc = params[0];
    for (pc, &p) in params[1..].iter().enumerate() {
        acc = g.add(entry, HKind::Add, DataType::Int32, &[acc, p], pc as u32 + 1);
    }
    g.add(entry, HKind::Return, DataType::Void, &[acc], u32::from(n));
    g
}

/// Countdown loop with a suspend check in its header.
fn loop_graph() -> HGraph {
    let mut g = HGraph::new(MethodIndex(1), true);
    let entry = g.add_block();
    let header = g.add_block();
    let body = g.add_block();
    let exit = g.add_block();
    let n = g.add(entry, HKind::Parameter { index: 0 }, DataType::Int32, &[], 0);
    g.add(entry, HKind::Goto { target: header }, DataType::Void, &[], 0);
    g.add(header, HKind::SuspendCheck, DataType::Void, &[], 1);
    let zero = g.add(header, HKind::IntConstant(0), DataType::Int32, &[], 1);
    let cond = g.add(
        header,
        HKind::Condition {
            cond: IfCondition::Gt,
            bias: ComparisonBias::None,
        },
        DataType::Bool,
        &[n, zero],
        2,
    );
    g.add(
        header,
        HKind::If {
            true_block: body,
            false_block: exit,
        },
        DataType::Void,
        &[cond],
        2,
    );
    g.add(body, HKind::Goto { target: header }, DataType::Void, &[], 3);
    g.add(exit, HKind::ReturnVoid, DataType::Void, &[], 4);
    g
}

// =============================================================================
// Encoding Benchmarks
// =============================================================================

fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("encoding");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("alu_rr", |b| {
        b.iter(|| {
            let mut asm = Assembler::new(InstructionSet::X86_64);
            for _ in 0..1000 {
                asm.addq_rr(CpuRegister::R9, CpuRegister::RAX);
            }
            black_box(asm.code_size())
        })
    });

    group.bench_function("sib_memory", |b| {
        let addr = Address::indexed(CpuRegister::R12, CpuRegister::RCX, ScaleFactor::Times8, 0x40);
        b.iter(|| {
            let mut asm = Assembler::new(InstructionSet::X86_64);
            for _ in 0..1000 {
                asm.movq_rm(CpuRegister::RDX, black_box(&addr));
            }
            black_box(asm.code_size())
        })
    });

    group.bench_function("sse_literal", |b| {
        b.iter(|| {
            let mut asm = Assembler::new(InstructionSet::X86_64);
            for i in 0..1000 {
                let lit = asm.literal_double(f64::from(i & 15));
                asm.addsd_rm(XmmRegister::XMM1, &lit);
            }
            black_box(asm.finalize().code.len())
        })
    });

    group.finish();
}

// =============================================================================
// Label Benchmarks
// =============================================================================

fn bench_labels(c: &mut Criterion) {
    let mut group = c.benchmark_group("labels");

    for uses in [1usize, 16, 256] {
        group.bench_with_input(BenchmarkId::new("forward_chain", uses), &uses, |b, &uses| {
            b.iter(|| {
                let mut asm = Assembler::new(InstructionSet::X86_64);
                let mut target = Label::new();
                for _ in 0..uses {
                    asm.j(Condition::NotEqual, &mut target);
                }
                asm.bind(&mut target);
                black_box(asm.code_size())
            })
        });
    }

    group.finish();
}

// =============================================================================
// Compilation Benchmarks
// =============================================================================

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let options = CodegenOptions::plain();

    for n in [2u16, 8, 32] {
        group.bench_with_input(BenchmarkId::new("sum_params", n), &n, |b, &n| {
            b.iter(|| {
                let mut g = sum_graph(n);
                black_box(compile(&mut g, &options).map(|m| m.code.len()))
            })
        });
    }

    group.bench_function("countdown_loop", |b| {
        b.iter(|| {
            let mut g = loop_graph();
            black_box(compile(&mut g, &options).map(|m| m.code.len()))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_encoding, bench_labels, bench_compile);
criterion_main!(benches);
