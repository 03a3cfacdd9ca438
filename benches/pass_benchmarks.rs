//! Performance benchmarks for the optimizing pipeline
//!
//! Run with: cargo bench
//!
//! These benchmarks measure:
//! - Value numbering over large graphs of redundant arithmetic
//! - Scheduling under both placement policies
//! - The full pipeline on profiled methods

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mercury::circuit::{BytecodeInfo, BytecodeOp, GateType, MachineType};
use mercury::pass::{GraphVisitor, Scheduler, ValueNumbering};
use mercury::pgo::{MethodId, PgoSample, PrimitiveSample};
use mercury::{
    Circuit, CircuitBuilder, CircuitInfo, CompilationUnit, CompilerOptions, ProfileSource, ProfileTypeManager,
    SchedulePolicy,
};
use std::sync::Arc;

fn options() -> CompilerOptions {
    CompilerOptions {
        fatal_verifier: false,
        ..CompilerOptions::default()
    }
}

/// `count` copies of `x + y`
fn redundant_adds(count: usize) -> Circuit {
    let mut circuit = Circuit::new(CircuitInfo::new("adds", MethodId(0)));
    let mut b = CircuitBuilder::new(&mut circuit);
    let x = b.arg(2, GateType::NJSValue);
    let y = b.arg(3, GateType::NJSValue);
    let first = b.int_add(MachineType::I64, x, y);
    for _ in 1..count {
        b.int_add(MachineType::I64, x, y);
    }
    b.ret(first);
    circuit
}

/// A chain of `count` generic additions, each profiled at its own pc
fn add_chain(count: u32) -> Circuit {
    let mut circuit = Circuit::new(CircuitInfo::new("chain", MethodId(0)));
    let mut b = CircuitBuilder::new(&mut circuit);
    let mut acc = b.arg(2, GateType::AnyType);
    let step = b.arg(3, GateType::AnyType);
    for pc in 0..count {
        acc = b.bytecode(BytecodeInfo::new(MethodId(0), pc, BytecodeOp::Add2), &[acc, step]);
    }
    b.ret(acc);
    circuit
}

/// Benchmark: Value numbering
fn bench_value_numbering(c: &mut Criterion) {
    let mut group = c.benchmark_group("value_numbering");

    for size in [100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let options = options();
            b.iter_batched(
                || redundant_adds(size),
                |mut circuit| {
                    let mut gvn = ValueNumbering::new(&options);
                    GraphVisitor::new().run(&mut circuit, &mut [&mut gvn]).unwrap();
                    black_box(circuit)
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

/// Benchmark: Scheduling
fn bench_scheduler(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");
    let circuit = add_chain(500);

    for policy in [SchedulePolicy::Eager, SchedulePolicy::Lazy] {
        group.bench_function(format!("{:?}", policy).to_lowercase(), |b| {
            let scheduler = Scheduler::with_policy(policy);
            b.iter(|| scheduler.run(black_box(&circuit)).unwrap())
        });
    }

    group.finish();
}

/// Benchmark: Full pipeline
fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");

    for size in [10u32, 100] {
        let manager = Arc::new(ProfileTypeManager::new());
        for pc in 0..size {
            manager.record_sample(MethodId(0), pc, PgoSample::primitive(PrimitiveSample::Int));
        }
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("int_adds", size), &size, |b, &size| {
            b.iter_batched(
                || add_chain(size),
                |circuit| {
                    let unit = CompilationUnit::new(circuit, ProfileSource::offline(Arc::clone(&manager)), options());
                    black_box(unit.compile().unwrap())
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.bench_function("unprofiled", |b| {
        b.iter_batched(
            || add_chain(100),
            |circuit| black_box(CompilationUnit::unprofiled(circuit, options()).compile().unwrap()),
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_value_numbering, bench_scheduler, bench_pipeline);
criterion_main!(benches);
