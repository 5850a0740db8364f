//! Benchmarks for event merging, stage reads and block execution
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flowbench::block::{execute, Block};
use flowbench::context::{ContextModified, DictModified, NumericContext};
use flowbench::filter::ExpressionFilter;
use flowbench::pipeline::Stage;
use flowbench::{Context, Value};
use std::rc::Rc;

fn bench_event_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_merge");

    for size in [10usize, 100, 1000].iter() {
        let dict_trace: Vec<DictModified> = (0..*size)
            .map(|i| match i % 3 {
                0 => DictModified::added(format!("k{}", i % 17), Value::Int(i as i64)),
                1 => DictModified::changed(format!("k{}", i % 17), Value::Int(0), Value::Int(i as i64)),
                _ => DictModified::removed(format!("k{}", i % 13), Value::Int(0)),
            })
            .collect();
        let context_trace: Vec<ContextModified> = (0..*size)
            .map(|i| ContextModified::default().with_modified([format!("k{}", i % 17)]))
            .collect();

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("dict", size), &dict_trace, |b, trace| {
            b.iter(|| {
                let mut merged = DictModified::default();
                for event in trace.iter().cloned() {
                    merged.merge(event);
                }
                black_box(merged)
            })
        });
        group.bench_with_input(BenchmarkId::new("context", size), &context_trace, |b, trace| {
            b.iter(|| {
                let mut merged = ContextModified::default();
                for event in trace.iter().cloned() {
                    merged.merge(event);
                }
                black_box(merged)
            })
        });
    }

    group.finish();
}

fn bench_reduction_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduction_read");

    for size in [1_000usize, 100_000].iter() {
        let root = Context::new("bench");
        root.set("depth", (0..*size).map(|i| i as f64).collect::<Vec<_>>())
            .unwrap();
        let filter = ExpressionFilter::new(&format!("depth > {}", size / 2)).unwrap();
        let stage = Stage::reduction(Rc::new(root.clone()), Some(Rc::new(filter)), false);

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("cached_mask", size), &stage, |b, stage| {
            b.iter(|| black_box(stage.get_context_data("depth").unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("recompute_mask", size), &stage, |b, stage| {
            b.iter(|| {
                root.context_modified().emit(&ContextModified::default().with_modified(["depth"]));
                black_box(stage.get_context_data("depth").unwrap())
            })
        });
    }

    group.finish();
}

fn bench_block_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_execution");

    let source = "\
import numpy as np
a = np.sqrt(x)
b = a * 2 + 1
c = np.where(b > 10, b, 0)
total = np.sum(c)
d = x - 1";
    let block = Block::parse(source).unwrap();

    group.bench_function("parse", |b| b.iter(|| black_box(Block::parse(source).unwrap())));
    group.bench_function("topological_order", |b| {
        b.iter(|| black_box(block.topological_order().unwrap()))
    });

    for size in [100usize, 10_000].iter() {
        let root = Context::new("bench");
        root.set("x", (0..*size).map(|i| i as f64).collect::<Vec<_>>())
            .unwrap();
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("execute", size), &root, |b, root| {
            b.iter(|| black_box(execute(&block, root).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_event_merge, bench_reduction_read, bench_block_execution);
criterion_main!(benches);
