#![allow(unused)]
extern crate dfgscope;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use dfgscope::prelude::*;
use std::hint::black_box;

/// Instruction source stub for benchmarks that never decode.
struct NullImage;

impl DisassemblyService for NullImage {
    fn decode(&self, address: u32) -> Result<Insn> {
        Err(Error::Decode(u64::from(address)))
    }

    fn read_word(&self, _address: u32) -> Option<u32> {
        None
    }

    fn is_read_only(&self, _address: u32) -> bool {
        false
    }

    fn is_internal(&self, _address: u32) -> bool {
        false
    }

    fn is_thumb(&self, _address: u32) -> bool {
        false
    }

    fn function_start(&self, _address: u32) -> Option<u32> {
        None
    }

    fn function_returns(&self, _address: u32) -> bool {
        true
    }
}

fn fresh_builder() -> Builder {
    Builder::new(Disassembly::new(Box::new(NullImage)))
}

/// Benchmark simplifying sum construction over a mix of symbolic terms and
/// constants.
///
/// Every iteration rebuilds the chain from an empty graph, so the numbers
/// cover interning, flattening and constant folding together.
fn bench_sum_chain(c: &mut Criterion) {
    const TERMS: u64 = 256;

    let mut group = c.benchmark_group("builder_sum");
    group.throughput(Throughput::Elements(TERMS));
    group.bench_function("sum_256_terms", |b| {
        b.iter(|| {
            let mut builder = fresh_builder();
            let mut sum = builder.constant(0);
            for index in 0..TERMS as u32 {
                let term = if index % 3 == 0 {
                    builder.constant(index)
                } else {
                    builder.register((index % 13) as u8)
                };
                sum = builder.add(black_box(sum), black_box(term));
            }
            black_box(sum)
        });
    });
    group.finish();
}

/// Benchmark re-interning an expression the graph already holds.
///
/// The second construction of every node hits the hash-cons table instead of
/// allocating, which is the hot path while walking straight-line code.
fn bench_hash_cons_hits(c: &mut Criterion) {
    const TERMS: u64 = 256;

    let mut builder = fresh_builder();
    let mut sum = builder.register(0);
    for index in 1..TERMS as u32 {
        let term = builder.register((index % 13) as u8);
        sum = builder.add(sum, term);
    }
    let baseline = builder.graph().len();

    let mut group = c.benchmark_group("builder_reintern");
    group.throughput(Throughput::Elements(TERMS));
    group.bench_function("reintern_256_terms", |b| {
        b.iter(|| {
            let mut sum = builder.register(0);
            for index in 1..TERMS as u32 {
                let term = builder.register((index % 13) as u8);
                sum = builder.add(black_box(sum), black_box(term));
            }
            black_box(sum)
        });
    });
    group.finish();

    assert_eq!(builder.graph().len(), baseline);
}

/// Benchmark normalizing a relational condition whose left side carries
/// pullable constants.
fn bench_condition_normalize(c: &mut Criterion) {
    let mut builder = fresh_builder();
    let register = builder.register(0);
    let offset = builder.constant(0x20);
    let shifted = builder.add(register, offset);
    let target = builder.constant(0x1000);

    let mut group = c.benchmark_group("condition_normalize");
    group.bench_function("pull_add_constant", |b| {
        b.iter(|| {
            let mut condition = Condition::new(black_box(shifted), RelOp::Ult, black_box(target));
            condition.normalize(&mut builder);
            black_box(condition)
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_sum_chain,
    bench_hash_cons_hits,
    bench_condition_normalize
);
criterion_main!(benches);
