//! Forward-pass benchmarks for the dense (single-rank) configuration.
//!
//! Sharded runs add only the collectives on top of this work, so the dense
//! numbers are the per-rank compute baseline.

use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use synapse_core::comm::SingleProcess;
use synapse_core::model::{Gpt, GptConfig};

fn build_gpt(depth: usize, dim: usize, num_heads: usize) -> Gpt {
    let config = GptConfig {
        depth,
        dim,
        num_heads,
        ..Default::default()
    };
    Gpt::random(&config, Arc::new(SingleProcess::new()), &Device::Cpu).unwrap()
}

fn input(batch: usize, seq: usize, dim: usize) -> Tensor {
    Tensor::randn(0.0f32, 1.0, &[batch, seq, dim], &Device::Cpu).unwrap()
}

fn bench_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_depth");
    let (batch, seq, dim) = (1, 64, 256);

    for depth in [1, 2, 4] {
        let gpt = build_gpt(depth, dim, 8);
        let x = input(batch, seq, dim);
        group.throughput(Throughput::Elements((batch * seq) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| black_box(gpt.forward(&x, false).unwrap()));
        });
    }
    group.finish();
}

fn bench_sequence_length(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_seq_len");
    let (batch, dim) = (1, 256);
    let gpt = build_gpt(2, dim, 8);

    for seq in [16, 64, 256] {
        let x = input(batch, seq, dim);
        group.throughput(Throughput::Elements((batch * seq) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(seq), &seq, |b, _| {
            b.iter(|| black_box(gpt.forward(&x, false).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_depth, bench_sequence_length);
criterion_main!(benches);
