//! End-to-end reconstruction on a random model with the 24 kHz topology.
//!
//! Run with: `cargo bench --bench pipeline`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use encodec::models::layout::ModelLayout;
use encodec::models::{FileType, WeightWriter};
use encodec::{EncodecContext, Hyperparameters, ReconstructOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;
use std::hint::black_box;

/// Default topology with narrower convolutions so a run stays under a second.
fn bench_hparams() -> Hyperparameters {
    Hyperparameters {
        n_filters: 8,
        n_q: 8,
        n_bins: 256,
        ..Default::default()
    }
}

fn random_context(hp: &Hyperparameters) -> EncodecContext {
    let mut rng = StdRng::seed_from_u64(3);
    let mut writer = WeightWriter::new(Vec::new(), hp).unwrap();
    for spec in ModelLayout::new(hp).tensors() {
        let scale = 1.0 / (spec.shape.iter().skip(1).product::<usize>().max(1) as f32).sqrt();
        let data: Vec<f32> = (0..spec.numel())
            .map(|_| rng.gen_range(-scale..scale))
            .collect();
        writer
            .write_tensor(&spec.name, &spec.shape, &data, FileType::F32)
            .unwrap();
    }
    let bytes = writer.finish().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.bin");
    std::fs::write(&path, bytes).unwrap();
    EncodecContext::load(&path).unwrap()
}

fn sine_wave(n: usize, sample_rate: u32) -> Vec<f32> {
    (0..n)
        .map(|i| 0.5 * (2.0 * PI * 440.0 * i as f32 / sample_rate as f32).sin())
        .collect()
}

fn bench_reconstruct(c: &mut Criterion) {
    let hp = bench_hparams();
    let mut ctx = random_context(&hp);
    let hop = hp.compression_factor();
    let mut group = c.benchmark_group("reconstruct");
    group.sample_size(10);

    for seconds in [1usize, 4] {
        let samples = sine_wave(seconds * 75 * hop, hp.sample_rate);
        for threads in [1, 4] {
            let opts = ReconstructOptions::default().with_threads(threads);
            group.bench_with_input(
                BenchmarkId::from_parameter(format!("{seconds}s_{threads}t")),
                &samples,
                |b, samples| {
                    b.iter(|| ctx.reconstruct_with(black_box(samples), &opts).unwrap());
                },
            );
        }
    }
    group.finish();
}

fn bench_bandwidths(c: &mut Criterion) {
    let hp = bench_hparams();
    let mut ctx = random_context(&hp);
    let samples = sine_wave(75 * hp.compression_factor(), hp.sample_rate);
    let mut group = c.benchmark_group("encode_bandwidth");
    group.sample_size(10);

    for n_q in hp.supported_n_q() {
        let opts = ReconstructOptions::default().with_n_q(n_q);
        group.bench_with_input(BenchmarkId::from_parameter(n_q), &opts, |b, opts| {
            b.iter(|| ctx.encode(black_box(&samples), opts).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_reconstruct, bench_bandwidths);
criterion_main!(benches);
