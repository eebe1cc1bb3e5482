// benches/rescale_bench.rs
// ============================================================================
// Rescale / Synthesis Benchmark
// ============================================================================

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use half::f16;
use rand::Rng;
use smoothquant_gguf::model::{WeightData, WeightTensor};
use smoothquant_gguf::smooth::{quantile, rescale_in_place, ScaleSynthesizer};

fn random_values(size: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen_range(-2.0..2.0)).collect()
}

fn random_scale(cols: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..cols).map(|_| rng.gen_range(0.05..8.0)).collect()
}

fn bench_rescale(c: &mut Criterion) {
    let mut group = c.benchmark_group("Rescale");

    for dim in [256usize, 1024, 4096].iter() {
        let values = random_values(dim * dim);
        let scale = random_scale(*dim);

        group.bench_with_input(BenchmarkId::new("F32", dim), &values, |b, v| {
            b.iter(|| {
                let mut w = WeightTensor::from_f32("w", *dim, *dim, v.clone()).unwrap();
                rescale_in_place("w", &mut w, &scale).unwrap();
                black_box(w)
            })
        });

        let halves: Vec<f16> = values.iter().map(|&x| f16::from_f32(x)).collect();
        group.bench_with_input(BenchmarkId::new("F16", dim), &halves, |b, v| {
            b.iter(|| {
                let mut w = WeightTensor::new("w", *dim, *dim, WeightData::F16(v.clone())).unwrap();
                rescale_in_place("w", &mut w, &scale).unwrap();
                black_box(w)
            })
        });
    }

    group.finish();
}

fn bench_synthesis(c: &mut Criterion) {
    let mut group = c.benchmark_group("Synthesis");
    let synth = ScaleSynthesizer::new(0.5).unwrap();

    for batches in [16usize, 64, 256].iter() {
        let record: Vec<Vec<f32>> = (0..*batches).map(|_| random_values(4096)).collect();
        group.bench_with_input(BenchmarkId::new("p95", batches), &record, |b, r| {
            b.iter(|| black_box(synth.activation_stat("layer", r).unwrap()))
        });
    }

    let mut column = random_values(100_000);
    group.bench_function("quantile_100k", |b| b.iter(|| black_box(quantile(&mut column, 0.95))));

    group.finish();
}

criterion_group!(benches, bench_rescale, bench_synthesis);
criterion_main!(benches);
