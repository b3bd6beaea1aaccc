use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rust_growing_charnet::{GenerationConfig, GrowingNetwork};

const SAMPLE: &str = "el sol sale por el este y se pone por el oeste. la luna brilla de noche.";

fn benchmark_learn(c: &mut Criterion) {
    let mut group = c.benchmark_group("Learn");
    for &hidden in &[32usize, 128, 512] {
        // Fresh network per batch so accumulated characters never trigger growth.
        group.bench_function(format!("learn 1 epoch, H={}", hidden), |bencher| {
            bencher.iter_batched(
                || GrowingNetwork::seeded(SAMPLE, hidden, 0),
                |mut net| black_box(net.learn(black_box(SAMPLE), 1, None)),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn benchmark_forward(c: &mut Criterion) {
    let net = GrowingNetwork::seeded(SAMPLE, 128, 1);
    let indices = net.vocab().encode(SAMPLE);
    c.bench_function("forward H=128", |bencher| {
        bencher.iter(|| black_box(net.forward(black_box(&indices))));
    });
}

fn benchmark_generate(c: &mut Criterion) {
    let mut net = GrowingNetwork::seeded(SAMPLE, 128, 2);
    let config = GenerationConfig::default();
    c.bench_function("generate 80 chars H=128", |bencher| {
        bencher.iter(|| black_box(net.generate("el ", &config)));
    });
}

criterion_group!(benches, benchmark_learn, benchmark_forward, benchmark_generate);
criterion_main!(benches);
