//! Criterion benchmarks for dark subtraction.
//!
//! Compares the inline kernel with the persistent worker pool for frame sizes
//! typical of wavefront sensors, to pick `dark_subtract_threads`.
//!
//! Run with: cargo bench --bench dark_subtract

use aol_stream::PixelBuffer;
use aoloop_camin::camin::{subtract_inline, DarkSubtractPool};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const SIZES: [(&str, usize); 3] = [("120x120", 120 * 120), ("240x240", 240 * 240), ("512x512", 512 * 512)];

fn frames(nelem: usize) -> (PixelBuffer, Vec<f32>, Vec<f32>) {
    let raw = PixelBuffer::U16((0..nelem).map(|i| (i % 4096) as u16).collect());
    let dark = (0..nelem).map(|i| (i % 7) as f32).collect();
    (raw, dark, vec![0.0; nelem])
}

fn dark_subtract_inline(c: &mut Criterion) {
    let mut group = c.benchmark_group("dark_subtract_inline");
    for (label, nelem) in SIZES {
        let (raw, dark, mut out) = frames(nelem);
        group.throughput(Throughput::Elements(nelem as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &nelem, |b, _| {
            b.iter(|| subtract_inline(black_box(&raw), Some(&dark), &mut out))
        });
    }
    group.finish();
}

fn dark_subtract_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("dark_subtract_pool");
    for (label, nelem) in SIZES {
        let (raw, dark, mut out) = frames(nelem);
        group.throughput(Throughput::Elements(nelem as u64));
        for threads in [2usize, 4, 8] {
            let Ok(pool) = DarkSubtractPool::spawn(nelem, threads, "bench-dark") else {
                continue;
            };
            group.bench_with_input(BenchmarkId::new(label, threads), &threads, |b, _| {
                b.iter(|| pool.run(black_box(&raw), Some(&dark), &mut out))
            });
        }
    }
    group.finish();
}

criterion_group!(benches, dark_subtract_inline, dark_subtract_pool);
criterion_main!(benches);
