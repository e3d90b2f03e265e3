// Performance benchmarks for the virtual clock and ring helpers
//
// Run with: cargo bench --bench clock_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use virtuoso_core::domain::clock::ClockTimeline;
use virtuoso_core::domain::pcm::{copy_between_rings, ring_fill, ring_write};

fn bench_timeline_advance(c: &mut Criterion) {
    let mut group = c.benchmark_group("timeline_advance");

    for rate in [8000u64, 44100, 48000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(rate), rate, |b, &rate| {
            let byte_rate = rate * 4;
            let mut tl = ClockTimeline::new();
            tl.prepare(byte_rate, 8192, 2048);
            tl.start(0);

            let mut now = 0u64;
            b.iter(|| {
                now += 11;
                black_box(tl.advance(black_box(now)));
                tl.take_elapsed();
            });
        });
    }

    group.finish();
}

fn bench_ring_write_one_period(c: &mut Criterion) {
    let mut ring = vec![0u8; 16384];
    let data = vec![0x5au8; 2048];

    c.bench_function("ring_write_2048_bytes_wrapping", |b| {
        let mut pos = 0usize;
        b.iter(|| {
            ring_write(&mut ring, black_box(pos), black_box(&data));
            pos = (pos + data.len()) % 16384;
        });
    });
}

fn bench_cable_copy(c: &mut Criterion) {
    // Rings of different sizes force boundary chunking on both sides
    let src = vec![0x5au8; 12288];
    let mut dst = vec![0u8; 16384];

    c.bench_function("copy_between_rings_2048_bytes", |b| {
        let mut src_pos = 0usize;
        let mut dst_pos = 0usize;
        b.iter(|| {
            copy_between_rings(
                black_box(&src),
                src_pos,
                black_box(&mut dst),
                dst_pos,
                2048,
            );
            src_pos = (src_pos + 2048) % src.len();
            dst_pos = (dst_pos + 2048) % dst.len();
        });
    });
}

fn bench_silence_fill(c: &mut Criterion) {
    let mut ring = vec![0x5au8; 16384];

    c.bench_function("ring_fill_2048_bytes", |b| {
        let mut pos = 0usize;
        b.iter(|| {
            ring_fill(&mut ring, black_box(pos), 2048, 0);
            pos = (pos + 2048) % 16384;
        });
    });
}

criterion_group!(
    benches,
    bench_timeline_advance,
    bench_ring_write_one_period,
    bench_cable_copy,
    bench_silence_fill
);
criterion_main!(benches);
