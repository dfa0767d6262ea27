//! Benchmarks for the parse/filter hot path and batch conditioning.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use forcetrace_acq::filtering::{BatchConditioner, ButterworthFilter, ConditioningConfig};
use forcetrace_acq::noise::{NoiseFilterConfig, StreamingNoiseFilter};
use forcetrace_acq::parser::FrameParser;
use forcetrace_core::Frame;

fn create_test_series(len: usize) -> Vec<f64> {
    (0..len)
        .map(|i| {
            let t = i as f64;
            500.0 + 40.0 * (t * 0.02).sin() + if i % 97 == 0 { 3000.0 } else { 0.0 }
        })
        .collect()
}

fn benchmark_parse(c: &mut Criterion) {
    let parser = FrameParser::default();
    let line = "Time:123456,V1:512,V2:498.25,V3:-3,V4:1021";

    c.bench_function("parse_frame", |b| b.iter(|| parser.parse(black_box(line))));
}

fn benchmark_streaming_filter(c: &mut Criterion) {
    let frames: Vec<Frame> = create_test_series(1000)
        .into_iter()
        .enumerate()
        .map(|(i, v)| Frame::new(i as i64 * 10, vec![v, v + 1.0, v - 1.0, v * 0.5]))
        .collect();

    c.bench_function("streaming_filter_1000", |b| {
        b.iter(|| {
            let mut filter = StreamingNoiseFilter::new(NoiseFilterConfig::default(), 4);
            for frame in &frames {
                black_box(filter.accept(frame));
            }
        })
    });
}

fn benchmark_conditioning(c: &mut Criterion) {
    let conditioner = BatchConditioner::new(ConditioningConfig::standard()).unwrap();

    let short = create_test_series(1_000);
    let long = create_test_series(20_000);

    c.bench_function("condition_1k", |b| {
        b.iter(|| conditioner.condition(black_box(&short)))
    });

    c.bench_function("condition_20k", |b| {
        b.iter(|| conditioner.condition(black_box(&long)))
    });
}

fn benchmark_filtfilt(c: &mut Criterion) {
    let filter = ButterworthFilter::normalized(2, 0.1);
    let data = create_test_series(20_000);

    c.bench_function("filtfilt_20k", |b| b.iter(|| filter.filtfilt(black_box(&data))));
}

criterion_group!(
    benches,
    benchmark_parse,
    benchmark_streaming_filter,
    benchmark_conditioning,
    benchmark_filtfilt
);
criterion_main!(benches);
