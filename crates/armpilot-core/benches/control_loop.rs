//! Benchmarks for the per-tick hot path
//!
//! Run with: cargo bench --bench control_loop

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{ArrayD, IxDyn};

use armpilot_core::control::interpolator;
use armpilot_core::frame::{CalibrationFrame, FrameTranslator, JointLimits, ZeroConvention};
use armpilot_core::policy::{ChunkBroker, InferenceResult, Observation, Policy, PolicyField};
use armpilot_core::Result;

/// Policy returning a fixed chunk without any I/O
struct Canned {
    len: usize,
}

impl Policy for Canned {
    fn infer(&mut self, _obs: &Observation) -> Result<InferenceResult> {
        let actions = ArrayD::from_elem(IxDyn(&[self.len, 7]), 0.25);
        let logits = ArrayD::from_elem(IxDyn(&[self.len, 32]), 0.0);
        Ok(InferenceResult::new(actions).with_field("logits", PolicyField::Array(logits)))
    }
}

fn bench_broker(c: &mut Criterion) {
    let mut group = c.benchmark_group("Broker");
    let obs = Observation::new([0.0; 7], "bench");

    for horizon in [1usize, 10, 50].iter() {
        group.bench_with_input(BenchmarkId::new("next_action", horizon), horizon, |b, &h| {
            let mut broker = ChunkBroker::new(Canned { len: 50 }, h).unwrap();
            b.iter(|| black_box(broker.next_action(&obs).unwrap()))
        });
    }

    group.finish();
}

fn bench_translator(c: &mut Criterion) {
    let mut group = c.benchmark_group("Translator");
    let frame = CalibrationFrame::new(
        "bench",
        [1.0, -1.0, -1.0, 1.0, -1.0, 1.0, 1.0],
        CalibrationFrame::NORMALIZED_SCALE,
        ZeroConvention::RelativePowerOn,
    )
    .unwrap()
    .capture(&[0.1, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    let translator = FrameTranslator::new(frame, JointLimits::default());
    let action = [0.2, -0.1, 0.4, 0.9, -0.5, 0.3, 0.7];

    group.bench_function("command (translate + clamp)", |b| {
        b.iter(|| black_box(translator.command(black_box(&action))))
    });

    group.bench_function("to_policy", |b| {
        b.iter(|| black_box(translator.to_policy(black_box(&action))))
    });

    group.finish();
}

fn bench_bridge(c: &mut Criterion) {
    let mut group = c.benchmark_group("Interpolator");
    let start = [0.0; 7];
    let target = [0.6, 0.2, 0.1, -0.3, 0.1, 0.5, 1.0];

    for n in [5usize, 15, 50].iter() {
        group.bench_with_input(BenchmarkId::new("bridge", n), n, |b, &n| {
            b.iter(|| {
                for pose in interpolator::bridge(&start, &target, n) {
                    black_box(pose);
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_broker, bench_translator, bench_bridge);
criterion_main!(benches);
