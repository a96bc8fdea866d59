//! Contention Benchmarks
//!
//! Measures the cost of the two runtime primitives under load:
//! - Shared aggregate: N tasks contending for one lock until finalization
//! - Fan-in multiplexer: dispatch round overhead with several ready sources
//!
//! Run with: `cargo bench`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use conflux_core::source;
use conflux_runtime::{Budget, FanInMultiplexer, SharedAggregate};
use conflux_testing::AlwaysReady;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

/// Benchmark contributors racing to finalize one aggregate
fn benchmark_aggregate_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_contention");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    for contributors in [1_usize, 10, 100, 1_000] {
        group.throughput(Throughput::Elements(contributors as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(contributors),
            &contributors,
            |b, &contributors| {
                b.to_async(&runtime).iter(|| async move {
                    let views = SharedAggregate::<u64, u64>::new(0, contributors)
                        .expect("valid contributor count");

                    for _ in 0..contributors {
                        let views = views.clone();
                        tokio::spawn(async move { views.contribute(black_box(1)).await });
                    }

                    views.await_finalized().await.expect("aggregate finalized")
                });
            },
        );
    }

    group.finish();
}

/// Benchmark single dispatch rounds
fn benchmark_dispatch_round(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_round");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");

    for sources in [1_usize, 4, 16] {
        group.bench_with_input(BenchmarkId::new("always_ready", sources), &sources, |b, &sources| {
            b.to_async(&runtime).iter(|| async move {
                let mut builder = FanInMultiplexer::builder();
                for index in 0..sources {
                    builder = builder.channel(format!("source-{index}"), AlwaysReady::new(index), |v| {
                        black_box(v);
                    });
                }
                let mut mux = builder.build().expect("valid multiplexer");
                mux.run(Budget::rounds(100)).await.expect("rounds complete")
            });
        });
    }

    group.bench_function("drain_one_shots", |b| {
        b.to_async(&runtime).iter(|| async {
            let mut mux = FanInMultiplexer::builder()
                .channel("chan1", source::once(async { 10 }), |v: i32| {
                    black_box(v);
                })
                .channel("chan2", source::once(async { "P..." }), |v: &str| {
                    black_box(v);
                })
                .build()
                .expect("valid multiplexer");
            mux.run(Budget::UntilExhausted).await.expect("sources drained")
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_aggregate_contention, benchmark_dispatch_round);
criterion_main!(benches);
