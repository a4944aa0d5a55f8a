use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use jobgrid::metrics::Metrics;
use std::sync::Arc;
use std::thread;

fn bench_counter_single_threaded(c: &mut Criterion) {
    let mut group = c.benchmark_group("counter_single_threaded");

    group.bench_function("inc", |b| {
        let metrics = Metrics::new();
        b.iter(|| {
            for _ in 0..1000 {
                metrics.inc(black_box("fetch.success"));
            }
        });
    });

    group.bench_function("observe", |b| {
        let metrics = Metrics::new();
        b.iter(|| {
            for ms in 0..1000u64 {
                metrics.observe_ms(black_box("fetch.latency"), ms % 700);
            }
        });
    });

    group.finish();
}

fn bench_counter_multi_threaded(c: &mut Criterion) {
    let mut group = c.benchmark_group("counter_multi_threaded");

    for num_threads in [2, 4, 8] {
        group.throughput(Throughput::Elements(num_threads as u64 * 1000));
        group.bench_with_input(
            BenchmarkId::new("inc", num_threads),
            &num_threads,
            |b, &num_threads| {
                let metrics = Arc::new(Metrics::new());
                b.iter(|| {
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            let metrics = Arc::clone(&metrics);
                            thread::spawn(move || {
                                for _ in 0..1000 {
                                    metrics.inc("fetch.success");
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let metrics = Metrics::new();
    for n in 0..50 {
        metrics.inc(&format!("counter.{n}"));
        metrics.set_gauge(&format!("gauge.{n}"), n as f64);
        metrics.observe_ms(&format!("hist.{n}"), n);
    }

    c.bench_function("snapshot", |b| {
        b.iter(|| black_box(metrics.snapshot()));
    });
}

criterion_group!(
    benches,
    bench_counter_single_threaded,
    bench_counter_multi_threaded,
    bench_snapshot
);
criterion_main!(benches);
