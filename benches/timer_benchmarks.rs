use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_evloop::{Loop, LoopConfig};
use std::time::Duration;

fn bench_loop() -> Loop {
    Loop::with_config(LoopConfig::new().signals(false)).expect("create loop")
}

fn timer_insertion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer_insertion");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_insert", |b| {
        let l = bench_loop();
        b.iter(|| {
            let timer = l.timer(black_box(Duration::from_secs(60)), false, || Ok(()));
            black_box(timer.id())
        });
        l.clear();
    });

    group.finish();
}

fn timer_batch_insertion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer_batch_insertion");

    for batch_size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &n| {
            let l = bench_loop();
            b.iter(|| {
                for i in 0..n {
                    l.timer(Duration::from_millis(100 + i as u64), false, || Ok(()));
                }
                l.clear();
            });
        });
    }

    group.finish();
}

fn timer_expiry_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer_expiry");

    for batch_size in [100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &n| {
            let l = bench_loop();
            b.iter(|| {
                for _ in 0..n {
                    l.timer(Duration::ZERO, false, || Ok(()));
                }
                l.tick(false).expect("tick");
            });
        });
    }

    group.finish();
}

fn timer_stop_benchmark(c: &mut Criterion) {
    c.bench_function("timer_start_stop", |b| {
        let l = bench_loop();
        let timer = l.timer(Duration::from_secs(60), false, || Ok(()));
        b.iter(|| {
            timer.stop();
            timer.start();
        });
        l.clear();
    });
}

criterion_group!(
    benches,
    timer_insertion_benchmark,
    timer_batch_insertion_benchmark,
    timer_expiry_benchmark,
    timer_stop_benchmark
);
criterion_main!(benches);
