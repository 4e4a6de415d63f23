//! Dedup queue throughput benchmarks
//!
//! Measures producer push cost and end-to-end delivery to the consumer.
//!
//! Run with: `cargo bench -p otter-vm-dedup`

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use otter_vm_dedup::{DedupConfig, DedupService, Hub, ProcessOutcome, WorkerQueue};
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Push cost on a single worker with nobody consuming
fn push_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("push");

    for count in [1_000u64, 10_000, 100_000].iter() {
        group.throughput(Throughput::Elements(*count));
        group.bench_with_input(BenchmarkId::new("single_worker", count), count, |b, &n| {
            b.iter_custom(|iters| {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let hub: Arc<Hub<u64>> = Hub::new(1);
                    let mut queue = WorkerQueue::attach(hub.clone(), 0).unwrap();

                    let start = Instant::now();
                    for i in 0..n {
                        queue.push(black_box(i));
                    }
                    total += start.elapsed();

                    // Unconsumed chunks are freed with the hub
                    drop(queue);
                    hub.terminate();
                }
                total
            });
        });
    }

    group.finish();
}

/// Producers to consumer, including the final drain
fn delivery_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("delivery");
    group.sample_size(20);

    const PER_WORKER: u64 = 50_000;
    for workers in [1usize, 2, 4].iter() {
        group.throughput(Throughput::Elements(PER_WORKER * *workers as u64));
        group.bench_with_input(BenchmarkId::new("workers", workers), workers, |b, &w| {
            b.iter(|| {
                let service = DedupService::<u64>::new(DedupConfig::with_workers(w), |v: u64| {
                    black_box(v);
                    ProcessOutcome::Skipped
                })
                .unwrap();

                thread::scope(|scope| {
                    for worker_id in 0..w {
                        let mut queue = service.worker_queue(worker_id).unwrap();
                        scope.spawn(move || {
                            for i in 0..PER_WORKER {
                                queue.push(i);
                            }
                        });
                    }
                });

                let stats = service.stop().unwrap();
                assert_eq!(stats.inspected, PER_WORKER * w as u64);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, push_benchmark, delivery_benchmark);
criterion_main!(benches);
