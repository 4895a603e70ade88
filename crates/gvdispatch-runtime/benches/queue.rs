//! Queue submission benchmarks
//!
//! - `sync` round trip on serial and concurrent queues
//! - Throughput of a burst of `async_exec` tasks on a serial queue
//! - Semaphore signal/wait pair without contention

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gvdispatch_runtime::{default_queue, Queue, QueueKind, Semaphore, Timeout};

fn bench_sync_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue/sync");

    let serial = Queue::new("bench.serial", QueueKind::Serial);
    group.bench_function("serial", |b| b.iter(|| black_box(serial.sync(|| 1u64))));

    let concurrent = default_queue();
    group.bench_function("concurrent", |b| {
        b.iter(|| black_box(concurrent.sync(|| 1u64)))
    });

    group.finish();
}

fn bench_serial_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue/serial_burst");

    for &tasks in &[100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            let queue = Queue::new("bench.burst", QueueKind::Serial);
            let counter = Arc::new(AtomicUsize::new(0));
            b.iter(|| {
                for _ in 0..tasks {
                    let counter = Arc::clone(&counter);
                    queue.async_exec(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                queue.sync(|| ());
            });
        });
    }

    group.finish();
}

fn bench_semaphore(c: &mut Criterion) {
    let sem = Semaphore::new(0);
    c.bench_function("semaphore/signal_wait", |b| {
        b.iter(|| {
            sem.signal();
            black_box(sem.wait(Timeout::Forever));
        })
    });
}

criterion_group!(benches, bench_sync_round_trip, bench_serial_burst, bench_semaphore);
criterion_main!(benches);
