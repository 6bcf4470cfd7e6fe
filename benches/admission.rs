//! Admission benchmarks for appexec.
//!
//! These benchmarks measure the hot paths of the executors:
//! - Bounded executor submit + drain with a backend pool
//! - Sequential executor throughput (single slot, same-thread drain)
//! - Delay queue offer/remove
//! - Keyed lock acquire/release
//!
//! Performance targets:
//! - Bounded submit (queued path): < 200ns per task
//! - Keyed lock uncontended: < 100ns

#![allow(missing_docs)]
#![allow(clippy::semicolon_if_nothing_returned)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use appexec::runtime::{
    BackendPool, BoundedTaskExecutor, DelayQueue, ExecutorExt, ExecutorService, SchedulingOptions,
    SchedulingWrapper,
};
use appexec::KeyedLockSet;

// =============================================================================
// BOUNDED EXECUTOR
// =============================================================================

fn bench_bounded_submit(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounded/submit_and_drain");
    let pool = BackendPool::with_threads(0, 16).expect("pool");

    for max in [1_usize, 4, 16] {
        let exec = BoundedTaskExecutor::new(format!("bench-{max}"), pool.handle(), max).expect("executor");
        let counter = Arc::new(AtomicUsize::new(0));
        group.throughput(Throughput::Elements(1_000));
        group.bench_with_input(BenchmarkId::from_parameter(max), &max, |b, _| {
            b.iter(|| {
                for _ in 0..1_000 {
                    let counter = Arc::clone(&counter);
                    exec.execute_fn(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    })
                    .expect("execute");
                }
                exec.wait_all_tasks_executed(Duration::from_secs(30))
                    .expect("drain");
            })
        });
    }
    group.finish();
    pool.shutdown_and_wait(Duration::from_secs(5));
}

fn bench_submit_with_handle(c: &mut Criterion) {
    let pool = BackendPool::with_threads(0, 4).expect("pool");
    let exec = BoundedTaskExecutor::new("bench-handles", pool.handle(), 4).expect("executor");
    c.bench_function("bounded/submit_join", |b| {
        b.iter(|| {
            let handle = exec.submit(|| black_box(21) * 2).expect("submit");
            black_box(handle.join().expect("join"))
        })
    });
    exec.shutdown().expect("shutdown");
    pool.shutdown_and_wait(Duration::from_secs(5));
}

// =============================================================================
// DELAY QUEUE
// =============================================================================

fn bench_schedule_cancel(c: &mut Criterion) {
    let queue = DelayQueue::start("bench-dispatch").expect("queue");
    let pool = BackendPool::with_threads(0, 2).expect("pool");
    let scheduler = SchedulingWrapper::new("bench-scheduler", pool.handle(), &queue, SchedulingOptions::default())
        .expect("scheduler");

    c.bench_function("delay_queue/schedule_cancel", |b| {
        b.iter(|| {
            let handle = scheduler
                .schedule(|| (), Duration::from_secs(3600))
                .expect("schedule");
            black_box(handle.cancel())
        })
    });

    scheduler.shutdown().expect("shutdown");
    queue.shutdown(Duration::from_secs(5));
    pool.shutdown_and_wait(Duration::from_secs(5));
}

// =============================================================================
// KEYED LOCKS
// =============================================================================

fn bench_keyed_lock(c: &mut Criterion) {
    let locks = KeyedLockSet::new();
    c.bench_function("keyed_lock/uncontended", |b| {
        let mut key = 0_u64;
        b.iter(|| {
            key = key.wrapping_add(1) % 64;
            let guard = locks.lock(black_box(key));
            black_box(guard.key());
        })
    });
}

criterion_group!(
    benches,
    bench_bounded_submit,
    bench_submit_with_handle,
    bench_schedule_cancel,
    bench_keyed_lock
);
criterion_main!(benches);
