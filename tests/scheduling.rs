//! Delayed and fixed-delay scheduling through the shared delay queue.
//!
//! This test suite covers:
//! - FIFO dispatch for identical deadlines across wrappers
//! - Fixed-delay spacing between completion and next start
//! - Cancellation before dispatch
//! - Fixed-rate rejection
//! - Bounded scheduled executors
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test scheduling -- --nocapture
//! ```

mod common;

use appexec::runtime::{
    AppConfig, AppExecutors, BackendPool, DelayQueue, ExecutorService, SchedulingOptions,
    SchedulingWrapper, TaskState,
};
use appexec::ErrorKind;
use common::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn app(prefix: &str) -> AppExecutors {
    let mut config = AppConfig::default();
    config.pool = config
        .pool
        .with_threads(0, 16)
        .with_thread_name_prefix(format!("{prefix}-pool"));
    config.dispatch_thread_name = format!("{prefix}-dispatch");
    AppExecutors::new(config).expect("app")
}

#[test]
fn identical_delays_dispatch_in_submission_order() {
    init_test_logging();
    test_phase("identical_delays_dispatch_in_submission_order");
    let app = app("fifo");
    let sequential = app.bounded_scheduled_executor("fifo-seq", 1).expect("scheduler");
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let order = Arc::clone(&order);
            sequential
                .schedule(move || order.lock().push(i), Duration::from_millis(20))
                .expect("schedule")
        })
        .collect();
    for handle in handles {
        handle.join().expect("task");
    }

    // Deadlines are taken from a monotonic clock, so equal-or-later deadlines
    // plus the creation sequence keep submission order.
    assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
    sequential.shutdown().expect("shutdown");
    assert!(sequential.await_termination(Duration::from_secs(5)).expect("await"));
    assert!(app.shutdown(Duration::from_secs(5)));
    test_complete("identical_delays_dispatch_in_submission_order");
}

#[test]
fn fixed_delay_spacing_is_measured_from_completion() {
    init_test_logging();
    test_phase("fixed_delay_spacing_is_measured_from_completion");
    let app = app("spacing");
    let starts = Arc::new(Mutex::new(Vec::<(Instant, Instant)>::new()));
    let recorder = Arc::clone(&starts);

    let handle = app
        .scheduler()
        .schedule_with_fixed_delay(
            move || {
                let start = Instant::now();
                thread::sleep(Duration::from_millis(20));
                recorder.lock().push((start, Instant::now()));
            },
            Duration::ZERO,
            Duration::from_millis(30),
        )
        .expect("schedule");

    assert!(wait_until(Duration::from_secs(5), || starts.lock().len() >= 4));
    handle.cancel();
    assert!(handle.wait_timeout(Duration::from_secs(5)));

    let runs = starts.lock().clone();
    for pair in runs.windows(2) {
        let (_, previous_end) = pair[0];
        let (next_start, _) = pair[1];
        let gap = next_start.duration_since(previous_end);
        assert!(gap >= Duration::from_millis(29), "gap too short: {gap:?}");
    }
    assert!(app.shutdown(Duration::from_secs(5)));
    test_complete("fixed_delay_spacing_is_measured_from_completion");
}

#[test]
fn periodic_task_cancelled_after_window_runs_a_few_times() {
    init_test_logging();
    test_phase("periodic_task_cancelled_after_window_runs_a_few_times");
    let app = app("window");
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    // Each run takes 150ms and the next starts 100ms after it completes.
    let handle = app
        .scheduler()
        .schedule_with_fixed_delay(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(150));
            },
            Duration::from_millis(100),
            Duration::from_millis(100),
        )
        .expect("schedule");
    thread::sleep(Duration::from_millis(500));
    handle.cancel();
    assert!(handle.wait_timeout(Duration::from_secs(5)));

    let count = runs.load(Ordering::SeqCst);
    assert!((2..=3).contains(&count), "unexpected run count {count}");
    thread::sleep(Duration::from_millis(400));
    assert_eq!(runs.load(Ordering::SeqCst), count);
    assert_eq!(handle.state(), TaskState::Cancelled);
    assert!(app.shutdown(Duration::from_secs(5)));
    test_complete("periodic_task_cancelled_after_window_runs_a_few_times");
}

#[test]
fn cancel_before_dispatch_never_runs() {
    init_test_logging();
    test_phase("cancel_before_dispatch_never_runs");
    let app = app("cancel-early");
    let ran = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&ran);

    let handle = app
        .scheduler()
        .schedule(
            move || {
                flag.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_millis(50),
        )
        .expect("schedule");
    assert!(handle.remaining_delay() > Duration::ZERO);
    assert!(handle.cancel());
    assert!(app.delay_queue().is_empty());

    thread::sleep(Duration::from_millis(100));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert!(handle.is_cancelled());
    assert!(handle.join().expect_err("cancelled").is_cancelled());
    assert!(app.shutdown(Duration::from_secs(5)));
    test_complete("cancel_before_dispatch_never_runs");
}

#[test]
fn fixed_rate_is_rejected() {
    init_test_logging();
    test_phase("fixed_rate_is_rejected");
    let app = app("fixed-rate");
    let err = app
        .scheduler()
        .schedule_at_fixed_rate(|| {}, Duration::ZERO, Duration::from_millis(10))
        .expect_err("fixed rate");
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert!(app.delay_queue().is_empty());
    assert!(app.shutdown(Duration::from_secs(5)));
    test_complete("fixed_rate_is_rejected");
}

#[test]
fn bounded_scheduler_respects_its_limit() {
    init_test_logging();
    test_phase("bounded_scheduler_respects_its_limit");
    let app = app("bounded-sched");
    let scheduler = app.bounded_scheduled_executor("limited", 2).expect("scheduler");
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            scheduler
                .schedule(
                    move || {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(10));
                        current.fetch_sub(1, Ordering::SeqCst);
                    },
                    Duration::from_millis(5),
                )
                .expect("schedule")
        })
        .collect();
    for handle in handles {
        handle.join().expect("task");
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    scheduler.shutdown().expect("shutdown");
    assert!(scheduler.await_termination(Duration::from_secs(5)).expect("await"));
    assert!(app.shutdown(Duration::from_secs(5)));
    test_complete("bounded_scheduler_respects_its_limit");
}

#[test]
fn wrappers_on_one_queue_interleave_by_deadline() {
    init_test_logging();
    test_phase("wrappers_on_one_queue_interleave_by_deadline");
    let queue = DelayQueue::start("interleave-dispatch").expect("queue");
    let order = Arc::new(Mutex::new(Vec::new()));
    let first = SchedulingWrapper::new(
        "first",
        BackendPool::with_threads(1, 1).expect("pool"),
        &queue,
        SchedulingOptions::owning(),
    )
    .expect("first");
    let second = SchedulingWrapper::new(
        "second",
        BackendPool::with_threads(1, 1).expect("pool"),
        &queue,
        SchedulingOptions::owning(),
    )
    .expect("second");

    let record = |tag: &'static str| {
        let order = Arc::clone(&order);
        move || order.lock().push(tag)
    };
    let a = first.schedule(record("first-late"), Duration::from_millis(60)).expect("a");
    let b = second.schedule(record("second-early"), Duration::from_millis(20)).expect("b");
    let c = first.schedule(record("first-early"), Duration::from_millis(40)).expect("c");
    assert!(queue.dump_string().contains("3 pending"));

    for handle in [a, b, c] {
        handle.join().expect("task");
    }
    assert_eq!(*order.lock(), vec!["second-early", "first-early", "first-late"]);

    first.shutdown().expect("shutdown");
    second.shutdown().expect("shutdown");
    assert!(first.await_termination(Duration::from_secs(5)).expect("await"));
    assert!(second.await_termination(Duration::from_secs(5)).expect("await"));
    assert!(queue.shutdown(Duration::from_secs(5)));
    test_complete("wrappers_on_one_queue_interleave_by_deadline");
}
