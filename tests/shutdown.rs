//! Lifecycle of executors, schedulers, and the process-wide set.
//!
//! This test suite covers:
//! - Rejection after shutdown
//! - `shutdown_now` returning cancelled work
//! - Termination ordering: scheduler, delay queue, pool
//! - Managed pieces refusing caller shutdown
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test shutdown -- --nocapture
//! ```

mod common;

use appexec::runtime::{
    AppConfig, AppExecutors, BackendPool, BoundedTaskExecutor, DelayQueue, ExecutorExt,
    ExecutorService, SchedulingOptions, SchedulingWrapper, TaskState, WrapperState,
};
use appexec::{CountDownLatch, ErrorKind};
use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn shutdown_now_cancels_queued_tasks_only() {
    init_test_logging();
    test_phase("shutdown_now_cancels_queued_tasks_only");
    let pool = BackendPool::with_threads(0, 4).expect("pool");
    let exec = BoundedTaskExecutor::new("shutdown-now", pool.handle(), 1).expect("executor");
    let gate = Arc::new(CountDownLatch::new(1));
    let entered = Arc::new(CountDownLatch::new(1));

    let running = {
        let gate = Arc::clone(&gate);
        let entered = Arc::clone(&entered);
        exec.submit(move || {
            entered.count_down();
            gate.wait();
            "finished"
        })
        .expect("submit")
    };
    assert!(entered.wait_timeout(Duration::from_secs(5)));
    let queued: Vec<_> = (0..4).map(|i| exec.submit(move || i).expect("submit")).collect();

    let returned = exec.shutdown_now().expect("shutdown_now");
    assert_eq!(returned.len(), 4);
    assert!(returned.iter().all(|task| task.is_cancelled()));
    for handle in &queued {
        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    gate.count_down();
    assert_eq!(running.join(), Ok("finished"));
    assert!(exec.await_termination(Duration::from_secs(5)).expect("await"));
    assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    test_complete("shutdown_now_cancels_queued_tasks_only");
}

#[test]
fn await_termination_before_shutdown_is_an_error() {
    init_test_logging();
    test_phase("await_termination_before_shutdown_is_an_error");
    let pool = BackendPool::with_threads(0, 2).expect("pool");
    let exec = BoundedTaskExecutor::new("not-shut", pool.handle(), 2).expect("executor");
    let err = exec
        .await_termination(Duration::from_millis(10))
        .expect_err("not shut down");
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    test_complete("await_termination_before_shutdown_is_an_error");
}

#[test]
fn scheduler_terminates_after_sentinel_and_backend() {
    init_test_logging();
    test_phase("scheduler_terminates_after_sentinel_and_backend");
    let queue = DelayQueue::start("sentinel-dispatch").expect("queue");
    let pool = BackendPool::with_threads(0, 2).expect("pool");
    let bounded = BoundedTaskExecutor::new("sentinel-bounded", pool.handle(), 1).expect("bounded");
    let scheduler = SchedulingWrapper::new("sentinel", bounded, &queue, SchedulingOptions::owning())
        .expect("scheduler");

    let ran = Arc::new(AtomicUsize::new(0));
    let soon = {
        let ran = Arc::clone(&ran);
        scheduler
            .schedule(
                move || {
                    thread::sleep(Duration::from_millis(20));
                    ran.fetch_add(1, Ordering::SeqCst);
                },
                Duration::ZERO,
            )
            .expect("schedule")
    };
    assert!(wait_until(Duration::from_secs(5), || soon.state() != TaskState::Pending));
    let far = scheduler.schedule(|| (), Duration::from_secs(3600)).expect("schedule");

    scheduler.shutdown().expect("shutdown");
    assert_ne!(scheduler.state(), WrapperState::Running);
    assert_eq!(far.state(), TaskState::Cancelled);
    assert!(scheduler.await_termination(Duration::from_secs(5)).expect("await"));
    assert_eq!(scheduler.state(), WrapperState::Terminated);
    // The already dispatched task still ran to completion.
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(scheduler.backend().is_terminated());

    assert!(queue.shutdown(Duration::from_secs(5)));
    assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    test_complete("scheduler_terminates_after_sentinel_and_backend");
}

#[test]
fn app_shutdown_stops_everything() {
    init_test_logging();
    test_phase("app_shutdown_stops_everything");
    let mut config = AppConfig::default();
    config.pool = config
        .pool
        .with_threads(0, 4)
        .with_thread_name_prefix("teardown-pool");
    config.dispatch_thread_name = "teardown-dispatch".to_string();
    let app = AppExecutors::new(config).expect("app");

    assert_eq!(
        app.pool().shutdown().expect_err("managed pool").kind(),
        ErrorKind::ManagedPool
    );
    let pending = app
        .scheduler()
        .schedule(|| (), Duration::from_secs(600))
        .expect("schedule");
    let exec = app.bounded_executor("teardown-exec", 2).expect("executor");
    assert_eq!(exec.submit(|| 1).expect("submit").join(), Ok(1));

    assert!(app.shutdown(Duration::from_secs(5)));
    assert!(app.is_shutdown());
    assert_eq!(pending.state(), TaskState::Cancelled);
    assert!(!app.delay_queue().is_running());
    assert!(app.pool().is_terminated());
    assert!(exec.submit(|| 2).is_err());
    assert!(app.scheduler().schedule(|| (), Duration::ZERO).expect_err("stopped").is_rejected());
    test_complete("app_shutdown_stops_everything");
}
