use jobfiber::{JobPriority, Scheduler, SchedulerConfig, SchedulerError, yield_now};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        worker_count: workers,
        stack_size: 64 * 1024,
        max_stacks: 32,
        ..SchedulerConfig::default()
    }
}

#[test]
fn test_shutdown_during_job_execution() {
    let scheduler = Scheduler::with_config(config(2)).unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let done = done.clone();
        scheduler
            .submit(JobPriority::Normal, move || {
                std::thread::sleep(Duration::from_millis(10));
                yield_now();
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    // Shutdown waits for every submitted job.
    let result = scheduler.shutdown();
    assert!(result.is_ok(), "Shutdown should succeed after jobs complete");
    assert_eq!(done.load(Ordering::SeqCst), 10);
}

#[test]
fn test_shutdown_with_no_jobs() {
    let scheduler = Scheduler::with_config(config(3)).unwrap();
    scheduler.wait_idle().unwrap();
    scheduler.wait_idle().unwrap();
    scheduler.shutdown().unwrap();
}

#[test]
fn test_drop_without_shutdown_joins_workers() {
    let scheduler = Scheduler::with_config(config(4)).unwrap();
    let handle = scheduler.handle();
    drop(scheduler);

    assert!(handle.is_shutting_down());
    assert!(matches!(
        handle.submit(JobPriority::High, || {}),
        Err(SchedulerError::ShuttingDown)
    ));
}

#[test]
fn test_stats_after_shutdown_balance() {
    let scheduler = Scheduler::with_config(config(2)).unwrap();
    let handle = scheduler.handle();
    for _ in 0..25 {
        scheduler.submit(JobPriority::Low, || {}).unwrap();
    }
    scheduler.shutdown().unwrap();

    let stats = handle.stats();
    assert_eq!(stats.submitted, 25);
    assert_eq!(stats.completed, 25);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.stacks_free, stats.stacks_allocated);
}
