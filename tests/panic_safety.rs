use jobfiber::{Counter, JobPriority, Scheduler, SchedulerConfig, yield_now};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn single_worker() -> Scheduler {
    Scheduler::with_config(SchedulerConfig {
        worker_count: 1,
        stack_size: 64 * 1024,
        max_stacks: 8,
        ..SchedulerConfig::default()
    })
    .unwrap()
}

#[test]
fn test_panic_safety_counter_decrement() {
    let scheduler = single_worker();
    let counter = Counter::new(0);

    scheduler
        .submit_tracked(JobPriority::Normal, &counter, || {
            panic!("Intentional panic for testing");
        })
        .unwrap();

    assert!(
        counter.wait_timeout(Duration::from_secs(5)),
        "Counter should be zero even after panic"
    );
    scheduler.wait_idle().unwrap();
    assert_eq!(scheduler.failed_jobs(), 1);
}

#[test]
fn test_worker_recovery_after_panic() {
    let scheduler = single_worker();

    // A panic after a yield unwinds a resumed stack.
    scheduler
        .submit(JobPriority::Normal, || {
            yield_now();
            panic!("Boom");
        })
        .unwrap();
    scheduler.wait_idle().unwrap();
    assert_eq!(scheduler.failed_jobs(), 1);

    let success = Arc::new(AtomicBool::new(false));
    let success_clone = success.clone();
    let counter = Counter::new(0);
    scheduler
        .submit_tracked(JobPriority::Normal, &counter, move || {
            success_clone.store(true, Ordering::SeqCst);
        })
        .unwrap();

    assert!(
        counter.wait_timeout(Duration::from_secs(5)),
        "Worker did not process subsequent job!"
    );
    assert!(success.load(Ordering::SeqCst), "Subsequent job failed to run");
    assert_eq!(scheduler.arena().in_use_blocks(), 0);
    scheduler.shutdown().unwrap();
}
