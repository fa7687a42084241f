use jobfiber::{JobPriority, PinningStrategy, Scheduler, SchedulerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn with_strategy(workers: usize, pinning: PinningStrategy) -> Scheduler {
    Scheduler::with_config(SchedulerConfig {
        worker_count: workers,
        stack_size: 64 * 1024,
        max_stacks: 128,
        pinning,
        ..SchedulerConfig::default()
    })
    .unwrap()
}

#[test]
fn test_none_strategy() {
    let scheduler = with_strategy(4, PinningStrategy::None);
    assert_eq!(scheduler.num_workers(), 4);
    scheduler.shutdown().unwrap();
}

#[test]
fn test_linear_strategy() {
    let scheduler = with_strategy(2, PinningStrategy::Linear);
    assert_eq!(scheduler.num_workers(), 2);
    scheduler.shutdown().unwrap();
}

#[test]
fn test_avoid_smt_strategy_runs_jobs() {
    // More workers than cores wraps around instead of failing.
    let scheduler = with_strategy(10, PinningStrategy::AvoidSMT);
    assert_eq!(scheduler.num_workers(), 10);

    let executed = Arc::new(AtomicUsize::new(0));
    let jobs: Vec<Box<dyn FnOnce() + Send>> = (0..100)
        .map(|_| {
            let executed = executed.clone();
            Box::new(move || {
                executed.fetch_add(1, Ordering::SeqCst);
            }) as Box<dyn FnOnce() + Send>
        })
        .collect();

    let counter = scheduler.submit_batch(JobPriority::Normal, jobs).unwrap();
    counter.wait();
    assert_eq!(executed.load(Ordering::SeqCst), 100);
    scheduler.shutdown().unwrap();
}

#[test]
fn test_zero_workers_means_one_per_core() {
    let scheduler = Scheduler::new(0).unwrap();
    assert_eq!(scheduler.num_workers(), num_cpus::get().max(1));
    scheduler.shutdown().unwrap();
}
