use jobfiber::{
    Counter, JobPriority, Scheduler, SchedulerConfig, SchedulerHandle, current_thread_id, init_tracing,
    switch_to_main, yield_now,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

fn main() -> jobfiber::Result<()> {
    init_tracing();
    println!("jobfiber - Cooperative Fiber Job Scheduler\n");

    // An optional JSON config file as the first argument.
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .map_err(|e| jobfiber::SchedulerError::InvalidConfig(format!("{path}: {e}")))?;
            SchedulerConfig::from_json(&json)?
        }
        None => SchedulerConfig::with_workers(4),
    };
    let scheduler = Scheduler::with_config(config)?;
    println!("Initialized scheduler with {} worker threads\n", scheduler.num_workers());

    // Example 1: Simple job execution
    println!("Example 1: Simple job execution");
    scheduler.submit(JobPriority::Normal, || {
        println!("  Hello from a fiber job!");
    })?;
    scheduler.wait_idle()?;
    println!("  Job completed\n");

    // Example 2: Yielding and priorities
    println!("Example 2: Yielding jobs");
    for (priority, name) in [(JobPriority::Low, "low"), (JobPriority::Critical, "critical")] {
        scheduler.submit(priority, move || {
            for step in 0..3 {
                println!("  {name} job, step {step}");
                yield_now();
            }
        })?;
    }
    scheduler.wait_idle()?;
    println!();

    // Example 3: Parallel computation with nested jobs
    println!("Example 3: Parallel computation");
    let sum = Arc::new(AtomicUsize::new(0));
    let num_jobs = 100;
    let start = Instant::now();

    let sum_clone = sum.clone();
    scheduler.submit(JobPriority::High, move || {
        let Some(handle) = SchedulerHandle::current() else {
            return;
        };
        let children = Counter::new(0);
        for i in 0..num_jobs {
            let sum = sum_clone.clone();
            let submitted = handle.submit_tracked(JobPriority::High, &children, move || {
                let mut _local_sum = 0;
                for j in 0..1000 {
                    _local_sum += j;
                }
                sum.fetch_add(i, Ordering::SeqCst);
            });
            if let Err(e) = submitted {
                eprintln!("  could not submit job {i}: {e}");
            }
        }
        children.wait();
    })?;
    scheduler.run()?;

    let expected_sum: usize = (0..num_jobs).sum();
    println!("  Executed {} jobs in {:?}", num_jobs, start.elapsed());
    println!("  Sum result: {} (expected: {})\n", sum.load(Ordering::SeqCst), expected_sum);

    // Example 4: Hopping onto the main thread
    println!("Example 4: Main-thread continuation");
    scheduler.submit(JobPriority::Normal, || {
        println!("  loading on worker {:?}", current_thread_id());
        switch_to_main();
        println!("  applying on the main thread (worker {:?})", current_thread_id());
    })?;
    scheduler.run()?;
    println!();

    // Example 5: High-throughput test
    println!("Example 5: High-throughput benchmark");
    let num_jobs = 10_000;
    let start = Instant::now();
    let mut submitted = 0;
    while submitted < num_jobs {
        let batch = (num_jobs - submitted).min(scheduler.config().max_stacks);
        let jobs: Vec<Box<dyn FnOnce() + Send>> = (0..batch)
            .map(|_| {
                Box::new(|| {
                    let mut _x = 0;
                    for i in 0..10 {
                        _x += i;
                    }
                }) as Box<dyn FnOnce() + Send>
            })
            .collect();
        scheduler.submit_batch(JobPriority::Normal, jobs)?;
        scheduler.wait_idle()?;
        submitted += batch;
    }

    let duration = start.elapsed();
    let jobs_per_second = num_jobs as f64 / duration.as_secs_f64();
    println!("  Executed {} jobs in {:?}", num_jobs, duration);
    println!("  Throughput: {:.2} jobs/second\n", jobs_per_second);

    match serde_json::to_string_pretty(&scheduler.stats()) {
        Ok(stats) => println!("Stats:\n{stats}\n"),
        Err(e) => eprintln!("could not serialize stats: {e}"),
    }

    // Shutdown the scheduler
    println!("Shutting down scheduler...");
    match scheduler.shutdown() {
        Ok(_) => println!("Done!"),
        Err(e) => eprintln!("Shutdown error: {}", e),
    }
    Ok(())
}
