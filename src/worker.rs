//! Worker thread implementation.
//!
//! Each worker binds its thread to the scheduler, then loops: take the
//! highest-priority ready background job, run it until it yields, parks or
//! finishes, repeat. Idle workers sleep on the scheduler's condition
//! variable with a bounded timeout, so shutdown and expired timed waits are
//! noticed promptly.

use crate::PinningStrategy;
use crate::context;
use crate::error::{Result, SchedulerError};
use crate::scheduler::Shared;
use core_affinity::CoreId;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A worker's thread body, handed to the spawn function.
pub(crate) type WorkerBody = Box<dyn FnOnce() + Send + 'static>;

/// A running worker thread.
pub(crate) struct WorkerThread {
    index: usize,
    handle: JoinHandle<()>,
}

/// Starts every worker of `shared`.
///
/// On failure the workers already started are told to stop and joined
/// before the error is returned.
pub(crate) fn spawn_workers(shared: &Arc<Shared>) -> Result<Vec<WorkerThread>> {
    spawn_workers_with(shared, |builder, body| builder.spawn(body))
}

/// [`spawn_workers`] with the thread creation supplied by the caller.
pub(crate) fn spawn_workers_with<S>(shared: &Arc<Shared>, mut spawn: S) -> Result<Vec<WorkerThread>>
where
    S: FnMut(thread::Builder, WorkerBody) -> io::Result<JoinHandle<()>>,
{
    let config = &shared.config;
    let count = config.resolved_worker_count();
    let core_ids = match config.pinning {
        PinningStrategy::None => Vec::new(),
        _ => core_affinity::get_core_ids().unwrap_or_default(),
    };

    let mut workers = Vec::with_capacity(count);
    for index in 0..count {
        let core = pick_core(config.pinning, &core_ids, index);
        let worker_shared = Arc::clone(shared);
        let builder = thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, index));
        let spawned = spawn(builder, Box::new(move || run_worker(index, core, worker_shared)));

        match spawned {
            Ok(handle) => workers.push(WorkerThread { index, handle }),
            Err(source) => {
                tracing::error!(worker = index, error = %source, "failed to spawn worker; rolling back");
                shared.begin_shutdown();
                join_all(workers);
                return Err(SchedulerError::WorkerSpawn { index, source });
            }
        }
    }
    Ok(workers)
}

/// Core for worker `index`, or `None` to leave it to the OS.
fn pick_core(strategy: PinningStrategy, core_ids: &[CoreId], index: usize) -> Option<CoreId> {
    if core_ids.is_empty() {
        return None;
    }
    match strategy {
        PinningStrategy::None => None,
        PinningStrategy::Linear => Some(core_ids[index % core_ids.len()]),
        // Even logical ids are the first hardware thread of each core on
        // common SMT layouts.
        PinningStrategy::AvoidSMT => {
            let physical = core_ids.len().div_ceil(2);
            Some(core_ids[(index % physical) * 2])
        }
    }
}

fn run_worker(index: usize, core: Option<CoreId>, shared: Arc<Shared>) {
    if let Some(core) = core {
        if !core_affinity::set_for_current(core) {
            tracing::debug!(worker = index, core = core.id, "could not pin worker");
        }
    }

    let _context = context::enter(Some(index), Arc::clone(&shared));
    let span = tracing::debug_span!("worker", index);
    let _span = span.enter();
    tracing::debug!("worker started");

    while let Some(job) = shared.next_job() {
        shared.execute(job);
    }

    tracing::debug!("worker stopped");
}

/// Joins every worker and returns how many of them panicked.
pub(crate) fn join_all(workers: Vec<WorkerThread>) -> usize {
    let mut panicked = 0;
    for worker in workers {
        if worker.handle.join().is_err() {
            tracing::error!(worker = worker.index, "worker panicked during execution");
            panicked += 1;
        }
    }
    panicked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchedulerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ids(n: usize) -> Vec<CoreId> {
        (0..n).map(|id| CoreId { id }).collect()
    }

    #[test]
    fn test_linear_pinning_wraps_around() {
        let cores = ids(4);
        let picked: Vec<_> = (0..6)
            .map(|i| pick_core(PinningStrategy::Linear, &cores, i).unwrap().id)
            .collect();
        assert_eq!(picked, vec![0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn test_avoid_smt_uses_even_logical_ids() {
        let cores = ids(8);
        let picked: Vec<_> = (0..5)
            .map(|i| pick_core(PinningStrategy::AvoidSMT, &cores, i).unwrap().id)
            .collect();
        assert_eq!(picked, vec![0, 2, 4, 6, 0]);

        let odd = ids(3);
        assert_eq!(pick_core(PinningStrategy::AvoidSMT, &odd, 1).unwrap().id, 2);
    }

    #[test]
    fn test_no_pinning_without_cores_or_strategy() {
        assert!(pick_core(PinningStrategy::Linear, &[], 0).is_none());
        assert!(pick_core(PinningStrategy::None, &ids(4), 0).is_none());
    }

    #[test]
    fn test_workers_are_named_after_prefix() {
        let config = SchedulerConfig {
            worker_count: 2,
            stack_size: 64 * 1024,
            max_stacks: 8,
            thread_name_prefix: "fiber".into(),
            ..Default::default()
        };
        let scheduler = crate::Scheduler::with_config(config).unwrap();
        let name = Arc::new(parking_lot::Mutex::new(None));
        let name_clone = name.clone();
        scheduler
            .submit(crate::JobPriority::Normal, move || {
                *name_clone.lock() = std::thread::current().name().map(str::to_owned);
            })
            .unwrap();
        scheduler.wait_idle().unwrap();

        let name = name.lock().clone().unwrap();
        assert!(name == "fiber-0" || name == "fiber-1", "unexpected worker name {name}");
    }

    #[test]
    fn test_failed_spawn_stops_and_joins_started_workers() {
        let shared = Shared::new(SchedulerConfig {
            worker_count: 4,
            stack_size: 64 * 1024,
            max_stacks: 8,
            ..Default::default()
        })
        .unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let result = spawn_workers_with(&shared, |builder, body| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 2 {
                return Err(io::Error::other("thread limit reached"));
            }
            let finished = finished.clone();
            builder.spawn(move || {
                body();
                finished.fetch_add(1, Ordering::SeqCst);
            })
        });

        assert!(matches!(result, Err(SchedulerError::WorkerSpawn { index: 2, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(shared.is_shutting_down());
        // Both started workers ran to the end of their loop before the error
        // came back, and none of them still holds the scheduler.
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
