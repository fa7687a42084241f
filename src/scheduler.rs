//! High-level scheduler interface.
//!
//! The [`Scheduler`] owns the stack arena, the ready queues and the worker
//! pool. Jobs are submitted with a priority and a [`Workgroup`]. Background
//! jobs are picked up by the first idle worker (highest level first, FIFO
//! within a level); main jobs wait for the thread driving [`Scheduler::run`]
//! or [`Scheduler::tick`]. A job runs until it yields, parks on a
//! [`Counter`] or finishes. Yielded jobs go back to the tail of their level.

use crate::allocator::StackArena;
use crate::config::SchedulerConfig;
use crate::context;
use crate::counter::{CompletionGuard, Counter};
use crate::error::{Result, SchedulerError};
use crate::job::{Job, JobId, JobPriority, JobState, Workgroup};
use crate::metrics::{Metrics, SchedulerStats};
use crate::queue::ReadyQueues;
use crate::worker::{self, WorkerThread};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// A parked job that gives up waiting at `deadline`.
struct TimedWait {
    deadline: Instant,
    counter: Counter,
    job: JobId,
}

/// State shared by the scheduler, its workers and every handle.
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    arena: Arc<StackArena>,
    queues: Mutex<ReadyQueues>,
    /// Signalled when a background job is queued.
    work_available: Condvar,
    /// Signalled when a main job is queued or the last active job retires.
    main_available: Condvar,
    /// Signalled when the last active job retires.
    idle: Condvar,
    timed_waits: Mutex<Vec<TimedWait>>,
    shutdown: AtomicBool,
    metrics: Metrics,
    workers: usize,
}

impl Shared {
    pub(crate) fn new(config: SchedulerConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let arena = Arc::new(StackArena::new(config.stack_size, config.max_stacks)?);
        let workers = config.resolved_worker_count();
        Ok(Arc::new(Shared {
            config,
            arena,
            queues: Mutex::new(ReadyQueues::default()),
            work_available: Condvar::new(),
            main_available: Condvar::new(),
            idle: Condvar::new(),
            timed_waits: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            metrics: Metrics::default(),
            workers,
        }))
    }

    fn submit(
        &self,
        workgroup: Workgroup,
        priority: JobPriority,
        work: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<JobId> {
        if self.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }

        let job = Job::from_boxed(&self.arena, priority, work).inspect_err(|e| {
            tracing::warn!(?priority, error = %e, "job rejected");
        })?;
        job.set_workgroup(workgroup);
        let id = job.id();

        {
            let mut queues = self.queues.lock();
            // Re-checked under the lock so nothing is queued after the drain.
            if self.is_shutting_down() {
                return Err(SchedulerError::ShuttingDown);
            }
            self.metrics.record_submitted();
            queues.push(job);
        }
        self.notify_work(workgroup);

        tracing::trace!(job = %id, ?priority, ?workgroup, "job submitted");
        Ok(id)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _queues = self.queues.lock();
        self.work_available.notify_all();
        self.main_available.notify_all();
        self.idle.notify_all();
    }

    fn notify_work(&self, workgroup: Workgroup) {
        match workgroup {
            Workgroup::Background => self.work_available.notify_one(),
            Workgroup::Main => self.main_available.notify_one(),
        };
    }

    /// Puts a job that is still alive back on its workgroup's queue.
    pub(crate) fn requeue(&self, job: Box<Job>) {
        let workgroup = job.workgroup();
        self.queues.lock().push(job);
        self.notify_work(workgroup);
    }

    /// Blocks until a background job is ready. Returns `None` once shutdown
    /// began.
    pub(crate) fn next_job(&self) -> Option<Box<Job>> {
        let timeout = self.config.idle_timeout();
        loop {
            self.expire_timed_waits();
            let mut queues = self.queues.lock();
            if self.is_shutting_down() {
                return None;
            }
            if let Some(job) = queues.pop(Workgroup::Background) {
                return Some(job);
            }
            self.work_available.wait_for(&mut queues, timeout);
        }
    }

    /// Runs `job` on the calling thread until it yields, parks or finishes,
    /// then re-queues, parks or retires it.
    pub(crate) fn execute(self: &Arc<Self>, job: Box<Job>) {
        job.resume();

        match job.state() {
            JobState::Suspended => self.requeue(job),
            JobState::Waiting => self.park(job),
            JobState::Finished => {
                let failed = job.panicked();
                tracing::trace!(job = %job.id(), failed, resumes = job.resume_count(), "job finished");
                drop(job);
                self.retire(failed);
            }
            state => {
                // Its stack may still be live, so it is never freed.
                tracing::error!(job = %job.id(), ?state, "job could not be resumed; leaking it");
                std::mem::forget(job);
                self.retire(true);
            }
        }
    }

    /// Hands a waiting job to the counter it waits on. It stays active but
    /// out of every queue until the counter wakes it.
    fn park(self: &Arc<Self>, job: Box<Job>) {
        let Some(request) = job.take_wait_request() else {
            self.requeue(job);
            return;
        };
        let id = job.id();
        if let Some(job) = request.counter.park(job, Arc::downgrade(self)) {
            // The counter reached zero before the job was parked.
            self.requeue(job);
            return;
        }
        if let Some(deadline) = request.deadline {
            self.timed_waits.lock().push(TimedWait {
                deadline,
                counter: request.counter,
                job: id,
            });
        }
        tracing::trace!(job = %id, "job parked");
    }

    /// Re-queues parked jobs whose deadline passed.
    fn expire_timed_waits(&self) {
        let expired: Vec<TimedWait> = {
            let mut waits = self.timed_waits.lock();
            if waits.is_empty() {
                return;
            }
            let now = Instant::now();
            let (expired, pending): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *waits).into_iter().partition(|w| w.deadline <= now);
            *waits = pending.into_iter().filter(|w| !w.counter.is_complete()).collect();
            expired
        };
        for wait in expired {
            if let Some(job) = wait.counter.unpark(wait.job) {
                tracing::trace!(job = %wait.job, "wait timed out");
                self.requeue(job);
            }
        }
    }

    fn retire(&self, failed: bool) {
        if self.metrics.record_retired(failed) {
            let _queues = self.queues.lock();
            self.idle.notify_all();
            self.main_available.notify_all();
        }
    }

    fn wait_idle(&self) -> Result<()> {
        if context::in_job() {
            return Err(SchedulerError::InsideJob("wait_idle"));
        }
        let mut queues = self.queues.lock();
        while self.metrics.active() > 0 && !self.is_shutting_down() {
            self.idle.wait(&mut queues);
        }
        Ok(())
    }

    fn stats(&self) -> SchedulerStats {
        let queued = self.queues.lock().len();
        let (stacks_allocated, stacks_free) = self.arena.block_counts();
        SchedulerStats {
            workers: self.workers,
            queued,
            active: self.metrics.active(),
            submitted: self.metrics.submitted.load(Ordering::Relaxed),
            completed: self.metrics.completed.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
            stacks_allocated,
            stacks_free,
        }
    }
}

/// The main scheduler managing worker threads and job execution.
///
/// Dropping the scheduler shuts it down promptly: workers finish the job
/// they are running, then exit, and jobs still queued are discarded. Call
/// [`Scheduler::wait_idle`] or [`Scheduler::shutdown`] first to let queued
/// work complete.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<WorkerThread>,
}

impl Scheduler {
    /// Creates a scheduler with `worker_count` workers (0 means one per
    /// logical core) and default settings otherwise.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use jobfiber::{JobPriority, Scheduler};
    ///
    /// let scheduler = Scheduler::new(4).unwrap();
    /// scheduler.submit(JobPriority::Normal, || println!("Hello from a job!")).unwrap();
    /// scheduler.wait_idle().unwrap();
    /// ```
    pub fn new(worker_count: usize) -> Result<Self> {
        Self::with_config(SchedulerConfig::with_workers(worker_count))
    }

    /// Creates a scheduler from a full configuration.
    ///
    /// If any worker fails to start, the ones already running are stopped
    /// and joined before the error is returned.
    pub fn with_config(config: SchedulerConfig) -> Result<Self> {
        let shared = Shared::new(config)?;
        let workers = worker::spawn_workers(&shared)?;

        tracing::info!(
            workers = workers.len(),
            stack_size = shared.config.stack_size,
            max_stacks = shared.config.max_stacks,
            pinning = ?shared.config.pinning,
            "scheduler started"
        );

        Ok(Scheduler { shared, workers })
    }

    /// Queues `work` as a new background job.
    ///
    /// Fails with [`SchedulerError::ArenaExhausted`] when `max_stacks` jobs
    /// are already alive.
    pub fn submit<F>(&self, priority: JobPriority, work: F) -> Result<JobId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_on(Workgroup::Background, priority, work)
    }

    /// Queues `work` as a new job of `workgroup`. Main jobs only run inside
    /// [`Scheduler::run`] or [`Scheduler::tick`].
    pub fn submit_on<F>(&self, workgroup: Workgroup, priority: JobPriority, work: F) -> Result<JobId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit(workgroup, priority, Box::new(work))
    }

    /// Like [`Scheduler::submit`], and decrements `counter` when the job ends.
    pub fn submit_tracked<F>(&self, priority: JobPriority, counter: &Counter, work: F) -> Result<JobId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle().submit_tracked(priority, counter, work)
    }

    /// Submits every closure at one priority and returns a counter that
    /// reaches zero once all of them ended.
    pub fn submit_batch<I>(&self, priority: JobPriority, jobs: I) -> Result<Counter>
    where
        I: IntoIterator<Item = Box<dyn FnOnce() + Send + 'static>>,
    {
        self.handle().submit_batch(priority, jobs)
    }

    /// A cloneable handle for submitting from anywhere, including jobs.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Makes the calling thread the main thread and runs main jobs on it
    /// until no job is active. Background jobs keep running on the workers.
    ///
    /// Cannot be called from inside a job.
    pub fn run(&self) -> Result<()> {
        if context::in_job() {
            return Err(SchedulerError::InsideJob("run"));
        }

        let shared = &self.shared;
        let _context = context::enter(None, Arc::clone(shared));
        let timeout = shared.config.idle_timeout();

        loop {
            shared.expire_timed_waits();
            let mut queues = shared.queues.lock();
            if shared.metrics.active() == 0 || shared.is_shutting_down() {
                return Ok(());
            }
            match queues.pop(Workgroup::Main) {
                Some(job) => {
                    drop(queues);
                    shared.execute(job);
                }
                None => {
                    shared.main_available.wait_for(&mut queues, timeout);
                }
            }
        }
    }

    /// Runs each main job queued at the time of the call once, until it
    /// yields, parks or finishes. Returns how many ran. Meant to be called
    /// once per frame from an outer loop.
    ///
    /// Cannot be called from inside a job.
    pub fn tick(&self) -> Result<usize> {
        if context::in_job() {
            return Err(SchedulerError::InsideJob("tick"));
        }

        let shared = &self.shared;
        let _context = context::enter(None, Arc::clone(shared));
        shared.expire_timed_waits();

        let pending = shared.queues.lock().len_of(Workgroup::Main);
        let mut ran = 0;
        while ran < pending {
            let Some(job) = shared.queues.lock().pop(Workgroup::Main) else {
                break;
            };
            shared.execute(job);
            ran += 1;
        }
        Ok(ran)
    }

    /// Blocks until no job is active or shutdown began.
    ///
    /// Cannot be called from inside a job.
    pub fn wait_idle(&self) -> Result<()> {
        self.shared.wait_idle()
    }

    /// Waits for all submitted work, then stops the workers. Queued main jobs
    /// only finish if another thread keeps calling [`Scheduler::tick`].
    ///
    /// Reports [`SchedulerError::WorkerPanicked`] if a worker thread died.
    pub fn shutdown(mut self) -> Result<()> {
        self.wait_idle()?;
        match self.destroy() {
            0 => Ok(()),
            panicked => Err(SchedulerError::WorkerPanicked(panicked)),
        }
    }

    /// Stops the workers and discards queued jobs. Returns how many worker
    /// threads panicked. Safe to call more than once.
    fn destroy(&mut self) -> usize {
        self.shared.begin_shutdown();
        let panicked = worker::join_all(std::mem::take(&mut self.workers));

        // Dropping a job can complete a counter that re-queues a parked one.
        loop {
            let discarded = self.shared.queues.lock().drain();
            if discarded.is_empty() {
                break;
            }
            tracing::warn!(count = discarded.len(), "discarding queued jobs at shutdown");
            for job in discarded {
                drop(job);
                self.shared.metrics.record_discarded();
            }
        }
        panicked
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats()
    }

    pub fn num_workers(&self) -> usize {
        self.shared.workers
    }

    pub fn queued_jobs(&self) -> usize {
        self.shared.queues.lock().len()
    }

    /// Jobs waiting for [`Scheduler::run`] or [`Scheduler::tick`].
    pub fn queued_main_jobs(&self) -> usize {
        self.shared.queues.lock().len_of(Workgroup::Main)
    }

    pub fn active_jobs(&self) -> usize {
        self.shared.metrics.active()
    }

    pub fn completed_jobs(&self) -> u64 {
        self.shared.metrics.completed.load(Ordering::Relaxed)
    }

    pub fn failed_jobs(&self) -> u64 {
        self.shared.metrics.failed.load(Ordering::Relaxed)
    }

    /// The arena job stacks come from.
    pub fn arena(&self) -> &StackArena {
        &self.shared.arena
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let panicked = self.destroy();
        if panicked > 0 {
            tracing::error!(panicked, "worker threads panicked");
        }
        tracing::debug!("scheduler destroyed");
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("stats", &self.stats()).finish()
    }
}

/// Submission access to a scheduler without owning it.
///
/// Handles stay valid after the scheduler is dropped; submitting then fails
/// with [`SchedulerError::ShuttingDown`].
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// The scheduler whose thread is running the caller: any job, a worker
    /// thread, or a thread inside [`Scheduler::run`].
    pub fn current() -> Option<SchedulerHandle> {
        context::current_scheduler().map(|shared| SchedulerHandle { shared })
    }

    pub fn submit<F>(&self, priority: JobPriority, work: F) -> Result<JobId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_on(Workgroup::Background, priority, work)
    }

    pub fn submit_on<F>(&self, workgroup: Workgroup, priority: JobPriority, work: F) -> Result<JobId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit(workgroup, priority, Box::new(work))
    }

    /// Increments `counter` now and decrements it once the job ends, even if
    /// it panics. On error the counter is left unchanged.
    pub fn submit_tracked<F>(&self, priority: JobPriority, counter: &Counter, work: F) -> Result<JobId>
    where
        F: FnOnce() + Send + 'static,
    {
        counter.increment();
        let guard = CompletionGuard(counter.clone());
        self.shared.submit(
            Workgroup::Background,
            priority,
            Box::new(move || {
                let _guard = guard;
                work();
            }),
        )
        // A rejected closure is dropped along with its guard.
    }

    pub fn submit_batch<I>(&self, priority: JobPriority, jobs: I) -> Result<Counter>
    where
        I: IntoIterator<Item = Box<dyn FnOnce() + Send + 'static>>,
    {
        let counter = Counter::new(0);
        for work in jobs {
            self.submit_tracked(priority, &counter, work)?;
        }
        Ok(counter)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
