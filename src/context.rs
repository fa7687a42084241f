//! Per-thread scheduling state.
//!
//! Every thread that runs jobs has a [`ThreadContext`]: the job standing for
//! its own stack, a pointer to the job currently executing on it and, for
//! worker threads, the scheduler it belongs to.
//!
//! Jobs migrate between threads when they yield, so nothing in this module
//! hands out references into thread-local storage. Every accessor looks the
//! thread up afresh and is kept out of line so a TLS address can never be
//! cached across a fiber switch.

use crate::counter::WaitRequest;
use crate::job::{Job, JobId, JobPriority, Workgroup};
use crate::scheduler::Shared;
use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::Arc;

struct ThreadContext {
    main_job: Box<Job>,
    current: Cell<*const Job>,
    worker: Cell<Option<usize>>,
    scheduler: RefCell<Option<Arc<Shared>>>,
}

impl ThreadContext {
    fn new() -> Self {
        ThreadContext {
            main_job: Box::new(Job::thread_main()),
            current: Cell::new(ptr::null()),
            worker: Cell::new(None),
            scheduler: RefCell::new(None),
        }
    }
}

thread_local! {
    static THREAD: ThreadContext = ThreadContext::new();
}

/// The job executing on this thread; the thread's main job if none.
#[inline(never)]
pub(crate) fn current_raw() -> *const Job {
    THREAD.with(|t| {
        let current = t.current.get();
        if current.is_null() { &*t.main_job as *const Job } else { current }
    })
}

#[inline(never)]
pub(crate) fn set_current(job: &Job) {
    THREAD.with(|t| t.current.set(job))
}

/// Whether the caller is running inside a job rather than on a thread's own
/// stack.
#[inline(never)]
pub fn in_job() -> bool {
    // SAFETY: the current job is alive while it runs.
    !unsafe { &*current_raw() }.is_thread_main()
}

/// Snapshot of the running job, as seen from inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentJob {
    pub id: JobId,
    pub priority: JobPriority,
    pub resume_count: u32,
}

/// Describes the job the caller is running in, `None` outside of jobs.
pub fn current_job() -> Option<CurrentJob> {
    // SAFETY: as in `in_job`.
    let job = unsafe { &*current_raw() };
    if job.is_thread_main() {
        return None;
    }
    Some(CurrentJob {
        id: job.id(),
        priority: job.priority(),
        resume_count: job.resume_count(),
    })
}

/// Index of the worker thread the caller runs on, `None` on other threads.
#[inline(never)]
pub fn current_thread_id() -> Option<usize> {
    THREAD.with(|t| t.worker.get())
}

/// The workgroup the calling thread serves: `Background` on workers, `Main`
/// on a thread inside [`Scheduler::run`](crate::Scheduler::run) or
/// [`Scheduler::tick`](crate::Scheduler::tick), `None` elsewhere.
#[inline(never)]
pub fn current_workgroup() -> Option<Workgroup> {
    THREAD.with(|t| {
        if t.worker.get().is_some() {
            Some(Workgroup::Background)
        } else if t.scheduler.borrow().is_some() {
            Some(Workgroup::Main)
        } else {
            None
        }
    })
}

#[inline(never)]
pub(crate) fn current_scheduler() -> Option<Arc<Shared>> {
    THREAD.with(|t| t.scheduler.borrow().clone())
}

/// Suspends the running job and hands control back to whoever resumed it.
///
/// The job goes back to its scheduler's queue and continues later, possibly
/// on another worker. Returns `false` without doing anything when called
/// outside of a job.
pub fn yield_now() -> bool {
    // SAFETY: as in `in_job`.
    let job = unsafe { &*current_raw() };
    if job.is_thread_main() {
        return false;
    }
    // SAFETY: `job` is the job running this code.
    unsafe { job.suspend() };
    true
}

/// Moves the running job to `workgroup`.
///
/// Returns right away if the calling thread already serves that group.
/// Otherwise the job yields and continues on a thread of the target group.
/// Returns `false` without doing anything outside of a job.
pub fn switch_to(workgroup: Workgroup) -> bool {
    // SAFETY: as in `in_job`.
    let job = unsafe { &*current_raw() };
    if job.is_thread_main() {
        return false;
    }
    if current_workgroup() == Some(workgroup) {
        return true;
    }
    job.set_workgroup(workgroup);
    // SAFETY: `job` is the job running this code.
    unsafe { job.suspend() };
    true
}

/// Continues the running job on the thread driving the scheduler's main
/// loop. See [`switch_to`].
pub fn switch_to_main() -> bool {
    switch_to(Workgroup::Main)
}

/// Continues the running job on the worker pool. See [`switch_to`].
pub fn switch_to_background() -> bool {
    switch_to(Workgroup::Background)
}

/// Parks the running job until `request` is satisfied. Returns `false`
/// outside of a job.
pub(crate) fn park_current(request: WaitRequest) -> bool {
    // SAFETY: as in `in_job`.
    let job = unsafe { &*current_raw() };
    if job.is_thread_main() {
        return false;
    }
    // SAFETY: `job` is the job running this code.
    unsafe { job.park(request) };
    true
}

/// Binds the calling thread to a scheduler until the guard is dropped.
pub(crate) fn enter(worker: Option<usize>, scheduler: Arc<Shared>) -> ContextGuard {
    THREAD.with(|t| {
        let previous_worker = t.worker.replace(worker);
        let previous_scheduler = t.scheduler.replace(Some(scheduler));
        ContextGuard {
            previous_worker,
            previous_scheduler,
        }
    })
}

/// Restores the thread's previous binding on drop.
pub(crate) struct ContextGuard {
    previous_worker: Option<usize>,
    previous_scheduler: Option<Arc<Shared>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous_scheduler = self.previous_scheduler.take();
        let worker = self.previous_worker;
        // The thread may already be tearing down its locals.
        let _ = THREAD.try_with(|t| {
            t.worker.set(worker);
            t.scheduler.replace(previous_scheduler)
        });
    }
}
