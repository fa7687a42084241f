//! Jobs: a unit of work bound to its own fiber stack.
//!
//! A job runs its closure on a stack leased from the [`StackArena`]. It can
//! suspend itself with [`yield_now`](crate::yield_now) and be resumed later,
//! possibly on a different worker thread. Once the closure returns the job is
//! `Finished` and dropping it hands the stack back to the arena.

use crate::allocator::{StackArena, StackLease};
use crate::context;
use crate::counter::WaitRequest;
use crate::error::{Result, SchedulerError};
use crate::fiber::{self, FiberContext};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

/// Scheduling priority. Higher levels are always drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl JobPriority {
    pub const COUNT: usize = 4;

    /// All levels, lowest first.
    pub const ALL: [JobPriority; Self::COUNT] =
        [JobPriority::Low, JobPriority::Normal, JobPriority::High, JobPriority::Critical];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Maps a raw level onto a priority, saturating at `Critical`.
    pub fn from_level(level: u32) -> Self {
        match level {
            0 => JobPriority::Low,
            1 => JobPriority::Normal,
            2 => JobPriority::High,
            _ => JobPriority::Critical,
        }
    }
}

/// Which threads may run a job.
///
/// `Background` jobs run on the worker pool. `Main` jobs only run on the
/// thread driving [`Scheduler::run`](crate::Scheduler::run) or
/// [`Scheduler::tick`](crate::Scheduler::tick).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Workgroup {
    Main = 0,
    #[default]
    Background = 1,
}

impl Workgroup {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Lifecycle of a job.
///
/// `Ready -> Running -> ((Suspended | Waiting) -> Running)* -> Finished`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum JobState {
    /// Created, never run.
    Ready = 0,
    /// Executing on some thread right now.
    Running = 1,
    /// Yielded, or waiting for a job it resumed to hand control back.
    Suspended = 2,
    /// Parked until a [`Counter`](crate::Counter) reaches zero.
    Waiting = 3,
    /// The closure returned (or panicked).
    Finished = 4,
}

impl JobState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => JobState::Ready,
            1 => JobState::Running,
            2 => JobState::Suspended,
            3 => JobState::Waiting,
            _ => JobState::Finished,
        }
    }
}

/// Process-unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(u64);

impl JobId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        JobId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

type Work = Box<dyn FnOnce() + Send + 'static>;

/// A stackful unit of work.
///
/// Jobs live in a `Box` so their address stays fixed while they are
/// suspended. A thread's own stack is also represented by a job (with no
/// fiber stack of its own) so the caller chain always ends somewhere.
pub struct Job {
    id: JobId,
    priority: JobPriority,
    workgroup: Cell<Workgroup>,
    state: AtomicU8,
    context: FiberContext,
    work: Cell<Option<Work>>,
    /// Set by the job right before it parks; taken by whoever resumed it.
    wait: Cell<Option<WaitRequest>>,
    /// Whoever resumed us last; control goes back there on yield or exit.
    caller: Cell<*const Job>,
    resumes: AtomicU32,
    panicked: AtomicBool,
    /// Dropped after `context`.
    stack: Option<StackLease>,
}

// SAFETY: a job is only touched by the thread currently running or resuming
// it; hand-over between threads goes through the scheduler's queue lock.
unsafe impl Send for Job {}

impl Job {
    /// Creates a job that runs `work` on a stack taken from `arena` the first
    /// time it is resumed.
    ///
    /// Fails with [`SchedulerError::ArenaExhausted`] when no stack is free.
    pub fn new<F>(arena: &Arc<StackArena>, priority: JobPriority, work: F) -> Result<Box<Job>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_boxed(arena, priority, Box::new(work))
    }

    pub(crate) fn from_boxed(arena: &Arc<StackArena>, priority: JobPriority, work: Work) -> Result<Box<Job>> {
        let stack = arena.lease().ok_or(SchedulerError::ArenaExhausted {
            capacity: arena.capacity(),
        })?;

        // SAFETY: the lease keeps the block ours until the job is dropped,
        // and the job drops its context before the lease.
        let context = unsafe { FiberContext::new(job_entry, stack.base(), stack.size()) }.ok_or_else(|| {
            SchedulerError::InvalidConfig(format!("stack of {} bytes is too small for a job", stack.size()))
        })?;

        Ok(Box::new(Job {
            id: JobId::next(),
            priority,
            workgroup: Cell::new(Workgroup::default()),
            state: AtomicU8::new(JobState::Ready as u8),
            context,
            work: Cell::new(Some(work)),
            wait: Cell::new(None),
            caller: Cell::new(ptr::null()),
            resumes: AtomicU32::new(0),
            panicked: AtomicBool::new(false),
            stack: Some(stack),
        }))
    }

    /// The job standing for a thread's own stack. Always `Running`.
    pub(crate) fn thread_main() -> Job {
        Job {
            id: JobId::next(),
            priority: JobPriority::Normal,
            workgroup: Cell::new(Workgroup::default()),
            state: AtomicU8::new(JobState::Running as u8),
            context: FiberContext::main(),
            work: Cell::new(None),
            wait: Cell::new(None),
            caller: Cell::new(ptr::null()),
            resumes: AtomicU32::new(0),
            panicked: AtomicBool::new(false),
            stack: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    /// The threads this job goes back to when it is re-queued.
    pub fn workgroup(&self) -> Workgroup {
        self.workgroup.get()
    }

    pub(crate) fn set_workgroup(&self, workgroup: Workgroup) {
        self.workgroup.set(workgroup);
    }

    pub(crate) fn take_wait_request(&self) -> Option<WaitRequest> {
        self.wait.take()
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.state() != JobState::Finished
    }

    /// How many times the job was switched into.
    pub fn resume_count(&self) -> u32 {
        self.resumes.load(Ordering::Relaxed)
    }

    /// Whether the closure ended in a panic.
    pub fn panicked(&self) -> bool {
        self.panicked.load(Ordering::Relaxed)
    }

    pub(crate) fn is_thread_main(&self) -> bool {
        self.context.is_main()
    }

    /// Address range of the job's stack.
    pub fn stack(&self) -> Option<(*const u8, usize)> {
        self.stack.as_ref().map(|s| (s.base().as_ptr().cast_const(), s.size()))
    }

    /// Runs the job on the calling thread until it yields or finishes.
    ///
    /// Only `Ready`, `Suspended` and `Waiting` jobs can be resumed; anything
    /// else returns `false` and changes nothing. A `Waiting` job resumed
    /// directly re-checks what it waits for and may park again. Otherwise returns whether the job
    /// is still alive afterwards.
    pub fn resume(&self) -> bool {
        if self.is_thread_main() || !self.try_start() {
            return false;
        }

        // SAFETY: the current job of this thread is alive while it runs.
        let caller = unsafe { &*context::current_raw() };
        self.caller.set(caller);
        caller.set_state(JobState::Suspended);
        context::set_current(self);
        self.resumes.fetch_add(1, Ordering::Relaxed);

        // SAFETY: `caller` is executing this very code and `self` was
        // suspended until the state transition above.
        unsafe { FiberContext::switch(&caller.context, &self.context) };

        context::set_current(caller);
        caller.set_state(JobState::Running);
        self.is_alive()
    }

    fn try_start(&self) -> bool {
        [JobState::Ready, JobState::Suspended, JobState::Waiting]
            .into_iter()
            .any(|from| {
                self.state
                    .compare_exchange(from as u8, JobState::Running as u8, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
    }

    /// Hands control back to whoever resumed this job.
    ///
    /// # Safety
    ///
    /// Must be called by the job itself while it is running.
    pub(crate) unsafe fn suspend(&self) {
        // SAFETY: forwarded from the caller.
        unsafe { self.switch_out(JobState::Suspended) }
    }

    /// Like [`Job::suspend`], but leaves `request` for the resumer so the
    /// job can be parked until its counter reaches zero.
    ///
    /// # Safety
    ///
    /// Same as [`Job::suspend`].
    pub(crate) unsafe fn park(&self, request: WaitRequest) {
        self.wait.set(Some(request));
        // SAFETY: forwarded from the caller.
        unsafe { self.switch_out(JobState::Waiting) }
    }

    unsafe fn switch_out(&self, state: JobState) {
        self.set_state(state);
        let caller = self.caller.get();
        // SAFETY: the caller is blocked inside `resume` until we switch back.
        unsafe { FiberContext::switch(&self.context, &(*caller).context) };
        // The job may be on another thread now; the resumer has already
        // updated that thread's context.
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("workgroup", &self.workgroup())
            .field("state", &self.state())
            .field("resumes", &self.resume_count())
            .finish_non_exhaustive()
    }
}

extern "C" fn job_entry() -> ! {
    fiber::fiber_started();

    // SAFETY: `resume` made us the current job right before switching here.
    let job = unsafe { &*context::current_raw() };

    if let Some(work) = job.work.take() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
            job.panicked.store(true, Ordering::Relaxed);
            tracing::error!(job = %job.id, panic = panic_message(&*payload), "job panicked");
        }
    }

    job.set_state(JobState::Finished);

    // Read only now: the job may have been resumed from a different caller
    // than the one that started it.
    let caller = job.caller.get();
    // SAFETY: the caller is blocked inside `resume`, and a finished job is
    // never resumed again.
    unsafe { FiberContext::exit_to(&job.context, &(*caller).context) }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::yield_now;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn arena(capacity: usize) -> Arc<StackArena> {
        Arc::new(StackArena::new(64 * 1024, capacity).unwrap())
    }

    #[test]
    fn test_job_runs_to_completion_on_first_resume() {
        let arena = arena(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        let job = Job::new(&arena, JobPriority::Normal, move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(job.state(), JobState::Ready);
        assert!(!job.resume());
        assert_eq!(job.state(), JobState::Finished);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(job.resume_count(), 1);
    }

    #[test]
    fn test_n_yields_take_n_plus_one_resumes() {
        let arena = arena(1);
        let steps = Arc::new(AtomicUsize::new(0));
        let steps_clone = steps.clone();

        let job = Job::new(&arena, JobPriority::High, move || {
            for _ in 0..3 {
                steps_clone.fetch_add(1, Ordering::SeqCst);
                assert!(yield_now());
            }
        })
        .unwrap();

        let mut resumes = 0;
        while job.is_alive() {
            let alive = job.resume();
            resumes += 1;
            if alive {
                assert_eq!(job.state(), JobState::Suspended);
                assert_eq!(steps.load(Ordering::SeqCst), resumes);
            }
        }

        assert_eq!(resumes, 4);
        assert_eq!(job.resume_count(), 4);
        assert!(!job.panicked());
    }

    #[test]
    fn test_finished_job_cannot_be_resumed() {
        let arena = arena(1);
        let job = Job::new(&arena, JobPriority::Low, || {}).unwrap();
        assert!(!job.resume());
        assert!(!job.resume());
        assert_eq!(job.resume_count(), 1);
    }

    #[test]
    fn test_running_job_cannot_resume_itself() {
        let arena = arena(1);
        let me = Arc::new(AtomicUsize::new(0));
        let refused = Arc::new(AtomicBool::new(false));
        let (me_clone, refused_clone) = (me.clone(), refused.clone());

        let job = Job::new(&arena, JobPriority::Normal, move || {
            let me = unsafe { &*(me_clone.load(Ordering::SeqCst) as *const Job) };
            assert_eq!(me.state(), JobState::Running);
            refused_clone.store(!me.resume(), Ordering::SeqCst);
        })
        .unwrap();
        me.store(&*job as *const Job as usize, Ordering::SeqCst);

        assert!(!job.resume());
        assert!(refused.load(Ordering::SeqCst));
        assert!(!job.panicked());
    }

    #[test]
    fn test_panic_is_contained_and_job_finishes() {
        let arena = arena(1);
        let job = Job::new(&arena, JobPriority::Normal, || panic!("boom")).unwrap();

        assert!(!job.resume());
        assert!(job.panicked());
        assert_eq!(job.state(), JobState::Finished);

        drop(job);
        assert_eq!(arena.in_use_blocks(), 0);
    }

    #[test]
    fn test_job_runs_on_an_arena_stack() {
        let arena = arena(2);
        let local_addr = Arc::new(AtomicUsize::new(0));
        let local_clone = local_addr.clone();

        let job = Job::new(&arena, JobPriority::Normal, move || {
            let marker = 0u64;
            local_clone.store(std::hint::black_box(&marker) as *const u64 as usize, Ordering::SeqCst);
        })
        .unwrap();
        job.resume();

        let addr = local_addr.load(Ordering::SeqCst) as *const u8;
        assert!(arena.contains(addr));
        let (base, size) = job.stack().unwrap();
        assert!((base as usize..base as usize + size).contains(&(addr as usize)));
    }

    #[test]
    fn test_nested_resume_returns_to_the_outer_job() {
        let arena = arena(2);
        let trace = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let inner_trace = trace.clone();
        let inner = Job::new(&arena, JobPriority::Normal, move || {
            inner_trace.lock().push("inner:1");
            yield_now();
            inner_trace.lock().push("inner:2");
        })
        .unwrap();

        let outer_trace = trace.clone();
        let outer = Job::new(&arena, JobPriority::Normal, move || {
            outer_trace.lock().push("outer:start");
            assert!(inner.resume());
            outer_trace.lock().push("outer:between");
            assert!(!inner.resume());
            outer_trace.lock().push("outer:end");
        })
        .unwrap();

        assert!(!outer.resume());
        assert!(!outer.panicked());
        assert_eq!(
            *trace.lock(),
            ["outer:start", "inner:1", "outer:between", "inner:2", "outer:end"]
        );
    }

    #[test]
    fn test_exhausted_arena_is_reported() {
        let arena = arena(1);
        let _held = Job::new(&arena, JobPriority::Normal, || {}).unwrap();
        assert!(matches!(
            Job::new(&arena, JobPriority::Normal, || {}),
            Err(SchedulerError::ArenaExhausted { capacity: 1 })
        ));
    }

    #[test]
    fn test_priority_levels_map_and_order() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert_eq!(JobPriority::default(), JobPriority::Normal);
        assert_eq!(JobPriority::from_level(2), JobPriority::High);
        assert_eq!(JobPriority::from_level(99), JobPriority::Critical);
        for (i, p) in JobPriority::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
    }
}
