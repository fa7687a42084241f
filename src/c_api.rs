//! C ABI over [`Scheduler`].
//!
//! The handle handed to C is a `Box<Scheduler>` turned into a raw pointer.
//! Jobs are plain function pointers with an opaque payload.

use crate::{JobPriority, Scheduler, SchedulerStats};
use std::ffi::c_void;
use std::ptr;

/// Job entry point as seen from C.
pub type FiberJobFn = unsafe extern "C" fn(payload: *mut c_void);

/// Mirror of [`SchedulerStats`] with a fixed layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FiberSchedulerStats {
    pub workers: usize,
    pub queued: usize,
    pub active: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub stacks_allocated: usize,
    pub stacks_free: usize,
}

impl From<SchedulerStats> for FiberSchedulerStats {
    fn from(s: SchedulerStats) -> Self {
        FiberSchedulerStats {
            workers: s.workers,
            queued: s.queued,
            active: s.active,
            submitted: s.submitted,
            completed: s.completed,
            failed: s.failed,
            stacks_allocated: s.stacks_allocated,
            stacks_free: s.stacks_free,
        }
    }
}

/// The payload travels to whichever worker runs the job.
struct Payload(*mut c_void);

// SAFETY: the C caller promises the payload may be used from any thread.
unsafe impl Send for Payload {}

impl Payload {
    fn get(&self) -> *mut c_void {
        self.0
    }
}

#[unsafe(no_mangle)]
/// Creates a scheduler with `worker_count` workers (0: one per core).
///
/// Returns null on failure.
///
/// # Safety
/// The handle must eventually be passed to `fiber_scheduler_destroy`.
pub unsafe extern "C" fn fiber_scheduler_create(worker_count: usize) -> *mut Scheduler {
    match Scheduler::new(worker_count) {
        Ok(scheduler) => Box::into_raw(Box::new(scheduler)),
        Err(e) => {
            tracing::error!(error = %e, "fiber_scheduler_create failed");
            ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
/// Stops the workers, discards queued jobs and frees the scheduler.
///
/// # Safety
/// `handle` must come from `fiber_scheduler_create` and is invalid
/// afterwards. Null is ignored.
pub unsafe extern "C" fn fiber_scheduler_destroy(handle: *mut Scheduler) {
    if handle.is_null() {
        return;
    }
    // SAFETY: upheld by the caller.
    drop(unsafe { Box::from_raw(handle) });
}

#[unsafe(no_mangle)]
/// Queues `func(payload)` at `priority` (0 = low .. 3 = critical, larger
/// values are treated as critical). Returns false if the job was rejected.
///
/// # Safety
/// `handle` must be live; `func` must be safe to call with `payload` on any
/// thread.
pub unsafe extern "C" fn fiber_scheduler_submit(
    handle: *mut Scheduler,
    func: Option<FiberJobFn>,
    payload: *mut c_void,
    priority: u32,
) -> bool {
    // SAFETY: upheld by the caller.
    let (Some(scheduler), Some(func)) = (unsafe { handle.as_ref() }, func) else {
        return false;
    };
    let payload = Payload(payload);
    scheduler
        .submit(JobPriority::from_level(priority), move || {
            // SAFETY: upheld by the submitter.
            unsafe { func(payload.get()) }
        })
        .is_ok()
}

#[unsafe(no_mangle)]
/// Blocks until no job is active. Returns false on a bad handle or when
/// called from inside a job.
///
/// # Safety
/// `handle` must be live or null.
pub unsafe extern "C" fn fiber_scheduler_wait_idle(handle: *mut Scheduler) -> bool {
    // SAFETY: upheld by the caller.
    match unsafe { handle.as_ref() } {
        Some(scheduler) => scheduler.wait_idle().is_ok(),
        None => false,
    }
}

#[unsafe(no_mangle)]
/// Like `fiber_scheduler_wait_idle` but the calling thread becomes the main
/// thread and executes main jobs while it waits.
///
/// # Safety
/// `handle` must be live or null.
pub unsafe extern "C" fn fiber_scheduler_run(handle: *mut Scheduler) -> bool {
    // SAFETY: upheld by the caller.
    match unsafe { handle.as_ref() } {
        Some(scheduler) => scheduler.run().is_ok(),
        None => false,
    }
}

#[unsafe(no_mangle)]
/// Runs the main jobs queued right now once each. Returns how many ran, or
/// -1 on a bad handle or when called from inside a job.
///
/// # Safety
/// `handle` must be live or null.
pub unsafe extern "C" fn fiber_scheduler_tick(handle: *mut Scheduler) -> i64 {
    // SAFETY: upheld by the caller.
    match unsafe { handle.as_ref() }.map(Scheduler::tick) {
        Some(Ok(ran)) => i64::try_from(ran).unwrap_or(i64::MAX),
        _ => -1,
    }
}

#[unsafe(no_mangle)]
/// Yields the calling job. Returns false outside of a job.
pub extern "C" fn fiber_yield() -> bool {
    crate::yield_now()
}

#[unsafe(no_mangle)]
/// Continues the calling job on the main thread. Returns false outside of a
/// job.
pub extern "C" fn fiber_switch_to_main() -> bool {
    crate::switch_to_main()
}

#[unsafe(no_mangle)]
/// Continues the calling job on the worker pool. Returns false outside of a
/// job.
pub extern "C" fn fiber_switch_to_background() -> bool {
    crate::switch_to_background()
}

#[unsafe(no_mangle)]
/// Writes a statistics snapshot into `out`.
///
/// # Safety
/// `handle` must be live or null; `out` must be writable or null.
pub unsafe extern "C" fn fiber_scheduler_stats(handle: *mut Scheduler, out: *mut FiberSchedulerStats) -> bool {
    // SAFETY: upheld by the caller.
    let Some(scheduler) = (unsafe { handle.as_ref() }) else {
        return false;
    };
    if out.is_null() {
        return false;
    }
    // SAFETY: checked non-null, writability upheld by the caller.
    unsafe { out.write(scheduler.stats().into()) };
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    unsafe extern "C" fn bump(payload: *mut c_void) {
        let counter = unsafe { &*(payload as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn bump_twice_with_yield(payload: *mut c_void) {
        let counter = unsafe { &*(payload as *const AtomicUsize) };
        counter.fetch_add(1, Ordering::SeqCst);
        assert!(fiber_yield());
        counter.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_c_api_round_trip() {
        let hits = AtomicUsize::new(0);
        let payload = &hits as *const AtomicUsize as *mut c_void;

        unsafe {
            let handle = fiber_scheduler_create(2);
            assert!(!handle.is_null());

            for priority in 0..6 {
                assert!(fiber_scheduler_submit(handle, Some(bump), payload, priority));
            }
            assert!(fiber_scheduler_submit(handle, Some(bump_twice_with_yield), payload, 1));
            assert!(fiber_scheduler_wait_idle(handle));

            let mut stats = FiberSchedulerStats::default();
            assert!(fiber_scheduler_stats(handle, &mut stats));
            assert_eq!(stats.completed, 7);
            assert_eq!(stats.active, 0);

            fiber_scheduler_destroy(handle);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 8);
    }

    unsafe extern "C" fn bump_on_main(payload: *mut c_void) {
        assert!(fiber_switch_to_main());
        assert!(crate::current_thread_id().is_none());
        unsafe { bump(payload) };
    }

    #[test]
    fn test_c_api_switch_to_main_is_driven_by_tick() {
        let hits = AtomicUsize::new(0);
        let payload = &hits as *const AtomicUsize as *mut c_void;

        unsafe {
            let handle = fiber_scheduler_create(1);
            assert!(fiber_scheduler_submit(handle, Some(bump_on_main), payload, 2));

            let mut ran = 0;
            while hits.load(Ordering::SeqCst) == 0 {
                ran += fiber_scheduler_tick(handle);
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            assert_eq!(ran, 1);
            assert!(fiber_scheduler_wait_idle(handle));
            fiber_scheduler_destroy(handle);
        }
    }

    #[test]
    fn test_c_api_rejects_null() {
        unsafe {
            assert!(!fiber_scheduler_submit(ptr::null_mut(), Some(bump), ptr::null_mut(), 0));
            assert!(!fiber_scheduler_wait_idle(ptr::null_mut()));
            assert!(!fiber_scheduler_run(ptr::null_mut()));
            assert_eq!(fiber_scheduler_tick(ptr::null_mut()), -1);
            assert!(!fiber_scheduler_stats(ptr::null_mut(), ptr::null_mut()));
            fiber_scheduler_destroy(ptr::null_mut());
        }
        assert!(!fiber_yield());
        assert!(!fiber_switch_to_main());
        assert!(!fiber_switch_to_background());
    }
}
