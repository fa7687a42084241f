//! Counter-based synchronization for job completion tracking.

use crate::context;
use crate::job::{Job, JobId};
use crate::scheduler::Shared;
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

struct InnerCounter {
    value: CachePadded<AtomicUsize>,
    /// Jobs parked until the value reaches zero.
    waiters: Mutex<Vec<ParkedJob>>,
    /// Wakes plain threads blocked in `wait`.
    completed: Condvar,
}

/// A suspended job held out of the ready queues.
struct ParkedJob {
    job: Box<Job>,
    scheduler: Weak<Shared>,
}

impl ParkedJob {
    fn wake(self) {
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.requeue(self.job),
            None => tracing::debug!(job = %self.job.id(), "scheduler gone; dropping parked job"),
        }
    }
}

/// What a job parks on: a counter and an optional deadline.
pub(crate) struct WaitRequest {
    pub(crate) counter: Counter,
    pub(crate) deadline: Option<Instant>,
}

/// A thread-safe countdown that reaches zero when tracked jobs are done.
///
/// Inside a scheduled job, [`Counter::wait`] parks the job outside the ready
/// queues; the `decrement` that reaches zero puts it back. The worker is
/// free to run anything meanwhile, including lower-priority jobs the waiter
/// depends on. On a plain thread `wait` blocks on a condition variable.
#[derive(Clone)]
pub struct Counter {
    inner: Arc<InnerCounter>,
}

impl Counter {
    /// Creates a new counter with the specified initial value.
    pub fn new(initial: usize) -> Self {
        Counter {
            inner: Arc::new(InnerCounter {
                value: CachePadded::new(AtomicUsize::new(initial)),
                waiters: Mutex::new(Vec::new()),
                completed: Condvar::new(),
            }),
        }
    }

    /// Increments the counter by one.
    pub fn increment(&self) {
        self.inner.value.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the counter by one and wakes every waiter if it reached
    /// zero.
    ///
    /// Returns true if the counter reached zero.
    pub fn decrement(&self) -> bool {
        // Release so work done before the decrement is visible to waiters.
        let previous = self.inner.value.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "counter decremented below zero");
        if previous != 1 {
            return false;
        }

        let parked = {
            let mut waiters = self.inner.waiters.lock();
            self.inner.completed.notify_all();
            std::mem::take(&mut *waiters)
        };
        for waiter in parked {
            waiter.wake();
        }
        true
    }

    /// Returns the current value of the counter.
    pub fn value(&self) -> usize {
        self.inner.value.load(Ordering::Acquire)
    }

    /// Checks if the counter has reached zero.
    pub fn is_complete(&self) -> bool {
        self.value() == 0
    }

    /// Returns once the counter reaches zero.
    ///
    /// Called from a job that was not started by a scheduler (one resumed
    /// by hand), this yields back to the resumer on every check instead.
    pub fn wait(&self) {
        if !context::in_job() {
            self.block_until(None);
            return;
        }
        while !self.is_complete() {
            context::park_current(self.request(None));
        }
    }

    /// Like [`Counter::wait`] but gives up after `timeout`. Returns whether
    /// the counter reached zero.
    ///
    /// A parked job is woken at the deadline by the next worker that looks
    /// for work, so it may resume up to one idle timeout late.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if !context::in_job() {
            return self.block_until(Some(deadline));
        }
        while !self.is_complete() {
            if Instant::now() >= deadline {
                return false;
            }
            context::park_current(self.request(Some(deadline)));
        }
        true
    }

    fn request(&self, deadline: Option<Instant>) -> WaitRequest {
        WaitRequest {
            counter: self.clone(),
            deadline,
        }
    }

    fn block_until(&self, deadline: Option<Instant>) -> bool {
        let mut waiters = self.inner.waiters.lock();
        while !self.is_complete() {
            match deadline {
                Some(deadline) => {
                    if self.inner.completed.wait_until(&mut waiters, deadline).timed_out() {
                        return self.is_complete();
                    }
                }
                None => self.inner.completed.wait(&mut waiters),
            }
        }
        true
    }

    /// Holds `job` until the counter reaches zero, then hands it back to
    /// `scheduler`. Returns the job right away if the counter is already
    /// zero.
    pub(crate) fn park(&self, job: Box<Job>, scheduler: Weak<Shared>) -> Option<Box<Job>> {
        let mut waiters = self.inner.waiters.lock();
        // Checked under the lock: the decrement to zero takes it after
        // updating the value.
        if self.is_complete() {
            return Some(job);
        }
        waiters.push(ParkedJob { job, scheduler });
        None
    }

    /// Takes a parked job back out, e.g. when its wait timed out.
    pub(crate) fn unpark(&self, id: JobId) -> Option<Box<Job>> {
        let mut waiters = self.inner.waiters.lock();
        let index = waiters.iter().position(|w| w.job.id() == id)?;
        Some(waiters.swap_remove(index).job)
    }

    /// Jobs currently parked on this counter.
    pub fn parked_jobs(&self) -> usize {
        self.inner.waiters.lock().len()
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("value", &self.value())
            .field("parked", &self.parked_jobs())
            .finish()
    }
}

/// Decrements its counter when dropped, including during unwinding.
pub(crate) struct CompletionGuard(pub(crate) Counter);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.decrement();
    }
}
