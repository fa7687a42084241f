//! # jobfiber - Cooperative Fiber Job Scheduler
//!
//! Stackful jobs (fibers) multiplexed onto a pool of worker threads. A job
//! runs on its own stack and can suspend itself at any call depth with
//! [`yield_now`]; it later continues exactly where it stopped, possibly on
//! another worker. Switching between jobs is a handful of register moves
//! in user space, with no OS thread context switch involved.
//!
//! ## Architecture
//!
//! - **Fibers** ([`fiber`]): saved register images and the raw switch,
//!   hand-written for x86-64 System V and AArch64.
//! - **Stack arena** ([`allocator`]): one fixed region sliced into job
//!   stacks, recycled through an intrusive free list.
//! - **Jobs** ([`job`]): a closure bound to a stack, with a
//!   `Ready -> Running -> Suspended | Waiting -> Finished` lifecycle.
//! - **Scheduler** ([`scheduler`]): one FIFO per priority level, drained
//!   highest first. Background jobs run on the worker threads; main jobs run
//!   on the thread inside [`Scheduler::run`] or [`Scheduler::tick`], and a
//!   job can move between the two with [`switch_to_main`] and
//!   [`switch_to_background`].
//! - **Counters** ([`counter`]): completion countdowns. A job waiting on one
//!   is parked outside the queues until it reaches zero.
//!
//! Scheduling is cooperative: a job keeps its worker until it yields or
//! returns, and there is no aging between priority levels.
//!
//! ## Example
//!
//! ```no_run
//! use jobfiber::{JobPriority, Scheduler, yield_now};
//!
//! let scheduler = Scheduler::new(4).unwrap(); // 4 worker threads
//!
//! scheduler
//!     .submit(JobPriority::High, || {
//!         println!("first half");
//!         yield_now();
//!         println!("second half");
//!     })
//!     .unwrap();
//!
//! scheduler.wait_idle().unwrap();
//! ```

pub mod allocator;
mod arch;
pub mod c_api;
pub mod config;
pub mod context;
pub mod counter;
pub mod error;
pub mod fiber;
pub mod job;
mod metrics;
mod queue;
mod sanitizer;
pub mod scheduler;
pub mod telemetry;
mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Linear pinning (worker i -> logical processor i).
    Linear,
    /// Pin to physical cores only (even-numbered logical processors), avoiding SMT contention.
    AvoidSMT,
}

pub use allocator::StackArena;
pub use config::SchedulerConfig;
pub use context::{
    CurrentJob, current_job, current_thread_id, current_workgroup, in_job, switch_to, switch_to_background,
    switch_to_main, yield_now,
};
pub use counter::Counter;
pub use error::{Result, SchedulerError};
pub use job::{Job, JobId, JobPriority, JobState, Workgroup};
pub use metrics::SchedulerStats;
pub use scheduler::{Scheduler, SchedulerHandle};
pub use telemetry::init_tracing;
