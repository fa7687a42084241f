use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Scheduler-wide counters. Each sits on its own cache line since workers
/// bump them on every job completion.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    /// Jobs submitted and not yet finished or discarded.
    pub(crate) active: CachePadded<AtomicUsize>,
    pub(crate) submitted: CachePadded<AtomicU64>,
    pub(crate) completed: CachePadded<AtomicU64>,
    pub(crate) failed: CachePadded<AtomicU64>,
}

impl Metrics {
    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn record_submitted(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns `true` if this was the last active job.
    pub(crate) fn record_retired(&self, failed: bool) -> bool {
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
        self.active.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// A queued job thrown away at shutdown.
    pub(crate) fn record_discarded(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time view of a scheduler, e.g. for a debug overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub workers: usize,
    /// Jobs waiting in the ready queues.
    pub queued: usize,
    /// Jobs submitted and not yet finished, queued or running.
    pub active: usize,
    pub submitted: u64,
    pub completed: u64,
    /// Jobs whose closure panicked.
    pub failed: u64,
    pub stacks_allocated: usize,
    pub stacks_free: usize,
}

impl SchedulerStats {
    /// Stacks held by live jobs.
    pub fn stacks_in_use(&self) -> usize {
        self.stacks_allocated - self.stacks_free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retire_reports_last_active_job() {
        let metrics = Metrics::default();
        metrics.record_submitted();
        metrics.record_submitted();

        assert!(!metrics.record_retired(false));
        assert!(metrics.record_retired(true));
        assert_eq!(metrics.active(), 0);
        assert_eq!(metrics.completed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stats_serialize_to_json() {
        let stats = SchedulerStats {
            workers: 2,
            stacks_allocated: 5,
            stacks_free: 3,
            ..SchedulerStats::default()
        };
        assert_eq!(stats.stacks_in_use(), 2);

        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["workers"], 2);
        assert_eq!(json["stacks_free"], 3);
    }
}
