//! Ready queues: per workgroup, one FIFO per priority level.

use crate::job::{Job, JobPriority, Workgroup};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub(crate) struct PriorityQueues {
    levels: [VecDeque<Box<Job>>; JobPriority::COUNT],
}

impl PriorityQueues {
    pub(crate) fn push(&mut self, job: Box<Job>) {
        self.levels[job.priority().index()].push_back(job);
    }

    /// Oldest job of the highest non-empty level.
    pub(crate) fn pop(&mut self) -> Option<Box<Job>> {
        self.levels.iter_mut().rev().find_map(VecDeque::pop_front)
    }

    pub(crate) fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn len_at(&self, priority: JobPriority) -> usize {
        self.levels[priority.index()].len()
    }

    /// Empties every level, highest first.
    pub(crate) fn drain(&mut self) -> Vec<Box<Job>> {
        let mut jobs = Vec::with_capacity(self.len());
        for level in self.levels.iter_mut().rev() {
            jobs.extend(level.drain(..));
        }
        jobs
    }
}

/// One set of [`PriorityQueues`] per workgroup. Jobs are routed by their
/// current workgroup.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueues {
    groups: [PriorityQueues; Workgroup::COUNT],
}

impl ReadyQueues {
    pub(crate) fn push(&mut self, job: Box<Job>) {
        self.groups[job.workgroup().index()].push(job);
    }

    pub(crate) fn pop(&mut self, workgroup: Workgroup) -> Option<Box<Job>> {
        self.groups[workgroup.index()].pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.iter().map(PriorityQueues::len).sum()
    }

    pub(crate) fn len_of(&self, workgroup: Workgroup) -> usize {
        self.groups[workgroup.index()].len()
    }

    pub(crate) fn drain(&mut self) -> Vec<Box<Job>> {
        self.groups.iter_mut().flat_map(PriorityQueues::drain).collect()
    }
}
