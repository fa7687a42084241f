//! Scheduler configuration.

use crate::PinningStrategy;
use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest per-job stack the scheduler accepts. Job entry, panic capture
/// and logging all run on the job stack, so this is well above the bare
/// fiber minimum.
pub const MIN_JOB_STACK_SIZE: usize = 16 * 1024;

/// Configuration for a [`Scheduler`](crate::Scheduler).
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use jobfiber::SchedulerConfig;
///
/// let config = SchedulerConfig::from_json(r#"{ "worker_count": 2, "pinning": "Linear" }"#).unwrap();
/// assert_eq!(config.worker_count, 2);
/// assert_eq!(config.max_stacks, SchedulerConfig::default().max_stacks);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads. 0 means one per logical core.
    pub worker_count: usize,
    /// Stack size of every job in bytes. Default: 128KB.
    pub stack_size: usize,
    /// Upper bound on jobs alive at once (one stack each). Default: 512.
    pub max_stacks: usize,
    /// How workers are pinned to cores.
    pub pinning: PinningStrategy,
    /// Longest an idle worker sleeps before re-checking for shutdown.
    pub idle_timeout_ms: u64,
    /// Worker threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            stack_size: 128 * 1024,
            max_stacks: 512,
            pinning: PinningStrategy::None,
            idle_timeout_ms: 10,
            thread_name_prefix: "worker".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// A default configuration with `worker_count` workers.
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Self::default()
        }
    }

    /// Parses a JSON document and validates the result.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.stack_size < MIN_JOB_STACK_SIZE {
            return Err(SchedulerError::InvalidConfig(format!(
                "stack_size must be at least {MIN_JOB_STACK_SIZE} bytes"
            )));
        }
        if self.max_stacks == 0 {
            return Err(SchedulerError::InvalidConfig("max_stacks must be greater than 0".into()));
        }
        if self.idle_timeout_ms == 0 {
            return Err(SchedulerError::InvalidConfig("idle_timeout_ms must be greater than 0".into()));
        }
        if self.thread_name_prefix.contains('\0') {
            return Err(SchedulerError::InvalidConfig(
                "thread_name_prefix must not contain NUL bytes".into(),
            ));
        }
        Ok(())
    }

    /// Worker count with 0 resolved to the number of logical cores.
    pub fn resolved_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker_count
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
