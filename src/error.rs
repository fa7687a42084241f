//! Error types for scheduler operations.

use thiserror::Error;

/// Errors produced by the scheduler and its components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Every stack block of the arena is in use.
    #[error("stack arena exhausted: all {capacity} stacks are in use")]
    ArenaExhausted { capacity: usize },
    /// The arena's backing region could not be reserved.
    #[error("failed to reserve {bytes} bytes for the stack arena")]
    ArenaReservation { bytes: usize },
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
    /// A worker thread could not be started.
    #[error("failed to spawn worker {index}: {source}")]
    WorkerSpawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
    /// The scheduler no longer accepts work.
    #[error("scheduler is shutting down")]
    ShuttingDown,
    /// A blocking call was made from inside a running job.
    #[error("{0} cannot be called from inside a job")]
    InsideJob(&'static str),
    /// Worker threads panicked outside of job code.
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
