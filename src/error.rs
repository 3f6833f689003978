use thiserror::Error;

use crate::worker::WorkerId;

/// Why a single job did not produce a result.
///
/// `Unsupported` and `Codec` are application errors: the worker that ran the
/// job is still healthy. `Transport` and `Timeout` mean the worker context can
/// no longer be trusted and the pool replaces it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobError {
    #[error("unsupported input: {0}")]
    Unsupported(String),
    #[error("codec failure: {0}")]
    Codec(String),
    #[error("worker panicked: {0}")]
    Panicked(String),
    #[error("transport failure on worker {worker}: {reason}")]
    Transport { worker: WorkerId, reason: String },
    #[error("job timed out on worker {0}")]
    Timeout(WorkerId),
    #[error("the worker pool is closed")]
    PoolClosed,
}

impl JobError {
    pub fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec(err.to_string())
    }

    /// Whether the worker that produced this error should be replaced.
    pub fn poisons_worker(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout(_))
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Codec(format!("{err:#}"))
    }
}

/// Pool-level failures. These abort the whole batch.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("a worker pool needs at least one worker")]
    NoWorkers,
    #[error("failed to start worker {worker}: {source}")]
    Spawn {
        worker: WorkerId,
        #[source]
        source: std::io::Error,
    },
    #[error("worker {worker} failed to start: {reason}")]
    Start { worker: WorkerId, reason: String },
    #[error("dispatch loop stopped unexpectedly: {0}")]
    DispatchLoop(String),
}
