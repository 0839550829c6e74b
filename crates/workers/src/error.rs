use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("Worker {0} is already running")]
    AlreadyRunning(String),

    #[error("Worker {name} is unavailable (status: {status})")]
    WorkerUnavailable { name: String, status: String },

    #[error("No worker provides capability {0}")]
    NoCapableWorker(String),

    #[error("Call {method} on worker {worker} timed out after {timeout_ms}ms")]
    Timeout {
        worker: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("Worker {worker} failed {method}: {message}")]
    CallFailed {
        worker: String,
        method: String,
        message: String,
    },

    #[error("Failed to spawn worker {name}: {reason}")]
    Spawn { name: String, reason: String },

    #[error("Workers not ready after {timeout_ms}ms: {}", .pending.join(", "))]
    NotReady {
        timeout_ms: u64,
        pending: Vec<String>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl PoolError {
    pub fn unavailable(name: impl Into<String>, status: impl Into<String>) -> Self {
        Self::WorkerUnavailable {
            name: name.into(),
            status: status.into(),
        }
    }

    /// No worker could take the call at all, as opposed to a call that
    /// reached a worker and failed.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::WorkerUnavailable { .. } | Self::NoCapableWorker(_) | Self::UnknownWorker(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
