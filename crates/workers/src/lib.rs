//! Supervised pool of external worker processes.
//!
//! Workers are long-lived child processes speaking line-delimited JSON over
//! stdin/stdout. The pool owns their lifecycle (spawn, restart with backoff,
//! graceful stop) and correlates each request with its response by id.

pub mod correlation;
pub mod error;
pub mod launcher;
pub mod pool;
pub mod protocol;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use correlation::{CallResult, CorrelationTable};
pub use error::{PoolError, Result};
pub use launcher::{ProcessExit, ProcessLauncher, WorkerConnection, WorkerLauncher};
pub use pool::WorkerPool;
pub use protocol::{WorkerMessage, WorkerNotification, WorkerRequest, WorkerResponse};
pub use types::{PoolConfig, WorkerProcess, WorkerSpec, WorkerStatus};
