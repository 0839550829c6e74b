pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod publisher;
pub mod store;

pub use error::{OrchestratorError, Result};
pub use executor::{FailureKind, PoolStageExecutor, ProgressReporter, StageExecutor, StageFailure};
pub use orchestrator::Orchestrator;
pub use publisher::UpdatePublisher;
pub use store::{ControlState, SessionStore, DEFAULT_FINISHED_RETENTION};
