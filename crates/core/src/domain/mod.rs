mod error_record;
mod registry;
mod session;
mod stage;

pub use error_record::{ErrorRecord, Severity};
pub use registry::StageRegistry;
pub use session::{SessionParameters, SessionStatus, WorkflowSession};
pub use stage::{StageArtifact, StageDefinition, StageInput, StageKind, StageState, StageStatus};
