use insight_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Invalid stage registry: {0}")]
    Configuration(#[source] CoreError),

    #[error("Invalid session parameters: {0}")]
    InvalidParameters(String),

    #[error("Cannot {action} session {session_id} while it is {status}")]
    InvalidControl {
        session_id: String,
        status: String,
        action: &'static str,
    },

    #[error("Stage state error: {0}")]
    StageState(#[source] CoreError),
}

impl OrchestratorError {
    pub fn invalid_control(
        session_id: impl Into<String>,
        status: impl Into<String>,
        action: &'static str,
    ) -> Self {
        Self::InvalidControl {
            session_id: session_id.into(),
            status: status.into(),
            action,
        }
    }
}

impl From<CoreError> for OrchestratorError {
    fn from(err: CoreError) -> Self {
        if err.is_configuration() {
            Self::Configuration(err)
        } else if matches!(err, CoreError::Validation(_)) {
            Self::InvalidParameters(err.to_string())
        } else {
            Self::StageState(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
