use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Stage registry is empty")]
    EmptyRegistry,

    #[error("Stage registry declares no required stage")]
    NoRequiredStages,

    #[error("Duplicate stage id: {0}")]
    DuplicateStage(String),

    #[error("Stage {stage} depends on unknown stage {dependency}")]
    UnknownDependency { stage: String, dependency: String },

    #[error("Dependency cycle among stages: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("Invalid stage {stage}: {reason}")]
    InvalidStage { stage: String, reason: String },

    #[error("Invalid status transition for stage {stage} from {from} to {to}")]
    InvalidStageTransition {
        stage: String,
        from: String,
        to: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),
}

impl CoreError {
    /// Whether this error describes a malformed stage registry.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::EmptyRegistry
                | Self::NoRequiredStages
                | Self::DuplicateStage(_)
                | Self::UnknownDependency { .. }
                | Self::DependencyCycle(_)
                | Self::InvalidStage { .. }
        )
    }

    pub(crate) fn invalid_stage(stage: &str, reason: impl Into<String>) -> Self {
        Self::InvalidStage {
            stage: stage.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
