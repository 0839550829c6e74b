use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, ToSchema,
)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    #[default]
    High,
    /// Terminates the whole session on first occurrence.
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

/// One entry of a session's append-only error log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ErrorRecord {
    /// Stage id or worker name the failure is attributed to
    pub stage_or_worker: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(
        stage_or_worker: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            stage_or_worker: stage_or_worker.into(),
            message: message.into(),
            severity,
            timestamp: Utc::now(),
        }
    }
}
