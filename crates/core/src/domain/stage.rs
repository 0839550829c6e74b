use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::error_record::Severity;
use super::session::SessionParameters;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema, Hash)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed or failed; neither ever changes again within a session.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Mutable per-session state of one stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct StageState {
    pub stage_id: String,
    pub status: StageStatus,
    /// 0-100
    pub progress: u8,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl StageState {
    pub fn new(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Pending,
            progress: 0,
            start_time: None,
            end_time: None,
            last_error: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(StageStatus::Pending, StageStatus::Running)?;
        self.start_time = Some(Utc::now());
        Ok(())
    }

    /// Intermediate progress while running. Values are kept below 100;
    /// only completion reports a full stage.
    pub fn report_progress(&mut self, progress: u8) -> Result<()> {
        if self.status != StageStatus::Running {
            return Err(self.invalid(StageStatus::Running));
        }
        self.progress = progress.min(99).max(self.progress);
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(StageStatus::Running, StageStatus::Completed)?;
        self.progress = 100;
        self.end_time = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(StageStatus::Running, StageStatus::Failed)?;
        self.last_error = Some(message.into());
        self.end_time = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, from: StageStatus, to: StageStatus) -> Result<()> {
        if self.status != from {
            return Err(self.invalid(to));
        }
        self.status = to;
        Ok(())
    }

    fn invalid(&self, to: StageStatus) -> CoreError {
        CoreError::InvalidStageTransition {
            stage: self.stage_id.clone(),
            from: self.status.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Gathers raw market data; takes only the session target as input
    Collection,
    /// Derives insights from upstream artifacts
    Analysis,
    /// Compiles upstream findings into a deliverable
    Report,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collection => "collection",
            Self::Analysis => "analysis",
            Self::Report => "report",
        }
    }

    /// Analysis and report stages have nothing to work on without upstream stages.
    pub fn requires_upstream(&self) -> bool {
        !matches!(self, Self::Collection)
    }
}

/// Static description of one stage, loaded once with the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct StageDefinition {
    pub id: String,
    pub kind: StageKind,
    /// Worker capability this stage needs
    #[serde(rename = "capability")]
    pub required_capability: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Worker methods invoked sequentially; progress is reported after each one
    pub calls: Vec<String>,
    #[serde(default)]
    pub severity: Severity,
    /// Overrides `severity` when no worker for the capability is running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailable_severity: Option<Severity>,
    /// Relative weight in overall progress, 1.0 when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Per-call timeout, the pool default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_required() -> bool {
    true
}

impl StageDefinition {
    pub fn new(id: impl Into<String>, kind: StageKind, capability: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            calls: vec![id.clone()],
            id,
            kind,
            required_capability: capability.into(),
            depends_on: Vec::new(),
            severity: Severity::default(),
            unavailable_severity: None,
            weight: None,
            required: true,
            timeout_secs: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn calls<I, S>(mut self, calls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.calls = calls.into_iter().map(Into::into).collect();
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn unavailable_severity(mut self, severity: Severity) -> Self {
        self.unavailable_severity = Some(severity);
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn effective_weight(&self) -> f64 {
        self.weight.unwrap_or(1.0)
    }

    /// Severity for a failure, `worker_unavailable` selecting the override.
    pub fn severity_for(&self, worker_unavailable: bool) -> Severity {
        if worker_unavailable {
            self.unavailable_severity.unwrap_or(self.severity)
        } else {
            self.severity
        }
    }

    /// Per-definition checks; cross-stage checks live in the registry.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::invalid_stage(&self.id, "id must not be empty"));
        }
        if self.required_capability.trim().is_empty() {
            return Err(CoreError::invalid_stage(&self.id, "capability must not be empty"));
        }
        if self.calls.is_empty() || self.calls.iter().any(|c| c.trim().is_empty()) {
            return Err(CoreError::invalid_stage(
                &self.id,
                "at least one non-empty call is required",
            ));
        }
        if let Some(weight) = self.weight {
            if !weight.is_finite() || weight <= 0.0 {
                return Err(CoreError::invalid_stage(&self.id, "weight must be positive"));
            }
        }
        if self.kind.requires_upstream() && self.depends_on.is_empty() {
            return Err(CoreError::invalid_stage(
                &self.id,
                format!("{} stages need at least one dependency", self.kind.as_str()),
            ));
        }
        if self.depends_on.iter().any(|d| d == &self.id) {
            return Err(CoreError::invalid_stage(&self.id, "stage depends on itself"));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.depends_on.iter().find(|d| !seen.insert(d.as_str())) {
            return Err(CoreError::invalid_stage(
                &self.id,
                format!("dependency {} listed twice", dup),
            ));
        }
        if self.timeout_secs == Some(0) {
            return Err(CoreError::invalid_stage(&self.id, "timeout must be positive"));
        }
        Ok(())
    }
}

/// Output of a completed stage, handed to its dependents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageArtifact {
    pub stage_id: String,
    pub data: serde_json::Value,
}

impl StageArtifact {
    pub fn new(stage_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            stage_id: stage_id.into(),
            data,
        }
    }
}

/// Typed payload sent to workers, one variant per stage kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageInput {
    Collection {
        target: SessionParameters,
    },
    Analysis {
        target: SessionParameters,
        upstream: Vec<StageArtifact>,
    },
    Report {
        target: SessionParameters,
        upstream: Vec<StageArtifact>,
    },
}

impl StageInput {
    pub fn build(kind: StageKind, target: SessionParameters, upstream: Vec<StageArtifact>) -> Self {
        match kind {
            StageKind::Collection => Self::Collection { target },
            StageKind::Analysis => Self::Analysis { target, upstream },
            StageKind::Report => Self::Report { target, upstream },
        }
    }

    pub fn kind(&self) -> StageKind {
        match self {
            Self::Collection { .. } => StageKind::Collection,
            Self::Analysis { .. } => StageKind::Analysis,
            Self::Report { .. } => StageKind::Report,
        }
    }

    pub fn target(&self) -> &SessionParameters {
        match self {
            Self::Collection { target }
            | Self::Analysis { target, .. }
            | Self::Report { target, .. } => target,
        }
    }

    pub fn upstream(&self) -> &[StageArtifact] {
        match self {
            Self::Collection { .. } => &[],
            Self::Analysis { upstream, .. } | Self::Report { upstream, .. } => upstream,
        }
    }
}
