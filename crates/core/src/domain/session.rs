use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::error_record::ErrorRecord;
use super::registry::StageRegistry;
use super::stage::StageState;
use crate::error::{CoreError, Result};

const DEFAULT_RADIUS_KM: f64 = 5.0;
const DEFAULT_COMPETITOR_LIMIT: u32 = 10;
const MAX_COMPETITOR_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema, Hash)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

/// What a research session is about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct SessionParameters {
    /// Restaurant (or concept) under study
    pub restaurant: String,
    /// City or address the market is centred on
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuisine: Option<String>,
    #[serde(default = "default_radius_km")]
    pub radius_km: f64,
    #[serde(default = "default_competitor_limit")]
    pub competitor_limit: u32,
}

fn default_radius_km() -> f64 {
    DEFAULT_RADIUS_KM
}

fn default_competitor_limit() -> u32 {
    DEFAULT_COMPETITOR_LIMIT
}

impl SessionParameters {
    pub fn new(restaurant: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            restaurant: restaurant.into(),
            location: location.into(),
            cuisine: None,
            radius_km: DEFAULT_RADIUS_KM,
            competitor_limit: DEFAULT_COMPETITOR_LIMIT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.restaurant.trim().is_empty() {
            return Err(CoreError::Validation("restaurant must not be empty".into()));
        }
        if self.location.trim().is_empty() {
            return Err(CoreError::Validation("location must not be empty".into()));
        }
        if !self.radius_km.is_finite() || self.radius_km <= 0.0 {
            return Err(CoreError::Validation("radius_km must be positive".into()));
        }
        if self.competitor_limit == 0 || self.competitor_limit > MAX_COMPETITOR_LIMIT {
            return Err(CoreError::Validation(format!(
                "competitor_limit must be between 1 and {}",
                MAX_COMPETITOR_LIMIT
            )));
        }
        Ok(())
    }
}

/// State of one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct WorkflowSession {
    pub session_id: String,
    pub status: SessionStatus,
    pub parameters: SessionParameters,
    /// Keys fixed at creation from the registry
    pub stages: BTreeMap<String, StageState>,
    /// 0-100, derived from `stages`
    pub overall_progress: u8,
    pub errors: Vec<ErrorRecord>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl WorkflowSession {
    pub fn new(
        session_id: impl Into<String>,
        parameters: SessionParameters,
        registry: &StageRegistry,
    ) -> Self {
        let now = Utc::now();
        let stages = registry
            .stages()
            .iter()
            .map(|def| (def.id.clone(), StageState::new(def.id.clone())))
            .collect();

        Self {
            session_id: session_id.into(),
            status: SessionStatus::Idle,
            parameters,
            stages,
            overall_progress: 0,
            errors: Vec::new(),
            created_at: now,
            last_updated_at: now,
        }
    }

    pub fn stage(&self, stage_id: &str) -> Option<&StageState> {
        self.stages.get(stage_id)
    }

    pub fn stage_mut(&mut self, stage_id: &str) -> Option<&mut StageState> {
        self.stages.get_mut(stage_id)
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.touch();
    }

    pub fn record_error(&mut self, record: ErrorRecord) {
        self.errors.push(record);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }

    /// Weighted average of required stage progress.
    ///
    /// Finished stages (completed or failed) count in full. The result is
    /// 100 only once the session has settled as completed or error with
    /// every required stage finished; otherwise it is capped at 99.
    pub fn compute_overall_progress(&self, registry: &StageRegistry) -> u8 {
        let mut total_weight = 0.0;
        let mut weighted = 0.0;
        let mut all_finished = true;

        for def in registry.required_stages() {
            let weight = def.effective_weight();
            total_weight += weight;
            match self.stages.get(&def.id) {
                Some(state) if state.status.is_finished() => weighted += weight * 100.0,
                Some(state) => {
                    all_finished = false;
                    weighted += weight * f64::from(state.progress);
                }
                None => all_finished = false,
            }
        }

        let settled = matches!(self.status, SessionStatus::Completed | SessionStatus::Error);
        if all_finished && settled {
            return 100;
        }
        if total_weight <= 0.0 {
            return 0;
        }

        (weighted / total_weight).floor().clamp(0.0, 99.0) as u8
    }

    pub fn recompute_progress(&mut self, registry: &StageRegistry) {
        self.overall_progress = self.compute_overall_progress(registry);
        self.touch();
    }
}
