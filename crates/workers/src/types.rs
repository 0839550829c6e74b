use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    /// Failed unexpectedly; a supervised restart may be pending
    Error,
    #[default]
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    /// Starting or running: a live process belongs to the worker.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

/// Static definition of a worker, usually read from configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct WorkerSpec {
    pub name: String,
    /// Executable to launch
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            capabilities: Vec::new(),
            enabled: true,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn provides(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Observable state of one worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct WorkerProcess {
    pub name: String,
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub capabilities: Vec<String>,
    pub restart_attempts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl WorkerProcess {
    pub(crate) fn from_spec(spec: &WorkerSpec) -> Self {
        Self {
            name: spec.name.clone(),
            status: WorkerStatus::Stopped,
            pid: None,
            capabilities: spec.capabilities.clone(),
            restart_attempts: 0,
            last_error: None,
            started_at: None,
        }
    }
}

/// Supervision tunables. Durations are whole seconds in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct PoolConfig {
    /// Restart n waits `n * base_restart_delay_secs`
    pub base_restart_delay_secs: u64,
    pub max_restart_attempts: u32,
    /// How long a stopping worker may take to exit after stdin closes
    pub stop_grace_period_secs: u64,
    pub default_call_timeout_secs: u64,
    pub readiness_timeout_secs: u64,
    /// Uptime after which a restarted worker's attempt counter is cleared
    pub stability_window_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_restart_delay_secs: 5,
            max_restart_attempts: 3,
            stop_grace_period_secs: 5,
            default_call_timeout_secs: 30,
            readiness_timeout_secs: 30,
            stability_window_secs: 30,
        }
    }
}

impl PoolConfig {
    pub fn restart_delay(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.base_restart_delay_secs.saturating_mul(u64::from(attempt)))
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    pub fn default_call_timeout(&self) -> Duration {
        Duration::from_secs(self.default_call_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_secs(self.stability_window_secs)
    }
}
