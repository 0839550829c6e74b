//! Application configuration, read from a single TOML file.

use std::path::{Path, PathBuf};

use insight_core::{CoreError, StageDefinition, StageRegistry};
use orchestrator::DEFAULT_FINISHED_RETENTION;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use workers::{PoolConfig, WorkerSpec};

pub const DEFAULT_CONFIG_FILE: &str = "insight-studio.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to encode configuration: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Registry(#[from] CoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Finished sessions kept in memory before the oldest are dropped
    pub session_retention: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            session_retention: DEFAULT_FINISHED_RETENTION,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub workers: Vec<WorkerSpec>,
    /// Empty means the built-in restaurant research pipeline
    pub stages: Vec<StageDefinition>,
}

impl AppConfig {
    /// Load configuration from `path`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(
            path = %path.display(),
            workers = config.workers.len(),
            stages = config.stages.len(),
            "Config loaded"
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the configuration, refusing to replace an existing file.
    pub async fn write_new(&self, path: &Path) -> Result<(), ConfigError> {
        if fs::try_exists(path).await.unwrap_or(false) {
            return Err(ConfigError::Invalid(format!(
                "{} already exists",
                path.display()
            )));
        }
        let content = self.to_toml()?;
        fs::write(path, content)
            .await
            .map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })
    }

    /// The configured stage registry, or the built-in one when none is configured.
    pub fn registry(&self) -> Result<StageRegistry, ConfigError> {
        if self.stages.is_empty() {
            return Ok(StageRegistry::restaurant_default());
        }
        Ok(StageRegistry::new(self.stages.clone())?)
    }

    /// Registry plus worker checks: unique worker names, non-empty commands.
    pub fn validate(&self) -> Result<StageRegistry, ConfigError> {
        let registry = self.registry()?;

        let mut seen = std::collections::HashSet::new();
        for worker in &self.workers {
            if worker.name.trim().is_empty() {
                return Err(ConfigError::Invalid("worker name must not be empty".into()));
            }
            if worker.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "worker {} has no command",
                    worker.name
                )));
            }
            if !seen.insert(worker.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate worker name: {}",
                    worker.name
                )));
            }
        }

        Ok(registry)
    }

    /// Capabilities required by the registry that no enabled worker declares.
    pub fn uncovered_capabilities(&self, registry: &StageRegistry) -> Vec<String> {
        registry
            .capabilities()
            .into_iter()
            .filter(|cap| {
                !self
                    .workers
                    .iter()
                    .any(|w| w.enabled && w.provides(cap))
            })
            .map(str::to_string)
            .collect()
    }

    /// Starting point written by `insight-studio init`: the built-in stages
    /// served by one reference worker.
    pub fn sample() -> Self {
        let registry = StageRegistry::restaurant_default();
        let capabilities: Vec<&str> = registry.capabilities();

        Self {
            workers: vec![WorkerSpec::new("analysis", "mock-analysis-worker")
                .capabilities(capabilities)],
            stages: registry.stages().to_vec(),
            ..Self::default()
        }
    }
}
