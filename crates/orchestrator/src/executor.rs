//! Stage execution: turning a stage definition into worker calls.

use std::time::Duration;

use async_trait::async_trait;
use insight_core::{StageArtifact, StageDefinition, StageInput};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use workers::{PoolError, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No running worker could take the call
    Unavailable,
    Timeout,
    /// The worker answered with an error
    Invocation,
    /// The worker answered, but with an unusable or negative result
    Rejected,
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct StageFailure {
    pub kind: FailureKind,
    pub worker: Option<String>,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            worker: None,
            message: message.into(),
        }
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind == FailureKind::Unavailable
    }

}

impl From<PoolError> for StageFailure {
    fn from(err: PoolError) -> Self {
        let kind = if err.is_unavailable() {
            FailureKind::Unavailable
        } else if err.is_timeout() {
            FailureKind::Timeout
        } else {
            FailureKind::Invocation
        };
        Self::new(kind, err.to_string())
    }
}

/// Channel for intermediate progress of a running stage.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<u8>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<u8>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, progress: u8) {
        let _ = self.tx.send(progress);
    }
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(
        &self,
        stage: &StageDefinition,
        input: &StageInput,
        progress: ProgressReporter,
    ) -> Result<StageArtifact, StageFailure>;
}

/// Runs stages on the worker pool.
///
/// Each call of a stage goes to the first worker declaring the stage's
/// capability that accepts it; workers that are not running are skipped.
/// After every call but the last, progress `done * 100 / calls` is
/// reported. The artifact maps each method to its result.
#[derive(Debug, Clone)]
pub struct PoolStageExecutor {
    pool: WorkerPool,
}

impl PoolStageExecutor {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }

    async fn call(
        &self,
        workers: &[String],
        method: &str,
        params: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value, StageFailure> {
        let mut unavailable = Vec::new();

        for worker in workers {
            match self.pool.invoke(worker, method, params.clone(), timeout).await {
                Ok(value) => return check_result(worker, method, value),
                Err(err) if err.is_unavailable() => {
                    tracing::debug!(worker = %worker, method, "Worker unavailable, trying next");
                    unavailable.push(worker.as_str());
                }
                Err(err) => return Err(StageFailure::from(err).with_worker(worker)),
            }
        }

        Err(StageFailure::new(
            FailureKind::Unavailable,
            format!(
                "no running worker for {method} (tried: {})",
                unavailable.join(", ")
            ),
        ))
    }
}

/// A worker may answer `{"success": false, "message": ...}` to decline.
fn check_result(worker: &str, method: &str, value: Value) -> Result<Value, StageFailure> {
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        let reason = value
            .get("message")
            .or_else(|| value.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("no reason given");
        return Err(StageFailure::new(
            FailureKind::Rejected,
            format!("{method} declined by {worker}: {reason}"),
        )
        .with_worker(worker));
    }
    Ok(value)
}

#[async_trait]
impl StageExecutor for PoolStageExecutor {
    async fn execute(
        &self,
        stage: &StageDefinition,
        input: &StageInput,
        progress: ProgressReporter,
    ) -> Result<StageArtifact, StageFailure> {
        let workers = self.pool.capable_workers(&stage.required_capability).await?;

        let params = serde_json::to_value(input)
            .map_err(|e| StageFailure::new(FailureKind::Rejected, format!("cannot encode input: {e}")))?;
        let timeout = stage.timeout_secs.map(Duration::from_secs);
        let total = stage.calls.len();
        let mut results = Map::new();

        for (index, method) in stage.calls.iter().enumerate() {
            let value = self.call(&workers, method, &params, timeout).await?;
            results.insert(method.clone(), value);

            let done = index + 1;
            if done < total {
                progress.report((done * 100 / total) as u8);
            }
        }

        Ok(StageArtifact::new(stage.id.clone(), Value::Object(results)))
    }
}
