//! Line-delimited JSON spoken with worker processes.
//!
//! Requests go out as `{"id", "method", "params"}`. A worker answers with
//! `{"id", "result"}` or `{"id", "error"}`, and may emit unsolicited
//! notifications such as `{"event": "error", "message": "..."}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PoolError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl WorkerResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorPayload::Message(message.into())),
        }
    }

    /// A response carrying an `error` is a failure even if it also has a result.
    pub fn into_outcome(self) -> std::result::Result<Value, String> {
        match self.error {
            Some(error) => Err(error.into_message()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Workers report errors either as a bare string or as an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorPayload {
    Message(String),
    Detailed {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<Value>,
    },
}

impl ErrorPayload {
    pub fn message(&self) -> &str {
        match self {
            Self::Message(message) | Self::Detailed { message, .. } => message,
        }
    }

    pub fn into_message(self) -> String {
        match self {
            Self::Message(message) | Self::Detailed { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerNotification {
    /// The worker hit a runtime error it cannot recover from
    Error { message: String },
    Log {
        #[serde(default)]
        level: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Response(WorkerResponse),
    Notification(WorkerNotification),
}

pub fn encode_request(request: &WorkerRequest) -> Result<String> {
    serde_json::to_string(request)
        .map_err(|e| PoolError::Protocol(format!("cannot encode {}: {e}", request.method)))
}

pub fn parse_line(line: &str) -> Result<WorkerMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(PoolError::Protocol("empty line".to_string()));
    }
    serde_json::from_str(trimmed).map_err(|e| PoolError::Protocol(format!("{e}: {trimmed}")))
}
