//! Event types for the workflow event system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

const TERMINAL_SESSION_STATUSES: [&str; 3] = ["completed", "error", "cancelled"];

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// Bus-wide publication order, assigned by the bus
    #[serde(default)]
    pub sequence: u64,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            timestamp: Utc::now(),
            event,
        }
    }
}

/// All possible events in the system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Session events
    /// A workflow session was created from the stage registry
    #[serde(rename = "session.created")]
    SessionCreated {
        session_id: String,
        stage_ids: Vec<String>,
    },

    /// Session status changed (running, paused, terminal...)
    #[serde(rename = "session.status_changed")]
    SessionStatusChanged {
        session_id: String,
        from_status: String,
        to_status: String,
        overall_progress: u8,
        message: Option<String>,
    },

    /// A stage changed status or reported progress
    #[serde(rename = "stage.updated")]
    StageUpdated {
        session_id: String,
        stage_id: String,
        status: String,
        progress: u8,
        overall_progress: u8,
        message: Option<String>,
    },

    // Worker events
    /// Worker process changed status
    #[serde(rename = "worker.status_changed")]
    WorkerStatusChanged {
        worker: String,
        status: String,
        pid: Option<u32>,
        restart_attempts: u32,
        message: Option<String>,
    },

    /// Worker exhausted its restart budget and will not be restarted
    #[serde(rename = "worker.failed")]
    WorkerFailed {
        worker: String,
        restart_attempts: u32,
        message: String,
    },
}

impl Event {
    /// Get the session ID associated with this event, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Event::SessionCreated { session_id, .. }
            | Event::SessionStatusChanged { session_id, .. }
            | Event::StageUpdated { session_id, .. } => Some(session_id),
            Event::WorkerStatusChanged { .. } | Event::WorkerFailed { .. } => None,
        }
    }

    /// Get the worker name associated with this event, if any
    pub fn worker(&self) -> Option<&str> {
        match self {
            Event::WorkerStatusChanged { worker, .. } | Event::WorkerFailed { worker, .. } => {
                Some(worker)
            }
            _ => None,
        }
    }

    /// Wire name, matching the serde tag
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::SessionCreated { .. } => "session.created",
            Event::SessionStatusChanged { .. } => "session.status_changed",
            Event::StageUpdated { .. } => "stage.updated",
            Event::WorkerStatusChanged { .. } => "worker.status_changed",
            Event::WorkerFailed { .. } => "worker.failed",
        }
    }
}

/// One record of a session's update stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct SessionUpdate {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    /// Stage status for stage records, session status otherwise
    pub status: String,
    /// Stage progress for stage records, overall progress otherwise
    pub progress: u8,
    pub overall_progress: u8,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SessionUpdate {
    /// Project a session or stage event onto a stream record.
    pub fn from_envelope(envelope: &EventEnvelope) -> Option<Self> {
        match &envelope.event {
            Event::SessionStatusChanged {
                session_id,
                to_status,
                overall_progress,
                message,
                ..
            } => Some(Self {
                session_id: session_id.clone(),
                stage_id: None,
                status: to_status.clone(),
                progress: *overall_progress,
                overall_progress: *overall_progress,
                message: message.clone(),
                timestamp: envelope.timestamp,
            }),
            Event::StageUpdated {
                session_id,
                stage_id,
                status,
                progress,
                overall_progress,
                message,
            } => Some(Self {
                session_id: session_id.clone(),
                stage_id: Some(stage_id.clone()),
                status: status.clone(),
                progress: *progress,
                overall_progress: *overall_progress,
                message: message.clone(),
                timestamp: envelope.timestamp,
            }),
            _ => None,
        }
    }

    /// The record that closes a session's stream.
    pub fn is_final(&self) -> bool {
        self.stage_id.is_none() && TERMINAL_SESSION_STATUSES.contains(&self.status.as_str())
    }
}
