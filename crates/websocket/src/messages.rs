use serde::{Deserialize, Serialize};

use events::EventEnvelope;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { filter: Option<SubscriptionFilter> },
    Unsubscribe,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Event { envelope: EventEnvelope },
    Subscribed { filter: Option<SubscriptionFilter> },
    Unsubscribed,
    /// Events dropped because this client fell behind the bus
    Lagged { missed: u64 },
    Pong,
    Error { message: String },
}

/// Narrows the relayed events. Every field left unset matches everything.
///
/// `session_ids` only constrains session events and `workers` only
/// constrains worker events, so a client watching one session still sees
/// pool and system events unless it also sets `event_types`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub session_ids: Option<Vec<String>>,
    #[serde(default)]
    pub workers: Option<Vec<String>>,
    /// Event type names such as `stage.updated`
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
}

impl SubscriptionFilter {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self::for_sessions(vec![session_id.into()])
    }

    pub fn for_sessions(session_ids: Vec<String>) -> Self {
        Self {
            session_ids: Some(session_ids),
            ..Self::default()
        }
    }

    pub fn for_worker(worker: impl Into<String>) -> Self {
        Self {
            workers: Some(vec![worker.into()]),
            ..Self::default()
        }
    }

    pub fn with_event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        let event = &envelope.event;

        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let (Some(ids), Some(session_id)) = (&self.session_ids, event.session_id()) {
            if !ids.iter().any(|id| id == session_id) {
                return false;
            }
        }

        if let (Some(names), Some(worker)) = (&self.workers, event.worker()) {
            if !names.iter().any(|name| name == worker) {
                return false;
            }
        }

        true
    }
}
