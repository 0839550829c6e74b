//! Relays session state changes onto the event bus.

use events::{Event, EventBus};
use insight_core::{SessionStatus, WorkflowSession};

/// Publishes one event per stage mutation and per session status change.
///
/// Publishing goes through a broadcast channel and never waits on
/// listeners; events from one session keep the order they were emitted in.
#[derive(Clone)]
pub struct UpdatePublisher {
    bus: EventBus,
}

impl UpdatePublisher {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    fn emit(&self, event: Event) {
        self.bus.emit(event);
    }

    pub fn session_created(&self, session: &WorkflowSession) {
        self.emit(Event::SessionCreated {
            session_id: session.session_id.clone(),
            stage_ids: session.stages.keys().cloned().collect(),
        });
    }

    pub fn session_status(
        &self,
        session: &WorkflowSession,
        from: SessionStatus,
        message: Option<String>,
    ) {
        self.emit(Event::SessionStatusChanged {
            session_id: session.session_id.clone(),
            from_status: from.as_str().to_string(),
            to_status: session.status.as_str().to_string(),
            overall_progress: session.overall_progress,
            message,
        });
    }

    pub fn stage_updated(&self, session: &WorkflowSession, stage_id: &str, message: Option<String>) {
        let Some(stage) = session.stage(stage_id) else {
            return;
        };
        self.emit(Event::StageUpdated {
            session_id: session.session_id.clone(),
            stage_id: stage_id.to_string(),
            status: stage.status.as_str().to_string(),
            progress: stage.progress,
            overall_progress: session.overall_progress,
            message,
        });
    }
}
