//! Broadcast bus shared by the orchestrator, the worker pool and the
//! streaming endpoints.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::types::{Event, EventEnvelope, SessionUpdate};

const DEFAULT_CAPACITY: usize = 1000;

/// Fan-out of [`EventEnvelope`]s to any number of listeners.
///
/// Publishing never waits on subscribers. A subscriber that falls more than
/// `capacity` events behind loses the oldest ones and observes
/// `RecvError::Lagged` on its next receive.
///
/// Sequence numbers are assigned and sent under one lock, so every
/// subscriber receives envelopes in sequence order.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    next_sequence: Arc<Mutex<u64>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            next_sequence: Arc::new(Mutex::new(0)),
        }
    }

    fn sequence(&self) -> MutexGuard<'_, u64> {
        self.next_sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stamps the envelope with the next sequence number and sends it.
    ///
    /// Returns how many subscribers were listening; with none the envelope
    /// is dropped.
    pub fn publish(&self, mut envelope: EventEnvelope) -> usize {
        let mut next = self.sequence();
        envelope.sequence = *next;
        *next += 1;
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Wraps `event` in a fresh envelope and publishes it.
    pub fn emit(&self, event: Event) -> usize {
        self.publish(EventEnvelope::new(event))
    }

    /// Receives everything published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Receives the streaming records of a single session.
    pub fn subscribe_session(&self, session_id: impl Into<String>) -> SessionSubscription {
        SessionSubscription {
            session_id: session_id.into(),
            rx: self.sender.subscribe(),
            finished: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Total number of envelopes published so far.
    pub fn event_count(&self) -> u64 {
        *self.sequence()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("event_count", &self.event_count())
            .finish()
    }
}

/// Session-scoped view of the bus yielding [`SessionUpdate`] records.
///
/// Envelopes of other sessions and events without a streaming record are
/// skipped. After the final record of the session, `recv` reports
/// `RecvError::Closed`.
pub struct SessionSubscription {
    session_id: String,
    rx: broadcast::Receiver<EventEnvelope>,
    finished: bool,
}

impl SessionSubscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next record for this session. `Lagged` is passed through so the
    /// caller can decide whether a gap is acceptable.
    pub async fn recv(&mut self) -> Result<SessionUpdate, RecvError> {
        if self.finished {
            return Err(RecvError::Closed);
        }
        loop {
            let envelope = self.rx.recv().await?;
            if envelope.event.session_id() != Some(self.session_id.as_str()) {
                continue;
            }
            if let Some(update) = SessionUpdate::from_envelope(&envelope) {
                self.finished = update.is_final();
                return Ok(update);
            }
        }
    }
}
