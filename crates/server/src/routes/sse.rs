use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use events::{EventEnvelope, SessionUpdate};
use futures::stream::{self, Stream, StreamExt};
use insight_core::WorkflowSession;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::BroadcastStream;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub const DEFAULT_REPLAY_CAPACITY: usize = 1000;
pub const SSE_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize, IntoParams)]
pub struct EventsQuery {
    /// Comma-separated session ids; events of other sessions are skipped
    pub session_ids: Option<String>,
}

/// Bounded history of published envelopes for `Last-Event-ID` replay.
///
/// Envelopes are kept in publication order; once `capacity` is reached the
/// oldest is evicted.
pub struct ReplayBuffer {
    envelopes: VecDeque<EventEnvelope>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            envelopes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, envelope: EventEnvelope) {
        while self.envelopes.len() >= self.capacity.max(1) {
            self.envelopes.pop_front();
        }
        self.envelopes.push_back(envelope);
    }

    /// Envelopes published after `last_seen` that pass the session filter.
    ///
    /// An id that was never seen or was already evicted yields nothing,
    /// since the gap cannot be reconstructed.
    pub fn replay_after(&self, last_seen: Uuid, session_ids: Option<&[String]>) -> Vec<EventEnvelope> {
        let Some(position) = self.envelopes.iter().position(|e| e.id == last_seen) else {
            return Vec::new();
        };
        self.envelopes
            .iter()
            .skip(position + 1)
            .filter(|e| session_filter_allows(session_ids, e))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

pub type SharedReplayBuffer = Arc<RwLock<ReplayBuffer>>;

fn parse_session_ids(session_ids: Option<&str>) -> Option<Vec<String>> {
    session_ids.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    })
}

/// Events without a session id (worker, system) always pass.
fn session_filter_allows(session_ids: Option<&[String]>, envelope: &EventEnvelope) -> bool {
    match (session_ids, envelope.event.session_id()) {
        (Some(ids), Some(session_id)) => ids.iter().any(|id| id == session_id),
        _ => true,
    }
}

fn envelope_to_sse_event(envelope: &EventEnvelope) -> Result<Event, Infallible> {
    let data = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());

    Ok(Event::default()
        .id(envelope.id.to_string())
        .event(envelope.event.event_type())
        .data(data))
}

fn update_to_sse_event(update: &SessionUpdate) -> Result<Event, Infallible> {
    let data = serde_json::to_string(update).unwrap_or_else(|_| "{}".to_string());
    let event_type = if update.stage_id.is_some() {
        "stage"
    } else {
        "session"
    };

    Ok(Event::default().event(event_type).data(data))
}

fn snapshot_record(session: &WorkflowSession) -> SessionUpdate {
    SessionUpdate {
        session_id: session.session_id.clone(),
        stage_id: None,
        status: session.status.as_str().to_string(),
        progress: session.overall_progress,
        overall_progress: session.overall_progress,
        message: None,
        timestamp: session.last_updated_at,
    }
}

#[utoipa::path(
    get,
    path = "/api/events",
    params(EventsQuery),
    responses(
        (status = 200, description = "SSE stream of every event envelope"),
    ),
    tag = "events"
)]
pub async fn events_stream(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    headers: axum::http::HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_ids = parse_session_ids(query.session_ids.as_deref());
    let last_event_id = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<Uuid>().ok());

    let rx = state.event_bus.subscribe();

    let replayed = match last_event_id {
        Some(last_seen) => state
            .replay_buffer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replay_after(last_seen, session_ids.as_deref()),
        None => Vec::new(),
    };
    let missed_stream = stream::iter(replayed.into_iter().map(|e| envelope_to_sse_event(&e)));

    let live_stream = BroadcastStream::new(rx).filter_map(move |result| {
        let session_ids = session_ids.clone();

        async move {
            match result {
                Ok(envelope) => {
                    if !session_filter_allows(session_ids.as_deref(), &envelope) {
                        return None;
                    }
                    Some(envelope_to_sse_event(&envelope))
                }
                Err(e) => {
                    tracing::warn!("SSE broadcast error: {:?}", e);
                    None
                }
            }
        }
    });

    let stream = missed_stream.chain(live_stream);

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    )
}

#[utoipa::path(
    get,
    path = "/api/sessions/{id}/stream",
    params(
        ("id" = String, Path, description = "Session ID"),
    ),
    responses(
        (status = 200, description = "SSE stream of session update records, closed after the terminal record", body = SessionUpdate),
        (status = 404, description = "Session not found"),
    ),
    tag = "sessions"
)]
pub async fn session_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    // subscribe before reading the snapshot so no transition falls between them
    let subscription = state.event_bus.subscribe_session(id.clone());
    let session = state.orchestrator.session(&id)?;
    let snapshot = snapshot_record(&session);

    let live = if snapshot.is_final() {
        stream::empty().boxed()
    } else {
        stream::unfold(subscription, |mut subscription| async move {
            loop {
                match subscription.recv().await {
                    Ok(update) => return Some((update, subscription)),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(
                            session_id = %subscription.session_id(),
                            missed,
                            "Session stream lagged"
                        );
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    };

    let updates = stream::once(async move { snapshot })
        .chain(live)
        .map(|update| update_to_sse_event(&update));

    Ok(Sse::new(updates).keep_alive(
        KeepAlive::new()
            .interval(SSE_KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    ))
}
