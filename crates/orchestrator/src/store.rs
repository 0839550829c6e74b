//! Registry of sessions: read snapshots plus the control flags the
//! orchestrator loop consults between stages.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use insight_core::WorkflowSession;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;
use utoipa::ToSchema;

use crate::error::{OrchestratorError, Result};

/// Completed, errored and cancelled sessions kept for inspection.
pub const DEFAULT_FINISHED_RETENTION: usize = 1000;

/// Flags set by pause/resume/cancel, read at scheduling decision points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ControlState {
    pub paused: bool,
    pub cancelled: bool,
}

struct SessionEntry {
    snapshot: WorkflowSession,
    control: watch::Sender<ControlState>,
    /// Handed to the one loop that drives the session
    receiver: Option<watch::Receiver<ControlState>>,
}

/// Sessions by id.
///
/// Sessions that have not finished are never dropped. Once more than
/// `retention` sessions are terminal, the ones that finished first are
/// evicted.
#[derive(Clone)]
pub struct SessionStore {
    entries: Arc<RwLock<HashMap<String, SessionEntry>>>,
    retention: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_retention(DEFAULT_FINISHED_RETENTION)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(max_finished: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            retention: max_finished,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, SessionEntry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SessionEntry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, session: WorkflowSession) -> Result<()> {
        let mut entries = self.write();
        if entries.contains_key(&session.session_id) {
            return Err(OrchestratorError::SessionExists(session.session_id));
        }

        let (control, receiver) = watch::channel(ControlState::default());
        entries.insert(
            session.session_id.clone(),
            SessionEntry {
                snapshot: session,
                control,
                receiver: Some(receiver),
            },
        );
        Ok(())
    }

    /// Replace the published snapshot of a session.
    pub fn update(&self, session: &WorkflowSession) {
        let mut entries = self.write();
        let Some(entry) = entries.get_mut(&session.session_id) else {
            return;
        };
        let finished = session.status.is_terminal() && !entry.snapshot.status.is_terminal();
        entry.snapshot = session.clone();
        if finished {
            evict_finished(&mut entries, self.retention);
        }
    }

    pub fn get(&self, session_id: &str) -> Option<WorkflowSession> {
        self.read().get(session_id).map(|e| e.snapshot.clone())
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<WorkflowSession> {
        let mut sessions: Vec<WorkflowSession> =
            self.read().values().map(|e| e.snapshot.clone()).collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn control(&self, session_id: &str) -> Option<ControlState> {
        self.read().get(session_id).map(|e| *e.control.borrow())
    }

    /// Apply `change` to the session's control flags and return them.
    pub fn set_control(
        &self,
        session_id: &str,
        change: impl FnOnce(&mut ControlState),
    ) -> Result<ControlState> {
        let entries = self.read();
        let entry = entries
            .get(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        entry.control.send_modify(change);
        let state = *entry.control.borrow();
        Ok(state)
    }

    /// Claim the control receiver for the loop driving this session.
    /// Only the first claim succeeds.
    pub fn claim(&self, session_id: &str) -> Result<watch::Receiver<ControlState>> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        entry.receiver.take().ok_or_else(|| {
            OrchestratorError::invalid_control(
                session_id,
                entry.snapshot.status.as_str(),
                "run",
            )
        })
    }
}

fn evict_finished(entries: &mut HashMap<String, SessionEntry>, retention: usize) {
    let mut finished: Vec<&WorkflowSession> = entries
        .values()
        .map(|e| &e.snapshot)
        .filter(|s| s.status.is_terminal())
        .collect();
    if finished.len() <= retention {
        return;
    }

    finished.sort_by(|a, b| {
        a.last_updated_at
            .cmp(&b.last_updated_at)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    let evicted: Vec<String> = finished[..finished.len() - retention]
        .iter()
        .map(|s| s.session_id.clone())
        .collect();
    for session_id in evicted {
        entries.remove(&session_id);
        debug!(session_id = %session_id, "Evicted finished session");
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.len())
            .field("retention", &self.retention)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insight_core::{SessionParameters, SessionStatus, StageRegistry};

    fn session(id: &str) -> WorkflowSession {
        WorkflowSession::new(
            id,
            SessionParameters::new("Bistro", "Lyon"),
            &StageRegistry::restaurant_default(),
        )
    }

    #[test]
    fn test_insert_and_get() {
        let store = SessionStore::new();
        store.insert(session("s-1")).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("s-1").unwrap().session_id, "s-1");
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let store = SessionStore::new();
        store.insert(session("s-1")).unwrap();
        assert!(matches!(
            store.insert(session("s-1")),
            Err(OrchestratorError::SessionExists(_))
        ));
    }

    #[test]
    fn test_update_replaces_snapshot() {
        let store = SessionStore::new();
        let mut s = session("s-1");
        store.insert(s.clone()).unwrap();

        s.set_status(SessionStatus::Running);
        store.update(&s);
        assert_eq!(store.get("s-1").unwrap().status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_control_flags_reach_claimed_receiver() {
        let store = SessionStore::new();
        store.insert(session("s-1")).unwrap();
        let mut rx = store.claim("s-1").unwrap();

        store.set_control("s-1", |c| c.paused = true).unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow().paused);

        // second claim is refused
        assert!(matches!(
            store.claim("s-1"),
            Err(OrchestratorError::InvalidControl { .. })
        ));
    }

    #[test]
    fn test_set_control_unknown_session() {
        let store = SessionStore::new();
        assert!(matches!(
            store.set_control("nope", |c| c.cancelled = true),
            Err(OrchestratorError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_oldest_finished_sessions_are_evicted() {
        let store = SessionStore::with_retention(2);
        let mut sessions: Vec<WorkflowSession> =
            ["s-1", "s-2", "s-3", "s-4"].iter().map(|id| session(id)).collect();
        for s in &sessions {
            store.insert(s.clone()).unwrap();
        }

        sessions[3].set_status(SessionStatus::Running);
        store.update(&sessions[3]);
        for (s, status) in sessions[..3].iter_mut().zip([
            SessionStatus::Completed,
            SessionStatus::Error,
            SessionStatus::Cancelled,
        ]) {
            s.set_status(status);
            store.update(s);
        }

        assert!(store.get("s-1").is_none());
        assert_eq!(store.get("s-2").unwrap().status, SessionStatus::Error);
        assert_eq!(store.get("s-3").unwrap().status, SessionStatus::Cancelled);
        // unfinished sessions are not counted against the cap
        assert_eq!(store.get("s-4").unwrap().status, SessionStatus::Running);
        assert_eq!(store.len(), 3);

        // a later update of a finished snapshot does not evict again
        store.update(&sessions[1]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_list_is_ordered_by_creation() {
        let store = SessionStore::new();
        store.insert(session("b")).unwrap();
        store.insert(session("a")).unwrap();
        let ids: Vec<String> = store.list().into_iter().map(|s| s.session_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()) && ids.contains(&"b".to_string()));
    }
}
