//! The supervisor loop that drives a session through its stages.
//!
//! Stages run one at a time. At every decision point the loop checks the
//! cancel flag, then the pause flag, then picks the first pending stage (in
//! registry declaration order) whose dependencies have all completed. A
//! session ends completed when no stage is runnable and every required stage
//! completed, and in error when it is stuck otherwise or a critical failure
//! occurs. Pause and cancel never interrupt a stage that is already running.

use std::collections::HashMap;
use std::sync::Arc;

use events::EventBus;
use insight_core::{
    CoreError, ErrorRecord, SessionParameters, SessionStatus, Severity, StageArtifact,
    StageDefinition, StageInput, StageRegistry, StageState, StageStatus, WorkflowSession,
};
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::executor::{ProgressReporter, StageExecutor};
use crate::publisher::UpdatePublisher;
use crate::store::{ControlState, SessionStore};

#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<StageRegistry>,
    executor: Arc<dyn StageExecutor>,
    store: SessionStore,
    publisher: UpdatePublisher,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<StageRegistry>,
        executor: Arc<dyn StageExecutor>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            registry,
            executor,
            store: SessionStore::new(),
            publisher: UpdatePublisher::new(event_bus),
        }
    }

    /// Keep at most `max_finished` terminal sessions. Call before any
    /// session is created.
    pub fn with_session_retention(mut self, max_finished: usize) -> Self {
        self.store = SessionStore::with_retention(max_finished);
        self
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Build an idle session with every stage pending.
    ///
    /// Rejects malformed registries and parameters before anything runs.
    /// A fresh UUID is used when no id is given.
    pub fn create_session(
        &self,
        session_id: Option<String>,
        parameters: SessionParameters,
    ) -> Result<WorkflowSession> {
        self.registry
            .validate()
            .map_err(OrchestratorError::Configuration)?;
        parameters
            .validate()
            .map_err(|e| OrchestratorError::InvalidParameters(e.to_string()))?;

        let session_id = match session_id {
            Some(id) if id.trim().is_empty() => {
                return Err(OrchestratorError::InvalidParameters(
                    "session id must not be empty".to_string(),
                ))
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        let session = WorkflowSession::new(session_id, parameters, &self.registry);
        self.store.insert(session.clone())?;
        self.publisher.session_created(&session);
        info!(session_id = %session.session_id, stages = session.stages.len(), "Session created");

        Ok(session)
    }

    /// Create a session and drive it in the background.
    ///
    /// Returns once the session is running.
    pub async fn start(
        &self,
        session_id: Option<String>,
        parameters: SessionParameters,
    ) -> Result<WorkflowSession> {
        let session = self.create_session(session_id, parameters)?;
        let control = self.store.claim(&session.session_id)?;
        let session = self.begin(session);
        let snapshot = session.clone();

        // the outer task outlives a panicking driver and closes the session
        let orchestrator = self.clone();
        let session_id = session.session_id.clone();
        tokio::spawn(async move {
            let driver = orchestrator.clone();
            let driving = tokio::spawn(async move { driver.drive(session, control).await });
            if let Err(e) = driving.await {
                orchestrator.abandon(&session_id, e);
            }
        });

        Ok(snapshot)
    }

    /// Drive an idle session to a terminal state and return it.
    pub async fn run(&self, session_id: &str) -> Result<WorkflowSession> {
        let session = self
            .store
            .get(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        if session.status != SessionStatus::Idle {
            return Err(OrchestratorError::invalid_control(
                session_id,
                session.status.as_str(),
                "run",
            ));
        }

        let control = self.store.claim(session_id)?;
        let session = self.begin(session);
        Ok(self.drive(session, control).await)
    }

    pub fn pause(&self, session_id: &str) -> Result<ControlState> {
        self.ensure_active(session_id, "pause")?;
        info!(session_id, "Pause requested");
        self.store.set_control(session_id, |c| c.paused = true)
    }

    /// Clear the pause flag. A session that is not paused is left alone.
    pub fn resume(&self, session_id: &str) -> Result<ControlState> {
        self.ensure_active(session_id, "resume")?;
        let control = self
            .store
            .control(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))?;
        if !control.paused {
            debug!(session_id, "Resume ignored, session not paused");
            return Ok(control);
        }
        info!(session_id, "Resume requested");
        self.store.set_control(session_id, |c| c.paused = false)
    }

    pub fn cancel(&self, session_id: &str) -> Result<ControlState> {
        self.ensure_active(session_id, "cancel")?;
        info!(session_id, "Cancel requested");
        self.store.set_control(session_id, |c| c.cancelled = true)
    }

    /// Request cancellation of every session that has not finished.
    pub fn cancel_all(&self) -> usize {
        let active: Vec<String> = self
            .store
            .list()
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.session_id)
            .collect();
        for session_id in &active {
            let _ = self.store.set_control(session_id, |c| c.cancelled = true);
        }
        active.len()
    }

    pub fn session(&self, session_id: &str) -> Result<WorkflowSession> {
        self.store
            .get(session_id)
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.to_string()))
    }

    pub fn sessions(&self) -> Vec<WorkflowSession> {
        self.store.list()
    }

    fn ensure_active(&self, session_id: &str, action: &'static str) -> Result<()> {
        let session = self.session(session_id)?;
        if session.status.is_terminal() {
            return Err(OrchestratorError::invalid_control(
                session_id,
                session.status.as_str(),
                action,
            ));
        }
        Ok(())
    }

    fn begin(&self, mut session: WorkflowSession) -> WorkflowSession {
        self.transition(&mut session, SessionStatus::Running, None);
        session
    }

    async fn drive(
        &self,
        mut session: WorkflowSession,
        control: watch::Receiver<ControlState>,
    ) -> WorkflowSession {
        if let Err(e) = self.schedule(&mut session, control).await {
            warn!(session_id = %session.session_id, "Session aborted: {}", e);
            session.record_error(ErrorRecord::new(
                "orchestrator",
                e.to_string(),
                Severity::Critical,
            ));
            self.transition(&mut session, SessionStatus::Error, Some(e.to_string()));
        }
        session
    }

    /// The task driving a session died before the session finished: fail
    /// the stage it was running and end the session in error.
    fn abandon(&self, session_id: &str, err: JoinError) {
        let Some(mut session) = self.store.get(session_id) else {
            return;
        };
        if session.status.is_terminal() {
            return;
        }
        let message = if err.is_panic() {
            "stage execution panicked"
        } else {
            "session task was cancelled"
        };
        error!(session_id, "Session driver died: {}", err);

        let running: Vec<String> = session
            .stages
            .iter()
            .filter(|(_, stage)| stage.status == StageStatus::Running)
            .map(|(stage_id, _)| stage_id.clone())
            .collect();
        for stage_id in running {
            if let Some(stage) = session.stage_mut(&stage_id) {
                let _ = stage.fail(message);
            }
            self.stage_changed(&mut session, &stage_id, Some(message.to_string()));
        }

        session.record_error(ErrorRecord::new("orchestrator", message, Severity::Critical));
        self.transition(&mut session, SessionStatus::Error, Some(message.to_string()));
    }

    async fn schedule(
        &self,
        session: &mut WorkflowSession,
        mut control: watch::Receiver<ControlState>,
    ) -> Result<()> {
        // completed stages hand their output to dependents
        let mut artifacts: HashMap<String, StageArtifact> = HashMap::new();

        loop {
            let flags = *control.borrow_and_update();

            if flags.cancelled {
                self.transition(session, SessionStatus::Cancelled, Some("cancelled".into()));
                return Ok(());
            }

            if flags.paused {
                self.transition(session, SessionStatus::Paused, None);
                let resumed = control
                    .wait_for(|c| !c.paused || c.cancelled)
                    .await
                    .map(|c| *c);
                match resumed {
                    Ok(flags) if flags.cancelled => continue,
                    Ok(_) => {
                        self.transition(session, SessionStatus::Running, Some("resumed".into()));
                        continue;
                    }
                    Err(_) => {
                        // control channel gone: nobody can resume this session
                        self.transition(
                            session,
                            SessionStatus::Cancelled,
                            Some("control channel closed".into()),
                        );
                        return Ok(());
                    }
                }
            }

            let Some(stage) = self.next_runnable(session) else {
                let all_completed = self.registry.required_stages().all(|def| {
                    session
                        .stage(&def.id)
                        .is_some_and(|s| s.status == StageStatus::Completed)
                });
                if all_completed {
                    self.transition(session, SessionStatus::Completed, None);
                } else {
                    let message = "no runnable stage remains".to_string();
                    self.transition(session, SessionStatus::Error, Some(message));
                }
                return Ok(());
            };

            let critical = self.execute_stage(session, stage, &mut artifacts).await?;
            if critical {
                return Ok(());
            }
        }
    }

    /// First pending stage, in declaration order, whose dependencies all completed.
    fn next_runnable<'a>(&'a self, session: &WorkflowSession) -> Option<&'a StageDefinition> {
        self.registry.stages().iter().find(|def| {
            session
                .stage(&def.id)
                .is_some_and(|s| s.status == StageStatus::Pending)
                && def.depends_on.iter().all(|dep| {
                    session
                        .stage(dep)
                        .is_some_and(|s| s.status == StageStatus::Completed)
                })
        })
    }

    /// Run one stage to its outcome. Returns true when a critical failure
    /// ended the session.
    async fn execute_stage(
        &self,
        session: &mut WorkflowSession,
        def: &StageDefinition,
        artifacts: &mut HashMap<String, StageArtifact>,
    ) -> Result<bool> {
        let stage_id = def.id.as_str();
        self.stage_mut(session, stage_id)?.start()?;
        self.stage_changed(session, stage_id, None);
        info!(session_id = %session.session_id, stage_id, "Stage started");

        let upstream = def
            .depends_on
            .iter()
            .filter_map(|dep| artifacts.get(dep).cloned())
            .collect();
        let input = StageInput::build(def.kind, session.parameters.clone(), upstream);

        let (reporter, mut progress) = ProgressReporter::channel();
        let execution = self.executor.execute(def, &input, reporter);
        tokio::pin!(execution);

        let outcome = loop {
            tokio::select! {
                outcome = &mut execution => break outcome,
                Some(value) = progress.recv() => {
                    self.apply_progress(session, stage_id, value)?;
                }
            }
        };
        while let Ok(value) = progress.try_recv() {
            self.apply_progress(session, stage_id, value)?;
        }

        match outcome {
            Ok(artifact) => {
                self.stage_mut(session, stage_id)?.complete()?;
                artifacts.insert(def.id.clone(), artifact);
                self.stage_changed(session, stage_id, None);
                info!(session_id = %session.session_id, stage_id, "Stage completed");
                Ok(false)
            }
            Err(failure) => {
                let severity = def.severity_for(failure.is_unavailable());
                let attributed = failure.worker.clone().unwrap_or_else(|| def.id.clone());
                warn!(
                    session_id = %session.session_id,
                    stage_id,
                    worker = %attributed,
                    severity = severity.as_str(),
                    "Stage failed: {}",
                    failure.message
                );

                self.stage_mut(session, stage_id)?.fail(failure.message.clone())?;
                session.record_error(ErrorRecord::new(
                    def.id.clone(),
                    failure.message.clone(),
                    severity,
                ));
                self.stage_changed(session, stage_id, Some(failure.message.clone()));

                if severity.is_critical() {
                    let message = format!("critical failure in {stage_id}: {}", failure.message);
                    self.transition(session, SessionStatus::Error, Some(message));
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }

    fn apply_progress(&self, session: &mut WorkflowSession, stage_id: &str, value: u8) -> Result<()> {
        self.stage_mut(session, stage_id)?.report_progress(value)?;
        self.stage_changed(session, stage_id, None);
        debug!(session_id = %session.session_id, stage_id, progress = value, "Stage progress");
        Ok(())
    }

    fn stage_mut<'s>(
        &self,
        session: &'s mut WorkflowSession,
        stage_id: &str,
    ) -> Result<&'s mut StageState> {
        let session_id = session.session_id.clone();
        session.stage_mut(stage_id).ok_or_else(|| {
            OrchestratorError::StageState(CoreError::Validation(format!(
                "session {session_id} has no stage {stage_id}"
            )))
        })
    }

    fn stage_changed(&self, session: &mut WorkflowSession, stage_id: &str, message: Option<String>) {
        session.recompute_progress(&self.registry);
        self.store.update(session);
        self.publisher.stage_updated(session, stage_id, message);
    }

    fn transition(&self, session: &mut WorkflowSession, to: SessionStatus, message: Option<String>) {
        let from = session.status;
        if from == to {
            return;
        }
        session.set_status(to);
        session.recompute_progress(&self.registry);
        self.store.update(session);
        self.publisher.session_status(session, from, message);
        info!(
            session_id = %session.session_id,
            from = from.as_str(),
            to = to.as_str(),
            progress = session.overall_progress,
            "Session status changed"
        );
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stages", &self.registry.len())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{FailureKind, PoolStageExecutor, StageFailure};
    use async_trait::async_trait;
    use events::{Event, EventEnvelope};
    use insight_core::StageKind;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::{broadcast, Notify};
    use workers::testing::FakeLauncher;
    use workers::{PoolConfig, WorkerPool, WorkerSpec};

    #[derive(Clone)]
    enum Script {
        Fail(FailureKind, &'static str),
        Progress(Vec<u8>),
        /// Signals `entered`, then waits for `release` before succeeding
        Gate {
            entered: Arc<Notify>,
            release: Arc<Notify>,
        },
        Panic,
    }

    #[derive(Default)]
    struct ScriptedExecutor {
        scripts: HashMap<String, Script>,
        started: Mutex<Vec<String>>,
        upstream: Mutex<HashMap<String, Vec<String>>>,
    }

    impl ScriptedExecutor {
        fn script(mut self, stage_id: &str, script: Script) -> Self {
            self.scripts.insert(stage_id.to_string(), script);
            self
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }

        fn upstream_of(&self, stage_id: &str) -> Vec<String> {
            self.upstream
                .lock()
                .unwrap()
                .get(stage_id)
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl StageExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            stage: &StageDefinition,
            input: &StageInput,
            progress: ProgressReporter,
        ) -> std::result::Result<StageArtifact, StageFailure> {
            self.started.lock().unwrap().push(stage.id.clone());
            self.upstream.lock().unwrap().insert(
                stage.id.clone(),
                input.upstream().iter().map(|a| a.stage_id.clone()).collect(),
            );

            match self.scripts.get(&stage.id).cloned() {
                Some(Script::Fail(kind, message)) => {
                    return Err(StageFailure::new(kind, message).with_worker("scripted"))
                }
                Some(Script::Progress(values)) => {
                    for value in values {
                        progress.report(value);
                    }
                }
                Some(Script::Gate { entered, release }) => {
                    entered.notify_one();
                    release.notified().await;
                }
                Some(Script::Panic) => panic!("executor bug in {}", stage.id),
                None => {}
            }
            Ok(StageArtifact::new(stage.id.clone(), json!({"stage": stage.id})))
        }
    }

    fn three_stages() -> StageRegistry {
        StageRegistry::new(vec![
            StageDefinition::new("a", StageKind::Collection, "scraping"),
            StageDefinition::new("b", StageKind::Analysis, "menu").depends_on(["a"]),
            StageDefinition::new("c", StageKind::Analysis, "pricing").depends_on(["a"]),
        ])
        .unwrap()
    }

    fn params() -> SessionParameters {
        SessionParameters::new("Bistro", "Lyon")
    }

    fn orchestrator(registry: StageRegistry, executor: Arc<ScriptedExecutor>) -> (Orchestrator, EventBus) {
        let bus = EventBus::with_capacity(1024);
        let orchestrator = Orchestrator::new(Arc::new(registry), executor, bus.clone());
        (orchestrator, bus)
    }

    fn drain(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            events.push(envelope.event);
        }
        events
    }

    async fn wait_for_status(rx: &mut broadcast::Receiver<EventEnvelope>, status: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let envelope = rx.recv().await.unwrap();
                if let Event::SessionStatusChanged { to_status, .. } = &envelope.event {
                    if to_status == status {
                        return;
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("session never reached {status}"));
    }

    #[tokio::test]
    async fn test_happy_path_completes_with_full_progress() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (orchestrator, bus) = orchestrator(StageRegistry::restaurant_default(), executor.clone());
        let mut rx = bus.subscribe();

        orchestrator.create_session(Some("s-1".into()), params()).unwrap();
        let session = orchestrator.run("s-1").await.unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.overall_progress, 100);
        assert!(session.errors.is_empty());
        assert!(session
            .stages
            .values()
            .all(|s| s.status == StageStatus::Completed && s.progress == 100));
        assert_eq!(
            executor.started(),
            vec![
                "data_collection",
                "menu_analysis",
                "pricing_analysis",
                "sentiment_analysis",
                "competitor_report"
            ]
        );
        assert_eq!(
            executor.upstream_of("competitor_report"),
            vec!["menu_analysis", "pricing_analysis", "sentiment_analysis"]
        );

        let events = drain(&mut rx);
        assert_eq!(events.first().unwrap().event_type(), "session.created");
        match events.last().unwrap() {
            Event::SessionStatusChanged {
                from_status,
                to_status,
                overall_progress,
                ..
            } => {
                assert_eq!(from_status, "running");
                assert_eq!(to_status, "completed");
                assert_eq!(*overall_progress, 100);
            }
            other => panic!("unexpected final event {other:?}"),
        }
        // every stage reported running then completed
        let stage_events = events
            .iter()
            .filter(|e| e.event_type() == "stage.updated")
            .count();
        assert_eq!(stage_events, 10);
        assert_eq!(orchestrator.session("s-1").unwrap(), session);
    }

    #[tokio::test]
    async fn test_non_critical_failure_keeps_going_then_errors() {
        let executor = Arc::new(
            ScriptedExecutor::default().script("b", Script::Fail(FailureKind::Invocation, "menu parse failed")),
        );
        let (orchestrator, _bus) = orchestrator(three_stages(), executor.clone());

        orchestrator.create_session(Some("s-1".into()), params()).unwrap();
        let session = orchestrator.run("s-1").await.unwrap();

        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.stage("b").unwrap().status, StageStatus::Failed);
        assert_eq!(session.stage("c").unwrap().status, StageStatus::Completed);
        assert_eq!(session.overall_progress, 100);
        assert_eq!(session.errors.len(), 1);
        assert_eq!(session.errors[0].stage_or_worker, "b");
        assert_eq!(session.errors[0].severity, Severity::High);
        assert_eq!(
            session.stage("b").unwrap().last_error.as_deref(),
            Some("menu parse failed")
        );
        assert_eq!(executor.started(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_critical_failure_stops_immediately() {
        let executor = Arc::new(
            ScriptedExecutor::default()
                .script("data_collection", Script::Fail(FailureKind::Timeout, "scraper timed out")),
        );
        let (orchestrator, _bus) = orchestrator(StageRegistry::restaurant_default(), executor.clone());

        orchestrator.create_session(Some("s-1".into()), params()).unwrap();
        let session = orchestrator.run("s-1").await.unwrap();

        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(executor.started(), vec!["data_collection"]);
        assert_eq!(session.errors.len(), 1);
        assert!(session.errors[0].severity.is_critical());
        assert_eq!(
            session.stage("menu_analysis").unwrap().status,
            StageStatus::Pending
        );
        assert!(session.overall_progress < 100);
    }

    #[tokio::test]
    async fn test_unavailable_worker_uses_unavailable_severity() {
        let registry = StageRegistry::new(vec![
            StageDefinition::new("a", StageKind::Collection, "scraping")
                .unavailable_severity(Severity::Critical),
            StageDefinition::new("b", StageKind::Collection, "menu"),
        ])
        .unwrap();
        let executor = Arc::new(
            ScriptedExecutor::default().script("a", Script::Fail(FailureKind::Unavailable, "no scraper running")),
        );
        let (orchestrator, _bus) = orchestrator(registry, executor.clone());

        orchestrator.create_session(Some("s-1".into()), params()).unwrap();
        let session = orchestrator.run("s-1").await.unwrap();

        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(executor.started(), vec!["a"]);
        assert_eq!(session.stage("b").unwrap().status, StageStatus::Pending);
    }

    #[tokio::test]
    async fn test_stuck_dependents_end_in_error() {
        let registry = StageRegistry::new(vec![
            StageDefinition::new("a", StageKind::Collection, "scraping"),
            StageDefinition::new("b", StageKind::Analysis, "menu").depends_on(["a"]),
            StageDefinition::new("d", StageKind::Report, "reporting").depends_on(["b"]),
        ])
        .unwrap();
        let executor = Arc::new(
            ScriptedExecutor::default().script("b", Script::Fail(FailureKind::Invocation, "boom")),
        );
        let (orchestrator, bus) = orchestrator(registry, executor.clone());
        let mut rx = bus.subscribe();

        orchestrator.create_session(Some("s-1".into()), params()).unwrap();
        let session = orchestrator.run("s-1").await.unwrap();

        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.stage("d").unwrap().status, StageStatus::Pending);
        assert!(session.overall_progress < 100);
        assert_eq!(executor.started(), vec!["a", "b"]);

        let last = drain(&mut rx).pop().unwrap();
        match last {
            Event::SessionStatusChanged { to_status, message, .. } => {
                assert_eq!(to_status, "error");
                assert_eq!(message.as_deref(), Some("no runnable stage remains"));
            }
            other => panic!("unexpected final event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_optional_stage_failure_does_not_block_completion() {
        let registry = StageRegistry::new(vec![
            StageDefinition::new("a", StageKind::Collection, "scraping"),
            StageDefinition::new("extra", StageKind::Analysis, "sentiment")
                .depends_on(["a"])
                .severity(Severity::Low)
                .optional(),
        ])
        .unwrap();
        let executor = Arc::new(
            ScriptedExecutor::default().script("extra", Script::Fail(FailureKind::Rejected, "no reviews")),
        );
        let (orchestrator, _bus) = orchestrator(registry, executor);

        orchestrator.create_session(Some("s-1".into()), params()).unwrap();
        let session = orchestrator.run("s-1").await.unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.overall_progress, 100);
        assert_eq!(session.errors.len(), 1);
        assert_eq!(session.errors[0].severity, Severity::Low);
    }

    #[tokio::test]
    async fn test_stage_progress_is_relayed() {
        let executor = Arc::new(ScriptedExecutor::default().script("a", Script::Progress(vec![40, 20, 120])));
        let (orchestrator, bus) = orchestrator(three_stages(), executor);
        let mut rx = bus.subscribe();

        orchestrator.create_session(Some("s-1".into()), params()).unwrap();
        orchestrator.run("s-1").await.unwrap();

        let progress: Vec<u8> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                Event::StageUpdated {
                    stage_id, progress, ..
                } if stage_id == "a" => Some(progress),
                _ => None,
            })
            .collect();
        // running, three reports (never decreasing, capped below 100), completed
        assert_eq!(progress, vec![0, 40, 40, 99, 100]);
    }

    #[tokio::test]
    async fn test_dependencies_complete_before_dependents_start() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (orchestrator, bus) = orchestrator(StageRegistry::restaurant_default(), executor);
        let mut rx = bus.subscribe();

        orchestrator.create_session(Some("s-1".into()), params()).unwrap();
        orchestrator.run("s-1").await.unwrap();

        let registry = StageRegistry::restaurant_default();
        let mut completed: Vec<String> = Vec::new();
        for event in drain(&mut rx) {
            if let Event::StageUpdated { stage_id, status, .. } = event {
                match status.as_str() {
                    "running" => {
                        for dep in &registry.get(&stage_id).unwrap().depends_on {
                            assert!(completed.contains(dep), "{stage_id} started before {dep}");
                        }
                    }
                    "completed" => completed.push(stage_id),
                    _ => {}
                }
            }
        }
        assert_eq!(completed.len(), 5);
    }

    #[tokio::test]
    async fn test_pause_lets_running_stage_finish_then_resume() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let executor = Arc::new(ScriptedExecutor::default().script(
            "a",
            Script::Gate {
                entered: entered.clone(),
                release: release.clone(),
            },
        ));
        let (orchestrator, bus) = orchestrator(three_stages(), executor.clone());
        let mut rx = bus.subscribe();

        let session = orchestrator.start(Some("s-1".into()), params()).await.unwrap();
        assert_eq!(session.status, SessionStatus::Running);

        entered.notified().await;
        let control = orchestrator.pause("s-1").unwrap();
        assert!(control.paused);
        release.notify_one();

        wait_for_status(&mut rx, "paused").await;
        let paused = orchestrator.session("s-1").unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);
        assert_eq!(paused.stage("a").unwrap().status, StageStatus::Completed);
        assert_eq!(paused.stage("b").unwrap().status, StageStatus::Pending);
        assert_eq!(executor.started(), vec!["a"]);

        let control = orchestrator.resume("s-1").unwrap();
        assert!(!control.paused);
        wait_for_status(&mut rx, "completed").await;

        let done = orchestrator.session("s-1").unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(executor.started(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_cancel_while_stage_runs() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let executor = Arc::new(ScriptedExecutor::default().script(
            "a",
            Script::Gate {
                entered: entered.clone(),
                release: release.clone(),
            },
        ));
        let (orchestrator, bus) = orchestrator(three_stages(), executor.clone());
        let mut rx = bus.subscribe();

        orchestrator.start(Some("s-1".into()), params()).await.unwrap();
        entered.notified().await;
        orchestrator.cancel("s-1").unwrap();
        release.notify_one();

        wait_for_status(&mut rx, "cancelled").await;
        let session = orchestrator.session("s-1").unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert_eq!(session.stage("a").unwrap().status, StageStatus::Completed);
        assert_eq!(session.stage("b").unwrap().status, StageStatus::Pending);
        assert_eq!(executor.started(), vec!["a"]);

        // terminal sessions reject further control
        assert!(matches!(
            orchestrator.resume("s-1"),
            Err(OrchestratorError::InvalidControl { .. })
        ));
    }

    #[tokio::test]
    async fn test_executor_panic_ends_session_in_error() {
        let executor = Arc::new(ScriptedExecutor::default().script("b", Script::Panic));
        let (orchestrator, bus) = orchestrator(three_stages(), executor.clone());
        let mut rx = bus.subscribe();

        orchestrator.start(Some("s-1".into()), params()).await.unwrap();
        wait_for_status(&mut rx, "error").await;

        let session = orchestrator.session("s-1").unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.stage("a").unwrap().status, StageStatus::Completed);
        assert_eq!(session.stage("b").unwrap().status, StageStatus::Failed);
        assert_eq!(session.stage("c").unwrap().status, StageStatus::Pending);

        let record = session.errors.last().unwrap();
        assert_eq!(record.stage_or_worker, "orchestrator");
        assert_eq!(record.severity, Severity::Critical);
        assert_eq!(record.message, "stage execution panicked");

        assert!(matches!(
            orchestrator.cancel("s-1"),
            Err(OrchestratorError::InvalidControl { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_while_paused() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let executor = Arc::new(ScriptedExecutor::default().script(
            "a",
            Script::Gate {
                entered: entered.clone(),
                release: release.clone(),
            },
        ));
        let (orchestrator, bus) = orchestrator(three_stages(), executor.clone());
        let mut rx = bus.subscribe();

        orchestrator.start(Some("s-1".into()), params()).await.unwrap();
        entered.notified().await;
        orchestrator.pause("s-1").unwrap();
        release.notify_one();
        wait_for_status(&mut rx, "paused").await;

        orchestrator.cancel("s-1").unwrap();
        wait_for_status(&mut rx, "cancelled").await;
        assert_eq!(executor.started(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_control_errors() {
        let (orchestrator, _bus) = orchestrator(three_stages(), Arc::new(ScriptedExecutor::default()));

        assert!(matches!(
            orchestrator.pause("missing"),
            Err(OrchestratorError::SessionNotFound(_))
        ));

        orchestrator.create_session(Some("s-1".into()), params()).unwrap();
        // resuming a session that is not paused changes nothing
        assert_eq!(orchestrator.resume("s-1").unwrap(), ControlState::default());

        orchestrator.run("s-1").await.unwrap();
        let err = orchestrator.pause("s-1").unwrap_err();
        assert_eq!(err.to_string(), "Cannot pause session s-1 while it is completed");
        assert!(matches!(
            orchestrator.run("s-1").await,
            Err(OrchestratorError::InvalidControl { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_session_validation() {
        let (orchestrator, _bus) = orchestrator(three_stages(), Arc::new(ScriptedExecutor::default()));

        let session = orchestrator.create_session(None, params()).unwrap();
        assert!(Uuid::parse_str(&session.session_id).is_ok());
        assert_eq!(session.status, SessionStatus::Idle);

        orchestrator.create_session(Some("s-1".into()), params()).unwrap();
        assert!(matches!(
            orchestrator.create_session(Some("s-1".into()), params()),
            Err(OrchestratorError::SessionExists(_))
        ));
        assert!(matches!(
            orchestrator.create_session(Some(" ".into()), params()),
            Err(OrchestratorError::InvalidParameters(_))
        ));
        assert!(matches!(
            orchestrator.create_session(None, SessionParameters::new("", "Lyon")),
            Err(OrchestratorError::InvalidParameters(_))
        ));
        assert_eq!(orchestrator.sessions().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_all_skips_finished_sessions() {
        let (orchestrator, _bus) = orchestrator(three_stages(), Arc::new(ScriptedExecutor::default()));
        orchestrator.create_session(Some("done".into()), params()).unwrap();
        orchestrator.run("done").await.unwrap();
        orchestrator.create_session(Some("idle".into()), params()).unwrap();

        assert_eq!(orchestrator.cancel_all(), 1);
        assert!(orchestrator.store().control("idle").unwrap().cancelled);

        let session = orchestrator.run("idle").await.unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_worker_pool() {
        let pool = WorkerPool::new(PoolConfig::default(), Arc::new(FakeLauncher::new()));
        pool.start(WorkerSpec::new("scraper", "x").capabilities(["scraping"]))
            .await
            .unwrap();
        pool.start(
            WorkerSpec::new("analyst", "x").capabilities(["menu_analysis", "pricing", "sentiment"]),
        )
        .await
        .unwrap();
        pool.start(WorkerSpec::new("writer", "x").capabilities(["reporting"]))
            .await
            .unwrap();

        let bus = EventBus::new();
        let orchestrator = Orchestrator::new(
            Arc::new(StageRegistry::restaurant_default()),
            Arc::new(PoolStageExecutor::new(pool.clone())),
            bus,
        );
        orchestrator.create_session(Some("s-1".into()), params()).unwrap();
        let session = orchestrator.run("s-1").await.unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.overall_progress, 100);
        assert_eq!(pool.pending_calls("scraper").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_worker_fails_critical_stage() {
        let pool = WorkerPool::new(PoolConfig::default(), Arc::new(FakeLauncher::new()));
        let orchestrator = Orchestrator::new(
            Arc::new(StageRegistry::restaurant_default()),
            Arc::new(PoolStageExecutor::new(pool)),
            EventBus::new(),
        );
        orchestrator.create_session(Some("s-1".into()), params()).unwrap();
        let session = orchestrator.run("s-1").await.unwrap();

        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.errors.len(), 1);
        assert_eq!(session.errors[0].stage_or_worker, "data_collection");
    }
}
