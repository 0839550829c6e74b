//! Supervised worker pool.
//!
//! The pool launches workers, routes calls to them and restarts them when
//! they die unexpectedly. A restart after the n-th consecutive failure waits
//! `n * base_restart_delay`; once `max_restart_attempts` is exceeded the
//! worker stays stopped and a `worker.failed` event is published. The
//! attempt counter is cleared once a restarted worker has stayed up for the
//! stability window.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use events::{Event, EventBus, EventEnvelope};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::Instant;

use crate::correlation::CorrelationTable;
use crate::error::{PoolError, Result};
use crate::launcher::{ProcessExit, WorkerConnection, WorkerLauncher};
use crate::protocol::{self, WorkerMessage, WorkerNotification, WorkerRequest};
use crate::types::{PoolConfig, WorkerProcess, WorkerSpec, WorkerStatus};

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
    event_bus: Option<EventBus>,
    registry: RwLock<Registry>,
}

#[derive(Default)]
struct Registry {
    slots: HashMap<String, WorkerSlot>,
    /// Registration order, used for listing and capability lookup
    order: Vec<String>,
}

struct WorkerSlot {
    spec: WorkerSpec,
    process: WorkerProcess,
    calls: Arc<CorrelationTable>,
    link: Option<ProcessLink>,
    /// Bumped on every launch; callbacks from older launches are ignored
    generation: u64,
    stopping: bool,
    /// The worker reported a runtime error and is being taken down
    faulted: bool,
}

struct ProcessLink {
    outbound: mpsc::Sender<String>,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

/// What supervision decided after an unexpected termination.
enum Recovery {
    Retry { delay: Duration, attempt: u32 },
    GiveUp { attempts: u32 },
}

impl WorkerSlot {
    /// Count an unexpected termination against the restart budget.
    fn record_failure(&mut self, config: &PoolConfig, reason: &str) -> Recovery {
        self.link = None;
        self.process.pid = None;
        self.process.restart_attempts += 1;
        let attempt = self.process.restart_attempts;

        if attempt > config.max_restart_attempts {
            self.process.status = WorkerStatus::Stopped;
            self.process.last_error = Some(format!("restart limit reached: {reason}"));
            Recovery::GiveUp {
                attempts: attempt - 1,
            }
        } else {
            self.process.status = WorkerStatus::Error;
            self.process.last_error = Some(reason.to_string());
            Recovery::Retry {
                delay: config.restart_delay(attempt),
                attempt,
            }
        }
    }
}

impl WorkerPool {
    pub fn new(config: PoolConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self::build(config, launcher, None)
    }

    /// Pool that reports worker status changes on the given bus.
    pub fn with_event_bus(
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
        event_bus: EventBus,
    ) -> Self {
        Self::build(config, launcher, Some(event_bus))
    }

    fn build(
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
        event_bus: Option<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                launcher,
                event_bus,
                registry: RwLock::new(Registry::default()),
            }),
        }
    }

    fn from_weak(weak: &Weak<PoolInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Add a worker definition without starting it.
    pub async fn register(&self, spec: WorkerSpec) -> Result<()> {
        let mut registry = self.inner.registry.write().await;
        if registry.slots.contains_key(&spec.name) {
            return Err(PoolError::DuplicateWorker(spec.name));
        }

        tracing::debug!(worker = %spec.name, capabilities = ?spec.capabilities, "Registered worker");
        registry.order.push(spec.name.clone());
        registry.slots.insert(
            spec.name.clone(),
            WorkerSlot {
                process: WorkerProcess::from_spec(&spec),
                spec,
                calls: Arc::new(CorrelationTable::new()),
                link: None,
                generation: 0,
                stopping: false,
                faulted: false,
            },
        );
        Ok(())
    }

    /// Register (or redefine) a worker and launch it.
    pub async fn start(&self, spec: WorkerSpec) -> Result<WorkerProcess> {
        {
            let mut registry = self.inner.registry.write().await;
            match registry.slots.get_mut(&spec.name) {
                Some(slot) if slot.process.status.is_active() => {
                    return Err(PoolError::AlreadyRunning(spec.name));
                }
                Some(slot) => {
                    slot.process.capabilities = spec.capabilities.clone();
                    slot.spec = spec.clone();
                }
                None => {
                    drop(registry);
                    self.register(spec.clone()).await?;
                }
            }
        }
        self.launch(&spec.name).await
    }

    /// Launch a worker that is already registered.
    pub async fn start_registered(&self, name: &str) -> Result<WorkerProcess> {
        self.launch(name).await
    }

    /// Launch every enabled worker that is not already up.
    ///
    /// Launch failures are left to supervision, so this only reports them.
    pub async fn start_all(&self) -> Vec<(String, Result<WorkerProcess>)> {
        let names: Vec<String> = {
            let registry = self.inner.registry.read().await;
            registry
                .order
                .iter()
                .filter(|name| {
                    registry
                        .slots
                        .get(*name)
                        .is_some_and(|slot| slot.spec.enabled && !slot.process.status.is_active())
                })
                .cloned()
                .collect()
        };

        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let result = self.launch(&name).await;
            if let Err(e) = &result {
                tracing::warn!(worker = %name, "Worker failed to start: {}", e);
            }
            results.push((name, result));
        }
        results
    }

    async fn launch(&self, name: &str) -> Result<WorkerProcess> {
        let (spec, generation, snapshot) = {
            let mut registry = self.inner.registry.write().await;
            let slot = registry
                .slots
                .get_mut(name)
                .ok_or_else(|| PoolError::UnknownWorker(name.to_string()))?;
            if slot.process.status.is_active() {
                return Err(PoolError::AlreadyRunning(name.to_string()));
            }
            // supervised restarts launch from Error; anything launched from
            // Stopped is an operator start and gets a fresh restart budget
            if slot.process.status == WorkerStatus::Stopped {
                slot.process.restart_attempts = 0;
            }

            slot.generation += 1;
            slot.stopping = false;
            slot.faulted = false;
            slot.process.status = WorkerStatus::Starting;
            slot.process.pid = None;
            (slot.spec.clone(), slot.generation, slot.process.clone())
        };
        self.publish_status(&snapshot, None);
        tracing::info!(worker = %name, generation, "Starting worker");

        match self.inner.launcher.launch(&spec).await {
            Ok(connection) => self.attach(name, generation, connection).await,
            Err(e) => {
                tracing::error!(worker = %name, "Failed to launch worker: {}", e);
                self.fail_launch(name, generation, e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn attach(
        &self,
        name: &str,
        generation: u64,
        connection: WorkerConnection,
    ) -> Result<WorkerProcess> {
        let WorkerConnection {
            pid,
            outbound,
            inbound,
            exit,
            kill,
        } = connection;
        let (exited_tx, exited_rx) = watch::channel(false);

        let (snapshot, calls) = {
            let mut registry = self.inner.registry.write().await;
            let Some(slot) = registry.slots.get_mut(name) else {
                let _ = kill.send(());
                return Err(PoolError::UnknownWorker(name.to_string()));
            };
            if slot.generation != generation || slot.stopping {
                // stopped or relaunched while this launch was in flight
                let _ = kill.send(());
                return Err(PoolError::unavailable(name, slot.process.status.as_str()));
            }

            slot.process.status = WorkerStatus::Running;
            slot.process.pid = pid;
            slot.process.started_at = Some(Utc::now());
            slot.link = Some(ProcessLink {
                outbound,
                kill: Some(kill),
                exited: exited_rx,
            });
            (slot.process.clone(), slot.calls.clone())
        };
        self.publish_status(&snapshot, None);
        tracing::info!(worker = %name, pid = ?pid, "Worker running");

        let weak = Arc::downgrade(&self.inner);
        let worker = name.to_string();
        tokio::spawn(read_loop(weak.clone(), worker.clone(), generation, inbound, calls));

        tokio::spawn({
            let weak = weak.clone();
            let worker = worker.clone();
            async move {
                let exit = exit.await.unwrap_or(ProcessExit { code: None });
                if let Some(pool) = Self::from_weak(&weak) {
                    pool.handle_exit(&worker, generation, exit).await;
                }
                let _ = exited_tx.send(true);
            }
        });

        if snapshot.restart_attempts > 0 {
            let window = self.inner.config.stability_window();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                if let Some(pool) = Self::from_weak(&weak) {
                    pool.mark_stable(&worker, generation).await;
                }
            });
        }

        Ok(snapshot)
    }

    async fn handle_exit(&self, name: &str, generation: u64, exit: ProcessExit) {
        let (snapshot, failure) = {
            let mut registry = self.inner.registry.write().await;
            let Some(slot) = registry.slots.get_mut(name) else {
                return;
            };
            if slot.generation != generation {
                return;
            }

            slot.link = None;
            slot.process.pid = None;
            let failed = slot
                .calls
                .fail_all(|call| PoolError::unavailable(&call.target_worker, "exited"));
            if failed > 0 {
                tracing::warn!(worker = %name, failed, "Failed pending calls after worker exit");
            }

            if slot.stopping || (exit.success() && !slot.faulted) {
                slot.process.status = WorkerStatus::Stopped;
                (slot.process.clone(), None)
            } else {
                let reason = match slot.process.last_error.take() {
                    Some(error) if slot.faulted => format!("{error} ({})", exit.describe()),
                    _ => exit.describe(),
                };
                let recovery = slot.record_failure(&self.inner.config, &reason);
                (slot.process.clone(), Some((recovery, reason)))
            }
        };

        match failure {
            None => {
                tracing::info!(worker = %name, "Worker stopped ({})", exit.describe());
                self.publish_status(&snapshot, Some(exit.describe()));
            }
            Some((recovery, reason)) => {
                tracing::warn!(worker = %name, "Worker exited unexpectedly: {}", reason);
                self.recover(name, generation, recovery, &snapshot, reason);
            }
        }
    }

    async fn fail_launch(&self, name: &str, generation: u64, reason: String) {
        let failure = {
            let mut registry = self.inner.registry.write().await;
            let Some(slot) = registry.slots.get_mut(name) else {
                return;
            };
            if slot.generation != generation || slot.stopping {
                return;
            }
            let recovery = slot.record_failure(&self.inner.config, &reason);
            (recovery, slot.process.clone())
        };

        let (recovery, snapshot) = failure;
        self.recover(name, generation, recovery, &snapshot, reason);
    }

    /// Publish a failure and schedule the restart it calls for, if any.
    fn recover(
        &self,
        name: &str,
        generation: u64,
        recovery: Recovery,
        snapshot: &WorkerProcess,
        reason: String,
    ) {
        self.publish_status(snapshot, Some(reason.clone()));

        match recovery {
            Recovery::Retry { delay, attempt } => {
                tracing::warn!(
                    worker = %name,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "Scheduling worker restart"
                );
                let weak = Arc::downgrade(&self.inner);
                let worker = name.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(pool) = Self::from_weak(&weak) {
                        pool.restart_after_failure(&worker, generation).await;
                    }
                });
            }
            Recovery::GiveUp { attempts } => {
                tracing::error!(
                    worker = %name,
                    attempts,
                    "Worker exceeded its restart limit, giving up"
                );
                self.publish(Event::WorkerFailed {
                    worker: name.to_string(),
                    restart_attempts: attempts,
                    message: reason,
                });
            }
        }
    }

    async fn restart_after_failure(&self, name: &str, generation: u64) {
        {
            let registry = self.inner.registry.read().await;
            let Some(slot) = registry.slots.get(name) else {
                return;
            };
            // an operator start, stop or restart superseded this one
            if slot.generation != generation
                || slot.stopping
                || slot.process.status != WorkerStatus::Error
            {
                return;
            }
        }

        if let Ok(process) = self.launch(name).await {
            tracing::info!(
                worker = %name,
                attempt = process.restart_attempts,
                "Worker restarted"
            );
        }
    }

    async fn mark_stable(&self, name: &str, generation: u64) {
        let snapshot = {
            let mut registry = self.inner.registry.write().await;
            let Some(slot) = registry.slots.get_mut(name) else {
                return;
            };
            if slot.generation != generation
                || slot.process.status != WorkerStatus::Running
                || slot.process.restart_attempts == 0
            {
                return;
            }
            slot.process.restart_attempts = 0;
            slot.process.clone()
        };
        tracing::info!(worker = %name, "Worker stable, restart counter cleared");
        self.publish_status(&snapshot, None);
    }

    /// The worker reported a runtime error; take it down so that
    /// supervision restarts it.
    async fn handle_runtime_error(&self, name: &str, generation: u64, message: String) {
        let mut registry = self.inner.registry.write().await;
        let Some(slot) = registry.slots.get_mut(name) else {
            return;
        };
        if slot.generation != generation || slot.stopping {
            return;
        }

        slot.faulted = true;
        slot.process.last_error = Some(message);
        if let Some(kill) = slot.link.as_mut().and_then(|link| link.kill.take()) {
            let _ = kill.send(());
        }
    }

    /// Stop a worker: close its stdin, give it the grace period to exit,
    /// then kill it. Pending calls fail and no restart is scheduled.
    pub async fn stop(&self, name: &str) -> Result<WorkerProcess> {
        let (link, calls) = {
            let mut registry = self.inner.registry.write().await;
            let slot = registry
                .slots
                .get_mut(name)
                .ok_or_else(|| PoolError::UnknownWorker(name.to_string()))?;
            slot.stopping = true;
            (slot.link.take(), slot.calls.clone())
        };

        calls.fail_all(|call| PoolError::unavailable(&call.target_worker, "stopping"));

        match link {
            Some(link) => {
                let ProcessLink {
                    outbound,
                    kill,
                    mut exited,
                } = link;
                tracing::info!(worker = %name, "Stopping worker");
                drop(outbound);

                let grace = self.inner.config.stop_grace_period();
                if tokio::time::timeout(grace, exited.wait_for(|done| *done))
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        worker = %name,
                        grace_secs = grace.as_secs(),
                        "Worker ignored stop request, killing"
                    );
                    if let Some(kill) = kill {
                        let _ = kill.send(());
                    }
                    let _ = exited.wait_for(|done| *done).await;
                }
            }
            None => {
                // not running, or waiting on a scheduled restart
                let snapshot = {
                    let mut registry = self.inner.registry.write().await;
                    let slot = registry
                        .slots
                        .get_mut(name)
                        .ok_or_else(|| PoolError::UnknownWorker(name.to_string()))?;
                    let changed = slot.process.status != WorkerStatus::Stopped;
                    slot.process.status = WorkerStatus::Stopped;
                    slot.process.pid = None;
                    changed.then(|| slot.process.clone())
                };
                if let Some(snapshot) = snapshot {
                    self.publish_status(&snapshot, Some("stopped".to_string()));
                }
            }
        }

        self.status(name).await
    }

    /// Stop and relaunch a worker with a fresh restart budget.
    pub async fn restart(&self, name: &str) -> Result<WorkerProcess> {
        self.stop(name).await?;
        {
            let mut registry = self.inner.registry.write().await;
            if let Some(slot) = registry.slots.get_mut(name) {
                slot.process.restart_attempts = 0;
                slot.process.last_error = None;
            }
        }
        self.launch(name).await
    }

    /// Stop every worker concurrently.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.inner.registry.read().await.order.clone();
        tracing::info!(workers = names.len(), "Shutting down worker pool");

        let stops = names.iter().map(|name| self.stop(name));
        for (name, result) in names.iter().zip(join_all(stops).await) {
            if let Err(e) = result {
                tracing::warn!(worker = %name, "Error stopping worker: {}", e);
            }
        }
    }

    /// Send one request to a running worker and wait for its response.
    ///
    /// Fails fast with `WorkerUnavailable` unless the worker is running.
    /// After `timeout` the call fails even if the worker answers later.
    pub async fn invoke(
        &self,
        name: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or_else(|| self.inner.config.default_call_timeout());

        let (outbound, calls) = {
            let registry = self.inner.registry.read().await;
            let slot = registry
                .slots
                .get(name)
                .ok_or_else(|| PoolError::UnknownWorker(name.to_string()))?;
            match (&slot.link, slot.process.status) {
                (Some(link), WorkerStatus::Running) if !slot.stopping => {
                    (link.outbound.clone(), slot.calls.clone())
                }
                (_, status) => return Err(PoolError::unavailable(name, status.as_str())),
            }
        };

        let (id, mut response) = calls.register(name, method);
        let request = WorkerRequest {
            id,
            method: method.to_string(),
            params,
        };
        let line = match protocol::encode_request(&request) {
            Ok(line) => line,
            Err(e) => {
                calls.cancel(id);
                return Err(e);
            }
        };

        let sent = outbound.send(line).await;
        // holding a sender would keep stdin open during a stop
        drop(outbound);
        if sent.is_err() {
            calls.cancel(id);
            return Err(PoolError::unavailable(name, "exited"));
        }
        tracing::debug!(worker = %name, method, call_id = id, "Request sent");

        match tokio::time::timeout(timeout, &mut response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::unavailable(name, "exited")),
            Err(_) => {
                calls.cancel(id);
                tracing::warn!(worker = %name, method, call_id = id, "Call timed out");
                Err(PoolError::Timeout {
                    worker: name.to_string(),
                    method: method.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    pub async fn status(&self, name: &str) -> Result<WorkerProcess> {
        self.inner
            .registry
            .read()
            .await
            .slots
            .get(name)
            .map(|slot| slot.process.clone())
            .ok_or_else(|| PoolError::UnknownWorker(name.to_string()))
    }

    /// Every worker in registration order.
    pub async fn status_all(&self) -> Vec<WorkerProcess> {
        let registry = self.inner.registry.read().await;
        registry
            .order
            .iter()
            .filter_map(|name| registry.slots.get(name))
            .map(|slot| slot.process.clone())
            .collect()
    }

    /// Names of workers declaring `capability`, in registration order,
    /// whatever their current status.
    pub async fn workers_for(&self, capability: &str) -> Vec<String> {
        let registry = self.inner.registry.read().await;
        registry
            .order
            .iter()
            .filter(|name| {
                registry
                    .slots
                    .get(*name)
                    .is_some_and(|slot| slot.spec.provides(capability))
            })
            .cloned()
            .collect()
    }

    /// Like [`workers_for`](Self::workers_for), but no provider at all is
    /// a `NoCapableWorker` error.
    pub async fn capable_workers(&self, capability: &str) -> Result<Vec<String>> {
        let workers = self.workers_for(capability).await;
        if workers.is_empty() {
            return Err(PoolError::NoCapableWorker(capability.to_string()));
        }
        Ok(workers)
    }

    pub async fn pending_calls(&self, name: &str) -> Result<usize> {
        self.inner
            .registry
            .read()
            .await
            .slots
            .get(name)
            .map(|slot| slot.calls.len())
            .ok_or_else(|| PoolError::UnknownWorker(name.to_string()))
    }

    /// Poll until every enabled worker is running.
    pub async fn wait_until_ready(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or_else(|| self.inner.config.readiness_timeout());
        let deadline = Instant::now() + timeout;

        loop {
            let pending: Vec<String> = {
                let registry = self.inner.registry.read().await;
                registry
                    .order
                    .iter()
                    .filter(|name| {
                        registry.slots.get(*name).is_some_and(|slot| {
                            slot.spec.enabled && slot.process.status != WorkerStatus::Running
                        })
                    })
                    .cloned()
                    .collect()
            };

            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PoolError::NotReady {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    pending,
                });
            }
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    }

    fn publish_status(&self, process: &WorkerProcess, message: Option<String>) {
        self.publish(Event::WorkerStatusChanged {
            worker: process.name.clone(),
            status: process.status.as_str().to_string(),
            pid: process.pid,
            restart_attempts: process.restart_attempts,
            message,
        });
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.inner.event_bus {
            bus.publish(EventEnvelope::new(event));
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

async fn read_loop(
    pool: Weak<PoolInner>,
    worker: String,
    generation: u64,
    mut inbound: mpsc::Receiver<String>,
    calls: Arc<CorrelationTable>,
) {
    while let Some(line) = inbound.recv().await {
        match protocol::parse_line(&line) {
            Ok(WorkerMessage::Response(response)) => {
                let id = response.id;
                if !calls.resolve(response) {
                    tracing::debug!(worker = %worker, call_id = id, "Discarding response for unknown or expired call");
                }
            }
            Ok(WorkerMessage::Notification(WorkerNotification::Error { message })) => {
                tracing::error!(worker = %worker, "Worker reported error: {}", message);
                if let Some(pool) = WorkerPool::from_weak(&pool) {
                    pool.handle_runtime_error(&worker, generation, message).await;
                }
            }
            Ok(WorkerMessage::Notification(WorkerNotification::Log { level, message })) => {
                match level.as_deref() {
                    Some("error") | Some("warn") | Some("warning") => {
                        tracing::warn!(worker = %worker, "{}", message)
                    }
                    _ => tracing::debug!(worker = %worker, "{}", message),
                }
            }
            Err(e) => {
                tracing::warn!(worker = %worker, "Ignoring unparseable worker output: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBehavior, FakeLauncher, FakeReply};
    use serde_json::json;

    fn pool_with(launcher: &FakeLauncher) -> (WorkerPool, EventBus) {
        let bus = EventBus::new();
        let pool =
            WorkerPool::with_event_bus(PoolConfig::default(), Arc::new(launcher.clone()), bus.clone());
        (pool, bus)
    }

    fn scraper() -> WorkerSpec {
        WorkerSpec::new("scraper", "scraper-bin").capabilities(["scraping"])
    }

    /// With the clock paused, sleeping lets every runnable task finish
    /// before time moves on.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_invoke() {
        let launcher = FakeLauncher::new();
        let (pool, _bus) = pool_with(&launcher);

        let process = pool.start(scraper()).await.unwrap();
        assert_eq!(process.status, WorkerStatus::Running);
        assert!(process.pid.is_some());

        let result = pool
            .invoke("scraper", "collect.listings", json!({"city": "Lyon"}), None)
            .await
            .unwrap();
        assert_eq!(result["method"], "collect.listings");
        assert_eq!(result["params"]["city"], "Lyon");
        assert_eq!(pool.pending_calls("scraper").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_unknown_and_stopped_workers() {
        let launcher = FakeLauncher::new();
        let (pool, _bus) = pool_with(&launcher);

        let err = pool.invoke("ghost", "echo", json!({}), None).await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownWorker(_)));

        pool.register(scraper()).await.unwrap();
        let err = pool.invoke("scraper", "echo", json!({}), None).await.unwrap_err();
        assert!(matches!(err, PoolError::WorkerUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_registration_and_double_start() {
        let launcher = FakeLauncher::new();
        let (pool, _bus) = pool_with(&launcher);

        pool.register(scraper()).await.unwrap();
        assert!(matches!(
            pool.register(scraper()).await,
            Err(PoolError::DuplicateWorker(_))
        ));

        pool.start_registered("scraper").await.unwrap();
        assert!(matches!(
            pool.start(scraper()).await,
            Err(PoolError::AlreadyRunning(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_resolve_out_of_order() {
        let launcher = FakeLauncher::with_fallback(FakeBehavior::serve(|request| {
            let delay = request.params["delay_ms"].as_u64().unwrap_or(0);
            FakeReply::delayed(
                Duration::from_millis(delay),
                FakeReply::Result(json!({"tag": request.params["tag"]})),
            )
        }));
        let (pool, _bus) = pool_with(&launcher);
        pool.start(scraper()).await.unwrap();

        let slow = pool.invoke(
            "scraper",
            "collect.reviews",
            json!({"tag": "slow", "delay_ms": 300}),
            None,
        );
        let fast = pool.invoke(
            "scraper",
            "collect.reviews",
            json!({"tag": "fast", "delay_ms": 10}),
            None,
        );
        let (slow, fast) = tokio::join!(slow, fast);

        assert_eq!(slow.unwrap()["tag"], "slow");
        assert_eq!(fast.unwrap()["tag"], "fast");
    }

    fn delayed_tag_launcher() -> FakeLauncher {
        FakeLauncher::with_fallback(FakeBehavior::serve(|request| {
            let delay = request.params["delay_ms"].as_u64().unwrap_or(0);
            FakeReply::delayed(
                Duration::from_millis(delay),
                FakeReply::Result(json!({"tag": request.params["tag"]})),
            )
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_with_their_own_timeouts() {
        let launcher = delayed_tag_launcher();
        let (pool, _bus) = pool_with(&launcher);
        pool.start(scraper()).await.unwrap();

        let expires = pool.invoke(
            "scraper",
            "collect.reviews",
            json!({"tag": "a", "delay_ms": 1500}),
            Some(Duration::from_millis(500)),
        );
        let quick = pool.invoke(
            "scraper",
            "collect.reviews",
            json!({"tag": "b", "delay_ms": 100}),
            Some(Duration::from_millis(500)),
        );
        let patient = pool.invoke(
            "scraper",
            "collect.reviews",
            json!({"tag": "c", "delay_ms": 1500}),
            Some(Duration::from_secs(2)),
        );
        let (expires, quick, patient) = tokio::join!(expires, quick, patient);

        match expires.unwrap_err() {
            PoolError::Timeout { timeout_ms, .. } => assert_eq!(timeout_ms, 500),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(quick.unwrap()["tag"], "b");
        assert_eq!(patient.unwrap()["tag"], "c");
        assert_eq!(pool.pending_calls("scraper").await.unwrap(), 0);

        // the expired call's late answer is dropped
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(pool.pending_calls("scraper").await.unwrap(), 0);
        assert_eq!(pool.status("scraper").await.unwrap().status, WorkerStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_calls_in_flight_drain_the_table() {
        let launcher = delayed_tag_launcher();
        let (pool, _bus) = pool_with(&launcher);
        pool.start(scraper()).await.unwrap();

        // delays are a permutation of 0..240ms; every fourth call gives up early
        let calls: Vec<(u64, Duration)> = (0..24u64)
            .map(|i| {
                let delay_ms = (i * 7 % 24) * 10;
                let timeout = if i % 4 == 0 {
                    Duration::from_millis(delay_ms / 2)
                } else {
                    Duration::from_secs(1)
                };
                (delay_ms, timeout)
            })
            .collect();

        let results = join_all(calls.iter().enumerate().map(|(i, (delay_ms, timeout))| {
            pool.invoke(
                "scraper",
                "collect.reviews",
                json!({"tag": i, "delay_ms": delay_ms}),
                Some(*timeout),
            )
        }))
        .await;

        for (i, result) in results.into_iter().enumerate() {
            if i % 4 == 0 && calls[i].0 > 0 {
                assert!(result.unwrap_err().is_timeout(), "call {i} should time out");
            } else if i % 4 != 0 {
                assert_eq!(result.unwrap()["tag"], i, "call {i} got another call's answer");
            }
        }
        assert_eq!(pool.pending_calls("scraper").await.unwrap(), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(pool.pending_calls("scraper").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_late_response() {
        let launcher = FakeLauncher::with_fallback(FakeBehavior::serve(|_| {
            FakeReply::delayed(Duration::from_secs(2), FakeReply::Result(json!("late")))
        }));
        let (pool, _bus) = pool_with(&launcher);
        pool.start(scraper()).await.unwrap();

        let started = Instant::now();
        let err = pool
            .invoke("scraper", "echo", json!({}), Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(pool.pending_calls("scraper").await.unwrap(), 0);

        // the late answer arrives and is dropped without disturbing the worker
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(pool.status("scraper").await.unwrap().status, WorkerStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reply_fails_only_that_call() {
        let launcher = FakeLauncher::with_fallback(FakeBehavior::serve(|request| {
            if request.method == "fail" {
                FakeReply::Error("parse error".to_string())
            } else {
                FakeReply::Result(json!("ok"))
            }
        }));
        let (pool, _bus) = pool_with(&launcher);
        pool.start(scraper()).await.unwrap();

        let err = pool.invoke("scraper", "fail", json!({}), None).await.unwrap_err();
        match err {
            PoolError::CallFailed { message, .. } => assert_eq!(message, "parse error"),
            other => panic!("expected call failure, got {other:?}"),
        }
        assert_eq!(
            pool.invoke("scraper", "echo", json!({}), None).await.unwrap(),
            json!("ok")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_backoff_then_give_up() {
        let launcher = FakeLauncher::with_fallback(FakeBehavior::crash_after(Duration::ZERO, 1));
        let (pool, bus) = pool_with(&launcher);
        let mut events = bus.subscribe();

        let t0 = Instant::now();
        pool.start(scraper()).await.unwrap();
        settle().await;

        let status = pool.status("scraper").await.unwrap();
        assert_eq!(status.status, WorkerStatus::Error);
        assert_eq!(status.restart_attempts, 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;

        let launches = launcher.launches("scraper");
        let offsets: Vec<u64> = launches.iter().map(|at| (*at - t0).as_secs()).collect();
        assert_eq!(offsets, vec![0, 5, 15, 30]);

        let status = pool.status("scraper").await.unwrap();
        assert_eq!(status.status, WorkerStatus::Stopped);
        assert!(status.last_error.unwrap().contains("restart limit"));

        let mut failed = None;
        while let Ok(envelope) = events.try_recv() {
            if let Event::WorkerFailed {
                restart_attempts, ..
            } = envelope.event
            {
                failed = Some(restart_attempts);
            }
        }
        assert_eq!(failed, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_start_after_give_up_gets_fresh_budget() {
        let launcher = FakeLauncher::new();
        launcher.plan(
            "scraper",
            [
                FakeBehavior::spawn_error("no such file"),
                FakeBehavior::spawn_error("no such file"),
                FakeBehavior::spawn_error("no such file"),
                FakeBehavior::spawn_error("no such file"),
                FakeBehavior::crash_after(Duration::from_secs(1), 1),
            ],
        );
        let (pool, _bus) = pool_with(&launcher);

        assert!(pool.start(scraper()).await.is_err());
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        let status = pool.status("scraper").await.unwrap();
        assert_eq!(status.status, WorkerStatus::Stopped);
        assert_eq!(status.restart_attempts, 4);

        let process = pool.start_registered("scraper").await.unwrap();
        assert_eq!(process.status, WorkerStatus::Running);
        assert_eq!(process.restart_attempts, 0);

        // the next crash is supervised again instead of giving up at once
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        let status = pool.status("scraper").await.unwrap();
        assert_eq!(status.status, WorkerStatus::Error);
        assert_eq!(status.restart_attempts, 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(pool.status("scraper").await.unwrap().status, WorkerStatus::Running);
        assert_eq!(launcher.launches("scraper").len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_on_second_attempt() {
        let launcher = FakeLauncher::new();
        launcher.plan(
            "scraper",
            [
                FakeBehavior::crash_after(Duration::from_secs(10), 1),
                FakeBehavior::crash_after(Duration::ZERO, 1),
            ],
        );
        let (pool, _bus) = pool_with(&launcher);

        pool.start(scraper()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(pool.status("scraper").await.unwrap().restart_attempts, 1);

        // relaunched at 15s, crashes at once, relaunched at 25s and stays up
        tokio::time::sleep(Duration::from_secs(16)).await;
        settle().await;
        let status = pool.status("scraper").await.unwrap();
        assert_eq!(status.status, WorkerStatus::Running);
        assert_eq!(status.restart_attempts, 2);
        assert_eq!(launcher.launches("scraper").len(), 3);

        // stable for the window: counter cleared
        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;
        assert_eq!(pool.status("scraper").await.unwrap().restart_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_fails_pending_calls() {
        let launcher = FakeLauncher::new();
        launcher.plan(
            "scraper",
            [FakeBehavior::crash_after(Duration::from_secs(1), 137)
                .with_handler(|_| FakeReply::NoReply)],
        );
        let (pool, _bus) = pool_with(&launcher);
        pool.start(scraper()).await.unwrap();

        let err = pool
            .invoke("scraper", "collect.listings", json!({}), Some(Duration::from_secs(30)))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(pool.status("scraper").await.unwrap().status, WorkerStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_is_not_restarted() {
        let launcher = FakeLauncher::new();
        launcher.plan("scraper", [FakeBehavior::crash_after(Duration::from_secs(1), 0)]);
        let (pool, _bus) = pool_with(&launcher);
        pool.start(scraper()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;

        let status = pool.status("scraper").await.unwrap();
        assert_eq!(status.status, WorkerStatus::Stopped);
        assert_eq!(status.restart_attempts, 0);
        assert_eq!(launcher.launches("scraper").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_error_notification_triggers_restart() {
        let launcher = FakeLauncher::new();
        launcher.plan(
            "scraper",
            [FakeBehavior::serve(|_| FakeReply::ReportError("browser crashed".to_string()))],
        );
        let (pool, _bus) = pool_with(&launcher);
        pool.start(scraper()).await.unwrap();

        let err = pool
            .invoke("scraper", "collect.listings", json!({}), None)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());

        let status = pool.status("scraper").await.unwrap();
        assert_eq!(status.status, WorkerStatus::Error);
        assert_eq!(status.restart_attempts, 1);
        assert!(status.last_error.unwrap().contains("browser crashed"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(pool.status("scraper").await.unwrap().status, WorkerStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_graceful_and_not_restarted() {
        let launcher = FakeLauncher::new();
        let (pool, _bus) = pool_with(&launcher);
        pool.start(scraper()).await.unwrap();

        let started = Instant::now();
        let process = pool.stop("scraper").await.unwrap();
        assert_eq!(process.status, WorkerStatus::Stopped);
        assert!(started.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(launcher.launches("scraper").len(), 1);
        assert!(matches!(
            pool.invoke("scraper", "echo", json!({}), None).await,
            Err(PoolError::WorkerUnavailable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_kills_after_grace_period() {
        let launcher = FakeLauncher::new();
        launcher.plan("scraper", [FakeBehavior::stubborn()]);
        let (pool, _bus) = pool_with(&launcher);
        pool.start(scraper()).await.unwrap();

        let started = Instant::now();
        let process = pool.stop("scraper").await.unwrap();
        assert_eq!(process.status, WorkerStatus::Stopped);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_restart() {
        let launcher = FakeLauncher::with_fallback(FakeBehavior::crash_after(Duration::ZERO, 2));
        let (pool, _bus) = pool_with(&launcher);
        pool.start(scraper()).await.unwrap();
        settle().await;
        assert_eq!(pool.status("scraper").await.unwrap().status, WorkerStatus::Error);

        pool.stop("scraper").await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;

        assert_eq!(launcher.launches("scraper").len(), 1);
        assert_eq!(pool.status("scraper").await.unwrap().status, WorkerStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resets_budget() {
        let launcher = FakeLauncher::new();
        launcher.plan("scraper", [FakeBehavior::crash_after(Duration::ZERO, 1)]);
        let (pool, _bus) = pool_with(&launcher);
        pool.start(scraper()).await.unwrap();
        settle().await;
        assert_eq!(pool.status("scraper").await.unwrap().restart_attempts, 1);

        let process = pool.restart("scraper").await.unwrap();
        assert_eq!(process.status, WorkerStatus::Running);
        assert_eq!(process.restart_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failure_is_supervised() {
        let launcher = FakeLauncher::new();
        launcher.plan("scraper", [FakeBehavior::spawn_error("no such file")]);
        let (pool, _bus) = pool_with(&launcher);

        let err = pool.start(scraper()).await.unwrap_err();
        assert!(matches!(err, PoolError::Spawn { .. }));
        assert_eq!(pool.status("scraper").await.unwrap().status, WorkerStatus::Error);

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(pool.status("scraper").await.unwrap().status, WorkerStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_for_capability() {
        let launcher = FakeLauncher::new();
        let (pool, _bus) = pool_with(&launcher);
        pool.register(scraper()).await.unwrap();
        pool.register(WorkerSpec::new("analyst", "a").capabilities(["pricing", "menu_analysis"]))
            .await
            .unwrap();
        pool.register(WorkerSpec::new("backup", "b").capabilities(["pricing"]))
            .await
            .unwrap();

        assert_eq!(pool.workers_for("pricing").await, vec!["analyst", "backup"]);
        assert_eq!(pool.workers_for("scraping").await, vec!["scraper"]);
        assert!(pool.workers_for("sentiment").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capable_workers_requires_a_provider() {
        let launcher = FakeLauncher::new();
        let (pool, _bus) = pool_with(&launcher);
        pool.register(scraper()).await.unwrap();

        assert_eq!(pool.capable_workers("scraping").await.unwrap(), vec!["scraper"]);
        let err = pool.capable_workers("sentiment").await.unwrap_err();
        assert!(matches!(err, PoolError::NoCapableWorker(ref capability) if capability == "sentiment"));
        assert!(err.is_unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready() {
        let launcher = FakeLauncher::new();
        let (pool, _bus) = pool_with(&launcher);
        pool.register(scraper()).await.unwrap();
        pool.register(WorkerSpec::new("idle", "x").disabled()).await.unwrap();

        let err = pool
            .wait_until_ready(Some(Duration::from_millis(300)))
            .await
            .unwrap_err();
        match err {
            PoolError::NotReady { pending, .. } => assert_eq!(pending, vec!["scraper"]),
            other => panic!("expected not ready, got {other:?}"),
        }

        let results = pool.start_all().await;
        assert_eq!(results.len(), 1);
        pool.wait_until_ready(Some(Duration::from_secs(1))).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_events_published() {
        let launcher = FakeLauncher::new();
        let (pool, bus) = pool_with(&launcher);
        let mut events = bus.subscribe();

        pool.start(scraper()).await.unwrap();
        pool.stop("scraper").await.unwrap();

        let mut statuses = Vec::new();
        while let Ok(envelope) = events.try_recv() {
            if let Event::WorkerStatusChanged { status, .. } = envelope.event {
                statuses.push(status);
            }
        }
        assert_eq!(statuses, vec!["starting", "running", "stopped"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_everything() {
        let launcher = FakeLauncher::new();
        let (pool, _bus) = pool_with(&launcher);
        pool.start(scraper()).await.unwrap();
        pool.start(WorkerSpec::new("analyst", "a").capabilities(["pricing"]))
            .await
            .unwrap();

        pool.shutdown().await;
        for process in pool.status_all().await {
            assert_eq!(process.status, WorkerStatus::Stopped);
        }
    }
}
