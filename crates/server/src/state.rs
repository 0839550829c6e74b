use std::sync::{Arc, RwLock};

use events::EventBus;
use insight_core::StageRegistry;
use orchestrator::{Orchestrator, PoolStageExecutor};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use workers::{PoolError, WorkerLauncher, WorkerPool};

use crate::config::AppConfig;
use crate::routes::sse::{ReplayBuffer, SharedReplayBuffer, DEFAULT_REPLAY_CAPACITY};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub pool: WorkerPool,
    pub event_bus: EventBus,
    pub replay_buffer: SharedReplayBuffer,
}

impl AppState {
    /// Wire the pool and orchestrator onto one event bus.
    ///
    /// Must be called inside a tokio runtime: a background task copies
    /// every published event into the replay buffer.
    pub fn new(
        pool: WorkerPool,
        registry: StageRegistry,
        event_bus: EventBus,
        session_retention: usize,
    ) -> Self {
        let executor = Arc::new(PoolStageExecutor::new(pool.clone()));
        let orchestrator = Orchestrator::new(Arc::new(registry), executor, event_bus.clone())
            .with_session_retention(session_retention);
        let replay_buffer = Arc::new(RwLock::new(ReplayBuffer::new(DEFAULT_REPLAY_CAPACITY)));
        spawn_event_recorder(&event_bus, Arc::clone(&replay_buffer));

        Self {
            orchestrator,
            pool,
            event_bus,
            replay_buffer,
        }
    }

    /// Build the state described by `config`, registering every worker.
    /// Workers are not started.
    pub async fn from_config(
        config: &AppConfig,
        registry: StageRegistry,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self, PoolError> {
        let event_bus = EventBus::new();
        let pool = WorkerPool::with_event_bus(config.pool.clone(), launcher, event_bus.clone());
        for spec in &config.workers {
            pool.register(spec.clone()).await?;
        }
        Ok(Self::new(
            pool,
            registry,
            event_bus,
            config.server.session_retention,
        ))
    }

    /// Cancel live sessions and stop every worker.
    pub async fn shutdown(&self) {
        let cancelled = self.orchestrator.cancel_all();
        if cancelled > 0 {
            tracing::info!("Cancelled {} active session(s)", cancelled);
        }
        self.pool.shutdown().await;
    }
}

fn spawn_event_recorder(bus: &EventBus, buffer: SharedReplayBuffer) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => buffer
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .record(envelope),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "Event recorder lagged, replay buffer has gaps");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
