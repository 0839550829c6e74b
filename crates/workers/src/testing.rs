//! In-memory launcher for exercising the pool without real processes.
//!
//! Each launch runs a small task that plays the worker's side of the
//! protocol according to a [`FakeBehavior`]. Behaviors can be queued per
//! worker with [`FakeLauncher::plan`]; once the queue is empty the fallback
//! behavior is used.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{PoolError, Result};
use crate::launcher::{ProcessExit, WorkerConnection, WorkerLauncher};
use crate::protocol::{WorkerRequest, WorkerResponse};
use crate::types::WorkerSpec;

pub type Handler = Arc<dyn Fn(&WorkerRequest) -> FakeReply + Send + Sync>;

#[derive(Debug, Clone)]
pub enum FakeReply {
    Result(Value),
    Error(String),
    Delayed(Duration, Box<FakeReply>),
    /// Swallow the request
    NoReply,
    /// Emit an `{"event": "error"}` notification instead of answering
    ReportError(String),
}

impl FakeReply {
    pub fn delayed(delay: Duration, reply: FakeReply) -> Self {
        Self::Delayed(delay, Box::new(reply))
    }
}

#[derive(Clone)]
pub enum FakeBehavior {
    /// Answer requests; exit cleanly on stdin EOF, or with `crash` when due
    Serve {
        handler: Handler,
        crash: Option<(Duration, i32)>,
        ignore_eof: bool,
    },
    SpawnError(String),
}

impl FakeBehavior {
    pub fn serve(handler: impl Fn(&WorkerRequest) -> FakeReply + Send + Sync + 'static) -> Self {
        Self::Serve {
            handler: Arc::new(handler),
            crash: None,
            ignore_eof: false,
        }
    }

    /// Replies with `{"method", "params"}` for every request.
    pub fn echo() -> Self {
        Self::serve(|request| {
            FakeReply::Result(json!({
                "method": request.method,
                "params": request.params,
            }))
        })
    }

    pub fn crash_after(after: Duration, code: i32) -> Self {
        match Self::echo() {
            Self::Serve { handler, .. } => Self::Serve {
                handler,
                crash: Some((after, code)),
                ignore_eof: false,
            },
            other => other,
        }
    }

    /// Keeps running after stdin closes; only a kill ends it.
    pub fn stubborn() -> Self {
        match Self::echo() {
            Self::Serve { handler, .. } => Self::Serve {
                handler,
                crash: None,
                ignore_eof: true,
            },
            other => other,
        }
    }

    pub fn spawn_error(reason: impl Into<String>) -> Self {
        Self::SpawnError(reason.into())
    }

    pub fn with_handler(
        self,
        handler: impl Fn(&WorkerRequest) -> FakeReply + Send + Sync + 'static,
    ) -> Self {
        match self {
            Self::Serve {
                crash, ignore_eof, ..
            } => Self::Serve {
                handler: Arc::new(handler),
                crash,
                ignore_eof,
            },
            other => other,
        }
    }
}

struct FakeState {
    plans: HashMap<String, VecDeque<FakeBehavior>>,
    fallback: FakeBehavior,
    launches: HashMap<String, Vec<Instant>>,
    next_pid: u32,
}

#[derive(Clone)]
pub struct FakeLauncher {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::with_fallback(FakeBehavior::echo())
    }

    pub fn with_fallback(fallback: FakeBehavior) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                plans: HashMap::new(),
                fallback,
                launches: HashMap::new(),
                next_pid: 1000,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue behaviors for the next launches of `worker`.
    pub fn plan(&self, worker: &str, behaviors: impl IntoIterator<Item = FakeBehavior>) {
        self.lock()
            .plans
            .entry(worker.to_string())
            .or_default()
            .extend(behaviors);
    }

    /// When each launch of `worker` was attempted, failed spawns included.
    pub fn launches(&self, worker: &str) -> Vec<Instant> {
        self.lock().launches.get(worker).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerConnection> {
        let (behavior, pid) = {
            let mut state = self.lock();
            state
                .launches
                .entry(spec.name.clone())
                .or_default()
                .push(Instant::now());
            let planned = state.plans.get_mut(&spec.name).and_then(VecDeque::pop_front);
            let behavior = planned.unwrap_or_else(|| state.fallback.clone());
            state.next_pid += 1;
            (behavior, state.next_pid)
        };

        match behavior {
            FakeBehavior::SpawnError(reason) => Err(PoolError::Spawn {
                name: spec.name.clone(),
                reason,
            }),
            FakeBehavior::Serve {
                handler,
                crash,
                ignore_eof,
            } => Ok(run_fake(pid, handler, crash, ignore_eof)),
        }
    }
}

fn run_fake(
    pid: u32,
    handler: Handler,
    crash: Option<(Duration, i32)>,
    ignore_eof: bool,
) -> WorkerConnection {
    let (outbound, mut requests) = mpsc::channel::<String>(64);
    let (replies, inbound) = mpsc::channel::<String>(64);
    let (exit_tx, exit) = oneshot::channel();
    let (kill, mut kill_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let crash_timer = async move {
            match crash {
                Some((after, code)) => {
                    tokio::time::sleep(after).await;
                    code
                }
                None => std::future::pending().await,
            }
        };
        tokio::pin!(crash_timer);
        let mut stdin_open = true;

        let code = loop {
            tokio::select! {
                _ = &mut kill_rx => break None,
                code = &mut crash_timer => break Some(code),
                line = requests.recv(), if stdin_open => match line {
                    Some(line) => {
                        if let Ok(request) = serde_json::from_str::<WorkerRequest>(&line) {
                            let reply = handler(&request);
                            tokio::spawn(deliver(request.id, reply, replies.clone()));
                        }
                    }
                    None if ignore_eof => stdin_open = false,
                    None => break Some(0),
                },
            }
        };
        let _ = exit_tx.send(ProcessExit { code });
    });

    WorkerConnection {
        pid: Some(pid),
        outbound,
        inbound,
        exit,
        kill,
    }
}

async fn deliver(id: u64, mut reply: FakeReply, replies: mpsc::Sender<String>) {
    while let FakeReply::Delayed(delay, inner) = reply {
        tokio::time::sleep(delay).await;
        reply = *inner;
    }

    let line = match reply {
        FakeReply::Result(value) => serde_json::to_string(&WorkerResponse::success(id, value)),
        FakeReply::Error(message) => serde_json::to_string(&WorkerResponse::failure(id, message)),
        FakeReply::ReportError(message) => {
            serde_json::to_string(&json!({"event": "error", "message": message}))
        }
        FakeReply::NoReply | FakeReply::Delayed(..) => return,
    };
    if let Ok(line) = line {
        let _ = replies.send(line).await;
    }
}
