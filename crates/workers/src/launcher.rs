//! Spawning worker processes and wiring their stdio to channels.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::error::{PoolError, Result};
use crate::types::WorkerSpec;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// None when the process was killed by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Channel ends of a running worker.
///
/// Dropping every clone of `outbound` closes the worker's stdin, which is
/// the cooperative stop signal. Sending on `kill` terminates it forcibly.
/// `exit` resolves once the process is gone.
#[derive(Debug)]
pub struct WorkerConnection {
    pub pid: Option<u32>,
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
    pub exit: oneshot::Receiver<ProcessExit>,
    pub kill: oneshot::Sender<()>,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerConnection>;
}

/// Launches workers as child processes of this one.
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<WorkerConnection> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| PoolError::Spawn {
            name: spec.name.clone(),
            reason: format!("{}: {e}", spec.command),
        })?;
        let pid = child.id();

        let missing = |stream: &str| PoolError::Spawn {
            name: spec.name.clone(),
            reason: format!("{stream} was not captured"),
        };
        let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (outbound, mut outbound_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (exit_tx, exit) = oneshot::channel();
        let (kill, kill_rx) = oneshot::channel::<()>();

        let name = spec.name.clone();
        tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                let write = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                };
                if let Err(e) = write.await {
                    tracing::debug!(worker = %name, "stdin closed: {}", e);
                    break;
                }
            }
            // stdin drops here, which the worker sees as EOF
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if inbound_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        let name = spec.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(worker = %name, "stderr: {}", line);
            }
        });

        let name = spec.name.clone();
        tokio::spawn(async move {
            let killed = tokio::select! {
                status = child.wait() => {
                    let _ = exit_tx.send(ProcessExit {
                        code: status.ok().and_then(|s| s.code()),
                    });
                    return;
                }
                signal = kill_rx => signal.is_ok(),
            };

            if killed {
                tracing::debug!(worker = %name, "Killing worker process");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(worker = %name, "Failed to kill worker: {}", e);
                }
            }
            let status = child.wait().await;
            let _ = exit_tx.send(ProcessExit {
                code: status.ok().and_then(|s| s.code()),
            });
        });

        tracing::debug!(worker = %spec.name, pid = ?pid, "Spawned worker process");

        Ok(WorkerConnection {
            pid,
            outbound,
            inbound,
            exit,
            kill,
        })
    }
}
