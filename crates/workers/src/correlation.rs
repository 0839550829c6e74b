//! Pending-call bookkeeping for one worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::PoolError;
use crate::protocol::WorkerResponse;

pub type CallResult = std::result::Result<Value, PoolError>;

#[derive(Debug)]
pub struct PendingCall {
    pub id: u64,
    pub target_worker: String,
    pub method: String,
    responder: oneshot::Sender<CallResult>,
}

/// Outstanding calls keyed by request id.
///
/// Every call is settled exactly once: by its response, by the caller
/// cancelling it on expiry, or by `fail_all` when the worker goes away. Whatever arrives afterwards for the
/// same id finds no entry and is discarded.
#[derive(Debug)]
pub struct CorrelationTable {
    next_id: AtomicU64,
    calls: Mutex<HashMap<u64, PendingCall>>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, worker: &str, method: &str) -> (u64, oneshot::Receiver<CallResult>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (responder, receiver) = oneshot::channel();

        self.lock().insert(
            id,
            PendingCall {
                id,
                target_worker: worker.to_string(),
                method: method.to_string(),
                responder,
            },
        );

        (id, receiver)
    }

    /// Settle the call a response belongs to. Returns false when no call
    /// with that id is outstanding.
    pub fn resolve(&self, response: WorkerResponse) -> bool {
        let Some(call) = self.lock().remove(&response.id) else {
            return false;
        };

        let result = response
            .into_outcome()
            .map_err(|message| PoolError::CallFailed {
                worker: call.target_worker.clone(),
                method: call.method.clone(),
                message,
            });
        // The caller may have given up already; nothing to do then.
        let _ = call.responder.send(result);
        true
    }

    /// Forget a call without settling it (timeout or send failure).
    pub fn cancel(&self, id: u64) -> Option<PendingCall> {
        self.lock().remove(&id)
    }

    /// Fail every outstanding call. Returns how many were failed.
    pub fn fail_all(&self, error: impl Fn(&PendingCall) -> PoolError) -> usize {
        let drained: Vec<PendingCall> = self.lock().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            let err = error(&call);
            let _ = call.responder.send(Err(err));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
