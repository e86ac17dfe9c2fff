//! Correlation registry - pending calls keyed by id.
//!
//! Each pending call owns a settlement channel and one timeout timer.
//! Settlement (remove + abort timer + send) is a single step on whichever
//! path gets there first — a terminal envelope, the timeout, or a drain —
//! so the losing path degrades to a no-op instead of a double settle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::RpcError;

/// How a pending call settles.
pub type CallOutcome = Result<Value, RpcError>;

struct PendingOperation {
    tx: oneshot::Sender<CallOutcome>,
    timeout: JoinHandle<()>,
    created_at: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("call id `{0}` is already pending")]
    DuplicateId(String),
}

/// Pending-call table. Ids are unique for the owning handle's lifetime
/// (monotonic counter, stringified).
pub struct CorrelationRegistry {
    pending: DashMap<String, PendingOperation>,
    next_id: AtomicU64,
}

impl CorrelationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Allocate the next id and register it in one step. Cannot collide.
    pub fn register_next(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> (String, oneshot::Receiver<CallOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        match self.register(&id, timeout) {
            Ok(rx) => (id, rx),
            Err(_) => unreachable!("monotonic ids cannot collide"),
        }
    }

    /// Register a pending call under an explicit id and start its timeout
    /// timer. Fails if the id is already pending.
    pub fn register(
        self: &Arc<Self>,
        id: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<CallOutcome>, RegisterError> {
        match self.pending.entry(id.to_string()) {
            Entry::Occupied(_) => Err(RegisterError::DuplicateId(id.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                let registry = Arc::downgrade(self);
                let timer_id = id.to_string();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(registry) = registry.upgrade() {
                        registry.settle(&timer_id, Err(RpcError::Timeout { after: timeout }));
                    }
                });
                slot.insert(PendingOperation {
                    tx,
                    timeout: timer,
                    created_at: Instant::now(),
                });
                Ok(rx)
            }
        }
    }

    /// Settle a pending call exactly once. Returns `false` if the id is
    /// absent (already settled, timed out, or never registered) — the late
    /// path is a silent no-op by design.
    pub fn settle(&self, id: &str, outcome: CallOutcome) -> bool {
        match self.pending.remove(id) {
            Some((_, op)) => {
                op.timeout.abort();
                tracing::debug!(
                    target: "wirecall::call",
                    call_id = %id,
                    elapsed_ms = op.created_at.elapsed().as_millis() as u64,
                    ok = outcome.is_ok(),
                    "Call settled"
                );
                let _ = op.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Reject and remove every pending call. Used by `terminate()`.
    pub fn drain_all(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.settle(&id, Err(RpcError::Terminated));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
