//! Emulated backend: cooperative time slices on the controller's runtime.
//!
//! Reproduces the real backend's async, non-blocking, crash-isolated
//! semantics without a dedicated execution unit. Work advances in bounded
//! wall-clock slices; between slices control returns to the runtime
//! through a timed deferral whose delay grows by a fixed ratio up to a
//! cap, resetting at the start of each call — throughput traded for host
//! responsiveness, without starving other pending work.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::endpoint::Backend;
use crate::program::{OpContext, Operation, TaskProgram};
use crate::protocol::{Envelope, ErrorPayload};

use super::{
    BackendMode, ExecEnv, OperationTable, SLICE_BUDGET, SliceOutcome, begin_run, emit_terminal,
    initialize, run_slice,
};

/// Inter-slice deferral bounds. The first yield after a fresh call is
/// near-zero; repeated yields back off geometrically up to the cap.
pub(crate) const BACKOFF_FLOOR: Duration = Duration::from_millis(1);
pub(crate) const BACKOFF_CAP: Duration = Duration::from_millis(64);
pub(crate) const BACKOFF_RATIO: u32 = 2;

pub(crate) struct EmulatedBackend {
    to_worker: StdMutex<Option<mpsc::UnboundedSender<Value>>>,
    env: Arc<ExecEnv>,
    dispatch: StdMutex<Option<JoinHandle<()>>>,
    down: AtomicBool,
}

impl EmulatedBackend {
    /// Start the dispatch task on the current runtime. Returns the backend
    /// and the receiving end of its outbound envelope stream.
    pub(crate) fn spawn(
        program: Arc<dyn TaskProgram>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Value>) {
        let (to_worker_tx, to_worker_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let env = ExecEnv::new(BackendMode::Emulated, outbound_tx);

        let dispatch_env = Arc::clone(&env);
        let dispatch = tokio::spawn(dispatch_loop(program, to_worker_rx, dispatch_env));

        let backend = Arc::new(Self {
            to_worker: StdMutex::new(Some(to_worker_tx)),
            env,
            dispatch: StdMutex::new(Some(dispatch)),
            down: AtomicBool::new(false),
        });
        (backend, outbound_rx)
    }
}

#[async_trait]
impl Backend for EmulatedBackend {
    fn deliver(&self, wire: Value) {
        if self.down.load(Ordering::SeqCst) {
            tracing::warn!(target: "wirecall::backend", "Delivery to a shut-down backend rejected");
            return;
        }
        let sender = self.to_worker.lock().ok().and_then(|guard| guard.clone());
        match sender {
            Some(tx) => {
                let _ = tx.send(wire);
            }
            None => {
                tracing::warn!(target: "wirecall::backend", "Delivery to a shut-down backend rejected");
            }
        }
    }

    async fn shutdown(&self) {
        if self.down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.env.cancel_all();
        if let Ok(mut guard) = self.to_worker.lock() {
            guard.take();
        }

        let dispatch = self.dispatch.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = dispatch {
            let _ = handle.await;
        }
        tracing::debug!(target: "wirecall::backend", "Emulated backend shut down");
    }

    fn mode(&self) -> BackendMode {
        BackendMode::Emulated
    }
}

async fn dispatch_loop(
    program: Arc<dyn TaskProgram>,
    mut inbox: mpsc::UnboundedReceiver<Value>,
    env: Arc<ExecEnv>,
) {
    let (ops, poisoned) = match initialize(&*program, &env) {
        Ok(ops) => (Arc::new(ops), None),
        Err(failure) => (Arc::new(OperationTable::new()), Some(failure)),
    };

    while let Some(wire) = inbox.recv().await {
        let Some(envelope) = Envelope::decode(&wire) else {
            tracing::debug!(target: "wirecall::backend", "Dropping malformed envelope");
            continue;
        };

        if envelope.is_cancel() {
            env.cancel(&envelope.id);
            continue;
        }

        if let Some(ref failure) = poisoned {
            env.send_init_error(&envelope.id, failure);
            continue;
        }

        match ops.get(&envelope.action) {
            Some(op) => {
                // Register the call (and its abort token) before yielding,
                // so a cancel right behind the request always finds it.
                let ctx = env.begin_call(&envelope.id);
                let call_env = Arc::clone(&env);
                let call_op = Arc::clone(op);
                tokio::spawn(run_call(call_env, call_op, ctx, envelope.payload));
            }
            None => {
                env.send_error(
                    &envelope.id,
                    ErrorPayload::execution(format!("unknown operation `{}`", envelope.action)),
                );
            }
        }
    }

    tracing::debug!(target: "wirecall::backend", "Dispatch loop exiting");
}

/// Drive one call to its terminal envelope. The only suspension point is
/// the inter-slice sleep; a slice already executing is never interrupted,
/// and the abort flag is honored at the next boundary.
async fn run_call(env: Arc<ExecEnv>, op: Arc<dyn Operation>, ctx: OpContext, payload: Value) {
    let mut run = match begin_run(&op, payload, &ctx) {
        Ok(run) => run,
        Err(outcome) => {
            emit_terminal(&env, &ctx, outcome);
            return;
        }
    };

    let mut backoff = BACKOFF_FLOOR;
    loop {
        match run_slice(&mut run, &ctx, SLICE_BUDGET) {
            SliceOutcome::Yielded => {
                ctx.flush_deferred();
                if ctx.is_aborted() {
                    emit_terminal(&env, &ctx, SliceOutcome::Cancelled);
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * BACKOFF_RATIO).min(BACKOFF_CAP);
            }
            outcome => {
                emit_terminal(&env, &ctx, outcome);
                return;
            }
        }
    }
}
