//! Real backend: a dedicated worker thread.
//!
//! The thread executes one operation at a time in arrival order. Between
//! slices it drains its control queue, so a `cancel` for the running call
//! is observed mid-operation and other requests are backlogged rather than
//! lost. Program registration happens on the thread; if it fails, the
//! backend is poisoned and every request settles with `init-error`.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::endpoint::Backend;
use crate::error::ConfigError;
use crate::program::TaskProgram;
use crate::protocol::{Envelope, ErrorPayload};

use super::{
    BackendMode, ExecEnv, OperationTable, SLICE_BUDGET, SliceOutcome, begin_run, emit_terminal,
    initialize, run_slice,
};

pub(crate) struct RealBackend {
    to_worker: StdMutex<Option<mpsc::UnboundedSender<Value>>>,
    env: Arc<ExecEnv>,
    join: StdMutex<Option<std::thread::JoinHandle<()>>>,
    down: AtomicBool,
}

impl RealBackend {
    /// Spawn the worker thread. Returns the backend and the receiving end
    /// of its outbound envelope stream.
    pub(crate) fn spawn(
        program: Arc<dyn TaskProgram>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Value>), ConfigError> {
        let (to_worker_tx, to_worker_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let env = ExecEnv::new(BackendMode::Real, outbound_tx);

        let worker_env = Arc::clone(&env);
        let join = std::thread::Builder::new()
            .name("wirecall-worker".to_string())
            .spawn(move || worker_main(program, to_worker_rx, worker_env))
            .map_err(|e| ConfigError::Spawn(e.to_string()))?;

        let backend = Arc::new(Self {
            to_worker: StdMutex::new(Some(to_worker_tx)),
            env,
            join: StdMutex::new(Some(join)),
            down: AtomicBool::new(false),
        });
        Ok((backend, outbound_rx))
    }
}

#[async_trait]
impl Backend for RealBackend {
    fn deliver(&self, wire: Value) {
        if self.down.load(Ordering::SeqCst) {
            tracing::warn!(target: "wirecall::backend", "Delivery to a shut-down backend rejected");
            return;
        }
        let sender = self.to_worker.lock().ok().and_then(|guard| guard.clone());
        match sender {
            Some(tx) => {
                if tx.send(wire).is_err() {
                    tracing::warn!(target: "wirecall::backend", "Worker thread gone, envelope dropped");
                }
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

        // Advisory abort so running work winds down at its next boundary,
        // then close the inbox; the thread drains and exits.
        self.env.cancel_all();
        if let Ok(mut guard) = self.to_worker.lock() {
            guard.take();
        }

        let join = self.join.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = join {
            let _ = tokio::task::spawn_blocking(move || {
                if handle.join().is_err() {
                    tracing::error!(target: "wirecall::backend", "Worker thread panicked outside a slice");
                }
            })
            .await;
        }
        tracing::debug!(target: "wirecall::backend", "Real backend shut down");
    }

    fn mode(&self) -> BackendMode {
        BackendMode::Real
    }
}

fn worker_main(
    program: Arc<dyn TaskProgram>,
    mut inbox: mpsc::UnboundedReceiver<Value>,
    env: Arc<ExecEnv>,
) {
    let (ops, poisoned) = match initialize(&*program, &env) {
        Ok(ops) => (ops, None),
        Err(failure) => (OperationTable::new(), Some(failure)),
    };

    let mut backlog: VecDeque<Envelope> = VecDeque::new();

    loop {
        let envelope = match backlog.pop_front() {
            Some(envelope) => envelope,
            None => match inbox.blocking_recv() {
                Some(wire) => match Envelope::decode(&wire) {
                    Some(envelope) => envelope,
                    None => {
                        tracing::debug!(target: "wirecall::backend", "Dropping malformed envelope");
                        continue;
                    }
                },
                None => break,
            },
        };

        if envelope.is_cancel() {
            env.cancel(&envelope.id);
            continue;
        }

        if let Some(ref failure) = poisoned {
            env.send_init_error(&envelope.id, failure);
            continue;
        }

        execute(&env, &ops, envelope, &mut inbox, &mut backlog);
    }

    tracing::debug!(target: "wirecall::backend", "Worker thread exiting");
}

/// Run one operation to its terminal envelope. The control queue is
/// drained at every slice boundary; a slice already executing is never
/// interrupted.
fn execute(
    env: &Arc<ExecEnv>,
    ops: &OperationTable,
    envelope: Envelope,
    inbox: &mut mpsc::UnboundedReceiver<Value>,
    backlog: &mut VecDeque<Envelope>,
) {
    let Envelope { id, action, payload } = envelope;

    let Some(op) = ops.get(&action) else {
        env.send_error(
            &id,
            ErrorPayload::execution(format!("unknown operation `{action}`")),
        );
        return;
    };

    let ctx = env.begin_call(&id);
    let mut run = match begin_run(op, payload, &ctx) {
        Ok(run) => run,
        Err(outcome) => {
            emit_terminal(env, &ctx, outcome);
            return;
        }
    };

    loop {
        match run_slice(&mut run, &ctx, SLICE_BUDGET) {
            SliceOutcome::Yielded => {
                ctx.flush_deferred();
                drain_control(env, inbox, backlog);
            }
            outcome => {
                emit_terminal(env, &ctx, outcome);
                return;
            }
        }
    }
}

/// Pull everything already queued without blocking: cancels take effect
/// immediately, other requests keep their arrival order in the backlog.
/// A cancel aimed at a request still waiting in the backlog settles it
/// right here — it would otherwise start after the cancel was forgotten.
fn drain_control(
    env: &Arc<ExecEnv>,
    inbox: &mut mpsc::UnboundedReceiver<Value>,
    backlog: &mut VecDeque<Envelope>,
) {
    loop {
        match inbox.try_recv() {
            Ok(wire) => match Envelope::decode(&wire) {
                Some(envelope) if envelope.is_cancel() => {
                    if !env.cancel(&envelope.id)
                        && let Some(pos) = backlog.iter().position(|e| e.id == envelope.id)
                    {
                        let _ = backlog.remove(pos);
                        env.send_error(&envelope.id, ErrorPayload::cancelled());
                    }
                }
                Some(envelope) => backlog.push_back(envelope),
                None => {
                    tracing::debug!(target: "wirecall::backend", "Dropping malformed envelope");
                }
            },
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::program::{OpError, ProgramError, TaskScope};
    use crate::protocol::ResponseKind;

    struct EchoProgram;

    impl TaskProgram for EchoProgram {
        fn register(&self, scope: &mut TaskScope) -> Result<(), ProgramError> {
            scope.operation_fn("echo", |payload, _ctx| Ok(payload))?;
            scope.operation_fn("fail", |_payload, _ctx| {
                Err(OpError::msg("requested failure"))
            })?;
            Ok(())
        }
    }

    struct BrokenProgram;

    impl TaskProgram for BrokenProgram {
        fn register(&self, _scope: &mut TaskScope) -> Result<(), ProgramError> {
            Err(ProgramError::init("operation table unavailable"))
        }
    }

    async fn next_envelope(rx: &mut mpsc::UnboundedReceiver<Value>) -> Envelope {
        let wire = rx.recv().await.expect("worker closed its outbound stream");
        Envelope::decode(&wire).expect("worker emitted malformed envelope")
    }

    #[tokio::test]
    async fn requests_settle_in_order() {
        let (backend, mut rx) = RealBackend::spawn(Arc::new(EchoProgram)).unwrap();

        backend.deliver(Envelope::new("1", "echo", json!("a")).encode());
        backend.deliver(Envelope::new("2", "echo", json!("b")).encode());

        let first = next_envelope(&mut rx).await;
        assert_eq!((first.id.as_str(), &first.payload), ("1", &json!("a")));
        let second = next_envelope(&mut rx).await;
        assert_eq!((second.id.as_str(), &second.payload), ("2", &json!("b")));

        backend.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_operation_settles_with_error() {
        let (backend, mut rx) = RealBackend::spawn(Arc::new(EchoProgram)).unwrap();

        backend.deliver(Envelope::new("1", "missing", json!(null)).encode());
        let response = next_envelope(&mut rx).await;
        assert_eq!(response.kind(), Some(ResponseKind::Error));
        assert!(response.payload["message"]
            .as_str()
            .unwrap()
            .contains("unknown operation"));

        backend.shutdown().await;
    }

    #[tokio::test]
    async fn failed_registration_poisons_every_request() {
        let (backend, mut rx) = RealBackend::spawn(Arc::new(BrokenProgram)).unwrap();

        backend.deliver(Envelope::new("1", "echo", json!(null)).encode());
        backend.deliver(Envelope::new("2", "echo", json!(null)).encode());

        for expected_id in ["1", "2"] {
            let response = next_envelope(&mut rx).await;
            assert_eq!(response.id, expected_id);
            assert_eq!(response.kind(), Some(ResponseKind::InitError));
            assert!(response.payload["message"]
                .as_str()
                .unwrap()
                .contains("operation table unavailable"));
        }

        backend.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_rejects_delivery() {
        let (backend, _rx) = RealBackend::spawn(Arc::new(EchoProgram)).unwrap();

        backend.shutdown().await;
        backend.shutdown().await;

        // Dropped with a warning, never delivered to the dead thread.
        backend.deliver(Envelope::new("9", "echo", json!(null)).encode());
    }
}
