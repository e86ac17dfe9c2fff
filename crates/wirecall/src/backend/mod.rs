//! Backend execution machinery shared by the real and emulated variants.
//!
//! Both backends speak the same envelope protocol and drive operations
//! through the same slice runner; they differ only in where the work runs
//! (dedicated thread vs. the controller's own runtime) and in how control
//! is yielded between slices.

mod emulated;
mod real;

pub(crate) use emulated::EmulatedBackend;
pub(crate) use real::RealBackend;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::console::ConsoleSink;
use crate::program::{OpContext, Operation, OperationRun, Step, TaskProgram, TaskScope};
use crate::protocol::{Envelope, ErrorPayload, ResponseKind};

/// Which execution regime a backend provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// A dedicated thread: genuine parallelism, blocking permitted.
    Real,
    /// Cooperative time slices on the controller's runtime.
    Emulated,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Emulated => "emulated",
        }
    }
}

/// Wall-clock budget for one slice of operation work. Elapsed time, not
/// iteration count, so variable per-step cost cannot starve the host.
pub(crate) const SLICE_BUDGET: Duration = Duration::from_millis(20);

/// How many inner steps may run between abort checks inside a slice.
pub(crate) const ABORT_CHECK_INTERVAL: u32 = 64;

/// Shared per-backend execution state: the outbound channel, the table of
/// running calls, and the console conduit (built once per backend, so the
/// logging path can never be wrapped twice).
pub(crate) struct ExecEnv {
    mode: BackendMode,
    outbound: mpsc::UnboundedSender<Value>,
    active: DashMap<String, CancellationToken>,
    console: ConsoleSink,
}

impl ExecEnv {
    pub(crate) fn new(mode: BackendMode, outbound: mpsc::UnboundedSender<Value>) -> Arc<Self> {
        let console = ConsoleSink::new(outbound.clone());
        Arc::new(Self {
            mode,
            outbound,
            active: DashMap::new(),
            console,
        })
    }

    pub(crate) fn mode(&self) -> BackendMode {
        self.mode
    }

    pub(crate) fn console(&self) -> &ConsoleSink {
        &self.console
    }

    /// Build the per-call context and track its abort token.
    pub(crate) fn begin_call(&self, id: &str) -> OpContext {
        let token = CancellationToken::new();
        self.active.insert(id.to_string(), token.clone());
        OpContext::new(
            id.to_string(),
            self.mode,
            token,
            self.outbound.clone(),
            &self.console,
        )
    }

    /// Drop the abort token once the call's terminal envelope is out.
    pub(crate) fn finish_call(&self, id: &str) {
        self.active.remove(id);
    }

    /// Observe a `cancel` envelope. Returns whether a running call was
    /// flagged; unknown ids are already settled calls (or foreign traffic).
    pub(crate) fn cancel(&self, id: &str) -> bool {
        match self.active.get(id) {
            Some(token) => {
                tracing::debug!(target: "wirecall::backend", call_id = %id, "Cancel observed");
                token.cancel();
                true
            }
            None => {
                tracing::debug!(target: "wirecall::backend", call_id = %id, "Cancel for inactive call, ignoring");
                false
            }
        }
    }

    /// Advisory abort for every running call; used at shutdown so running
    /// work winds down at its next slice boundary.
    pub(crate) fn cancel_all(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
    }

    pub(crate) fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope.encode()).is_err() {
            tracing::debug!(target: "wirecall::backend", "Outbound channel closed, envelope dropped");
        }
    }

    pub(crate) fn send_result(&self, id: &str, value: Value) {
        self.send(Envelope::response(id, ResponseKind::Result, value));
    }

    pub(crate) fn send_error(&self, id: &str, payload: ErrorPayload) {
        self.send(Envelope::response(id, ResponseKind::Error, payload.to_value()));
    }

    pub(crate) fn send_init_error(&self, id: &str, failure: &InitFailure) {
        self.send(Envelope::response(
            id,
            ResponseKind::InitError,
            ErrorPayload::init(failure.message.clone(), failure.detail.clone()).to_value(),
        ));
    }
}

/// Why program initialization failed. Stored for the backend's lifetime:
/// every request against a poisoned backend gets a definite `init-error`
/// settlement instead of a hang.
pub(crate) struct InitFailure {
    pub(crate) message: String,
    pub(crate) detail: Option<String>,
}

pub(crate) type OperationTable = std::collections::HashMap<String, Arc<dyn Operation>>;

/// Run program registration, capturing both error returns and panics.
pub(crate) fn initialize(
    program: &dyn TaskProgram,
    env: &ExecEnv,
) -> Result<OperationTable, InitFailure> {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut scope = TaskScope::new(env.mode(), env.console().clone());
        program.register(&mut scope).map(|_| scope.into_operations())
    }));

    match result {
        Ok(Ok(ops)) => Ok(ops),
        Ok(Err(e)) => {
            tracing::warn!(target: "wirecall::backend", error = %e, "Program registration failed");
            Err(InitFailure {
                message: e.to_string(),
                detail: None,
            })
        }
        Err(panic) => {
            let detail = panic_message(panic);
            tracing::warn!(target: "wirecall::backend", %detail, "Program registration panicked");
            Err(InitFailure {
                message: "program initialization panicked".to_string(),
                detail: Some(detail),
            })
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "operation panicked".to_string()
    }
}

/// What one slice of work produced.
pub(crate) enum SliceOutcome {
    /// Budget exhausted with work remaining.
    Yielded,
    Complete(Value),
    Failed(String),
    Cancelled,
}

/// Begin a run, capturing errors and panics as terminal outcomes.
pub(crate) fn begin_run(
    op: &Arc<dyn Operation>,
    payload: Value,
    ctx: &OpContext,
) -> Result<Box<dyn OperationRun>, SliceOutcome> {
    match catch_unwind(AssertUnwindSafe(|| op.begin(payload, ctx))) {
        Ok(Ok(run)) => Ok(run),
        Ok(Err(e)) => Err(SliceOutcome::Failed(e.to_string())),
        Err(panic) => Err(SliceOutcome::Failed(panic_message(panic))),
    }
}

/// Drive one slice: step until the wall-clock budget expires, a terminal
/// outcome arrives, or the abort flag is observed. The abort check runs at
/// the slice start and every [`ABORT_CHECK_INTERVAL`] steps, bounding both
/// its cost and the cancellation latency. Panics in operation code are
/// caught here and never escape to the host.
pub(crate) fn run_slice(
    run: &mut Box<dyn OperationRun>,
    ctx: &OpContext,
    budget: Duration,
) -> SliceOutcome {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let slice_start = Instant::now();
        let mut steps: u32 = 0;

        loop {
            if steps % ABORT_CHECK_INTERVAL == 0 && ctx.is_aborted() {
                return SliceOutcome::Cancelled;
            }

            match run.step(ctx) {
                Ok(Step::Continue) => {}
                Ok(Step::Complete(value)) => return SliceOutcome::Complete(value),
                Err(e) => return SliceOutcome::Failed(e.to_string()),
            }

            steps = steps.wrapping_add(1);
            if slice_start.elapsed() >= budget {
                return SliceOutcome::Yielded;
            }
        }
    }));

    match result {
        Ok(outcome) => outcome,
        Err(panic) => SliceOutcome::Failed(panic_message(panic)),
    }
}

/// Emit the terminal envelope for a finished run and release its abort
/// token. Deferred progress flushes strictly before the terminal.
pub(crate) fn emit_terminal(env: &ExecEnv, ctx: &OpContext, outcome: SliceOutcome) {
    ctx.flush_deferred();
    let id = ctx.call_id();
    match outcome {
        SliceOutcome::Complete(value) => env.send_result(id, value),
        SliceOutcome::Failed(message) => env.send_error(id, ErrorPayload::execution(message)),
        SliceOutcome::Cancelled => env.send_error(id, ErrorPayload::cancelled()),
        SliceOutcome::Yielded => {
            // Not a terminal; callers only pass finished outcomes.
            tracing::error!(target: "wirecall::backend", call_id = %id, "Yielded outcome is not terminal");
        }
    }
    env.finish_call(id);
}
