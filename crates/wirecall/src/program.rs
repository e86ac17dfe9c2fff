//! Task programs: name-based operation registration.
//!
//! Operation logic never crosses the isolation boundary — a program
//! registers named operations into a [`TaskScope`] at load time, and only
//! the name and a plain-data payload travel per call. Long-running
//! operations are explicit state machines ([`OperationRun`]) advanced by
//! the scheduler one bounded step at a time, with exactly one suspension
//! point between slices.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::BackendMode;
use crate::codec::CodecError;
use crate::console::ConsoleSink;
use crate::error::ConfigError;
use crate::protocol::{Envelope, ResponseKind, is_reserved_action};

/// A loadable backend program: registers its named operations once, at
/// backend initialization.
pub trait TaskProgram: Send + Sync + 'static {
    fn register(&self, scope: &mut TaskScope) -> Result<(), ProgramError>;
}

impl std::fmt::Debug for dyn TaskProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskProgram")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("`{0}` is a reserved action name")]
    ReservedName(String),

    #[error("operation `{0}` is already registered")]
    DuplicateOperation(String),

    #[error("program failed to initialize: {0}")]
    Init(String),
}

impl ProgramError {
    pub fn init(message: impl Into<String>) -> Self {
        Self::Init(message.into())
    }
}

/// Operation failures surfaced to the controller as terminal `error`
/// envelopes.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error("{0}")]
    Message(String),

    #[error("invalid payload: {0}")]
    Payload(#[from] CodecError),

    #[error("blocking is not available on the emulated backend")]
    BlockingUnavailable,
}

impl OpError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Outcome of one scheduler step.
pub enum Step {
    /// More work remains; the scheduler decides when the next step runs.
    Continue,
    /// The operation finished with this result payload.
    Complete(Value),
}

/// A named operation. `begin` validates the payload and builds the run
/// state; the scheduler then drives [`OperationRun::step`] to completion.
pub trait Operation: Send + Sync + 'static {
    fn begin(&self, payload: Value, ctx: &OpContext) -> Result<Box<dyn OperationRun>, OpError>;
}

impl std::fmt::Debug for dyn Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Operation")
    }
}

/// Resumable run state for one call. One `step` does a bounded amount of
/// work; cost per step should be small enough that the slice budget, not
/// the step, bounds latency.
pub trait OperationRun: Send {
    fn step(&mut self, ctx: &OpContext) -> Result<Step, OpError>;
}

struct FnOperation<F> {
    f: Arc<F>,
}

struct FnRun<F> {
    f: Arc<F>,
    payload: Option<Value>,
}

impl<F> Operation for FnOperation<F>
where
    F: Fn(Value, &OpContext) -> Result<Value, OpError> + Send + Sync + 'static,
{
    fn begin(&self, payload: Value, _ctx: &OpContext) -> Result<Box<dyn OperationRun>, OpError> {
        Ok(Box::new(FnRun {
            f: Arc::clone(&self.f),
            payload: Some(payload),
        }))
    }
}

impl<F> OperationRun for FnRun<F>
where
    F: Fn(Value, &OpContext) -> Result<Value, OpError> + Send + Sync + 'static,
{
    fn step(&mut self, ctx: &OpContext) -> Result<Step, OpError> {
        let payload = self.payload.take().unwrap_or(Value::Null);
        Ok(Step::Complete((self.f)(payload, ctx)?))
    }
}

/// Execution scope a backend hands to the program during registration.
pub struct TaskScope {
    mode: BackendMode,
    console: ConsoleSink,
    ops: HashMap<String, Arc<dyn Operation>>,
}

impl TaskScope {
    pub(crate) fn new(mode: BackendMode, console: ConsoleSink) -> Self {
        Self {
            mode,
            console,
            ops: HashMap::new(),
        }
    }

    /// Register a stepwise operation under a name. Reserved names and
    /// duplicates are rejected.
    pub fn operation(
        &mut self,
        name: &str,
        op: impl Operation,
    ) -> Result<(), ProgramError> {
        self.insert(name, Arc::new(op))
    }

    /// Register a one-shot operation from a closure. The closure runs as a
    /// single step, so it should finish quickly; long work belongs in a
    /// stepwise [`Operation`].
    pub fn operation_fn<F>(&mut self, name: &str, f: F) -> Result<(), ProgramError>
    where
        F: Fn(Value, &OpContext) -> Result<Value, OpError> + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(FnOperation { f: Arc::new(f) }))
    }

    fn insert(&mut self, name: &str, op: Arc<dyn Operation>) -> Result<(), ProgramError> {
        if is_reserved_action(name) {
            return Err(ProgramError::ReservedName(name.to_string()));
        }
        if self.ops.contains_key(name) {
            return Err(ProgramError::DuplicateOperation(name.to_string()));
        }
        self.ops.insert(name.to_string(), op);
        Ok(())
    }

    /// The console conduit attached to this backend. Always the same sink
    /// per backend instance — registration cannot wrap it twice.
    pub fn console(&self) -> ConsoleSink {
        self.console.clone()
    }

    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    pub(crate) fn into_operations(self) -> HashMap<String, Arc<dyn Operation>> {
        self.ops
    }
}

/// Per-call execution context handed into operation code.
pub struct OpContext {
    id: String,
    mode: BackendMode,
    abort: CancellationToken,
    outbound: mpsc::UnboundedSender<Value>,
    deferred: Mutex<Vec<Value>>,
    console: ConsoleSink,
}

impl OpContext {
    pub(crate) fn new(
        id: String,
        mode: BackendMode,
        abort: CancellationToken,
        outbound: mpsc::UnboundedSender<Value>,
        console: &ConsoleSink,
    ) -> Self {
        let console = console.scoped(&id);
        Self {
            id,
            mode,
            abort,
            outbound,
            deferred: Mutex::new(Vec::new()),
            console,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    /// Advisory cancellation flag. Checked by the scheduler at slice
    /// boundaries; operations doing expensive single steps may also check
    /// it themselves.
    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Emit one live progress notification, delivered immediately and in
    /// send order.
    pub fn progress(&self, value: Value) {
        let envelope = Envelope::response(self.id.clone(), ResponseKind::ProgressLive, value);
        if self.outbound.send(envelope.encode()).is_err() {
            tracing::debug!(target: "wirecall::progress", call_id = %self.id, "Progress channel closed");
        }
    }

    /// Queue a deferred progress notification. Batches flush at slice
    /// boundaries and with the terminal envelope, order preserved.
    pub fn progress_deferred(&self, value: Value) {
        if let Ok(mut buffer) = self.deferred.lock() {
            buffer.push(value);
        }
    }

    pub(crate) fn flush_deferred(&self) {
        let batch = match self.deferred.lock() {
            Ok(mut buffer) if !buffer.is_empty() => std::mem::take(&mut *buffer),
            _ => return,
        };
        let envelope = Envelope::response(
            self.id.clone(),
            ResponseKind::ProgressDeferred,
            Value::Array(batch),
        );
        if self.outbound.send(envelope.encode()).is_err() {
            tracing::debug!(target: "wirecall::progress", call_id = %self.id, "Progress channel closed");
        }
    }

    pub fn console(&self) -> &ConsoleSink {
        &self.console
    }

    /// Guard for work that must block the current thread (file reads,
    /// synchronous waits). Permitted on the real backend's dedicated
    /// thread; fails loudly on the emulated backend, which shares the
    /// controller's runtime and must never stall it.
    pub fn blocking_region(&self) -> Result<(), OpError> {
        match self.mode {
            BackendMode::Real => Ok(()),
            BackendMode::Emulated => Err(OpError::BlockingUnavailable),
        }
    }
}

/// Process-wide table of named programs, the load-by-reference analog.
pub struct ProgramRegistry {
    programs: DashMap<String, Arc<dyn TaskProgram>>,
}

impl ProgramRegistry {
    pub fn global() -> &'static ProgramRegistry {
        static GLOBAL: OnceLock<ProgramRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| ProgramRegistry {
            programs: DashMap::new(),
        })
    }

    /// Install (or replace) a program under a name.
    pub fn install(&self, name: &str, program: impl TaskProgram) {
        self.programs.insert(name.to_string(), Arc::new(program));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskProgram>> {
        self.programs.get(name).map(|entry| Arc::clone(&entry))
    }
}

/// Where the backend program comes from. Exactly one form must be
/// supplied; anything else is a configuration error raised before any
/// backend is constructed.
#[derive(Clone, Default)]
pub struct ProgramSource {
    /// Name looked up in the process-wide [`ProgramRegistry`].
    pub registered: Option<String>,
    /// A program value supplied directly.
    pub inline: Option<Arc<dyn TaskProgram>>,
    /// A constructor invoked at backend creation.
    pub factory: Option<Arc<dyn Fn() -> Arc<dyn TaskProgram> + Send + Sync>>,
}

impl ProgramSource {
    pub fn registered(name: impl Into<String>) -> Self {
        Self {
            registered: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn inline(program: impl TaskProgram) -> Self {
        Self {
            inline: Some(Arc::new(program)),
            ..Self::default()
        }
    }

    pub fn factory<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn TaskProgram> + Send + Sync + 'static,
    {
        Self {
            factory: Some(Arc::new(factory)),
            ..Self::default()
        }
    }

    pub(crate) fn resolve(&self) -> Result<Arc<dyn TaskProgram>, ConfigError> {
        let supplied = [
            self.registered.is_some(),
            self.inline.is_some(),
            self.factory.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        match supplied {
            0 => Err(ConfigError::MissingSource),
            1 => {
                if let Some(ref name) = self.registered {
                    ProgramRegistry::global()
                        .get(name)
                        .ok_or_else(|| ConfigError::UnknownProgram(name.clone()))
                } else if let Some(ref program) = self.inline {
                    Ok(Arc::clone(program))
                } else if let Some(ref factory) = self.factory {
                    Ok(factory())
                } else {
                    Err(ConfigError::MissingSource)
                }
            }
            n => Err(ConfigError::AmbiguousSource(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn test_scope() -> TaskScope {
        let (tx, _rx) = mpsc::unbounded_channel();
        TaskScope::new(BackendMode::Emulated, ConsoleSink::new(tx))
    }

    fn test_ctx() -> (OpContext, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let console = ConsoleSink::new(tx.clone());
        let ctx = OpContext::new(
            "9".to_string(),
            BackendMode::Emulated,
            CancellationToken::new(),
            tx,
            &console,
        );
        (ctx, rx)
    }

    struct NoopProgram;

    impl TaskProgram for NoopProgram {
        fn register(&self, _scope: &mut TaskScope) -> Result<(), ProgramError> {
            Ok(())
        }
    }

    #[test]
    fn reserved_names_are_rejected() {
        let mut scope = test_scope();
        let err = scope
            .operation_fn("cancel", |payload, _ctx| Ok(payload))
            .unwrap_err();
        assert!(matches!(err, ProgramError::ReservedName(_)));

        let err = scope
            .operation_fn("result", |payload, _ctx| Ok(payload))
            .unwrap_err();
        assert!(matches!(err, ProgramError::ReservedName(_)));
    }

    #[test]
    fn duplicate_operations_are_rejected() {
        let mut scope = test_scope();
        scope.operation_fn("echo", |payload, _ctx| Ok(payload)).unwrap();
        let err = scope
            .operation_fn("echo", |payload, _ctx| Ok(payload))
            .unwrap_err();
        assert!(matches!(err, ProgramError::DuplicateOperation(_)));
    }

    #[tokio::test]
    async fn fn_operation_completes_in_one_step() {
        let mut scope = test_scope();
        scope
            .operation_fn("double", |payload, _ctx| {
                let n = payload["n"].as_i64().unwrap_or(0);
                Ok(json!(n * 2))
            })
            .unwrap();

        let ops = scope.into_operations();
        let (ctx, _rx) = test_ctx();
        let mut run = ops["double"].begin(json!({"n": 21}), &ctx).unwrap();
        match run.step(&ctx).unwrap() {
            Step::Complete(value) => assert_eq!(value, json!(42)),
            Step::Continue => panic!("one-shot operation did not complete"),
        }
    }

    #[tokio::test]
    async fn deferred_progress_batches_in_order() {
        let (ctx, mut rx) = test_ctx();
        ctx.progress_deferred(json!(1));
        ctx.progress_deferred(json!(2));
        ctx.flush_deferred();

        let envelope = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(envelope.kind(), Some(ResponseKind::ProgressDeferred));
        assert_eq!(envelope.payload, json!([1, 2]));

        // Nothing buffered, nothing sent.
        ctx.flush_deferred();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn live_progress_is_immediate() {
        let (ctx, mut rx) = test_ctx();
        ctx.progress(json!({"step": 1}));

        let envelope = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(envelope.kind(), Some(ResponseKind::ProgressLive));
        assert_eq!(envelope.id, "9");
    }

    #[test]
    fn blocking_region_fails_loudly_when_emulated() {
        let (ctx, _rx) = test_ctx();
        assert!(matches!(
            ctx.blocking_region(),
            Err(OpError::BlockingUnavailable)
        ));
    }

    #[test]
    fn source_requires_exactly_one_form() {
        let err = ProgramSource::default().resolve().unwrap_err();
        assert!(matches!(err, ConfigError::MissingSource));

        let mut ambiguous = ProgramSource::inline(NoopProgram);
        ambiguous.registered = Some("also-named".into());
        let err = ambiguous.resolve().unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousSource(2)));
    }

    #[test]
    fn source_resolves_registered_programs() {
        ProgramRegistry::global().install("noop-test-program", NoopProgram);
        let source = ProgramSource::registered("noop-test-program");
        assert!(source.resolve().is_ok());

        let missing = ProgramSource::registered("never-installed");
        assert!(matches!(
            missing.resolve(),
            Err(ConfigError::UnknownProgram(_))
        ));
    }

    #[test]
    fn source_resolves_factories() {
        let source = ProgramSource::factory(|| Arc::new(NoopProgram) as Arc<dyn TaskProgram>);
        assert!(source.resolve().is_ok());
    }
}
