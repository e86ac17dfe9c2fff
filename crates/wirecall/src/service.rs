//! RPC façade: handle creation, dispatch routing, and termination.
//!
//! `create` resolves the program source, stands up the chosen backend
//! behind an [`Endpoint`], and installs the single inbound dispatcher that
//! settles calls and routes progress and console traffic. The handle owns
//! the correlation registry; `terminate` drains it before the backend goes
//! away, so every outstanding future settles promptly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;

use crate::backend::{BackendMode, EmulatedBackend, RealBackend};
use crate::call::{AbortHandle, CallHandle};
use crate::console::{ConsoleLevel, ConsoleMessage};
use crate::endpoint::Endpoint;
use crate::error::{CallError, ConfigError, RpcError};
use crate::program::ProgramSource;
use crate::protocol::{Envelope, ErrorPayload, ResponseKind, is_reserved_action};
use crate::registry::CorrelationRegistry;

/// Progress callback: call id and the emitted payload.
pub type ProgressFn = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// Console callback: severity and message line.
pub type ConsoleFn = Arc<dyn Fn(ConsoleLevel, &str) + Send + Sync>;

#[derive(Clone)]
pub struct RpcOptions {
    /// Dedicated worker thread (default) or the cooperative emulation.
    pub use_real_backend: bool,
    /// Per-call settlement window.
    pub timeout: Duration,
    pub on_live_progress: Option<ProgressFn>,
    pub on_deferred_progress: Option<ProgressFn>,
    pub on_console: Option<ConsoleFn>,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            use_real_backend: true,
            timeout: Duration::from_secs(30),
            on_live_progress: None,
            on_deferred_progress: None,
            on_console: None,
        }
    }
}

impl RpcOptions {
    pub fn with_real_backend(mut self, use_real_backend: bool) -> Self {
        self.use_real_backend = use_real_backend;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_live_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.on_live_progress = Some(Arc::new(f));
        self
    }

    pub fn with_deferred_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.on_deferred_progress = Some(Arc::new(f));
        self
    }

    pub fn with_console<F>(mut self, f: F) -> Self
    where
        F: Fn(ConsoleLevel, &str) + Send + Sync + 'static,
    {
        self.on_console = Some(Arc::new(f));
        self
    }
}

/// Create a handle over a fresh backend.
///
/// Configuration problems (no source, more than one source, unknown
/// program name) fail here, synchronously, before any backend exists.
/// Must be called from within a Tokio runtime.
pub fn create(source: &ProgramSource, options: RpcOptions) -> Result<RpcHandle, ConfigError> {
    let program = source.resolve()?;

    let (backend, inbound): (Arc<dyn crate::endpoint::Backend>, _) = if options.use_real_backend {
        let (backend, inbound) = RealBackend::spawn(program)?;
        (backend, inbound)
    } else {
        let (backend, inbound) = EmulatedBackend::spawn(program);
        (backend, inbound)
    };

    let endpoint = Endpoint::new(backend, inbound);
    let registry = CorrelationRegistry::new();

    let dispatcher_registry = Arc::clone(&registry);
    let on_live = options.on_live_progress.clone();
    let on_deferred = options.on_deferred_progress.clone();
    let on_console = options.on_console.clone();
    let subscribed = endpoint.subscribe(move |envelope| {
        dispatch(&dispatcher_registry, &on_live, &on_deferred, &on_console, envelope);
    });
    if subscribed.is_err() {
        // A fresh endpoint always accepts its first dispatcher.
        tracing::error!(target: "wirecall::endpoint", "Dispatcher installation failed");
    }

    tracing::debug!(
        target: "wirecall::endpoint",
        mode = endpoint.mode().as_str(),
        timeout_ms = options.timeout.as_millis() as u64,
        "Handle created"
    );

    Ok(RpcHandle {
        endpoint,
        registry,
        timeout: options.timeout,
        terminated: AtomicBool::new(false),
    })
}

/// Route one inbound envelope: settle terminals, fan out progress and
/// console lines, drop everything else. No registry lock is held while a
/// user callback runs, so callbacks may issue calls reentrantly.
fn dispatch(
    registry: &Arc<CorrelationRegistry>,
    on_live: &Option<ProgressFn>,
    on_deferred: &Option<ProgressFn>,
    on_console: &Option<ConsoleFn>,
    envelope: Envelope,
) {
    let Some(kind) = envelope.kind() else {
        tracing::debug!(
            target: "wirecall::endpoint",
            action = %envelope.action,
            "Dropping envelope with unrecognized kind"
        );
        return;
    };

    match kind {
        ResponseKind::Result => {
            if !registry.settle(&envelope.id, Ok(envelope.payload)) {
                tracing::debug!(target: "wirecall::call", call_id = %envelope.id, "Late result, already settled");
            }
        }
        ResponseKind::Error | ResponseKind::InitError => {
            let payload = ErrorPayload::from_value(&envelope.payload);
            let error = RpcError::from_terminal(kind, &payload);
            if !registry.settle(&envelope.id, Err(error)) {
                tracing::debug!(target: "wirecall::call", call_id = %envelope.id, "Late error, already settled");
            }
        }
        ResponseKind::ProgressLive => {
            if let Some(callback) = on_live {
                callback(&envelope.id, &envelope.payload);
            }
        }
        ResponseKind::ProgressDeferred => {
            if let Some(callback) = on_deferred {
                match envelope.payload {
                    Value::Array(batch) => {
                        for item in &batch {
                            callback(&envelope.id, item);
                        }
                    }
                    other => callback(&envelope.id, &other),
                }
            }
        }
        ResponseKind::Console => {
            if let Some(callback) = on_console {
                match serde_json::from_value::<ConsoleMessage>(envelope.payload) {
                    Ok(line) => callback(line.level, &line.message),
                    Err(_) => {
                        tracing::debug!(target: "wirecall::console", call_id = %envelope.id, "Dropping malformed console payload");
                    }
                }
            } else {
                tracing::debug!(target: "wirecall::console", call_id = %envelope.id, "Console line with no subscriber");
            }
        }
    }
}

/// Public surface over one backend: `call` and `terminate`.
pub struct RpcHandle {
    endpoint: Arc<Endpoint>,
    registry: Arc<CorrelationRegistry>,
    timeout: Duration,
    terminated: AtomicBool,
}

impl std::fmt::Debug for RpcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcHandle")
            .field("timeout", &self.timeout)
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl RpcHandle {
    /// Dispatch a named operation. Fails synchronously — without
    /// contacting the backend — once the handle is terminated, and for
    /// reserved action names.
    pub fn call(&self, action: &str, payload: Value) -> Result<CallHandle, CallError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(CallError::Terminated);
        }
        if is_reserved_action(action) {
            return Err(CallError::ReservedAction(action.to_string()));
        }

        let (id, rx) = self.registry.register_next(self.timeout);
        let abort = AbortHandle::new(id.clone(), Arc::clone(&self.endpoint));

        let envelope = Envelope::new(id.clone(), action, payload);
        if self.endpoint.post(&envelope).is_err() {
            // The backend went away between the terminated check and the
            // post; settle immediately rather than letting the timer fire.
            self.registry.settle(&id, Err(RpcError::Terminated));
        }

        Ok(CallHandle::new(id, rx, abort))
    }

    /// Reject every pending call with a termination error, then release
    /// backend resources. Idempotent; later `call`s fail synchronously.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(
            target: "wirecall::endpoint",
            pending = self.registry.pending_count(),
            "Terminating handle"
        );
        self.registry.drain_all();
        self.endpoint.shutdown().await;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn pending_calls(&self) -> usize {
        self.registry.pending_count()
    }

    pub fn mode(&self) -> BackendMode {
        self.endpoint.mode()
    }
}
