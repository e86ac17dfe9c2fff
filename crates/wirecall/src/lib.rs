//! wirecall: correlation-based RPC over real and emulated worker backends.
//!
//! A controller dispatches named operations to a backend program and
//! awaits correlated results, with live and deferred progress channels,
//! cooperative cancellation, per-call timeouts, and console forwarding.
//! The backend is either a dedicated worker thread or a cooperative
//! time-sliced emulation sharing the controller's runtime — behaviorally
//! indistinguishable through the public surface.

mod backend;
mod call;
mod codec;
mod console;
mod endpoint;
mod error;
mod program;
mod protocol;
mod registry;
mod service;

pub use backend::BackendMode;
pub use call::{AbortHandle, CallHandle};
pub use codec::{CodecError, deep_clone, from_payload, to_payload};
pub use console::{ConsoleLevel, ConsoleMessage, ConsoleSink};
pub use endpoint::{Backend, Endpoint, EndpointError};
pub use error::{CallError, ConfigError, RpcError};
pub use program::{
    OpContext, OpError, Operation, OperationRun, ProgramError, ProgramRegistry, ProgramSource,
    Step, TaskProgram, TaskScope,
};
pub use protocol::{CANCEL_ACTION, Envelope, ErrorPayload, ResponseKind, is_reserved_action};
pub use registry::{CallOutcome, CorrelationRegistry, RegisterError};
pub use service::{ConsoleFn, ProgressFn, RpcHandle, RpcOptions, create};
